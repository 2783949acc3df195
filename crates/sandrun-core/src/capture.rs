//! Output capture: splits a container's multiplexed log stream into separate
//! stdout and stderr buffers.
//!
//! Capture writes into a [`CapturedOutput`] owned by the caller, so whatever
//! arrived before the capture was cancelled (deadline, caller cancellation)
//! is still there afterwards. Ordering within a channel is preserved; the
//! interleaving between channels is not recorded.

use futures_util::stream::StreamExt;

use crate::errors::RuntimeError;
use crate::runtime::{LogChunk, LogStream};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Set once either channel hit the ceiling and bytes were dropped.
    pub truncated: bool,
}

impl CapturedOutput {
    fn append(&mut self, chunk: LogChunk, limit: usize) {
        let (buffer, data) = match chunk {
            LogChunk::Stdout(data) => (&mut self.stdout, data),
            LogChunk::Stderr(data) => (&mut self.stderr, data),
        };

        let room = limit.saturating_sub(buffer.len());
        if data.len() > room {
            buffer.extend_from_slice(&data[..room]);
            self.truncated = true;
        } else {
            buffer.extend_from_slice(&data);
        }
    }
}

/// How a capture ended when it was allowed to run to the end.
#[derive(Debug)]
pub enum CaptureEnd {
    /// The stream closed: the program exited.
    Exhausted,
    /// The stream reported an error; the bytes received before it are kept.
    Failed(RuntimeError),
}

#[derive(Debug, Clone, Copy)]
pub struct OutputCapture {
    max_bytes_per_channel: usize,
}

impl OutputCapture {
    pub fn new(max_bytes_per_channel: usize) -> Self {
        Self {
            max_bytes_per_channel,
        }
    }

    /// Consumes `stream` into `output` until the stream ends or fails.
    ///
    /// Past the per-channel ceiling the stream keeps being drained so the
    /// program never blocks on a full pipe; the excess is discarded.
    /// Cancel-safe: dropping the returned future mid-way loses no captured bytes.
    pub async fn drain(
        &self,
        container_id: &str,
        stream: &mut LogStream,
        output: &mut CapturedOutput,
    ) -> CaptureEnd {
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    let was_truncated = output.truncated;
                    output.append(chunk, self.max_bytes_per_channel);
                    if output.truncated && !was_truncated {
                        log::warn!(
                            "container={} output exceeded {} bytes per channel, truncating",
                            container_id,
                            self.max_bytes_per_channel
                        );
                    }
                }
                Err(e) => {
                    log::warn!("container={} log stream failed: {}", container_id, e);
                    return CaptureEnd::Failed(e);
                }
            }
        }
        CaptureEnd::Exhausted
    }
}
