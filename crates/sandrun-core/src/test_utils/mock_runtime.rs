// src/test_utils/mock_runtime.rs
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;

use crate::errors::RuntimeError;
use crate::profile::BoundProfile;
use crate::runtime::{ContainerRuntime, LogChunk, LogStream};

/// Every call the mock received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Create { name: String, id: String },
    Start(String),
    Logs(String),
    Kill(String),
    Remove(String),
}

/// What the sandboxed "program" writes, and how its log stream behaves.
#[derive(Debug, Clone)]
pub enum LogScript {
    /// Emits the chunks, then the stream ends: the program exited.
    Exits(Vec<LogChunk>),
    /// Emits the chunks, then goes silent forever without exiting.
    Hangs(Vec<LogChunk>),
    /// Emits the chunks, then the stream reports an error.
    Breaks(Vec<LogChunk>),
    /// Emits each chunk after `interval`, then exits.
    Paced { chunks: Vec<LogChunk>, interval: Duration },
    /// Writes `x` to stdout forever with every read ready at once, like a
    /// tight print loop.
    Floods,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockContainerState {
    Created,
    Running,
    Removed,
}

#[derive(Default)]
struct MockState {
    calls: Vec<RuntimeCall>,
    bound: Vec<BoundProfile>,
    containers: HashMap<String, MockContainerState>,
    next_id: u64,
}

/// In-memory `ContainerRuntime` with scripted output and injectable failures.
#[derive(Clone)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
    open_streams: Arc<AtomicUsize>,
    script: LogScript,
    fail_create: bool,
    fail_start: bool,
    fail_logs: bool,
    fail_kill: bool,
    fail_remove: bool,
    start_delay: Option<Duration>,
    kill_delay: Option<Duration>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new(LogScript::Exits(Vec::new()))
    }
}

impl MockRuntime {
    pub fn new(script: LogScript) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            open_streams: Arc::new(AtomicUsize::new(0)),
            script,
            fail_create: false,
            fail_start: false,
            fail_logs: false,
            fail_kill: false,
            fail_remove: false,
            start_delay: None,
            kill_delay: None,
        }
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn failing_logs(mut self) -> Self {
        self.fail_logs = true;
        self
    }

    pub fn failing_kill(mut self) -> Self {
        self.fail_kill = true;
        self
    }

    pub fn failing_remove(mut self) -> Self {
        self.fail_remove = true;
        self
    }

    /// `start` takes `delay` before answering.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    /// `kill` takes `delay` before answering.
    pub fn with_kill_delay(mut self, delay: Duration) -> Self {
        self.kill_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn bound_profiles(&self) -> Vec<BoundProfile> {
        self.state.lock().unwrap().bound.clone()
    }

    pub fn create_count(&self) -> usize {
        self.count(|call| matches!(call, RuntimeCall::Create { .. }))
    }

    pub fn start_count(&self) -> usize {
        self.count(|call| matches!(call, RuntimeCall::Start(_)))
    }

    pub fn logs_count(&self) -> usize {
        self.count(|call| matches!(call, RuntimeCall::Logs(_)))
    }

    pub fn kill_count(&self) -> usize {
        self.count(|call| matches!(call, RuntimeCall::Kill(_)))
    }

    /// Removal requests per container id.
    pub fn remove_count(&self, id: &str) -> usize {
        self.count(|call| matches!(call, RuntimeCall::Remove(target) if target == id))
    }

    /// Ids of every container ever created.
    pub fn created_ids(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::Create { id, .. } => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn is_removed(&self, id: &str) -> bool {
        matches!(
            self.state.lock().unwrap().containers.get(id),
            Some(MockContainerState::Removed)
        )
    }

    /// Log streams handed out and not yet dropped.
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    fn count(&self, predicate: impl Fn(&RuntimeCall) -> bool) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|call| predicate(call)).count()
    }

    fn record(&self, call: RuntimeCall) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn scripted_stream(&self) -> LogStream {
        let stream = match self.script.clone() {
            LogScript::Exits(chunks) => stream::iter(chunks.into_iter().map(Ok)).boxed(),
            LogScript::Hangs(chunks) => stream::iter(chunks.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed(),
            LogScript::Breaks(chunks) => stream::iter(chunks.into_iter().map(Ok))
                .chain(stream::once(async {
                    Err(RuntimeError::Unavailable("log connection reset".to_string()))
                }))
                .boxed(),
            LogScript::Paced { chunks, interval } => stream::iter(chunks)
                .then(move |chunk| async move {
                    tokio::time::sleep(interval).await;
                    Ok(chunk)
                })
                .boxed(),
            LogScript::Floods => stream::unfold(tokio::io::repeat(b'x'), |mut reader| async move {
                let mut buf = [0u8; 256];
                match reader.read(&mut buf).await {
                    Ok(n) => Some((Ok(LogChunk::stdout(buf[..n].to_vec())), reader)),
                    Err(e) => Some((Err(RuntimeError::Unavailable(e.to_string())), reader)),
                }
            })
            .boxed(),
        };

        self.open_streams.fetch_add(1, Ordering::SeqCst);
        let guard = StreamGuard(self.open_streams.clone());
        stream
            .map(move |item| {
                let _held = &guard;
                item
            })
            .boxed()
    }
}

struct StreamGuard(Arc<AtomicUsize>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, name: &str, profile: &BoundProfile) -> Result<String, RuntimeError> {
        if self.fail_create {
            return Err(RuntimeError::Unavailable("create refused".to_string()));
        }

        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("mock-{:04}", state.next_id);
        state.containers.insert(id.clone(), MockContainerState::Created);
        state.bound.push(profile.clone());
        state.calls.push(RuntimeCall::Create {
            name: name.to_string(),
            id: id.clone(),
        });
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Start(id.to_string()));
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_start {
            return Err(RuntimeError::Unavailable("start refused".to_string()));
        }

        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(id) {
            Some(container) if *container == MockContainerState::Created => {
                *container = MockContainerState::Running;
                Ok(())
            }
            _ => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn logs(&self, id: &str) -> Result<LogStream, RuntimeError> {
        self.record(RuntimeCall::Logs(id.to_string()));
        if self.fail_logs {
            return Err(RuntimeError::Unavailable("logs refused".to_string()));
        }

        let exists = matches!(
            self.state.lock().unwrap().containers.get(id),
            Some(MockContainerState::Created | MockContainerState::Running)
        );
        if !exists {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        Ok(self.scripted_stream())
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Kill(id.to_string()));
        if let Some(delay) = self.kill_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_kill {
            return Err(RuntimeError::Unavailable("kill refused".to_string()));
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Remove(id.to_string()));
        if self.fail_remove {
            return Err(RuntimeError::Unavailable("remove refused".to_string()));
        }

        // Unknown or already removed ids succeed, like the daemon's 404 handling.
        if let Some(container) = self.state.lock().unwrap().containers.get_mut(id) {
            *container = MockContainerState::Removed;
        }
        Ok(())
    }
}
