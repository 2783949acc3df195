//! Runner façade: one request in, one result out.
//!
//! The pipeline is: validate the submission, bind the shared profile to the
//! staged file, create, start, open the log stream, then race output capture
//! against the deadline and the caller's cancellation. Whichever branch wins
//! sets the completion reason, removal is issued exactly once, and only then
//! is the result built.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capture::{CaptureEnd, CapturedOutput, OutputCapture};
use crate::config::SandrunConfig;
use crate::errors::SandboxError;
use crate::lifecycle::{LifecycleManager, SandboxLease};
use crate::profile::IsolationProfile;
use crate::runtime::ContainerRuntime;
use crate::supervisor::{CompletionReason, DeadlineSupervisor, RaceOutcome};

/// A staged submission.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub id: Uuid,
    pub source_path: PathBuf,
    pub source_size: u64,
    pub submitted_at: DateTime<Utc>,
}

impl ExecutionRequest {
    pub fn new(source_path: impl Into<PathBuf>, source_size: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_path: source_path.into(),
            source_size,
            submitted_at: Utc::now(),
        }
    }

    /// Builds a request from a file already on disk, taking its size from the metadata.
    pub async fn from_staged_file(path: &Path) -> Result<Self, SandboxError> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(SandboxError::InvalidSubmission(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        Ok(Self::new(path, metadata.len()))
    }

    pub fn validate(&self, max_source_bytes: u64) -> Result<(), SandboxError> {
        if self.source_size == 0 {
            return Err(SandboxError::InvalidSubmission("submission is empty".to_string()));
        }
        if self.source_size > max_source_bytes {
            return Err(SandboxError::SubmissionTooLarge {
                size: self.source_size,
                limit: max_source_bytes,
            });
        }
        Ok(())
    }

    fn container_name(&self) -> String {
        format!("sandrun-{}", self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub reason: CompletionReason,
    pub truncated: bool,
    pub elapsed: Duration,
}

impl ExecutionResult {
    fn new(output: CapturedOutput, reason: CompletionReason, elapsed: Duration) -> Self {
        Self {
            stdout: output.stdout,
            stderr: output.stderr,
            reason,
            truncated: output.truncated,
            elapsed,
        }
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[async_trait]
pub trait CodeRunner: Send + Sync {
    /// Runs one submission. `cancel` lets the caller abandon the run; the
    /// sandbox is still removed before this returns.
    async fn run(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, SandboxError>;

    /// The fixed wall-clock bound applied to every run.
    fn deadline(&self) -> Duration;

    /// Largest accepted submission, in bytes.
    fn max_source_bytes(&self) -> u64;
}

/// Container-backed [`CodeRunner`]. Cheap to clone; every clone shares the
/// same runtime client and profile.
#[derive(Clone)]
pub struct SandboxRunner {
    lifecycle: LifecycleManager,
    profile: Arc<IsolationProfile>,
    supervisor: DeadlineSupervisor,
    capture: OutputCapture,
    max_source_bytes: u64,
}

impl SandboxRunner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        profile: Arc<IsolationProfile>,
        deadline: Duration,
        max_source_bytes: u64,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            lifecycle: LifecycleManager::new(runtime),
            profile,
            supervisor: DeadlineSupervisor::new(deadline),
            capture: OutputCapture::new(max_output_bytes),
            max_source_bytes,
        }
    }

    pub fn from_config(
        runtime: Arc<dyn ContainerRuntime>,
        config: &SandrunConfig,
    ) -> Result<Self, SandboxError> {
        let profile = IsolationProfile::from_settings(&config.sandbox)?;
        Ok(Self::new(
            runtime,
            Arc::new(profile),
            Duration::from_secs(config.sandbox.exec_timeout_secs),
            config.sandbox.max_source_bytes,
            config.sandbox.max_output_bytes,
        ))
    }

    pub fn profile(&self) -> &IsolationProfile {
        &self.profile
    }

    /// Result of a run canceled before the program was allowed to run.
    fn canceled_early(started: Instant) -> ExecutionResult {
        ExecutionResult::new(
            CapturedOutput::default(),
            CompletionReason::Canceled,
            started.elapsed(),
        )
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        request.validate(self.max_source_bytes)?;
        let bound = self.profile.bind_source(&request.source_path)?;
        let started = Instant::now();
        let mut supervision = self.supervisor.begin();

        // Create is not abandoned mid-call: a dropped request could still
        // leave a container behind that nothing knows the id of.
        let instance = self
            .lifecycle
            .create(&request.container_name(), &bound)
            .await?;
        let mut lease = SandboxLease::new(self.lifecycle.clone(), instance);
        log::info!("request={} container={} assigned", request.id, lease.id());

        if cancel.is_cancelled() {
            supervision.cancel_pending(lease.id())?;
            lease.release().await;
            return Ok(Self::canceled_early(started));
        }

        // A failed start has already removed the container.
        let container_id = lease.id().to_string();
        let start = supervision
            .guard_pending(&container_id, self.lifecycle.start(lease.instance_mut()), cancel)
            .await;
        match start {
            Ok(Some(Ok(()))) => {}
            Ok(None) => {
                lease.release().await;
                return Ok(Self::canceled_early(started));
            }
            Ok(Some(Err(e))) | Err(e) => {
                lease.release().await;
                return Err(e);
            }
        }

        let stream = supervision
            .guard_pending(&container_id, self.lifecycle.stream_logs(lease.instance()), cancel)
            .await;
        let mut stream = match stream {
            Ok(Some(Ok(stream))) => stream,
            Ok(None) => {
                lease.release().await;
                return Ok(Self::canceled_early(started));
            }
            Ok(Some(Err(e))) | Err(e) => {
                lease.release().await;
                return Err(e);
            }
        };

        if let Err(e) = supervision.arm(&container_id) {
            lease.release().await;
            return Err(e);
        }

        let mut output = CapturedOutput::default();
        let outcome = supervision
            .race(
                &container_id,
                self.capture.drain(&container_id, &mut stream, &mut output),
                cancel,
            )
            .await;

        // The follow connection is closed before the container goes away.
        drop(stream);

        let reason = match outcome {
            Ok(RaceOutcome::Finished(end)) => {
                if let CaptureEnd::Failed(e) = end {
                    log::warn!(
                        "container={} capture ended early, keeping partial output: {}",
                        container_id,
                        e
                    );
                }
                lease.instance_mut().mark_exited();
                CompletionReason::Completed
            }
            Ok(forced) => forced.reason(),
            Err(e) => {
                lease.release().await;
                return Err(e);
            }
        };

        lease.release().await;

        let result = ExecutionResult::new(output, reason, started.elapsed());
        log::info!(
            "request={} container={} finished reason={:?} stdout={}B stderr={}B elapsed={:?}",
            request.id,
            container_id,
            result.reason,
            result.stdout.len(),
            result.stderr.len(),
            result.elapsed
        );
        Ok(result)
    }
}

#[async_trait]
impl CodeRunner for SandboxRunner {
    async fn run(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        let result = self.execute(&request, &cancel).await;
        if let Err(e) = &result {
            match e.container_id() {
                Some(id) => log::error!("request={} container={} failed: {}", request.id, id, e),
                None => log::warn!("request={} rejected: {}", request.id, e),
            }
        }
        result
    }

    fn deadline(&self) -> Duration {
        self.supervisor.deadline()
    }

    fn max_source_bytes(&self) -> u64 {
        self.max_source_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxSettings;
    use crate::errors::ErrorClass;
    use crate::runtime::LogChunk;
    use crate::test_utils::{LogScript, MockRuntime, RuntimeCall};

    const DEADLINE: Duration = Duration::from_secs(1);

    fn runner(runtime: &MockRuntime) -> SandboxRunner {
        let profile = IsolationProfile::from_settings(&SandboxSettings::default()).unwrap();
        SandboxRunner::new(
            Arc::new(runtime.clone()),
            Arc::new(profile),
            DEADLINE,
            5_000,
            1024 * 1024,
        )
    }

    fn request(size: u64) -> ExecutionRequest {
        ExecutionRequest::new("/tmp/sandrun-test/main.c", size)
    }

    fn assert_removed_exactly_once(runtime: &MockRuntime) {
        let ids = runtime.created_ids();
        assert_eq!(ids.len(), 1);
        assert_eq!(runtime.remove_count(&ids[0]), 1);
        assert!(runtime.is_removed(&ids[0]));
    }

    #[tokio::test]
    async fn test_hello_world_completes() {
        let runtime = MockRuntime::new(LogScript::Exits(vec![
            LogChunk::stdout("hello"),
            LogChunk::stderr("world"),
        ]));

        let result = runner(&runtime)
            .run(request(42), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.stdout, b"hello");
        assert_eq!(result.stderr, b"world");
        assert_eq!(result.reason, CompletionReason::Completed);
        assert!(!result.truncated);
        assert_removed_exactly_once(&runtime);
        assert_eq!(runtime.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_pipeline_call_order() {
        let runtime = MockRuntime::new(LogScript::Exits(vec![LogChunk::stdout("ok")]));
        runner(&runtime)
            .run(request(10), CancellationToken::new())
            .await
            .unwrap();

        let id = runtime.created_ids().remove(0);
        let calls = runtime.calls();
        assert!(matches!(&calls[0], RuntimeCall::Create { name, .. } if name.starts_with("sandrun-")));
        assert_eq!(
            &calls[1..],
            &[
                RuntimeCall::Start(id.clone()),
                RuntimeCall::Logs(id.clone()),
                RuntimeCall::Kill(id.clone()),
                RuntimeCall::Remove(id.clone()),
            ]
        );
    }

    #[tokio::test]
    async fn test_profile_is_bound_to_the_request_source() {
        let runtime = MockRuntime::default();
        let runner = runner(&runtime);
        runner
            .run(request(10), CancellationToken::new())
            .await
            .unwrap();

        let bound = runtime.bound_profiles();
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].source_bind(), "/tmp/sandrun-test/main.c:/src/main.c:ro");
        assert_eq!(bound[0].profile(), runner.profile());
    }

    #[tokio::test]
    async fn test_oversize_submission_never_creates() {
        let runtime = MockRuntime::default();

        let err = runner(&runtime)
            .run(request(5_001), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::SubmissionTooLarge { size: 5_001, limit: 5_000 }));
        assert_eq!(err.class(), ErrorClass::BadRequest);
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_submission_is_rejected() {
        let runtime = MockRuntime::default();
        let err = runner(&runtime)
            .run(request(0), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.class(), ErrorClass::BadRequest);
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_failure_skips_start_and_logs() {
        let runtime = MockRuntime::default().failing_create();

        let err = runner(&runtime)
            .run(request(10), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::CreateFailed { .. }));
        assert_eq!(err.class(), ErrorClass::InternalFailure);
        assert_eq!(runtime.start_count(), 0);
        assert_eq!(runtime.logs_count(), 0);
    }

    #[tokio::test]
    async fn test_start_failure_removes_once() {
        let runtime = MockRuntime::default().failing_start();

        let err = runner(&runtime)
            .run(request(10), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::StartFailed { .. }));
        assert_eq!(runtime.logs_count(), 0);
        assert_removed_exactly_once(&runtime);
    }

    #[tokio::test]
    async fn test_stream_failure_removes_once() {
        let runtime = MockRuntime::default().failing_logs();

        let err = runner(&runtime)
            .run(request(10), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::StreamUnavailable { .. }));
        assert_eq!(err.class(), ErrorClass::InternalFailure);
        assert_removed_exactly_once(&runtime);
    }

    #[tokio::test(start_paused = true)]
    async fn test_program_sleeping_past_deadline_times_out() {
        let runtime = MockRuntime::new(LogScript::Hangs(Vec::new()));
        let started = tokio::time::Instant::now();

        let result = runner(&runtime)
            .run(request(10), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.reason, CompletionReason::TimedOut);
        assert!(started.elapsed() >= DEADLINE);
        assert_removed_exactly_once(&runtime);
        assert_eq!(runtime.open_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_flushed_output() {
        let runtime = MockRuntime::new(LogScript::Hangs(vec![
            LogChunk::stdout("12345"),
            LogChunk::stderr("warn"),
            LogChunk::stdout("678"),
        ]));

        let result = runner(&runtime)
            .run(request(10), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.reason, CompletionReason::TimedOut);
        assert_eq!(result.stdout, b"12345678");
        assert_eq!(result.stderr, b"warn");
        assert_removed_exactly_once(&runtime);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_output_within_deadline_completes() {
        let runtime = MockRuntime::new(LogScript::Paced {
            chunks: vec![LogChunk::stdout("a"), LogChunk::stdout("b")],
            interval: Duration::from_millis(300),
        });

        let result = runner(&runtime)
            .run(request(10), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.reason, CompletionReason::Completed);
        assert_eq!(result.stdout, b"ab");
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_output_past_deadline_is_cut() {
        let runtime = MockRuntime::new(LogScript::Paced {
            chunks: vec![
                LogChunk::stdout("a"),
                LogChunk::stdout("b"),
                LogChunk::stdout("c"),
            ],
            interval: Duration::from_millis(400),
        });

        let result = runner(&runtime)
            .run(request(10), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.reason, CompletionReason::TimedOut);
        assert_eq!(result.stdout, b"ab");
        assert_removed_exactly_once(&runtime);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_cancellation_forces_removal() {
        let runtime = MockRuntime::new(LogScript::Hangs(vec![LogChunk::stdout("partial")]));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = runner(&runtime).run(request(10), cancel).await.unwrap();

        assert_eq!(result.reason, CompletionReason::Canceled);
        assert_eq!(result.stdout, b"partial");
        assert_removed_exactly_once(&runtime);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_slow_start_skips_the_program() {
        let runtime = MockRuntime::new(LogScript::Exits(vec![LogChunk::stdout("ran")]))
            .with_start_delay(Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let result = runner(&runtime).run(request(10), cancel).await.unwrap();

        assert_eq!(result.reason, CompletionReason::Canceled);
        assert!(result.stdout.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(runtime.start_count(), 1);
        assert_eq!(runtime.logs_count(), 0);
        assert_removed_exactly_once(&runtime);
    }

    #[tokio::test]
    async fn test_cancel_before_start_never_starts() {
        let runtime = MockRuntime::new(LogScript::Exits(vec![LogChunk::stdout("ran")]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = runner(&runtime).run(request(10), cancel).await.unwrap();

        assert_eq!(result.reason, CompletionReason::Canceled);
        assert!(result.stdout.is_empty());
        assert_eq!(runtime.create_count(), 1);
        assert_eq!(runtime.start_count(), 0);
        assert_eq!(runtime.logs_count(), 0);
        assert_removed_exactly_once(&runtime);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_start_does_not_consume_the_deadline() {
        let runtime = MockRuntime::new(LogScript::Exits(vec![LogChunk::stdout("ran")]))
            .with_start_delay(Duration::from_secs(5));

        let result = runner(&runtime)
            .run(request(10), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.reason, CompletionReason::Completed);
        assert_eq!(result.stdout, b"ran");
        assert_removed_exactly_once(&runtime);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_program_flooding_output_still_times_out() {
        let runtime = MockRuntime::new(LogScript::Floods);

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            runner(&runtime).run(request(10), CancellationToken::new()),
        )
        .await
        .expect("deadline never fired while output was always ready")
        .unwrap();

        assert_eq!(result.reason, CompletionReason::TimedOut);
        assert!(!result.stdout.is_empty());
        assert!(result.stdout.iter().all(|&b| b == b'x'));
        assert_removed_exactly_once(&runtime);
        assert_eq!(runtime.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_broken_stream_reports_partial_output() {
        let runtime = MockRuntime::new(LogScript::Breaks(vec![LogChunk::stdout("before")]));

        let result = runner(&runtime)
            .run(request(10), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.reason, CompletionReason::Completed);
        assert_eq!(result.stdout, b"before");
        assert_removed_exactly_once(&runtime);
        assert_eq!(runtime.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_failure_is_not_surfaced() {
        let runtime = MockRuntime::new(LogScript::Exits(vec![LogChunk::stdout("done")]))
            .failing_kill()
            .failing_remove();

        let result = runner(&runtime)
            .run(request(10), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.stdout, b"done");
        let id = runtime.created_ids().remove(0);
        assert_eq!(runtime.remove_count(&id), 1);
    }

    #[tokio::test]
    async fn test_concurrent_runs_use_separate_instances() {
        let runtime = MockRuntime::new(LogScript::Exits(vec![LogChunk::stdout("x")]));
        let runner = runner(&runtime);

        let runs = (0..8).map(|_| {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(request(10), CancellationToken::new()).await })
        });
        for handle in runs.collect::<Vec<_>>() {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.stdout, b"x");
        }

        let ids = runtime.created_ids();
        assert_eq!(ids.len(), 8);
        for id in ids {
            assert_eq!(runtime.remove_count(&id), 1);
        }
    }

    #[tokio::test]
    async fn test_request_from_staged_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"int main(void) { return 0; }").unwrap();

        let request = ExecutionRequest::from_staged_file(file.path()).await.unwrap();
        assert_eq!(request.source_size, 28);
        assert_eq!(request.source_path, file.path());

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ExecutionRequest::from_staged_file(dir.path()).await,
            Err(SandboxError::InvalidSubmission(_))
        ));
    }
}
