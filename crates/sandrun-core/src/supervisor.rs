//! Deadline supervision.
//!
//! Each run walks `Pending → Running → {Completed, TimedOut, Canceled}`. The
//! wall-clock timer is armed on entering `Running` and is enforced from the
//! outside: the sandboxed program is never asked to cooperate. The deadline
//! itself is fixed when the supervisor is built and cannot be changed per run.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::SandboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Pending,
    Running,
    Completed,
    TimedOut,
    Canceled,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::TimedOut | RunPhase::Canceled)
    }

    pub fn can_transition_to(self, next: RunPhase) -> bool {
        match (self, next) {
            (RunPhase::Pending, RunPhase::Running) => true,
            (RunPhase::Pending, RunPhase::Canceled) => true,
            (RunPhase::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Pending => "pending",
            RunPhase::Running => "running",
            RunPhase::Completed => "completed",
            RunPhase::TimedOut => "timed_out",
            RunPhase::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    Completed,
    TimedOut,
    Canceled,
}

impl CompletionReason {
    /// True when the program was stopped from the outside.
    pub fn is_forced(self) -> bool {
        !matches!(self, CompletionReason::Completed)
    }
}

impl From<CompletionReason> for RunPhase {
    fn from(reason: CompletionReason) -> Self {
        match reason {
            CompletionReason::Completed => RunPhase::Completed,
            CompletionReason::TimedOut => RunPhase::TimedOut,
            CompletionReason::Canceled => RunPhase::Canceled,
        }
    }
}

/// Result of racing a unit of work against the deadline.
#[derive(Debug)]
pub enum RaceOutcome<T> {
    Finished(T),
    TimedOut,
    Canceled,
}

impl<T> RaceOutcome<T> {
    pub fn reason(&self) -> CompletionReason {
        match self {
            RaceOutcome::Finished(_) => CompletionReason::Completed,
            RaceOutcome::TimedOut => CompletionReason::TimedOut,
            RaceOutcome::Canceled => CompletionReason::Canceled,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeadlineSupervisor {
    deadline: Duration,
}

impl DeadlineSupervisor {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Supervision for one run, in `Pending` with the timer unarmed.
    pub fn begin(&self) -> RunSupervision {
        RunSupervision {
            deadline: self.deadline,
            phase: RunPhase::Pending,
            expires_at: None,
        }
    }
}

#[derive(Debug)]
pub struct RunSupervision {
    deadline: Duration,
    phase: RunPhase,
    expires_at: Option<Instant>,
}

impl RunSupervision {
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    fn advance(&mut self, container_id: &str, next: RunPhase) -> Result<(), SandboxError> {
        if !self.phase.can_transition_to(next) {
            return Err(SandboxError::Internal(format!(
                "container {} cannot move from {} to {}",
                container_id, self.phase, next
            )));
        }
        log::debug!("container={} run {} -> {}", container_id, self.phase, next);
        self.phase = next;
        Ok(())
    }

    /// Enters `Running` and arms the wall-clock timer.
    pub fn arm(&mut self, container_id: &str) -> Result<(), SandboxError> {
        self.advance(container_id, RunPhase::Running)?;
        self.expires_at = Some(Instant::now() + self.deadline);
        log::debug!(
            "container={} deadline armed for {:?}",
            container_id,
            self.deadline
        );
        Ok(())
    }

    /// Marks a run canceled before it ever reached `Running`.
    pub fn cancel_pending(&mut self, container_id: &str) -> Result<(), SandboxError> {
        self.advance(container_id, RunPhase::Canceled)?;
        log::info!("container={} run canceled by caller before start", container_id);
        Ok(())
    }

    /// Awaits a setup step (start, opening the stream) while still `Pending`,
    /// giving up on it as soon as the caller cancels. Returns `None` once the
    /// run has moved to `Canceled`; the abandoned step is dropped.
    pub async fn guard_pending<F>(
        &mut self,
        container_id: &str,
        step: F,
        cancel: &CancellationToken,
    ) -> Result<Option<F::Output>, SandboxError>
    where
        F: Future,
    {
        if self.phase != RunPhase::Pending {
            return Err(SandboxError::Internal(format!(
                "container {} guarded a setup step while {}",
                container_id, self.phase
            )));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.cancel_pending(container_id)?;
                Ok(None)
            }
            output = step => Ok(Some(output)),
        }
    }

    /// Races `work` against the armed deadline and the caller's cancellation.
    ///
    /// Exactly one branch decides the outcome. The losing branches are dropped
    /// here, which cancels the timer or abandons the in-flight work. Cancellation
    /// and the timer are polled before `work` on every wakeup: a stream that is
    /// always ready drains the task's cooperative budget, and a timer polled
    /// after it would never observe its own expiry.
    pub async fn race<F>(
        &mut self,
        container_id: &str,
        work: F,
        cancel: &CancellationToken,
    ) -> Result<RaceOutcome<F::Output>, SandboxError>
    where
        F: Future,
    {
        let Some(expires_at) = self.expires_at.filter(|_| self.phase == RunPhase::Running) else {
            return Err(SandboxError::Internal(format!(
                "container {} raced without an armed deadline",
                container_id
            )));
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => RaceOutcome::Canceled,
            _ = tokio::time::sleep_until(expires_at) => RaceOutcome::TimedOut,
            output = work => RaceOutcome::Finished(output),
        };

        match &outcome {
            RaceOutcome::Finished(_) => {
                log::debug!("container={} finished, deadline timer cancelled", container_id)
            }
            RaceOutcome::TimedOut => log::warn!(
                "container={} exceeded the {:?} deadline, forcing kill",
                container_id,
                self.deadline
            ),
            RaceOutcome::Canceled => {
                log::info!("container={} run canceled by caller, forcing kill", container_id)
            }
        }
        self.advance(container_id, outcome.reason().into())?;

        Ok(outcome)
    }
}
