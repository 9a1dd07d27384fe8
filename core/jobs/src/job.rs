//! Processing job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use snapmatch_common::{Error, EventId, Result};

/// Lifecycle of a matcher run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Idle,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a job ended in [`JobState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCause {
    /// The process could not be started.
    Spawn(String),
    /// The process exited unsuccessfully. `None` when killed by a signal.
    NonZeroExit(Option<i32>),
    /// The wall-clock limit expired and the process was killed.
    Timeout(Duration),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(reason) => write!(f, "failed to start matcher: {}", reason),
            Self::NonZeroExit(Some(code)) => write!(f, "matcher exited with code {}", code),
            Self::NonZeroExit(None) => write!(f, "matcher was terminated by a signal"),
            Self::Timeout(limit) => write!(f, "matcher killed after {}s timeout", limit.as_secs()),
        }
    }
}

/// One run of the matcher for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub event_id: EventId,
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureCause>,
}

impl ProcessingJob {
    pub fn new(event_id: EventId) -> Self {
        Self {
            event_id,
            state: JobState::Idle,
            started_at: None,
            pid: None,
            exit_code: None,
            timeout_at: None,
            finished_at: None,
            failure: None,
        }
    }

    /// `Idle -> Running` once the process has been spawned.
    pub fn start(&mut self, pid: Option<u32>, timeout: Duration) -> Result<()> {
        self.expect_state(JobState::Idle, "start")?;
        let now = Utc::now();
        self.state = JobState::Running;
        self.started_at = Some(now);
        self.pid = pid;
        self.timeout_at = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| now.checked_add_signed(t));
        Ok(())
    }

    /// `Running -> Succeeded` on exit code 0.
    pub fn succeed(&mut self) -> Result<()> {
        self.expect_state(JobState::Running, "succeed")?;
        self.state = JobState::Succeeded;
        self.exit_code = Some(0);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// `Idle | Running -> Failed`. A spawn failure never reaches `Running`.
    pub fn fail(&mut self, cause: FailureCause) -> Result<()> {
        if self.is_terminal() {
            return Err(self.invalid_transition("fail"));
        }
        if let FailureCause::NonZeroExit(code) = &cause {
            self.exit_code = *code;
        }
        self.state = JobState::Failed;
        self.failure = Some(cause);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, JobState::Succeeded | JobState::Failed)
    }

    fn expect_state(&self, expected: JobState, action: &str) -> Result<()> {
        if self.state != expected {
            return Err(self.invalid_transition(action));
        }
        Ok(())
    }

    fn invalid_transition(&self, action: &str) -> Error {
        Error::Precondition(format!(
            "Cannot {} job for event {} in state {}",
            action, self.event_id, self.state
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ProcessingJob {
        ProcessingJob::new(EventId::new("e1").unwrap())
    }

    #[test]
    fn test_success_path() {
        let mut job = job();
        job.start(Some(42), Duration::from_secs(60)).unwrap();
        assert!(job.is_running());
        assert_eq!(job.pid, Some(42));
        assert!(job.timeout_at.unwrap() > job.started_at.unwrap());

        job.succeed().unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.exit_code, Some(0));
        assert!(job.is_terminal());
    }

    #[test]
    fn test_failure_records_exit_code() {
        let mut job = job();
        job.start(None, Duration::from_secs(1)).unwrap();
        job.fail(FailureCause::NonZeroExit(Some(3))).unwrap();

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.exit_code, Some(3));
        assert_eq!(job.failure.as_ref().unwrap().to_string(), "matcher exited with code 3");
    }

    #[test]
    fn test_spawn_failure_from_idle() {
        let mut job = job();
        job.fail(FailureCause::Spawn("no such file".to_string())).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut job = job();
        assert!(matches!(job.succeed(), Err(Error::Precondition(_))));

        job.start(None, Duration::from_secs(1)).unwrap();
        assert!(job.start(None, Duration::from_secs(1)).is_err());

        job.fail(FailureCause::Timeout(Duration::from_secs(1))).unwrap();
        assert!(job.succeed().is_err());
        assert!(job.fail(FailureCause::NonZeroExit(None)).is_err());
    }
}
