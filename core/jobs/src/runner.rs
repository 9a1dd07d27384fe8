//! External matcher process supervision.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use snapmatch_common::{Error, EventId, Result};

/// Default wall-clock limit for one matcher run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Longest wall-clock limit accepted for one matcher run.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How long to keep draining output after the process is gone.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// How to invoke the matcher.
///
/// The process is called as `program [args...] <event_root> [threshold]`.
#[derive(Debug, Clone)]
pub struct MatcherCommand {
    pub program: String,
    pub args: Vec<String>,
    pub threshold: Option<f64>,
    pub timeout: Duration,
}

impl MatcherCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            threshold: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, event_root: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg(event_root);
        if let Some(threshold) = self.threshold {
            command.arg(threshold.to_string());
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Start the matcher over an event's local root. The deadline is armed
    /// immediately.
    ///
    /// # Errors
    /// - `Configuration` if the timeout cannot be turned into a deadline
    /// - `Process` if the program cannot be started
    pub fn spawn(&self, event: &EventId, event_root: &Path) -> Result<RunningMatcher> {
        let deadline = Instant::now().checked_add(self.timeout).ok_or_else(|| {
            Error::Configuration(format!("Matcher timeout {:?} is out of range", self.timeout))
        })?;
        let mut child = self.command(event_root).spawn().map_err(|e| {
            Error::Process(format!("Failed to start matcher '{}': {}", self.program, e))
        })?;

        let mut output = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            output.push(forward_lines(stdout, event.clone(), Stream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            output.push(forward_lines(stderr, event.clone(), Stream::Stderr));
        }

        info!(event = %event, pid = child.id(), program = %self.program, "Matcher started");
        Ok(RunningMatcher {
            child,
            event: event.clone(),
            limit: self.timeout,
            deadline,
            output,
        })
    }
}

/// How a supervised run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exit code, `None` when terminated by a signal.
    Exited(Option<i32>),
    /// Killed after the deadline.
    TimedOut,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(Some(0)))
    }
}

/// A spawned matcher with its deadline.
pub struct RunningMatcher {
    child: Child,
    event: EventId,
    limit: Duration,
    deadline: Instant,
    output: Vec<JoinHandle<()>>,
}

impl RunningMatcher {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    /// Wait for exit or kill the process at the deadline.
    pub async fn wait(mut self) -> Result<RunOutcome> {
        let outcome = tokio::select! {
            status = self.child.wait() => RunOutcome::Exited(status?.code()),
            _ = sleep_until(self.deadline) => {
                warn!(event = %self.event, limit_secs = self.limit.as_secs(), "Matcher timed out, killing");
                self.child.kill().await?;
                RunOutcome::TimedOut
            }
        };

        for mut task in self.output {
            if timeout(OUTPUT_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }

        info!(event = %self.event, outcome = ?outcome, "Matcher finished");
        Ok(outcome)
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn forward_lines<R>(reader: R, event: EventId, stream: Stream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match stream {
                    Stream::Stdout => info!(target: "matcher", event = %event, "{}", line),
                    Stream::Stderr => warn!(target: "matcher", event = %event, "{}", line),
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(event = %event, error = %e, "Stopped reading matcher output");
                    break;
                }
            }
        }
    })
}
