pub mod tokio_process;

pub use tokio_process::TokioProcessExecutor;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::models::{AnalysisError, AnalysisErrorKind, ResourceCategory, TaskId};

pub type ExecutionResult<T> = Result<T, AnalysisError>;

pub type ProcessWaitFuture = Pin<Box<dyn Future<Output = ExecutionResult<ProcessOutput>> + Send>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Receives every output line as it is read off the child's pipes, on the
/// reader tasks. Implementations must be cheap and non-blocking; the status
/// store sink is the production implementation.
pub trait LineSink: Send + Sync {
    fn on_line(&self, stream: StreamKind, line: &str);
}

/// Sink that discards everything; for callers that only want the collected
/// output.
pub struct NullSink;

impl LineSink for NullSink {
    fn on_line(&self, _stream: StreamKind, _line: &str) {}
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    pub fn validate(&self, category: ResourceCategory) -> ExecutionResult<()> {
        if self.program.as_os_str().is_empty() {
            return Err(invalid_input(category, "command program path must not be empty"));
        }

        if self
            .args
            .iter()
            .any(|arg| arg.is_empty() || arg.contains('\0'))
        {
            return Err(invalid_input(
                category,
                "command args must be non-empty and must not contain NUL bytes",
            ));
        }

        if self
            .env
            .iter()
            .any(|(key, value)| key.is_empty() || key.contains('\0') || value.contains('\0'))
        {
            return Err(invalid_input(
                category,
                "environment keys and values must be non-empty and must not contain NUL bytes",
            ));
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessSpawnRequest {
    pub category: ResourceCategory,
    pub task_id: Option<TaskId>,
    pub command: CommandSpec,
    pub timeout: Option<Duration>,
    pub requested_at: SystemTime,
}

impl ProcessSpawnRequest {
    pub fn new(category: ResourceCategory, command: CommandSpec) -> Self {
        Self {
            category,
            task_id: None,
            command,
            timeout: None,
            requested_at: SystemTime::now(),
        }
    }

    pub fn task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> ExecutionResult<()> {
        self.command.validate(self.category)?;

        if let Some(timeout) = self.timeout
            && timeout.is_zero()
        {
            return Err(invalid_input(
                self.category,
                "timeout must be greater than zero when provided",
            ));
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessTerminationMode {
    /// SIGTERM now; SIGKILL to the group once the grace period lapses.
    Graceful { grace_period: Duration },
    /// SIGKILL immediately.
    Immediate,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessExitStatus {
    ExitCode(i32),
    Terminated,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessOutput {
    pub status: ProcessExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
}

/// One spawned external process. `terminate` signals the whole process
/// group, since the analytics libraries fan out worker subprocesses that a
/// plain child kill would orphan. `wait` consumes the child; a second call
/// is an error.
pub trait RunningProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    fn terminate(&self, mode: ProcessTerminationMode) -> ExecutionResult<()>;

    fn wait(&self) -> ProcessWaitFuture;
}

pub trait ProcessExecutor: Send + Sync {
    fn spawn(
        &self,
        request: ProcessSpawnRequest,
        sink: Arc<dyn LineSink>,
    ) -> ExecutionResult<Arc<dyn RunningProcess>>;
}

pub fn spawn_validated(
    executor: &dyn ProcessExecutor,
    request: ProcessSpawnRequest,
    sink: Arc<dyn LineSink>,
) -> ExecutionResult<Arc<dyn RunningProcess>> {
    request.validate()?;
    executor.spawn(request, sink)
}

fn invalid_input(category: ResourceCategory, message: &str) -> AnalysisError {
    AnalysisError::new(AnalysisErrorKind::InvalidInput, message).for_category(category)
}
