use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

use crate::execution::{
    ExecutionResult, LineSink, ProcessExecutor, ProcessExitStatus, ProcessOutput,
    ProcessSpawnRequest, ProcessTerminationMode, ProcessWaitFuture, RunningProcess, StreamKind,
};
use crate::models::{AnalysisError, AnalysisErrorKind, ResourceCategory, TaskId};

type ReaderHandle = JoinHandle<std::io::Result<Vec<u8>>>;

pub struct TokioProcessExecutor;

impl ProcessExecutor for TokioProcessExecutor {
    fn spawn(
        &self,
        request: ProcessSpawnRequest,
        sink: Arc<dyn LineSink>,
    ) -> ExecutionResult<Arc<dyn RunningProcess>> {
        let mut cmd = tokio::process::Command::new(&request.command.program);
        cmd.args(&request.command.args);

        for (key, value) in &request.command.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &request.command.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|error| {
            AnalysisError::new(
                AnalysisErrorKind::Spawn,
                format!("failed to spawn process: {error}"),
            )
            .for_category(request.category)
        })?;

        let pid = child.id();
        let started_at = SystemTime::now();

        // Readers start immediately so the pipes drain while the process
        // runs; a full OS pipe buffer would otherwise stall the child.
        let stdout_reader = spawn_line_reader(child.stdout.take(), StreamKind::Stdout, sink.clone());
        let stderr_reader = spawn_line_reader(child.stderr.take(), StreamKind::Stderr, sink);

        Ok(Arc::new(TokioRunningProcess {
            child: Mutex::new(Some(child)),
            readers: Mutex::new(Some((stdout_reader, stderr_reader))),
            pid,
            started_at,
            timeout: request.timeout,
            category: request.category,
            task_id: request.task_id,
        }))
    }
}

fn spawn_line_reader<R>(stream: Option<R>, kind: StreamKind, sink: Arc<dyn LineSink>) -> ReaderHandle
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        let Some(stream) = stream else {
            return Ok(buffer);
        };
        let mut lines = BufReader::new(stream).lines();
        while let Some(line) = lines.next_line().await? {
            sink.on_line(kind, &line);
            buffer.extend_from_slice(line.as_bytes());
            buffer.push(b'\n');
        }
        Ok(buffer)
    })
}

struct TokioRunningProcess {
    child: Mutex<Option<tokio::process::Child>>,
    readers: Mutex<Option<(ReaderHandle, ReaderHandle)>>,
    pid: Option<u32>,
    started_at: SystemTime,
    timeout: Option<Duration>,
    category: ResourceCategory,
    task_id: Option<TaskId>,
}

impl RunningProcess for TokioRunningProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(&self, mode: ProcessTerminationMode) -> ExecutionResult<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };

        let signal = match mode {
            ProcessTerminationMode::Immediate => libc::SIGKILL,
            ProcessTerminationMode::Graceful { grace_period } => {
                // Escalate once the grace period lapses; a no-op if the
                // group already exited.
                let pid = self.pid;
                tokio::spawn(async move {
                    tokio::time::sleep(grace_period).await;
                    kill_process_group(pid);
                });
                libc::SIGTERM
            }
        };

        let pgid = -(pid as libc::pid_t);
        let result = unsafe { libc::kill(pgid, signal) };

        if result != 0 {
            let os_error = std::io::Error::last_os_error();
            if os_error.raw_os_error() != Some(libc::ESRCH) {
                return Err(self.failure(
                    AnalysisErrorKind::Internal,
                    format!("failed to send signal {signal} to process group {pid}: {os_error}"),
                ));
            }
        }

        Ok(())
    }

    fn wait(&self) -> ProcessWaitFuture {
        let child = self.child.lock().ok().and_then(|mut slot| slot.take());
        let readers = self.readers.lock().ok().and_then(|mut slot| slot.take());
        let timeout = self.timeout;
        let started_at = self.started_at;
        let category = self.category;
        let task_id = self.task_id.clone();
        let pid = self.pid;

        Box::pin(async move {
            let consumed = |what: &str| {
                AnalysisError::new(
                    AnalysisErrorKind::Internal,
                    format!("{what} already consumed"),
                )
                .for_category(category)
            };
            let mut child = child.ok_or_else(|| consumed("child process"))?;
            let (stdout_reader, stderr_reader) = readers.ok_or_else(|| consumed("stream readers"))?;

            let wait_err = |error: std::io::Error| {
                let mut failure = AnalysisError::new(
                    AnalysisErrorKind::Internal,
                    format!("failed to wait for process: {error}"),
                )
                .for_category(category);
                if let Some(task_id) = task_id.clone() {
                    failure = failure.for_task(task_id);
                }
                failure
            };

            // Wait for process exit first, then collect output with a short
            // bounded read window. This avoids hanging forever when
            // descendant processes inherit the stdout/stderr fds.
            let status = if let Some(timeout_duration) = timeout {
                match tokio::time::timeout(timeout_duration, child.wait()).await {
                    Ok(result) => result.map_err(wait_err)?,
                    Err(_) => {
                        kill_process_group(pid);
                        let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
                        stdout_reader.abort();
                        stderr_reader.abort();
                        let mut failure = AnalysisError::new(
                            AnalysisErrorKind::Timeout,
                            format!(
                                "process timed out after {}ms",
                                timeout_duration.as_millis()
                            ),
                        )
                        .for_category(category);
                        if let Some(task_id) = task_id.clone() {
                            failure = failure.for_task(task_id);
                        }
                        return Err(failure);
                    }
                }
            } else {
                child.wait().await.map_err(wait_err)?
            };

            let read_deadline = Duration::from_millis(250);
            let stdout = join_reader(stdout_reader, read_deadline).await;
            let stderr = join_reader(stderr_reader, read_deadline).await;

            let (stdout, stderr) = match (stdout, stderr) {
                (Ok(stdout), Ok(stderr)) => (stdout, stderr),
                (Err(error), _) | (_, Err(error)) => {
                    kill_process_group(pid);
                    let mut failure = AnalysisError::new(
                        AnalysisErrorKind::StreamRead,
                        format!("failed to read process output stream: {error}"),
                    )
                    .for_category(category);
                    if let Some(task_id) = task_id {
                        failure = failure.for_task(task_id);
                    }
                    return Err(failure);
                }
            };

            let finished_at = SystemTime::now();

            let status = match status.code() {
                Some(code) => ProcessExitStatus::ExitCode(code),
                None => ProcessExitStatus::Terminated,
            };

            Ok(ProcessOutput {
                status,
                stdout,
                stderr,
                started_at,
                finished_at,
            })
        })
    }
}

impl TokioRunningProcess {
    fn failure(&self, kind: AnalysisErrorKind, message: String) -> AnalysisError {
        let mut failure = AnalysisError::new(kind, message).for_category(self.category);
        if let Some(task_id) = self.task_id.clone() {
            failure = failure.for_task(task_id);
        }
        failure
    }
}

async fn join_reader(mut reader: ReaderHandle, deadline: Duration) -> std::io::Result<Vec<u8>> {
    match tokio::time::timeout(deadline, &mut reader).await {
        Ok(Ok(result)) => result,
        // A join error leaves a partial (empty) capture rather than failing
        // the whole run.
        Ok(Err(_)) => Ok(Vec::new()),
        Err(_) => {
            // Descendants holding the pipe fd keep the reader blocked past
            // process exit; stop it so it cannot trickle late lines into a
            // finished task's log.
            reader.abort();
            Ok(Vec::new())
        }
    }
}

fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        let pgid = -(pid as libc::pid_t);
        unsafe {
            libc::kill(pgid, libc::SIGKILL);
        }
    }
}
