use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::execution::{
    LineSink, ProcessExecutor, ProcessExitStatus, ProcessSpawnRequest, ProcessTerminationMode,
    RunningProcess, StreamKind, spawn_validated,
};
use crate::lock::{FlightGuard, SingleFlight};
use crate::models::{AnalysisError, AnalysisErrorKind, TaskId, TaskSnapshot};
use crate::orchestration::{AnalysisRequest, RuntimeConfig, StartOutcome};
use crate::output::{error_message, extract_trailing_json, tail_snippet};
use crate::progress::{LineEvent, parse_line};
use crate::status::TaskStatusStore;

const FAILURE_TAIL_CHARS: usize = 400;

/// Drives one external analysis per resource category at a time: try the
/// gate, register the task, spawn the process with its output streamed into
/// the status store, and finalize exactly one terminal state. Every failure
/// inside the driver becomes a terminal FAILED write; nothing escapes to
/// leak the gate.
#[derive(Clone)]
pub struct AnalysisRuntime {
    store: Arc<TaskStatusStore>,
    gate: Arc<SingleFlight>,
    executor: Arc<dyn ProcessExecutor>,
    running: Arc<Mutex<HashMap<TaskId, Arc<RunningHandle>>>>,
    config: RuntimeConfig,
}

struct RunningHandle {
    process: Mutex<Option<Arc<dyn RunningProcess>>>,
    cancelled: AtomicBool,
}

impl RunningHandle {
    fn new() -> Self {
        Self {
            process: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn process(&self) -> Option<Arc<dyn RunningProcess>> {
        self.process
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_process(&self, process: Arc<dyn RunningProcess>) {
        *self
            .process
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(process);
    }
}

impl AnalysisRuntime {
    pub fn new(
        store: Arc<TaskStatusStore>,
        executor: Arc<dyn ProcessExecutor>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            gate: Arc::new(SingleFlight::new()),
            executor,
            running: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn store(&self) -> &Arc<TaskStatusStore> {
        &self.store
    }

    /// Begin an analysis run. Returns `Busy` immediately when the category
    /// gate is held; otherwise the task id to poll. Must be called from
    /// within a tokio runtime.
    pub fn start(&self, request: AnalysisRequest) -> Result<StartOutcome, AnalysisError> {
        request.command.validate(request.category)?;
        if let Some(timeout) = request.timeout
            && timeout.is_zero()
        {
            return Err(AnalysisError::new(
                AnalysisErrorKind::InvalidInput,
                "timeout must be greater than zero when provided",
            )
            .for_category(request.category));
        }

        let Some(guard) = self.gate.try_acquire(request.category) else {
            tracing::info!(category = %request.category, "analysis rejected, category busy");
            return Ok(StartOutcome::Busy);
        };

        let task_id = request.task_id.clone().unwrap_or_else(TaskId::generate);
        self.store.begin(&task_id, request.category);

        let handle = Arc::new(RunningHandle::new());
        self.lock_running().insert(task_id.clone(), handle.clone());

        tracing::info!(
            task_id = %task_id,
            category = %request.category,
            program = %request.command.program.display(),
            "analysis started"
        );

        let runtime = self.clone();
        let driver_task_id = task_id.clone();
        tokio::spawn(async move {
            runtime.drive(guard, driver_task_id, handle, request).await;
        });

        Ok(StartOutcome::Started(task_id))
    }

    pub fn status(&self, task_id: &TaskId) -> Option<TaskSnapshot> {
        self.store.get(task_id)
    }

    /// Forcibly terminate a running task's process group. A no-op for a
    /// task already in a terminal state; an error for an unknown id.
    pub fn cancel(&self, task_id: &TaskId) -> Result<(), AnalysisError> {
        let state = self.store.state(task_id).ok_or_else(|| {
            AnalysisError::new(
                AnalysisErrorKind::InvalidInput,
                format!("unknown task id '{task_id}'"),
            )
        })?;

        if state.is_terminal() {
            return Ok(());
        }

        let handle = self.lock_running().get(task_id).cloned();
        if let Some(handle) = handle {
            handle.cancelled.store(true, Ordering::SeqCst);
            if let Some(process) = handle.process() {
                process.terminate(ProcessTerminationMode::Immediate)?;
            }
            tracing::info!(task_id = %task_id, "cancellation requested, process group signalled");
        }

        Ok(())
    }

    /// Poll the store until the task reaches a terminal state. Convenience
    /// for callers that want to block instead of polling over the wire.
    pub async fn wait_for_terminal(
        &self,
        task_id: &TaskId,
        deadline: Duration,
    ) -> Result<TaskSnapshot, AnalysisError> {
        let poll_interval = Duration::from_millis(25);
        let attempt = async {
            loop {
                if let Some(snapshot) = self.store.get(task_id)
                    && snapshot.state.is_terminal()
                {
                    return snapshot;
                }
                tokio::time::sleep(poll_interval).await;
            }
        };

        tokio::time::timeout(deadline, attempt).await.map_err(|_| {
            AnalysisError::new(
                AnalysisErrorKind::Timeout,
                format!("timed out waiting for task '{task_id}' to reach a terminal state"),
            )
            .for_task(task_id.clone())
        })
    }

    async fn drive(
        &self,
        guard: FlightGuard,
        task_id: TaskId,
        handle: Arc<RunningHandle>,
        request: AnalysisRequest,
    ) {
        // Held for the whole run; drop on any exit path below releases the
        // category gate exactly once.
        let _guard = guard;
        let category = request.category;

        let outcome = self.run_process(&task_id, &handle, request).await;

        match outcome {
            Ok(result) => {
                self.store.complete(&task_id, result);
                tracing::info!(task_id = %task_id, category = %category, "analysis completed");
            }
            Err(error) if error.kind == AnalysisErrorKind::Cancelled => {
                self.store.cancel(&task_id);
                tracing::info!(task_id = %task_id, category = %category, "analysis cancelled");
            }
            Err(error) => {
                self.store.fail(&task_id, error.message.clone());
                tracing::error!(
                    task_id = %task_id,
                    category = %category,
                    kind = ?error.kind,
                    message = %error.message,
                    "analysis failed"
                );
            }
        }

        self.lock_running().remove(&task_id);
    }

    async fn run_process(
        &self,
        task_id: &TaskId,
        handle: &RunningHandle,
        request: AnalysisRequest,
    ) -> Result<serde_json::Value, AnalysisError> {
        let category = request.category;
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let spawn_request = ProcessSpawnRequest::new(category, request.command)
            .task_id(task_id.clone())
            .timeout(timeout);

        let sink: Arc<dyn LineSink> = Arc::new(StoreLineSink {
            store: self.store.clone(),
            task_id: task_id.clone(),
        });

        let process = spawn_validated(self.executor.as_ref(), spawn_request, sink)
            .map_err(|error| error.attribute(category, task_id))?;
        handle.set_process(process.clone());

        // Cancellation requested between registration and spawn: the flag
        // was set before we had a process to signal.
        if handle.is_cancelled() {
            let _ = process.terminate(ProcessTerminationMode::Immediate);
        }

        let output = process.wait().await.map_err(|error| {
            if handle.is_cancelled() {
                cancelled(task_id)
            } else {
                error.attribute(category, task_id)
            }
        })?;

        if handle.is_cancelled() {
            return Err(cancelled(task_id));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        match output.status {
            ProcessExitStatus::Terminated => Err(AnalysisError::new(
                AnalysisErrorKind::NonZeroExit,
                "process was terminated by a signal before completing",
            )
            .attribute(category, task_id)),
            ProcessExitStatus::ExitCode(code) if code != 0 => {
                // The scripts usually leave a structured error object at the
                // tail of one of the streams; each stream is scanned on its
                // own so noise on the other cannot hide it. Fall back to the
                // raw tail.
                let message = [stderr.as_str(), stdout.as_str()]
                    .into_iter()
                    .find_map(|text| {
                        let value = extract_trailing_json(text)?;
                        error_message(&value).map(str::to_string)
                    })
                    .unwrap_or_else(|| {
                        format!(
                            "process exited with code {code}: {}",
                            tail_snippet(&format!("{stdout}\n{stderr}"), FAILURE_TAIL_CHARS)
                        )
                    });
                Err(AnalysisError::new(AnalysisErrorKind::NonZeroExit, message)
                    .attribute(category, task_id))
            }
            ProcessExitStatus::ExitCode(_) => self
                .evaluate_success_output(&stdout)
                .map_err(|error| error.attribute(category, task_id)),
        }
    }

    /// Exit code zero is not success by itself: the output must be
    /// non-empty, parseable, and free of an embedded error object.
    fn evaluate_success_output(&self, stdout: &str) -> Result<serde_json::Value, AnalysisError> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Err(AnalysisError::new(
                AnalysisErrorKind::MalformedOutput,
                "process exited successfully but produced no output",
            ));
        }

        let value = serde_json::from_str::<serde_json::Value>(trimmed)
            .ok()
            .or_else(|| extract_trailing_json(stdout))
            .ok_or_else(|| {
                AnalysisError::new(
                    AnalysisErrorKind::MalformedOutput,
                    format!(
                        "process output is not a structured result: {}",
                        tail_snippet(stdout, FAILURE_TAIL_CHARS)
                    ),
                )
            })?;

        if let Some(message) = error_message(&value) {
            return Err(AnalysisError::new(
                AnalysisErrorKind::ToolError,
                message.to_string(),
            ));
        }

        Ok(value)
    }

    fn lock_running(&self) -> MutexGuard<'_, HashMap<TaskId, Arc<RunningHandle>>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn cancelled(task_id: &TaskId) -> AnalysisError {
    AnalysisError::new(
        AnalysisErrorKind::Cancelled,
        "task cancelled by caller",
    )
    .for_task(task_id.clone())
}

/// Streams every output line into the status store: progress markers update
/// the live percentage and counters, and the raw line is always appended to
/// the bounded task log.
struct StoreLineSink {
    store: Arc<TaskStatusStore>,
    task_id: TaskId,
}

impl LineSink for StoreLineSink {
    fn on_line(&self, stream: StreamKind, line: &str) {
        tracing::debug!(task_id = %self.task_id, stream = ?stream, "{line}");
        if let LineEvent::Progress(update) = parse_line(line) {
            self.store.apply_progress(&self.task_id, &update);
        }
        self.store.append_log(&self.task_id, line);
    }
}
