use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use crate::models::{LogEntry, ResourceCategory, TaskId, TaskSnapshot, TaskState};
use crate::progress::ProgressUpdate;

const MAX_LOG_LINES: usize = 3000;
const LOG_TRIM_CHUNK: usize = 1000;

/// Process-wide task status map, polled by callers and mutated live by the
/// orchestration layer. One instance per application; constructed explicitly
/// and shared via `Arc` rather than ambient statics.
#[derive(Default)]
pub struct TaskStatusStore {
    inner: Mutex<HashMap<TaskId, TaskEntry>>,
}

struct TaskEntry {
    category: Option<ResourceCategory>,
    state: TaskState,
    result: Option<serde_json::Value>,
    error: Option<String>,
    progress_pct: f64,
    progress_message: Option<String>,
    counters: BTreeMap<String, u64>,
    logs: VecDeque<LogEntry>,
    log_seq: u64,
    updated_at: SystemTime,
}

impl TaskEntry {
    fn new(category: Option<ResourceCategory>, state: TaskState) -> Self {
        Self {
            category,
            state,
            result: None,
            error: None,
            progress_pct: 0.0,
            progress_message: None,
            counters: BTreeMap::new(),
            logs: VecDeque::new(),
            log_seq: 0,
            updated_at: SystemTime::now(),
        }
    }

    fn push_log(&mut self, line: String) {
        self.log_seq += 1;
        self.logs.push_back(LogEntry {
            seq: self.log_seq,
            line,
        });
        if self.logs.len() > MAX_LOG_LINES {
            self.logs.drain(..LOG_TRIM_CHUNK);
        }
    }
}

impl TaskStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the start of a run. Upserts so that log lines which raced
    /// ahead of registration are preserved.
    pub fn begin(&self, task_id: &TaskId, category: ResourceCategory) {
        let mut tasks = self.lock();
        let entry = tasks
            .entry(task_id.clone())
            .or_insert_with(|| TaskEntry::new(Some(category), TaskState::InProgress));
        entry.category = Some(category);
        entry.state = TaskState::InProgress;
        entry.updated_at = SystemTime::now();
    }

    pub fn complete(&self, task_id: &TaskId, result: serde_json::Value) {
        self.finish(task_id, TaskState::Completed, Some(result), None);
    }

    pub fn fail(&self, task_id: &TaskId, message: impl Into<String>) {
        self.finish(task_id, TaskState::Failed, None, Some(message.into()));
    }

    pub fn cancel(&self, task_id: &TaskId) {
        self.finish(task_id, TaskState::Cancelled, None, None);
    }

    fn finish(
        &self,
        task_id: &TaskId,
        state: TaskState,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        let mut tasks = self.lock();
        let entry = tasks
            .entry(task_id.clone())
            .or_insert_with(|| TaskEntry::new(None, state));
        entry.state = state;
        entry.result = result;
        entry.error = error;
        entry.updated_at = SystemTime::now();
    }

    pub fn get(&self, task_id: &TaskId) -> Option<TaskSnapshot> {
        let tasks = self.lock();
        tasks.get(task_id).map(|entry| TaskSnapshot {
            id: task_id.clone(),
            category: entry.category,
            state: entry.state,
            progress_pct: entry.progress_pct,
            progress_message: entry.progress_message.clone(),
            counters: entry.counters.clone(),
            logs: entry.logs.iter().cloned().collect(),
            result: entry.result.clone(),
            error: entry.error.clone(),
            updated_at: entry.updated_at,
        })
    }

    pub fn state(&self, task_id: &TaskId) -> Option<TaskState> {
        self.lock().get(task_id).map(|entry| entry.state)
    }

    /// Append one output line. A racing log line for a task that has not
    /// been registered yet creates an in-progress placeholder instead of
    /// faulting.
    pub fn append_log(&self, task_id: &TaskId, line: impl Into<String>) {
        let mut tasks = self.lock();
        let entry = tasks
            .entry(task_id.clone())
            .or_insert_with(|| TaskEntry::new(None, TaskState::InProgress));
        entry.push_log(line.into());
        entry.updated_at = SystemTime::now();
    }

    /// Fold a parsed progress update into the record. The displayed
    /// percentage and each named counter only ever move forward: a late or
    /// out-of-order lower value never regresses what a poller has seen.
    pub fn apply_progress(&self, task_id: &TaskId, update: &ProgressUpdate) {
        let mut tasks = self.lock();
        let entry = tasks
            .entry(task_id.clone())
            .or_insert_with(|| TaskEntry::new(None, TaskState::InProgress));
        entry.progress_pct = entry.progress_pct.max(update.pct);
        entry.progress_message = Some(update.message.clone());
        for (name, value) in &update.counters {
            let slot = entry.counters.entry(name.clone()).or_insert(0);
            *slot = (*slot).max(*value);
        }
        entry.updated_at = SystemTime::now();
    }

    pub fn remove(&self, task_id: &TaskId) -> bool {
        self.lock().remove(task_id).is_some()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, TaskEntry>> {
        // Each record is updated under the map mutex in one shot, so a
        // poisoned guard still holds per-task-consistent data.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
