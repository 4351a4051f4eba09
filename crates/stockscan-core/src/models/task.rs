use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::ResourceCategory;

/// Opaque task identifier. Callers may supply their own; otherwise one is
/// generated per invocation.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub line: String,
}

/// Clone-out view of one task record, as returned to polling callers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub category: Option<ResourceCategory>,
    pub state: TaskState,
    pub progress_pct: f64,
    pub progress_message: Option<String>,
    pub counters: BTreeMap<String, u64>,
    pub logs: Vec<LogEntry>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub updated_at: SystemTime,
}
