pub mod runtime;

pub use runtime::AnalysisRuntime;

use std::time::Duration;

use crate::execution::CommandSpec;
use crate::models::{ResourceCategory, TaskId};

/// One request to run an external analysis to completion.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AnalysisRequest {
    pub category: ResourceCategory,
    pub command: CommandSpec,
    pub task_id: Option<TaskId>,
    pub timeout: Option<Duration>,
}

impl AnalysisRequest {
    pub fn new(category: ResourceCategory, command: CommandSpec) -> Self {
        Self {
            category,
            command,
            task_id: None,
            timeout: None,
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
}

/// `Busy` is expected control flow, not an error: the category's gate is
/// held and the caller should retry later instead of queueing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StartOutcome {
    Started(TaskId),
    Busy,
}

#[derive(Clone, Copy, Debug)]
pub struct RuntimeConfig {
    /// Wall-clock deadline applied when a request does not carry its own.
    pub default_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(180),
        }
    }
}
