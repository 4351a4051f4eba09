use thiserror::Error;

use crate::models::{ResourceCategory, TaskId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AnalysisErrorKind {
    InvalidInput,
    Spawn,
    Timeout,
    NonZeroExit,
    ToolError,
    MalformedOutput,
    StreamRead,
    Cancelled,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct AnalysisError {
    pub category: Option<ResourceCategory>,
    pub task_id: Option<TaskId>,
    pub kind: AnalysisErrorKind,
    pub message: String,
}

impl AnalysisError {
    pub fn new(kind: AnalysisErrorKind, message: impl Into<String>) -> Self {
        Self {
            category: None,
            task_id: None,
            kind,
            message: message.into(),
        }
    }

    pub fn for_category(mut self, category: ResourceCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Fill in missing attribution without overwriting what the error
    /// already carries.
    pub fn attribute(mut self, category: ResourceCategory, task_id: &TaskId) -> Self {
        self.category = self.category.or(Some(category));
        if self.task_id.is_none() {
            self.task_id = Some(task_id.clone());
        }
        self
    }
}
