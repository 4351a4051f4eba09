pub mod category;
pub mod error;
pub mod task;

pub use category::ResourceCategory;
pub use error::{AnalysisError, AnalysisErrorKind};
pub use task::{LogEntry, TaskId, TaskSnapshot, TaskState};
