//! 核心层：错误分类、重试退避策略、运行级调度闸门

pub mod error;
pub mod recovery;
pub mod task_scheduler;

pub use error::{CallId, OrchestrationError, ToolError};
pub use recovery::{is_retryable, RetryPolicy};
pub use task_scheduler::TaskScheduler;
