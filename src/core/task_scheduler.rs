//! 单次运行的调度闸门：并发许可 + 协作式取消
//!
//! 每次运行创建一个 TaskScheduler，阶段内的工具调用先取许可再启动；
//! 等待许可时取消会立即返回，已在执行的调用不会被打断。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::OrchestrationError;

/// 运行级调度器
pub struct TaskScheduler {
    /// 工具并发限制（默认 5）
    tool_semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    cancel: CancellationToken,
}

impl TaskScheduler {
    pub fn new(max_concurrency: usize, cancel: CancellationToken) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            tool_semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            cancel,
        }
    }

    /// 获取工具执行许可；等待期间取消则返回 Cancelled
    pub async fn acquire_tool(&self) -> Result<OwnedSemaphorePermit, OrchestrationError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(OrchestrationError::Cancelled),
            permit = self.tool_semaphore.clone().acquire_owned() => {
                permit.map_err(|_| OrchestrationError::Cancelled)
            }
        }
    }

    /// 检查是否应取消
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn available_permits(&self) -> usize {
        self.tool_semaphore.available_permits()
    }
}
