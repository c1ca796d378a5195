//! 编排类型定义
//!
//! 工具调用、调用状态、执行阶段与单次运行的聚合结果

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{CallId, OrchestrationError};

/// 取消导致跳过时记录的原因
pub const CANCELLED_REASON: &str = "cancelled";

/// 调用状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// 等待依赖满足
    Pending,
    /// 正在执行
    Running,
    /// 已完成（含缓存命中、兜底结果、陈旧数据）
    Completed,
    /// 失败
    Failed,
    /// 跳过（shouldExecute 为 false、依赖失败或已取消）
    Skipped,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// 一次工具调用
#[derive(Debug, Clone, Serialize)]
pub struct ToolCall {
    pub id: CallId,
    pub tool_name: String,
    pub input: Value,
    pub status: CallStatus,
    pub result: Option<Value>,
    /// 失败原因；降级完成（兜底 / 陈旧数据）时保留原始失败
    pub error: Option<OrchestrationError>,
    pub skip_reason: Option<String>,
    /// 实际执行次数（含首次）
    pub attempts: u32,
    pub retries: u32,
    pub from_cache: bool,
    pub used_stale: bool,
    pub used_fallback: bool,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, input: Value) -> Self {
        Self::with_id(format!("call_{}", uuid::Uuid::new_v4()), tool_name, input)
    }

    pub fn with_id(id: impl Into<CallId>, tool_name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            input,
            status: CallStatus::Pending,
            result: None,
            error: None,
            skip_reason: None,
            attempts: 0,
            retries: 0,
            from_cache: false,
            used_stale: false,
            used_fallback: false,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = CallStatus::Running;
        self.started_at = Some(chrono::Utc::now().timestamp_millis());
    }

    pub fn complete(&mut self, value: Value) {
        self.status = CallStatus::Completed;
        self.result = Some(value);
        self.completed_at = Some(chrono::Utc::now().timestamp_millis());
    }

    pub fn fail(&mut self, error: OrchestrationError) {
        self.status = CallStatus::Failed;
        self.result = None;
        self.error = Some(error);
        self.completed_at = Some(chrono::Utc::now().timestamp_millis());
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = CallStatus::Skipped;
        self.result = None;
        self.skip_reason = Some(reason.into());
        self.completed_at = Some(chrono::Utc::now().timestamp_millis());
    }

    /// 是否因取消被跳过
    pub fn was_cancelled(&self) -> bool {
        self.status == CallStatus::Skipped && self.skip_reason.as_deref() == Some(CANCELLED_REASON)
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) if end >= start => Some((end - start) as u64),
            _ => None,
        }
    }
}

/// 执行阶段：依赖均已满足、可并发执行的一批调用
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPhase {
    /// 从 0 开始
    pub index: usize,
    pub call_ids: Vec<CallId>,
}

/// 单次引擎运行的聚合结果
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub run_id: String,
    /// 按提交顺序
    pub calls: Vec<ToolCall>,
    pub phases: Vec<ExecutionPhase>,
    pub succeeded: Vec<CallId>,
    pub failed: Vec<CallId>,
    pub skipped: Vec<CallId>,
    /// 有结果来自新鲜缓存
    pub used_cached_data: bool,
    /// 有结果来自过期缓存（降级）
    pub used_stale_data: bool,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl ExecutionReport {
    pub fn new(
        run_id: String,
        calls: Vec<ToolCall>,
        phases: Vec<ExecutionPhase>,
        cancelled: bool,
        elapsed: Duration,
    ) -> Self {
        let ids_with = |status: CallStatus| -> Vec<CallId> {
            calls
                .iter()
                .filter(|c| c.status == status)
                .map(|c| c.id.clone())
                .collect()
        };
        let succeeded = ids_with(CallStatus::Completed);
        let failed = ids_with(CallStatus::Failed);
        let skipped = ids_with(CallStatus::Skipped);
        let used_cached_data = calls.iter().any(|c| c.from_cache);
        let used_stale_data = calls.iter().any(|c| c.used_stale);
        let cancelled = cancelled || calls.iter().any(ToolCall::was_cancelled);

        Self {
            run_id,
            calls,
            phases,
            succeeded,
            failed,
            skipped,
            used_cached_data,
            used_stale_data,
            cancelled,
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn call(&self, id: &str) -> Option<&ToolCall> {
        self.calls.iter().find(|c| c.id == id)
    }

    /// 指定工具最后一个成功调用的结果
    pub fn result_for(&self, tool_name: &str) -> Option<&Value> {
        self.calls
            .iter()
            .rev()
            .filter(|c| c.tool_name == tool_name && c.status == CallStatus::Completed)
            .find_map(|c| c.result.as_ref())
    }

    /// 调用所在阶段下标
    pub fn phase_of(&self, id: &str) -> Option<usize> {
        self.phases
            .iter()
            .find(|p| p.call_ids.iter().any(|c| c == id))
            .map(|p| p.index)
    }
}
