//! 进度事件：供 UI 订阅展示工具生命周期与整体进度

use serde::Serialize;

use crate::core::CallId;
use crate::progress::ExecutionProgress;

/// 单个进度事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProgressEvent {
    /// 首次登记工具调用
    ExecutionStarted { total_tools: usize },
    /// 新阶段开始（phase 从 1 开始计数）
    PhaseStarted {
        phase: usize,
        total_phases: usize,
        call_ids: Vec<CallId>,
    },
    ToolStarted { call_id: CallId, tool_name: String },
    /// 显式上报或按耗时估算的进度
    ToolProgress {
        call_id: CallId,
        tool_name: String,
        progress: f64,
        message: Option<String>,
        overall_progress: f64,
    },
    ToolCompleted {
        call_id: CallId,
        tool_name: String,
        from_cache: bool,
        duration_ms: Option<u64>,
    },
    ToolFailed {
        call_id: CallId,
        tool_name: String,
        error: String,
    },
    ToolSkipped {
        call_id: CallId,
        tool_name: String,
        reason: String,
    },
    ExecutionComplete { progress: ExecutionProgress },
}

impl ProgressEvent {
    /// 事件类型名（与序列化后的 type 字段一致）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution-started",
            Self::PhaseStarted { .. } => "phase-started",
            Self::ToolStarted { .. } => "tool-started",
            Self::ToolProgress { .. } => "tool-progress",
            Self::ToolCompleted { .. } => "tool-completed",
            Self::ToolFailed { .. } => "tool-failed",
            Self::ToolSkipped { .. } => "tool-skipped",
            Self::ExecutionComplete { .. } => "execution-complete",
        }
    }
}
