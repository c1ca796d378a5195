//! 编排错误类型
//!
//! 结构性错误（依赖环、计划格式错误）终止整次运行；工具级错误只记录在对应的 ToolCall 上，
//! 由聚合结果向上游汇报，不会作为 Err 抛给调用方。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 调用 ID（单次运行内唯一）
pub type CallId = String;

/// 编排过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrchestrationError {
    /// 规划阶段失败（发生在本引擎上游）
    #[error("Planning failed: {message}")]
    Planning { message: String },

    #[error("Malformed plan: {message}")]
    MalformedPlan { message: String },

    /// 依赖图存在环，整次运行在执行前终止
    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<CallId> },

    #[error("Tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("Invalid input for tool {tool}")]
    Validation { tool: String },

    #[error("Tool {tool} failed: {message}")]
    Execution {
        tool: String,
        message: String,
        code: Option<String>,
        retryable: bool,
    },

    /// 执行超时（ExecutionError 的一种）
    #[error("Tool {tool} timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// 结果超出内存上限，结果已丢弃
    #[error("Result of tool {tool} exceeds memory limit ({size} > {limit} bytes)")]
    MemoryLimit { tool: String, size: usize, limit: usize },

    #[error("Execution cancelled")]
    Cancelled,
}

impl OrchestrationError {
    /// 是否终止整次运行（只有结构性错误才会）
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            Self::Planning { .. } | Self::MalformedPlan { .. } | Self::DependencyCycle { .. }
        )
    }

    /// 错误类别名，用于日志与聚合结果
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Planning { .. } => "planning",
            Self::MalformedPlan { .. } => "malformed_plan",
            Self::DependencyCycle { .. } => "dependency_cycle",
            Self::ToolNotFound { .. } => "tool_not_found",
            Self::Validation { .. } => "validation",
            Self::Execution { .. } => "execution",
            Self::Timeout { .. } => "timeout",
            Self::MemoryLimit { .. } => "memory_limit",
            Self::Cancelled => "cancelled",
        }
    }
}

/// 工具执行失败时返回的错误
///
/// `retryable` 为显式的可重试标记；为 None 时由 [`crate::core::recovery::is_retryable`]
/// 按错误码与消息特征判定。
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ToolError {
    pub message: String,
    pub code: Option<String>,
    pub retryable: Option<bool>,
}

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    /// 超时错误统一转成的 ToolError（供 on_error 回调使用）
    pub fn timeout(tool: &str, timeout_ms: u64) -> Self {
        Self::new(format!("Tool {tool} timed out after {timeout_ms}ms"))
            .with_code("TIMEOUT")
            .retryable(true)
    }

    /// 转为调用级错误
    pub fn into_orchestration_error(self, tool: &str, retryable: bool) -> OrchestrationError {
        OrchestrationError::Execution {
            tool: tool.to_string(),
            message: self.message,
            code: self.code,
            retryable,
        }
    }
}
