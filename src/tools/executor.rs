//! 工具执行器
//!
//! 对单次工具调用施加超时，超时转为 OrchestrationError::Timeout，工具返回 Err 则原样交给重试判定；
//! 每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::ToolError;
use crate::tools::Tool;
use crate::workflow::OrchestrationContext;

/// 单次尝试的结果
#[derive(Debug)]
pub enum Attempt {
    Ok(Value),
    Failed(ToolError),
    TimedOut { timeout_ms: u64 },
}

/// 工具执行器：持有默认超时，工具自带 timeout 时优先使用工具的
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    default_timeout: Option<Duration>,
}

impl ToolExecutor {
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self { default_timeout }
    }

    /// 执行一次（不含重试）；输出 JSON 审计日志
    pub async fn invoke(
        &self,
        tool: &dyn Tool,
        input: &Value,
        ctx: &OrchestrationContext,
        attempt: u32,
    ) -> Attempt {
        let start = Instant::now();
        let limit = tool.timeout().or(self.default_timeout);

        let outcome = match limit {
            Some(limit) => match timeout(limit, tool.execute(input, ctx)).await {
                Ok(Ok(value)) => Attempt::Ok(value),
                Ok(Err(e)) => Attempt::Failed(e),
                Err(_) => Attempt::TimedOut {
                    timeout_ms: limit.as_millis() as u64,
                },
            },
            None => match tool.execute(input, ctx).await {
                Ok(value) => Attempt::Ok(value),
                Err(e) => Attempt::Failed(e),
            },
        };

        let (ok, label): (bool, &str) = match &outcome {
            Attempt::Ok(_) => (true, "ok"),
            Attempt::Failed(_) => (false, "error"),
            Attempt::TimedOut { .. } => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool.name(),
            "user_id": ctx.user_id,
            "session_id": ctx.session_id,
            "attempt": attempt,
            "ok": ok,
            "outcome": label,
            "duration_ms": start.elapsed().as_millis() as u64,
            "input_preview": input_preview(input),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        outcome
    }
}

fn input_preview(input: &Value) -> String {
    let s = input.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
