//! Echo 工具（演示与测试用）

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::ToolError;
use crate::tools::Tool;
use crate::workflow::OrchestrationContext;

/// Echo 工具：回显 text 字段；可选 delay_ms 模拟耗时调用
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text (for testing). Args: {\"text\": \"message\", \"delay_ms\": 0}"
    }

    fn validate_input(&self, input: &Value) -> bool {
        input.is_object()
    }

    fn cache_key(&self, input: &Value, _ctx: &OrchestrationContext) -> Option<String> {
        input
            .get("text")
            .and_then(|v| v.as_str())
            .map(|text| format!("echo:{text}"))
    }

    async fn execute(&self, input: &Value, ctx: &OrchestrationContext) -> Result<Value, ToolError> {
        if let Some(delay) = input.get("delay_ms").and_then(|v| v.as_u64()) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let text = input
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        Ok(json!({
            "text": text,
            "userId": ctx.user_id,
        }))
    }
}
