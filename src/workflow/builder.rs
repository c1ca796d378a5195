//! 计划构建器
//!
//! 提供流畅的 API 来构建执行计划（规划器之外的调用方、演示与测试使用）

use serde_json::Value;

use crate::core::OrchestrationError;
use crate::workflow::plan::{ExecutionPlan, PlanStep, PlannedCall};

/// 计划构建器
#[derive(Debug, Default)]
pub struct PlanBuilder {
    steps: Vec<PlanStep>,
}

impl PlanBuilder {
    /// 创建新的计划构建器
    pub fn new() -> Self {
        Self::default()
    }

    /// 开始一个新步骤；后续 call 都加入该步骤
    pub fn step(mut self, id: impl Into<String>, description: impl Into<String>) -> Self {
        self.steps.push(PlanStep {
            id: id.into(),
            description: description.into(),
            tool_calls: Vec::new(),
        });
        self
    }

    /// 向当前步骤添加调用；尚无步骤时自动创建 `step_1`
    pub fn call(mut self, tool_name: impl Into<String>, args: Value) -> Self {
        if self.steps.is_empty() {
            self = self.step("step_1", "");
        }
        if let Some(step) = self.steps.last_mut() {
            step.tool_calls.push(PlannedCall::new(tool_name, args));
        }
        self
    }

    /// 每个调用单独成为一个步骤（严格串行）
    pub fn sequential<I, S>(mut self, calls: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        for (tool_name, args) in calls {
            let id = format!("step_{}", self.steps.len() + 1);
            self = self.step(id, "").call(tool_name, args);
        }
        self
    }

    /// 构建计划
    pub fn build(self) -> Result<ExecutionPlan, OrchestrationError> {
        let plan = ExecutionPlan { steps: self.steps };
        plan.validate()?;
        Ok(plan)
    }
}
