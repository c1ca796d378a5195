//! 计划执行器
//!
//! 对外入口：接收规划器产出的 ExecutionPlan，步骤之间串行、步骤内并行，
//! 汇总成以工具名为键的结果表。失败的调用同样出现在结果表里（is_system_error = true）。

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::{CallId, OrchestrationError};
use crate::workflow::engine::ExecutionEngine;
use crate::workflow::types::*;
use crate::workflow::OrchestrationContext;

/// 规划器产出的执行计划
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
}

/// 计划步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tool_calls: Vec<PlannedCall>,
}

/// 计划中的一次调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedCall {
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
}

impl PlannedCall {
    pub fn new(tool_name: impl Into<String>, args: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            args,
        }
    }
}

impl ExecutionPlan {
    /// 结构校验：步骤 ID 非空且唯一，工具名非空
    pub fn validate(&self) -> Result<(), OrchestrationError> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(OrchestrationError::MalformedPlan {
                    message: "step with empty id".to_string(),
                });
            }
            if !seen.insert(step.id.as_str()) {
                return Err(OrchestrationError::MalformedPlan {
                    message: format!("duplicate step id {}", step.id),
                });
            }
            if let Some(call) = step.tool_calls.iter().find(|c| c.tool_name.trim().is_empty()) {
                return Err(OrchestrationError::MalformedPlan {
                    message: format!("step {} has a call with empty tool name (args: {})", step.id, call.args),
                });
            }
        }
        Ok(())
    }

    /// 计划中出现的工具名（按首次出现顺序去重）
    pub fn tool_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .flat_map(|s| s.tool_calls.iter())
            .filter(|c| seen.insert(c.tool_name.as_str()))
            .map(|c| c.tool_name.clone())
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.steps.iter().map(|s| s.tool_calls.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_calls() == 0
    }
}

/// 单个工具调用的汇总结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutcome {
    pub tool_name: String,
    pub call_id: CallId,
    pub step_id: String,
    pub status: CallStatus,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// 调用失败（非跳过）
    pub is_system_error: bool,
    pub from_cache: bool,
    pub used_stale: bool,
    pub used_fallback: bool,
    pub retries: u32,
}

impl ToolOutcome {
    fn from_call(step_id: &str, call: &ToolCall) -> Self {
        let error = match call.status {
            CallStatus::Skipped => call.skip_reason.clone(),
            _ => call.error.as_ref().map(ToString::to_string),
        };
        Self {
            tool_name: call.tool_name.clone(),
            call_id: call.id.clone(),
            step_id: step_id.to_string(),
            status: call.status,
            success: call.status == CallStatus::Completed,
            result: call.result.clone(),
            error,
            is_system_error: call.status == CallStatus::Failed,
            from_cache: call.from_cache,
            used_stale: call.used_stale,
            used_fallback: call.used_fallback,
            retries: call.retries,
        }
    }
}

/// 单个步骤的引擎报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub step_id: String,
    pub report: ExecutionReport,
}

/// 整个计划的汇总结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOutcome {
    /// 工具名 -> 结果；同名工具的后续调用记为 `name#2`、`name#3`
    pub results: BTreeMap<String, ToolOutcome>,
    pub steps: Vec<StepReport>,
    pub used_cached_data: bool,
    pub used_stale_data: bool,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl PlanOutcome {
    fn aggregate(steps: Vec<StepReport>, cancelled: bool, elapsed: Duration) -> Self {
        let mut results = BTreeMap::new();
        for step in &steps {
            for call in &step.report.calls {
                let mut key = call.tool_name.clone();
                let mut n = 1;
                while results.contains_key(&key) {
                    n += 1;
                    key = format!("{}#{}", call.tool_name, n);
                }
                results.insert(key, ToolOutcome::from_call(&step.step_id, call));
            }
        }
        let used_cached_data = steps.iter().any(|s| s.report.used_cached_data);
        let used_stale_data = steps.iter().any(|s| s.report.used_stale_data);
        let cancelled = cancelled || steps.iter().any(|s| s.report.cancelled);

        Self {
            results,
            steps,
            used_cached_data,
            used_stale_data,
            cancelled,
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    /// 成功完成的结果键
    pub fn executed_tools(&self) -> Vec<&str> {
        self.keys_where(|o| o.success)
    }

    pub fn failed_tools(&self) -> Vec<&str> {
        self.keys_where(|o| o.is_system_error)
    }

    pub fn skipped_tools(&self) -> Vec<&str> {
        self.keys_where(|o| o.status == CallStatus::Skipped)
    }

    fn keys_where(&self, pred: impl Fn(&ToolOutcome) -> bool) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, o)| pred(o))
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// 实际执行过的工具名（去重），供意图校验使用
    pub fn tool_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.results
            .values()
            .filter(|o| o.status != CallStatus::Skipped)
            .filter(|o| seen.insert(o.tool_name.as_str()))
            .map(|o| o.tool_name.clone())
            .collect()
    }

    pub fn is_complete_success(&self) -> bool {
        !self.cancelled && self.results.values().all(|o| o.success)
    }
}

/// 计划执行器
pub struct PlanExecutor {
    engine: Arc<ExecutionEngine>,
    /// 步骤内是否按工具声明的依赖分阶段
    dependency_aware: bool,
    /// 合成进度刷新间隔；None 时不启动刷新任务
    progress_tick: Option<Duration>,
}

impl PlanExecutor {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self {
            engine,
            dependency_aware: true,
            progress_tick: Some(Duration::from_millis(500)),
        }
    }

    pub fn with_dependency_aware(mut self, enabled: bool) -> Self {
        self.dependency_aware = enabled;
        self
    }

    pub fn with_progress_tick(mut self, interval: Option<Duration>) -> Self {
        self.progress_tick = interval;
        self
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub async fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        ctx: &mut OrchestrationContext,
        cancel: &CancellationToken,
    ) -> Result<PlanOutcome, OrchestrationError> {
        plan.validate()?;
        let started = Instant::now();

        let mut pending: Vec<(String, Vec<ToolCall>)> = plan
            .steps
            .iter()
            .map(|step| {
                let calls = step
                    .tool_calls
                    .iter()
                    .map(|c| ToolCall::new(c.tool_name.clone(), c.args.clone()))
                    .collect();
                (step.id.clone(), calls)
            })
            .collect();

        // 依赖环在任何执行之前发现
        if self.dependency_aware {
            for (step_id, calls) in &pending {
                if let Err(e) = self.engine.plan_phases(calls, ctx) {
                    warn!(step_id = %step_id, error = %e, "Plan rejected before execution");
                    return Err(e);
                }
            }
        }

        let tracker = ctx.progress.clone();
        if let Some(tracker) = &tracker {
            tracker.register_calls(
                pending
                    .iter()
                    .flat_map(|(_, calls)| calls.iter())
                    .map(|c| (c.id.clone(), c.tool_name.clone())),
            );
        }
        let ticker_cancel = cancel.child_token();
        let ticker = match (&tracker, self.progress_tick) {
            (Some(tracker), Some(interval)) => Some(tracker.spawn_ticker(interval, ticker_cancel.clone())),
            _ => None,
        };

        info!(
            user_id = %ctx.user_id,
            session_id = %ctx.session_id,
            steps = plan.steps.len(),
            calls = plan.total_calls(),
            dependency_aware = self.dependency_aware,
            "Executing plan"
        );

        let mut reports = Vec::with_capacity(pending.len());
        let mut stopped_early = false;
        let mut failure = None;
        for (index, (step_id, calls)) in pending.drain(..).enumerate() {
            if index > 0 {
                tokio::task::yield_now().await;
            }
            if cancel.is_cancelled() {
                stopped_early = true;
                reports.push(StepReport {
                    report: cancelled_step(calls, ctx),
                    step_id,
                });
                continue;
            }

            let run = if self.dependency_aware {
                self.engine.execute(calls, ctx, cancel).await
            } else {
                self.engine.execute_flat(calls, ctx, cancel).await
            };
            match run {
                Ok(report) => reports.push(StepReport { step_id, report }),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        ticker_cancel.cancel();
        if let Some(handle) = ticker {
            let _ = handle.await;
        }
        if let Some(tracker) = &tracker {
            tracker.finish();
        }
        if let Some(e) = failure {
            warn!(
                error = %e,
                kind = e.kind(),
                fatal = e.is_run_fatal(),
                completed_steps = reports.len(),
                "Plan aborted"
            );
            return Err(e);
        }

        let outcome = PlanOutcome::aggregate(reports, stopped_early, started.elapsed());
        info!(
            executed = outcome.executed_tools().len(),
            failed = outcome.failed_tools().len(),
            skipped = outcome.skipped_tools().len(),
            used_cached_data = outcome.used_cached_data,
            used_stale_data = outcome.used_stale_data,
            cancelled = outcome.cancelled,
            duration_ms = outcome.duration_ms,
            "Plan finished"
        );
        Ok(outcome)
    }
}

/// 取消后未启动的步骤：全部记为跳过
fn cancelled_step(mut calls: Vec<ToolCall>, ctx: &OrchestrationContext) -> ExecutionReport {
    for call in &mut calls {
        call.skip(CANCELLED_REASON);
        if let Some(tracker) = ctx.progress() {
            tracker.tool_skipped(&call.id, CANCELLED_REASON);
        }
    }
    ExecutionReport::new(
        format!("run_{}", uuid::Uuid::new_v4()),
        calls,
        Vec::new(),
        true,
        Duration::ZERO,
    )
}
