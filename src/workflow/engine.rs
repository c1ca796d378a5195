//! 执行引擎
//!
//! 按阶段顺序执行工具调用：阶段内受 max_concurrency 限制并发，阶段间严格串行。
//! 单个调用依次经过 shouldExecute → 缓存 → validateInput → 执行（超时 + 重试退避）→ 兜底 / 陈旧数据 → 结果大小检查。
//! 工具级失败只记录在调用上，不中断整次运行；只有依赖环、计划格式错误这类结构性错误返回 Err。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ToolCache;
use crate::core::{is_retryable, CallId, OrchestrationError, RetryPolicy, TaskScheduler, ToolError};
use crate::tools::{Attempt, Tool, ToolExecutor, ToolRegistry};
use crate::workflow::graph::DependencyGraph;
use crate::workflow::types::*;
use crate::workflow::OrchestrationContext;

/// 引擎配置
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    /// 工具未声明 timeout 时使用
    pub tool_timeout: Option<Duration>,
    /// 单个结果序列化后的字节上限
    pub max_result_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            retry: RetryPolicy::default(),
            tool_timeout: Some(Duration::from_secs(30)),
            max_result_bytes: 5 * 1024 * 1024,
        }
    }
}

/// 执行引擎：进程内共享，跨运行的可变状态只有缓存
pub struct ExecutionEngine {
    registry: Arc<ToolRegistry>,
    cache: Arc<ToolCache>,
    executor: ToolExecutor,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<ToolRegistry>, cache: Arc<ToolCache>, config: EngineConfig) -> Self {
        Self {
            registry,
            cache,
            executor: ToolExecutor::new(config.tool_timeout),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ToolCache> {
        &self.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 只做调度，不执行：校验调用 ID 唯一并计算阶段（存在依赖环时返回 Err）
    pub fn plan_phases(
        &self,
        calls: &[ToolCall],
        ctx: &OrchestrationContext,
    ) -> Result<(DependencyGraph, Vec<ExecutionPhase>), OrchestrationError> {
        ensure_unique_ids(calls)?;
        let graph = DependencyGraph::build(calls, &self.registry, ctx);
        let phases = graph.phases()?;
        Ok((graph, phases))
    }

    /// 按依赖分阶段执行
    pub async fn execute(
        &self,
        calls: Vec<ToolCall>,
        ctx: &mut OrchestrationContext,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, OrchestrationError> {
        let (graph, phases) = match self.plan_phases(&calls, ctx) {
            Ok(planned) => planned,
            Err(e) => {
                warn!(error = %e, kind = e.kind(), calls = calls.len(), "Scheduling failed, nothing executed");
                return Err(e);
            }
        };
        Ok(self.run_phases(calls, phases, Some(&graph), ctx, cancel).await)
    }

    /// 不做依赖分析，所有调用放进同一阶段
    pub async fn execute_flat(
        &self,
        calls: Vec<ToolCall>,
        ctx: &mut OrchestrationContext,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, OrchestrationError> {
        ensure_unique_ids(&calls)?;
        let phases = if calls.is_empty() {
            Vec::new()
        } else {
            vec![ExecutionPhase {
                index: 0,
                call_ids: calls.iter().map(|c| c.id.clone()).collect(),
            }]
        };
        Ok(self.run_phases(calls, phases, None, ctx, cancel).await)
    }

    async fn run_phases(
        &self,
        calls: Vec<ToolCall>,
        phases: Vec<ExecutionPhase>,
        graph: Option<&DependencyGraph>,
        ctx: &mut OrchestrationContext,
        cancel: &CancellationToken,
    ) -> ExecutionReport {
        let run_id = format!("run_{}", uuid::Uuid::new_v4());
        let started = Instant::now();
        let scheduler = TaskScheduler::new(self.config.max_concurrency, cancel.clone());

        let order: Vec<CallId> = calls.iter().map(|c| c.id.clone()).collect();
        if let Some(tracker) = ctx.progress() {
            tracker.register_calls(calls.iter().map(|c| (c.id.clone(), c.tool_name.clone())));
            tracker.add_phases(phases.len());
        }
        let mut slots: HashMap<CallId, ToolCall> = calls.into_iter().map(|c| (c.id.clone(), c)).collect();
        // 调用 ID -> 导致其失败 / 被跳过的根失败调用 (id, 工具名)
        let mut failed_roots: HashMap<CallId, (CallId, String)> = HashMap::new();
        let mut stopped_early = false;

        info!(
            run_id = %run_id,
            user_id = %ctx.user_id,
            session_id = %ctx.session_id,
            calls = order.len(),
            phases = phases.len(),
            max_concurrency = scheduler.max_concurrency(),
            "Starting tool execution"
        );

        for phase in &phases {
            if phase.index > 0 {
                // 阶段之间让出一次，订阅方可在此取消
                tokio::task::yield_now().await;
            }
            if scheduler.is_cancelled() {
                info!(run_id = %run_id, phase = phase.index, "Cancellation requested, not launching remaining phases");
                stopped_early = true;
                break;
            }
            if let Some(tracker) = ctx.progress() {
                tracker.phase_started(&phase.call_ids);
            }
            debug!(
                run_id = %run_id,
                phase = phase.index,
                calls = ?phase.call_ids,
                available_permits = scheduler.available_permits(),
                "Phase started"
            );

            let mut runnable = Vec::with_capacity(phase.call_ids.len());
            for id in &phase.call_ids {
                let Some(mut call) = slots.remove(id) else {
                    continue;
                };
                let blocked_by = graph.and_then(|g| {
                    g.prerequisites_of(id)
                        .iter()
                        .find_map(|dep| failed_roots.get(dep).cloned())
                });
                match blocked_by {
                    Some((root_id, root_tool)) => {
                        call.skip(format!("dependency '{root_tool}' ({root_id}) failed"));
                        report_settled(ctx, &call);
                        failed_roots.insert(call.id.clone(), (root_id, root_tool));
                        slots.insert(call.id.clone(), call);
                    }
                    None => runnable.push(call),
                }
            }

            let settled = {
                let shared: &OrchestrationContext = ctx;
                join_all(
                    runnable
                        .into_iter()
                        .map(|call| self.run_call(call, shared, &scheduler)),
                )
                .await
            };

            for call in settled {
                match call.status {
                    CallStatus::Completed => {
                        if let Some(result) = &call.result {
                            ctx.record_result(&call.tool_name, result.clone());
                        }
                    }
                    CallStatus::Failed => {
                        failed_roots.insert(call.id.clone(), (call.id.clone(), call.tool_name.clone()));
                    }
                    _ => {}
                }
                slots.insert(call.id.clone(), call);
            }
        }

        // 未启动的调用（取消后剩余阶段）
        for id in &order {
            if let Some(call) = slots.get_mut(id) {
                if call.status == CallStatus::Pending {
                    call.skip(CANCELLED_REASON);
                    report_settled(ctx, call);
                }
            }
        }

        let calls: Vec<ToolCall> = order.iter().filter_map(|id| slots.remove(id)).collect();
        let report = ExecutionReport::new(run_id, calls, phases, stopped_early, started.elapsed());
        info!(
            run_id = %report.run_id,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            used_cached_data = report.used_cached_data,
            used_stale_data = report.used_stale_data,
            cancelled = report.cancelled,
            duration_ms = report.duration_ms,
            "Tool execution finished"
        );
        report
    }

    async fn run_call(
        &self,
        mut call: ToolCall,
        ctx: &OrchestrationContext,
        scheduler: &TaskScheduler,
    ) -> ToolCall {
        let permit = scheduler.acquire_tool().await;
        if permit.is_err() || scheduler.is_cancelled() {
            call.skip(CANCELLED_REASON);
            report_settled(ctx, &call);
            return call;
        }

        self.drive_call(&mut call, ctx, scheduler).await;
        drop(permit);

        report_settled(ctx, &call);
        call
    }

    async fn drive_call(&self, call: &mut ToolCall, ctx: &OrchestrationContext, scheduler: &TaskScheduler) {
        let Some(tool) = self.registry.get(&call.tool_name) else {
            warn!(call_id = %call.id, tool = %call.tool_name, "Tool not registered");
            call.fail(OrchestrationError::ToolNotFound {
                tool: call.tool_name.clone(),
            });
            return;
        };

        if !tool.should_execute(&call.input, ctx) {
            debug!(call_id = %call.id, tool = %call.tool_name, "shouldExecute returned false, skipping");
            call.skip("shouldExecute returned false");
            return;
        }

        let cache_key = tool.cache_key(&call.input, ctx);
        if let Some(key) = &cache_key {
            if let Some(value) = self.cache.get(key) {
                debug!(call_id = %call.id, tool = %call.tool_name, cache_key = %key, "Cache hit");
                call.from_cache = true;
                call.complete(value);
                return;
            }
        }

        if !tool.validate_input(&call.input) {
            warn!(call_id = %call.id, tool = %call.tool_name, "Input validation failed");
            call.fail(OrchestrationError::Validation {
                tool: call.tool_name.clone(),
            });
            return;
        }

        call.mark_running();
        if let Some(tracker) = ctx.progress() {
            tracker.tool_started(&call.id);
        }

        let outcome = self.execute_with_retry(tool.as_ref(), call, ctx).await;

        if scheduler.is_cancelled() {
            // 取消后只丢弃成功结果，真实失败照常记录（不再降级）
            match outcome {
                Ok(_) => {
                    info!(call_id = %call.id, tool = %call.tool_name, "Result discarded, execution was cancelled");
                    call.skip(CANCELLED_REASON);
                }
                Err((_, call_error)) => {
                    warn!(call_id = %call.id, tool = %call.tool_name, error = %call_error, "Tool call failed after cancellation");
                    call.fail(call_error);
                }
            }
            return;
        }

        match outcome {
            Ok(value) => self.accept_result(call, value, cache_key.as_deref(), tool.cache_ttl()),
            Err((tool_error, call_error)) => {
                self.degrade(tool.as_ref(), call, tool_error, call_error, cache_key.as_deref(), ctx)
                    .await
            }
        }
    }

    /// 执行直到成功、遇到不可重试错误或重试耗尽
    async fn execute_with_retry(
        &self,
        tool: &dyn Tool,
        call: &mut ToolCall,
        ctx: &OrchestrationContext,
    ) -> Result<Value, (ToolError, OrchestrationError)> {
        let policy = &self.config.retry;
        loop {
            let attempt = call.attempts;
            call.attempts += 1;

            let (tool_error, call_error) = match self.executor.invoke(tool, &call.input, ctx, attempt).await {
                Attempt::Ok(value) => return Ok(value),
                Attempt::Failed(e) => {
                    let retryable = is_retryable(&e);
                    let call_error = e.clone().into_orchestration_error(tool.name(), retryable);
                    (e, call_error)
                }
                Attempt::TimedOut { timeout_ms } => (
                    ToolError::timeout(tool.name(), timeout_ms),
                    OrchestrationError::Timeout {
                        tool: tool.name().to_string(),
                        timeout_ms,
                    },
                ),
            };

            if !is_retryable(&tool_error) || !policy.can_retry(call.retries) {
                return Err((tool_error, call_error));
            }

            let delay = policy.delay_for(call.retries);
            call.retries += 1;
            warn!(
                call_id = %call.id,
                tool = %call.tool_name,
                retry = call.retries,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %tool_error,
                "Retrying tool call"
            );
            if let Some(tracker) = ctx.progress() {
                tracker.tool_progress(
                    &call.id,
                    None,
                    Some(format!("Retrying ({}/{})", call.retries, policy.max_retries)),
                );
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// 失败降级：on_error 兜底 → 陈旧缓存 → failed
    async fn degrade(
        &self,
        tool: &dyn Tool,
        call: &mut ToolCall,
        tool_error: ToolError,
        call_error: OrchestrationError,
        cache_key: Option<&str>,
        ctx: &OrchestrationContext,
    ) {
        if let Some(fallback) = tool.on_error(&tool_error, &call.input, ctx).await {
            warn!(call_id = %call.id, tool = %call.tool_name, error = %call_error, "Using onError fallback result");
            call.used_fallback = true;
            call.error = Some(call_error);
            self.accept_result(call, fallback, None, None);
            return;
        }

        if let Some(stale) = cache_key.and_then(|key| self.cache.get_stale(key)) {
            warn!(call_id = %call.id, tool = %call.tool_name, error = %call_error, "Using stale cached result");
            call.used_stale = true;
            call.error = Some(call_error);
            call.complete(stale);
            return;
        }

        warn!(
            call_id = %call.id,
            tool = %call.tool_name,
            attempts = call.attempts,
            error = %call_error,
            "Tool call failed"
        );
        call.fail(call_error);
    }

    /// 结果大小检查后写入缓存并标记完成
    fn accept_result(&self, call: &mut ToolCall, value: Value, cache_key: Option<&str>, ttl: Option<Duration>) {
        let size = estimate_size(&value);
        if size > self.config.max_result_bytes {
            warn!(
                call_id = %call.id,
                tool = %call.tool_name,
                size,
                limit = self.config.max_result_bytes,
                "Result exceeds memory limit, discarding"
            );
            call.fail(OrchestrationError::MemoryLimit {
                tool: call.tool_name.clone(),
                size,
                limit: self.config.max_result_bytes,
            });
            return;
        }
        if let Some(key) = cache_key {
            self.cache.set(key, value.clone(), ttl);
        }
        call.complete(value);
    }
}

fn ensure_unique_ids(calls: &[ToolCall]) -> Result<(), OrchestrationError> {
    let mut seen = HashSet::with_capacity(calls.len());
    for call in calls {
        if call.tool_name.trim().is_empty() {
            return Err(OrchestrationError::MalformedPlan {
                message: format!("call {} has an empty tool name", call.id),
            });
        }
        if !seen.insert(call.id.as_str()) {
            return Err(OrchestrationError::MalformedPlan {
                message: format!("duplicate call id {}", call.id),
            });
        }
    }
    Ok(())
}

/// 以 JSON 序列化字节数估算结果占用
fn estimate_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|bytes| bytes.len()).unwrap_or(usize::MAX)
}

fn report_settled(ctx: &OrchestrationContext, call: &ToolCall) {
    let Some(tracker) = ctx.progress() else {
        return;
    };
    match call.status {
        CallStatus::Completed => tracker.tool_completed(&call.id, call.from_cache),
        CallStatus::Failed => {
            let error = call
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown error".to_string());
            tracker.tool_failed(&call.id, &error);
        }
        CallStatus::Skipped => {
            tracker.tool_skipped(&call.id, call.skip_reason.as_deref().unwrap_or("skipped"));
        }
        CallStatus::Pending | CallStatus::Running => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::progress::{ProgressEvent, ProgressTracker};

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: 0.3,
        }
    }

    fn engine_with(registry: ToolRegistry, config: EngineConfig) -> ExecutionEngine {
        ExecutionEngine::new(Arc::new(registry), Arc::new(ToolCache::default()), config)
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            retry: fast_retry(3),
            ..EngineConfig::default()
        }
    }

    /// 可配置的测试工具
    struct ScriptedTool {
        name: &'static str,
        deps: Vec<String>,
        calls: AtomicU32,
        fail_first: u32,
        error: ToolError,
        delay: Duration,
        cache: bool,
        running: Option<Arc<AtomicUsize>>,
        peak: Option<Arc<AtomicUsize>>,
        log: Option<Arc<Mutex<Vec<String>>>>,
        fallback: Option<Value>,
        skip: bool,
        valid: bool,
        result: Value,
    }

    impl ScriptedTool {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                deps: Vec::new(),
                calls: AtomicU32::new(0),
                fail_first: 0,
                error: ToolError::new("boom").retryable(false),
                delay: Duration::ZERO,
                cache: false,
                running: None,
                peak: None,
                log: None,
                fallback: None,
                skip: false,
                valid: true,
                result: json!({"tool": name}),
            }
        }

        fn depends_on(mut self, dep: &str) -> Self {
            self.deps.push(dep.to_string());
            self
        }

        fn failing(mut self, times: u32, error: ToolError) -> Self {
            self.fail_first = times;
            self.error = error;
            self
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn cached(mut self) -> Self {
            self.cache = true;
            self
        }

        fn tracking(mut self, running: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Self {
            self.running = Some(running);
            self.peak = Some(peak);
            self
        }

        fn logging(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
            self.log = Some(log);
            self
        }

        fn with_fallback(mut self, value: Value) -> Self {
            self.fallback = Some(value);
            self
        }

        fn returning(mut self, value: Value) -> Self {
            self.result = value;
            self
        }
    }

    #[async_trait]
    impl Tool for ScriptedTool {
        fn name(&self) -> &str {
            self.name
        }

        fn should_execute(&self, _input: &Value, _ctx: &OrchestrationContext) -> bool {
            !self.skip
        }

        fn validate_input(&self, _input: &Value) -> bool {
            self.valid
        }

        fn cache_key(&self, input: &Value, _ctx: &OrchestrationContext) -> Option<String> {
            self.cache.then(|| format!("{}:{}", self.name, input))
        }

        fn dependencies(&self, _input: &Value, _ctx: &OrchestrationContext) -> Vec<String> {
            self.deps.clone()
        }

        async fn on_error(&self, _error: &ToolError, _input: &Value, _ctx: &OrchestrationContext) -> Option<Value> {
            self.fallback.clone()
        }

        async fn execute(&self, _input: &Value, ctx: &OrchestrationContext) -> Result<Value, ToolError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(log) = &self.log {
                log.lock().unwrap().push(format!(
                    "{}:{}",
                    self.name,
                    ctx.previous_results.len()
                ));
            }
            if let (Some(running), Some(peak)) = (&self.running, &self.peak) {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(running) = &self.running {
                running.fetch_sub(1, Ordering::SeqCst);
            }
            if n < self.fail_first {
                return Err(self.error.clone());
            }
            Ok(self.result.clone())
        }
    }

    fn ctx() -> OrchestrationContext {
        OrchestrationContext::new("user-1", "session-1")
    }

    #[tokio::test]
    async fn test_independent_tools_run_in_one_phase() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::new()
            .with(
                ScriptedTool::new("a")
                    .delayed(Duration::from_millis(50))
                    .tracking(running.clone(), peak.clone()),
            )
            .with(
                ScriptedTool::new("b")
                    .delayed(Duration::from_millis(50))
                    .tracking(running.clone(), peak.clone()),
            );
        let engine = engine_with(registry, test_config());
        let mut ctx = ctx();
        let calls = vec![
            ToolCall::with_id("a1", "a", json!({})),
            ToolCall::with_id("b1", "b", json!({})),
        ];

        let report = engine.execute(calls, &mut ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.phases.len(), 1);
        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::new().with(
            ScriptedTool::new("work")
                .delayed(Duration::from_millis(20))
                .tracking(running.clone(), peak.clone()),
        );
        let engine = engine_with(
            registry,
            EngineConfig {
                max_concurrency: 3,
                ..test_config()
            },
        );
        let mut ctx = ctx();
        let calls = (0..10)
            .map(|i| ToolCall::with_id(format!("w{i}"), "work", json!({ "i": i })))
            .collect();

        let report = engine.execute(calls, &mut ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.succeeded.len(), 10);
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak} exceeded limit");
        assert!(peak >= 2);
    }

    #[tokio::test]
    async fn test_dependent_runs_in_later_phase_and_sees_results() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ToolRegistry::new()
            .with(ScriptedTool::new("generateMealPlan").logging(log.clone()))
            .with(
                ScriptedTool::new("generateGroceryList")
                    .depends_on("generateMealPlan")
                    .logging(log.clone()),
            );
        let engine = engine_with(registry, test_config());
        let mut ctx = ctx();
        let calls = vec![
            ToolCall::with_id("list", "generateGroceryList", json!({})),
            ToolCall::with_id("plan", "generateMealPlan", json!({})),
        ];

        let report = engine.execute(calls, &mut ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.phase_of("plan"), Some(0));
        assert_eq!(report.phase_of("list"), Some(1));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["generateMealPlan:0".to_string(), "generateGroceryList:1".to_string()]
        );
        assert!(ctx.previous_result("generateGroceryList").is_some());
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependents_transitively() {
        let registry = ToolRegistry::new()
            .with(ScriptedTool::new("a").failing(u32::MAX, ToolError::new("bad request").retryable(false)))
            .with(ScriptedTool::new("b").depends_on("a"))
            .with(ScriptedTool::new("c").depends_on("b"))
            .with(ScriptedTool::new("d"));
        let engine = engine_with(registry, test_config());
        let mut ctx = ctx();
        let calls = vec![
            ToolCall::with_id("a1", "a", json!({})),
            ToolCall::with_id("b1", "b", json!({})),
            ToolCall::with_id("c1", "c", json!({})),
            ToolCall::with_id("d1", "d", json!({})),
        ];

        let report = engine.execute(calls, &mut ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.failed, vec!["a1".to_string()]);
        assert_eq!(report.succeeded, vec!["d1".to_string()]);
        let b = report.call("b1").unwrap();
        assert_eq!(b.status, CallStatus::Skipped);
        assert_eq!(b.skip_reason.as_deref(), Some("dependency 'a' (a1) failed"));
        let c = report.call("c1").unwrap();
        assert_eq!(c.skip_reason.as_deref(), Some("dependency 'a' (a1) failed"));
        assert_eq!(c.attempts, 0);
    }

    #[tokio::test]
    async fn test_cycle_aborts_before_execution() {
        let x = Arc::new(ScriptedTool::new("x").depends_on("y"));
        let y = Arc::new(ScriptedTool::new("y").depends_on("x"));
        let mut registry = ToolRegistry::new();
        registry.register_arc(x.clone());
        registry.register_arc(y.clone());
        let engine = engine_with(registry, test_config());
        let mut ctx = ctx();
        let calls = vec![
            ToolCall::with_id("x1", "x", json!({})),
            ToolCall::with_id("y1", "y", json!({})),
        ];

        let err = engine.execute(calls, &mut ctx, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::DependencyCycle { .. }));
        assert_eq!(x.calls.load(Ordering::SeqCst), 0);
        assert_eq!(y.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_executes_once() {
        let tool = Arc::new(ScriptedTool::new("generateMealPlan").cached());
        let mut registry = ToolRegistry::new();
        registry.register_arc(tool.clone());
        let engine = engine_with(registry, test_config());
        let input = json!({"days": 1, "meals": 3});

        for _ in 0..3 {
            let mut ctx = ctx();
            let calls = vec![ToolCall::new("generateMealPlan", input.clone())];
            engine.execute(calls, &mut ctx, &CancellationToken::new()).await.unwrap();
        }
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);

        let mut ctx = ctx();
        let report = engine
            .execute(vec![ToolCall::new("generateMealPlan", input)], &mut ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.used_cached_data);
        assert!(report.calls[0].from_cache);
    }

    #[tokio::test]
    async fn test_retryable_error_attempted_max_retries_plus_one() {
        let tool = Arc::new(ScriptedTool::new("flaky").failing(u32::MAX, ToolError::new("connection reset by peer")));
        let mut registry = ToolRegistry::new();
        registry.register_arc(tool.clone());
        let engine = engine_with(registry, test_config());
        let mut ctx = ctx();

        let report = engine
            .execute(vec![ToolCall::with_id("f", "flaky", json!({}))], &mut ctx, &CancellationToken::new())
            .await
            .unwrap();
        let call = report.call("f").unwrap();
        assert_eq!(call.status, CallStatus::Failed);
        assert_eq!(call.attempts, 4);
        assert_eq!(call.retries, 3);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 4);
        assert!(matches!(call.error, Some(OrchestrationError::Execution { retryable: true, .. })));
    }

    #[tokio::test]
    async fn test_timeout_like_errors_then_success() {
        let tool = Arc::new(ScriptedTool::new("prices").failing(3, ToolError::new("Request timed out")));
        let mut registry = ToolRegistry::new();
        registry.register_arc(tool.clone());
        let engine = engine_with(registry, test_config());
        let mut ctx = ctx();

        let report = engine
            .execute(vec![ToolCall::with_id("p", "prices", json!({}))], &mut ctx, &CancellationToken::new())
            .await
            .unwrap();
        let call = report.call("p").unwrap();
        assert_eq!(call.status, CallStatus::Completed);
        assert_eq!(call.retries, 3);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_retried() {
        let tool = Arc::new(ScriptedTool::new("strict").failing(u32::MAX, ToolError::new("recipe not found")));
        let mut registry = ToolRegistry::new();
        registry.register_arc(tool.clone());
        let engine = engine_with(registry, test_config());
        let mut ctx = ctx();

        let report = engine
            .execute(vec![ToolCall::with_id("s", "strict", json!({}))], &mut ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.call("s").unwrap().attempts, 1);
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_tool_timeout_counts_as_retryable_failure() {
        struct Hanging;

        #[async_trait]
        impl Tool for Hanging {
            fn name(&self) -> &str {
                "hanging"
            }

            fn timeout(&self) -> Option<Duration> {
                Some(Duration::from_millis(10))
            }

            async fn execute(&self, _input: &Value, _ctx: &OrchestrationContext) -> Result<Value, ToolError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            }
        }

        let engine = engine_with(
            ToolRegistry::new().with(Hanging),
            EngineConfig {
                retry: fast_retry(1),
                ..EngineConfig::default()
            },
        );
        let mut ctx = ctx();
        let report = engine
            .execute(vec![ToolCall::with_id("h", "hanging", json!({}))], &mut ctx, &CancellationToken::new())
            .await
            .unwrap();
        let call = report.call("h").unwrap();
        assert_eq!(call.attempts, 2);
        assert!(matches!(call.error, Some(OrchestrationError::Timeout { timeout_ms: 10, .. })));
    }

    #[tokio::test]
    async fn test_on_error_fallback_completes_call() {
        let registry = ToolRegistry::new().with(
            ScriptedTool::new("getNutritionInfo")
                .failing(u32::MAX, ToolError::new("invalid api key").retryable(false))
                .with_fallback(json!({"calories": null, "note": "unavailable"})),
        );
        let engine = engine_with(registry, test_config());
        let mut ctx = ctx();
        let report = engine
            .execute(
                vec![ToolCall::with_id("n", "getNutritionInfo", json!({}))],
                &mut ctx,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let call = report.call("n").unwrap();
        assert_eq!(call.status, CallStatus::Completed);
        assert!(call.used_fallback);
        assert!(call.error.is_some());
        assert_eq!(ctx.previous_result("getNutritionInfo"), Some(&json!({"calories": null, "note": "unavailable"})));
    }

    #[tokio::test]
    async fn test_stale_cache_used_after_live_failure() {
        let registry = ToolRegistry::new().with(
            ScriptedTool::new("getGroceryPrices")
                .cached()
                .failing(u32::MAX, ToolError::new("upstream rejected").retryable(false)),
        );
        let cache = Arc::new(ToolCache::new(Duration::from_secs(300), Duration::from_secs(3600)));
        cache.set("getGroceryPrices:{}", json!({"total": 42.5}), Some(Duration::ZERO));
        let engine = ExecutionEngine::new(Arc::new(registry), cache, test_config());
        let mut ctx = ctx();

        let report = engine
            .execute(
                vec![ToolCall::with_id("g", "getGroceryPrices", json!({}))],
                &mut ctx,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let call = report.call("g").unwrap();
        assert_eq!(call.status, CallStatus::Completed);
        assert!(call.used_stale);
        assert!(report.used_stale_data);
        assert!(!report.used_cached_data);
    }

    #[tokio::test]
    async fn test_oversized_result_is_discarded() {
        let registry = ToolRegistry::new().with(ScriptedTool::new("huge").cached().returning(json!("x".repeat(2048))));
        let engine = engine_with(
            registry,
            EngineConfig {
                max_result_bytes: 1024,
                ..test_config()
            },
        );
        let mut ctx = ctx();
        let report = engine
            .execute(vec![ToolCall::with_id("h", "huge", json!({}))], &mut ctx, &CancellationToken::new())
            .await
            .unwrap();
        let call = report.call("h").unwrap();
        assert_eq!(call.status, CallStatus::Failed);
        assert!(call.result.is_none());
        assert!(matches!(call.error, Some(OrchestrationError::MemoryLimit { limit: 1024, .. })));
        assert!(engine.cache().is_empty());
        assert!(ctx.previous_result("huge").is_none());
    }

    #[tokio::test]
    async fn test_unknown_tool_and_validation_failures_are_call_local() {
        let mut invalid = ScriptedTool::new("strict");
        invalid.valid = false;
        let mut skipped = ScriptedTool::new("optional");
        skipped.skip = true;
        let registry = ToolRegistry::new().with(invalid).with(skipped).with(ScriptedTool::new("ok"));
        let engine = engine_with(registry, test_config());
        let mut ctx = ctx();
        let calls = vec![
            ToolCall::with_id("m", "missing", json!({})),
            ToolCall::with_id("s", "strict", json!({})),
            ToolCall::with_id("o", "optional", json!({})),
            ToolCall::with_id("k", "ok", json!({})),
        ];

        let report = engine.execute(calls, &mut ctx, &CancellationToken::new()).await.unwrap();
        assert!(matches!(
            report.call("m").unwrap().error,
            Some(OrchestrationError::ToolNotFound { .. })
        ));
        assert!(matches!(
            report.call("s").unwrap().error,
            Some(OrchestrationError::Validation { .. })
        ));
        assert_eq!(report.call("o").unwrap().status, CallStatus::Skipped);
        assert_eq!(report.succeeded, vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_cancellation_discards_in_flight_result_and_stops_later_phases() {
        struct CancellingTool {
            token: CancellationToken,
        }

        #[async_trait]
        impl Tool for CancellingTool {
            fn name(&self) -> &str {
                "first"
            }

            async fn execute(&self, _input: &Value, _ctx: &OrchestrationContext) -> Result<Value, ToolError> {
                self.token.cancel();
                Ok(json!({"done": true}))
            }
        }

        let token = CancellationToken::new();
        let second = Arc::new(ScriptedTool::new("second").depends_on("first"));
        let mut registry = ToolRegistry::new().with(CancellingTool { token: token.clone() });
        registry.register_arc(second.clone());
        let engine = engine_with(registry, test_config());
        let tracker = Arc::new(ProgressTracker::default());
        let mut rx = tracker.subscribe();
        let mut ctx = ctx().with_progress(tracker.clone());
        let calls = vec![
            ToolCall::with_id("f", "first", json!({})),
            ToolCall::with_id("s", "second", json!({})),
        ];

        let report = engine.execute(calls, &mut ctx, &token).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.skipped, vec!["f".to_string(), "s".to_string()]);
        assert!(report.calls.iter().all(ToolCall::was_cancelled));
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
        assert!(ctx.previous_result("first").is_none());

        let mut skipped = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ProgressEvent::ToolSkipped { .. }) {
                skipped += 1;
            }
        }
        assert_eq!(skipped, 2);
        assert_eq!(tracker.snapshot().skipped_tools, 2);
    }

    #[tokio::test]
    async fn test_failure_after_cancellation_stays_failed() {
        struct CancelThenFail {
            token: CancellationToken,
        }

        #[async_trait]
        impl Tool for CancelThenFail {
            fn name(&self) -> &str {
                "first"
            }

            async fn execute(&self, _input: &Value, _ctx: &OrchestrationContext) -> Result<Value, ToolError> {
                self.token.cancel();
                Err(ToolError::new("upstream rejected the request").retryable(false))
            }
        }

        let token = CancellationToken::new();
        let second = Arc::new(ScriptedTool::new("second").depends_on("first"));
        let mut registry = ToolRegistry::new().with(CancelThenFail { token: token.clone() });
        registry.register_arc(second.clone());
        let engine = engine_with(registry, test_config());
        let mut ctx = ctx();
        let calls = vec![
            ToolCall::with_id("f", "first", json!({})),
            ToolCall::with_id("s", "second", json!({})),
        ];

        let report = engine.execute(calls, &mut ctx, &token).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.failed, vec!["f".to_string()]);
        assert_eq!(report.call("f").unwrap().status, CallStatus::Failed);
        assert!(report.call("s").unwrap().was_cancelled());
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_launches_nothing() {
        let tool = Arc::new(ScriptedTool::new("a"));
        let mut registry = ToolRegistry::new();
        registry.register_arc(tool.clone());
        let engine = engine_with(registry, test_config());
        let token = CancellationToken::new();
        token.cancel();
        let mut ctx = ctx();

        let report = engine
            .execute(vec![ToolCall::with_id("a1", "a", json!({}))], &mut ctx, &token)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.skipped, vec!["a1".to_string()]);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_duplicate_call_ids_are_malformed() {
        let engine = engine_with(ToolRegistry::new().with(ScriptedTool::new("a")), test_config());
        let mut ctx = ctx();
        let calls = vec![
            ToolCall::with_id("same", "a", json!({})),
            ToolCall::with_id("same", "a", json!({})),
        ];
        let err = engine
            .execute_flat(calls, &mut ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_run_fatal());
    }
}
