//! Sous - 多工具编排引擎演示入口
//!
//! 用法：`sous [PLAN_JSON] [MESSAGE]`
//! 读取执行计划（缺省时使用内置演示计划），执行并将进度事件与最终结果以 JSON 输出到标准输出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use sous::{
    config::{load_config, AppConfig},
    context::{ContextBackend, MemoryContextBackend},
    intent::{IntentContext, IntentValidator},
    memory::Message,
    progress::ProgressTracker,
    tools::{EchoTool, ToolRegistry},
    workflow::{ExecutionEngine, ExecutionPlan, OrchestrationContext, PlanBuilder, PlanExecutor},
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const DEMO_USER: &str = "demo-user";
const DEMO_SESSION: &str = "demo-session";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sous::observability::init();

    let mut args = std::env::args().skip(1);
    let plan_path = args.next().map(PathBuf::from);
    let message = args
        .next()
        .unwrap_or_else(|| "Create a 3-day meal plan for me".to_string());

    let config = load_config(None).context("Failed to load config")?;
    let plan = match plan_path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read plan {}", path.display()))?;
            serde_json::from_str::<ExecutionPlan>(&raw).context("Invalid plan JSON")?
        }
        None => demo_plan()?,
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received, cancelling run");
                cancel.cancel();
            }
        });
    }

    // 会话上下文 + 周期清扫
    let store = Arc::new(config.context_store(context_backend(&config).await?));
    let sweeper = store.spawn_sweeper(config.sweep_interval(), cancel.child_token());
    let previous = store
        .get_context(DEMO_USER, DEMO_SESSION)
        .await
        .context("Failed to read conversation context")?;

    let validator = IntentValidator::default();
    let intent_ctx = previous.as_ref().map(IntentContext::from).unwrap_or_default();
    let analysis = validator.analyze_intent(&message, Some(&intent_ctx));
    tracing::info!(intent = %analysis.intent, confidence = ?analysis.confidence, "Intent analysed");

    // 引擎
    let registry = Arc::new(ToolRegistry::new().with(EchoTool));
    tracing::info!(tools = ?registry.tool_descriptions(), "Tools registered");
    let cache = Arc::new(config.tool_cache());
    let cache_sweeper = cache.spawn_sweeper(config.cache_cleanup_interval(), cancel.child_token());
    let engine = Arc::new(ExecutionEngine::new(registry, cache, config.engine_config()));
    let executor = PlanExecutor::new(engine)
        .with_dependency_aware(config.orchestrator.dependency_aware)
        .with_progress_tick(config.progress_tick());

    // 进度事件逐行输出
    let tracker = Arc::new(ProgressTracker::new(config.duration_estimates()));
    let mut events = tracker.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Progress printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut ctx = OrchestrationContext::new(DEMO_USER, DEMO_SESSION)
        .with_history(vec![Message::user(message.clone())])
        .with_progress(tracker.clone());
    if let Some(results) = previous.as_ref().and_then(|r| r.last_tool_results.as_ref()) {
        if let Some(map) = results.as_object() {
            for (tool, value) in map {
                ctx.record_result(tool, value.clone());
            }
        }
    }

    let outcome = executor
        .execute_plan(&plan, &mut ctx, &cancel)
        .await
        .context("Plan execution failed")?;

    let validation = validator.validate_tool_execution(&analysis.expected_tools, &outcome.tool_names());
    if validator.should_retry(&validation, analysis.confidence) {
        tracing::warn!(missing = ?validation.missing_tools, "Expected tools were not called, planner should retry");
    }

    let calls = outcome.steps.iter().flat_map(|s| s.report.calls.iter());
    if let Some(record) = store
        .extract_and_store_entities(DEMO_USER, DEMO_SESSION, calls)
        .await
        .context("Failed to store conversation context")?
    {
        tracing::info!(meal_plan_id = ?record.meal_plan_id, "Conversation context updated");
    }

    drop(ctx);
    drop(tracker);
    let _ = printer.await;

    let summary = json!({
        "cache": executor.engine().cache().stats(),
        "intent": analysis,
        "validation": validation,
        "outcome": outcome,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    cancel.cancel();
    let _ = sweeper.await;
    let _ = cache_sweeper.await;
    Ok(())
}

/// 内置演示计划
fn demo_plan() -> anyhow::Result<ExecutionPlan> {
    let plan = PlanBuilder::new()
        .step("greet", "Echo two messages in parallel")
        .call("echo", json!({"text": "hello", "delay_ms": 200}))
        .call("echo", json!({"text": "world", "delay_ms": 100}))
        .step("follow_up", "Echo after the first step")
        .call("echo", json!({"text": "done"}))
        .build()?;
    Ok(plan)
}

#[cfg(feature = "async-sqlite")]
async fn context_backend(config: &AppConfig) -> anyhow::Result<Arc<dyn ContextBackend>> {
    match &config.context.sqlite_path {
        Some(path) => {
            let backend = sous::context::SqliteContextBackend::new(path)
                .await
                .context("Failed to open context database")?;
            Ok(Arc::new(backend))
        }
        None => Ok(Arc::new(MemoryContextBackend::new())),
    }
}

#[cfg(not(feature = "async-sqlite"))]
async fn context_backend(config: &AppConfig) -> anyhow::Result<Arc<dyn ContextBackend>> {
    if config.context.sqlite_path.is_some() {
        tracing::warn!("context.sqlite_path is set but the async-sqlite feature is disabled, using memory backend");
    }
    Ok(Arc::new(MemoryContextBackend::new()))
}
