//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SOUS__*` 覆盖（双下划线表示嵌套，如 `SOUS__ORCHESTRATOR__MAX_CONCURRENCY=8`）。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::ToolCache;
use crate::context::{ContextBackend, ContextStore};
use crate::core::RetryPolicy;
use crate::progress::DurationEstimates;
use crate::workflow::EngineConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub orchestrator: OrchestratorSection,
    pub retry: RetrySection,
    pub cache: CacheSection,
    pub progress: ProgressSection,
    pub context: ContextSection,
}

/// [orchestrator] 段：并发、超时、结果大小上限
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// 单次工具调用超时（秒），0 表示不限
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_max_result_bytes")]
    pub max_result_bytes: usize,
    /// 步骤内按工具依赖分阶段
    #[serde(default = "default_true")]
    pub dependency_aware: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            tool_timeout_secs: default_tool_timeout_secs(),
            max_result_bytes: default_max_result_bytes(),
            dependency_aware: true,
        }
    }
}

fn default_max_concurrency() -> usize {
    5
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_max_result_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

/// [retry] 段：指数退避参数
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// 抖动比例（0.3 表示最多额外等待 30%）
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.3
}

/// [cache] 段
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,
    /// TTL 过期后还能作为降级数据使用的时长
    #[serde(default = "default_stale_window_secs")]
    pub stale_window_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_cache_ttl_secs(),
            stale_window_secs: default_stale_window_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_stale_window_secs() -> u64 {
    3600
}

fn default_cleanup_interval_secs() -> u64 {
    10 * 60
}

/// [progress] 段：合成进度的刷新间隔与各工具耗时估计
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressSection {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_estimate_ms")]
    pub default_estimate_ms: u64,
    /// 覆盖内置耗时表
    #[serde(default)]
    pub estimates: Vec<ToolEstimate>,
}

/// [[progress.estimates]]：单个工具的预计耗时
#[derive(Debug, Clone, Deserialize)]
pub struct ToolEstimate {
    pub tool: String,
    pub ms: u64,
}

impl Default for ProgressSection {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            default_estimate_ms: default_estimate_ms(),
            estimates: Vec::new(),
        }
    }
}

fn default_tick_ms() -> u64 {
    500
}

fn default_estimate_ms() -> u64 {
    5000
}

/// [context] 段：会话上下文过期与清扫
#[derive(Debug, Clone, Deserialize)]
pub struct ContextSection {
    #[serde(default = "default_context_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// 设置后使用 SQLite 后端（需开启 async-sqlite 特性）
    pub sqlite_path: Option<PathBuf>,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_context_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            sqlite_path: None,
        }
    }
}

fn default_context_ttl_secs() -> u64 {
    30 * 60
}

fn default_sweep_interval_secs() -> u64 {
    5 * 60
}

impl AppConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        let r = &self.retry;
        RetryPolicy {
            max_retries: r.max_retries,
            initial_delay: Duration::from_millis(r.initial_delay_ms),
            max_delay: Duration::from_millis(r.max_delay_ms.max(r.initial_delay_ms)),
            multiplier: r.multiplier.max(1.0),
            jitter: r.jitter.clamp(0.0, 1.0),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        let o = &self.orchestrator;
        EngineConfig {
            max_concurrency: o.max_concurrency.max(1),
            retry: self.retry_policy(),
            tool_timeout: (o.tool_timeout_secs > 0).then(|| Duration::from_secs(o.tool_timeout_secs)),
            max_result_bytes: o.max_result_bytes,
        }
    }

    pub fn tool_cache(&self) -> ToolCache {
        ToolCache::new(
            Duration::from_secs(self.cache.default_ttl_secs),
            Duration::from_secs(self.cache.stale_window_secs),
        )
    }

    pub fn cache_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cache.cleanup_interval_secs.max(1))
    }

    pub fn duration_estimates(&self) -> DurationEstimates {
        let mut estimates = DurationEstimates::default();
        estimates.set_default(Duration::from_millis(self.progress.default_estimate_ms));
        for entry in &self.progress.estimates {
            estimates.set(entry.tool.clone(), Duration::from_millis(entry.ms));
        }
        estimates
    }

    pub fn progress_tick(&self) -> Option<Duration> {
        (self.progress.tick_ms > 0).then(|| Duration::from_millis(self.progress.tick_ms))
    }

    pub fn context_store(&self, backend: Arc<dyn ContextBackend>) -> ContextStore {
        ContextStore::new(backend, Duration::from_secs(self.context.ttl_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.context.sweep_interval_secs.max(1))
    }
}

/// 加载配置：config/default.toml（若存在）→ 指定文件 → 环境变量 SOUS__*
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SOUS")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
