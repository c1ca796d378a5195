//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / execute 以及一组带默认实现的可选钩子），由 ToolRegistry 按名注册与查找。
//! 注册表在启动时填充，之后以 Arc 共享、不再修改。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::ToolError;
use crate::workflow::OrchestrationContext;

/// 工具 trait：必选 name / execute，其余钩子均有默认实现
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（计划中 toolName 字段引用的名字）
    fn name(&self) -> &str;

    /// 工具描述
    fn description(&self) -> &str {
        ""
    }

    /// 执行工具
    async fn execute(&self, input: &Value, ctx: &OrchestrationContext) -> Result<Value, ToolError>;

    /// 返回 false 时本次调用直接标记为 skipped
    fn should_execute(&self, _input: &Value, _ctx: &OrchestrationContext) -> bool {
        true
    }

    /// 返回 false 时不执行，调用标记为 failed（Validation）
    fn validate_input(&self, _input: &Value) -> bool {
        true
    }

    /// 缓存键；None 表示不缓存
    fn cache_key(&self, _input: &Value, _ctx: &OrchestrationContext) -> Option<String> {
        None
    }

    /// 缓存有效期；None 时使用缓存的默认 TTL
    fn cache_ttl(&self) -> Option<Duration> {
        None
    }

    /// 本次调用依赖的工具名（不是调用 ID）
    fn dependencies(&self, _input: &Value, _ctx: &OrchestrationContext) -> Vec<String> {
        Vec::new()
    }

    /// 重试耗尽或遇到不可重试错误时的兜底结果
    async fn on_error(
        &self,
        _error: &ToolError,
        _input: &Value,
        _ctx: &OrchestrationContext,
    ) -> Option<Value> {
        None
    }

    /// 单次执行超时；None 时使用引擎默认值
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "Tool registered twice, keeping the latest definition");
        }
    }

    /// 链式注册，便于在启动时一次性构建
    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 返回 (name, description) 列表
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        let mut list: Vec<(String, String)> = self
            .tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.description().to_string()))
            .collect();
        list.sort();
        list
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
