//! 会话上下文存储
//!
//! 按 (user_id, session_id) 记住上一轮产生的实体（膳食计划、购物清单），
//! 让后续轮次可以直接引用"这个计划"。读取时惰性过期，另有周期清扫任务。

mod backend;
#[cfg(feature = "async-sqlite")]
mod sqlite;

pub use backend::{ContextBackend, MemoryContextBackend};
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteContextBackend;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::workflow::{CallStatus, ToolCall};

/// 默认过期时间：30 分钟
pub const DEFAULT_CONTEXT_TTL: Duration = Duration::from_secs(30 * 60);

const MEAL_PLAN_KEYS: &[&str] = &["mealPlanId", "meal_plan_id"];
const GROCERY_LIST_KEYS: &[&str] = &["groceryListId", "grocery_list_id"];
/// 结果中查找实体 ID 的最大嵌套深度
const MAX_SEARCH_DEPTH: usize = 3;

/// 上下文存储错误
#[derive(Debug, thiserror::Error)]
pub enum ContextStoreError {
    #[error("Context backend error: {message}")]
    Backend { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "async-sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// 持久化的会话上下文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRecord {
    pub user_id: String,
    pub session_id: String,
    pub meal_plan_id: Option<String>,
    pub grocery_list_id: Option<String>,
    /// 最近一次运行的结果包：工具名 -> 结果
    pub last_tool_results: Option<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContextRecord {
    fn empty(user_id: &str, session_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            meal_plan_id: None,
            grocery_list_id: None,
            last_tool_results: None,
            metadata: Map::new(),
            expires_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// 部分更新：只有 Some 的字段会被写入，metadata 按键合并
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextUpdate {
    pub meal_plan_id: Option<String>,
    pub grocery_list_id: Option<String>,
    pub last_tool_results: Option<Value>,
    pub metadata: Option<Map<String, Value>>,
}

impl ContextUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn meal_plan_id(mut self, id: impl Into<String>) -> Self {
        self.meal_plan_id = Some(id.into());
        self
    }

    pub fn grocery_list_id(mut self, id: impl Into<String>) -> Self {
        self.grocery_list_id = Some(id.into());
        self
    }

    pub fn last_tool_results(mut self, results: Value) -> Self {
        self.last_tool_results = Some(results);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.get_or_insert_with(Map::new).insert(key.into(), value);
        self
    }

    fn apply(self, record: &mut ContextRecord) {
        if let Some(id) = self.meal_plan_id {
            record.meal_plan_id = Some(id);
        }
        if let Some(id) = self.grocery_list_id {
            record.grocery_list_id = Some(id);
        }
        if let Some(results) = self.last_tool_results {
            record.last_tool_results = Some(results);
        }
        if let Some(metadata) = self.metadata {
            record.metadata.extend(metadata);
        }
    }
}

/// 会话上下文存储
pub struct ContextStore {
    backend: Arc<dyn ContextBackend>,
    ttl: Duration,
}

impl ContextStore {
    pub fn new(backend: Arc<dyn ContextBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// 内存后端、默认 TTL
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryContextBackend::new()), DEFAULT_CONTEXT_TTL)
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::minutes(30));
        now + ttl
    }

    /// 读取上下文；已过期的记录视为不存在，并在后台删除
    pub async fn get_context(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<ContextRecord>, ContextStoreError> {
        let Some(record) = self.backend.find(user_id, session_id).await? else {
            return Ok(None);
        };
        if !record.is_expired_at(Utc::now()) {
            return Ok(Some(record));
        }

        debug!(user_id = %user_id, session_id = %session_id, "Context expired, scheduling deletion");
        let backend = Arc::clone(&self.backend);
        let (user_id, session_id) = (user_id.to_string(), session_id.to_string());
        // 删除时重新判断过期，期间被 update_context 刷新的记录保留
        tokio::spawn(async move {
            if let Err(e) = backend.delete_if_expired(&user_id, &session_id, Utc::now()).await {
                warn!(user_id = %user_id, session_id = %session_id, error = %e, "Failed to delete expired context");
            }
        });
        Ok(None)
    }

    /// 合并更新并刷新过期时间
    pub async fn update_context(
        &self,
        user_id: &str,
        session_id: &str,
        update: ContextUpdate,
    ) -> Result<ContextRecord, ContextStoreError> {
        let now = Utc::now();
        let mut record = match self.backend.find(user_id, session_id).await? {
            Some(existing) if !existing.is_expired_at(now) => existing,
            _ => ContextRecord::empty(user_id, session_id, now),
        };
        update.apply(&mut record);
        record.updated_at = now;
        record.expires_at = self.expiry_from(now);
        self.backend.upsert(&record).await?;
        Ok(record)
    }

    pub async fn clear_context(&self, user_id: &str, session_id: &str) -> Result<bool, ContextStoreError> {
        self.backend.delete(user_id, session_id).await
    }

    /// 从已完成的调用中提取实体 ID 并写入上下文；没有找到任何实体时返回 None
    pub async fn extract_and_store_entities<'a, I>(
        &self,
        user_id: &str,
        session_id: &str,
        calls: I,
    ) -> Result<Option<ContextRecord>, ContextStoreError>
    where
        I: IntoIterator<Item = &'a ToolCall>,
    {
        let mut update = ContextUpdate::new();
        let mut bundle = Map::new();

        for call in calls {
            if call.status != CallStatus::Completed {
                continue;
            }
            let Some(result) = &call.result else {
                continue;
            };
            if let Some(id) = find_entity_id(result, MEAL_PLAN_KEYS, MAX_SEARCH_DEPTH) {
                update.meal_plan_id = Some(id);
            } else if call.tool_name == "generateMealPlan" || call.tool_name == "modifyMealPlan" {
                if let Some(id) = result.get("id").and_then(id_string) {
                    update.meal_plan_id = Some(id);
                }
            }
            if let Some(id) = find_entity_id(result, GROCERY_LIST_KEYS, MAX_SEARCH_DEPTH) {
                update.grocery_list_id = Some(id);
            } else if call.tool_name == "generateGroceryList" {
                if let Some(id) = result.get("id").and_then(id_string) {
                    update.grocery_list_id = Some(id);
                }
            }
            bundle.insert(call.tool_name.clone(), result.clone());
        }

        if update.meal_plan_id.is_none() && update.grocery_list_id.is_none() {
            return Ok(None);
        }

        info!(
            user_id = %user_id,
            session_id = %session_id,
            meal_plan_id = ?update.meal_plan_id,
            grocery_list_id = ?update.grocery_list_id,
            "Storing extracted entities"
        );
        let record = self
            .update_context(user_id, session_id, update.last_tool_results(Value::Object(bundle)))
            .await?;
        Ok(Some(record))
    }

    /// 删除所有过期记录
    pub async fn cleanup_expired(&self) -> Result<usize, ContextStoreError> {
        let removed = self.backend.delete_expired(Utc::now()).await?;
        if removed > 0 {
            info!(removed, "Swept expired conversation contexts");
        }
        Ok(removed)
    }

    /// 启动周期清扫任务，cancel 后退出
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 第一次 tick 立即返回
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.cleanup_expired().await {
                            warn!(error = %e, "Context sweep failed");
                        }
                    }
                }
            }
            debug!("Context sweeper stopped");
        })
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 在结果中（含有限层嵌套）查找第一个匹配键的 ID
fn find_entity_id(value: &Value, keys: &[&str], depth: usize) -> Option<String> {
    let Value::Object(map) = value else {
        return None;
    };
    if let Some(id) = keys.iter().find_map(|k| map.get(*k).and_then(id_string)) {
        return Some(id);
    }
    if depth == 0 {
        return None;
    }
    map.values()
        .filter(|v| v.is_object())
        .find_map(|v| find_entity_id(v, keys, depth - 1))
}
