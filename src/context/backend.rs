//! 上下文存储后端
//!
//! 按 (user_id, session_id) 组合键 find / upsert / delete；默认内存实现，
//! 开启 async-sqlite 特性时可使用 SQLite 实现。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{ContextRecord, ContextStoreError};

/// 持久化接口
#[async_trait]
pub trait ContextBackend: Send + Sync {
    async fn find(&self, user_id: &str, session_id: &str) -> Result<Option<ContextRecord>, ContextStoreError>;

    async fn upsert(&self, record: &ContextRecord) -> Result<(), ContextStoreError>;

    /// 返回是否确实删除了记录
    async fn delete(&self, user_id: &str, session_id: &str) -> Result<bool, ContextStoreError>;

    /// 仅当记录在删除时仍已过期（expires_at <= now）才删除，返回是否删除
    async fn delete_if_expired(
        &self,
        user_id: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, ContextStoreError>;

    /// 删除 expires_at <= now 的记录，返回删除条数
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, ContextStoreError>;
}

type RecordKey = (String, String);

/// 内存后端
#[derive(Debug, Default)]
pub struct MemoryContextBackend {
    records: RwLock<HashMap<RecordKey, ContextRecord>>,
}

impl MemoryContextBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl ContextBackend for MemoryContextBackend {
    async fn find(&self, user_id: &str, session_id: &str) -> Result<Option<ContextRecord>, ContextStoreError> {
        let records = self.records.read().await;
        Ok(records
            .get(&(user_id.to_string(), session_id.to_string()))
            .cloned())
    }

    async fn upsert(&self, record: &ContextRecord) -> Result<(), ContextStoreError> {
        self.records.write().await.insert(
            (record.user_id.clone(), record.session_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn delete(&self, user_id: &str, session_id: &str) -> Result<bool, ContextStoreError> {
        Ok(self
            .records
            .write()
            .await
            .remove(&(user_id.to_string(), session_id.to_string()))
            .is_some())
    }

    async fn delete_if_expired(
        &self,
        user_id: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, ContextStoreError> {
        let mut records = self.records.write().await;
        let key = (user_id.to_string(), session_id.to_string());
        match records.get(&key) {
            Some(record) if record.is_expired_at(now) => Ok(records.remove(&key).is_some()),
            _ => Ok(false),
        }
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, ContextStoreError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| record.expires_at > now);
        Ok(before - records.len())
    }
}
