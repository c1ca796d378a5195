//! SQLite 上下文后端
//!
//! 每个 (user_id, session_id) 一行；结果包与元数据以 JSON 文本存储，时间为 RFC3339（UTC）。

#![cfg(feature = "async-sqlite")]

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;

use super::backend::ContextBackend;
use super::{ContextRecord, ContextStoreError};

/// SQLite 后端
pub struct SqliteContextBackend {
    pool: sqlx::sqlite::SqlitePool,
}

impl SqliteContextBackend {
    /// 打开（必要时创建目录与数据库）并建表
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, ContextStoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ContextStoreError::Backend {
                    message: format!("failed to create {}: {e}", parent.display()),
                })?;
        }
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: sqlx::sqlite::SqlitePool) -> Result<Self, ContextStoreError> {
        let backend = Self { pool };
        backend.init_tables().await?;
        Ok(backend)
    }

    async fn init_tables(&self) -> Result<(), ContextStoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversation_contexts (
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                meal_plan_id TEXT,
                grocery_list_id TEXT,
                last_tool_results TEXT,
                metadata TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, session_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversation_contexts_expires ON conversation_contexts(expires_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ContextStoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| ContextStoreError::Backend {
            message: format!("invalid timestamp {raw:?}: {e}"),
        })
}

#[async_trait]
impl ContextBackend for SqliteContextBackend {
    async fn find(&self, user_id: &str, session_id: &str) -> Result<Option<ContextRecord>, ContextStoreError> {
        let row = sqlx::query(
            "SELECT meal_plan_id, grocery_list_id, last_tool_results, metadata, expires_at, updated_at
             FROM conversation_contexts
             WHERE user_id = ? AND session_id = ?",
        )
        .bind(user_id)
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let last_tool_results: Option<String> = row.get("last_tool_results");
        let metadata: String = row.get("metadata");
        let expires_at: String = row.get("expires_at");
        let updated_at: String = row.get("updated_at");

        Ok(Some(ContextRecord {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            meal_plan_id: row.get("meal_plan_id"),
            grocery_list_id: row.get("grocery_list_id"),
            last_tool_results: last_tool_results
                .map(|raw| serde_json::from_str(&raw))
                .transpose()?,
            metadata: serde_json::from_str(&metadata)?,
            expires_at: parse_timestamp(&expires_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        }))
    }

    async fn upsert(&self, record: &ContextRecord) -> Result<(), ContextStoreError> {
        let last_tool_results = record
            .last_tool_results
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let metadata = serde_json::to_string(&record.metadata)?;

        sqlx::query(
            "INSERT INTO conversation_contexts
                (user_id, session_id, meal_plan_id, grocery_list_id, last_tool_results, metadata, expires_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, session_id) DO UPDATE SET
                meal_plan_id = excluded.meal_plan_id,
                grocery_list_id = excluded.grocery_list_id,
                last_tool_results = excluded.last_tool_results,
                metadata = excluded.metadata,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at",
        )
        .bind(&record.user_id)
        .bind(&record.session_id)
        .bind(&record.meal_plan_id)
        .bind(&record.grocery_list_id)
        .bind(&last_tool_results)
        .bind(&metadata)
        .bind(timestamp(&record.expires_at))
        .bind(timestamp(&record.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, user_id: &str, session_id: &str) -> Result<bool, ContextStoreError> {
        let result = sqlx::query("DELETE FROM conversation_contexts WHERE user_id = ? AND session_id = ?")
            .bind(user_id)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_if_expired(
        &self,
        user_id: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, ContextStoreError> {
        let result = sqlx::query(
            "DELETE FROM conversation_contexts WHERE user_id = ? AND session_id = ? AND expires_at <= ?",
        )
        .bind(user_id)
        .bind(session_id)
        .bind(timestamp(&now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, ContextStoreError> {
        let result = sqlx::query("DELETE FROM conversation_contexts WHERE expires_at <= ?")
            .bind(timestamp(&now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}
