//! 工具结果缓存
//!
//! 以工具给出的 cache_key 为键，跨运行、跨用户共享。写入不加锁协调，同键并发写入以最后一次为准。
//! 过期条目在「陈旧窗口」内仍保留，仅在实时调用失败后作为降级结果使用。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 单条缓存
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Value,
    pub stored_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }

    pub fn is_fresh(&self) -> bool {
        self.age() < self.ttl
    }
}

/// 命中统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
}

/// 带 TTL 的共享缓存
pub struct ToolCache {
    entries: DashMap<String, CacheEntry>,
    default_ttl: Duration,
    /// TTL 过期后仍可作为陈旧数据使用的时长
    stale_window: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
}

impl ToolCache {
    pub fn new(default_ttl: Duration, stale_window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            stale_window,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// 读取新鲜条目（age < ttl）
    pub fn get(&self, key: &str) -> Option<Value> {
        let fresh = self
            .entries
            .get(key)
            .filter(|entry| entry.is_fresh())
            .map(|entry| entry.value.clone());
        if fresh.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        fresh
    }

    /// 读取陈旧条目（age < ttl + stale_window），仅用于失败后的降级
    pub fn get_stale(&self, key: &str) -> Option<Value> {
        let value = self
            .entries
            .get(key)
            .filter(|entry| entry.age() < entry.ttl + self.stale_window)
            .map(|entry| entry.value.clone());
        if value.is_some() {
            self.stale_hits.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// 写入；ttl 为 None 时使用默认 TTL
    pub fn set(&self, key: impl Into<String>, value: Value, ttl: Option<Duration>) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl: ttl.unwrap_or(self.default_ttl),
            },
        );
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// 删除连陈旧窗口也已超过的条目，返回删除条数
    pub fn cleanup_expired(&self) -> usize {
        let before = self.entries.len();
        let stale_window = self.stale_window;
        self.entries
            .retain(|_, entry| entry.age() < entry.ttl + stale_window);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "Evicted expired cache entries");
        }
        removed
    }

    /// 周期淘汰过期条目，cancel 后退出
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.cleanup_expired();
                    }
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
        }
    }
}

impl Default for ToolCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), Duration::from_secs(3600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fresh_hit_and_miss() {
        let cache = ToolCache::default();
        assert!(cache.get("plan:1day:3meals").is_none());
        cache.set("plan:1day:3meals", json!({"id": "mp_1"}), None);
        assert_eq!(cache.get("plan:1day:3meals"), Some(json!({"id": "mp_1"})));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_expired_entry_is_only_stale() {
        let cache = ToolCache::new(Duration::from_secs(300), Duration::from_secs(60));
        cache.set("k", json!(1), Some(Duration::ZERO));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.get_stale("k"), Some(json!(1)));
    }

    #[test]
    fn test_cleanup_drops_entries_past_stale_window() {
        let cache = ToolCache::new(Duration::from_secs(300), Duration::ZERO);
        cache.set("gone", json!(1), Some(Duration::ZERO));
        cache.set("kept", json!(2), None);
        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get_stale("gone").is_none());
    }

    #[test]
    fn test_last_writer_wins() {
        let cache = ToolCache::default();
        cache.set("k", json!("first"), None);
        cache.set("k", json!("second"), None);
        assert_eq!(cache.get("k"), Some(json!("second")));
        assert!(cache.invalidate("k"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_evicts_and_stops() {
        let cache = Arc::new(ToolCache::new(Duration::from_secs(300), Duration::ZERO));
        cache.set("gone", json!(1), Some(Duration::ZERO));
        let cancel = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_millis(5), cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.is_empty());
        cancel.cancel();
        handle.await.unwrap();
    }
}
