//! 重试与退避策略
//!
//! 判定一次工具失败是否值得重试（显式标记 → 已知错误码 → 消息特征），
//! 并按指数退避 + 抖动计算下一次重试前的等待时间。

use std::sync::OnceLock;
use std::time::Duration;

use rand::Rng;
use regex::Regex;

use crate::core::ToolError;

/// 已知可重试错误码（大小写不敏感比较）
const RETRYABLE_CODES: &[&str] = &[
    "RATE_LIMIT",
    "RATE_LIMITED",
    "TIMEOUT",
    "ETIMEDOUT",
    "ECONNRESET",
    "ECONNREFUSED",
    "EAI_AGAIN",
    "SERVICE_UNAVAILABLE",
    "429",
    "500",
    "502",
    "503",
    "504",
];

fn transient_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(timeout|timed out|network|connection (reset|refused)|econnreset|econnrefused|socket hang up|rate limit|too many requests|service unavailable|bad gateway|gateway timeout|temporarily unavailable|\b5\d\d\b)",
        )
        .expect("transient error pattern is valid")
    })
}

/// 判断工具错误是否可重试
pub fn is_retryable(err: &ToolError) -> bool {
    if let Some(flag) = err.retryable {
        return flag;
    }
    if let Some(code) = err.code.as_deref() {
        if RETRYABLE_CODES.iter().any(|c| c.eq_ignore_ascii_case(code)) {
            return true;
        }
    }
    transient_pattern().is_match(&err.message)
}

/// 重试策略：最大重试次数与指数退避参数
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// 抖动比例上限（0.3 表示在基础延迟上额外加 0–30%）
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    /// 不重试
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// 第 attempt 次重试（从 0 开始）前的基础延迟：min(max_delay, initial × multiplier^attempt)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial_delay.as_millis() as f64;
        let raw = initial_ms * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = raw.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// 基础延迟加上 [0, jitter) 比例的随机抖动
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.0..self.jitter);
        base + base.mul_f64(factor)
    }

    /// 是否还能继续重试（retries_done 为已经重试的次数）
    pub fn can_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }
}
