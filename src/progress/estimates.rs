//! 工具耗时估算表
//!
//! 外部调用的真实进度不可知，运行中的工具按「已耗时 / 预估耗时」合成进度，最高到 90%。

use std::collections::HashMap;
use std::time::Duration;

/// 合成进度上限
pub const SYNTHETIC_PROGRESS_CAP: f64 = 90.0;

/// 按工具名的预估耗时
#[derive(Debug, Clone, PartialEq)]
pub struct DurationEstimates {
    per_tool: HashMap<String, Duration>,
    default: Duration,
}

impl DurationEstimates {
    pub fn new(default: Duration) -> Self {
        Self {
            per_tool: HashMap::new(),
            default,
        }
    }

    pub fn with(mut self, tool: impl Into<String>, estimate: Duration) -> Self {
        self.per_tool.insert(tool.into(), estimate);
        self
    }

    pub fn set(&mut self, tool: impl Into<String>, estimate: Duration) {
        self.per_tool.insert(tool.into(), estimate);
    }

    pub fn set_default(&mut self, estimate: Duration) {
        self.default = estimate;
    }

    pub fn estimate_for(&self, tool: &str) -> Duration {
        self.per_tool.get(tool).copied().unwrap_or(self.default)
    }

    /// min(90, elapsed / estimate × 100)
    pub fn synthetic_progress(&self, tool: &str, elapsed: Duration) -> f64 {
        let estimate = self.estimate_for(tool);
        if estimate.is_zero() {
            return SYNTHETIC_PROGRESS_CAP;
        }
        let ratio = elapsed.as_secs_f64() / estimate.as_secs_f64();
        (ratio * 100.0).min(SYNTHETIC_PROGRESS_CAP)
    }
}

impl Default for DurationEstimates {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
            .with("generateMealPlan", Duration::from_secs(15))
            .with("modifyMealPlan", Duration::from_secs(10))
            .with("generateGroceryList", Duration::from_secs(8))
            .with("getGroceryPrices", Duration::from_secs(6))
            .with("searchRecipes", Duration::from_secs(5))
            .with("getNutritionInfo", Duration::from_secs(4))
    }
}
