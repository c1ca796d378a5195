//! 意图校验模块
//!
//! 按有序规则表对用户消息做轻量分类，得到预期应调用的工具；
//! 执行后核对实际调用是否覆盖预期，决定是否值得让规划器再试一次。
//! 规则命中但缺少所需上下文时置信度降为 low，预期工具不再具有约束力。

use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::context::ContextRecord;

/// 上下文键：已有膳食计划
pub const MEAL_PLAN_ID: &str = "mealPlanId";
/// 上下文键：已有购物清单
pub const GROCERY_LIST_ID: &str = "groceryListId";

/// 未命中任何规则时的意图
pub const CONVERSATIONAL: &str = "conversational";

/// 置信度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// 一条意图规则
#[derive(Debug, Clone)]
pub struct IntentRule {
    pub intent: String,
    /// 任一命中即匹配
    pub patterns: Vec<Regex>,
    pub confidence: Confidence,
    pub expected_tools: Vec<String>,
    /// 规则成立所需的上下文键
    pub requires_context: Vec<String>,
}

impl IntentRule {
    pub fn new<S: AsRef<str>>(
        intent: impl Into<String>,
        patterns: &[S],
        confidence: Confidence,
        expected_tools: &[&str],
    ) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            intent: intent.into(),
            patterns,
            confidence,
            expected_tools: expected_tools.iter().map(|t| t.to_string()).collect(),
            requires_context: Vec::new(),
        })
    }

    pub fn requires(mut self, keys: &[&str]) -> Self {
        self.requires_context = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn matches(&self, message: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(message))
    }
}

/// 分析时可用的上下文键
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntentContext {
    available: HashSet<String>,
}

impl IntentContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.available.insert(key.into());
        self
    }

    pub fn has(&self, key: &str) -> bool {
        self.available.contains(key)
    }
}

impl From<&ContextRecord> for IntentContext {
    fn from(record: &ContextRecord) -> Self {
        let mut ctx = Self::new();
        if record.meal_plan_id.is_some() {
            ctx.available.insert(MEAL_PLAN_ID.to_string());
        }
        if record.grocery_list_id.is_some() {
            ctx.available.insert(GROCERY_LIST_ID.to_string());
        }
        ctx
    }
}

/// 意图分析结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentAnalysis {
    pub intent: String,
    pub confidence: Confidence,
    pub expected_tools: Vec<String>,
    /// 规则需要但当前缺失的上下文键
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_needed: Option<Vec<String>>,
}

/// 执行核对结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolValidation {
    pub is_valid: bool,
    pub missing_tools: Vec<String>,
}

/// 意图校验器
#[derive(Debug, Clone)]
pub struct IntentValidator {
    rules: Vec<IntentRule>,
}

impl Default for IntentValidator {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl IntentValidator {
    pub fn new(rules: Vec<IntentRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[IntentRule] {
        &self.rules
    }

    /// 按规则顺序取第一条命中的规则
    pub fn analyze_intent(&self, message: &str, ctx: Option<&IntentContext>) -> IntentAnalysis {
        let Some(rule) = self.rules.iter().find(|r| r.matches(message)) else {
            return IntentAnalysis {
                intent: CONVERSATIONAL.to_string(),
                confidence: Confidence::Low,
                expected_tools: Vec::new(),
                context_needed: None,
            };
        };

        let missing: Vec<String> = rule
            .requires_context
            .iter()
            .filter(|key| !ctx.is_some_and(|c| c.has(key)))
            .cloned()
            .collect();

        if missing.is_empty() {
            return IntentAnalysis {
                intent: rule.intent.clone(),
                confidence: rule.confidence,
                expected_tools: rule.expected_tools.clone(),
                context_needed: None,
            };
        }

        tracing::debug!(intent = %rule.intent, missing = ?missing, "Intent matched without required context");
        IntentAnalysis {
            intent: rule.intent.clone(),
            confidence: Confidence::Low,
            expected_tools: Vec::new(),
            context_needed: Some(missing),
        }
    }

    /// 核对实际执行的工具是否覆盖预期
    pub fn validate_tool_execution<A: AsRef<str>>(&self, expected: &[String], actual: &[A]) -> ToolValidation {
        let actual: HashSet<&str> = actual.iter().map(|a| a.as_ref()).collect();
        let missing_tools: Vec<String> = expected
            .iter()
            .filter(|tool| !actual.contains(tool.as_str()))
            .cloned()
            .collect();
        ToolValidation {
            is_valid: missing_tools.is_empty(),
            missing_tools,
        }
    }

    /// 仅在高置信度且有遗漏时建议重新规划
    pub fn should_retry(&self, validation: &ToolValidation, confidence: Confidence) -> bool {
        confidence == Confidence::High && !validation.is_valid
    }
}

fn rule(intent: &str, patterns: &[&str], confidence: Confidence, tools: &[&str]) -> IntentRule {
    IntentRule::new(intent, patterns, confidence, tools).expect("built-in intent pattern is valid")
}

/// 内置规则（顺序即优先级）
pub fn default_rules() -> Vec<IntentRule> {
    vec![
        rule(
            "check_grocery_prices",
            &[
                r"(?i)\b(price|prices|pricing|cost|costs|how much)\b.*\b(grocer\w*|shopping|list|ingredients)\b",
                r"(?i)\b(grocer\w*|shopping list)\b.*\b(price|prices|cost|costs|budget)\b",
            ],
            Confidence::Medium,
            &["getGroceryPrices"],
        )
        .requires(&[GROCERY_LIST_ID]),
        rule(
            "create_grocery_list",
            &[r"(?i)\b(grocery|shopping)\s+list\b", r"(?i)\bwhat (do i|should i) (need to )?buy\b"],
            Confidence::High,
            &["generateGroceryList"],
        )
        .requires(&[MEAL_PLAN_ID]),
        rule(
            "modify_meal_plan",
            &[
                r"(?i)\b(change|modify|update|swap|replace|adjust|edit)\b.*\b(meal plan|plan|meals?|breakfast|lunch|dinner)\b",
                r"(?i)\b(this|my|the) (meal )?plan\b.*\b(instead|without|less|more)\b",
            ],
            Confidence::Medium,
            &["modifyMealPlan"],
        )
        .requires(&[MEAL_PLAN_ID]),
        rule(
            "create_meal_plan",
            &[
                r"(?i)\b(create|make|generate|build|plan|give me)\b.*\b(meal plan|meals?|menu)\b",
                r"(?i)\bmeal\s*plan\b",
            ],
            Confidence::High,
            &["generateMealPlan"],
        ),
        rule(
            "nutrition_info",
            &[r"(?i)\b(nutrition\w*|calories|calorie|protein|macros|carbs|fat content)\b"],
            Confidence::Medium,
            &["getNutritionInfo"],
        ),
        rule(
            "recipe_search",
            &[r"(?i)\b(recipes?|how (do i|to) (cook|make|prepare))\b"],
            Confidence::Medium,
            &["searchRecipes"],
        ),
    ]
}
