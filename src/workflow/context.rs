//! 编排上下文
//!
//! 单次运行独占：用户 / 会话、对话历史、已完成工具结果（随阶段推进增长）、可选的进度追踪器。

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::memory::{last_user_message, Message};
use crate::progress::ProgressTracker;

/// 单次运行的共享状态
#[derive(Clone)]
pub struct OrchestrationContext {
    pub user_id: String,
    pub session_id: String,
    pub conversation_history: Vec<Message>,
    /// 工具名 -> 最近一次成功结果
    pub previous_results: HashMap<String, Value>,
    pub progress: Option<Arc<ProgressTracker>>,
}

impl OrchestrationContext {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            conversation_history: Vec::new(),
            previous_results: HashMap::new(),
            progress: None,
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.conversation_history = history;
        self
    }

    pub fn with_progress(mut self, tracker: Arc<ProgressTracker>) -> Self {
        self.progress = Some(tracker);
        self
    }

    pub fn previous_result(&self, tool_name: &str) -> Option<&Value> {
        self.previous_results.get(tool_name)
    }

    pub fn record_result(&mut self, tool_name: &str, value: Value) {
        self.previous_results.insert(tool_name.to_string(), value);
    }

    pub fn last_user_message(&self) -> Option<&str> {
        last_user_message(&self.conversation_history).map(|m| m.content.as_str())
    }

    pub fn progress(&self) -> Option<&ProgressTracker> {
        self.progress.as_deref()
    }
}

impl std::fmt::Debug for OrchestrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationContext")
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("history_len", &self.conversation_history.len())
            .field("previous_results", &self.previous_results.keys().collect::<Vec<_>>())
            .field("has_progress", &self.progress.is_some())
            .finish()
    }
}
