//! 记忆层：本轮对话历史

pub mod conversation;

pub use conversation::{last_user_message, Message, Role};
