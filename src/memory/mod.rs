//! 记忆层：对话上下文（只追加）

pub mod conversation;

pub use conversation::{ConversationContext, ConversationId, Role, Turn};
