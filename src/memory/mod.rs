//! 记忆层：会话数据模型、会话存储与上下文组装/压缩

mod conversation;
mod manager;
mod store;

pub use conversation::{Conversation, Message, Role, Summary, ToolCallRecord};
pub use manager::{MemoryManager, MemoryState};
pub use store::{ConversationStore, FileConversationStore, InMemoryConversationStore};
