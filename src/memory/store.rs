//! 会话存储抽象层
//!
//! 会话存储是外部协作者：按 id + 归属加载（缺失 / 已删除 / 归属不符返回 None），整体保存。
//! 提供内存实现（测试与单进程部署）与 JSON 文件实现（跨进程恢复）。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::memory::Conversation;

/// 会话存储接口
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// 按 id 加载；不存在、已软删除或归属不符时返回 None
    async fn load(&self, id: &str, user_id: &str) -> Result<Option<Conversation>, String>;

    /// 整体保存（每轮一个写者，调用方负责按会话 id 串行化）
    async fn save(&self, conversation: &Conversation) -> Result<(), String>;

    /// 列出用户的活跃会话，按更新时间倒序
    async fn list(&self, user_id: &str) -> Result<Vec<Conversation>, String>;
}

fn visible_to(conversation: &Conversation, user_id: &str) -> bool {
    conversation.is_active && conversation.user_id == user_id
}

fn sort_recent_first(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}

/// 内存会话存储
#[derive(Default)]
pub struct InMemoryConversationStore {
    inner: Mutex<HashMap<String, Conversation>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, id: &str, user_id: &str) -> Result<Option<Conversation>, String> {
        let inner = self.inner.lock().await;
        Ok(inner.get(id).filter(|c| visible_to(c, user_id)).cloned())
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        inner.insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Conversation>, String> {
        let inner = self.inner.lock().await;
        let mut found: Vec<Conversation> = inner
            .values()
            .filter(|c| visible_to(c, user_id))
            .cloned()
            .collect();
        sort_recent_first(&mut found);
        Ok(found)
    }
}

/// 文件会话存储：每个会话一个 JSON 文件（<dir>/<id>.json），父目录不存在时自动创建
pub struct FileConversationStore {
    dir: PathBuf,
}

impl FileConversationStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    async fn load(&self, id: &str, user_id: &str) -> Result<Option<Conversation>, String> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;
        let conversation: Conversation =
            serde_json::from_str(&data).map_err(|e| e.to_string())?;
        Ok(Some(conversation).filter(|c| visible_to(c, user_id)))
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), String> {
        std::fs::create_dir_all(&self.dir).map_err(|e| e.to_string())?;
        let data = serde_json::to_string_pretty(conversation).map_err(|e| e.to_string())?;
        std::fs::write(self.path_for(&conversation.id), data).map_err(|e| e.to_string())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Conversation>, String> {
        let mut found = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(found),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(data) = std::fs::read_to_string(&path) else {
                continue;
            };
            // 损坏的文件跳过而不是让整个列表失败
            let Ok(conversation) = serde_json::from_str::<Conversation>(&data) else {
                tracing::warn!(path = %path.display(), "skipping unreadable conversation file");
                continue;
            };
            if visible_to(&conversation, user_id) {
                found.push(conversation);
            }
        }
        sort_recent_first(&mut found);
        Ok(found)
    }
}
