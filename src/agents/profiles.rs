//! 专用 agent 画像：system prompt、操作白名单、上下文增强

use std::collections::HashSet;

use crate::router::AgentKind;

/// 一类专用 agent 的静态画像
#[derive(Clone, Debug)]
pub struct AgentProfile {
    pub kind: AgentKind,
    pub system_prompt: String,
    /// 本类 agent 可调用的操作名
    pub allowed_tools: HashSet<String>,
    /// 固定角色指引，组装 prompt 时与调用方上下文合并
    pub guidance: String,
}

impl AgentProfile {
    /// 上下文增强：system prompt + 角色指引 + 调用方上下文
    pub fn enriched_prompt(&self, context: Option<&str>) -> String {
        let mut prompt = self.system_prompt.clone();
        if !self.guidance.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&self.guidance);
        }
        if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
            prompt.push_str("\n\nCaller context:\n");
            prompt.push_str(context);
        }
        prompt
    }
}

fn tool_set(names: &[&str]) -> HashSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// 文件操作 agent：移动/复制/删除/分享等
pub fn drive_profile() -> AgentProfile {
    AgentProfile {
        kind: AgentKind::Drive,
        system_prompt: "You are the file-operations assistant of a cloud drive. \
            You manage files and folders on the user's behalf: listing, moving, copying, \
            renaming, deleting, sharing. Use the provided tools; never invent file paths."
            .to_string(),
        allowed_tools: tool_set(&[
            "list_files",
            "get_file_info",
            "create_folder",
            "move_file",
            "copy_file",
            "rename_file",
            "delete_file",
            "delete_folder",
            "restore_file",
            "empty_trash",
            "share_file",
            "share_folder",
            "set_permissions",
        ]),
        guidance: "Destructive operations may pause for user approval; report such pauses \
            plainly instead of retrying them."
            .to_string(),
    }
}

/// 文档处理 agent：读取/摘要/翻译/改写
pub fn document_profile() -> AgentProfile {
    AgentProfile {
        kind: AgentKind::Document,
        system_prompt: "You are the document assistant of a cloud drive. You read documents \
            and produce summaries, translations, rewrites and drafts. Fetch content with the \
            provided tools before reasoning about it."
            .to_string(),
        allowed_tools: tool_set(&[
            "read_document",
            "write_document",
            "export_document",
            "get_file_info",
            "list_files",
        ]),
        guidance: "If an earlier step in the task plan failed, say which input is missing and \
            produce the best partial result you can."
            .to_string(),
    }
}

/// 检索 agent：按名称/内容/时间查找
pub fn search_profile() -> AgentProfile {
    AgentProfile {
        kind: AgentKind::Search,
        system_prompt: "You are the search assistant of a cloud drive. You locate files and \
            folders by name, content and metadata, and answer where-is questions. Always cite \
            the paths you found."
            .to_string(),
        allowed_tools: tool_set(&[
            "search_files",
            "search_content",
            "list_files",
            "get_file_info",
        ]),
        guidance: String::new(),
    }
}
