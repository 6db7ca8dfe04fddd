//! LLM 输出解析辅助
//!
//! 从模型回复中提取 JSON 块（```json 围栏或裸大括号），路由分类与任务分解共用。

/// 提取文本中的 JSON 块；无任何大括号时返回 None
pub fn extract_json_block(output: &str) -> Option<String> {
    let trimmed = output.trim();

    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let block = rest
            .find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or_else(|| rest.trim());
        return Some(block.to_string());
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end < start {
        return None;
    }
    Some(trimmed[start..=end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_json() {
        let text = "Sure, here you go:\n```json\n{\"type\": \"drive\"}\n```";
        assert_eq!(extract_json_block(text).unwrap(), "{\"type\": \"drive\"}");
    }

    #[test]
    fn extracts_bare_braces() {
        let text = "prefix {\"a\": 1} suffix";
        assert_eq!(extract_json_block(text).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn none_without_json() {
        assert!(extract_json_block("plain prose").is_none());
    }
}
