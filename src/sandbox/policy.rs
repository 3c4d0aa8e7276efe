//! 执行前命令筛查
//!
//! 单行、长度上限、控制字符、可选的首词白名单。被拒绝的命令不执行，
//! 以退出码 -2 的正常结果返回，由引擎按步骤失败处理。

use std::collections::HashSet;

use crate::config::SandboxSection;

/// 命令筛查策略
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    max_len: usize,
    strict: bool,
    allowlist: HashSet<String>,
}

impl CommandPolicy {
    pub fn new(max_len: usize, strict: bool, allowlist: Vec<String>) -> Self {
        let allowlist = allowlist
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            max_len,
            strict,
            allowlist,
        }
    }

    pub fn from_config(cfg: &SandboxSection) -> Self {
        Self::new(cfg.max_command_len, cfg.strict_sanitize, cfg.allowlist.clone())
    }

    /// 通过返回 Ok(())，拒绝返回原因
    pub fn screen(&self, command: &str) -> Result<(), String> {
        if command.trim().is_empty() {
            return Err("Empty command".to_string());
        }
        if command.chars().count() > self.max_len {
            return Err(format!(
                "Command exceeds maximum length of {} characters",
                self.max_len
            ));
        }
        if command.contains(['\n', '\r', '\0']) {
            return Err("Command contains disallowed newline or NUL characters".to_string());
        }
        if self.strict && command.chars().any(is_disallowed_control) {
            return Err("Command contains disallowed control characters".to_string());
        }
        if !self.allowlist.is_empty() {
            let first = first_word(command)?;
            if !self.allowlist.contains(&first) {
                return Err(format!("Command '{first}' not permitted by allowlist"));
            }
        }
        Ok(())
    }
}

/// 按 shell 规则切分后的首词（去掉引号）
fn first_word(command: &str) -> Result<String, String> {
    shlex::split(command)
        .and_then(|words| words.into_iter().next())
        .ok_or_else(|| "Command could not be tokenized".to_string())
}

/// ASCII 控制字符（允许水平制表符）
fn is_disallowed_control(c: char) -> bool {
    matches!(c, '\u{00}'..='\u{08}' | '\u{0b}' | '\u{0c}' | '\u{0e}'..='\u{1f}' | '\u{7f}')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CommandPolicy {
        CommandPolicy::new(256, true, vec![])
    }

    #[test]
    fn test_rejects_empty_command() {
        assert_eq!(policy().screen("   ").unwrap_err(), "Empty command");
    }

    #[test]
    fn test_rejects_newlines() {
        let err = policy().screen("echo hello\necho world").unwrap_err();
        assert!(err.to_lowercase().contains("newline"));
    }

    #[test]
    fn test_rejects_control_chars() {
        let err = policy().screen("echo \x07").unwrap_err();
        assert!(err.to_lowercase().contains("control"));
        assert!(CommandPolicy::new(256, false, vec![]).screen("echo \x07").is_ok());
    }

    #[test]
    fn test_allows_tabs() {
        assert!(policy().screen("echo\ta").is_ok());
    }

    #[test]
    fn test_rejects_excessive_length() {
        let err = CommandPolicy::new(10, true, vec![])
            .screen("echo this is too long")
            .unwrap_err();
        assert!(err.contains("exceeds"));
    }

    #[test]
    fn test_allowlist() {
        let p = CommandPolicy::new(256, true, vec!["echo".into()]);
        assert!(p.screen("echo ok").is_ok());
        let err = p.screen("uname -a").unwrap_err();
        assert!(err.contains("not permitted"));
    }

    #[test]
    fn test_allowlist_matches_quoted_first_word() {
        let p = CommandPolicy::new(256, true, vec!["ls".into()]);
        assert!(p.screen("'ls' -la").is_ok());
        assert!(p.screen("\"ls\" /tmp").is_ok());
        let err = p.screen("'rm' -rf /tmp/x").unwrap_err();
        assert_eq!(err, "Command 'rm' not permitted by allowlist");
    }

    #[test]
    fn test_allowlist_rejects_untokenizable_command() {
        let p = CommandPolicy::new(256, true, vec!["echo".into()]);
        assert_eq!(
            p.screen("echo 'unterminated").unwrap_err(),
            "Command could not be tokenized"
        );
    }
}
