//! 沙箱执行器：在受限执行身份下运行单条命令
//!
//! 隔离边界是操作系统层面的用户分离，而非命令字符串的语法清洗；
//! policy 只做执行前的便利性筛查，capture 限制输出内存，privilege 负责身份切换。

pub mod capture;
pub mod policy;
pub mod privilege;
pub mod shell;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use capture::{read_bounded, Captured};
pub use policy::CommandPolicy;
pub use privilege::{GroupSignal, Principal, ShellInvocation};
pub use shell::ShellSandbox;

/// 命令被筛查拒绝或未能派发（翻译失败）时的退出码
pub const EXIT_CODE_REJECTED: i32 = -2;
/// 启动失败或执行身份不可用时的退出码
pub const EXIT_CODE_UNAVAILABLE: i32 = -1;
/// 超时（沿用 coreutils `timeout` 的约定）
pub const EXIT_CODE_TIMEOUT: i32 = 124;

/// 一次执行的完整结果（非零退出码也属于正常结果）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl ExecOutput {
    /// 筛查拒绝：命令未被执行
    pub fn rejected(reason: &str) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("Rejected: {reason}"),
            exit_code: EXIT_CODE_REJECTED,
            duration_ms: 0,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// 执行器无法给出正常退出码的情况
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// 超时：进程组已被终止，附带截至超时的部分输出
    #[error("Command timed out after {}s", .after.as_secs_f64())]
    Timeout {
        after: Duration,
        stdout: String,
        stderr: String,
    },

    #[error("Sandbox principal unavailable: {0}")]
    Privilege(String),

    #[error("Failed to run command: {0}")]
    Spawn(String),

    /// 会话中止：进程组已被终止
    #[error("Execution cancelled")]
    Cancelled,
}

/// 沙箱执行契约：run(command, timeout) -> {stdout, stderr, exit_code}
///
/// 实现必须在 cancel 触发时终止整个子进程树并返回 `SandboxError::Cancelled`。
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<ExecOutput, SandboxError>;

    /// 执行身份描述（用于日志）
    fn principal(&self) -> String {
        "unknown".to_string()
    }
}

/// 日志中的命令预览，避免过长
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_output() {
        let out = ExecOutput::rejected("Empty command");
        assert_eq!(out.exit_code, EXIT_CODE_REJECTED);
        assert_eq!(out.stderr, "Rejected: Empty command");
        assert!(!out.success());
    }

    #[test]
    fn test_preview_is_char_safe() {
        assert_eq!(preview("短命令", 10), "短命令");
        assert_eq!(preview("ééééé", 2), "éé...");
    }
}
