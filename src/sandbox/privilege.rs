//! 执行身份（sandbox principal）解析
//!
//! - Sudo：`sudo -n -u <user> <shell> -lc <command>`，要求 sudo 可用且用户存在
//! - Setuid：服务本身以 root 运行，子进程直接切换 uid/gid
//! - Inherit：不切换身份，仅开发与测试使用
//!
//! 身份是否可用由一次性的 preflight 判定（sudo 下即 `sudo -n -u <user> true`），
//! 命令本身的输出一律作为普通执行结果，不参与身份判定。
//! 身份不可用时返回 `SandboxError::Privilege`，由引擎作为致命错误处理。

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::config::{PrivilegeMechanism, SandboxSection};
use crate::sandbox::SandboxError;

const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);
const SIGNAL_TIMEOUT: Duration = Duration::from_secs(5);

/// 解释命令的 Shell 及其参数
#[derive(Debug, Clone)]
pub struct ShellInvocation {
    pub program: String,
    pub login: bool,
}

impl ShellInvocation {
    pub fn new(program: impl Into<String>, login: bool) -> Self {
        Self {
            program: program.into(),
            login,
        }
    }

    fn flag(&self) -> &'static str {
        if self.login {
            "-lc"
        } else {
            "-c"
        }
    }
}

/// 终止进程组时使用的信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    Term,
    Kill,
}

impl GroupSignal {
    pub fn name(self) -> &'static str {
        match self {
            GroupSignal::Term => "TERM",
            GroupSignal::Kill => "KILL",
        }
    }
}

/// 沙箱执行身份
#[derive(Debug, Clone)]
pub enum Principal {
    /// program 为 sudo 可执行文件（名称在 PATH 中查找，含 `/` 时按路径使用）
    Sudo { user: String, program: String },
    Setuid { user: String },
    Inherit,
}

impl Principal {
    pub fn from_config(cfg: &SandboxSection) -> Self {
        match cfg.mechanism {
            PrivilegeMechanism::Sudo => Principal::Sudo {
                user: cfg.user.clone(),
                program: cfg.sudo_program.clone(),
            },
            PrivilegeMechanism::Setuid => Principal::Setuid {
                user: cfg.user.clone(),
            },
            PrivilegeMechanism::Inherit => {
                tracing::warn!("sandbox mechanism 'inherit': commands run as the service user");
                Principal::Inherit
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Principal::Sudo { user, .. } => format!("sudo:{user}"),
            Principal::Setuid { user } => format!("setuid:{user}"),
            Principal::Inherit => "inherit".to_string(),
        }
    }

    /// 构造以该身份运行 command 的进程；身份不可用时返回 Privilege 错误
    pub fn prepare(&self, shell: &ShellInvocation, command: &str) -> Result<Command, SandboxError> {
        match self {
            Principal::Sudo { user, program } => {
                let mut cmd = Command::new(resolve_sudo(program)?);
                cmd.args(["-n", "-u", user.as_str(), shell.program.as_str(), shell.flag(), command]);
                Ok(cmd)
            }
            Principal::Setuid { user } => setuid_command(user, shell, command),
            Principal::Inherit => {
                let mut cmd = Command::new(&shell.program);
                cmd.args([shell.flag(), command]);
                Ok(cmd)
            }
        }
    }

    /// 确认身份可以被切换。sudo 需要密码或 sudoers 未授权时在这里失败
    pub async fn preflight(&self) -> Result<(), SandboxError> {
        match self {
            Principal::Sudo { user, program } => {
                let sudo = resolve_sudo(program)?;
                lookup_user(user)?;
                let check = Command::new(sudo)
                    .args(["-n", "-u", user.as_str(), "true"])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .output();
                let out = tokio::time::timeout(PREFLIGHT_TIMEOUT, check)
                    .await
                    .map_err(|_| {
                        SandboxError::Privilege(format!("sudo preflight for '{user}' timed out"))
                    })?
                    .map_err(|e| SandboxError::Privilege(format!("failed to run sudo: {e}")))?;
                if out.status.success() {
                    Ok(())
                } else {
                    Err(SandboxError::Privilege(format!(
                        "sudo refused to run as '{}': {}",
                        user,
                        String::from_utf8_lossy(&out.stderr).trim()
                    )))
                }
            }
            Principal::Setuid { user } => {
                require_root()?;
                lookup_user(user).map(|_| ())
            }
            Principal::Inherit => Ok(()),
        }
    }

    /// 以沙箱身份向进程组发信号。
    ///
    /// 服务自身的 killpg 只能触达与服务同 uid 的成员（sudo 进程本身），
    /// 组内属于沙箱用户的进程需要由沙箱用户自己发信号。
    pub async fn signal_group(&self, pgid: u32, sig: GroupSignal) {
        let Principal::Sudo { user, program } = self else {
            return;
        };
        let Ok(sudo) = resolve_sudo(program) else {
            return;
        };
        let target = format!("-{pgid}");
        let kill = Command::new(sudo)
            .args(["-n", "-u", user.as_str(), "kill", "-s", sig.name(), "--", target.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(SIGNAL_TIMEOUT, kill).await {
            Ok(Ok(status)) => {
                tracing::debug!(pgid, signal = sig.name(), code = ?status.code(), "group signalled as principal");
            }
            Ok(Err(e)) => tracing::warn!(pgid, error = %e, "failed to signal group as principal"),
            Err(_) => tracing::warn!(pgid, "signalling group as principal timed out"),
        }
    }
}

fn resolve_sudo(program: &str) -> Result<PathBuf, SandboxError> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        if path.is_file() {
            return Ok(path);
        }
        return Err(SandboxError::Privilege(format!("sudo not found at {program}")));
    }
    find_in_path(program)
        .ok_or_else(|| SandboxError::Privilege(format!("{program} not found on PATH")))
}

#[cfg(unix)]
fn require_root() -> Result<(), SandboxError> {
    if nix::unistd::geteuid().is_root() {
        Ok(())
    } else {
        Err(SandboxError::Privilege(
            "setuid mechanism requires the service to run as root".to_string(),
        ))
    }
}

#[cfg(not(unix))]
fn require_root() -> Result<(), SandboxError> {
    Err(SandboxError::Privilege(
        "setuid mechanism is only available on unix".to_string(),
    ))
}

#[cfg(unix)]
pub(crate) fn lookup_user(name: &str) -> Result<nix::unistd::User, SandboxError> {
    match nix::unistd::User::from_name(name) {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(SandboxError::Privilege(format!(
            "sandbox user '{name}' not found"
        ))),
        Err(e) => Err(SandboxError::Privilege(format!(
            "failed to look up sandbox user '{name}': {e}"
        ))),
    }
}

#[cfg(not(unix))]
pub(crate) fn lookup_user(name: &str) -> Result<(), SandboxError> {
    Err(SandboxError::Privilege(format!(
        "cannot resolve sandbox user '{name}' on this platform"
    )))
}

#[cfg(unix)]
fn setuid_command(
    user: &str,
    shell: &ShellInvocation,
    command: &str,
) -> Result<Command, SandboxError> {
    require_root()?;
    let account = lookup_user(user)?;
    let mut cmd = Command::new(&shell.program);
    cmd.args([shell.flag(), command])
        .uid(account.uid.as_raw())
        .gid(account.gid.as_raw())
        .env("HOME", &account.dir)
        .env("USER", &account.name)
        .env("LOGNAME", &account.name);
    Ok(cmd)
}

#[cfg(not(unix))]
fn setuid_command(
    _user: &str,
    _shell: &ShellInvocation,
    _command: &str,
) -> Result<Command, SandboxError> {
    require_root().map(|_| Command::new("true"))
}

fn find_in_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
