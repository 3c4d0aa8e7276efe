//! ShellSandbox：通过 Shell 在沙箱身份下执行命令
//!
//! 首次执行前做一次身份 preflight 并缓存结果。子进程独占一个进程组；超时或中止时
//! 先向整个进程组发 SIGTERM，宽限期后 SIGKILL。sudo 身份下组内进程属于沙箱用户，
//! 信号同时以沙箱身份发送。stdout / stderr 分别由独立任务有界读取。
//! 每次调用输出一条结构化审计日志。

use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Child;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SandboxSection;
use crate::observability::metrics;
use crate::sandbox::{
    preview, read_bounded, Captured, CommandExecutor, CommandPolicy, ExecOutput, GroupSignal,
    Principal, SandboxError, ShellInvocation, EXIT_CODE_UNAVAILABLE,
};

/// 基于 Shell 的沙箱执行器
pub struct ShellSandbox {
    principal: Principal,
    shell: ShellInvocation,
    policy: CommandPolicy,
    max_output_bytes: usize,
    kill_grace: Duration,
    preflight: OnceCell<Result<(), SandboxError>>,
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ShellSandbox {
    pub fn new(principal: Principal, shell: ShellInvocation, policy: CommandPolicy) -> Self {
        Self {
            principal,
            shell,
            policy,
            max_output_bytes: 64 * 1024,
            kill_grace: Duration::from_millis(500),
            preflight: OnceCell::new(),
        }
    }

    pub fn from_config(cfg: &SandboxSection) -> Self {
        Self::new(
            Principal::from_config(cfg),
            ShellInvocation::new(cfg.shell.clone(), cfg.login_shell),
            CommandPolicy::from_config(cfg),
        )
        .with_max_output_bytes(cfg.max_output_bytes)
        .with_kill_grace(Duration::from_millis(cfg.kill_grace_ms))
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// 身份 preflight，只执行一次
    async fn ensure_principal(&self) -> Result<(), SandboxError> {
        self.preflight
            .get_or_init(|| async {
                let result = self.principal.preflight().await;
                match &result {
                    Ok(()) => tracing::info!(principal = %self.principal.describe(), "sandbox principal ready"),
                    Err(e) => tracing::error!(principal = %self.principal.describe(), error = %e, "sandbox principal unavailable"),
                }
                result
            })
            .await
            .clone()
    }

    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<ExecOutput, SandboxError> {
        if let Err(reason) = self.policy.screen(command) {
            return Ok(ExecOutput::rejected(&reason));
        }
        self.ensure_principal().await?;

        let mut cmd = self.principal.prepare(&self.shell, command)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;
        let pid = child.id();

        let limit = self.max_output_bytes;
        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(async move { read_bounded(out, limit).await }));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(async move { read_bounded(err, limit).await }));

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(timeout) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        match waited {
            Waited::Exited(status) => {
                let status = status.map_err(|e| SandboxError::Spawn(e.to_string()))?;
                // Shell 退出后，组内残留的后台进程会持有管道写端；先清理整个组，管道中已有输出仍可读出
                if let Some(pid) = pid {
                    self.signal_tree(pid, GroupSignal::Kill).await;
                }
                let stdout = collect(stdout_task, self.kill_grace).await;
                let stderr = collect(stderr_task, self.kill_grace).await;
                Ok(ExecOutput {
                    stdout,
                    stderr,
                    exit_code: exit_code(&status),
                    duration_ms: start.elapsed().as_millis() as u64,
                })
            }
            Waited::TimedOut => {
                self.terminate(&mut child, pid).await;
                let stdout = collect(stdout_task, self.kill_grace).await;
                let stderr = collect(stderr_task, self.kill_grace).await;
                Err(SandboxError::Timeout {
                    after: timeout,
                    stdout,
                    stderr,
                })
            }
            Waited::Cancelled => {
                self.terminate(&mut child, pid).await;
                if let Some(task) = stdout_task {
                    task.abort();
                }
                if let Some(task) = stderr_task {
                    task.abort();
                }
                Err(SandboxError::Cancelled)
            }
        }
    }

    /// 终止子进程树：SIGTERM 整个进程组，宽限期后 SIGKILL
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        if let Some(pid) = pid {
            self.signal_tree(pid, GroupSignal::Term).await;
        }
        let exited = tokio::time::timeout(self.kill_grace, child.wait())
            .await
            .is_ok();
        if let Some(pid) = pid {
            self.signal_tree(pid, GroupSignal::Kill).await;
        }
        if !exited {
            let _ = child.kill().await;
        }
        tracing::debug!(pid = ?pid, graceful = exited, "process group terminated");
    }

    /// 向进程组发信号：先以服务身份 killpg，组内仍有成员时再以沙箱身份发送
    async fn signal_tree(&self, pgid: u32, sig: GroupSignal) {
        if signal_group(pgid, sig) == GroupState::Gone {
            return;
        }
        self.principal.signal_group(pgid, sig).await;
    }
}

#[async_trait]
impl CommandExecutor for ShellSandbox {
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<ExecOutput, SandboxError> {
        let start = Instant::now();
        let result = self.execute(command, timeout, cancel).await;
        metrics().sandbox_latency.observe(start.elapsed());

        let (outcome, exit_code) = match &result {
            Ok(out) if out.exit_code == crate::sandbox::EXIT_CODE_REJECTED => ("rejected", out.exit_code),
            Ok(out) => ("exited", out.exit_code),
            Err(SandboxError::Timeout { .. }) => ("timeout", crate::sandbox::EXIT_CODE_TIMEOUT),
            Err(SandboxError::Privilege(_)) => ("privilege", EXIT_CODE_UNAVAILABLE),
            Err(SandboxError::Spawn(_)) => ("spawn_error", EXIT_CODE_UNAVAILABLE),
            Err(SandboxError::Cancelled) => ("cancelled", EXIT_CODE_UNAVAILABLE),
        };
        let audit = serde_json::json!({
            "event": "sandbox_audit",
            "principal": self.principal.describe(),
            "outcome": outcome,
            "exit_code": exit_code,
            "duration_ms": start.elapsed().as_millis() as u64,
            "command_preview": preview(command, 200),
        });
        tracing::info!(audit = %audit, "sandbox_exec");

        result
    }

    fn principal(&self) -> String {
        self.principal.describe()
    }
}

/// 等待读取任务结束；超过宽限期则放弃（只丢失输出，不阻塞会话）
async fn collect(
    task: Option<JoinHandle<std::io::Result<Captured>>>,
    grace: Duration,
) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(Ok(captured))) => captured.into_text(),
        Ok(Ok(Err(e))) => format!("...[output read failed: {e}]"),
        Ok(Err(_)) => String::new(),
        Err(_) => {
            task.abort();
            "...[output unavailable: stream still open]".to_string()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    /// 组内已无进程
    Gone,
    /// 组内仍可能有服务身份无权发信号的成员
    Remaining,
}

#[cfg(unix)]
fn signal_group(pgid: u32, sig: GroupSignal) -> GroupState {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match sig {
        GroupSignal::Term => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pgid as i32), signal) {
        Err(Errno::ESRCH) => GroupState::Gone,
        Err(Errno::EPERM) | Ok(()) => GroupState::Remaining,
        Err(e) => {
            tracing::warn!(pgid, error = %e, "killpg failed");
            GroupState::Remaining
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _sig: GroupSignal) -> GroupState {
    GroupState::Remaining
}

fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    EXIT_CODE_UNAVAILABLE
}
