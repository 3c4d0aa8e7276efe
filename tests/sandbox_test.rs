//! 沙箱执行器集成测试：以 inherit 身份运行真实 `sh -c` 进程
#![cfg(unix)]

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use tokio_util::sync::CancellationToken;

    use terminus::config::{PrivilegeMechanism, SandboxSection};
    use terminus::sandbox::{
        CommandExecutor, CommandPolicy, Principal, SandboxError, ShellInvocation, ShellSandbox,
    };

    fn sandbox() -> ShellSandbox {
        ShellSandbox::new(
            Principal::Inherit,
            ShellInvocation::new("sh", false),
            CommandPolicy::new(2000, true, vec![]),
        )
        .with_kill_grace(Duration::from_millis(200))
    }

    async fn run(
        sandbox: &ShellSandbox,
        command: &str,
    ) -> Result<terminus::sandbox::ExecOutput, SandboxError> {
        sandbox
            .run(command, Duration::from_secs(10), CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_captures_stdout_stderr_and_exit_code() {
        let sb = sandbox();
        let out = run(&sb, "echo hello").await.unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.exit_code, 0);

        let out = run(&sb, "echo oops 1>&2; exit 3").await.unwrap();
        assert_eq!(out.stdout, "");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn test_killed_by_signal_maps_to_128_plus_signal() {
        let out = run(&sandbox(), "kill -9 $$").await.unwrap();
        assert_eq!(out.exit_code, 137);
    }

    #[tokio::test]
    async fn test_output_is_bounded_with_marker() {
        let sb = sandbox().with_max_output_bytes(100);
        let out = run(&sb, "head -c 1000 /dev/zero | tr '\\000' a").await.unwrap();
        assert!(out.stdout.starts_with(&"a".repeat(100)));
        assert!(out.stdout.ends_with("...[truncated 900 bytes]"), "{}", out.stdout);
    }

    #[tokio::test]
    async fn test_timeout_terminates_and_reports() {
        let start = Instant::now();
        let err = sandbox()
            .run("echo started; sleep 30", Duration::from_millis(300), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(5));
        match err {
            SandboxError::Timeout { after, stdout, .. } => {
                assert_eq!(after, Duration::from_millis(300));
                assert_eq!(stdout, "started\n");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_kills_the_process_tree() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let command = format!("(sleep 1; echo late > {}) & wait", marker.display());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let sb = sandbox();
        let err = sb.run(&command, Duration::from_secs(10), cancel).await.unwrap_err();
        assert_eq!(err, SandboxError::Cancelled);

        // 后台子进程若存活，会在 1 秒后写出 marker
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_lingering_background_job_does_not_block() {
        let start = Instant::now();
        let out = run(&sandbox(), "sleep 30 & echo done").await.unwrap();
        assert_eq!(out.stdout, "done\n");
        assert_eq!(out.exit_code, 0);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_policy_rejections_are_normal_results() {
        let sb = ShellSandbox::new(
            Principal::Inherit,
            ShellInvocation::new("sh", false),
            CommandPolicy::new(2000, true, vec!["echo".to_string()]),
        );
        let out = run(&sb, "ls -la").await.unwrap();
        assert_eq!(out.exit_code, -2);
        assert!(out.stderr.starts_with("Rejected:"));

        let out = run(&sb, "   ").await.unwrap();
        assert_eq!(out.exit_code, -2);

        let out = run(&sb, "echo allowed").await.unwrap();
        assert_eq!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn test_from_config_inherit() {
        let cfg = SandboxSection {
            mechanism: PrivilegeMechanism::Inherit,
            shell: "sh".to_string(),
            login_shell: false,
            ..SandboxSection::default()
        };
        let sb = ShellSandbox::from_config(&cfg);
        assert_eq!(sb.principal(), "inherit");
        let out = run(&sb, "printf ok").await.unwrap();
        assert_eq!(out.stdout, "ok");
    }

    /// 仅在 `sudo -n -u <当前用户> true` 可用时运行
    #[tokio::test]
    async fn test_sudo_cancel_leaves_no_group_member_behind() {
        let Some(user) = nix::unistd::User::from_uid(nix::unistd::getuid())
            .ok()
            .flatten()
            .map(|u| u.name)
        else {
            return;
        };
        let sudo_ready = tokio::process::Command::new("sudo")
            .args(["-n", "-u", user.as_str(), "true"])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .is_ok_and(|s| s.success());
        if !sudo_ready {
            eprintln!("sudo -n unavailable, skipping");
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late");
        let command = format!("(sleep 1; echo late > {}) & sleep 30", marker.display());
        let sb = ShellSandbox::new(
            Principal::Sudo {
                user,
                program: "sudo".to_string(),
            },
            ShellInvocation::new("sh", false),
            CommandPolicy::new(2000, true, vec![]),
        )
        .with_kill_grace(Duration::from_millis(200));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });
        let start = Instant::now();
        let err = sb.run(&command, Duration::from_secs(30), cancel).await.unwrap_err();
        assert_eq!(err, SandboxError::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(5));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
