//! sudo 身份集成测试：以脚本替身代替 sudo，验证 preflight 缓存、命令输出分类与以沙箱身份发信号
//!
//! 替身脚本在单个测试中写出并执行，避免并发 fork 持有脚本写句柄。
#![cfg(unix)]

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use terminus::sandbox::{
        CommandExecutor, CommandPolicy, Principal, SandboxError, ShellInvocation, ShellSandbox,
    };

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn sandbox(user: &str, program: &Path) -> ShellSandbox {
        ShellSandbox::new(
            Principal::Sudo {
                user: user.to_string(),
                program: program.display().to_string(),
            },
            ShellInvocation::new("sh", false),
            CommandPolicy::new(2000, true, vec![]),
        )
        .with_kill_grace(Duration::from_millis(200))
    }

    fn log_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    #[tokio::test]
    async fn test_sudo_principal_with_stand_in_program() {
        let Some(user) = nix::unistd::User::from_uid(nix::unistd::getuid())
            .ok()
            .flatten()
            .map(|u| u.name)
        else {
            eprintln!("current uid has no passwd entry, skipping");
            return;
        };

        let dir = tempfile::tempdir().unwrap();
        let ok_log = dir.path().join("ok.log");
        let refuse_log = dir.path().join("refuse.log");
        // 记录参数后去掉 `-n -u <user>`，执行剩余命令
        let ok = write_script(
            dir.path(),
            "sudo-ok",
            &format!(
                "#!/bin/sh\necho \"$*\" >> '{}'\nshift 3\nexec \"$@\"\n",
                ok_log.display()
            ),
        );
        let refuse = write_script(
            dir.path(),
            "sudo-refuse",
            &format!(
                "#!/bin/sh\necho refused >> '{}'\necho 'sudo: a password is required' >&2\nexit 1\n",
                refuse_log.display()
            ),
        );

        // 命令自己输出 sudo 风格的错误：仍是普通的步骤结果
        let sb = sandbox(&user, &ok);
        let out = sb
            .run(
                "echo 'sudo: a terminal is required to read the password' >&2; exit 1",
                Duration::from_secs(10),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, 1);
        assert!(out.stderr.contains("a terminal is required"));

        let out = sb
            .run("echo again", Duration::from_secs(10), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.stdout, "again\n");
        let preflight = format!("-n -u {user} true");
        assert_eq!(
            log_lines(&ok_log).iter().filter(|l| **l == preflight).count(),
            1,
            "preflight should run once: {:?}",
            log_lines(&ok_log)
        );

        // 中止时以沙箱身份向进程组发 TERM
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });
        let err = sb
            .run("sleep 30", Duration::from_secs(30), cancel)
            .await
            .unwrap_err();
        assert_eq!(err, SandboxError::Cancelled);
        let term_prefix = format!("-n -u {user} kill -s TERM -- -");
        assert!(
            log_lines(&ok_log).iter().any(|l| l.starts_with(&term_prefix)),
            "{:?}",
            log_lines(&ok_log)
        );

        // sudo 拒绝切换身份：身份错误，且结果被缓存
        let sb = sandbox(&user, &refuse);
        for _ in 0..2 {
            let err = sb
                .run("true", Duration::from_secs(10), CancellationToken::new())
                .await
                .unwrap_err();
            match err {
                SandboxError::Privilege(message) => {
                    assert!(message.contains("password is required"), "{message}")
                }
                other => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!(log_lines(&refuse_log).len(), 1);
    }
}
