//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TERMINUS__*` 覆盖（双下划线表示嵌套，如 `TERMINUS__SANDBOX__USER=runner`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub session: SessionSection,
    pub sandbox: SandboxSection,
    pub llm: LlmSection,
    pub server: ServerSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    /// 日志是否输出为 JSON
    #[serde(default)]
    pub log_json: bool,
}

/// [session] 段：重规划上限、目标长度、计划规模
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// 连续失败超过该值即终止会话（而非继续重规划）
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_max_goal_len")]
    pub max_goal_len: usize,
    #[serde(default = "default_max_plan_steps")]
    pub max_plan_steps: usize,
    /// 重规划时附带的历史 JSON 最大字符数
    #[serde(default = "default_history_context_chars")]
    pub history_context_chars: usize,
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_max_goal_len() -> usize {
    2000
}

fn default_max_plan_steps() -> usize {
    50
}

fn default_history_context_chars() -> usize {
    6000
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_consecutive_failures(),
            max_goal_len: default_max_goal_len(),
            max_plan_steps: default_max_plan_steps(),
            history_context_chars: default_history_context_chars(),
        }
    }
}

/// 沙箱执行身份的切换方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeMechanism {
    /// `sudo -n -u <user>`（默认）
    #[default]
    Sudo,
    /// 服务以 root 运行时直接 setuid/setgid
    Setuid,
    /// 不切换身份，仅用于开发与测试
    Inherit,
}

/// [sandbox] 段：执行身份、Shell、超时、输出上限与命令筛查
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSection {
    #[serde(default = "default_sandbox_user")]
    pub user: String,
    #[serde(default)]
    pub mechanism: PrivilegeMechanism,
    /// sudo 可执行文件（PATH 中的名称或绝对路径）
    #[serde(default = "default_sudo_program")]
    pub sudo_program: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_true")]
    pub login_shell: bool,
    #[serde(default = "default_sandbox_timeout_secs")]
    pub timeout_secs: u64,
    /// 单个输出流（stdout / stderr）的捕获上限（字节）
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// 超时或中止时 SIGTERM 到 SIGKILL 的间隔
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    #[serde(default = "default_max_command_len")]
    pub max_command_len: usize,
    #[serde(default = "default_true")]
    pub strict_sanitize: bool,
    /// 允许的命令名（仅首词）；为空表示不限制
    #[serde(default)]
    pub allowlist: Vec<String>,
}

fn default_sandbox_user() -> String {
    "sandboxuser".to_string()
}

fn default_sudo_program() -> String {
    "sudo".to_string()
}

fn default_shell() -> String {
    "bash".to_string()
}

fn default_true() -> bool {
    true
}

fn default_sandbox_timeout_secs() -> u64 {
    60
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

fn default_kill_grace_ms() -> u64 {
    500
}

fn default_max_command_len() -> usize {
    2000
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            user: default_sandbox_user(),
            mechanism: PrivilegeMechanism::default(),
            sudo_program: default_sudo_program(),
            shell: default_shell(),
            login_shell: true,
            timeout_secs: default_sandbox_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            kill_grace_ms: default_kill_grace_ms(),
            max_command_len: default_max_command_len(),
            strict_sanitize: true,
            allowlist: Vec::new(),
        }
    }
}

impl SandboxSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// [llm] 段：模型、端点、重试与翻译前后的前缀规则
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 强制使用离线确定性网关（无 API Key 时也会自动启用）
    #[serde(default)]
    pub fake: bool,
    pub base_url: Option<String>,
    #[serde(default = "default_planner_model")]
    pub planner_model: String,
    #[serde(default = "default_translator_model")]
    pub translator_model: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_safety_prefix")]
    pub safety_prefix: String,
    /// 首词命中时，步骤文本本身即命令，不调用翻译模型
    #[serde(default = "default_passthrough_prefixes")]
    pub passthrough_prefixes: Vec<String>,
    /// 翻译结果以这些前缀开头时视为翻译失败（GUI 终端 / Windows Shell）
    #[serde(default = "default_forbidden_prefixes")]
    pub forbidden_prefixes: Vec<String>,
}

fn default_planner_model() -> String {
    "gpt-5".to_string()
}

fn default_translator_model() -> String {
    "gpt-oss-20b".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    750
}

fn default_safety_prefix() -> String {
    "terminus-".to_string()
}

fn default_passthrough_prefixes() -> Vec<String> {
    [
        "if", "while", "curl", "sudo", "rm", "wget", "apt", "apt-get", "dnf", "yum", "brew",
        "bash", "echo", "cat", "ls", "cd", "mkdir", "touch",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_forbidden_prefixes() -> Vec<String> {
    ["open -a terminal", "cmd ", "cmd.exe", "start ", "powershell"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            fake: false,
            base_url: None,
            planner_model: default_planner_model(),
            translator_model: default_translator_model(),
            request_timeout_secs: default_request_timeout(),
            retries: default_retries(),
            backoff_ms: default_backoff_ms(),
            safety_prefix: default_safety_prefix(),
            passthrough_prefixes: default_passthrough_prefixes(),
            forbidden_prefixes: default_forbidden_prefixes(),
        }
    }
}

/// [server] 段：WebSocket 监听地址、健康检查地址、限流与清理周期
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// /healthz、/readyz、/metrics 的 HTTP 监听地址
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    #[serde(default = "default_min_submit_interval_ms")]
    pub min_submit_interval_ms: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_http_addr() -> String {
    "127.0.0.1:8001".to_string()
}

fn default_min_submit_interval_ms() -> u64 {
    2000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_addr: default_http_addr(),
            min_submit_interval_ms: default_min_submit_interval_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 TERMINUS__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TERMINUS__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TERMINUS")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("sandbox.allowlist")
            .with_list_parse_key("llm.passthrough_prefixes")
            .with_list_parse_key("llm.forbidden_prefixes")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_complete() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.session.max_consecutive_failures, 3);
        assert_eq!(cfg.sandbox.mechanism, PrivilegeMechanism::Sudo);
        assert_eq!(cfg.sandbox.timeout(), Duration::from_secs(60));
        assert!(cfg.llm.passthrough_prefixes.iter().any(|p| p == "echo"));
        assert!(cfg.sandbox.allowlist.is_empty());
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[session]
max_consecutive_failures = 5

[sandbox]
mechanism = "inherit"
shell = "sh"
allowlist = ["echo", "ls"]
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.session.max_consecutive_failures, 5);
        assert_eq!(cfg.session.max_goal_len, 2000);
        assert_eq!(cfg.sandbox.mechanism, PrivilegeMechanism::Inherit);
        assert_eq!(cfg.sandbox.shell, "sh");
        assert_eq!(cfg.sandbox.allowlist, vec!["echo".to_string(), "ls".to_string()]);
        assert_eq!(cfg.sandbox.user, "sandboxuser");
    }
}
