//! 启动就绪检查：API Key 与沙箱用户
//!
//! 缺少 API Key（且未显式启用离线网关）视为未就绪；沙箱用户缺失只记录问题，
//! 执行时由沙箱 preflight 报告为身份错误。

use serde::Serialize;

use crate::config::{AppConfig, PrivilegeMechanism};
use crate::sandbox::privilege::lookup_user;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub issues: Vec<String>,
}

impl Readiness {
    /// 读取 OPENAI_API_KEY 并检查配置
    pub fn check(cfg: &AppConfig) -> Self {
        let key = std::env::var("OPENAI_API_KEY").ok();
        Self::evaluate(cfg, key.as_deref())
    }

    pub fn evaluate(cfg: &AppConfig, api_key: Option<&str>) -> Self {
        let mut ready = true;
        let mut issues = Vec::new();

        if api_key.map_or(true, |k| k.trim().is_empty()) {
            if cfg.llm.fake {
                issues.push("OPENAI_API_KEY is not set; offline gateways in use".to_string());
            } else {
                ready = false;
                issues.push("OPENAI_API_KEY is not set".to_string());
            }
        }

        match cfg.sandbox.mechanism {
            PrivilegeMechanism::Inherit => {
                issues.push("sandbox mechanism 'inherit' provides no privilege separation".to_string())
            }
            PrivilegeMechanism::Sudo | PrivilegeMechanism::Setuid => {
                if let Err(e) = lookup_user(&cfg.sandbox.user) {
                    issues.push(format!("{e}; sandbox execution may fail"));
                }
            }
        }

        Self { ready, issues }
    }

    pub fn status(&self) -> &'static str {
        if self.ready {
            "ready"
        } else {
            "degraded"
        }
    }

    /// 启动日志
    pub fn log(&self) {
        if self.issues.is_empty() {
            tracing::info!(ready = self.ready, "engine_startup");
        } else {
            tracing::warn!(ready = self.ready, issues = ?self.issues, "engine_startup");
        }
    }
}
