//! 可观测性：tracing 订阅器、进程指标与启动就绪检查
//!
//! 默认 info，可通过 RUST_LOG 覆盖；`app.log_json = true` 时输出 JSON 行。
//! 日志写入 stderr，stdout 留给事件流。

pub mod metrics;
pub mod readiness;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use metrics::{metrics, Metrics, MetricsSnapshot};
pub use readiness::Readiness;

pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).try_init()
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// 初始化全局指标
pub fn init_metrics() {
    let _ = metrics();
    tracing::info!("Metrics initialized");
}
