//! Terminus Server - WebSocket 前端
//!
//! 每个连接对应一个会话，流式推送其事件；`server.http_addr` 上提供 /healthz、/readyz、/metrics。
//!
//! 运行方式：
//! ```bash
//! cargo run --bin terminus-server --features server
//! ```

use std::sync::Arc;

use terminus::core::create_engine_builder;
use terminus::observability::{self, Readiness};
use terminus::server::Hub;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let builder = create_engine_builder(None);
    observability::init(builder.config().app.log_json);
    observability::init_metrics();
    let readiness = Readiness::check(builder.config());
    readiness.log();

    let registry = Arc::new(builder.build_registry());
    let hub = Hub::new(builder.config().server.clone(), registry, readiness);

    let shutdown = hub.shutdown_token();
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
            shutdown.cancel();
        }
    });

    tracing::info!("Press Ctrl+C to stop");
    hub.run().await.map_err(anyhow::Error::msg)?;
    Ok(())
}
