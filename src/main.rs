//! Terminus - 无头演示入口
//!
//! 从命令行参数（或 TERMINUS_GOAL）读取目标，提交一个会话，逐行打印 JSON 事件；
//! 工作流未成功时以非零状态退出。
//!
//! ```bash
//! TERMINUS__LLM__FAKE=true TERMINUS__SANDBOX__MECHANISM=inherit \
//!     cargo run -- "print hello -> cause failure -> print done"
//! ```

use std::process::ExitCode;

use anyhow::Context;
use terminus::core::create_engine_builder;
use terminus::observability::{self, Readiness};
use terminus::SessionStatus;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let goal = std::env::args()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let goal = if goal.trim().is_empty() {
        std::env::var("TERMINUS_GOAL").unwrap_or_default()
    } else {
        goal
    };

    let builder = create_engine_builder(None);
    observability::init(builder.config().app.log_json);
    observability::init_metrics();
    Readiness::check(builder.config()).log();

    let registry = builder.build_registry();
    let mut handle = registry
        .submit(None, &goal)
        .await
        .context("Failed to submit goal")?;

    let mut interrupted = false;
    loop {
        tokio::select! {
            event = handle.events.recv() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                if event.event.is_terminal() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                tracing::info!("Received Ctrl+C, aborting workflow");
                interrupted = true;
                registry.abort(&handle.session_id).await?;
            }
        }
    }

    let snapshot = registry.wait(&handle.session_id).await?;
    registry.shutdown().await;
    Ok(if snapshot.status == SessionStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
