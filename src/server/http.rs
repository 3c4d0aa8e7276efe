//! HTTP 健康检查与指标
//!
//! - `GET /healthz`：进程存活即 200
//! - `GET /readyz`：启动就绪检查结果，未就绪返回 503
//! - `GET /metrics`：Prometheus 文本格式

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::core::SessionRegistry;
use crate::observability::{metrics, Readiness};

#[derive(Clone)]
pub struct HttpState {
    readiness: Arc<Readiness>,
    registry: Arc<SessionRegistry>,
}

impl HttpState {
    pub fn new(readiness: Arc<Readiness>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            readiness,
            registry,
        }
    }
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(prometheus))
        .with_state(state)
}

/// 在 addr 上提供服务，shutdown 触发后优雅退出
pub async fn serve(addr: &str, state: HttpState, shutdown: CancellationToken) -> Result<(), String> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Failed to bind {}: {}", addr, e))?;
    tracing::info!("Health endpoints on http://{}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| e.to_string())
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn readyz(State(state): State<HttpState>) -> (StatusCode, Json<Value>) {
    let code = if state.readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": state.readiness.status(),
        "issues": state.readiness.issues,
        "active_sessions": state.registry.active_count().await,
    });
    (code, Json(body))
}

async fn prometheus() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics().render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Collaborators, EnginePolicy};
    use crate::gateway::{FakePlanner, FakeTranslator};
    use crate::sandbox::{CommandPolicy, Principal, ShellInvocation, ShellSandbox};

    fn state(readiness: Readiness) -> HttpState {
        let sandbox = ShellSandbox::new(
            Principal::Inherit,
            ShellInvocation::new("sh", false),
            CommandPolicy::new(256, true, vec![]),
        );
        let registry = SessionRegistry::new(
            Collaborators {
                planner: Arc::new(FakePlanner),
                translator: Arc::new(FakeTranslator),
                executor: Arc::new(sandbox),
            },
            EnginePolicy::default(),
        );
        HttpState::new(Arc::new(readiness), Arc::new(registry))
    }

    #[tokio::test]
    async fn test_readyz_reports_degraded_with_issues() {
        let degraded = Readiness {
            ready: false,
            issues: vec!["OPENAI_API_KEY is not set".to_string()],
        };
        let (code, Json(body)) = readyz(State(state(degraded))).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["issues"][0], "OPENAI_API_KEY is not set");
        assert_eq!(body["active_sessions"], 0);

        let ready = Readiness {
            ready: true,
            issues: Vec::new(),
        };
        let (code, Json(body)) = readyz(State(state(ready))).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "ready");
    }

    #[tokio::test]
    async fn test_healthz_and_metrics_bodies() {
        let Json(body) = healthz().await;
        assert_eq!(body["status"], "ok");

        metrics().execute_goal_requests.inc();
        let response = prometheus().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let ready = Readiness {
            ready: true,
            issues: Vec::new(),
        };
        let task = tokio::spawn(serve("127.0.0.1:0", state(ready), shutdown.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
