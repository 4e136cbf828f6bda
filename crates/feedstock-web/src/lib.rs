//! HTTP trigger endpoints for the ingestion jobs.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use feedstock_sync::{JobRunner, SyncConfig};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "feedstock-web";

const SUCCESS_TEXT: &str = "This HTTP triggered function executed successfully.";
const FAILURE_TEXT: &str = "This HTTP triggered function executed successfully. No body received.";

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<JobRunner>,
}

impl AppState {
    pub fn new(runner: JobRunner) -> Self {
        Self {
            runner: Arc::new(runner),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/{job}", get(trigger_handler).post(trigger_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "trigger endpoints listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env(addr: &str) -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let runner = JobRunner::from_config(&config).await?;
    serve(addr, AppState::new(runner)).await
}

/// Body text for a finished trigger. The caller's `name` is echoed on success.
pub fn trigger_message(success: bool, name: Option<&str>) -> String {
    match (success, name) {
        (true, Some(name)) => format!("{name}: {SUCCESS_TEXT}"),
        (true, None) => SUCCESS_TEXT.to_string(),
        (false, _) => FAILURE_TEXT.to_string(),
    }
}

fn name_from_body(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("name")?.as_str().map(str::to_string)
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(job): AxumPath<String>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    info!(job = %job, "http trigger received");
    if state.runner.registry().job(&job).is_none() {
        return (StatusCode::NOT_FOUND, format!("no job named {job}")).into_response();
    }

    let name = query
        .get("name")
        .filter(|n| !n.is_empty())
        .cloned()
        .or_else(|| name_from_body(&body));

    // Failures only show up in the body text and the run journal.
    let outcome = state.runner.run(&job).await;
    info!(job = %job, success = outcome.success, run_id = %outcome.run_id, "trigger finished");
    (StatusCode::OK, trigger_message(outcome.success, name.as_deref())).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use feedstock_adapters::{AdapterError, AdapterServices, PdfConverter};
    use feedstock_storage::{CannedTransport, MemoryObjectStore, StaticCredentialProvider};
    use feedstock_sync::{DeleteGuard, JobRegistry, MemoryTableSink};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const REGISTRY: &str = "\
jobs:
  - job_id: drivers
    source:
      kind: drivers
  - job_id: eia
    source:
      kind: eia
";

    struct NoPdfs;

    #[async_trait]
    impl PdfConverter for NoPdfs {
        async fn to_markdown(&self, _pdf: &[u8]) -> Result<String, AdapterError> {
            Err(AdapterError::Converter("unused".into()))
        }
    }

    fn test_app() -> Router {
        let services = AdapterServices {
            http: Arc::new(CannedTransport::new()),
            store: Arc::new(MemoryObjectStore::new()),
            secrets: Arc::new(StaticCredentialProvider::new()),
        };
        let runner = JobRunner::new(
            JobRegistry::from_yaml(REGISTRY).unwrap(),
            services,
            Arc::new(MemoryTableSink::new()),
            DeleteGuard::default(),
            Arc::new(NoPdfs),
        );
        app(AppState::new(runner))
    }

    async fn send(app: Router, request: axum::http::Request<Body>) -> (StatusCode, String) {
        let resp = app.oneshot(request).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn get_trigger_echoes_query_name() {
        let (status, text) = send(
            test_app(),
            axum::http::Request::builder()
                .uri("/api/drivers?name=ops")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "ops: This HTTP triggered function executed successfully.");
    }

    #[tokio::test]
    async fn post_trigger_reads_name_from_json_body() {
        let (status, text) = send(
            test_app(),
            axum::http::Request::builder()
                .method("POST")
                .uri("/api/drivers")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"name": "scheduler"}"#))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "scheduler: This HTTP triggered function executed successfully.");
    }

    #[tokio::test]
    async fn failed_job_still_answers_ok() {
        let (status, text) = send(
            test_app(),
            axum::http::Request::builder()
                .uri("/api/eia?name=ops")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, FAILURE_TEXT);
    }

    #[tokio::test]
    async fn unregistered_job_is_not_found() {
        let (status, _) = send(
            test_app(),
            axum::http::Request::builder()
                .uri("/api/acc")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn healthz_answers() {
        let (status, text) = send(
            test_app(),
            axum::http::Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "ok");
    }

    #[test]
    fn anonymous_success_has_no_prefix() {
        assert_eq!(trigger_message(true, None), SUCCESS_TEXT);
        assert_eq!(trigger_message(false, Some("ops")), FAILURE_TEXT);
    }
}
