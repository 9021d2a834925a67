//! Axum JSON API over the record store and the sync controller.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use otsync_core::{ErrorKind, Record, SyncOutcome, VersionInfo};
use otsync_storage::{RecordFilter, RecordStore, SearchField};
use otsync_sync::{format_version_tag, ControlError, ControlHandle};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const DEFAULT_PORT: u16 = 8000;

#[derive(Clone)]
pub struct AppState {
    pub handle: ControlHandle,
    pub store: Arc<dyn RecordStore>,
}

impl AppState {
    pub fn new(handle: ControlHandle, store: Arc<dyn RecordStore>) -> Self {
        Self { handle, store }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RecordsQuery {
    q: Option<String>,
    by: Option<String>,
    client: Option<String>,
}

#[derive(Debug, Serialize)]
struct RecordsPage {
    total: usize,
    records: Vec<Record>,
}

#[derive(Debug, Deserialize)]
struct ScheduleBody {
    enabled: bool,
    interval_min: u64,
}

#[derive(Debug, Deserialize, Default)]
struct CheckQuery {
    #[serde(default)]
    urgent: bool,
}

#[derive(Debug, Serialize)]
struct VersionView {
    local_version: String,
    latest_release: Option<VersionInfo>,
    display_tag: Option<String>,
    update_available: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/records", get(records_handler))
        .route("/api/clients", get(clients_handler))
        .route("/api/status", get(status_handler))
        .route("/api/sync", post(sync_handler))
        .route("/api/schedule", put(schedule_handler))
        .route("/api/version", get(version_handler))
        .route("/api/version/check", post(version_check_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("OTSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

pub async fn serve_from_env(state: AppState) -> anyhow::Result<()> {
    let port = port_from_env();
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn records_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecordsQuery>,
) -> Response {
    let search_by = match query.by.as_deref().filter(|b| !b.is_empty()) {
        None => SearchField::default(),
        Some(name) => match SearchField::parse(name) {
            Some(field) => field,
            None => return api_error(StatusCode::BAD_REQUEST, format!("unknown column {name:?}")),
        },
    };
    let filter = RecordFilter {
        text: query.q.unwrap_or_default(),
        search_by,
        client: query.client.filter(|c| !c.is_empty()),
    };
    match state.store.list(&filter).await {
        Ok(records) => Json(RecordsPage {
            total: records.len(),
            records,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn clients_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.distinct_clients().await {
        Ok(clients) => Json(clients).into_response(),
        Err(err) => server_error(err),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.handle.status().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => control_error(err),
    }
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.handle.sync_now().await {
        Ok(outcome) => (sync_status_code(&outcome), Json(outcome)).into_response(),
        Err(err) => control_error(err),
    }
}

fn sync_status_code(outcome: &SyncOutcome) -> StatusCode {
    match outcome.error.as_ref().map(|e| e.kind) {
        None => StatusCode::OK,
        Some(ErrorKind::AlreadyRunning) => StatusCode::CONFLICT,
        Some(ErrorKind::MissingCredentials) => StatusCode::PRECONDITION_FAILED,
        Some(_) => StatusCode::BAD_GATEWAY,
    }
}

async fn schedule_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ScheduleBody>,
) -> Response {
    match state.handle.configure(body.enabled, body.interval_min).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => control_error(err),
    }
}

async fn version_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.handle.status().await {
        Ok(snapshot) => Json(VersionView {
            display_tag: snapshot
                .latest_release
                .as_ref()
                .map(|r| format_version_tag(&r.tag)),
            local_version: snapshot.local_version,
            latest_release: snapshot.latest_release,
            update_available: snapshot.update_available,
        })
        .into_response(),
        Err(err) => control_error(err),
    }
}

async fn version_check_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CheckQuery>,
) -> Response {
    match state.handle.check_version(query.urgent).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => control_error(err),
    }
}

fn api_error(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    warn!(error = %err, "request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn control_error(err: ControlError) -> Response {
    match err {
        ControlError::Gone => api_error(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        ControlError::Config(_) => server_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use otsync_adapters::{FetchContext, FetchError, RawRow, RemoteFetch};
    use otsync_storage::{CheckError, MemoryRecordStore, ReleaseDocument, ReleaseFeed};
    use otsync_sync::{AppConfig, Controller, SyncOrchestrator, VersionChecker};
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Rows;

    #[async_trait]
    impl RemoteFetch for Rows {
        fn source_id(&self) -> &str {
            "rows"
        }

        async fn fetch_batch(&self, _ctx: &FetchContext) -> Result<Vec<RawRow>, FetchError> {
            let row = |key: &str, desc: &str, client: &str| {
                RawRow::new(vec![
                    Some(key.into()),
                    Some(desc.into()),
                    None,
                    Some("02/01/26 08:30:00".into()),
                    Some(client.into()),
                ])
            };
            Ok(vec![
                row("OT-1", "Replace pump seal", "ACME"),
                row("OT-2", "Inspect pump housing", "Globex"),
                row("OT-3", "Paint fence", "ACME"),
            ])
        }
    }

    struct NoFeed;

    #[async_trait]
    impl ReleaseFeed for NoFeed {
        async fn latest_release(
            &self,
            _timeout: Duration,
        ) -> Result<ReleaseDocument, CheckError> {
            Err(CheckError::Malformed("offline".into()))
        }
    }

    fn test_app() -> Router {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let orchestrator = Arc::new(SyncOrchestrator::new(Arc::new(Rows), Arc::clone(&store)));
        let checker = Arc::new(VersionChecker::new(Arc::new(NoFeed), "1.0.0"));
        let config = AppConfig {
            check_version_on_startup: false,
            ..Default::default()
        };
        let (controller, handle) = Controller::new(
            otsync_sync::AppState::ephemeral(config),
            orchestrator,
            checker,
        );
        controller.spawn();
        app(AppState::new(handle, store))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_is_plain_text() {
        let resp = test_app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn manual_sync_then_filtered_listing() {
        let app = test_app();
        let (status, outcome) = call(&app, "POST", "/api/sync", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["new_count"], 3);

        let (_, page) = call(&app, "GET", "/api/records?q=PUMP&by=description", None).await;
        assert_eq!(page["total"], 2);
        assert_eq!(page["records"][0]["key"], "OT-2");
        assert_eq!(page["records"][0]["fields"]["date"], "2026-01-02");

        let (_, page) = call(&app, "GET", "/api/records?q=pump&by=description&client=ACME", None).await;
        assert_eq!(page["total"], 1);

        let (_, clients) = call(&app, "GET", "/api/clients", None).await;
        assert_eq!(clients, serde_json::json!(["ACME", "Globex"]));
    }

    #[tokio::test]
    async fn unknown_search_column_is_a_bad_request() {
        let (status, body) = call(&test_app(), "GET", "/api/records?by=colour", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("colour"));
    }

    #[tokio::test]
    async fn schedule_update_is_reflected_in_status() {
        let app = test_app();
        let (status, snapshot) = call(
            &app,
            "PUT",
            "/api/schedule",
            Some(serde_json::json!({ "enabled": true, "interval_min": 15 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["timer_pending"], true);
        assert_eq!(snapshot["next_run_in_secs"], 900);

        let (_, snapshot) = call(&app, "GET", "/api/status", None).await;
        assert_eq!(snapshot["auto_update_interval_min"], 15);
        assert_eq!(snapshot["phase"], "idle");
        assert_eq!(snapshot["status_line"], "Ready.");
    }

    #[tokio::test]
    async fn version_endpoints_report_no_release_when_feed_is_down() {
        let app = test_app();
        let (status, body) = call(&app, "POST", "/api/version/check", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_null());

        let (_, view) = call(&app, "GET", "/api/version", None).await;
        assert_eq!(view["local_version"], "1.0.0");
        assert_eq!(view["update_available"], false);
    }
}
