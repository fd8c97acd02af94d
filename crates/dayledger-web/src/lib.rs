//! JSON query surface and manual sync trigger over axum.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use dayledger_core::{business_today, summarize, DailyMetrics, DailyMetricsRecord, MetricsSummary, SyncJob, SyncWindow};
use dayledger_sync::{SyncService, TriggerError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "dayledger-web";

const DEFAULT_RANGE_DAYS: u32 = 30;
const DEFAULT_JOB_LIMIT: i64 = 20;
const MAX_JOB_LIMIT: i64 = 200;

#[derive(Clone)]
pub struct AppState {
    pub sync: Arc<SyncService>,
}

impl AppState {
    pub fn new(sync: Arc<SyncService>) -> Self {
        Self { sync }
    }
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricsResponse {
    records: Vec<DailyMetricsRecord>,
    summary: MetricsSummary,
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest {
    user_id: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncResponse {
    records_synced: i64,
    errors: Vec<String>,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        error!(error = %err, "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

impl From<TriggerError> for ApiError {
    fn from(err: TriggerError) -> Self {
        match &err {
            TriggerError::UnknownMerchant(_) => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            TriggerError::Inactive(_) => Self::new(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
            TriggerError::AlreadyRunning { .. } => Self::new(StatusCode::CONFLICT, err.to_string()),
            TriggerError::Store(_) | TriggerError::Pipeline(_) => Self::internal(&err),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/users/{user_id}/metrics", get(metrics_handler))
        .route("/users/{user_id}/jobs", get(jobs_handler))
        .route("/sync", post(sync_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("DAYLEDGER_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "query surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<MetricsResponse>, ApiError> {
    let end = query.end.unwrap_or_else(|| business_today(Utc::now()));
    let start = query
        .start
        .unwrap_or_else(|| SyncWindow::trailing(end, DEFAULT_RANGE_DAYS).start);
    let window = SyncWindow::new(start, end).map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;

    let records = state
        .sync
        .stores()
        .metrics
        .range(&user_id, window.start, window.end)
        .await
        .map_err(ApiError::internal)?;
    let days: Vec<DailyMetrics> = records.iter().map(|r| r.metrics.clone()).collect();
    Ok(Json(MetricsResponse {
        summary: summarize(&days),
        records,
    }))
}

async fn jobs_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<Vec<SyncJob>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_JOB_LIMIT).clamp(1, MAX_JOB_LIMIT);
    let jobs = state
        .sync
        .stores()
        .jobs
        .recent(&user_id, limit)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(jobs))
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, ApiError> {
    let window = SyncWindow::new(request.start_date, request.end_date)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    let outcome = state.sync.sync_range(&request.user_id, window).await?;
    Ok(Json(SyncResponse {
        records_synced: outcome.records_synced,
        errors: outcome.errors,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::marker::PhantomData;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use dayledger_adapters::{
        AdapterError, MetaCredentials, ShiprocketCredentials, ShopifyCredentials, SourceAdapter,
    };
    use dayledger_core::{RawAdInsight, RawOrderRecord, RawShipment, SourceKind, SyncTrigger};
    use dayledger_storage::{MemoryStore, SyncJobStore};
    use dayledger_sync::{
        BackoffPolicy, MerchantRegistry, RetryExecutor, SyncPipeline, SyncSources, SyncStores, TokioSleeper,
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Fixed<C, R> {
        kind: SourceKind,
        records: Vec<R>,
        _credentials: PhantomData<fn(&C)>,
    }

    impl<C, R> Fixed<C, R> {
        fn new(kind: SourceKind, records: Vec<R>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                records,
                _credentials: PhantomData,
            })
        }
    }

    #[async_trait]
    impl<C, R> SourceAdapter for Fixed<C, R>
    where
        C: Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        type Credentials = C;
        type Record = R;

        fn source(&self) -> SourceKind {
            self.kind
        }

        async fn fetch(&self, _credentials: &C, _window: SyncWindow) -> Result<Vec<R>, AdapterError> {
            Ok(self.records.clone())
        }
    }

    const REGISTRY: &str = r#"
merchants:
  - user_id: u1
    meta:
      access_token: EAAB
      ad_account_id: "42"
"#;

    fn state() -> (AppState, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let sources = SyncSources {
            orders: Fixed::<ShopifyCredentials, RawOrderRecord>::new(SourceKind::Orders, vec![]),
            ads: Fixed::<MetaCredentials, RawAdInsight>::new(
                SourceKind::Ads,
                vec![RawAdInsight {
                    date: "2024-10-26".into(),
                    spend: 450.0,
                    reach: 9000,
                    impressions: 20000,
                    clicks: 300,
                    campaign_id: None,
                    campaign_name: None,
                }],
            ),
            shipments: Fixed::<ShiprocketCredentials, RawShipment>::new(SourceKind::Shipments, vec![]),
        };
        let stores = SyncStores {
            metrics: store.clone(),
            costs: store.clone(),
            jobs: store.clone(),
        };
        let executor = RetryExecutor::new(
            BackoffPolicy {
                max_attempts: 1,
                base_delay: Duration::ZERO,
            },
            Arc::new(TokioSleeper),
        );
        let registry = MerchantRegistry::from_yaml(REGISTRY).unwrap();
        let service = SyncService::new(SyncPipeline::new(sources, stores, executor), registry, 30, 3);
        (AppState::new(Arc::new(service)), store)
    }

    fn post_sync(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/sync")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (state, _) = state();
        let resp = app(state).oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn manual_sync_then_query_range() {
        let (state, _) = state();
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(post_sync(r#"{"userId":"u1","startDate":"2024-10-26","endDate":"2024-10-27"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json(resp).await;
        assert_eq!(body["recordsSynced"], 1);
        assert_eq!(body["errors"], serde_json::json!([]));

        let resp = app
            .clone()
            .oneshot(get("/users/u1/metrics?start=2024-10-01&end=2024-10-31"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json(resp).await;
        let records = body["records"].as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["date"], "2024-10-26");
        assert_eq!(records[0]["adSpend"], 450.0);
        assert_eq!(records[0]["netProfit"], -450.0);
        assert_eq!(records[0]["poas"], 0.0);
        assert_eq!(body["summary"]["days"], 1);
        assert_eq!(body["summary"]["adSpend"], 450.0);

        let resp = app.oneshot(get("/users/u1/jobs")).await.unwrap();
        let jobs = json(resp).await;
        assert_eq!(jobs.as_array().unwrap().len(), 1);
        assert_eq!(jobs[0]["status"], "completed");
        assert_eq!(jobs[0]["trigger"], "manual");
    }

    #[tokio::test]
    async fn other_users_see_nothing() {
        let (state, _) = state();
        let app = app(state);
        app.clone()
            .oneshot(post_sync(r#"{"userId":"u1","startDate":"2024-10-26","endDate":"2024-10-26"}"#))
            .await
            .unwrap();

        let resp = app
            .oneshot(get("/users/u2/metrics?start=2024-10-01&end=2024-10-31"))
            .await
            .unwrap();
        let body = json(resp).await;
        assert!(body["records"].as_array().unwrap().is_empty());
        assert_eq!(body["summary"]["roas"], 0.0);
    }

    #[tokio::test]
    async fn bad_requests_are_rejected() {
        let (state, _) = state();
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(post_sync(r#"{"userId":"u1","startDate":"2024-10-27","endDate":"2024-10-26"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .clone()
            .oneshot(post_sync(r#"{"userId":"ghost","startDate":"2024-10-26","endDate":"2024-10-26"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(json(resp).await["error"].as_str().unwrap().contains("ghost"));

        let resp = app
            .oneshot(get("/users/u1/metrics?start=2024-10-31&end=2024-10-01"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn concurrent_manual_sync_is_refused() {
        let (state, store) = state();
        let window = SyncWindow::trailing(NaiveDate::from_ymd_opt(2024, 10, 26).unwrap(), 1);
        store
            .create(&SyncJob::start("u1", SyncTrigger::Scheduled, window, Utc::now()))
            .await
            .unwrap();

        let resp = app(state)
            .oneshot(post_sync(r#"{"userId":"u1","startDate":"2024-10-26","endDate":"2024-10-26"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
