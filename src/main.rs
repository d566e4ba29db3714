mod clock;
mod driver;
mod error;
mod http;
mod machine;
mod metrics;
mod models;
mod parser;
mod retry;
mod security;
mod settings;
mod shopify;
mod sink;
mod store;
#[cfg(test)]
mod testing;

use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clock::{Clock, SystemClock};
use driver::Driver;
use error::ControlError;
use machine::ImportMachine;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, BulkImportJob};
use security::{AuthState, Operator, require_operator};
use serde_json::json;
use settings::Settings;
use shopify::ShopifyBulkClient;
use sink::{CatalogSink, ErpSink, MemorySink};
use std::{net::SocketAddr, sync::Arc};
use store::{JobRegistry, JobStore, MemoryJobStore, RedisJobStore};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "bulk.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let settings = Settings::load()?;
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;

    let store: Arc<dyn JobStore> = match RedisJobStore::from_env() {
        Some(store) => {
            info!(target = "bulk.api", "job store: redis");
            Arc::new(store)
        }
        None => {
            warn!(
                target = "bulk.api",
                "REDIS_URL not set; job state is kept in memory and lost on restart"
            );
            Arc::new(MemoryJobStore::new())
        }
    };
    let sink: Arc<dyn CatalogSink> = match ErpSink::from_env() {
        Some(sink) => Arc::new(sink),
        None => {
            warn!(
                target = "bulk.api",
                "ERP_CATALOG_URL not set; products are upserted into an in-memory catalog"
            );
            Arc::new(MemorySink::new())
        }
    };
    let registry = Arc::new(JobRegistry::new(store));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let tuning = settings.engine.tuning();

    let mut driver = Driver::new(registry.clone(), clock.clone(), settings.engine.tick_interval());
    for target in &settings.targets {
        let client = ShopifyBulkClient::new(
            &target.shop_url,
            target.api_version(),
            target.access_token()?,
        );
        let machine = ImportMachine::new(
            target.name.clone(),
            Arc::new(client),
            sink.clone(),
            registry.clone(),
            clock.clone(),
            tuning.clone(),
        );
        driver = driver.register(target, machine);
    }
    let driver = Arc::new(driver);
    let resumed = driver.resume().await;
    info!(
        target = "bulk.api",
        targets = settings.targets.len(),
        resumed,
        "bulk import engine ready"
    );
    let _ticker = driver.spawn();

    let state = AppState {
        driver,
        prometheus_handle,
        metrics_key: std::env::var("METRICS_KEY").ok(),
    };
    let app = router(state, AuthState::from_env());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "bulk.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    driver: Arc<Driver>,
    prometheus_handle: PrometheusHandle,
    metrics_key: Option<String>,
}

fn router(state: AppState, auth: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route(
            "/targets/{target}/imports",
            post(start_import).get(list_imports),
        )
        .route("/imports/{job_id}", get(get_import))
        .route("/imports/{job_id}/cancel", post(cancel_import))
        .route_layer(middleware::from_fn_with_state(auth, require_operator));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "bulk-catalog-import",
    }))
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Response {
    if let Some(secret) = &state.metrics_key {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Start a bulk import for a configured target.
///
/// - Method: `POST`
/// - Path: `/targets/{target}/imports`
/// - Auth: `Authorization: Bearer <key>` or `X-Operator-Key: <key>`
/// - Response: `201` with the new `pending` job
async fn start_import(
    State(state): State<AppState>,
    Extension(operator): Extension<Operator>,
    Path(target): Path<String>,
) -> Result<(StatusCode, Json<BulkImportJob>), AppError> {
    crate::metrics::inc_requests("/targets/imports");
    let job = state.driver.start_import(&target).await?;
    info!(
        target = "bulk.api",
        operator = %operator.0,
        job_id = %job.job_id,
        shop = %target,
        "import started by operator"
    );
    Ok((StatusCode::CREATED, Json(job)))
}

/// Every import ever run for a target, newest first.
async fn list_imports(
    State(state): State<AppState>,
    Path(target): Path<String>,
) -> Result<Json<Vec<BulkImportJob>>, AppError> {
    crate::metrics::inc_requests("/targets/imports");
    Ok(Json(state.driver.history(&target).await?))
}

async fn get_import(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<BulkImportJob>, AppError> {
    crate::metrics::inc_requests("/imports");
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.driver.status(job_id).await?))
}

async fn cancel_import(
    State(state): State<AppState>,
    Extension(operator): Extension<Operator>,
    Path(job_id): Path<String>,
) -> Result<Json<BulkImportJob>, AppError> {
    crate::metrics::inc_requests("/imports/cancel");
    let job_id = parse_job_id(&job_id)?;
    let job = state.driver.cancel(job_id).await?;
    info!(
        target = "bulk.api",
        operator = %operator.0,
        %job_id,
        "import cancelled by operator"
    );
    Ok(Json(job))
}

fn parse_job_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::InvalidJobId(raw.to_string()))
}

enum AppError {
    Control(ControlError),
    InvalidJobId(String),
}

impl From<ControlError> for AppError {
    fn from(value: ControlError) -> Self {
        AppError::Control(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match self {
            AppError::InvalidJobId(raw) => (
                StatusCode::BAD_REQUEST,
                "invalid_job_id",
                format!("`{raw}` is not a job id"),
            ),
            AppError::Control(err) => {
                let (status, code) = match &err {
                    ControlError::UnknownTarget(_) => (StatusCode::NOT_FOUND, "unknown_target"),
                    ControlError::JobNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                    ControlError::IntegrationDisabled(_) => {
                        (StatusCode::CONFLICT, "integration_disabled")
                    }
                    ControlError::BulkModeDisabled(_) => {
                        (StatusCode::CONFLICT, "bulk_import_disabled")
                    }
                    ControlError::ImportInProgress { .. } => {
                        (StatusCode::CONFLICT, "import_in_progress")
                    }
                    ControlError::JobClosed { .. } => (StatusCode::CONFLICT, "job_closed"),
                    ControlError::Store(store) => {
                        error!(target = "bulk.api", error = %store, "job store failure");
                        (StatusCode::INTERNAL_SERVER_ERROR, "store_unavailable")
                    }
                };
                (status, code, err.to_string())
            }
        };
        let payload = ApiError {
            error: code.to_string(),
            detail: Some(detail),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineTuning;
    use crate::settings::TargetConfig;
    use crate::testing::{ManualClock, ScriptedClient, sample_export, t0};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(metrics_key: Option<&str>) -> Router {
        let registry = Arc::new(JobRegistry::new(Arc::new(MemoryJobStore::new())));
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(t0()));
        let config = TargetConfig {
            name: "eu".into(),
            shop_url: "eu.myshopify.com".into(),
            access_token: Some("shpat".into()),
            access_token_env: None,
            api_version: None,
            enabled: true,
            bulk_import: true,
            query: None,
        };
        let machine = ImportMachine::new(
            "eu",
            Arc::new(ScriptedClient::new(sample_export())),
            Arc::new(MemorySink::new()),
            registry.clone(),
            clock.clone(),
            MachineTuning::default(),
        );
        let driver = Driver::new(registry, clock, Duration::from_secs(30)).register(&config, machine);
        let state = AppState {
            driver: Arc::new(driver),
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
            metrics_key: metrics_key.map(str::to_string),
        };
        router(state, AuthState::from_keys("ops:secret"))
    }

    async fn call(app: &Router, method: &str, uri: &str, key: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        let response = app
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn health_is_public() {
        let app = app(None);
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn operator_routes_require_a_known_key() {
        let app = app(None);
        let (status, body) = call(&app, "POST", "/targets/eu/imports", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "missing_api_key");
        let (status, body) = call(&app, "POST", "/targets/eu/imports", Some("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_api_key");
    }

    #[tokio::test]
    async fn import_lifecycle_over_http() {
        let app = app(None);
        let (status, job) = call(&app, "POST", "/targets/eu/imports", Some("secret")).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(job["state"], "pending");
        let id = job["job_id"].as_str().unwrap().to_string();

        let (status, body) = call(&app, "POST", "/targets/eu/imports", Some("secret")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "import_in_progress");

        let (status, body) = call(&app, "POST", "/targets/nowhere/imports", Some("secret")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown_target");

        let (status, body) = call(&app, "GET", &format!("/imports/{id}"), Some("secret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["records_processed"], 0);
        assert_eq!(body["attempt_count"], 0);

        let (status, body) = call(&app, "GET", "/imports/not-a-uuid", Some("secret")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_job_id");

        let cancel = format!("/imports/{id}/cancel");
        let (status, body) = call(&app, "POST", &cancel, Some("secret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "cancelled");
        let (status, body) = call(&app, "POST", &cancel, Some("secret")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "job_closed");

        let (status, body) = call(&app, "GET", "/targets/eu/imports", Some("secret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = call(
            &app,
            "GET",
            &format!("/imports/{}", Uuid::new_v4()),
            Some("secret"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_key_guards_exposition() {
        let app = app(Some("m-key"));
        let (status, _) = call(&app, "GET", "/metrics", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .header("X-Metrics-Key", "m-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
