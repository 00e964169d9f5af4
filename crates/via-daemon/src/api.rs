//! HTTP API surface: request/response DTOs, handlers, and the router.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::debug;

use via_runtime::{QueryFilters, Runtime};
use via_types::{IncidentRecord, LogEvent, PointId, RhythmHash, ViaError};

/// Default operator identity when a request names none.
const ANONYMOUS_OPERATOR: &str = "operator";

const DEFAULT_CLUSTER_LIMIT: usize = 100;
const DEFAULT_TRIAGE_LIMIT: usize = 20;
const DEFAULT_TOP_K: usize = 10;

/// Build the `/api/v1` router over a running engine.
pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/api/v1/ingest/stream", post(ingest_stream))
        .route(
            "/api/v1/analysis/tier1/rhythm_anomalies",
            post(rhythm_anomalies),
        )
        .route("/api/v1/analysis/tier2/clusters", post(clusters))
        .route("/api/v1/analysis/tier2/triage", post(triage))
        .route("/api/v1/control/suppress", post(suppress))
        .route("/api/v1/control/patch", post(patch))
        .route("/api/v1/control/lift", post(lift))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(runtime)
}

//─────────────────────────────
//  Error mapping
//─────────────────────────────

struct ApiError(ViaError);

impl From<ViaError> for ApiError {
    fn from(e: ViaError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ViaError::BadRequest(_) | ViaError::BadEvent(_) => StatusCode::BAD_REQUEST,
            ViaError::Overloaded => StatusCode::TOO_MANY_REQUESTS,
            ViaError::EmbedderBusy | ViaError::BackendUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ViaError::PartitionTimeout(_) | ViaError::PromotionDegraded(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ViaError::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

//─────────────────────────────
//  Ingest
//─────────────────────────────

/// One event as it arrives on the wire; the level is free text so a single
/// bad event degrades to `parse_failed` instead of rejecting the batch.
#[derive(Debug, Deserialize)]
struct WireEvent {
    ts: i64,
    service: String,
    level: String,
    message: String,
    #[serde(default)]
    attributes: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    events: Vec<WireEvent>,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    accepted: u64,
    deduped: u64,
    parse_failed: u64,
    warnings: Vec<String>,
}

async fn ingest_stream(
    State(runtime): State<Arc<Runtime>>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, ApiError> {
    let mut unparseable = 0u64;
    let mut events = Vec::with_capacity(request.events.len());
    for wire in request.events {
        match wire.level.parse() {
            Ok(level) => events.push(LogEvent {
                ts: wire.ts,
                service: wire.service,
                level,
                message: wire.message,
                attributes: wire.attributes,
            }),
            Err(_) => unparseable += 1,
        }
    }

    let report = runtime.ingest(events).await?;
    Ok(Json(IngestResponse {
        accepted: report.accepted,
        deduped: report.deduped,
        parse_failed: report.parse_failed + unparseable,
        warnings: Vec::new(),
    }))
}

//─────────────────────────────
//  Tier-1 analysis
//─────────────────────────────

#[derive(Debug, Deserialize)]
struct AnomaliesRequest {
    window_sec: i64,
    top_k: Option<usize>,
    threshold: Option<f64>,
}

#[derive(Debug, Serialize)]
struct AnomalyDto {
    rhythm_hash: RhythmHash,
    representative: LogEvent,
    score: f64,
    count: u64,
    first_ts: i64,
    last_ts: i64,
}

#[derive(Debug, Serialize)]
struct AnomaliesResponse {
    anomalies: Vec<AnomalyDto>,
    promoted: Vec<RhythmHash>,
}

async fn rhythm_anomalies(
    State(runtime): State<Arc<Runtime>>,
    Json(request): Json<AnomaliesRequest>,
) -> Result<Json<AnomaliesResponse>, ApiError> {
    if request.window_sec <= 0 {
        return Err(ViaError::BadRequest("window_sec must be positive".into()).into());
    }
    let (anomalies, promoted) = runtime
        .rhythm_anomalies(
            request.window_sec,
            request.top_k.unwrap_or(DEFAULT_TOP_K),
            request.threshold,
        )
        .await?;
    debug!(reported = anomalies.len(), promoted = promoted.len(), "analysis served");
    Ok(Json(AnomaliesResponse {
        anomalies: anomalies
            .into_iter()
            .map(|a| AnomalyDto {
                rhythm_hash: a.rhythm_hash,
                representative: a.representative,
                score: a.score,
                count: a.count,
                first_ts: a.first_ts,
                last_ts: a.last_ts,
            })
            .collect(),
        promoted,
    }))
}

//─────────────────────────────
//  Tier-2 analysis
//─────────────────────────────

#[derive(Debug, Deserialize)]
struct ClustersRequest {
    start_ts: i64,
    end_ts: i64,
    #[serde(default)]
    filters: Option<QueryFilters>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ClustersResponse {
    incidents: Vec<IncidentRecord>,
    warnings: Vec<String>,
}

async fn clusters(
    State(runtime): State<Arc<Runtime>>,
    Json(request): Json<ClustersRequest>,
) -> Result<Json<ClustersResponse>, ApiError> {
    let result = runtime
        .clusters(
            request.start_ts,
            request.end_ts,
            &request.filters.unwrap_or_default(),
            request.limit.unwrap_or(DEFAULT_CLUSTER_LIMIT),
        )
        .await?;
    Ok(Json(ClustersResponse {
        incidents: result.incidents,
        warnings: result.warnings,
    }))
}

#[derive(Debug, Deserialize)]
struct TriageRequest {
    start_ts: i64,
    end_ts: i64,
    positive_ids: Vec<PointId>,
    #[serde(default)]
    negative_ids: Vec<PointId>,
    #[serde(default)]
    filters: Option<QueryFilters>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct TriageHitDto {
    #[serde(flatten)]
    incident: IncidentRecord,
    score: f32,
}

#[derive(Debug, Serialize)]
struct TriageResponse {
    incidents: Vec<TriageHitDto>,
    warnings: Vec<String>,
}

async fn triage(
    State(runtime): State<Arc<Runtime>>,
    Json(request): Json<TriageRequest>,
) -> Result<Json<TriageResponse>, ApiError> {
    let result = runtime
        .triage(
            request.start_ts,
            request.end_ts,
            request.positive_ids,
            request.negative_ids,
            &request.filters.unwrap_or_default(),
            request.limit.unwrap_or(DEFAULT_TRIAGE_LIMIT),
        )
        .await?;
    Ok(Json(TriageResponse {
        incidents: result
            .hits
            .into_iter()
            .map(|hit| TriageHitDto {
                incident: hit.incident,
                score: hit.score,
            })
            .collect(),
        warnings: result.warnings,
    }))
}

//─────────────────────────────
//  Control loop
//─────────────────────────────

#[derive(Debug, Deserialize)]
struct SuppressRequest {
    rhythm_hash: RhythmHash,
    ttl_sec: i64,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    operator_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct SuppressResponse {
    ok: bool,
    expires_at: i64,
}

async fn suppress(
    State(runtime): State<Arc<Runtime>>,
    Json(request): Json<SuppressRequest>,
) -> Result<Json<SuppressResponse>, ApiError> {
    if request.ttl_sec <= 0 {
        return Err(ViaError::BadRequest("ttl_sec must be positive".into()).into());
    }
    let expires_at = runtime
        .suppress(
            request.rhythm_hash,
            request.ttl_sec,
            request.reason.as_deref().unwrap_or(""),
            request.operator_id.as_deref().unwrap_or(ANONYMOUS_OPERATOR),
        )
        .await?;
    Ok(Json(SuppressResponse {
        ok: true,
        expires_at,
    }))
}

#[derive(Debug, Deserialize)]
struct PatchRequest {
    rhythm_hash: RhythmHash,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    operator_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct PatchResponse {
    ok: bool,
}

async fn patch(
    State(runtime): State<Arc<Runtime>>,
    Json(request): Json<PatchRequest>,
) -> Result<Json<PatchResponse>, ApiError> {
    runtime
        .patch(
            request.rhythm_hash,
            request.reason.as_deref().unwrap_or(""),
            request.operator_id.as_deref().unwrap_or(ANONYMOUS_OPERATOR),
        )
        .await?;
    Ok(Json(PatchResponse { ok: true }))
}

#[derive(Debug, Deserialize)]
struct LiftRequest {
    rhythm_hash: RhythmHash,
}

#[derive(Debug, Serialize)]
struct LiftResponse {
    ok: bool,
    existed: bool,
}

async fn lift(
    State(runtime): State<Arc<Runtime>>,
    Json(request): Json<LiftRequest>,
) -> Result<Json<LiftResponse>, ApiError> {
    let existed = runtime.lift(request.rhythm_hash).await?;
    Ok(Json(LiftResponse { ok: true, existed }))
}

//─────────────────────────────
//  Health
//─────────────────────────────

async fn health(State(runtime): State<Arc<Runtime>>) -> Json<via_runtime::Health> {
    Json(runtime.health().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use tempfile::TempDir;
    use tower::ServiceExt;
    use via_runtime::Config;

    async fn app(dir: &TempDir) -> Router {
        let mut config = Config::default();
        config.control_store_path = dir.path().join("control.db");
        config.regression_log_path = dir.path().join("regressions.jsonl");
        let runtime = Runtime::start(config).await.unwrap();
        router(Arc::new(runtime))
    }

    fn post_json(path: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn ingest_reports_accepted_and_failed() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;
        let now = via_types::now_ts();

        let response = app
            .oneshot(post_json(
                "/api/v1/ingest/stream",
                serde_json::json!({
                    "events": [
                        {"ts": now, "service": "gateway", "level": "INFO", "message": "user logged in"},
                        {"ts": now, "service": "gateway", "level": "NOISE", "message": "bad level"},
                        {"ts": now, "service": "gateway", "level": "ERROR", "message": ""},
                    ]
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["accepted"], 1);
        assert_eq!(body["parse_failed"], 2);
    }

    #[tokio::test]
    async fn analysis_round_trip_over_http() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;
        let now = via_types::now_ts();

        let mut events = Vec::new();
        for i in 0..40 {
            events.push(serde_json::json!({
                "ts": now - 30, "service": "auth", "level": "ERROR",
                "message": format!("assertion failed at /src/io.c:{i}"),
            }));
        }
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/ingest/stream",
                serde_json::json!({ "events": events }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(post_json(
                "/api/v1/analysis/tier1/rhythm_anomalies",
                serde_json::json!({"window_sec": 900, "top_k": 5}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["anomalies"].as_array().unwrap().len(), 1);
        assert_eq!(body["anomalies"][0]["count"], 40);
        assert_eq!(
            body["promoted"].as_array().unwrap().len(),
            1,
            "analysis must hand the class to promotion"
        );
    }

    #[tokio::test]
    async fn triage_without_positives_is_a_400() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;

        let response = app
            .oneshot(post_json(
                "/api/v1/analysis/tier2/triage",
                serde_json::json!({"start_ts": 0, "end_ts": 1, "positive_ids": []}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn control_endpoints_round_trip() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/control/suppress",
                serde_json::json!({"rhythm_hash": 42u64, "ttl_sec": 60, "reason": "noise"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["ok"], true);
        assert!(body["expires_at"].as_i64().unwrap() > via_types::now_ts());

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/control/patch",
                serde_json::json!({"rhythm_hash": 42u64}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(post_json(
                "/api/v1/control/lift",
                serde_json::json!({"rhythm_hash": 42u64}),
            ))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["existed"], true);
    }

    #[tokio::test]
    async fn health_reports_engine_counters() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["tier1_points"], 0);
        assert_eq!(body["tier2_collections"], 0);
    }
}
