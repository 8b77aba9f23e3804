//! Core library for Pagefill. This module wires together the request and
//! response structures, the HTTP handlers and the answer generator. The
//! service exposes a single answering endpoint plus health and metrics
//! routes; every generation-time failure degrades to fallback answers so
//! the extension always receives a complete response shape.

mod config;
pub mod generator;
pub mod telemetry;
pub mod util;

pub use config::AppConfig;
pub use generator::fallback::FallbackPolicy;

use axum::extract::{
    rejection::{BytesRejection, FailedToBufferBody, JsonRejection},
    DefaultBodyLimit, State,
};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Instant;

use crate::generator::backend::ChatBackend;
use crate::generator::AnswerGenerator;
use crate::telemetry::{RequestLog, RotatingWriter};

/// One form field descriptor as sent by the extension. Unknown fields are
/// ignored; everything except `index` defaults when absent.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Question {
    pub index: i64,
    #[serde(default)]
    pub qtext: String,
    #[serde(default, rename = "type")]
    pub qtype: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub question_notes: Vec<String>,
}

/// The payload for one form page. `questions` is the only required field.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct PageRequest {
    #[serde(default)]
    pub facts: serde_json::Map<String, serde_json::Value>,
    pub questions: Vec<Question>,
    #[serde(default)]
    pub page_notes: Vec<String>,
}

/// One answer: a string for scalar question types, a list of selected option
/// labels for checkbox questions.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum AnswerValue {
    Text(String),
    Selections(Vec<String>),
}

/// Answers keyed by the string form of the question index.
pub type AnswerMap = BTreeMap<String, AnswerValue>;

#[derive(Debug, Serialize, Clone)]
pub struct PageResponse {
    pub answers: AnswerMap,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error_code: i32,
    pub message: String,
    pub http_status: u16,
}

/// Internal application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub generator: Arc<AnswerGenerator>,
    /// CORS allow-list. `None` means any origin is allowed.
    pub allowed_origins: Option<Vec<String>>,
    /// Maximum accepted raw request body size in bytes (None => axum default)
    pub max_request_bytes: Option<usize>,
    pub model: String,
    /// True when no completion credential is configured.
    pub fallback_only: bool,
    pub request_log: RequestLog,
    // Metrics counters
    pub metric_requests_total: Arc<AtomicU64>,
    pub metric_input_errors_total: Arc<AtomicU64>,
    pub metric_fallback_answers_total: Arc<AtomicU64>,
    pub metric_upstream_errors_total: Arc<AtomicU64>,
    pub metric_parse_errors_total: Arc<AtomicU64>,
    // Fixed-bucket request latency histogram (upper bounds in ms)
    pub hist_buckets: Arc<Vec<u64>>,
    pub hist_counts: Arc<Vec<AtomicU64>>,
    pub hist_sum_ms: Arc<AtomicU64>,
    pub hist_count: Arc<AtomicU64>,
    pub process_start_epoch: f64,
    pub process_start_instant: Instant,
}

/// Build state from a parsed configuration. Telemetry problems are logged
/// and disable the sink; they never prevent startup.
pub fn build_state(config: AppConfig) -> AppState {
    let AppConfig {
        api_key,
        model,
        api_base,
        upstream_timeout_ms,
        allowed_origins,
        base_facts,
        fallback_policy,
        max_request_bytes,
        log_file,
        rotation,
    } = config;

    let fallback_only = api_key.is_none();
    let backend = api_key.map(|key| {
        Arc::new(ChatBackend::new(
            api_base.clone(),
            key,
            model.clone(),
            upstream_timeout_ms,
        )) as Arc<dyn generator::backend::CompletionBackend>
    });
    let generator = Arc::new(AnswerGenerator::new(backend, base_facts, fallback_policy));

    let writer = match log_file.as_deref() {
        Some(path) => match RotatingWriter::open(path, rotation.max_bytes, rotation.keep) {
            Ok(f) => Some(Arc::new(Mutex::new(f))),
            Err(e) => {
                tracing::warn!(path=%path, error=%e, "Failed to open LOG_FILE; request log disabled");
                None
            }
        },
        None => None,
    };
    let request_log = RequestLog::new(writer);

    let buckets: Vec<u64> = vec![1, 2, 5, 10, 20, 50, 100, 200, 500, 1000, 2000, 5000, 10000];
    let start_time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();

    AppState {
        generator,
        allowed_origins,
        max_request_bytes,
        model,
        fallback_only,
        request_log,
        metric_requests_total: Arc::new(AtomicU64::new(0)),
        metric_input_errors_total: Arc::new(AtomicU64::new(0)),
        metric_fallback_answers_total: Arc::new(AtomicU64::new(0)),
        metric_upstream_errors_total: Arc::new(AtomicU64::new(0)),
        metric_parse_errors_total: Arc::new(AtomicU64::new(0)),
        hist_counts: Arc::new(buckets.iter().map(|_| AtomicU64::new(0)).collect()),
        hist_buckets: Arc::new(buckets),
        hist_sum_ms: Arc::new(AtomicU64::new(0)),
        hist_count: Arc::new(AtomicU64::new(0)),
        process_start_epoch: start_time.as_secs_f64(),
        process_start_instant: Instant::now(),
    }
}

/// Build state from environment variables. See `AppConfig::from_env` for the
/// variables read.
pub fn build_state_from_env() -> anyhow::Result<AppState> {
    Ok(build_state(AppConfig::from_env()?))
}

/// Build the Axum router and attach handlers. The router holds a copy of the
/// `AppState` for each invocation.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;

    let router = Router::new()
        .route("/", post(page_answers_handler).options(preflight_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler));

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router.with_state(state)
}

/// Compute the `Access-Control-Allow-Origin` value. With no allow-list any
/// origin is permitted; with one, a listed request origin is echoed back and
/// anything else receives the first configured origin.
fn allow_origin_value(allowed: Option<&[String]>, request_origin: Option<&str>) -> String {
    match allowed {
        None => "*".to_string(),
        Some(origins) => match request_origin {
            Some(o) if origins.iter().any(|a| a == o) => o.to_string(),
            _ => origins
                .first()
                .cloned()
                .unwrap_or_else(|| "*".to_string()),
        },
    }
}

fn apply_cors(
    headers: &mut HeaderMap,
    allowed: Option<&[String]>,
    request_origin: Option<&str>,
) {
    let value = allow_origin_value(allowed, request_origin);
    if let Ok(v) = HeaderValue::from_str(&value) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, v);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
}

fn request_origin(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::ORIGIN).and_then(|v| v.to_str().ok())
}

fn respond_with_error(
    state: &AppState,
    err: ErrorResponse,
    origin: Option<&str>,
) -> axum::response::Response {
    let status = StatusCode::from_u16(err.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut resp = (status, Json(err)).into_response();
    apply_cors(resp.headers_mut(), state.allowed_origins.as_deref(), origin);
    resp
}

/// CORS preflight for the answering endpoint.
async fn preflight_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> axum::response::Response {
    let origin = request_origin(&headers);
    let mut resp = StatusCode::NO_CONTENT.into_response();
    apply_cors(resp.headers_mut(), state.allowed_origins.as_deref(), origin);
    resp
}

/// Handler for `POST /`. Parses the page payload, invokes the answer
/// generator and returns the answer map. Upstream and parse failures are
/// absorbed by the generator; only malformed input produces an error status.
async fn page_answers_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<PageRequest>, JsonRejection>,
) -> axum::response::Response {
    let origin = request_origin(&headers).map(|s| s.to_string());
    let origin = origin.as_deref();

    // Size guard: rely on Content-Length header if provided.
    if let Some(limit) = state.max_request_bytes {
        if let Some(len_header) = headers.get("content-length").and_then(|v| v.to_str().ok()) {
            if let Ok(clen) = len_header.parse::<usize>() {
                if clen > limit {
                    let err = ErrorResponse {
                        error_code: 4001,
                        message: format!(
                            "Request too large ({} bytes > limit {} bytes)",
                            clen, limit
                        ),
                        http_status: 413,
                    };
                    return respond_with_error(&state, err, origin);
                }
            }
        }
    }

    let payload = match payload {
        Ok(Json(inner)) => inner,
        Err(rejection) => {
            state
                .metric_input_errors_total
                .fetch_add(1, Ordering::Relaxed);
            return handle_json_rejection(&state, rejection, origin);
        }
    };

    let start = Instant::now();
    let outcome = state
        .generator
        .generate(&payload.facts, &payload.questions, &payload.page_notes)
        .await;
    let latency_ms = start.elapsed().as_millis();

    // Histogram update
    let latency_u64 = latency_ms as u64;
    state.hist_sum_ms.fetch_add(latency_u64, Ordering::Relaxed);
    state.hist_count.fetch_add(1, Ordering::Relaxed);
    for (idx, ub) in state.hist_buckets.iter().enumerate() {
        if latency_u64 <= *ub {
            state.hist_counts[idx].fetch_add(1, Ordering::Relaxed);
            break;
        }
    }

    // Metrics increments
    state.metric_requests_total.fetch_add(1, Ordering::Relaxed);
    state
        .metric_fallback_answers_total
        .fetch_add(outcome.from_fallback as u64, Ordering::Relaxed);
    if outcome.upstream_error {
        state
            .metric_upstream_errors_total
            .fetch_add(1, Ordering::Relaxed);
    }
    if outcome.parse_error {
        state
            .metric_parse_errors_total
            .fetch_add(1, Ordering::Relaxed);
    }

    let record = serde_json::json!({
        "schemaVersion": 1,
        "ts": chrono::Utc::now().to_rfc3339(),
        "origin": origin,
        "questionCount": payload.questions.len(),
        "answerSource": outcome.source_label(),
        "fallbackCount": outcome.from_fallback,
        "upstreamError": outcome.upstream_error,
        "parseError": outcome.parse_error,
        "latencyMs": latency_ms,
    });
    state.request_log.emit(&record);

    let body = PageResponse {
        answers: outcome.answers,
    };
    let mut resp = (StatusCode::OK, Json(body)).into_response();
    apply_cors(resp.headers_mut(), state.allowed_origins.as_deref(), origin);
    resp
}

fn handle_json_rejection(
    state: &AppState,
    rejection: JsonRejection,
    origin: Option<&str>,
) -> axum::response::Response {
    let err = match &rejection {
        JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
            FailedToBufferBody::LengthLimitError(_),
        )) => {
            let message = match state.max_request_bytes {
                Some(limit) => format!("Request too large (body exceeded limit {} bytes)", limit),
                None => "Request too large".to_string(),
            };
            ErrorResponse {
                error_code: 4001,
                message,
                http_status: 413,
            }
        }
        other => ErrorResponse {
            error_code: 4002,
            message: format!("Invalid request body: {}", other.body_text()),
            http_status: 400,
        },
    };
    respond_with_error(state, err, origin)
}

/// Simple health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> axum::response::Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "model": state.model,
        "fallbackOnly": state.fallback_only,
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus-style metrics exposition. Text format with simple counters.
async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    let mut buf = String::new();
    use std::fmt::Write as _;
    let requests = state.metric_requests_total.load(Ordering::Relaxed);
    let input_errors = state.metric_input_errors_total.load(Ordering::Relaxed);
    let fallbacks = state.metric_fallback_answers_total.load(Ordering::Relaxed);
    let upstream_errors = state.metric_upstream_errors_total.load(Ordering::Relaxed);
    let parse_errors = state.metric_parse_errors_total.load(Ordering::Relaxed);
    let sum_ms = state.hist_sum_ms.load(Ordering::Relaxed);
    let count = state.hist_count.load(Ordering::Relaxed);
    let uptime_secs = state.process_start_instant.elapsed().as_secs_f64();

    writeln!(
        &mut buf,
        "# HELP pagefill_requests_total Total answer requests processed\n# TYPE pagefill_requests_total counter"
    )
    .ok();
    writeln!(&mut buf, "pagefill_requests_total {}", requests).ok();
    writeln!(
        &mut buf,
        "# HELP pagefill_input_errors_total Requests rejected for malformed payloads\n# TYPE pagefill_input_errors_total counter"
    )
    .ok();
    writeln!(&mut buf, "pagefill_input_errors_total {}", input_errors).ok();
    writeln!(
        &mut buf,
        "# HELP pagefill_fallback_answers_total Answers produced by the deterministic fallback\n# TYPE pagefill_fallback_answers_total counter"
    )
    .ok();
    writeln!(&mut buf, "pagefill_fallback_answers_total {}", fallbacks).ok();
    writeln!(
        &mut buf,
        "# HELP pagefill_upstream_errors_total Completion API calls that failed\n# TYPE pagefill_upstream_errors_total counter"
    )
    .ok();
    writeln!(&mut buf, "pagefill_upstream_errors_total {}", upstream_errors).ok();
    writeln!(
        &mut buf,
        "# HELP pagefill_parse_errors_total Completion replies that could not be parsed\n# TYPE pagefill_parse_errors_total counter"
    )
    .ok();
    writeln!(&mut buf, "pagefill_parse_errors_total {}", parse_errors).ok();
    writeln!(
        &mut buf,
        "# HELP pagefill_request_log_lines_total Request log JSON lines written\n# TYPE pagefill_request_log_lines_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "pagefill_request_log_lines_total {}",
        state.request_log.lines_total()
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP pagefill_request_log_write_errors_total Request log write failures\n# TYPE pagefill_request_log_write_errors_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "pagefill_request_log_write_errors_total {}",
        state.request_log.write_errors_total()
    )
    .ok();
    // Histogram
    writeln!(
        &mut buf,
        "# HELP pagefill_request_latency_ms Request latency histogram milliseconds\n# TYPE pagefill_request_latency_ms histogram"
    )
    .ok();
    let mut cumulative: u64 = 0;
    for (i, ub) in state.hist_buckets.iter().enumerate() {
        let c = state.hist_counts[i].load(Ordering::Relaxed);
        cumulative += c;
        writeln!(
            &mut buf,
            "pagefill_request_latency_ms_bucket{{le=\"{}\"}} {}",
            ub, cumulative
        )
        .ok();
    }
    writeln!(
        &mut buf,
        "pagefill_request_latency_ms_bucket{{le=\"+Inf\"}} {}",
        count
    )
    .ok();
    writeln!(&mut buf, "pagefill_request_latency_ms_sum {}", sum_ms).ok();
    writeln!(&mut buf, "pagefill_request_latency_ms_count {}", count).ok();
    writeln!(
        &mut buf,
        "# HELP pagefill_build_info Build information\n# TYPE pagefill_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "pagefill_build_info{{version=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION")
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP pagefill_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE pagefill_process_start_time_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "pagefill_process_start_time_seconds {}",
        state.process_start_epoch
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP pagefill_process_uptime_seconds Process uptime seconds\n# TYPE pagefill_process_uptime_seconds gauge"
    )
    .ok();
    writeln!(&mut buf, "pagefill_process_uptime_seconds {}", uptime_secs).ok();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_origin_defaults_to_wildcard() {
        assert_eq!(allow_origin_value(None, None), "*");
        assert_eq!(allow_origin_value(None, Some("https://x.example")), "*");
    }

    #[test]
    fn allow_origin_echoes_listed_origin() {
        let allowed = vec![
            "https://a.example".to_string(),
            "https://b.example".to_string(),
        ];
        assert_eq!(
            allow_origin_value(Some(&allowed), Some("https://b.example")),
            "https://b.example"
        );
        // Unlisted or absent origins get the first configured origin, never
        // an echo of the stranger.
        assert_eq!(
            allow_origin_value(Some(&allowed), Some("https://evil.example")),
            "https://a.example"
        );
        assert_eq!(allow_origin_value(Some(&allowed), None), "https://a.example");
    }

    #[test]
    fn answer_value_serializes_untagged() {
        let text = AnswerValue::Text("hi".into());
        assert_eq!(serde_json::to_string(&text).unwrap(), "\"hi\"");
        let multi = AnswerValue::Selections(vec!["A".into(), "B".into()]);
        assert_eq!(serde_json::to_string(&multi).unwrap(), "[\"A\",\"B\"]");
        let empty = AnswerValue::Selections(Vec::new());
        assert_eq!(serde_json::to_string(&empty).unwrap(), "[]");
    }

    #[test]
    fn page_request_defaults_optional_fields() {
        let req: PageRequest =
            serde_json::from_str(r#"{"questions":[{"index":0,"qtext":"Q","type":"text"}]}"#)
                .unwrap();
        assert!(req.facts.is_empty());
        assert!(req.page_notes.is_empty());
        assert_eq!(req.questions.len(), 1);
        assert!(!req.questions[0].required);
        // Missing `questions` is a hard deserialization failure.
        assert!(serde_json::from_str::<PageRequest>(r#"{"facts":{}}"#).is_err());
    }
}
