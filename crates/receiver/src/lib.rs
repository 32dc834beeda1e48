//! Lambda receiver: CloudEvents HTTP ingress with rate limiting, schema validation and command dispatch

#![forbid(unsafe_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use lambda_core::LambdaError;
use lambda_kubehub::FunctionStore;
use lambda_schema::SchemaRegistry;
use lambda_telemetry::operator;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod commands;
pub mod counters;
pub mod envelope;
pub mod error;
pub mod limiter;

pub use commands::{Commands, Handled};
pub use counters::{CounterSnapshot, Counters};
pub use envelope::CloudEvent;
pub use error::{IngressError, Rejection, CORRELATION_HEADER};
pub use limiter::TokenBucket;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub addr: SocketAddr,
    /// Primary CloudEvents path; `/events` is always served too.
    pub path: String,
    pub default_namespace: String,
    pub rate_limit_qps: f64,
    pub rate_limit_burst: u32,
    /// Bounds both the rate-limit wait and command processing.
    pub processing_timeout: Duration,
    pub schema_validation: bool,
    pub max_event_bytes: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            path: "/".to_string(),
            default_namespace: "knative-lambda".to_string(),
            rate_limit_qps: 50.0,
            rate_limit_burst: 100,
            processing_timeout: Duration::from_secs(30),
            schema_validation: true,
            max_event_bytes: 1024 * 1024,
        }
    }
}

impl ReceiverConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let path = std::env::var("LAMBDA_RECEIVER_PATH")
            .ok()
            .map(|p| p.trim().to_string())
            .filter(|p| p.starts_with('/'))
            .unwrap_or(d.path);
        Self {
            addr: env_parse("LAMBDA_RECEIVER_ADDR").unwrap_or(d.addr),
            path,
            default_namespace: std::env::var("LAMBDA_DEFAULT_NAMESPACE").ok().filter(|s| !s.is_empty()).unwrap_or(d.default_namespace),
            rate_limit_qps: env_parse("LAMBDA_RATE_LIMIT_QPS").filter(|q: &f64| *q >= 0.0).unwrap_or(d.rate_limit_qps),
            rate_limit_burst: env_parse("LAMBDA_RATE_LIMIT_BURST").unwrap_or(d.rate_limit_burst),
            processing_timeout: env_parse("LAMBDA_PROCESSING_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.processing_timeout),
            schema_validation: env_parse("LAMBDA_SCHEMA_VALIDATION").unwrap_or(d.schema_validation),
            max_event_bytes: env_parse("LAMBDA_MAX_EVENT_BYTES").filter(|n: &usize| *n > 0).unwrap_or(d.max_event_bytes),
        }
    }
}

/// Shared state of the ingress.
pub struct Receiver {
    config: ReceiverConfig,
    limiter: TokenBucket,
    counters: Counters,
    schemas: Option<SchemaRegistry>,
    commands: Commands,
}

impl Receiver {
    pub fn new(config: ReceiverConfig, store: Arc<dyn FunctionStore>) -> anyhow::Result<Self> {
        let schemas = if config.schema_validation {
            let reg = SchemaRegistry::with_builtin().context("loading CloudEvent schemas")?;
            info!(schemas = reg.len(), "schema validation enabled");
            Some(reg)
        } else {
            warn!("schema validation disabled, payloads are not checked");
            None
        };
        Ok(Self {
            limiter: TokenBucket::new(config.rate_limit_qps, config.rate_limit_burst),
            counters: Counters::default(),
            commands: Commands::new(store, config.default_namespace.clone()),
            schemas,
            config,
        })
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Limit, validate and dispatch one parsed event.
    async fn process(&self, ev: &CloudEvent, correlation_id: &str) -> Result<Handled, IngressError> {
        if !self.limiter.acquire(self.config.processing_timeout).await {
            warn!(event_id = %ev.id, correlation_id, "rate limit exceeded");
            return Err(IngressError::RateLimited);
        }
        if let Some(reg) = &self.schemas {
            if let Err(e) = reg.validate(&ev.id, &ev.event_type, &ev.data) {
                self.counters.schema_rejected();
                warn!(event_id = %ev.id, event_type = %ev.event_type, correlation_id, error = %e, "schema validation failed");
                return Err(e.into());
            }
        }
        match tokio::time::timeout(self.config.processing_timeout, self.commands.dispatch(ev)).await {
            Ok(res) => res.map_err(IngressError::from),
            Err(_) => Err(LambdaError::Transient("processing timed out".into()).into()),
        }
    }
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

async fn handle_event(
    State(rx): State<Arc<Receiver>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    rx.counters.received();
    let correlation_id = correlation_id(&headers);

    let ev = match body {
        Ok(body) => CloudEvent::from_http(&headers, &body),
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            Err(IngressError::PayloadTooLarge { limit: rx.config.max_event_bytes })
        }
        Err(rejection) => Err(IngressError::InvalidEvent(rejection.body_text())),
    };
    let ev = match ev {
        Ok(ev) => ev,
        Err(error) => {
            rx.counters.failed();
            warn!(correlation_id = %correlation_id, error = %error, "unparseable CloudEvent");
            operator::record_cloudevent("unknown", "malformed");
            return Rejection { error, correlation_id, event_id: None, event_type: None }.into_response();
        }
    };
    info!(
        event_id = %ev.id,
        event_type = %ev.event_type,
        source = %ev.source,
        subject = ev.subject().unwrap_or(""),
        correlation_id = %correlation_id,
        "CloudEvent received"
    );

    match rx.process(&ev, &correlation_id).await {
        Ok(handled) => {
            rx.counters.processed();
            operator::record_cloudevent(&ev.event_type, "accepted");
            info!(event_id = %ev.id, event_type = %ev.event_type, correlation_id = %correlation_id, ?handled, "CloudEvent processed");
            accepted(&ev.id, &correlation_id)
        }
        Err(IngressError::Command(LambdaError::Conflict(msg))) => {
            // Concurrent or repeated delivery of the same command.
            rx.counters.processed();
            operator::record_cloudevent(&ev.event_type, "conflict");
            info!(event_id = %ev.id, correlation_id = %correlation_id, conflict = %msg, "CloudEvent already applied");
            accepted(&ev.id, &correlation_id)
        }
        Err(IngressError::RateLimited) => {
            operator::record_cloudevent(&ev.event_type, "rate_limited");
            Rejection { error: IngressError::RateLimited, correlation_id, event_id: Some(ev.id), event_type: None }.into_response()
        }
        Err(error) => {
            rx.counters.failed();
            let result = if error.status().is_server_error() { "failed" } else { "rejected" };
            operator::record_cloudevent(&ev.event_type, result);
            warn!(event_id = %ev.id, event_type = %ev.event_type, correlation_id = %correlation_id, error = %error, "CloudEvent rejected");
            Rejection { error, correlation_id, event_id: Some(ev.id), event_type: Some(ev.event_type) }.into_response()
        }
    }
}

fn accepted(event_id: &str, correlation_id: &str) -> Response {
    let mut resp = (
        StatusCode::ACCEPTED,
        Json(json!({"status": "accepted", "eventId": event_id, "correlationId": correlation_id})),
    )
        .into_response();
    if let Ok(v) = HeaderValue::from_str(correlation_id) {
        resp.headers_mut().insert(CORRELATION_HEADER, v);
    }
    resp
}

async fn method_not_allowed(State(rx): State<Arc<Receiver>>, headers: HeaderMap) -> Response {
    rx.counters.received();
    rx.counters.failed();
    let correlation_id = correlation_id(&headers);
    operator::record_cloudevent("unknown", "rejected");
    Rejection { error: IngressError::MethodNotAllowed, correlation_id, event_id: None, event_type: None }.into_response()
}

async fn health() -> &'static str {
    "ok"
}

async fn ready() -> &'static str {
    "ready"
}

async fn metrics(State(rx): State<Arc<Receiver>>) -> Json<CounterSnapshot> {
    Json(rx.counters())
}

pub fn router(rx: Arc<Receiver>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/events", post(handle_event));
    if rx.config.path != "/events" {
        router = router.route(&rx.config.path, post(handle_event));
    }
    router
        .method_not_allowed_fallback(method_not_allowed)
        .layer(DefaultBodyLimit::max(rx.config.max_event_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(rx)
}

/// Serve until `shutdown` resolves.
pub async fn serve(rx: Arc<Receiver>, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
    let addr = rx.config.addr;
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding receiver on {addr}"))?;
    info!(
        addr = %addr,
        path = %rx.config.path,
        qps = rx.config.rate_limit_qps,
        burst = rx.config.rate_limit_burst,
        "CloudEvents receiver listening"
    );
    axum::serve(listener, router(rx)).with_graceful_shutdown(shutdown).await.context("receiver server")?;
    info!("CloudEvents receiver stopped");
    Ok(())
}
