//! Lambda telemetry: function RED metrics fed by runtime response events, plus operator counters

#![forbid(unsafe_code)]

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod operator;

/// Every label value `normalize_error_type` can produce.
pub const ERROR_CATEGORIES: &[&str] =
    &["runtime", "timeout", "memory", "handler", "import", "validation", "network", "permission", "config", "request", "unknown", "other"];

/// Payload of `response.success` / `response.error` events emitted by the runtime wrappers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEvent {
    #[serde(default)]
    pub function_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResponseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ResponseMetrics>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseResult {
    #[serde(default)]
    pub status_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetrics {
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default)]
    pub cold_start: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used_mb: Option<i64>,
}

/// Fold a raw runtime error code into a bounded label set.
pub fn normalize_error_type(code: Option<&str>) -> &'static str {
    let code = match code.map(str::trim) {
        Some(c) if !c.is_empty() => c,
        _ => return "unknown",
    };
    match code {
        "RuntimeError" | "runtime_error" => "runtime",
        "TimeoutError" | "timeout" | "Timeout" => "timeout",
        "MemoryError" | "memory" | "OutOfMemory" | "OOM" => "memory",
        "HandlerError" | "handler_error" | "handler" => "handler",
        "ImportError" | "ModuleNotFound" | "ModuleNotFoundError" | "module_not_found" => "import",
        "ValueError" | "TypeError" | "validation" | "ValidationError" => "validation",
        "ConnectionError" | "NetworkError" | "network" => "network",
        "PermissionError" | "AccessDenied" | "permission" => "permission",
        "ConfigError" | "ConfigurationError" | "config" => "config",
        "ReadBodyError" => "request",
        _ => {
            let lower = code.to_ascii_lowercase();
            if lower.contains("timeout") {
                "timeout"
            } else if lower.contains("memory") || code.contains("OOM") {
                "memory"
            } else if lower.contains("import") || lower.contains("module") {
                "import"
            } else if lower.contains("network") || lower.contains("connection") {
                "network"
            } else {
                "other"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
        }
    }
}

/// What was recorded for one response event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub function: String,
    pub namespace: String,
    pub outcome: Outcome,
    pub error_type: Option<&'static str>,
}

/// Turns response events into function RED metrics.
#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    default_namespace: String,
}

impl MetricsRecorder {
    pub fn new(default_namespace: impl Into<String>) -> Self {
        Self { default_namespace: default_namespace.into() }
    }

    /// Record one invocation. Events naming no function, in payload or subject, are skipped.
    pub fn record(&self, outcome: Outcome, event: &ResponseEvent, subject: Option<&str>) -> Option<Recorded> {
        let function = Some(event.function_name.trim())
            .filter(|n| !n.is_empty())
            .or_else(|| subject.map(str::trim).filter(|s| !s.is_empty()))?
            .to_string();
        let namespace =
            if event.namespace.trim().is_empty() { self.default_namespace.clone() } else { event.namespace.trim().to_string() };

        counter!(
            "knative_lambda_function_invocations_total", 1u64,
            "function" => function.clone(), "namespace" => namespace.clone(), "status" => outcome.as_str()
        );
        if let Some(m) = &event.metrics {
            histogram!(
                "knative_lambda_function_duration_seconds", m.duration_ms.max(0) as f64 / 1000.0,
                "function" => function.clone(), "namespace" => namespace.clone()
            );
            if m.cold_start {
                counter!("knative_lambda_function_cold_starts_total", 1u64, "function" => function.clone(), "namespace" => namespace.clone());
            }
            if let Some(mb) = m.memory_used_mb.filter(|mb| *mb > 0) {
                histogram!("knative_lambda_function_memory_used_mb", mb as f64, "function" => function.clone(), "namespace" => namespace.clone());
            }
        }
        let error_type = match outcome {
            Outcome::Success => None,
            Outcome::Error => {
                let t = normalize_error_type(event.error.as_ref().map(|e| e.code.as_str()));
                counter!(
                    "knative_lambda_function_errors_total", 1u64,
                    "function" => function.clone(), "namespace" => namespace.clone(), "error_type" => t
                );
                Some(t)
            }
        };
        debug!(
            function = %function,
            ns = %namespace,
            outcome = outcome.as_str(),
            invocation_id = event.invocation_id.as_deref().unwrap_or(""),
            duration_ms = event.metrics.map(|m| m.duration_ms).unwrap_or(0),
            error_type = error_type.unwrap_or(""),
            "recorded function metrics"
        );
        Some(Recorded { function, namespace, outcome, error_type })
    }

    pub fn record_success(&self, event: &ResponseEvent, subject: Option<&str>) -> Option<Recorded> {
        self.record(Outcome::Success, event, subject)
    }

    pub fn record_error(&self, event: &ResponseEvent, subject: Option<&str>) -> Option<Recorded> {
        self.record(Outcome::Error, event, subject)
    }
}
