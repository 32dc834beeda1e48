//! Operator-side counters: reconciles, builds, errors and ingress events.

use lambda_schema::event_types;
use metrics::{counter, decrement_gauge, histogram, increment_gauge};

const KNOWN_EVENT_TYPES: &[&str] = &[
    event_types::FUNCTION_DEPLOY,
    event_types::SERVICE_CREATE,
    event_types::SERVICE_UPDATE,
    event_types::SERVICE_DELETE,
    event_types::BUILD_START,
    event_types::BUILD_RETRY,
    event_types::BUILD_CANCEL,
    event_types::FUNCTION_ROLLBACK,
    event_types::RESPONSE_SUCCESS,
    event_types::RESPONSE_ERROR,
];

/// Event types arrive from producers; anything unrecognised shares one label.
pub fn event_type_label(event_type: &str) -> &'static str {
    KNOWN_EVENT_TYPES.iter().copied().find(|t| *t == event_type).unwrap_or("unknown")
}

pub fn record_reconcile(phase: &'static str, result: &'static str, seconds: f64) {
    counter!("knative_lambda_operator_reconcile_total", 1u64, "phase" => phase, "result" => result);
    histogram!("knative_lambda_operator_reconcile_duration_seconds", seconds, "phase" => phase);
}

pub fn record_build(runtime: &'static str, result: &'static str, seconds: f64) {
    histogram!("knative_lambda_operator_build_duration_seconds", seconds, "runtime" => runtime, "result" => result);
}

pub fn record_error(component: &'static str, error_type: &'static str) {
    counter!("knative_lambda_operator_errors_total", 1u64, "component" => component, "error_type" => error_type);
}

pub fn record_cloudevent(event_type: &str, result: &'static str) {
    counter!("knative_lambda_operator_cloudevents_total", 1u64, "type" => event_type_label(event_type), "result" => result);
}

pub fn build_started(namespace: &str) {
    increment_gauge!("knative_lambda_operator_active_build_jobs", 1.0, "namespace" => namespace.to_string());
}

pub fn build_finished(namespace: &str) {
    decrement_gauge!("knative_lambda_operator_active_build_jobs", 1.0, "namespace" => namespace.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_event_types_collapse_to_one_label() {
        assert_eq!(event_type_label(event_types::BUILD_START), event_types::BUILD_START);
        assert_eq!(event_type_label("com.example.anything"), "unknown");
    }
}
