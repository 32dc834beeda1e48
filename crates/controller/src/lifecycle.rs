//! Lifecycle CloudEvents announcing build and function transitions.

use std::time::Duration;

use kube::ResourceExt;
use lambda_core::LambdaFunction;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// One lifecycle notification.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub event_type: &'static str,
    pub namespace: String,
    pub name: String,
    pub data: Value,
}

impl LifecycleEvent {
    /// Standard payload: identity, phase and build/service summary, merged with `extra`.
    pub fn for_function(event_type: &'static str, f: &LambdaFunction, extra: Value) -> Self {
        let status = f.status.clone().unwrap_or_default();
        let build = status.build_status.unwrap_or_default();
        let mut data = json!({
            "name": f.name_any(),
            "namespace": f.namespace(),
            "phase": status.phase.as_str(),
            "generation": f.generation(),
            "runtime": {"language": f.spec.runtime.language, "version": f.spec.runtime.version},
            "jobName": build.job_name,
            "imageUri": build.image_uri,
            "serviceName": status.service_status.service_name,
            "url": status.service_status.url,
        });
        if let (Some(d), Value::Object(extra)) = (data.as_object_mut(), extra) {
            d.extend(extra);
        }
        Self { event_type, namespace: f.namespace().unwrap_or_default(), name: f.name_any(), data }
    }
}

/// Receives lifecycle events. Delivery is best effort and never blocks reconciliation.
pub trait LifecycleSink: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// Drops everything; used when no sink URL is configured.
pub struct NoopSink;

impl LifecycleSink for NoopSink {
    fn emit(&self, event: LifecycleEvent) {
        debug!(event_type = event.event_type, function = %format!("{}/{}", event.namespace, event.name), "lifecycle emission disabled");
    }
}

/// Binary-mode CloudEvents POSTed to a broker or sink URL.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    source: String,
}

impl HttpSink {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(5)).build()?;
        Ok(Self { client, url: url.into(), source: "knative-lambda-operator".to_string() })
    }

    fn request(&self, event: &LifecycleEvent) -> reqwest::RequestBuilder {
        self.client
            .post(&self.url)
            .header("ce-specversion", "1.0")
            .header("ce-id", uuid::Uuid::new_v4().to_string())
            .header("ce-type", event.event_type)
            .header("ce-source", format!("{}/{}/{}", self.source, event.namespace, event.name))
            .header("ce-subject", format!("{}/{}", event.namespace, event.name))
            .header("ce-time", lambda_core::now_rfc3339())
            .json(&event.data)
    }
}

impl LifecycleSink for HttpSink {
    fn emit(&self, event: LifecycleEvent) {
        let req = self.request(&event);
        tokio::spawn(async move {
            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(event_type = event.event_type, name = %event.name, "lifecycle event delivered");
                }
                Ok(resp) => warn!(event_type = event.event_type, status = %resp.status(), "lifecycle sink rejected event"),
                Err(e) => warn!(event_type = event.event_type, error = %e, "lifecycle event not delivered"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lambda_schema::event_types;

    #[test]
    fn payload_carries_identity_and_extra_fields() {
        let f: LambdaFunction = serde_json::from_value(json!({
            "apiVersion": "lambda.knative.io/v1alpha1",
            "kind": "LambdaFunction",
            "metadata": {"name": "f1", "namespace": "fns"},
            "spec": {"source": {"type": "inline", "inline": {"code": "x"}}, "runtime": {"language": "python", "version": "3.11"}}
        }))
        .unwrap_or_else(|e| panic!("{e}"));
        let ev = LifecycleEvent::for_function(event_types::LIFECYCLE_BUILD_FAILED, &f, json!({"error": "boom"}));
        assert_eq!(ev.namespace, "fns");
        assert_eq!(ev.data["name"], "f1");
        assert_eq!(ev.data["phase"], "Pending");
        assert_eq!(ev.data["error"], "boom");
    }

    #[test]
    fn binary_mode_headers_are_set() {
        let sink = HttpSink::new("http://broker-ingress.knative-eventing.svc.cluster.local/fns/lambda-broker")
            .unwrap_or_else(|e| panic!("{e}"));
        let ev = LifecycleEvent { event_type: event_types::LIFECYCLE_FUNCTION_READY, namespace: "fns".into(), name: "f1".into(), data: json!({}) };
        let req = sink.request(&ev).build().unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(req.headers().get("ce-type").and_then(|v| v.to_str().ok()), Some(event_types::LIFECYCLE_FUNCTION_READY));
        assert_eq!(req.headers().get("ce-subject").and_then(|v| v.to_str().ok()), Some("fns/f1"));
        assert_eq!(req.headers().get("content-type").and_then(|v| v.to_str().ok()), Some("application/json"));
    }
}
