//! Knative serving and eventing objects, addressed dynamically.

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use lambda_core::{keys, StoreError, MANAGER};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{is_not_found, store_error};

/// What the serving layer reports back about a Service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceObservation {
    pub url: Option<String>,
    pub ready: bool,
    pub latest_revision: Option<String>,
}

impl ServiceObservation {
    /// Read `status.url`, the `Ready` condition and `latestReadyRevisionName`.
    pub fn from_status(status: Option<&Value>) -> Self {
        let Some(status) = status else { return Self::default() };
        let ready = status
            .get("conditions")
            .and_then(Value::as_array)
            .map(|cs| {
                cs.iter().any(|c| {
                    c.get("type").and_then(Value::as_str) == Some("Ready")
                        && c.get("status").and_then(Value::as_str) == Some("True")
                })
            })
            .unwrap_or(false);
        let revision = status
            .get("latestReadyRevisionName")
            .or_else(|| status.get("latestCreatedRevisionName"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Self { url: status.get("url").and_then(Value::as_str).map(str::to_string), ready, latest_revision: revision }
    }
}

/// Serving Services and the shared eventing Broker.
#[async_trait]
pub trait ServingClient: Send + Sync {
    /// Server-side apply a full Service manifest and report its current status.
    async fn apply_service(&self, namespace: &str, name: &str, manifest: &Value) -> Result<ServiceObservation, StoreError>;
    async fn observe_service(&self, namespace: &str, name: &str) -> Result<Option<ServiceObservation>, StoreError>;
    /// Absent services are fine.
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
    /// `true` when the Broker had to be created.
    async fn ensure_broker(&self, namespace: &str, name: &str) -> Result<bool, StoreError>;
}

fn service_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("serving.knative.dev", "v1", "Service"))
}

fn broker_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("eventing.knative.dev", "v1", "Broker"))
}

#[derive(Clone)]
pub struct KubeServing {
    client: Client,
}

impl KubeServing {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn services(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &service_resource())
    }
}

#[async_trait]
impl ServingClient for KubeServing {
    async fn apply_service(&self, namespace: &str, name: &str, manifest: &Value) -> Result<ServiceObservation, StoreError> {
        let what = format!("service {namespace}/{name}");
        let applied = self
            .services(namespace)
            .patch(name, &PatchParams::apply(MANAGER).force(), &Patch::Apply(manifest))
            .await
            .map_err(|e| store_error(e, &what))?;
        debug!(service = %what, "applied");
        Ok(ServiceObservation::from_status(applied.data.get("status")))
    }

    async fn observe_service(&self, namespace: &str, name: &str) -> Result<Option<ServiceObservation>, StoreError> {
        let what = format!("service {namespace}/{name}");
        let obj = self.services(namespace).get_opt(name).await.map_err(|e| store_error(e, &what))?;
        Ok(obj.map(|o| ServiceObservation::from_status(o.data.get("status"))))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match self.services(namespace).delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(ns = %namespace, service = %name, "service deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(store_error(e, &format!("service {namespace}/{name}"))),
        }
    }

    async fn ensure_broker(&self, namespace: &str, name: &str) -> Result<bool, StoreError> {
        let what = format!("broker {namespace}/{name}");
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &broker_resource());
        if api.get_opt(name).await.map_err(|e| store_error(e, &what))?.is_some() {
            return Ok(false);
        }
        let mut labels = serde_json::Map::new();
        labels.insert(keys::MANAGED_BY.to_string(), Value::from(MANAGER));
        let manifest = json!({
            "apiVersion": "eventing.knative.dev/v1",
            "kind": "Broker",
            "metadata": {"name": name, "namespace": namespace, "labels": labels},
        });
        api.patch(name, &PatchParams::apply(MANAGER), &Patch::Apply(&manifest)).await.map_err(|e| store_error(e, &what))?;
        info!(broker = %what, "broker created");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_condition_and_url_are_read_from_status() {
        let status = json!({
            "url": "http://hello.fns.example.com",
            "latestCreatedRevisionName": "hello-00002",
            "latestReadyRevisionName": "hello-00001",
            "conditions": [
                {"type": "ConfigurationsReady", "status": "True"},
                {"type": "Ready", "status": "True"}
            ]
        });
        let obs = ServiceObservation::from_status(Some(&status));
        assert!(obs.ready);
        assert_eq!(obs.url.as_deref(), Some("http://hello.fns.example.com"));
        assert_eq!(obs.latest_revision.as_deref(), Some("hello-00001"));
    }

    #[test]
    fn missing_or_unready_status_is_not_ready() {
        assert_eq!(ServiceObservation::from_status(None), ServiceObservation::default());
        let status = json!({"conditions": [{"type": "Ready", "status": "Unknown", "reason": "RevisionMissing"}]});
        let obs = ServiceObservation::from_status(Some(&status));
        assert!(!obs.ready);
        assert_eq!(obs.url, None);
    }

    #[test]
    fn knative_resources_use_lowercase_plurals() {
        assert_eq!(service_resource().plural, "services");
        assert_eq!(broker_resource().plural, "brokers");
        assert_eq!(service_resource().api_version, "serving.knative.dev/v1");
    }
}
