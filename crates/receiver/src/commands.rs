//! Command handlers: each turns one CloudEvent into a spec or metadata write.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::ResourceExt;
use lambda_core::{keys, LambdaError, LambdaFunction, LambdaFunctionSpec, Phase, SourceSpec};
use lambda_kubehub::FunctionStore;
use lambda_schema::event_types as et;
use lambda_telemetry::{MetricsRecorder, Outcome, ResponseEvent};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::envelope::CloudEvent;

/// What a dispatched event amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Created,
    Updated,
    Deleted,
    /// Accepted without any write: unknown type, nothing to cancel, skipped telemetry.
    Ignored,
    Recorded,
}

#[derive(Debug, Default, Deserialize)]
struct DeployMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct DeployPayload {
    #[serde(default)]
    metadata: DeployMetadata,
    #[serde(default)]
    spec: Value,
}

/// Shared shape of delete, build and rollback payloads.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetPayload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    force_rebuild: bool,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    revision: String,
}

fn parse<T: serde::de::DeserializeOwned + Default>(data: &Value, what: &str) -> Result<T, LambdaError> {
    match data {
        Value::Null => Ok(T::default()),
        v => serde_json::from_value(v.clone()).map_err(|e| LambdaError::Malformed(format!("{what} payload: {e}"))),
    }
}

/// Request timestamp for intent annotations; sub-second so back-to-back requests differ.
fn stamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub struct Commands {
    store: Arc<dyn FunctionStore>,
    recorder: MetricsRecorder,
    default_namespace: String,
}

impl Commands {
    pub fn new(store: Arc<dyn FunctionStore>, default_namespace: impl Into<String>) -> Self {
        let default_namespace = default_namespace.into();
        Self { store, recorder: MetricsRecorder::new(default_namespace.clone()), default_namespace }
    }

    fn namespace(&self, ns: &str) -> String {
        if ns.trim().is_empty() {
            self.default_namespace.clone()
        } else {
            ns.trim().to_string()
        }
    }

    /// Payload name, else the event subject.
    fn target(&self, ev: &CloudEvent, payload: &TargetPayload) -> Result<(String, String), LambdaError> {
        let name = Some(payload.name.trim())
            .filter(|n| !n.is_empty())
            .or_else(|| ev.subject().map(str::trim).filter(|s| !s.is_empty()))
            .ok_or_else(|| LambdaError::Validation("name is required (payload name or event subject)".into()))?;
        Ok((self.namespace(&payload.namespace), name.to_string()))
    }

    pub async fn dispatch(&self, ev: &CloudEvent) -> Result<Handled, LambdaError> {
        match ev.event_type.as_str() {
            et::FUNCTION_DEPLOY | et::SERVICE_CREATE | et::SERVICE_UPDATE => self.deploy(ev).await,
            et::SERVICE_DELETE => self.delete(ev).await,
            et::BUILD_START | et::BUILD_RETRY => self.build_start(ev).await,
            et::BUILD_CANCEL => self.build_cancel(ev).await,
            et::FUNCTION_ROLLBACK => self.rollback(ev).await,
            et::RESPONSE_SUCCESS => Ok(self.response(ev, Outcome::Success)),
            et::RESPONSE_ERROR => Ok(self.response(ev, Outcome::Error)),
            other => {
                debug!(event_type = other, event_id = %ev.id, "ignoring unhandled event type");
                Ok(Handled::Ignored)
            }
        }
    }

    /// Create, or replace the spec of, the named function.
    async fn deploy(&self, ev: &CloudEvent) -> Result<Handled, LambdaError> {
        let payload: DeployPayload = match &ev.data {
            Value::Object(_) => serde_json::from_value(ev.data.clone()).map_err(|e| LambdaError::Malformed(format!("deploy payload: {e}")))?,
            _ => return Err(LambdaError::Malformed("deploy payload must be a JSON object".into())),
        };
        let name = payload.metadata.name.trim().to_string();
        if name.is_empty() {
            return Err(LambdaError::Validation("metadata.name is required".into()));
        }
        // Precise source errors before the generic spec decode.
        SourceSpec::from_value(payload.spec.get("source").unwrap_or(&Value::Null))?;
        let spec: LambdaFunctionSpec =
            serde_json::from_value(payload.spec).map_err(|e| LambdaError::Validation(format!("invalid spec: {e}")))?;
        let ns = self.namespace(&payload.metadata.namespace);

        match self.store.get(&ns, &name).await {
            Ok(mut existing) => {
                existing.spec = spec;
                existing.labels_mut().extend(payload.metadata.labels);
                let annotations = existing.annotations_mut();
                annotations.extend(payload.metadata.annotations);
                annotations.insert(keys::LAST_CLOUDEVENT_ID.into(), ev.id.clone());
                let updated = self.store.update(&existing).await?;
                info!(function = %updated.key(), event_id = %ev.id, generation = updated.generation(), "function updated");
                Ok(Handled::Updated)
            }
            Err(e) if e.is_not_found() => {
                let mut f = LambdaFunction::new(&name, spec);
                f.metadata.namespace = Some(ns);
                f.metadata.labels = Some(payload.metadata.labels);
                let mut annotations = BTreeMap::from([
                    (keys::CREATED_BY_CLOUDEVENT.to_string(), "true".to_string()),
                    (keys::CLOUDEVENT_ID.to_string(), ev.id.clone()),
                    (keys::CLOUDEVENT_SOURCE.to_string(), ev.source.clone()),
                ]);
                annotations.extend(payload.metadata.annotations);
                f.metadata.annotations = Some(annotations);
                let created = self.store.create(&f).await?;
                info!(function = %created.key(), event_id = %ev.id, source_type = created.spec.source.type_name(), "function created");
                Ok(Handled::Created)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, ev: &CloudEvent) -> Result<Handled, LambdaError> {
        let payload: TargetPayload = parse(&ev.data, "delete")?;
        let (ns, name) = self.target(ev, &payload)?;
        self.store.delete(&ns, &name).await?;
        info!(function = %format!("{ns}/{name}"), event_id = %ev.id, reason = %payload.reason, "function delete requested");
        Ok(Handled::Deleted)
    }

    /// Record a rebuild intent; the controller resets the build and starts over.
    async fn build_start(&self, ev: &CloudEvent) -> Result<Handled, LambdaError> {
        let payload: TargetPayload = parse(&ev.data, "build")?;
        let (ns, name) = self.target(ev, &payload)?;
        let mut f = self.store.get(&ns, &name).await?;
        f.annotations_mut().insert(keys::REBUILD_REQUESTED.into(), stamp());
        // the force belongs to this request only; spec.build stays user-owned
        if payload.force_rebuild {
            f.annotations_mut().insert(keys::REBUILD_FORCE.into(), "true".into());
        } else {
            f.annotations_mut().remove(keys::REBUILD_FORCE);
        }
        self.store.update(&f).await?;
        info!(function = %f.key(), event_id = %ev.id, force = payload.force_rebuild, "rebuild requested");
        Ok(Handled::Updated)
    }

    /// Only a running build can be cancelled; anything else succeeds without a write.
    async fn build_cancel(&self, ev: &CloudEvent) -> Result<Handled, LambdaError> {
        let payload: TargetPayload = parse(&ev.data, "cancel")?;
        let (ns, name) = self.target(ev, &payload)?;
        let mut f = self.store.get(&ns, &name).await?;
        if f.phase() != Phase::Building {
            debug!(function = %f.key(), phase = f.phase().as_str(), "no build to cancel");
            return Ok(Handled::Ignored);
        }
        let reason = if payload.reason.trim().is_empty() { "cancelled by request".to_string() } else { payload.reason.clone() };
        let annotations = f.annotations_mut();
        annotations.insert(keys::CANCEL_REQUESTED.into(), stamp());
        annotations.insert(keys::CANCEL_REASON.into(), reason);
        self.store.update(&f).await?;
        info!(function = %f.key(), event_id = %ev.id, "build cancel requested");
        Ok(Handled::Updated)
    }

    /// Rollback is recorded for the serving layer; no revision means the previous known-good one.
    async fn rollback(&self, ev: &CloudEvent) -> Result<Handled, LambdaError> {
        let payload: TargetPayload = parse(&ev.data, "rollback")?;
        let (ns, name) = self.target(ev, &payload)?;
        let mut f = self.store.get(&ns, &name).await?;
        let target = if payload.revision.trim().is_empty() { "previous".to_string() } else { payload.revision.trim().to_string() };
        let annotations = f.annotations_mut();
        annotations.insert(keys::ROLLBACK_REQUESTED.into(), stamp());
        annotations.insert(keys::ROLLBACK_TARGET.into(), target.clone());
        if !payload.reason.trim().is_empty() {
            annotations.insert(keys::ROLLBACK_REASON.into(), payload.reason.clone());
        }
        self.store.update(&f).await?;
        info!(function = %f.key(), event_id = %ev.id, target = %target, "rollback requested");
        Ok(Handled::Updated)
    }

    /// Telemetry never fails ingestion: unparseable or anonymous events are skipped.
    fn response(&self, ev: &CloudEvent, outcome: Outcome) -> Handled {
        let event: ResponseEvent = match serde_json::from_value(ev.data.clone()) {
            Ok(e) => e,
            Err(e) => {
                debug!(event_id = %ev.id, error = %e, "response payload unreadable, metrics skipped");
                return Handled::Ignored;
            }
        };
        match self.recorder.record(outcome, &event, ev.subject()) {
            Some(_) => Handled::Recorded,
            None => {
                debug!(event_id = %ev.id, "response names no function, metrics skipped");
                Handled::Ignored
            }
        }
    }
}
