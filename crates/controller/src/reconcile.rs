use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::ResourceExt;
use lambda_build::{prebuilt_image, sanitize_error, BuildManager, BuildPlan, JobState};
use lambda_core::{
    conditions, keys, now_rfc3339, set_condition, BuildStatusInfo, Condition, ConditionStatus, LambdaError,
    LambdaFunction, LambdaFunctionStatus, Phase, ServiceStatusInfo, FINALIZER,
};
use lambda_kubehub::{FunctionStore, ServiceObservation, ServingClient, SharedLock};
use lambda_schema::event_types;
use lambda_telemetry::operator;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::eventing::{ensure_shared_broker, BrokerState};
use crate::lifecycle::{LifecycleEvent, LifecycleSink};
use crate::manifest::service_manifest;
use crate::ControllerConfig;

/// Working copy of one reconcile: the status being built and the events to announce once it is stored.
struct Pass {
    status: LambdaFunctionStatus,
    events: Vec<(&'static str, Value)>,
}

impl Pass {
    fn condition(&mut self, type_: &str, status: ConditionStatus, reason: &str, message: impl Into<String>) {
        set_condition(&mut self.status.conditions, Condition::new(type_, status, reason, message));
    }

    fn emit(&mut self, event_type: &'static str, extra: Value) {
        self.events.push((event_type, extra));
    }

    fn running_job(&self) -> Option<String> {
        self.status.build_status.as_ref().map(|b| b.job_name.clone()).filter(|j| !j.is_empty())
    }

    /// Close the current build record with `error`.
    fn fail_build(&mut self, error: String) {
        let bs = self.status.build_status.get_or_insert_with(BuildStatusInfo::default);
        bs.error = Some(error);
        bs.completed_at = Some(now_rfc3339());
        self.status.phase = Phase::Failed;
    }
}

fn seconds_since(started_at: Option<&str>) -> f64 {
    started_at
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|t| (chrono::Utc::now() - t.with_timezone(&chrono::Utc)).num_milliseconds().max(0) as f64 / 1000.0)
        .unwrap_or(0.0)
}

fn runtime_label(f: &LambdaFunction) -> &'static str {
    f.language().map(|l| l.as_str()).unwrap_or("unknown")
}

/// Drives one function through Pending, Building, Ready and Failed.
pub struct Reconciler {
    store: Arc<dyn FunctionStore>,
    builds: Arc<BuildManager>,
    serving: Arc<dyn ServingClient>,
    leases: Arc<dyn SharedLock>,
    lifecycle: Arc<dyn LifecycleSink>,
    config: ControllerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn FunctionStore>,
        builds: Arc<BuildManager>,
        serving: Arc<dyn ServingClient>,
        leases: Arc<dyn SharedLock>,
        lifecycle: Arc<dyn LifecycleSink>,
        config: ControllerConfig,
    ) -> Self {
        Self { store, builds, serving, leases, lifecycle, config }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// One pass over `namespace/name`. Returns when to look again, `None` when nothing is left to do.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Option<Duration>, LambdaError> {
        let started = Instant::now();
        let f = match self.store.get(namespace, name).await {
            Ok(f) => f,
            Err(e) if e.is_not_found() => {
                debug!(ns = %namespace, name, "function gone");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let phase = f.phase().as_str();
        let out = if f.metadata.deletion_timestamp.is_some() {
            self.finalize(&f).await.map(|_| None)
        } else {
            self.converge(f).await
        };
        let result = if out.is_ok() { "success" } else { "error" };
        operator::record_reconcile(phase, result, started.elapsed().as_secs_f64());
        if let Err(e) = &out {
            operator::record_error("controller", e.code());
        }
        out
    }

    async fn converge(&self, f: LambdaFunction) -> Result<Option<Duration>, LambdaError> {
        let f = self.ensure_finalizer(f).await?;
        let before = f.status.clone().unwrap_or_default();
        let mut pass = Pass { status: before.clone(), events: Vec::new() };

        self.observe_intents(&f, &mut pass).await;
        let requeue = match pass.status.phase {
            Phase::Pending => self.pending(&f, &mut pass).await?,
            Phase::Building => self.building(&f, &mut pass).await?,
            Phase::Ready => self.ready(&f, &mut pass).await?,
            Phase::Failed => Some(self.config.requeue_long),
        };

        let stored = if pass.status != before {
            if pass.status.phase != before.phase {
                info!(function = %f.key(), from = before.phase.as_str(), to = pass.status.phase.as_str(), "phase changed");
            }
            let mut next = f.clone();
            next.status = Some(pass.status);
            self.store.update_status(&next).await?
        } else {
            f
        };
        for (event_type, extra) in pass.events {
            self.lifecycle.emit(LifecycleEvent::for_function(event_type, &stored, extra));
        }
        Ok(requeue)
    }

    async fn ensure_finalizer(&self, mut f: LambdaFunction) -> Result<LambdaFunction, LambdaError> {
        if f.finalizers().iter().any(|x| x == FINALIZER) {
            return Ok(f);
        }
        f.finalizers_mut().push(FINALIZER.to_string());
        let updated = self.store.update(&f).await?;
        debug!(function = %f.key(), "finalizer added");
        Ok(updated)
    }

    async fn finalize(&self, f: &LambdaFunction) -> Result<(), LambdaError> {
        if !f.finalizers().iter().any(|x| x == FINALIZER) {
            return Ok(());
        }
        let ns = f.namespace().unwrap_or_default();
        let name = f.name_any();
        info!(function = %f.key(), "cleaning up deleted function");
        self.builds.cleanup(f).await?;
        if self.config.serving_enabled {
            self.serving.delete_service(&ns, &name).await?;
        }
        self.lifecycle.emit(LifecycleEvent::for_function(event_types::LIFECYCLE_FUNCTION_DELETED, f, json!({})));

        let mut next = f.clone();
        next.finalizers_mut().retain(|x| x != FINALIZER);
        match self.store.update(&next).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn stop_job(&self, f: &LambdaFunction, job: &str) {
        let ns = f.namespace().unwrap_or_default();
        if let Err(e) = self.builds.cancel(&ns, job).await {
            warn!(function = %f.key(), job, error = %e, "build job deletion failed");
        }
    }

    /// Spec edits, rebuild and cancel requests, in that order.
    async fn observe_intents(&self, f: &LambdaFunction, pass: &mut Pass) {
        let generation = f.generation();
        if generation != pass.status.observed_generation {
            if pass.status.phase != Phase::Pending {
                info!(function = %f.key(), generation, "spec changed");
                if pass.status.phase == Phase::Building {
                    if let Some(job) = pass.running_job() {
                        self.stop_job(f, &job).await;
                        operator::build_finished(&f.namespace().unwrap_or_default());
                    }
                }
                pass.status.phase = Phase::Pending;
            }
            pass.status.observed_generation = generation;
        }

        if let Some(req) = f.annotation(keys::REBUILD_REQUESTED) {
            if pass.status.observed_rebuild_request.as_deref() != Some(req) {
                let forced = f.annotation(keys::REBUILD_FORCE) == Some("true");
                info!(function = %f.key(), request = req, forced, "rebuild requested");
                pass.status.observed_rebuild_request = Some(req.to_string());
                if let Some(job) = pass.running_job() {
                    // Frees the job name for the next submission.
                    self.stop_job(f, &job).await;
                    if pass.status.phase == Phase::Building {
                        operator::build_finished(&f.namespace().unwrap_or_default());
                    }
                }
                // Only a successful build stays around, as a reuse candidate.
                // A forced request keeps the record but not its completion, so it cannot be reused.
                pass.status.build_status = pass
                    .status
                    .build_status
                    .take()
                    .filter(|b| b.error.is_none() && b.completed_at.is_some())
                    .map(|b| BuildStatusInfo {
                        job_name: String::new(),
                        completed_at: if forced { None } else { b.completed_at },
                        ..b
                    });
                pass.status.phase = Phase::Pending;
                pass.condition(conditions::BUILD_READY, ConditionStatus::False, "RebuildRequested", format!("rebuild requested at {req}"));
            }
        }

        if let Some(req) = f.annotation(keys::CANCEL_REQUESTED) {
            if pass.status.observed_cancel_request.as_deref() != Some(req) {
                pass.status.observed_cancel_request = Some(req.to_string());
                if pass.status.phase != Phase::Building {
                    debug!(function = %f.key(), phase = pass.status.phase.as_str(), "cancel ignored, no build running");
                    return;
                }
                let reason = sanitize_error(f.annotation(keys::CANCEL_REASON).filter(|r| !r.trim().is_empty()).unwrap_or("cancelled by request"));
                info!(function = %f.key(), reason = %reason, "build cancelled");
                if let Some(job) = pass.running_job() {
                    self.stop_job(f, &job).await;
                }
                operator::build_finished(&f.namespace().unwrap_or_default());
                let secs = seconds_since(pass.status.build_status.as_ref().and_then(|b| b.started_at.as_deref()));
                operator::record_build(runtime_label(f), "cancelled", secs);
                pass.fail_build(format!("Cancelled: {reason}"));
                pass.condition(conditions::BUILD_READY, ConditionStatus::False, "BuildCancelled", reason.clone());
                pass.emit(event_types::LIFECYCLE_BUILD_CANCELLED, json!({"reason": reason}));
            }
        }
    }

    async fn pending(&self, f: &LambdaFunction, pass: &mut Pass) -> Result<Option<Duration>, LambdaError> {
        if let Err(e) = self.builds.validate(f) {
            warn!(function = %f.key(), error = %e, "function spec rejected");
            operator::record_error("controller", "validation_failed");
            pass.condition(conditions::SOURCE_READY, ConditionStatus::False, "InvalidSpec", e.to_string());
            pass.fail_build(e.to_string());
            return Ok(Some(self.config.requeue_long));
        }

        if self.config.eventing_enabled {
            let ns = f.namespace().unwrap_or_default();
            match ensure_shared_broker(self.leases.as_ref(), self.serving.as_ref(), &ns, &self.config.holder, self.config.lease_secs).await {
                Ok(BrokerState::Contended) => {
                    pass.condition(conditions::EVENTING_READY, ConditionStatus::Unknown, "BrokerLockHeld", "another replica is creating the broker");
                    return Ok(Some(self.config.requeue_short));
                }
                Ok(state) => {
                    if state == BrokerState::Created {
                        info!(ns = %ns, "shared broker created");
                    }
                    pass.condition(conditions::EVENTING_READY, ConditionStatus::True, "BrokerReady", "shared broker present");
                }
                Err(e) => {
                    warn!(function = %f.key(), error = %e, "broker setup failed");
                    operator::record_error("eventing", "broker_failed");
                    pass.condition(conditions::EVENTING_READY, ConditionStatus::False, "BrokerFailed", e.to_string());
                    return Ok(Some(self.config.requeue_short));
                }
            }
        }

        if let Some(image_uri) = prebuilt_image(f) {
            let now = now_rfc3339();
            pass.status.build_status = Some(BuildStatusInfo {
                image_uri: Some(image_uri.clone()),
                started_at: Some(now.clone()),
                completed_at: Some(now),
                attempt: 1,
                ..BuildStatusInfo::default()
            });
            pass.condition(conditions::SOURCE_READY, ConditionStatus::True, "PrebuiltImage", format!("using {image_uri}"));
            pass.condition(conditions::BUILD_READY, ConditionStatus::True, "BuildSkipped", "pre-built image, no build needed");
            return self.deploy(f, pass, &image_uri).await;
        }

        let previous = pass.status.build_status.clone();
        let attempt = previous.as_ref().map(|b| b.attempt).unwrap_or(0) + 1;
        match self.builds.start(f, previous.as_ref(), f.force_rebuild()).await {
            Ok(BuildPlan::Reuse { image_uri, content_hash }) => {
                pass.condition(conditions::SOURCE_READY, ConditionStatus::True, "SourceUnchanged", format!("content hash {content_hash}"));
                pass.condition(conditions::BUILD_READY, ConditionStatus::True, "BuildReused", format!("reusing {image_uri}"));
                self.deploy(f, pass, &image_uri).await
            }
            Ok(BuildPlan::Submitted { job_name, image_uri, content_hash, revision }) => {
                operator::build_started(&f.namespace().unwrap_or_default());
                let fetched = revision.map(|r| format!("source fetched at {r}")).unwrap_or_else(|| "source fetched".to_string());
                pass.condition(conditions::SOURCE_READY, ConditionStatus::True, "SourceFetched", fetched);
                pass.condition(conditions::BUILD_READY, ConditionStatus::False, "BuildRunning", format!("job {job_name} submitted"));
                pass.emit(event_types::LIFECYCLE_BUILD_STARTED, json!({"jobName": job_name, "attempt": attempt}));
                pass.status.build_status = Some(BuildStatusInfo {
                    job_name,
                    image_uri: Some(image_uri),
                    content_hash: Some(content_hash),
                    started_at: Some(now_rfc3339()),
                    completed_at: None,
                    error: None,
                    attempt,
                });
                pass.status.phase = Phase::Building;
                Ok(Some(self.config.requeue_short))
            }
            Err(e) if e.is_retryable() || matches!(e, LambdaError::Conflict(_)) => {
                warn!(function = %f.key(), error = %e, "build not started, will retry");
                operator::record_error("build", "fetch_failed");
                pass.condition(conditions::SOURCE_READY, ConditionStatus::False, "SourceUnavailable", e.to_string());
                Ok(Some(self.config.requeue_short))
            }
            Err(e) => {
                warn!(function = %f.key(), error = %e, "build cannot start");
                operator::record_error("build", e.code());
                pass.condition(conditions::SOURCE_READY, ConditionStatus::False, "SourceInvalid", e.to_string());
                pass.fail_build(sanitize_error(&e.to_string()));
                pass.emit(event_types::LIFECYCLE_BUILD_FAILED, json!({"error": e.to_string()}));
                Ok(Some(self.config.requeue_long))
            }
        }
    }

    async fn building(&self, f: &LambdaFunction, pass: &mut Pass) -> Result<Option<Duration>, LambdaError> {
        let ns = f.namespace().unwrap_or_default();
        let Some(job) = pass.running_job() else {
            warn!(function = %f.key(), "building without a job, starting over");
            pass.status.phase = Phase::Pending;
            return Ok(Some(Duration::ZERO));
        };
        let state = match self.builds.poll(&ns, &job).await {
            Ok(state) => state,
            Err(LambdaError::NotFound(_)) => {
                warn!(function = %f.key(), job = %job, "build job disappeared, starting over");
                operator::build_finished(&ns);
                if let Some(bs) = pass.status.build_status.as_mut() {
                    bs.job_name.clear();
                }
                pass.status.phase = Phase::Pending;
                return Ok(Some(Duration::ZERO));
            }
            Err(e) => return Err(e),
        };
        let started_at = pass.status.build_status.as_ref().and_then(|b| b.started_at.clone());
        match state {
            JobState::Running => Ok(Some(self.config.requeue_short)),
            JobState::Failed(reason) => {
                operator::build_finished(&ns);
                operator::record_build(runtime_label(f), "failed", seconds_since(started_at.as_deref()));
                operator::record_error("build", "build_failed");
                warn!(function = %f.key(), job = %job, reason = %reason, "build failed");
                pass.condition(conditions::BUILD_READY, ConditionStatus::False, "BuildFailed", reason.clone());
                pass.fail_build(reason.clone());
                pass.emit(event_types::LIFECYCLE_BUILD_FAILED, json!({"error": reason}));
                Ok(Some(self.config.requeue_long))
            }
            JobState::Succeeded => {
                let first_sight = pass.status.build_status.as_ref().map(|b| b.completed_at.is_none()).unwrap_or(true);
                let image_uri = pass.status.build_status.as_ref().and_then(|b| b.image_uri.clone());
                let Some(image_uri) = image_uri else {
                    pass.fail_build("build finished without an image reference".to_string());
                    return Ok(Some(self.config.requeue_long));
                };
                if first_sight {
                    operator::build_finished(&ns);
                    operator::record_build(runtime_label(f), "success", seconds_since(started_at.as_deref()));
                    info!(function = %f.key(), job = %job, image = %image_uri, "build succeeded");
                    if let Some(bs) = pass.status.build_status.as_mut() {
                        bs.completed_at = Some(now_rfc3339());
                    }
                    pass.condition(conditions::BUILD_READY, ConditionStatus::True, "BuildSucceeded", format!("image {image_uri}"));
                    pass.emit(event_types::LIFECYCLE_BUILD_COMPLETED, json!({"imageUri": image_uri}));
                }
                self.deploy(f, pass, &image_uri).await
            }
        }
    }

    async fn ready(&self, f: &LambdaFunction, pass: &mut Pass) -> Result<Option<Duration>, LambdaError> {
        if !self.config.serving_enabled {
            return Ok(Some(self.config.requeue_medium));
        }
        let ns = f.namespace().unwrap_or_default();
        let name = f.name_any();
        match self.serving.observe_service(&ns, &name).await? {
            Some(obs) => {
                self.record_service(pass, &name, obs);
                Ok(Some(self.config.requeue_medium))
            }
            None => {
                let image_uri = pass.status.build_status.as_ref().and_then(|b| b.image_uri.clone());
                match image_uri {
                    Some(image_uri) => {
                        warn!(function = %f.key(), "service missing, re-applying");
                        self.deploy(f, pass, &image_uri).await
                    }
                    None => {
                        pass.status.phase = Phase::Pending;
                        Ok(Some(Duration::ZERO))
                    }
                }
            }
        }
    }

    /// Apply the Knative Service; the function is Ready once the apply is accepted.
    async fn deploy(&self, f: &LambdaFunction, pass: &mut Pass, image_uri: &str) -> Result<Option<Duration>, LambdaError> {
        let name = f.name_any();
        if !self.config.serving_enabled {
            pass.condition(conditions::SERVICE_READY, ConditionStatus::Unknown, "ServingDisabled", "service deployment is disabled");
            self.mark_ready(pass, json!({"imageUri": image_uri}));
            return Ok(Some(self.config.requeue_medium));
        }
        let ns = f.namespace().unwrap_or_default();
        let manifest = service_manifest(f, image_uri, self.config.function_service_account.as_deref());
        match self.serving.apply_service(&ns, &name, &manifest).await {
            Ok(obs) => {
                info!(function = %f.key(), image = %image_uri, ready = obs.ready, "service applied");
                let url = obs.url.clone();
                self.record_service(pass, &name, obs);
                self.mark_ready(pass, json!({"imageUri": image_uri, "url": url}));
                Ok(Some(self.config.requeue_medium))
            }
            Err(e) => {
                warn!(function = %f.key(), error = %e, "service apply failed");
                operator::record_error("serving", "apply_failed");
                pass.condition(conditions::SERVICE_READY, ConditionStatus::False, "ServiceApplyFailed", e.to_string());
                Ok(Some(self.config.requeue_short))
            }
        }
    }

    fn mark_ready(&self, pass: &mut Pass, extra: Value) {
        if pass.status.phase != Phase::Ready {
            pass.status.phase = Phase::Ready;
            pass.emit(event_types::LIFECYCLE_FUNCTION_READY, extra);
        }
    }

    fn record_service(&self, pass: &mut Pass, name: &str, obs: ServiceObservation) {
        if obs.ready {
            pass.condition(conditions::SERVICE_READY, ConditionStatus::True, "ServiceReady", "service is serving traffic");
        } else {
            pass.condition(conditions::SERVICE_READY, ConditionStatus::False, "ServiceNotReady", "waiting for the service to become ready");
        }
        pass.status.service_status = ServiceStatusInfo {
            service_name: Some(name.to_string()),
            url: obs.url,
            ready: obs.ready,
            latest_revision: obs.latest_revision,
        };
    }
}
