//! Lambda controller: drives each LambdaFunction from source to a running Knative Service

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::{
    api::Api,
    runtime::{controller::Action, watcher, Controller},
    Client, ResourceExt,
};
use lambda_core::{keys, LambdaError, LambdaFunction};
use tracing::{debug, info, warn};

pub mod eventing;
pub mod lifecycle;
pub mod manifest;
mod reconcile;

pub use lifecycle::{HttpSink, LifecycleEvent, LifecycleSink, NoopSink};
pub use reconcile::Reconciler;

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub requeue_short: Duration,
    pub requeue_medium: Duration,
    pub requeue_long: Duration,
    pub serving_enabled: bool,
    pub eventing_enabled: bool,
    /// Lifecycle CloudEvents go here; unset disables emission.
    pub events_sink: Option<String>,
    pub lease_secs: i32,
    /// Identity written into Leases.
    pub holder: String,
    /// Service account for function pods.
    pub function_service_account: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            requeue_short: Duration::from_secs(15),
            requeue_medium: Duration::from_secs(60),
            requeue_long: Duration::from_secs(300),
            serving_enabled: true,
            eventing_enabled: false,
            events_sink: None,
            lease_secs: 15,
            holder: format!("lambda-controller-{}", uuid::Uuid::new_v4()),
            function_service_account: None,
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let holder = std::env::var("LAMBDA_POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or(d.holder);
        Self {
            serving_enabled: env_bool("LAMBDA_SERVING_ENABLED", d.serving_enabled),
            eventing_enabled: env_bool("LAMBDA_EVENTING_ENABLED", d.eventing_enabled),
            events_sink: std::env::var("LAMBDA_EVENTS_SINK").ok().filter(|s| !s.trim().is_empty()),
            lease_secs: std::env::var("LAMBDA_LEASE_SECS").ok().and_then(|s| s.parse().ok()).filter(|s| *s > 0).unwrap_or(d.lease_secs),
            holder,
            function_service_account: std::env::var("LAMBDA_FUNCTION_SERVICE_ACCOUNT").ok().filter(|s| !s.is_empty()),
            ..d
        }
    }

    /// The configured sink, or one that drops every event.
    pub fn lifecycle_sink(&self) -> Arc<dyn LifecycleSink> {
        match self.events_sink.as_deref() {
            Some(url) => match HttpSink::new(url) {
                Ok(sink) => Arc::new(sink),
                Err(e) => {
                    warn!(error = %e, "lifecycle sink unavailable, emission disabled");
                    Arc::new(NoopSink)
                }
            },
            None => Arc::new(NoopSink),
        }
    }
}

async fn reconcile(f: Arc<LambdaFunction>, ctx: Arc<Reconciler>) -> Result<Action, LambdaError> {
    let ns = f.namespace().unwrap_or_default();
    match ctx.reconcile(&ns, &f.name_any()).await? {
        Some(after) => Ok(Action::requeue(after)),
        None => Ok(Action::await_change()),
    }
}

fn error_policy(f: Arc<LambdaFunction>, err: &LambdaError, ctx: Arc<Reconciler>) -> Action {
    warn!(function = %f.key(), error = %err, "reconcile failed");
    Action::requeue(ctx.config().requeue_short)
}

/// Watch functions (and their build jobs) until `shutdown` resolves.
pub async fn run(
    client: Client,
    reconciler: Arc<Reconciler>,
    namespace: Option<&str>,
    shutdown: impl Future<Output = ()> + Send + Sync + 'static,
) -> anyhow::Result<()> {
    let (functions, jobs): (Api<LambdaFunction>, Api<Job>) = match namespace {
        Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client, ns)),
        None => (Api::all(client.clone()), Api::all(client)),
    };
    info!(namespace = namespace.unwrap_or("*"), "controller starting");
    Controller::new(functions, watcher::Config::default())
        .owns(jobs, watcher::Config::default().labels(&format!("{}=true", keys::BUILD_LABEL)))
        .graceful_shutdown_on(shutdown)
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(function = %format!("{}/{}", obj.namespace.unwrap_or_default(), obj.name), "reconciled"),
                Err(e) => debug!(error = %e, "reconcile loop error"),
            }
        })
        .await;
    info!("controller stopped");
    Ok(())
}
