//! Cross-replica mutual exclusion on `coordination.k8s.io/v1` Leases.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::{
    api::{Api, PostParams},
    Client,
};
use lambda_core::StoreError;
use tracing::{debug, info};

use crate::store_error;

/// A named lock shared by every controller replica.
#[async_trait]
pub trait SharedLock: Send + Sync {
    /// `true` when `holder` now owns the lock. Expired locks are taken over.
    async fn try_acquire(&self, namespace: &str, name: &str, holder: &str, ttl_secs: i32) -> Result<bool, StoreError>;
    /// Give the lock up if `holder` owns it.
    async fn release(&self, namespace: &str, name: &str, holder: &str) -> Result<(), StoreError>;
}

/// Whether `holder` may take a lease in its current state at `now`.
pub fn lease_available(spec: Option<&LeaseSpec>, holder: &str, now: DateTime<Utc>) -> bool {
    let Some(spec) = spec else { return true };
    match spec.holder_identity.as_deref() {
        None | Some("") => true,
        Some(h) if h == holder => true,
        Some(_) => {
            let renewed = spec.renew_time.as_ref().or(spec.acquire_time.as_ref()).map(|t| t.0);
            let ttl = Duration::seconds(i64::from(spec.lease_duration_seconds.unwrap_or(15)));
            renewed.map(|r| r + ttl < now).unwrap_or(true)
        }
    }
}

pub(crate) fn held_spec(holder: &str, ttl_secs: i32, now: DateTime<Utc>, previous: Option<&LeaseSpec>) -> LeaseSpec {
    let same_holder = previous.and_then(|p| p.holder_identity.as_deref()) == Some(holder);
    LeaseSpec {
        holder_identity: Some(holder.to_string()),
        lease_duration_seconds: Some(ttl_secs),
        acquire_time: if same_holder { previous.and_then(|p| p.acquire_time.clone()) } else { Some(MicroTime(now)) },
        renew_time: Some(MicroTime(now)),
        lease_transitions: Some(
            previous.and_then(|p| p.lease_transitions).unwrap_or(0) + if same_holder || previous.is_none() { 0 } else { 1 },
        ),
        ..Default::default()
    }
}

#[derive(Clone)]
pub struct KubeLeases {
    client: Client,
}

impl KubeLeases {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SharedLock for KubeLeases {
    async fn try_acquire(&self, namespace: &str, name: &str, holder: &str, ttl_secs: i32) -> Result<bool, StoreError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        let what = format!("lease {namespace}/{name}");
        let now = Utc::now();
        match api.get_opt(name).await.map_err(|e| store_error(e, &what))? {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta { name: Some(name.to_string()), namespace: Some(namespace.to_string()), ..Default::default() },
                    spec: Some(held_spec(holder, ttl_secs, now, None)),
                };
                match api.create(&PostParams::default(), &lease).await {
                    Ok(_) => {
                        info!(lease = %what, holder, "lease acquired");
                        Ok(true)
                    }
                    // Another replica created it first.
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                    Err(e) => Err(store_error(e, &what)),
                }
            }
            Some(mut lease) => {
                if !lease_available(lease.spec.as_ref(), holder, now) {
                    debug!(lease = %what, holder = ?lease.spec.as_ref().and_then(|s| s.holder_identity.clone()), "lease held elsewhere");
                    return Ok(false);
                }
                lease.spec = Some(held_spec(holder, ttl_secs, now, lease.spec.as_ref()));
                // resourceVersion from the read makes this a compare-and-swap.
                match api.replace(name, &PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                    Err(e) => Err(store_error(e, &what)),
                }
            }
        }
    }

    async fn release(&self, namespace: &str, name: &str, holder: &str) -> Result<(), StoreError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        let what = format!("lease {namespace}/{name}");
        let Some(mut lease) = api.get_opt(name).await.map_err(|e| store_error(e, &what))? else {
            return Ok(());
        };
        let owned = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref()) == Some(holder);
        if !owned {
            return Ok(());
        }
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.renew_time = None;
        }
        match api.replace(name, &PostParams::default(), &lease).await {
            Ok(_) => {
                debug!(lease = %what, holder, "lease released");
                Ok(())
            }
            // Taken over or gone in the meantime.
            Err(kube::Error::Api(ae)) if ae.code == 409 || ae.code == 404 => Ok(()),
            Err(e) => Err(store_error(e, &what)),
        }
    }
}
