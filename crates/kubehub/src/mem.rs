//! In-memory stand-ins for the cluster, used by tests and offline runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::coordination::v1::LeaseSpec;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use lambda_build::{job::context_name, JobRunner};
use lambda_core::{keys, LambdaFunction, StoreError};
use lambda_sources::{FetchError, SecretData, SecretReader};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::lease::{held_spec, lease_available};
use crate::{FunctionStore, ServiceObservation, ServingClient, SharedLock};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    m.lock().map_err(|_| StoreError::Unavailable("in-memory state poisoned".into()))
}

fn next_version(current: Option<&str>) -> String {
    let n: u64 = current.and_then(|v| v.parse().ok()).unwrap_or(0);
    (n + 1).to_string()
}

/// `LambdaFunction` objects with API-server-like bookkeeping: uid, resourceVersion
/// compare-and-swap, generation bumps on spec change and finalizer-gated deletion.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<FxHashMap<Key, LambdaFunction>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FunctionStore for MemoryStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<LambdaFunction, StoreError> {
        lock(&self.objects)?.get(&key(namespace, name)).cloned().ok_or_else(|| StoreError::NotFound(format!("{namespace}/{name}")))
    }

    async fn create(&self, f: &LambdaFunction) -> Result<LambdaFunction, StoreError> {
        let k = key(&f.namespace().unwrap_or_default(), &f.name_any());
        let mut objects = lock(&self.objects)?;
        if objects.contains_key(&k) {
            return Err(StoreError::AlreadyExists(f.key()));
        }
        let mut stored = f.clone();
        stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        stored.metadata.resource_version = Some("1".into());
        stored.metadata.generation = Some(1);
        stored.metadata.creation_timestamp = Some(Time(Utc::now()));
        objects.insert(k, stored.clone());
        Ok(stored)
    }

    async fn update(&self, f: &LambdaFunction) -> Result<LambdaFunction, StoreError> {
        let k = key(&f.namespace().unwrap_or_default(), &f.name_any());
        let mut objects = lock(&self.objects)?;
        let current = objects.get(&k).ok_or_else(|| StoreError::NotFound(f.key()))?;
        if f.metadata.resource_version.is_some() && f.metadata.resource_version != current.metadata.resource_version {
            return Err(StoreError::Conflict(f.key()));
        }
        let mut next = f.clone();
        next.status = current.status.clone();
        next.metadata.uid = current.metadata.uid.clone();
        next.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        next.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
        next.metadata.generation = Some(current.generation() + i64::from(current.spec != f.spec));
        next.metadata.resource_version = Some(next_version(current.metadata.resource_version.as_deref()));
        if next.metadata.deletion_timestamp.is_some() && next.finalizers().is_empty() {
            objects.remove(&k);
            return Ok(next);
        }
        objects.insert(k, next.clone());
        Ok(next)
    }

    async fn update_status(&self, f: &LambdaFunction) -> Result<LambdaFunction, StoreError> {
        let k = key(&f.namespace().unwrap_or_default(), &f.name_any());
        let mut objects = lock(&self.objects)?;
        let current = objects.get_mut(&k).ok_or_else(|| StoreError::NotFound(f.key()))?;
        current.status = f.status.clone();
        current.metadata.resource_version = Some(next_version(current.metadata.resource_version.as_deref()));
        Ok(current.clone())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let k = key(namespace, name);
        let mut objects = lock(&self.objects)?;
        let current = objects.get_mut(&k).ok_or_else(|| StoreError::NotFound(format!("{namespace}/{name}")))?;
        if current.finalizers().is_empty() {
            objects.remove(&k);
        } else if current.metadata.deletion_timestamp.is_none() {
            current.metadata.deletion_timestamp = Some(Time(Utc::now()));
            current.metadata.resource_version = Some(next_version(current.metadata.resource_version.as_deref()));
        }
        Ok(())
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<LambdaFunction>, StoreError> {
        let objects = lock(&self.objects)?;
        let mut out: Vec<LambdaFunction> =
            objects.iter().filter(|((ns, _), _)| namespace.map(|n| n == ns).unwrap_or(true)).map(|(_, f)| f.clone()).collect();
        out.sort_by_key(|f| f.key());
        Ok(out)
    }
}

/// Build jobs that only change state when a test says so.
#[derive(Default)]
pub struct MemoryJobs {
    jobs: Mutex<FxHashMap<Key, Job>>,
    contexts: Mutex<FxHashMap<Key, ConfigMap>>,
}

impl MemoryJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a job finished: `Ok` completes it, `Err` fails it with that message.
    pub fn finish(&self, namespace: &str, name: &str, outcome: Result<(), String>) -> Result<(), StoreError> {
        let mut jobs = lock(&self.jobs)?;
        let job = jobs.get_mut(&key(namespace, name)).ok_or_else(|| StoreError::NotFound(format!("job {namespace}/{name}")))?;
        let (type_, message, succeeded, failed) = match outcome {
            Ok(()) => ("Complete", None, Some(1), None),
            Err(msg) => ("Failed", Some(msg), None, Some(1)),
        };
        job.status = Some(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: type_.to_string(),
                status: "True".to_string(),
                message,
                ..Default::default()
            }]),
            succeeded,
            failed,
            ..Default::default()
        });
        Ok(())
    }

    pub fn jobs(&self, namespace: &str) -> Vec<Job> {
        let jobs = self.jobs.lock().map(|j| j.values().cloned().collect::<Vec<_>>()).unwrap_or_default();
        let mut out: Vec<Job> = jobs.into_iter().filter(|j| j.namespace().as_deref() == Some(namespace)).collect();
        out.sort_by_key(|j| j.name_any());
        out
    }

    pub fn context(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.contexts.lock().ok().and_then(|c| c.get(&key(namespace, name)).cloned())
    }
}

#[async_trait]
impl JobRunner for MemoryJobs {
    async fn put_context(&self, config_map: &ConfigMap) -> Result<(), StoreError> {
        let k = key(&config_map.namespace().unwrap_or_default(), &config_map.name_any());
        lock(&self.contexts)?.insert(k, config_map.clone());
        Ok(())
    }

    async fn submit(&self, job: &Job) -> Result<(), StoreError> {
        let k = key(&job.namespace().unwrap_or_default(), &job.name_any());
        let mut jobs = lock(&self.jobs)?;
        if jobs.contains_key(&k) {
            return Err(StoreError::AlreadyExists(format!("job {}/{}", k.0, k.1)));
        }
        jobs.insert(k, job.clone());
        Ok(())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Job, StoreError> {
        lock(&self.jobs)?.get(&key(namespace, name)).cloned().ok_or_else(|| StoreError::NotFound(format!("job {namespace}/{name}")))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        lock(&self.jobs)?.remove(&key(namespace, name));
        Ok(())
    }

    async fn delete_for(&self, namespace: &str, function: &str) -> Result<usize, StoreError> {
        let mut jobs = lock(&self.jobs)?;
        let before = jobs.len();
        jobs.retain(|(ns, _), j| {
            let labels = j.labels();
            !(ns == namespace
                && labels.get(keys::NAME_LABEL).map(String::as_str) == Some(function)
                && labels.get(keys::BUILD_LABEL).map(String::as_str) == Some("true"))
        });
        let deleted = before - jobs.len();
        lock(&self.contexts)?.remove(&key(namespace, &context_name(function)));
        Ok(deleted)
    }
}

/// Secrets keyed by namespace and name.
#[derive(Default)]
pub struct MemorySecrets {
    secrets: Mutex<FxHashMap<Key, BTreeMap<String, Vec<u8>>>>,
}

impl MemorySecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, namespace: &str, name: &str, values: &[(&str, &str)]) {
        let values = values.iter().map(|(k, v)| (k.to_string(), v.as_bytes().to_vec())).collect();
        if let Ok(mut s) = self.secrets.lock() {
            s.insert(key(namespace, name), values);
        }
    }
}

#[async_trait]
impl SecretReader for MemorySecrets {
    async fn read(&self, namespace: &str, name: &str) -> Result<SecretData, FetchError> {
        let secrets = self.secrets.lock().map_err(|_| FetchError::Remote("in-memory state poisoned".into()))?;
        secrets
            .get(&key(namespace, name))
            .map(|values| SecretData::new(name, values.clone()))
            .ok_or_else(|| FetchError::NotFound(format!("secret '{name}' not found in namespace '{namespace}'")))
    }
}

/// Leases with the same takeover rules as the cluster implementation.
#[derive(Default)]
pub struct MemoryLeases {
    leases: Mutex<FxHashMap<Key, LeaseSpec>>,
}

impl MemoryLeases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self, namespace: &str, name: &str) -> Option<String> {
        self.leases.lock().ok().and_then(|l| l.get(&key(namespace, name)).and_then(|s| s.holder_identity.clone()))
    }
}

#[async_trait]
impl SharedLock for MemoryLeases {
    async fn try_acquire(&self, namespace: &str, name: &str, holder: &str, ttl_secs: i32) -> Result<bool, StoreError> {
        let mut leases = lock(&self.leases)?;
        let k = key(namespace, name);
        let now = Utc::now();
        let previous = leases.get(&k);
        if !lease_available(previous, holder, now) {
            return Ok(false);
        }
        let next = held_spec(holder, ttl_secs, now, previous);
        leases.insert(k, next);
        Ok(true)
    }

    async fn release(&self, namespace: &str, name: &str, holder: &str) -> Result<(), StoreError> {
        let mut leases = lock(&self.leases)?;
        if let Some(spec) = leases.get_mut(&key(namespace, name)) {
            if spec.holder_identity.as_deref() == Some(holder) {
                spec.holder_identity = None;
                spec.renew_time = None;
            }
        }
        Ok(())
    }
}

/// Services become ready as soon as they are applied unless told otherwise.
/// Every apply mints a new revision.
pub struct MemoryServing {
    services: Mutex<FxHashMap<Key, (Value, u32)>>,
    brokers: Mutex<FxHashSet<Key>>,
    ready: AtomicBool,
}

impl Default for MemoryServing {
    fn default() -> Self {
        Self { services: Mutex::default(), brokers: Mutex::default(), ready: AtomicBool::new(true) }
    }
}

impl MemoryServing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Value> {
        self.services.lock().ok().and_then(|s| s.get(&key(namespace, name)).map(|(m, _)| m.clone()))
    }

    pub fn broker_count(&self, namespace: &str) -> usize {
        self.brokers.lock().map(|b| b.iter().filter(|(ns, _)| ns == namespace).count()).unwrap_or(0)
    }

    fn observe(&self, namespace: &str, name: &str, revision: u32) -> ServiceObservation {
        let ready = self.ready.load(Ordering::SeqCst);
        ServiceObservation {
            url: ready.then(|| format!("http://{name}.{namespace}.svc.cluster.local")),
            ready,
            latest_revision: ready.then(|| format!("{name}-{revision:05}")),
        }
    }
}

#[async_trait]
impl ServingClient for MemoryServing {
    async fn apply_service(&self, namespace: &str, name: &str, manifest: &Value) -> Result<ServiceObservation, StoreError> {
        let mut services = lock(&self.services)?;
        let entry = services.entry(key(namespace, name)).or_insert_with(|| (Value::Null, 0));
        if entry.0 != *manifest {
            *entry = (manifest.clone(), entry.1 + 1);
        }
        let revision = entry.1;
        drop(services);
        Ok(self.observe(namespace, name, revision))
    }

    async fn observe_service(&self, namespace: &str, name: &str) -> Result<Option<ServiceObservation>, StoreError> {
        let services = lock(&self.services)?;
        Ok(services.get(&key(namespace, name)).map(|(_, rev)| self.observe(namespace, name, *rev)))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        lock(&self.services)?.remove(&key(namespace, name));
        Ok(())
    }

    async fn ensure_broker(&self, namespace: &str, name: &str) -> Result<bool, StoreError> {
        Ok(lock(&self.brokers)?.insert(key(namespace, name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn function(name: &str) -> LambdaFunction {
        serde_json::from_value(json!({
            "apiVersion": "lambda.knative.io/v1alpha1",
            "kind": "LambdaFunction",
            "metadata": {"name": name, "namespace": "fns"},
            "spec": {
                "source": {"type": "inline", "inline": {"code": "def handler(e):\n    return e\n"}},
                "runtime": {"language": "python", "version": "3.11"}
            }
        }))
        .unwrap_or_else(|e| panic!("{e}"))
    }

    #[tokio::test]
    async fn create_is_exclusive_and_updates_bump_generation_on_spec_change() {
        let store = MemoryStore::new();
        let created = store.create(&function("f1")).await.unwrap_or_else(|e| panic!("{e}"));
        assert!(created.metadata.uid.is_some());
        assert!(matches!(store.create(&function("f1")).await, Err(StoreError::AlreadyExists(_))));

        let mut meta_only = created.clone();
        meta_only.annotations_mut().insert("a".into(), "b".into());
        let same_gen = store.update(&meta_only).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(same_gen.generation(), 1);

        let mut changed = same_gen.clone();
        changed.spec.runtime.version = "3.12".into();
        let bumped = store.update(&changed).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(bumped.generation(), 2);

        // Writing from a stale read is refused.
        assert!(matches!(store.update(&changed).await, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn finalizers_hold_deletion_until_cleared() {
        let store = MemoryStore::new();
        let mut f = function("f1");
        f.finalizers_mut().push("x/finalizer".into());
        store.create(&f).await.unwrap_or_else(|e| panic!("{e}"));
        store.delete("fns", "f1").await.unwrap_or_else(|e| panic!("{e}"));
        let mut pending = store.get("fns", "f1").await.unwrap_or_else(|e| panic!("{e}"));
        assert!(pending.metadata.deletion_timestamp.is_some());
        pending.finalizers_mut().clear();
        store.update(&pending).await.unwrap_or_else(|e| panic!("{e}"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn second_holder_waits_for_release() {
        let leases = MemoryLeases::new();
        assert!(leases.try_acquire("fns", "lock", "a", 15).await.unwrap_or(false));
        assert!(!leases.try_acquire("fns", "lock", "b", 15).await.unwrap_or(true));
        leases.release("fns", "lock", "a").await.unwrap_or_else(|e| panic!("{e}"));
        assert!(leases.try_acquire("fns", "lock", "b", 15).await.unwrap_or(false));
        assert_eq!(leases.holder("fns", "lock").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn broker_is_created_once() {
        let serving = MemoryServing::new();
        assert!(serving.ensure_broker("fns", "lambda-broker").await.unwrap_or(false));
        assert!(!serving.ensure_broker("fns", "lambda-broker").await.unwrap_or(true));
        assert_eq!(serving.broker_count("fns"), 1);
    }

    #[tokio::test]
    async fn only_changed_manifests_mint_revisions() {
        let serving = MemoryServing::new();
        let m1 = json!({"spec": {"template": {"spec": {"containers": [{"image": "a"}]}}}});
        let m2 = json!({"spec": {"template": {"spec": {"containers": [{"image": "b"}]}}}});
        let first = serving.apply_service("fns", "f1", &m1).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(first.latest_revision.as_deref(), Some("f1-00001"));
        let again = serving.apply_service("fns", "f1", &m1).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(again.latest_revision.as_deref(), Some("f1-00001"));
        let changed = serving.apply_service("fns", "f1", &m2).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(changed.latest_revision.as_deref(), Some("f1-00002"));
    }
}
