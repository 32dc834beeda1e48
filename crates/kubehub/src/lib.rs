//! Lambda kubehub – Kubernetes plumbing behind small traits, plus in-memory doubles

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Client, ResourceExt,
};
use lambda_build::{job::context_name, JobRunner};
use lambda_core::{keys, LambdaFunction, StoreError, MANAGER};
use lambda_sources::{FetchError, SecretData, SecretReader};
use serde_json::json;
use tracing::{debug, info};

pub mod lease;
pub mod mem;
pub mod serving;

pub use lease::{KubeLeases, SharedLock};
pub use serving::{KubeServing, ServiceObservation, ServingClient};

/// Map a kube error onto the store taxonomy: 404, 409, anything else is transient.
pub fn store_error(e: kube::Error, what: &str) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(what.to_string()),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => StoreError::AlreadyExists(what.to_string()),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(what.to_string()),
        other => StoreError::Unavailable(format!("{what}: {other}")),
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

/// CRUD on `LambdaFunction`. Spec and status are written through separate calls.
#[async_trait]
pub trait FunctionStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<LambdaFunction, StoreError>;
    async fn create(&self, f: &LambdaFunction) -> Result<LambdaFunction, StoreError>;
    /// Replace metadata and spec. A stale `resourceVersion` yields `Conflict`.
    async fn update(&self, f: &LambdaFunction) -> Result<LambdaFunction, StoreError>;
    /// Write only the status subresource.
    async fn update_status(&self, f: &LambdaFunction) -> Result<LambdaFunction, StoreError>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<LambdaFunction>, StoreError>;
}

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<LambdaFunction> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl FunctionStore for KubeStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<LambdaFunction, StoreError> {
        self.api(namespace).get(name).await.map_err(|e| store_error(e, &format!("{namespace}/{name}")))
    }

    async fn create(&self, f: &LambdaFunction) -> Result<LambdaFunction, StoreError> {
        let ns = f.namespace().unwrap_or_default();
        let key = f.key();
        let created = self.api(&ns).create(&PostParams::default(), f).await.map_err(|e| store_error(e, &key))?;
        debug!(function = %key, "created");
        Ok(created)
    }

    async fn update(&self, f: &LambdaFunction) -> Result<LambdaFunction, StoreError> {
        let ns = f.namespace().unwrap_or_default();
        self.api(&ns).replace(&f.name_any(), &PostParams::default(), f).await.map_err(|e| store_error(e, &f.key()))
    }

    async fn update_status(&self, f: &LambdaFunction) -> Result<LambdaFunction, StoreError> {
        let ns = f.namespace().unwrap_or_default();
        let patch = json!({ "status": f.status });
        self.api(&ns)
            .patch_status(&f.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| store_error(e, &f.key()))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| store_error(e, &format!("{namespace}/{name}")))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<LambdaFunction>, StoreError> {
        let api: Api<LambdaFunction> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let list = api.list(&ListParams::default()).await.map_err(|e| store_error(e, "lambdafunctions"))?;
        Ok(list.items)
    }
}

/// Build jobs and their context ConfigMaps through the API server.
#[derive(Clone)]
pub struct KubeJobs {
    client: Client,
}

impl KubeJobs {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobRunner for KubeJobs {
    async fn put_context(&self, config_map: &ConfigMap) -> Result<(), StoreError> {
        let ns = config_map.namespace().unwrap_or_default();
        let name = config_map.name_any();
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &ns);
        api.patch(&name, &PatchParams::apply(MANAGER).force(), &Patch::Apply(config_map))
            .await
            .map_err(|e| store_error(e, &format!("configmap {ns}/{name}")))?;
        Ok(())
    }

    async fn submit(&self, job: &Job) -> Result<(), StoreError> {
        let ns = job.namespace().unwrap_or_default();
        let api: Api<Job> = Api::namespaced(self.client.clone(), &ns);
        api.create(&PostParams::default(), job).await.map_err(|e| store_error(e, &format!("job {ns}/{}", job.name_any())))?;
        Ok(())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Job, StoreError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(|e| store_error(e, &format!("job {namespace}/{name}")))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(store_error(e, &format!("job {namespace}/{name}"))),
        }
    }

    async fn delete_for(&self, namespace: &str, function: &str) -> Result<usize, StoreError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("{}={function},{}=true", keys::NAME_LABEL, keys::BUILD_LABEL);
        let list = jobs.list(&ListParams::default().labels(&selector)).await.map_err(|e| store_error(e, "jobs"))?;
        let mut deleted = 0;
        for job in list.items {
            self.delete(namespace, &job.name_any()).await?;
            deleted += 1;
        }
        let cms: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match cms.delete(&context_name(function), &DeleteParams::default()).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(store_error(e, "build context")),
        }
        info!(ns = %namespace, function = %function, jobs = deleted, "build artefacts deleted");
        Ok(deleted)
    }
}

/// Reads Secrets for source credentials.
#[derive(Clone)]
pub struct KubeSecrets {
    client: Client,
}

impl KubeSecrets {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Flatten `data` and `stringData` into one map; `data` wins.
pub fn secret_data(secret: &Secret) -> SecretData {
    let mut values: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for (k, v) in secret.string_data.iter().flatten() {
        values.insert(k.clone(), v.as_bytes().to_vec());
    }
    for (k, v) in secret.data.iter().flatten() {
        values.insert(k.clone(), v.0.clone());
    }
    SecretData::new(secret.name_any(), values)
}

#[async_trait]
impl SecretReader for KubeSecrets {
    async fn read(&self, namespace: &str, name: &str) -> Result<SecretData, FetchError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(secret_data(&secret)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                Err(FetchError::NotFound(format!("secret '{name}' not found in namespace '{namespace}'")))
            }
            Err(kube::Error::Api(ae)) if ae.code == 403 => {
                Err(FetchError::Credentials(format!("not allowed to read secret '{name}' in namespace '{namespace}'")))
            }
            Err(e) => Err(FetchError::Remote(format!("reading secret '{name}': {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: "x".into(), reason: reason.into(), code })
    }

    #[test]
    fn kube_errors_map_onto_store_errors() {
        assert_eq!(store_error(api_err(404, "NotFound"), "fns/a"), StoreError::NotFound("fns/a".into()));
        assert_eq!(store_error(api_err(409, "AlreadyExists"), "fns/a"), StoreError::AlreadyExists("fns/a".into()));
        assert_eq!(store_error(api_err(409, "Conflict"), "fns/a"), StoreError::Conflict("fns/a".into()));
        assert!(matches!(store_error(api_err(500, "InternalError"), "fns/a"), StoreError::Unavailable(_)));
    }

    #[test]
    fn secret_data_prefers_binary_data() {
        let mut s = Secret::default();
        s.metadata.name = Some("creds".into());
        s.data = Some(BTreeMap::from([("token".to_string(), ByteString(b"from-data".to_vec()))]));
        s.string_data = Some(BTreeMap::from([
            ("token".to_string(), "from-string".to_string()),
            ("username".to_string(), "bot".to_string()),
        ]));
        let d = secret_data(&s);
        assert_eq!(d.name(), "creds");
        assert_eq!(d.lookup_any(&["token"]).as_deref(), Some("from-data"));
        assert_eq!(d.lookup_any(&["username"]).as_deref(), Some("bot"));
    }
}
