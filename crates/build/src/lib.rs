//! Lambda build: build context rendering and Kaniko job orchestration

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use lambda_core::{BuildStatusInfo, Language, LambdaError, LambdaFunction, SourceSpec, StoreError};
use lambda_sources::{guard, FetchContext, FetchedSource, Fetchers, SecretReader};
use metrics::counter;
use tracing::{debug, info, warn};

pub mod job;
pub mod render;

pub use job::{sanitize_error, ImageTarget};
pub use render::RenderInput;

/// ConfigMaps are capped at 1MiB including metadata.
pub const MAX_CONTEXT_BYTES: usize = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeResources {
    pub cpu: String,
    pub memory: String,
}

impl ComputeResources {
    fn new(cpu: &str, memory: &str) -> Self {
        Self { cpu: cpu.to_string(), memory: memory.to_string() }
    }
}

#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Registry Kaniko pushes to, usually an in-cluster service name.
    pub push_registry: String,
    /// The same registry as kubelet reaches it.
    pub pull_registry: String,
    pub kaniko_image: String,
    pub init_image: String,
    pub python_base_image: String,
    pub node_base_image: String,
    pub go_base_image: String,
    pub runtime_image: String,
    pub service_account: String,
    pub ttl_secs: i32,
    pub deadline_secs: i64,
    pub function_timeout_secs: i64,
    pub insecure_registry: bool,
    pub kaniko_requests: ComputeResources,
    pub kaniko_limits: ComputeResources,
    pub init_requests: ComputeResources,
    pub init_limits: ComputeResources,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            push_registry: "localhost:5001".to_string(),
            pull_registry: "localhost:5001".to_string(),
            kaniko_image: "gcr.io/kaniko-project/executor:v1.19.2".to_string(),
            init_image: "alpine:3.19".to_string(),
            python_base_image: "python".to_string(),
            node_base_image: "node".to_string(),
            go_base_image: "golang".to_string(),
            runtime_image: "alpine:3.19".to_string(),
            service_account: "lambda-builder".to_string(),
            ttl_secs: 300,
            deadline_secs: 1800,
            function_timeout_secs: 300,
            insecure_registry: false,
            kaniko_requests: ComputeResources::new("500m", "1Gi"),
            kaniko_limits: ComputeResources::new("2", "4Gi"),
            init_requests: ComputeResources::new("100m", "128Mi"),
            init_limits: ComputeResources::new("500m", "256Mi"),
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

impl BuildConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let push = env_str("LAMBDA_PUSH_REGISTRY", &d.push_registry);
        // The pull side defaults to the push side when only one is set.
        let pull = env_str("LAMBDA_PULL_REGISTRY", &push);
        Self {
            kaniko_image: env_str("LAMBDA_KANIKO_IMAGE", &d.kaniko_image),
            init_image: env_str("LAMBDA_INIT_IMAGE", &d.init_image),
            python_base_image: env_str("LAMBDA_PYTHON_BASE_IMAGE", &d.python_base_image),
            node_base_image: env_str("LAMBDA_NODE_BASE_IMAGE", &d.node_base_image),
            go_base_image: env_str("LAMBDA_GO_BASE_IMAGE", &d.go_base_image),
            runtime_image: env_str("LAMBDA_RUNTIME_IMAGE", &d.runtime_image),
            service_account: env_str("LAMBDA_BUILD_SERVICE_ACCOUNT", &d.service_account),
            ttl_secs: env_parse("LAMBDA_BUILD_TTL_SECS", d.ttl_secs),
            deadline_secs: env_parse("LAMBDA_BUILD_DEADLINE_SECS", d.deadline_secs).max(60),
            function_timeout_secs: env_parse("LAMBDA_FUNCTION_TIMEOUT_SECS", d.function_timeout_secs),
            insecure_registry: env_parse("LAMBDA_BUILD_INSECURE_REGISTRY", d.insecure_registry),
            kaniko_requests: ComputeResources {
                cpu: env_str("LAMBDA_BUILD_CPU_REQUEST", &d.kaniko_requests.cpu),
                memory: env_str("LAMBDA_BUILD_MEMORY_REQUEST", &d.kaniko_requests.memory),
            },
            kaniko_limits: ComputeResources {
                cpu: env_str("LAMBDA_BUILD_CPU_LIMIT", &d.kaniko_limits.cpu),
                memory: env_str("LAMBDA_BUILD_MEMORY_LIMIT", &d.kaniko_limits.memory),
            },
            push_registry: push,
            pull_registry: pull,
            ..d
        }
    }

    pub fn base_image(&self, language: Language) -> &str {
        match language {
            Language::Python => &self.python_base_image,
            Language::Node => &self.node_base_image,
            Language::Go => &self.go_base_image,
        }
    }
}

/// Files handed to Kaniko for one build attempt, keyed by their name in `/workspace`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    pub files: BTreeMap<String, Vec<u8>>,
    pub content_hash: String,
    pub revision: Option<String>,
}

impl BuildContext {
    /// Render the Dockerfile and wrapper around fetched source and hash the lot.
    pub fn assemble(input: &RenderInput<'_>, fetched: FetchedSource) -> Result<Self, LambdaError> {
        let language = input.language;
        let dockerfile = render::dockerfile(input)?;
        let wrapper = render::wrapper(input)?;
        let deps = fetched
            .dependencies
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| render::default_dependencies(language, input.version).into_bytes());

        let mut parts: Vec<&[u8]> = vec![fetched.code.as_slice(), dockerfile.as_bytes()];
        if let Some((_, body)) = &wrapper {
            parts.push(body.as_bytes());
        }
        parts.push(deps.as_slice());
        let content_hash = render::content_hash(parts);

        let mut files = BTreeMap::new();
        files.insert(language.source_filename().to_string(), fetched.code);
        files.insert("Dockerfile".to_string(), dockerfile.into_bytes());
        if let Some((name, body)) = wrapper {
            files.insert(name.to_string(), body.into_bytes());
        }
        files.insert(language.dependency_filename().to_string(), deps);

        let total: usize = files.iter().map(|(k, v)| k.len() + v.len()).sum();
        if total > MAX_CONTEXT_BYTES {
            return Err(LambdaError::Validation(format!(
                "build context is {total} bytes; the limit is {MAX_CONTEXT_BYTES}"
            )));
        }
        Ok(Self { files, content_hash, revision: fetched.revision })
    }

    /// First 12 hex characters of the content hash.
    pub fn tag(&self) -> &str {
        &self.content_hash[..12.min(self.content_hash.len())]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Running,
    Succeeded,
    /// Sanitised failure summary.
    Failed(String),
}

/// Build job submission. The kube implementation lives in `lambda-kubehub`.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Create or replace the build-context ConfigMap.
    async fn put_context(&self, config_map: &ConfigMap) -> Result<(), StoreError>;
    async fn submit(&self, job: &Job) -> Result<(), StoreError>;
    async fn get(&self, namespace: &str, name: &str) -> Result<Job, StoreError>;
    /// Idempotent: a missing job is not an error.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
    /// Remove every build job and the context ConfigMap of one function. Returns jobs deleted.
    async fn delete_for(&self, namespace: &str, function: &str) -> Result<usize, StoreError>;
}

/// A build that was started, or the image an identical earlier build produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildPlan {
    Reuse { image_uri: String, content_hash: String },
    Submitted { job_name: String, image_uri: String, content_hash: String, revision: Option<String> },
}

/// Image reference for `source.type = image`; no build involved.
pub fn prebuilt_image(f: &LambdaFunction) -> Option<String> {
    match &f.spec.source {
        SourceSpec::Image { image } => Some(image.reference()),
        _ => None,
    }
}

pub struct BuildManager {
    config: BuildConfig,
    fetchers: Arc<Fetchers>,
    jobs: Arc<dyn JobRunner>,
    secrets: Arc<dyn SecretReader>,
}

impl BuildManager {
    pub fn new(config: BuildConfig, fetchers: Arc<Fetchers>, jobs: Arc<dyn JobRunner>, secrets: Arc<dyn SecretReader>) -> Self {
        Self { config, fetchers, jobs, secrets }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Checks that need no network: runtime, version, handler, then the source backend's own validation.
    pub fn validate(&self, f: &LambdaFunction) -> Result<Language, LambdaError> {
        let language = f
            .language()
            .ok_or_else(|| LambdaError::Validation(format!("unsupported runtime language '{}'", f.spec.runtime.language)))?;
        render::validate_version(&f.spec.runtime.version)?;
        if let Some(h) = f.spec.runtime.handler.as_deref() {
            guard::validate_handler(h).map_err(|e| LambdaError::Validation(e.to_string()))?;
        }
        let invalid = |e: guard::SecurityError| LambdaError::Validation(e.to_string());
        // both are rendered into the Dockerfile and job metadata
        guard::validate_dns_label("metadata.name", &f.name_any()).map_err(invalid)?;
        guard::validate_dns_label("metadata.namespace", &f.namespace().unwrap_or_default()).map_err(invalid)?;
        if let Some(build) = &f.spec.build {
            if let Some(registry) = build.registry.as_deref().filter(|r| !r.is_empty()) {
                guard::validate_registry("build.registry", registry, &self.fetchers.config().hosts).map_err(invalid)?;
            }
            if let Some(repository) = build.repository.as_deref().filter(|r| !r.is_empty()) {
                guard::validate_image_repository("build.repository", repository).map_err(invalid)?;
            }
            if let Some(tag) = build.tag.as_deref().filter(|t| !t.is_empty()) {
                guard::validate_image_tag("build.tag", tag).map_err(invalid)?;
            }
        }
        self.fetchers.validate(&f.spec.source)?;
        Ok(language)
    }

    /// Fetch the source and render the build context.
    pub async fn prepare(&self, f: &LambdaFunction) -> Result<BuildContext, LambdaError> {
        let language = self.validate(f)?;
        let ns = f.namespace().unwrap_or_default();
        let name = f.name_any();
        let ctx = FetchContext { namespace: &ns, language, secrets: self.secrets.as_ref() };
        let fetched = self.fetchers.fetch(&ctx, &f.spec.source).await?;
        let input = RenderInput {
            function_name: &name,
            namespace: &ns,
            language,
            version: &f.spec.runtime.version,
            handler: f.spec.runtime.handler.as_deref(),
            timeout_secs: self.config.function_timeout_secs,
            base_image: self.config.base_image(language),
            runtime_image: &self.config.runtime_image,
        };
        let ctx = BuildContext::assemble(&input, fetched)?;
        debug!(function = %f.key(), hash = %ctx.content_hash, files = ctx.files.len(), "build context assembled");
        Ok(ctx)
    }

    /// Prepare and submit, unless `previous` already built the same content and `force` is off.
    pub async fn start(&self, f: &LambdaFunction, previous: Option<&BuildStatusInfo>, force: bool) -> Result<BuildPlan, LambdaError> {
        let ctx = self.prepare(f).await?;
        if !force {
            if let Some(image_uri) = reusable(previous, &ctx.content_hash) {
                info!(function = %f.key(), hash = %ctx.content_hash, image = %image_uri, "content unchanged, reusing image");
                return Ok(BuildPlan::Reuse { image_uri, content_hash: ctx.content_hash });
            }
        }
        let ns = f.namespace().unwrap_or_default();
        let target = ImageTarget::for_function(f, ctx.tag(), &self.config);
        let job_name = job::job_name(&f.name_any(), chrono::Utc::now().timestamp());

        self.jobs.put_context(&job::context_config_map(f, &ctx)).await?;
        let job = job::kaniko_job(f, &ctx, &job_name, &target, &self.config);
        self.jobs.submit(&job).await?;

        let runtime = f.language().map(|l| l.as_str()).unwrap_or("unknown");
        counter!("knative_lambda_operator_build_jobs_total", 1u64, "runtime" => runtime);
        info!(function = %f.key(), ns = %ns, job = %job_name, image = %target.push, force, "build job submitted");
        Ok(BuildPlan::Submitted { job_name, image_uri: target.pull, content_hash: ctx.content_hash, revision: ctx.revision })
    }

    pub async fn poll(&self, namespace: &str, job_name: &str) -> Result<JobState, LambdaError> {
        let job = self.jobs.get(namespace, job_name).await?;
        Ok(job::job_state(&job))
    }

    pub async fn cancel(&self, namespace: &str, job_name: &str) -> Result<(), LambdaError> {
        self.jobs.delete(namespace, job_name).await?;
        info!(ns = %namespace, job = %job_name, "build job deleted");
        Ok(())
    }

    /// Delete every build artefact of a function.
    pub async fn cleanup(&self, f: &LambdaFunction) -> Result<(), LambdaError> {
        let ns = f.namespace().unwrap_or_default();
        match self.jobs.delete_for(&ns, &f.name_any()).await {
            Ok(n) => {
                debug!(function = %f.key(), jobs = n, "build artefacts removed");
                Ok(())
            }
            Err(e) => {
                warn!(function = %f.key(), error = %e, "build cleanup failed");
                Err(e.into())
            }
        }
    }
}

fn reusable(previous: Option<&BuildStatusInfo>, hash: &str) -> Option<String> {
    let prev = previous?;
    let succeeded = prev.completed_at.is_some() && prev.error.is_none();
    if succeeded && prev.content_hash.as_deref() == Some(hash) {
        prev.image_uri.clone()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(language: Language) -> RenderInput<'static> {
        RenderInput {
            function_name: "hello",
            namespace: "fns",
            language,
            version: "",
            handler: None,
            timeout_secs: 300,
            base_image: "python",
            runtime_image: "alpine:3.19",
        }
    }

    fn fetched(code: &str) -> FetchedSource {
        FetchedSource { code: code.as_bytes().to_vec(), filename: "main.py".into(), dependencies: None, revision: None }
    }

    #[test]
    fn context_holds_every_file_and_a_stable_hash() {
        let a = BuildContext::assemble(&input(Language::Python), fetched("def handler(e): return e")).unwrap_or_else(|e| panic!("{e}"));
        let names: Vec<&str> = a.files.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["Dockerfile", "main.py", "requirements.txt", "runtime.py"]);
        assert_eq!(a.tag().len(), 12);
        let b = BuildContext::assemble(&input(Language::Python), fetched("def handler(e): return e")).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(a.content_hash, b.content_hash);
        let c = BuildContext::assemble(&input(Language::Python), fetched("def handler(e): return 1")).unwrap_or_else(|e| panic!("{e}"));
        assert_ne!(a.content_hash, c.content_hash);
    }

    #[test]
    fn dependency_changes_move_the_hash() {
        let mut with_deps = fetched("def handler(e): return e");
        with_deps.dependencies = Some(b"requests==2.31.0\n".to_vec());
        let a = BuildContext::assemble(&input(Language::Python), with_deps).unwrap_or_else(|e| panic!("{e}"));
        let b = BuildContext::assemble(&input(Language::Python), fetched("def handler(e): return e")).unwrap_or_else(|e| panic!("{e}"));
        assert_ne!(a.content_hash, b.content_hash);
        assert_eq!(a.files.get("requirements.txt").map(Vec::as_slice), Some(b"requests==2.31.0\n".as_slice()));
    }

    #[test]
    fn oversized_context_is_rejected() {
        let big = "x".repeat(MAX_CONTEXT_BYTES);
        assert!(matches!(BuildContext::assemble(&input(Language::Python), fetched(&big)), Err(LambdaError::Validation(_))));
    }

    #[test]
    fn reuse_needs_a_finished_clean_build_with_the_same_hash() {
        let done = BuildStatusInfo {
            image_uri: Some("localhost:5001/fns/hello:abc".into()),
            content_hash: Some("h1".into()),
            completed_at: Some("2024-01-01T00:00:00Z".into()),
            ..Default::default()
        };
        assert_eq!(reusable(Some(&done), "h1").as_deref(), Some("localhost:5001/fns/hello:abc"));
        assert_eq!(reusable(Some(&done), "h2"), None);
        let failed = BuildStatusInfo { error: Some("boom".into()), ..done.clone() };
        assert_eq!(reusable(Some(&failed), "h1"), None);
        assert_eq!(reusable(None, "h1"), None);
    }
}
