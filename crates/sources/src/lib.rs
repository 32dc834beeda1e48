//! Lambda sources: pluggable fetchers that turn a `source` block into entry-file bytes

#![forbid(unsafe_code)]

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lambda_core::{Language, LambdaError, SecretRef, SourceSpec};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

pub mod archive;
pub mod credentials;
mod git;
mod github;
pub mod guard;
mod inline;
mod objectstore;
pub mod sigv4;

pub use credentials::{AccessKeys, SecretData, SecretReader};
pub use git::GitFetcher;
pub use github::GithubFetcher;
pub use guard::{HostPolicy, SecurityError};
pub use inline::{ImageFetcher, InlineFetcher};
pub use objectstore::{GcsFetcher, MinioFetcher, S3Fetcher};

/// Why a source could not be obtained.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("security validation failed: {0}")]
    Security(#[from] SecurityError),
    #[error("credentials: {0}")]
    Credentials(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("source exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },
    #[error("io: {0}")]
    Io(String),
    #[error("remote: {0}")]
    Remote(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl FetchError {
    /// Bounded label for the fetch metric.
    pub fn result_label(&self) -> &'static str {
        match self {
            Self::Security(_) => "security_error",
            Self::Credentials(_) => "credentials_error",
            Self::NotFound(_) => "not_found",
            Self::TooLarge { .. } => "too_large",
            Self::Io(_) => "io_error",
            Self::Remote(_) => "remote_error",
            Self::Unsupported(_) => "unsupported",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Remote(_))
    }
}

impl From<FetchError> for LambdaError {
    fn from(e: FetchError) -> Self {
        if e.is_retryable() {
            LambdaError::Transient(e.to_string())
        } else {
            LambdaError::Validation(e.to_string())
        }
    }
}

/// Entry-file bytes plus what the build needs alongside them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedSource {
    pub code: Vec<u8>,
    /// Canonical entry filename for the runtime (`main.py`, `index.js`, `main.go`).
    pub filename: String,
    /// Dependency manifest found next to the entry file, or given inline.
    pub dependencies: Option<Vec<u8>>,
    /// Commit or archive revision the bytes came from, when known.
    pub revision: Option<String>,
}

/// Per-call inputs: where to read secrets from and which runtime conventions apply.
pub struct FetchContext<'a> {
    pub namespace: &'a str,
    pub language: Language,
    pub secrets: &'a dyn SecretReader,
}

impl FetchContext<'_> {
    /// Read the referenced Secret, if the source names one.
    pub async fn secret(&self, secret_ref: Option<&SecretRef>) -> Result<Option<SecretData>, FetchError> {
        match secret_ref {
            Some(r) if !r.name.is_empty() => Ok(Some(self.secrets.read(self.namespace, &r.name).await?)),
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub max_archive_bytes: u64,
    pub max_inline_bytes: usize,
    pub minio_endpoint: String,
    pub github_api: String,
    pub git_binary: String,
    pub hosts: HostPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_archive_bytes: 50 * 1024 * 1024,
            max_inline_bytes: 900 * 1024,
            minio_endpoint: "minio.minio.svc.cluster.local:9000".to_string(),
            github_api: "https://api.github.com".to_string(),
            git_binary: "git".to_string(),
            hosts: HostPolicy::default(),
        }
    }
}

impl FetchConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let secs = std::env::var("LAMBDA_FETCH_TIMEOUT_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(60u64);
        Self {
            timeout: Duration::from_secs(secs.max(1)),
            max_archive_bytes: std::env::var("LAMBDA_MAX_ARCHIVE_BYTES").ok().and_then(|s| s.parse().ok()).unwrap_or(d.max_archive_bytes),
            max_inline_bytes: std::env::var("LAMBDA_MAX_INLINE_BYTES").ok().and_then(|s| s.parse().ok()).unwrap_or(d.max_inline_bytes),
            minio_endpoint: std::env::var("LAMBDA_MINIO_ENDPOINT").ok().filter(|s| !s.is_empty()).unwrap_or(d.minio_endpoint),
            github_api: std::env::var("LAMBDA_GITHUB_API_URL").ok().filter(|s| !s.is_empty()).unwrap_or(d.github_api),
            git_binary: std::env::var("LAMBDA_GIT_BINARY").ok().filter(|s| !s.is_empty()).unwrap_or(d.git_binary),
            hosts: std::env::var("LAMBDA_ALLOWED_HOSTS").map(|s| HostPolicy::parse(&s)).unwrap_or_default(),
        }
    }
}

/// One backend. `validate` is pure and runs before any network call; `fetch` assumes it passed.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// The `source.type` this fetcher serves.
    fn kind(&self) -> &'static str;
    fn validate(&self, spec: &SourceSpec) -> Result<(), FetchError>;
    async fn fetch(&self, ctx: &FetchContext<'_>, spec: &SourceSpec) -> Result<FetchedSource, FetchError>;
}

pub(crate) fn wrong_variant(kind: &str, spec: &SourceSpec) -> FetchError {
    FetchError::Unsupported(format!("{kind} fetcher cannot handle source type '{}'", spec.type_name()))
}

/// Resolve `host` and refuse it if any address is blocked. The checked addresses are
/// returned so the caller can connect to exactly those.
pub async fn check_resolved(field: &str, host: &str, port: u16, policy: &HostPolicy) -> Result<Vec<SocketAddr>, FetchError> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    let allow_private = policy.allows_private(bare);
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((bare, port))
        .await
        .map_err(|e| FetchError::Remote(format!("resolving {bare}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(FetchError::Remote(format!("{bare} did not resolve")));
    }
    if let Some(bad) = addrs.iter().find(|a| guard::is_blocked_ip(&a.ip(), allow_private)) {
        warn!(host = %bare, addr = %bad.ip(), "fetch target resolves to a blocked address");
        return Err(SecurityError::new(field, format!("host '{bare}' resolves to blocked address {}", bad.ip()), "URL_BLOCKED_IP").into());
    }
    Ok(addrs)
}

/// HTTP client pinned to pre-checked addresses so a second lookup cannot rebind.
pub(crate) fn pinned_client(config: &FetchConfig, host: &str, addrs: &[SocketAddr]) -> Result<reqwest::Client, FetchError> {
    reqwest::Client::builder()
        .timeout(config.timeout)
        .user_agent("knative-lambda-operator")
        .redirect(reqwest::redirect::Policy::custom(|attempt| {
            // Redirect targets get the literal guard; DNS pinning only covers the first host.
            let blocked = attempt
                .url()
                .host_str()
                .map(|h| guard::check_host("redirect", h, &HostPolicy::default()).is_err())
                .unwrap_or(true);
            if blocked || attempt.previous().len() >= 5 {
                attempt.stop()
            } else {
                attempt.follow()
            }
        }))
        .resolve_to_addrs(host, addrs)
        .build()
        .map_err(|e| FetchError::Remote(format!("building http client: {e}")))
}

/// Read a response body, refusing to buffer more than `limit` bytes.
pub(crate) async fn read_limited(mut resp: reqwest::Response, limit: u64) -> Result<Vec<u8>, FetchError> {
    if resp.content_length().map(|n| n > limit).unwrap_or(false) {
        return Err(FetchError::TooLarge { limit });
    }
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await.map_err(|e| FetchError::Remote(format!("reading body: {e}")))? {
        if body.len() as u64 + chunk.len() as u64 > limit {
            return Err(FetchError::TooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

pub(crate) fn ip_literal(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

/// Every backend, dispatched on `source.type`.
pub struct Fetchers {
    config: Arc<FetchConfig>,
    backends: Vec<Box<dyn SourceFetcher>>,
}

impl Fetchers {
    pub fn new(config: FetchConfig) -> Self {
        let config = Arc::new(config);
        let backends: Vec<Box<dyn SourceFetcher>> = vec![
            Box::new(GitFetcher::new(config.clone())),
            Box::new(S3Fetcher::new(config.clone())),
            Box::new(MinioFetcher::new(config.clone())),
            Box::new(GcsFetcher::new(config.clone())),
            Box::new(GithubFetcher::new(config.clone())),
            Box::new(InlineFetcher::new(config.clone())),
            Box::new(ImageFetcher),
        ];
        Self { config, backends }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn get(&self, kind: &str) -> Option<&dyn SourceFetcher> {
        self.backends.iter().find(|b| b.kind() == kind).map(|b| b.as_ref())
    }

    fn backend(&self, spec: &SourceSpec) -> Result<&dyn SourceFetcher, FetchError> {
        self.get(spec.type_name())
            .ok_or_else(|| FetchError::Unsupported(format!("no fetcher for source type '{}'", spec.type_name())))
    }

    pub fn validate(&self, spec: &SourceSpec) -> Result<(), FetchError> {
        self.backend(spec)?.validate(spec)
    }

    /// Validate, then fetch. Records `source_fetch_total{source,result}`.
    pub async fn fetch(&self, ctx: &FetchContext<'_>, spec: &SourceSpec) -> Result<FetchedSource, FetchError> {
        let kind = spec.type_name();
        let started = Instant::now();
        let res = match self.backend(spec) {
            Ok(backend) => match backend.validate(spec) {
                Ok(()) => backend.fetch(ctx, spec).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        let result = match &res {
            Ok(_) => "success",
            Err(e) => e.result_label(),
        };
        counter!("knative_lambda_operator_source_fetch_total", 1u64, "source" => kind, "result" => result);
        histogram!("knative_lambda_operator_source_fetch_seconds", started.elapsed().as_secs_f64(), "source" => kind);
        match &res {
            Ok(src) => info!(source = kind, ns = %ctx.namespace, bytes = src.code.len(), revision = ?src.revision, "source fetched"),
            Err(e) => warn!(source = kind, ns = %ctx.namespace, result, error = %e, "source fetch failed"),
        }
        debug!(source = kind, took_ms = %started.elapsed().as_millis(), "fetch finished");
        res
    }
}
