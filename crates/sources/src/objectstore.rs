//! S3, MinIO and GCS (XML API) fetchers over plain HTTP GETs.
//!
//! A key ending in `/` is treated as a prefix: objects are listed and the entry
//! file is chosen with the same rules as archive extraction.

use std::sync::Arc;

use async_trait::async_trait;
use lambda_core::{GcsSource, Language, MinioSource, S3Source, SourceSpec};
use reqwest::StatusCode;
use tracing::{debug, info};
use url::Url;

use crate::archive;
use crate::credentials::{key_names, AccessKeys, SecretData};
use crate::guard;
use crate::sigv4::{self, Signer};
use crate::{check_resolved, pinned_client, read_limited, wrong_variant, FetchConfig, FetchContext, FetchError, FetchedSource, SourceFetcher};

const MAX_LIST_PAGES: usize = 10;

enum Auth {
    Anonymous,
    SigV4 { keys: AccessKeys, region: String },
    Bearer(String),
}

/// One bucket on one S3-compatible endpoint.
struct Bucket {
    scheme: &'static str,
    host: String,
    port: Option<u16>,
    /// `/{bucket}/{key}` rather than `{bucket}.{host}/{key}`.
    path_style: bool,
    bucket: String,
    auth: Auth,
    project: Option<String>,
    origin: String,
}

impl Bucket {
    fn authority(&self) -> String {
        match self.port {
            Some(p) if !(self.scheme == "https" && p == 443) && !(self.scheme == "http" && p == 80) => format!("{}:{p}", self.host),
            _ => self.host.clone(),
        }
    }

    fn connect_port(&self) -> u16 {
        self.port.unwrap_or(if self.scheme == "https" { 443 } else { 80 })
    }

    fn path(&self, key: &str) -> String {
        let key = sigv4::uri_encode(key, false);
        if self.path_style {
            format!("/{}/{key}", self.bucket)
        } else {
            format!("/{key}")
        }
    }

    async fn client(&self, config: &FetchConfig) -> Result<reqwest::Client, FetchError> {
        let addrs = check_resolved("endpoint", &self.host, self.connect_port(), &config.hosts).await?;
        pinned_client(config, &self.host, &addrs)
    }

    async fn send(&self, client: &reqwest::Client, path: &str, query: &[(String, String)]) -> Result<reqwest::Response, FetchError> {
        let authority = self.authority();
        let mut raw = format!("{}://{authority}{path}", self.scheme);
        if !query.is_empty() {
            raw.push('?');
            raw.push_str(&sigv4::canonical_query(query));
        }
        let url = Url::parse(&raw).map_err(|e| FetchError::Remote(format!("building object url: {e}")))?;
        let mut req = client.get(url);
        match &self.auth {
            Auth::Anonymous => {}
            Auth::SigV4 { keys, region } => {
                let signer = Signer { keys, region: region.as_str(), service: "s3" };
                for (name, value) in signer.sign_get(&authority, path, query, chrono::Utc::now()) {
                    req = req.header(name, value);
                }
            }
            Auth::Bearer(token) => req = req.bearer_auth(token),
        }
        if let Some(project) = &self.project {
            req = req.header("x-goog-project-id", project);
        }
        let resp = req.send().await.map_err(|e| FetchError::Remote(format!("{}: {e}", self.origin)))?;
        match resp.status() {
            s if s.is_success() => Ok(resp),
            StatusCode::NOT_FOUND => Err(FetchError::NotFound(format!("{}{} not found", self.origin, path_tail(path)))),
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                Err(FetchError::Credentials(format!("access to {} denied ({})", self.origin, resp.status())))
            }
            s => Err(FetchError::Remote(format!("{} returned {s}", self.origin))),
        }
    }

    async fn get(&self, client: &reqwest::Client, key: &str, limit: u64) -> Result<Vec<u8>, FetchError> {
        let resp = self.send(client, &self.path(key), &[]).await?;
        read_limited(resp, limit).await
    }

    /// Object keys under `prefix` (ListObjectsV2), at most `MAX_LIST_PAGES` pages.
    async fn list(&self, client: &reqwest::Client, prefix: &str, limit: u64) -> Result<Vec<String>, FetchError> {
        let path = if self.path_style { format!("/{}", self.bucket) } else { "/".to_string() };
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let mut query = vec![("list-type".to_string(), "2".to_string()), ("prefix".to_string(), prefix.to_string())];
            if let Some(t) = &token {
                query.push(("continuation-token".to_string(), t.clone()));
            }
            let resp = self.send(client, &path, &query).await?;
            let body = read_limited(resp, limit).await?;
            let page = ListPage::parse(&String::from_utf8_lossy(&body))?;
            keys.extend(page.keys);
            token = page.next;
            if token.is_none() {
                break;
            }
        }
        Ok(keys)
    }

    async fn fetch(&self, config: &FetchConfig, key: &str, language: Language) -> Result<FetchedSource, FetchError> {
        let client = self.client(config).await?;
        let limit = config.max_archive_bytes;
        if !key.ends_with('/') {
            let code = self.get(&client, key, limit).await?;
            info!(origin = %self.origin, key, bytes = code.len(), "object downloaded");
            return Ok(FetchedSource { code, filename: language.source_filename().to_string(), dependencies: None, revision: None });
        }
        let listed = self.list(&client, key, limit).await?;
        let relative: Vec<String> = listed
            .iter()
            .filter(|k| !k.ends_with('/'))
            .filter_map(|k| k.strip_prefix(key))
            .map(str::to_string)
            .collect();
        debug!(origin = %self.origin, prefix = key, objects = relative.len(), "prefix listed");
        let origin = format!("{} with prefix '{key}'", self.origin);
        let idx = archive::pick_candidate(relative.iter().map(String::as_str), language)
            .ok_or_else(|| archive::not_found(language, &origin, &relative))?;
        let chosen = &relative[idx];
        let code = self.get(&client, &format!("{key}{chosen}"), limit).await?;
        let dir = chosen.rsplit_once('/').map(|(d, _)| format!("{d}/")).unwrap_or_default();
        let manifest = format!("{dir}{}", language.dependency_filename());
        let dependencies = if relative.iter().any(|r| *r == manifest) {
            Some(self.get(&client, &format!("{key}{manifest}"), limit).await?)
        } else {
            None
        };
        info!(origin = %self.origin, entry = %chosen, bytes = code.len(), "object selected from prefix");
        Ok(FetchedSource { code, filename: language.source_filename().to_string(), dependencies, revision: None })
    }
}

fn path_tail(path: &str) -> String {
    path.rsplit('/').next().map(|t| format!(" ({t})")).unwrap_or_default()
}

/// One ListObjectsV2 page; the GCS XML API answers in the same shape.
#[derive(Debug, Default, PartialEq)]
struct ListPage {
    keys: Vec<String>,
    /// Continuation token, only when the listing is truncated.
    next: Option<String>,
}

impl ListPage {
    fn parse(body: &str) -> Result<Self, FetchError> {
        let doc = roxmltree::Document::parse(body).map_err(|e| FetchError::Remote(format!("unreadable bucket listing: {e}")))?;
        let root = doc.root_element();
        let keys = root
            .children()
            .filter(|c| c.is_element() && c.tag_name().name() == "Contents")
            .filter_map(|c| child_text(c, "Key"))
            .collect();
        let next = match child_text(root, "IsTruncated").as_deref().map(str::trim) {
            Some("true") => child_text(root, "NextContinuationToken").filter(|t| !t.is_empty()),
            _ => None,
        };
        Ok(Self { keys, next })
    }
}

/// Text of the first child element called `name`, namespace ignored.
fn child_text(node: roxmltree::Node<'_, '_>, name: &str) -> Option<String> {
    node.children().find(|c| c.is_element() && c.tag_name().name() == name).map(|c| c.text().unwrap_or("").to_string())
}

fn sigv4_or_anonymous(secret: Option<&SecretData>, region: &str) -> Result<Auth, FetchError> {
    match secret {
        Some(s) => Ok(Auth::SigV4 { keys: AccessKeys::from_secret(s)?, region: region.to_string() }),
        None => Ok(Auth::Anonymous),
    }
}

/// Plain http is reserved for in-cluster service names.
fn scheme_for(host: &str) -> &'static str {
    if guard::is_cluster_service_host(host) || !host.contains('.') {
        "http"
    } else {
        "https"
    }
}

pub struct S3Fetcher {
    config: Arc<FetchConfig>,
}

impl S3Fetcher {
    pub fn new(config: Arc<FetchConfig>) -> Self {
        Self { config }
    }

    fn spec<'a>(&self, spec: &'a SourceSpec) -> Result<&'a S3Source, FetchError> {
        match spec {
            SourceSpec::S3 { s3 } => Ok(s3),
            other => Err(wrong_variant(self.kind(), other)),
        }
    }
}

#[async_trait]
impl SourceFetcher for S3Fetcher {
    fn kind(&self) -> &'static str {
        "s3"
    }

    fn validate(&self, spec: &SourceSpec) -> Result<(), FetchError> {
        let s3 = self.spec(spec)?;
        guard::validate_bucket("s3.bucket", &s3.bucket)?;
        guard::validate_object_key("s3.key", &s3.key)?;
        guard::validate_region("s3.region", s3.region.as_deref().unwrap_or(""))?;
        Ok(())
    }

    async fn fetch(&self, ctx: &FetchContext<'_>, spec: &SourceSpec) -> Result<FetchedSource, FetchError> {
        let s3 = self.spec(spec)?;
        let region = s3.region.as_deref().filter(|r| !r.is_empty()).unwrap_or("us-east-1");
        let secret = ctx.secret(s3.secret_ref.as_ref()).await?;
        // Dotted bucket names break virtual-host TLS.
        let path_style = s3.bucket.contains('.');
        let base = format!("s3.{region}.amazonaws.com");
        let bucket = Bucket {
            scheme: "https",
            host: if path_style { base } else { format!("{}.{base}", s3.bucket) },
            port: None,
            path_style,
            bucket: s3.bucket.clone(),
            auth: sigv4_or_anonymous(secret.as_ref(), region)?,
            project: None,
            origin: format!("s3://{}", s3.bucket),
        };
        bucket.fetch(&self.config, &s3.key, ctx.language).await
    }
}

pub struct MinioFetcher {
    config: Arc<FetchConfig>,
}

impl MinioFetcher {
    pub fn new(config: Arc<FetchConfig>) -> Self {
        Self { config }
    }

    fn spec<'a>(&self, spec: &'a SourceSpec) -> Result<&'a MinioSource, FetchError> {
        match spec {
            SourceSpec::Minio { minio } => Ok(minio),
            other => Err(wrong_variant(self.kind(), other)),
        }
    }

    fn endpoint<'a>(&'a self, minio: &'a MinioSource) -> &'a str {
        minio.endpoint.as_deref().filter(|e| !e.is_empty()).unwrap_or(&self.config.minio_endpoint)
    }
}

#[async_trait]
impl SourceFetcher for MinioFetcher {
    fn kind(&self) -> &'static str {
        "minio"
    }

    fn validate(&self, spec: &SourceSpec) -> Result<(), FetchError> {
        let minio = self.spec(spec)?;
        guard::validate_endpoint("minio.endpoint", self.endpoint(minio), &self.config.hosts)?;
        guard::validate_bucket("minio.bucket", &minio.bucket)?;
        guard::validate_object_key("minio.key", &minio.key)?;
        Ok(())
    }

    async fn fetch(&self, ctx: &FetchContext<'_>, spec: &SourceSpec) -> Result<FetchedSource, FetchError> {
        let minio = self.spec(spec)?;
        let (host, port) = guard::split_host_port(self.endpoint(minio));
        let secret = ctx.secret(minio.secret_ref.as_ref()).await?;
        let bucket = Bucket {
            scheme: scheme_for(host),
            host: host.to_string(),
            port,
            path_style: true,
            bucket: minio.bucket.clone(),
            auth: sigv4_or_anonymous(secret.as_ref(), "us-east-1")?,
            project: None,
            origin: format!("minio://{}/{}", self.endpoint(minio), minio.bucket),
        };
        bucket.fetch(&self.config, &minio.key, ctx.language).await
    }
}

pub struct GcsFetcher {
    config: Arc<FetchConfig>,
}

const GCS_HOST: &str = "storage.googleapis.com";

impl GcsFetcher {
    pub fn new(config: Arc<FetchConfig>) -> Self {
        Self { config }
    }

    fn spec<'a>(&self, spec: &'a SourceSpec) -> Result<&'a GcsSource, FetchError> {
        match spec {
            SourceSpec::Gcs { gcs } => Ok(gcs),
            other => Err(wrong_variant(self.kind(), other)),
        }
    }
}

/// HMAC interoperability keys, then an OAuth access token. A bare service-account
/// JSON key cannot be exchanged here and is reported as such.
fn gcs_auth(secret: Option<&SecretData>) -> Result<Auth, FetchError> {
    let Some(secret) = secret else { return Ok(Auth::Anonymous) };
    if secret.lookup_any(key_names::ACCESS_KEY).is_some() {
        return Ok(Auth::SigV4 { keys: AccessKeys::from_secret(secret)?, region: "auto".to_string() });
    }
    if let Some(token) = secret.lookup_any(key_names::GCS_TOKEN) {
        return Ok(Auth::Bearer(token));
    }
    if secret.lookup_any(key_names::GCS_SERVICE_ACCOUNT).is_some() {
        return Err(FetchError::Credentials(format!(
            "secret '{}' holds a service-account key; provide HMAC keys ({}) or an access token ({}) instead",
            secret.name(),
            key_names::ACCESS_KEY.join(", "),
            key_names::GCS_TOKEN.join(", ")
        )));
    }
    let mut tried: Vec<&str> = key_names::ACCESS_KEY.to_vec();
    tried.extend_from_slice(key_names::GCS_TOKEN);
    tried.extend_from_slice(key_names::GCS_SERVICE_ACCOUNT);
    secret.require_any("gcs credential", &tried).map(Auth::Bearer)
}

#[async_trait]
impl SourceFetcher for GcsFetcher {
    fn kind(&self) -> &'static str {
        "gcs"
    }

    fn validate(&self, spec: &SourceSpec) -> Result<(), FetchError> {
        let gcs = self.spec(spec)?;
        guard::validate_gcs_bucket("gcs.bucket", &gcs.bucket)?;
        guard::validate_object_key("gcs.key", &gcs.key)?;
        guard::validate_project("gcs.project", gcs.project.as_deref().unwrap_or(""))?;
        Ok(())
    }

    async fn fetch(&self, ctx: &FetchContext<'_>, spec: &SourceSpec) -> Result<FetchedSource, FetchError> {
        let gcs = self.spec(spec)?;
        let secret = ctx.secret(gcs.secret_ref.as_ref()).await?;
        let bucket = Bucket {
            scheme: "https",
            host: GCS_HOST.to_string(),
            port: None,
            path_style: true,
            bucket: gcs.bucket.clone(),
            auth: gcs_auth(secret.as_ref())?,
            project: gcs.project.clone().filter(|p| !p.is_empty()),
            origin: format!("gs://{}", gcs.bucket),
        };
        bucket.fetch(&self.config, &gcs.key, ctx.language).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn secret(pairs: &[(&str, &str)]) -> SecretData {
        SecretData::new("store-creds", pairs.iter().map(|(k, v)| (k.to_string(), v.as_bytes().to_vec())).collect::<BTreeMap<_, _>>())
    }

    fn config() -> Arc<FetchConfig> {
        Arc::new(FetchConfig::default())
    }

    #[test]
    fn list_response_parsing() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
            <ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
              <Name>fns</Name><Prefix>fns/hello/</Prefix>
              <IsTruncated>true</IsTruncated>
              <Contents><Key>fns/hello/main.py</Key><Size>10</Size></Contents>
              <Contents><Key>fns/hello/a&amp;b.txt</Key></Contents>
              <Contents><Key>fns&#x2F;hello&#47;requirements.txt</Key></Contents>
              <Contents><Key><![CDATA[fns/hello/<odd>.py]]></Key></Contents>
              <Owner><DisplayName>&lt;Key&gt;not-a-key&lt;/Key&gt;</DisplayName></Owner>
              <CommonPrefixes><Prefix>fns/hello/lib/</Prefix></CommonPrefixes>
              <NextContinuationToken>tok==</NextContinuationToken>
            </ListBucketResult>"#;
        let page = ListPage::parse(body).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(
            page.keys,
            vec!["fns/hello/main.py", "fns/hello/a&b.txt", "fns/hello/requirements.txt", "fns/hello/<odd>.py"]
        );
        assert_eq!(page.next.as_deref(), Some("tok=="));
    }

    #[test]
    fn last_page_and_garbage_listings() {
        let last = "<ListBucketResult><IsTruncated>false</IsTruncated>\
            <Contents><Key>a.py</Key></Contents>\
            <NextContinuationToken>stale</NextContinuationToken></ListBucketResult>";
        let page = ListPage::parse(last).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(page, ListPage { keys: vec!["a.py".to_string()], next: None });
        assert!(matches!(ListPage::parse("<ListBucketResult><Contents>"), Err(FetchError::Remote(_))));
    }

    #[test]
    fn addressing() {
        let b = Bucket {
            scheme: "http",
            host: "minio.minio.svc.cluster.local".into(),
            port: Some(9000),
            path_style: true,
            bucket: "functions".into(),
            auth: Auth::Anonymous,
            project: None,
            origin: "minio".into(),
        };
        assert_eq!(b.authority(), "minio.minio.svc.cluster.local:9000");
        assert_eq!(b.path("hello/main.py"), "/functions/hello/main.py");
        let b = Bucket { scheme: "https", port: Some(443), path_style: false, host: "fns.s3.us-east-1.amazonaws.com".into(), ..b };
        assert_eq!(b.authority(), "fns.s3.us-east-1.amazonaws.com");
        assert_eq!(b.path("hello world.py"), "/hello%20world.py");
        assert_eq!(scheme_for("minio.minio.svc.cluster.local"), "http");
        assert_eq!(scheme_for("s3.example.com"), "https");
    }

    #[test]
    fn s3_validation() {
        let f = S3Fetcher::new(config());
        let spec = |bucket: &str, key: &str| SourceSpec::S3 { s3: S3Source { bucket: bucket.into(), key: key.into(), region: None, secret_ref: None } };
        assert!(f.validate(&spec("functions", "hello/main.py")).is_ok());
        assert!(f.validate(&spec("", "hello/main.py")).is_err());
        assert!(f.validate(&spec("functions", "")).is_err());
        assert!(f.validate(&spec("functions", "../../etc/passwd")).is_err());
    }

    #[test]
    fn minio_endpoint_guard() {
        let f = MinioFetcher::new(config());
        let spec = |endpoint: Option<&str>| SourceSpec::Minio {
            minio: MinioSource { endpoint: endpoint.map(Into::into), bucket: "functions".into(), key: "hello/".into(), secret_ref: None },
        };
        assert!(f.validate(&spec(None)).is_ok());
        assert!(f.validate(&spec(Some("minio.tenant.svc:9000"))).is_ok());
        assert!(f.validate(&spec(Some("169.254.169.254"))).is_err());
        assert!(f.validate(&spec(Some("kubernetes.default.svc"))).is_err());
        assert!(f.validate(&spec(Some("localhost:9000"))).is_err());
    }

    #[test]
    fn gcs_credentials() {
        assert!(matches!(gcs_auth(None), Ok(Auth::Anonymous)));
        assert!(matches!(gcs_auth(Some(&secret(&[("accesskey", "GOOG1"), ("secretkey", "s")]))), Ok(Auth::SigV4 { .. })));
        assert!(matches!(gcs_auth(Some(&secret(&[("token", "ya29")]))), Ok(Auth::Bearer(_))));
        assert!(matches!(gcs_auth(Some(&secret(&[("key.json", "{}")]))), Err(FetchError::Credentials(_))));
        let err = gcs_auth(Some(&secret(&[("other", "x")]))).err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err.contains("store-creds") && err.contains("GOOGLE_APPLICATION_CREDENTIALS"));
        let err = gcs_auth(Some(&secret(&[("accesskey", "GOOG1")]))).err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err.contains("secret key"));
    }

    #[test]
    fn gcs_validation() {
        let f = GcsFetcher::new(config());
        let spec = |bucket: &str| SourceSpec::Gcs { gcs: GcsSource { bucket: bucket.into(), key: "main.py".into(), project: None, secret_ref: None } };
        assert!(f.validate(&spec("acme_functions")).is_ok());
        assert!(f.validate(&spec("google-functions")).is_err());
        assert!(f.validate(&SourceSpec::S3 { s3: S3Source::default() }).is_err());
    }
}
