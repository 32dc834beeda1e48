//! Input guards for every user-controlled field that reaches a URL, a path,
//! a shell-adjacent argument or a rendered template.

use std::net::{IpAddr, Ipv4Addr};

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

/// A field failed a security check. `code` is stable and safe to log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct SecurityError {
    pub field: String,
    pub message: String,
    pub code: &'static str,
}

impl SecurityError {
    pub fn new(field: &str, message: impl Into<String>, code: &'static str) -> Self {
        Self { field: field.to_string(), message: message.into(), code }
    }
}

type Check = Result<(), SecurityError>;

fn pattern(p: &str) -> Regex {
    Regex::new(p).expect("static pattern")
}

static HANDLER_RE: Lazy<Regex> = Lazy::new(|| pattern(r"^[a-zA-Z_][a-zA-Z0-9_]*\.[a-zA-Z_][a-zA-Z0-9_]*$"));
static GIT_REF_RE: Lazy<Regex> = Lazy::new(|| pattern(r"^[a-zA-Z0-9][a-zA-Z0-9._/-]*$"));
static BUCKET_RE: Lazy<Regex> = Lazy::new(|| pattern(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$"));
static GCS_BUCKET_RE: Lazy<Regex> = Lazy::new(|| pattern(r"^[a-z0-9][a-z0-9._-]{1,61}[a-z0-9]$"));
static OBJECT_KEY_RE: Lazy<Regex> = Lazy::new(|| pattern(r"^[a-zA-Z0-9!_.*'()/-]+$"));
static ENDPOINT_RE: Lazy<Regex> = Lazy::new(|| pattern(r"^[a-zA-Z0-9][-a-zA-Z0-9.]*[a-zA-Z0-9](:[0-9]{1,5})?$"));
static REGION_RE: Lazy<Regex> = Lazy::new(|| pattern(r"^[a-z]{2}(-[a-z]+)+-[0-9]+$"));
static PROJECT_RE: Lazy<Regex> = Lazy::new(|| pattern(r"^[a-z][a-z0-9-]{4,28}[a-z0-9]$"));
static OWNER_RE: Lazy<Regex> = Lazy::new(|| pattern(r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,37}[a-zA-Z0-9])?$"));
static REPO_RE: Lazy<Regex> = Lazy::new(|| pattern(r"^[a-zA-Z0-9._-]{1,100}$"));
static DNS_LABEL_RE: Lazy<Regex> = Lazy::new(|| pattern(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$"));
static IMAGE_REPOSITORY_RE: Lazy<Regex> =
    Lazy::new(|| pattern(r"^[a-z0-9]+([._-][a-z0-9]+)*(:[0-9]{1,5})?(/[a-z0-9]+([._-][a-z0-9]+)*)*$"));
static IMAGE_TAG_RE: Lazy<Regex> = Lazy::new(|| pattern(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$"));
static IMAGE_DIGEST_RE: Lazy<Regex> = Lazy::new(|| pattern(r"^sha256:[a-f0-9]{64}$"));
static SHELL_META_RE: Lazy<Regex> = Lazy::new(|| pattern("[;&|$`(){}\\[\\]<>!#*?~\n\r\\\\]"));

pub const DEFAULT_HANDLER: &str = "main.handler";

const MAX_URL_LEN: usize = 2048;
const MAX_REF_LEN: usize = 256;
const MAX_PATH_LEN: usize = 512;
const MAX_KEY_LEN: usize = 1024;
const MAX_HANDLER_LEN: usize = 100;
const MAX_ENDPOINT_LEN: usize = 253;

/// Hostnames that are never fetched from: cloud metadata, the cluster API, loopback.
const BLOCKED_HOSTS: &[&str] = &[
    "169.254.169.254",
    "169.254.170.2",
    "metadata.google.internal",
    "metadata.goog",
    "kubernetes",
    "kubernetes.default",
    "kubernetes.default.svc",
    "kubernetes.default.svc.cluster.local",
    "localhost",
    "127.0.0.1",
    "0.0.0.0",
    "::1",
    "10.96.0.1",
];

/// Operator-provided hosts that may resolve to private ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostPolicy {
    allowed: Vec<String>,
}

impl HostPolicy {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = hosts
            .into_iter()
            .map(|h| h.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        Self { allowed }
    }

    /// Comma-separated list, as found in `LAMBDA_ALLOWED_HOSTS`.
    pub fn parse(list: &str) -> Self {
        Self::new(list.split(','))
    }

    pub fn allows(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.allowed.iter().any(|a| host == *a || host.ends_with(&format!(".{a}")))
    }

    /// Private addresses are acceptable for allow-listed and in-cluster service hosts.
    pub fn allows_private(&self, host: &str) -> bool {
        is_cluster_service_host(host) || self.allows(host)
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_start_matches('[').trim_end_matches(']').trim_end_matches('.').to_ascii_lowercase()
}

/// `*.svc` and `*.svc.cluster.local` names, excluding the API server itself.
pub fn is_cluster_service_host(host: &str) -> bool {
    let host = normalize_host(host);
    (host.ends_with(".svc") || host.ends_with(".svc.cluster.local")) && !is_blocked_host(&host)
}

pub fn is_blocked_host(host: &str) -> bool {
    let host = normalize_host(host);
    BLOCKED_HOSTS.iter().any(|b| host == *b || host.ends_with(&format!(".{b}")))
}

/// Link-local, loopback and unspecified addresses are never reachable from a fetch.
pub fn is_always_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_link_local() || v4.is_unspecified() || v4.is_broadcast(),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_always_blocked_ip(&IpAddr::V4(mapped));
            }
            // fe80::/10
            v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// RFC1918, carrier-grade NAT and IPv6 unique-local ranges.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_private() || (a == 100 && (64..128).contains(&b))
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_ip(&IpAddr::V4(mapped));
            }
            // fc00::/7
            (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

pub fn is_blocked_ip(ip: &IpAddr, allow_private: bool) -> bool {
    is_always_blocked_ip(ip) || (!allow_private && is_private_ip(ip))
}

pub fn check_shell_metachars(field: &str, value: &str) -> Check {
    if SHELL_META_RE.is_match(value) {
        return Err(SecurityError::new(field, "contains shell metacharacters", "SHELL_METACHAR"));
    }
    Ok(())
}

/// Literal host check: blocked names, then literal IPs. No DNS is performed here.
pub fn check_host(field: &str, host: &str, policy: &HostPolicy) -> Check {
    let bare = normalize_host(host);
    if bare.is_empty() {
        return Err(SecurityError::new(field, "host is empty", "URL_INVALID"));
    }
    if is_blocked_host(&bare) {
        return Err(SecurityError::new(field, format!("host '{bare}' is blocked"), "URL_BLOCKED_HOST"));
    }
    let literal = bare.parse::<IpAddr>().ok().or_else(|| numeric_ipv4(&bare).map(IpAddr::V4));
    if let Some(ip) = literal {
        if is_blocked_ip(&ip, policy.allows(&bare)) {
            return Err(SecurityError::new(field, format!("address {ip} is in a blocked range"), "URL_BLOCKED_IP"));
        }
    }
    Ok(())
}

/// The other IPv4 spellings resolvers accept: `2852039166`, `0xa9fea9fe`,
/// `0251.0376.0251.0376`, `127.1`. Dotted quads are left to `IpAddr`.
fn numeric_ipv4(host: &str) -> Option<Ipv4Addr> {
    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() > 4 {
        return None;
    }
    let mut nums = Vec::with_capacity(parts.len());
    for part in parts {
        let n = if let Some(hex) = part.strip_prefix("0x") {
            u32::from_str_radix(hex, 16).ok()?
        } else if part.len() > 1 && part.starts_with('0') {
            u32::from_str_radix(&part[1..], 8).ok()?
        } else if !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()) {
            part.parse().ok()?
        } else {
            return None;
        };
        nums.push(n);
    }
    let (last, head) = nums.split_last()?;
    if head.iter().any(|n| *n > 255) {
        return None;
    }
    // the last part fills every byte the leading parts did not
    let tail_bits = 8 * (4 - head.len() as u32);
    if tail_bits < 32 && u64::from(*last) >= 1u64 << tail_bits {
        return None;
    }
    let addr = head.iter().enumerate().fold(*last, |acc, (i, n)| acc | (n << (24 - 8 * i as u32)));
    Some(Ipv4Addr::from(addr))
}

/// Where a git remote points after parsing, including scp-style `git@host:path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRemote {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
}

impl GitRemote {
    pub fn is_http(&self) -> bool {
        self.scheme == "http" || self.scheme == "https"
    }

    pub fn default_port(&self) -> u16 {
        self.port.unwrap_or(match self.scheme.as_str() {
            "https" => 443,
            "http" => 80,
            "git" => 9418,
            _ => 22,
        })
    }
}

pub fn validate_git_url(url: &str, policy: &HostPolicy) -> Result<GitRemote, SecurityError> {
    const FIELD: &str = "git.url";
    let url = url.trim();
    if url.is_empty() {
        return Err(SecurityError::new(FIELD, "url is required", "URL_EMPTY"));
    }
    if url.len() > MAX_URL_LEN {
        return Err(SecurityError::new(FIELD, format!("url exceeds {MAX_URL_LEN} characters"), "URL_INVALID"));
    }
    if url.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(SecurityError::new(FIELD, "url contains whitespace or control characters", "URL_INVALID"));
    }
    if url.starts_with('-') {
        return Err(SecurityError::new(FIELD, "url may not start with '-'", "URL_INVALID"));
    }
    check_shell_metachars(FIELD, url)?;
    let remote = match scp_like(url) {
        Some(remote) => remote,
        None => {
            let parsed = Url::parse(url).map_err(|e| SecurityError::new(FIELD, format!("invalid url: {e}"), "URL_INVALID"))?;
            let host = parsed.host_str().unwrap_or_default().to_string();
            GitRemote { scheme: parsed.scheme().to_ascii_lowercase(), host, port: parsed.port() }
        }
    };
    match remote.scheme.as_str() {
        "https" | "git" | "ssh" => {}
        "http" if is_cluster_service_host(&remote.host) => {}
        "http" => {
            return Err(SecurityError::new(FIELD, "plain http is only allowed for in-cluster *.svc hosts", "URL_SCHEME"));
        }
        other => return Err(SecurityError::new(FIELD, format!("scheme '{other}' is not allowed"), "URL_SCHEME")),
    }
    check_host(FIELD, &remote.host, policy)?;
    Ok(remote)
}

// `user@host:path`, the ssh shorthand git accepts without a scheme.
fn scp_like(url: &str) -> Option<GitRemote> {
    if url.contains("://") {
        return None;
    }
    let (user_host, _path) = url.split_once(':')?;
    let (_user, host) = user_host.split_once('@')?;
    Some(GitRemote { scheme: "ssh".to_string(), host: host.to_string(), port: None })
}

pub fn validate_git_ref(git_ref: &str) -> Check {
    const FIELD: &str = "git.ref";
    if git_ref.is_empty() {
        return Ok(());
    }
    if git_ref.len() > MAX_REF_LEN {
        return Err(SecurityError::new(FIELD, format!("ref exceeds {MAX_REF_LEN} characters"), "REF_INVALID"));
    }
    if git_ref.contains("..") || git_ref.ends_with(".lock") || git_ref.ends_with('/') {
        return Err(SecurityError::new(FIELD, "ref is not a valid branch, tag or commit", "REF_INVALID"));
    }
    if !GIT_REF_RE.is_match(git_ref) {
        return Err(SecurityError::new(FIELD, "ref contains invalid characters", "REF_INVALID"));
    }
    Ok(())
}

/// Relative path below a checkout or archive root. Any `..` segment is refused.
pub fn validate_rel_path(field: &str, path: &str) -> Check {
    if path.is_empty() {
        return Ok(());
    }
    if path.len() > MAX_PATH_LEN {
        return Err(SecurityError::new(field, format!("path exceeds {MAX_PATH_LEN} characters"), "PATH_TOO_LONG"));
    }
    if path.starts_with('/') || path.starts_with('\\') || path.contains(':') {
        return Err(SecurityError::new(field, "path must be relative", "PATH_ABSOLUTE"));
    }
    if path.contains('\0') || path.split(['/', '\\']).any(|seg| seg == "..") {
        return Err(SecurityError::new(field, "path escapes the source root", "PATH_TRAVERSAL"));
    }
    Ok(())
}

/// Normalise a relative path, dropping `.` and empty segments.
/// Returns `None` when `..` would climb above the root.
pub fn normalize_rel(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split(['/', '\\']) {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            s => parts.push(s),
        }
    }
    Some(parts.join("/"))
}

/// Join `rel` onto `base`, refusing anything that lands outside `base`.
pub fn secure_join(base: &std::path::Path, rel: &str) -> Result<std::path::PathBuf, SecurityError> {
    if rel.starts_with('/') || rel.starts_with('\\') {
        return Err(SecurityError::new("path", "path must be relative", "PATH_ABSOLUTE"));
    }
    let clean = normalize_rel(rel).ok_or_else(|| SecurityError::new("path", "path escapes the source root", "PATH_TRAVERSAL"))?;
    if clean.is_empty() {
        return Ok(base.to_path_buf());
    }
    Ok(base.join(clean))
}

pub fn validate_handler(handler: &str) -> Check {
    const FIELD: &str = "runtime.handler";
    if handler.is_empty() {
        return Ok(());
    }
    if handler.len() > MAX_HANDLER_LEN {
        return Err(SecurityError::new(FIELD, format!("handler exceeds {MAX_HANDLER_LEN} characters"), "HANDLER_INVALID"));
    }
    if SHELL_META_RE.is_match(handler) || handler.contains(['"', '\'']) {
        return Err(SecurityError::new(FIELD, "handler contains invalid characters", "HANDLER_INVALID"));
    }
    if !HANDLER_RE.is_match(handler) {
        return Err(SecurityError::new(FIELD, "handler must look like 'module.function'", "HANDLER_INVALID"));
    }
    Ok(())
}

/// The handler to render into generated code: the given one when valid, else the default.
pub fn sanitize_handler(handler: Option<&str>) -> String {
    match handler {
        Some(h) if !h.is_empty() && validate_handler(h).is_ok() => h.to_string(),
        _ => DEFAULT_HANDLER.to_string(),
    }
}

pub fn validate_bucket(field: &str, bucket: &str) -> Check {
    if bucket.is_empty() {
        return Err(SecurityError::new(field, "bucket is required", "REQUIRED"));
    }
    check_shell_metachars(field, bucket)?;
    if !BUCKET_RE.is_match(bucket) || bucket.contains("..") {
        return Err(SecurityError::new(field, "bucket must be 3-63 lowercase alphanumerics, dots or hyphens", "BUCKET_INVALID"));
    }
    Ok(())
}

pub fn validate_gcs_bucket(field: &str, bucket: &str) -> Check {
    if bucket.is_empty() {
        return Err(SecurityError::new(field, "bucket is required", "REQUIRED"));
    }
    check_shell_metachars(field, bucket)?;
    if !GCS_BUCKET_RE.is_match(bucket) || bucket.contains("..") {
        return Err(SecurityError::new(field, "bucket must be 3-63 lowercase alphanumerics, dots, underscores or hyphens", "BUCKET_INVALID"));
    }
    if bucket.starts_with("goog") || bucket.contains("google") {
        return Err(SecurityError::new(field, "bucket names may not reference google", "BUCKET_INVALID"));
    }
    Ok(())
}

pub fn validate_object_key(field: &str, key: &str) -> Check {
    if key.is_empty() {
        return Err(SecurityError::new(field, "key is required", "REQUIRED"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(SecurityError::new(field, format!("key exceeds {MAX_KEY_LEN} characters"), "KEY_INVALID"));
    }
    if key.contains("..") {
        return Err(SecurityError::new(field, "key contains a traversal sequence", "PATH_TRAVERSAL"));
    }
    if key.starts_with('/') {
        return Err(SecurityError::new(field, "key must be relative to the bucket", "PATH_ABSOLUTE"));
    }
    if !OBJECT_KEY_RE.is_match(key) {
        return Err(SecurityError::new(field, "key contains invalid characters", "KEY_INVALID"));
    }
    Ok(())
}

/// `host[:port]` for an S3-compatible endpoint.
pub fn validate_endpoint(field: &str, endpoint: &str, policy: &HostPolicy) -> Check {
    if endpoint.len() > MAX_ENDPOINT_LEN {
        return Err(SecurityError::new(field, format!("endpoint exceeds {MAX_ENDPOINT_LEN} characters"), "ENDPOINT_INVALID"));
    }
    check_shell_metachars(field, endpoint)?;
    if !ENDPOINT_RE.is_match(endpoint) {
        return Err(SecurityError::new(field, "endpoint must be host or host:port", "ENDPOINT_INVALID"));
    }
    let host = split_host_port(endpoint).0;
    check_host(field, host, policy)
}

/// Split `host:port`; the port is `None` when absent or unparsable.
pub fn split_host_port(endpoint: &str) -> (&str, Option<u16>) {
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host, port.parse().ok()),
        _ => (endpoint, None),
    }
}

pub fn validate_region(field: &str, region: &str) -> Check {
    if region.is_empty() {
        return Ok(());
    }
    if !REGION_RE.is_match(region) {
        return Err(SecurityError::new(field, "region must look like 'us-east-1'", "REGION_INVALID"));
    }
    Ok(())
}

pub fn validate_project(field: &str, project: &str) -> Check {
    if project.is_empty() {
        return Ok(());
    }
    if !PROJECT_RE.is_match(project) {
        return Err(SecurityError::new(field, "project id must be 6-30 lowercase alphanumerics or hyphens", "PROJECT_INVALID"));
    }
    Ok(())
}

/// RFC 1123 label: the shape of Kubernetes names and namespaces.
pub fn validate_dns_label(field: &str, value: &str) -> Check {
    if value.is_empty() {
        return Err(SecurityError::new(field, "name is required", "REQUIRED"));
    }
    if !DNS_LABEL_RE.is_match(value) {
        return Err(SecurityError::new(
            field,
            "must be at most 63 lowercase alphanumerics or '-', starting and ending with an alphanumeric",
            "NAME_INVALID",
        ));
    }
    Ok(())
}

/// `[registry[:port]/]path`, lowercase, as in an image reference.
pub fn validate_image_repository(field: &str, repository: &str) -> Check {
    if repository.is_empty() {
        return Err(SecurityError::new(field, "repository is required", "REQUIRED"));
    }
    check_shell_metachars(field, repository)?;
    if !IMAGE_REPOSITORY_RE.is_match(repository) {
        return Err(SecurityError::new(field, "repository is not a valid image reference", "URL_INVALID"));
    }
    Ok(())
}

pub fn validate_image_tag(field: &str, tag: &str) -> Check {
    if !IMAGE_TAG_RE.is_match(tag) {
        return Err(SecurityError::new(field, "tag is not valid", "URL_INVALID"));
    }
    Ok(())
}

pub fn validate_image_digest(field: &str, digest: &str) -> Check {
    if !IMAGE_DIGEST_RE.is_match(digest) {
        return Err(SecurityError::new(field, "digest must be sha256:<64 hex>", "URL_INVALID"));
    }
    Ok(())
}

/// `host[:port][/path]` of a registry the build pushes to. The host gets the same checks as any fetch target.
pub fn validate_registry(field: &str, registry: &str, policy: &HostPolicy) -> Check {
    let registry = registry.trim_end_matches('/');
    let (host, path) = registry.split_once('/').unwrap_or((registry, ""));
    validate_endpoint(field, host, policy)?;
    if !path.is_empty() {
        validate_image_repository(field, path)?;
    }
    Ok(())
}

pub fn validate_owner(owner: &str) -> Check {
    const FIELD: &str = "github.owner";
    if owner.is_empty() {
        return Err(SecurityError::new(FIELD, "owner is required", "REQUIRED"));
    }
    if !OWNER_RE.is_match(owner) {
        return Err(SecurityError::new(FIELD, "owner must be 1-39 alphanumerics or inner hyphens", "OWNER_INVALID"));
    }
    Ok(())
}

pub fn validate_repo(repo: &str) -> Check {
    const FIELD: &str = "github.repo";
    if repo.is_empty() {
        return Err(SecurityError::new(FIELD, "repo is required", "REQUIRED"));
    }
    if repo == "." || repo == ".." || !REPO_RE.is_match(repo) {
        return Err(SecurityError::new(FIELD, "repo must be 1-100 alphanumerics, dots, underscores or hyphens", "REPO_INVALID"));
    }
    Ok(())
}
