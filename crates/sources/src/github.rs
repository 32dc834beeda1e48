use std::sync::Arc;

use async_trait::async_trait;
use lambda_core::{GithubSource, SourceSpec};
use reqwest::StatusCode;
use tracing::info;
use url::Url;

use crate::archive;
use crate::credentials::key_names;
use crate::guard;
use crate::{check_resolved, pinned_client, read_limited, wrong_variant, FetchConfig, FetchContext, FetchError, FetchedSource, SourceFetcher};

/// Downloads a repository zipball through the GitHub API.
pub struct GithubFetcher {
    config: Arc<FetchConfig>,
}

impl GithubFetcher {
    pub fn new(config: Arc<FetchConfig>) -> Self {
        Self { config }
    }

    fn spec<'a>(&self, spec: &'a SourceSpec) -> Result<&'a GithubSource, FetchError> {
        match spec {
            SourceSpec::Github { github } => Ok(github),
            other => Err(wrong_variant(self.kind(), other)),
        }
    }

    /// `{api}/repos/{owner}/{repo}/zipball/{ref}`; the default branch when no ref is given.
    pub fn archive_url(&self, gh: &GithubSource) -> Result<Url, FetchError> {
        let git_ref = gh.git_ref.as_deref().filter(|r| !r.is_empty()).unwrap_or("HEAD");
        let raw = format!("{}/repos/{}/{}/zipball/{}", self.config.github_api.trim_end_matches('/'), gh.owner, gh.repo, git_ref);
        Url::parse(&raw).map_err(|e| FetchError::Remote(format!("building archive url: {e}")))
    }
}

/// The zipball root is `{owner}-{repo}-{sha}`; the trailing segment is the resolved commit.
fn revision_from_root(root: &str) -> Option<String> {
    let sha = root.rsplit('-').next()?;
    (sha.len() >= 7 && sha.bytes().all(|b| b.is_ascii_hexdigit())).then(|| sha.to_string())
}

#[async_trait]
impl SourceFetcher for GithubFetcher {
    fn kind(&self) -> &'static str {
        "github"
    }

    fn validate(&self, spec: &SourceSpec) -> Result<(), FetchError> {
        let gh = self.spec(spec)?;
        guard::validate_owner(&gh.owner)?;
        guard::validate_repo(&gh.repo)?;
        guard::validate_git_ref(gh.git_ref.as_deref().unwrap_or(""))?;
        guard::validate_rel_path("github.path", gh.path.as_deref().unwrap_or(""))?;
        Ok(())
    }

    async fn fetch(&self, ctx: &FetchContext<'_>, spec: &SourceSpec) -> Result<FetchedSource, FetchError> {
        let gh = self.spec(spec)?;
        let url = self.archive_url(gh)?;
        let host = url.host_str().unwrap_or_default().to_string();
        let port = url.port_or_known_default().unwrap_or(443);
        let addrs = check_resolved("github", &host, port, &self.config.hosts).await?;
        let client = pinned_client(&self.config, &host, &addrs)?;

        let token = match ctx.secret(gh.secret_ref.as_ref()).await? {
            Some(secret) => Some(secret.require_any("github token", key_names::GITHUB_TOKEN)?),
            None => None,
        };
        let mut req = client
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &token {
            req = req.bearer_auth(token);
        }
        let origin = format!("github.com/{}/{}", gh.owner, gh.repo);
        let resp = req.send().await.map_err(|e| FetchError::Remote(format!("{origin}: {e}")))?;
        match resp.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(FetchError::NotFound(format!(
                    "repository {origin} or ref '{}' not found{}",
                    gh.git_ref.as_deref().unwrap_or("HEAD"),
                    if token.is_none() { " (private repositories need a token)" } else { "" }
                )))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(FetchError::Credentials(format!("github denied access to {origin} ({})", resp.status())))
            }
            s => return Err(FetchError::Remote(format!("{origin} returned {s}"))),
        }
        let limit = self.config.max_archive_bytes;
        let bytes = read_limited(resp, limit).await?;
        let path = gh.path.as_deref().unwrap_or("");
        let extracted = archive::extract_zip(&bytes, path, limit)?;
        let revision = extracted.root.as_deref().and_then(revision_from_root);
        let mut fetched = archive::select_source(extracted.files, ctx.language, &format!("github archive {origin} (path: {path})"))?;
        fetched.revision = revision;
        info!(repo = %origin, revision = ?fetched.revision, archive_bytes = bytes.len(), "github archive fetched");
        Ok(fetched)
    }
}
