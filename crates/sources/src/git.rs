use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use lambda_core::{GitSource, SourceSpec};
use tokio::process::Command;
use tracing::{debug, info};

use crate::archive::{self, SourceFile};
use crate::credentials::{key_names, SecretData};
use crate::guard::{self, GitRemote};
use crate::{check_resolved, ip_literal, wrong_variant, FetchConfig, FetchContext, FetchError, FetchedSource, SourceFetcher};

/// Shallow fetch of a single resolved commit through the `git` binary.
pub struct GitFetcher {
    config: Arc<FetchConfig>,
}

impl GitFetcher {
    pub fn new(config: Arc<FetchConfig>) -> Self {
        Self { config }
    }

    fn spec<'a>(&self, spec: &'a SourceSpec) -> Result<&'a GitSource, FetchError> {
        match spec {
            SourceSpec::Git { git } => Ok(git),
            other => Err(wrong_variant(self.kind(), other)),
        }
    }
}

enum GitAuth {
    Anonymous,
    Basic { username: String, password: String },
    SshKey(String),
}

impl GitAuth {
    // Precedence: ssh key, username/password, then token conventions.
    fn from_secret(secret: Option<&SecretData>) -> Result<Self, FetchError> {
        let Some(secret) = secret else { return Ok(Self::Anonymous) };
        if let Some(key) = secret.lookup_any(key_names::SSH_KEY) {
            return Ok(Self::SshKey(key));
        }
        let username = secret.lookup_any(key_names::GIT_USERNAME);
        if let Some(password) = secret.lookup_any(key_names::GIT_PASSWORD) {
            return Ok(Self::Basic { username: username.unwrap_or_else(|| "git".to_string()), password });
        }
        if let Some(token) = secret.lookup_any(&["token"]) {
            return Ok(Self::Basic { username: username.unwrap_or_else(|| "git".to_string()), password: token });
        }
        if let Some(token) = secret.lookup_any(&["github-token"]) {
            return Ok(Self::Basic { username: "x-access-token".to_string(), password: token });
        }
        if let Some(token) = secret.lookup_any(&["gitlab-token"]) {
            return Ok(Self::Basic { username: "oauth2".to_string(), password: token });
        }
        let mut tried: Vec<&str> = key_names::SSH_KEY.to_vec();
        tried.extend(["password", "token", "github-token", "gitlab-token"]);
        Err(FetchError::Credentials(format!(
            "secret '{}' has no git credential (tried keys: {}; present keys: {})",
            secret.name(),
            tried.join(", "),
            secret.keys().join(", ")
        )))
    }
}

/// One git invocation context: shared `-c` options and environment.
struct GitCli<'a> {
    binary: &'a str,
    config: Vec<String>,
    env: Vec<(String, String)>,
    timeout: std::time::Duration,
}

impl GitCli<'_> {
    async fn run(&self, dir: Option<&Path>, args: &[&str]) -> Result<String, FetchError> {
        let mut cmd = Command::new(self.binary);
        for c in &self.config {
            cmd.arg("-c").arg(c);
        }
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env_remove("GIT_SSH_COMMAND")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        let verb = args.first().copied().unwrap_or("git");
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| FetchError::Remote(format!("git {verb} timed out after {}s", self.timeout.as_secs())))?
            .map_err(|e| FetchError::Io(format!("running git {verb}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let first = stderr.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("no output");
            let first: String = first.chars().filter(|c| !c.is_control()).take(200).collect();
            return Err(FetchError::Remote(format!("git {verb} failed: {first}")));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn is_commit_sha(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Pick the commit for `want` out of `git ls-remote` output.
///
/// Annotated tags resolve through their peeled `^{}` entry; branches win over tags of the same name.
fn parse_ls_remote(output: &str, want: &str) -> Option<String> {
    let refs: Vec<(&str, &str)> = output
        .lines()
        .filter_map(|l| l.split_once('\t'))
        .map(|(sha, name)| (sha.trim(), name.trim()))
        .filter(|(sha, _)| is_commit_sha(sha))
        .collect();
    let find = |name: &str| refs.iter().find(|(_, n)| *n == name).map(|(sha, _)| sha.to_string());
    if want == "HEAD" || want.starts_with("refs/") {
        return find(&format!("{want}^{{}}")).or_else(|| find(want));
    }
    find(&format!("refs/heads/{want}"))
        .or_else(|| find(&format!("refs/tags/{want}^{{}}")))
        .or_else(|| find(&format!("refs/tags/{want}")))
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    fn kind(&self) -> &'static str {
        "git"
    }

    fn validate(&self, spec: &SourceSpec) -> Result<(), FetchError> {
        let git = self.spec(spec)?;
        guard::validate_git_url(&git.url, &self.config.hosts)?;
        guard::validate_git_ref(git.git_ref.as_deref().unwrap_or(""))?;
        guard::validate_rel_path("git.path", git.path.as_deref().unwrap_or(""))?;
        Ok(())
    }

    async fn fetch(&self, ctx: &FetchContext<'_>, spec: &SourceSpec) -> Result<FetchedSource, FetchError> {
        let git = self.spec(spec)?;
        let remote: GitRemote = guard::validate_git_url(&git.url, &self.config.hosts)?;
        let addrs = check_resolved("git.url", &remote.host, remote.default_port(), &self.config.hosts).await?;

        let secret = ctx.secret(git.secret_ref.as_ref()).await?;
        let auth = GitAuth::from_secret(secret.as_ref())?;

        let mut cli = GitCli {
            binary: &self.config.git_binary,
            config: vec![
                "protocol.allow=never".to_string(),
                "protocol.https.allow=always".to_string(),
                "protocol.http.allow=always".to_string(),
                "protocol.ssh.allow=always".to_string(),
                "protocol.git.allow=always".to_string(),
                "core.hooksPath=/dev/null".to_string(),
                "advice.detachedHead=false".to_string(),
            ],
            env: Vec::new(),
            timeout: self.config.timeout,
        };
        if remote.is_http() {
            // Pin curl to the addresses that passed the check.
            let pins: Vec<String> = addrs.iter().map(|a| ip_literal(a.ip())).collect();
            cli.config.push(format!("http.curloptResolve={}:{}:{}", remote.host, remote.default_port(), pins.join(",")));
        }

        // Keeps the key file alive until the fetch completes.
        let mut _key_file: Option<tempfile::NamedTempFile> = None;
        match auth {
            GitAuth::Anonymous => {}
            GitAuth::Basic { username, password } if remote.is_http() => {
                let token = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
                cli.config.push(format!("http.extraHeader=Authorization: Basic {token}"));
            }
            GitAuth::Basic { .. } => {
                return Err(FetchError::Credentials("username/token credentials require an http(s) git url".into()));
            }
            GitAuth::SshKey(key) => {
                let mut file = tempfile::NamedTempFile::new().map_err(|e| FetchError::Io(format!("creating key file: {e}")))?;
                file.write_all(key.as_bytes())
                    .and_then(|_| file.write_all(b"\n"))
                    .map_err(|e| FetchError::Io(format!("writing key file: {e}")))?;
                cli.env.push((
                    "GIT_SSH_COMMAND".to_string(),
                    format!("ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new -o BatchMode=yes", file.path().display()),
                ));
                _key_file = Some(file);
            }
        }

        let want = git.git_ref.as_deref().filter(|r| !r.is_empty()).unwrap_or("HEAD");
        let commit = if is_commit_sha(want) {
            want.to_ascii_lowercase()
        } else {
            let listing = cli.run(None, &["ls-remote", git.url.trim(), want]).await?;
            parse_ls_remote(&listing, want)
                .ok_or_else(|| FetchError::NotFound(format!("ref '{want}' not found in {}", git.url.trim())))?
        };
        info!(url = %git.url.trim(), git_ref = %want, commit = %commit, "git ref resolved");

        let work = tempfile::tempdir().map_err(|e| FetchError::Io(format!("creating checkout dir: {e}")))?;
        cli.run(Some(work.path()), &["init", "-q", "."]).await?;
        cli.run(Some(work.path()), &["fetch", "-q", "--no-tags", "--depth", "1", git.url.trim(), commit.as_str()]).await?;
        cli.run(Some(work.path()), &["checkout", "-q", "--detach", "FETCH_HEAD"]).await?;

        let rel = git.path.as_deref().unwrap_or("");
        let origin = format!("git repository {} (path: {rel})", git.url.trim());
        let Some(root) = confined(work.path(), rel).await? else {
            return Err(FetchError::NotFound(format!("path '{rel}' not found in {}", git.url.trim())));
        };
        let mut fetched = match tokio::fs::metadata(&root).await {
            Ok(meta) if meta.is_file() => {
                let code = tokio::fs::read(&root).await.map_err(|e| FetchError::Io(format!("reading {rel}: {e}")))?;
                FetchedSource { code, filename: ctx.language.source_filename().to_string(), dependencies: None, revision: None }
            }
            Ok(meta) if meta.is_dir() => {
                let files = collect_files(&root, self.config.max_archive_bytes).await?;
                archive::select_source(files, ctx.language, &origin)?
            }
            _ => return Err(FetchError::NotFound(format!("path '{rel}' not found in {}", git.url.trim()))),
        };
        fetched.revision = Some(commit);
        Ok(fetched)
    }
}

/// Resolve `rel` inside the checkout. Symlinks are followed, and the result must still lie
/// under the checkout root. `None` when nothing exists at that path.
async fn confined(work: &Path, rel: &str) -> Result<Option<PathBuf>, FetchError> {
    let joined = guard::secure_join(work, rel)?;
    let base = tokio::fs::canonicalize(work).await.map_err(|e| FetchError::Io(format!("resolving checkout dir: {e}")))?;
    let resolved = match tokio::fs::canonicalize(&joined).await {
        Ok(p) => p,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(FetchError::Io(format!("resolving {rel}: {e}"))),
    };
    if !resolved.starts_with(&base) {
        return Err(guard::SecurityError::new("git.path", "path leaves the repository through a symlink", "PATH_TRAVERSAL").into());
    }
    Ok(Some(resolved))
}

/// Regular files below `root` (relative paths), skipping `.git` and symlinks.
async fn collect_files(root: &Path, limit: u64) -> Result<Vec<SourceFile>, FetchError> {
    let io = |e: std::io::Error| FetchError::Io(format!("walking checkout: {e}"));
    let mut out = Vec::new();
    let mut total = 0u64;
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(io)?;
        while let Some(entry) = entries.next_entry().await.map_err(io)? {
            let ty = entry.file_type().await.map_err(io)?;
            let path = entry.path();
            if ty.is_symlink() || entry.file_name() == ".git" {
                continue;
            }
            if ty.is_dir() {
                stack.push(path);
                continue;
            }
            let meta = entry.metadata().await.map_err(io)?;
            total = total.saturating_add(meta.len());
            if total > limit {
                return Err(FetchError::TooLarge { limit });
            }
            let Ok(rel) = path.strip_prefix(root) else { continue };
            let rel = rel.to_string_lossy().replace('\\', "/");
            let data = tokio::fs::read(&path).await.map_err(io)?;
            out.push(SourceFile { path: rel, data });
        }
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(root = %root.display(), files = out.len(), "checkout walked");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lambda_core::SecretRef;
    use std::collections::BTreeMap;

    const LS_REMOTE: &str = "\
1111111111111111111111111111111111111111\tHEAD
2222222222222222222222222222222222222222\trefs/heads/main
3333333333333333333333333333333333333333\trefs/tags/v1.0.0
4444444444444444444444444444444444444444\trefs/tags/v1.0.0^{}
5555555555555555555555555555555555555555\trefs/tags/v0.9.0
";

    #[test]
    fn ls_remote_resolution() {
        assert_eq!(parse_ls_remote(LS_REMOTE, "HEAD").as_deref(), Some("1111111111111111111111111111111111111111"));
        assert_eq!(parse_ls_remote(LS_REMOTE, "main").as_deref(), Some("2222222222222222222222222222222222222222"));
        assert_eq!(parse_ls_remote(LS_REMOTE, "v1.0.0").as_deref(), Some("4444444444444444444444444444444444444444"));
        assert_eq!(parse_ls_remote(LS_REMOTE, "v0.9.0").as_deref(), Some("5555555555555555555555555555555555555555"));
        assert_eq!(parse_ls_remote(LS_REMOTE, "refs/heads/main").as_deref(), Some("2222222222222222222222222222222222222222"));
        assert_eq!(parse_ls_remote(LS_REMOTE, "develop"), None);
    }

    #[test]
    fn commit_shas_are_recognised() {
        assert!(is_commit_sha("0123456789abcdef0123456789abcdef01234567"));
        assert!(!is_commit_sha("0123456"));
        assert!(!is_commit_sha("main"));
    }

    fn secret(pairs: &[(&str, &str)]) -> SecretData {
        SecretData::new("git-creds", pairs.iter().map(|(k, v)| (k.to_string(), v.as_bytes().to_vec())).collect::<BTreeMap<_, _>>())
    }

    #[test]
    fn auth_conventions() {
        assert!(matches!(GitAuth::from_secret(None), Ok(GitAuth::Anonymous)));
        assert!(matches!(GitAuth::from_secret(Some(&secret(&[("ssh-privatekey", "KEY")]))), Ok(GitAuth::SshKey(_))));
        match GitAuth::from_secret(Some(&secret(&[("github-token", "ghp")]))) {
            Ok(GitAuth::Basic { username, .. }) => assert_eq!(username, "x-access-token"),
            _ => panic!("expected basic auth"),
        }
        match GitAuth::from_secret(Some(&secret(&[("gitlab-token", "glpat")]))) {
            Ok(GitAuth::Basic { username, .. }) => assert_eq!(username, "oauth2"),
            _ => panic!("expected basic auth"),
        }
        let err = GitAuth::from_secret(Some(&secret(&[("unrelated", "x")]))).err();
        assert!(matches!(err, Some(FetchError::Credentials(m)) if m.contains("git-creds") && m.contains("gitlab-token")));
    }

    #[test]
    fn validation_runs_without_network() {
        let f = GitFetcher::new(Arc::new(FetchConfig::default()));
        let spec = |url: &str, r: Option<&str>, p: Option<&str>| SourceSpec::Git {
            git: GitSource {
                url: url.into(),
                git_ref: r.map(Into::into),
                path: p.map(Into::into),
                secret_ref: Some(SecretRef { name: "git-creds".into() }),
            },
        };
        assert!(f.validate(&spec("https://github.com/acme/fn.git", Some("main"), Some("hello"))).is_ok());
        assert!(f.validate(&spec("https://github.com/acme/fn.git", Some("main;id"), None)).is_err());
        assert!(f.validate(&spec("https://github.com/acme/fn.git", None, Some("../../etc"))).is_err());
        assert!(f.validate(&spec("https://kubernetes.default.svc/api", None, None)).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_directories_cannot_leave_the_checkout() {
        let work = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let outside = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        std::fs::write(outside.path().join("token"), "SECRET").unwrap_or_else(|e| panic!("{e}"));
        std::os::unix::fs::symlink(outside.path(), work.path().join("evil")).unwrap_or_else(|e| panic!("{e}"));
        std::fs::create_dir_all(work.path().join("src")).unwrap_or_else(|e| panic!("{e}"));
        std::fs::write(work.path().join("src/main.py"), "x = 1").unwrap_or_else(|e| panic!("{e}"));
        std::os::unix::fs::symlink(work.path().join("src"), work.path().join("alias")).unwrap_or_else(|e| panic!("{e}"));

        let err = confined(work.path(), "evil/token").await.err();
        assert!(matches!(err, Some(FetchError::Security(ref s)) if s.code == "PATH_TRAVERSAL"), "{err:?}");
        assert!(matches!(confined(work.path(), "evil").await, Err(FetchError::Security(_))));

        let inside = confined(work.path(), "alias/main.py").await.unwrap_or_else(|e| panic!("{e}"));
        assert!(inside.is_some_and(|p| p.ends_with("src/main.py")));
        assert!(confined(work.path(), "src").await.unwrap_or_else(|e| panic!("{e}")).is_some());
        assert!(confined(work.path(), "missing.py").await.unwrap_or_else(|e| panic!("{e}")).is_none());
    }

    #[tokio::test]
    async fn walk_skips_git_dir() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        std::fs::create_dir_all(dir.path().join(".git")).unwrap_or_else(|e| panic!("{e}"));
        std::fs::create_dir_all(dir.path().join("src")).unwrap_or_else(|e| panic!("{e}"));
        std::fs::write(dir.path().join(".git/config"), "x").unwrap_or_else(|e| panic!("{e}"));
        std::fs::write(dir.path().join("src/main.py"), "def handler(e): return e").unwrap_or_else(|e| panic!("{e}"));
        let files = collect_files(dir.path(), 1 << 20).await.unwrap_or_else(|e| panic!("{e}"));
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["src/main.py"]);
        assert!(matches!(collect_files(dir.path(), 4).await, Err(FetchError::TooLarge { .. })));
    }
}
