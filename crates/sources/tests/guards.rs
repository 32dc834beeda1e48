#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use async_trait::async_trait;
use lambda_core::{GitSource, GithubSource, InlineSource, Language, MinioSource, S3Source, SecretRef, SourceSpec};
use lambda_sources::{guard, FetchConfig, FetchContext, FetchError, Fetchers, HostPolicy, SecretData, SecretReader};

struct NoSecrets;

#[async_trait]
impl SecretReader for NoSecrets {
    async fn read(&self, namespace: &str, name: &str) -> Result<SecretData, FetchError> {
        Err(FetchError::NotFound(format!("secret {namespace}/{name}")))
    }
}

fn git(url: &str) -> SourceSpec {
    SourceSpec::Git { git: GitSource { url: url.into(), ..Default::default() } }
}

fn security_code(res: Result<(), FetchError>) -> Option<&'static str> {
    match res {
        Err(FetchError::Security(e)) => Some(e.code),
        _ => None,
    }
}

#[test]
fn metadata_and_api_server_are_unreachable() {
    let f = Fetchers::new(FetchConfig::default());
    for url in [
        "https://169.254.169.254/latest/meta-data",
        "https://kubernetes.default.svc/api",
        "https://metadata.google.internal/computeMetadata",
        "https://127.0.0.1/repo.git",
        "https://[::1]/repo.git",
        "https://10.0.0.5/repo.git",
    ] {
        assert!(security_code(f.validate(&git(url))).is_some(), "{url} passed validation");
    }
    assert!(f.validate(&git("https://github.com/acme/functions.git")).is_ok());
    assert!(f.validate(&git("http://gitea.gitea.svc.cluster.local/acme/fn.git")).is_ok());
    assert_eq!(security_code(f.validate(&git("http://github.com/acme/functions.git"))), Some("URL_SCHEME"));
    assert_eq!(security_code(f.validate(&git("file:///etc/passwd"))), Some("URL_SCHEME"));
}

#[test]
fn allow_list_admits_private_literals() {
    let config = FetchConfig { hosts: HostPolicy::parse("10.0.0.5"), ..FetchConfig::default() };
    let f = Fetchers::new(config);
    assert!(f.validate(&git("https://10.0.0.5/repo.git")).is_ok());
    assert!(f.validate(&git("https://169.254.169.254/repo.git")).is_err());
}

#[test]
fn traversal_is_refused_everywhere() {
    let f = Fetchers::new(FetchConfig::default());
    let spec = SourceSpec::Git {
        git: GitSource { url: "https://github.com/acme/fn.git".into(), path: Some("../../etc".into()), ..Default::default() },
    };
    assert_eq!(security_code(f.validate(&spec)), Some("PATH_TRAVERSAL"));
    let spec = SourceSpec::S3 { s3: S3Source { bucket: "acme-fns".into(), key: "../secrets".into(), ..Default::default() } };
    assert_eq!(security_code(f.validate(&spec)), Some("PATH_TRAVERSAL"));
    let spec = SourceSpec::Github {
        github: GithubSource { owner: "acme".into(), repo: "fns".into(), path: Some("/abs".into()), ..Default::default() },
    };
    assert!(security_code(f.validate(&spec)).is_some());
    let spec = SourceSpec::Minio {
        minio: MinioSource { endpoint: Some("169.254.169.254:9000".into()), bucket: "acme".into(), key: "a.zip".into(), secret_ref: None },
    };
    assert!(security_code(f.validate(&spec)).is_some());
}

#[test]
fn handler_injection_falls_back_to_default() {
    assert_eq!(guard::sanitize_handler(Some("app.run")), "app.run");
    assert_eq!(guard::sanitize_handler(Some("main.handler\"; import os")), guard::DEFAULT_HANDLER);
    assert_eq!(guard::sanitize_handler(Some("x.y$(id)")), guard::DEFAULT_HANDLER);
    assert_eq!(guard::sanitize_handler(None), guard::DEFAULT_HANDLER);
    assert!(guard::validate_handler("no_dot").is_err());
}

#[test]
fn secrets_fall_back_across_key_names() {
    let values: BTreeMap<String, Vec<u8>> =
        [("AWS_ACCESS_KEY_ID", "AKIA"), ("secretkey", "shh")].iter().map(|(k, v)| (k.to_string(), v.as_bytes().to_vec())).collect();
    let s = SecretData::new("creds", values);
    let keys = lambda_sources::AccessKeys::from_secret(&s).unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(keys.access_key, "AKIA");
    assert!(!format!("{keys:?}").contains("shh"));
}

#[tokio::test]
async fn inline_fetch_uses_canonical_filename() {
    let f = Fetchers::new(FetchConfig::default());
    let ctx = FetchContext { namespace: "fns", language: Language::Node, secrets: &NoSecrets };
    let spec = SourceSpec::Inline {
        inline: InlineSource { code: "exports.handler = async (e) => e".into(), dependencies: Some("{\"name\":\"fn\"}".into()) },
    };
    let got = f.fetch(&ctx, &spec).await.unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(got.filename, "index.js");
    assert!(got.dependencies.is_some());
}

#[tokio::test]
async fn missing_secret_is_reported_as_not_found() {
    let ctx = FetchContext { namespace: "fns", language: Language::Python, secrets: &NoSecrets };
    let spec = SourceSpec::Github {
        github: GithubSource {
            owner: "acme".into(),
            repo: "private-fns".into(),
            secret_ref: Some(SecretRef { name: "gh-token".into() }),
            ..Default::default()
        },
    };
    let res = ctx.secret(spec.secret_ref()).await;
    assert!(matches!(res, Err(FetchError::NotFound(_))));
}
