use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::FetchError;

/// Conventional key names accepted for each credential, in lookup order.
pub mod key_names {
    pub const ACCESS_KEY: &[&str] = &["accesskey", "access-key", "AWS_ACCESS_KEY_ID"];
    pub const SECRET_KEY: &[&str] = &["secretkey", "secret-key", "AWS_SECRET_ACCESS_KEY"];
    pub const SESSION_TOKEN: &[&str] = &["sessiontoken", "session-token", "AWS_SESSION_TOKEN"];
    pub const GITHUB_TOKEN: &[&str] = &["token", "github-token", "GITHUB_TOKEN", "password"];
    pub const GIT_USERNAME: &[&str] = &["username"];
    pub const GIT_PASSWORD: &[&str] = &["password"];
    pub const SSH_KEY: &[&str] = &["ssh-privatekey", "identity", "id_rsa"];
    pub const GCS_TOKEN: &[&str] = &["token", "access-token", "GOOGLE_OAUTH_ACCESS_TOKEN"];
    pub const GCS_SERVICE_ACCOUNT: &[&str] =
        &["key.json", "credentials.json", "service-account.json", "GOOGLE_APPLICATION_CREDENTIALS"];
}

/// Decoded contents of one Secret. Values never appear in `Debug` output or errors.
#[derive(Clone, Default)]
pub struct SecretData {
    name: String,
    values: BTreeMap<String, Vec<u8>>,
}

impl std::fmt::Debug for SecretData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretData").field("name", &self.name).field("keys", &self.keys()).finish()
    }
}

impl SecretData {
    pub fn new(name: impl Into<String>, values: BTreeMap<String, Vec<u8>>) -> Self {
        Self { name: name.into(), values }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> Vec<&str> {
        self.values.keys().map(String::as_str).collect()
    }

    /// First non-blank value under any of `keys`, trimmed.
    pub fn lookup_any(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| {
            let raw = self.values.get(*k)?;
            let text = String::from_utf8_lossy(raw).trim().to_string();
            (!text.is_empty()).then_some(text)
        })
    }

    /// Like `lookup_any`, but a missing credential is an error naming the keys tried.
    pub fn require_any(&self, what: &str, keys: &[&str]) -> Result<String, FetchError> {
        self.lookup_any(keys).ok_or_else(|| {
            FetchError::Credentials(format!(
                "secret '{}' has no {} (tried keys: {}; present keys: {})",
                self.name,
                what,
                keys.join(", "),
                self.keys().join(", ")
            ))
        })
    }
}

/// Reads Secrets from the function's namespace.
#[async_trait]
pub trait SecretReader: Send + Sync {
    async fn read(&self, namespace: &str, name: &str) -> Result<SecretData, FetchError>;
}

/// Access/secret key pair for SigV4-signed object storage.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessKeys {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for AccessKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessKeys").field("access_key", &self.access_key).finish_non_exhaustive()
    }
}

impl AccessKeys {
    pub fn from_secret(secret: &SecretData) -> Result<Self, FetchError> {
        Ok(Self {
            access_key: secret.require_any("access key", key_names::ACCESS_KEY)?,
            secret_key: secret.require_any("secret key", key_names::SECRET_KEY)?,
            session_token: secret.lookup_any(key_names::SESSION_TOKEN),
        })
    }
}
