use std::sync::Arc;

use async_trait::async_trait;
use lambda_core::{ImageSource, InlineSource, SourceSpec};

use crate::guard::{self, SecurityError};
use crate::{wrong_variant, FetchConfig, FetchContext, FetchError, FetchedSource, SourceFetcher};

/// Code embedded in the resource itself.
pub struct InlineFetcher {
    config: Arc<FetchConfig>,
}

impl InlineFetcher {
    pub fn new(config: Arc<FetchConfig>) -> Self {
        Self { config }
    }

    fn spec<'a>(&self, spec: &'a SourceSpec) -> Result<&'a InlineSource, FetchError> {
        match spec {
            SourceSpec::Inline { inline } => Ok(inline),
            other => Err(wrong_variant(self.kind(), other)),
        }
    }
}

#[async_trait]
impl SourceFetcher for InlineFetcher {
    fn kind(&self) -> &'static str {
        "inline"
    }

    fn validate(&self, spec: &SourceSpec) -> Result<(), FetchError> {
        let inline = self.spec(spec)?;
        if inline.code.trim().is_empty() {
            return Err(SecurityError::new("inline.code", "code is required", "REQUIRED").into());
        }
        let size = inline.code.len() + inline.dependencies.as_ref().map(String::len).unwrap_or(0);
        if size > self.config.max_inline_bytes {
            return Err(FetchError::TooLarge { limit: self.config.max_inline_bytes as u64 });
        }
        Ok(())
    }

    async fn fetch(&self, ctx: &FetchContext<'_>, spec: &SourceSpec) -> Result<FetchedSource, FetchError> {
        let inline = self.spec(spec)?;
        Ok(FetchedSource {
            code: inline.code.as_bytes().to_vec(),
            filename: ctx.language.source_filename().to_string(),
            dependencies: inline.dependencies.as_ref().filter(|d| !d.trim().is_empty()).map(|d| d.as_bytes().to_vec()),
            revision: None,
        })
    }
}

/// Pre-built images are deployed as-is: validation only, nothing to fetch.
pub struct ImageFetcher;

impl ImageFetcher {
    fn spec<'a>(&self, spec: &'a SourceSpec) -> Result<&'a ImageSource, FetchError> {
        match spec {
            SourceSpec::Image { image } => Ok(image),
            other => Err(wrong_variant(self.kind(), other)),
        }
    }
}

#[async_trait]
impl SourceFetcher for ImageFetcher {
    fn kind(&self) -> &'static str {
        "image"
    }

    fn validate(&self, spec: &SourceSpec) -> Result<(), FetchError> {
        let image = self.spec(spec)?;
        guard::validate_image_repository("image.repository", &image.repository)?;
        if let Some(tag) = image.tag.as_deref().filter(|t| !t.is_empty()) {
            guard::validate_image_tag("image.tag", tag)?;
        }
        if let Some(digest) = image.digest.as_deref().filter(|d| !d.is_empty()) {
            guard::validate_image_digest("image.digest", digest)?;
        }
        if let Some(port) = image.port {
            if !(1..=65535).contains(&port) {
                return Err(SecurityError::new("image.port", "port must be 1-65535", "URL_INVALID").into());
            }
        }
        Ok(())
    }

    async fn fetch(&self, _ctx: &FetchContext<'_>, spec: &SourceSpec) -> Result<FetchedSource, FetchError> {
        let image = self.spec(spec)?;
        Err(FetchError::Unsupported(format!("image {} is pre-built and has no source to fetch", image.reference())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_requires_code_within_limit() {
        let config = FetchConfig { max_inline_bytes: 16, ..FetchConfig::default() };
        let f = InlineFetcher::new(Arc::new(config));
        let spec = |code: &str| SourceSpec::Inline { inline: InlineSource { code: code.into(), dependencies: None } };
        assert!(f.validate(&spec("print(1)")).is_ok());
        assert!(f.validate(&spec("   ")).is_err());
        assert!(matches!(f.validate(&spec(&"x".repeat(17))), Err(FetchError::TooLarge { limit: 16 })));
    }

    #[test]
    fn image_references() {
        let f = ImageFetcher;
        let spec = |repo: &str, tag: Option<&str>, digest: Option<&str>| SourceSpec::Image {
            image: ImageSource { repository: repo.into(), tag: tag.map(Into::into), digest: digest.map(Into::into), ..Default::default() },
        };
        assert!(f.validate(&spec("ghcr.io/acme/hello", Some("v1"), None)).is_ok());
        assert!(f.validate(&spec("localhost:5001/acme/hello", None, None)).is_ok());
        assert!(f.validate(&spec("ghcr.io/acme/$(id)", None, None)).is_err());
        assert!(f.validate(&spec("nginx", None, None)).is_ok());
        assert!(f.validate(&spec("", None, None)).is_err());
        assert!(f.validate(&spec("ghcr.io/acme/hello", Some("v1;rm"), None)).is_err());
        assert!(f.validate(&spec("ghcr.io/acme/hello", None, Some("sha256:abc"))).is_err());
        let digest = format!("sha256:{}", "0".repeat(64));
        assert!(f.validate(&spec("ghcr.io/acme/hello", None, Some(&digest))).is_ok());
    }
}
