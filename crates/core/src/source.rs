use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, ObjectValidation, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::LambdaError;

/// Discriminants accepted in `source.type`.
pub const SOURCE_TYPES: [&str; 7] = ["git", "s3", "minio", "gcs", "github", "inline", "image"];

/// Reference to a Secret in the function's namespace.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct SecretRef {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
    pub url: String,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct S3Source {
    pub bucket: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MinioSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub bucket: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GcsSource {
    pub bucket: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GithubSource {
    pub owner: String,
    pub repo: String,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InlineSource {
    pub code: String,
    /// Dependency manifest content (requirements.txt, package.json or go.mod).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Where the function's code comes from. Exactly one variant, selected by `type`.
///
/// Wire shape: `{"type": "git", "git": {"url": "..."}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceSpec {
    Git { git: GitSource },
    S3 { s3: S3Source },
    Minio { minio: MinioSource },
    Gcs { gcs: GcsSource },
    Github { github: GithubSource },
    Inline { inline: InlineSource },
    Image { image: ImageSource },
}

impl ImageSource {
    /// Pullable reference: digest wins over tag, tag over `latest`.
    pub fn reference(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(d), _) if !d.is_empty() => format!("{}@{}", self.repository, d),
            (_, Some(t)) if !t.is_empty() => format!("{}:{}", self.repository, t),
            _ => format!("{}:latest", self.repository),
        }
    }
}

impl SourceSpec {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Git { .. } => "git",
            Self::S3 { .. } => "s3",
            Self::Minio { .. } => "minio",
            Self::Gcs { .. } => "gcs",
            Self::Github { .. } => "github",
            Self::Inline { .. } => "inline",
            Self::Image { .. } => "image",
        }
    }

    /// Name of the Secret holding credentials for this source, if any.
    pub fn secret_ref(&self) -> Option<&SecretRef> {
        match self {
            Self::Git { git } => git.secret_ref.as_ref(),
            Self::S3 { s3 } => s3.secret_ref.as_ref(),
            Self::Minio { minio } => minio.secret_ref.as_ref(),
            Self::Gcs { gcs } => gcs.secret_ref.as_ref(),
            Self::Github { github } => github.secret_ref.as_ref(),
            Self::Inline { .. } | Self::Image { .. } => None,
        }
    }

    pub fn is_prebuilt(&self) -> bool {
        matches!(self, Self::Image { .. })
    }

    /// Parse a raw `source` object, reporting which invariant failed instead of a serde message.
    ///
    /// The type must be non-empty and known, its variant object must be present, and no
    /// other variant object may be populated alongside it.
    pub fn from_value(v: &Value) -> Result<Self, LambdaError> {
        let obj = v.as_object().ok_or_else(|| LambdaError::Validation("source must be an object".into()))?;
        let ty = obj.get("type").and_then(Value::as_str).unwrap_or("").trim();
        if ty.is_empty() {
            return Err(LambdaError::Validation("source.type is required".into()));
        }
        if !SOURCE_TYPES.contains(&ty) {
            return Err(LambdaError::Validation(format!("unsupported source type: {ty}")));
        }
        match obj.get(ty) {
            Some(Value::Object(_)) => {}
            _ => return Err(LambdaError::Validation(format!("source.{ty} is required for source type '{ty}'"))),
        }
        let extra: Vec<&str> = SOURCE_TYPES
            .iter()
            .copied()
            .filter(|other| *other != ty && obj.get(*other).map(|x| !x.is_null()).unwrap_or(false))
            .collect();
        if !extra.is_empty() {
            return Err(LambdaError::Validation(format!(
                "source.type is '{ty}' but {} also populated",
                extra.join(", ")
            )));
        }
        serde_json::from_value(v.clone()).map_err(|e| LambdaError::Validation(format!("invalid source.{ty}: {e}")))
    }
}

impl JsonSchema for SourceSpec {
    fn schema_name() -> String {
        "SourceSpec".to_string()
    }

    // Structural schema: a `type` discriminator plus one optional object per variant.
    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        let mut object = ObjectValidation::default();
        object.properties.insert(
            "type".to_string(),
            Schema::Object(SchemaObject {
                instance_type: Some(InstanceType::String.into()),
                enum_values: Some(SOURCE_TYPES.iter().map(|t| Value::String((*t).to_string())).collect()),
                ..Default::default()
            }),
        );
        object.properties.insert("git".to_string(), gen.subschema_for::<GitSource>());
        object.properties.insert("s3".to_string(), gen.subschema_for::<S3Source>());
        object.properties.insert("minio".to_string(), gen.subschema_for::<MinioSource>());
        object.properties.insert("gcs".to_string(), gen.subschema_for::<GcsSource>());
        object.properties.insert("github".to_string(), gen.subschema_for::<GithubSource>());
        object.properties.insert("inline".to_string(), gen.subschema_for::<InlineSource>());
        object.properties.insert("image".to_string(), gen.subschema_for::<ImageSource>());
        object.required.insert("type".to_string());
        Schema::Object(SchemaObject {
            instance_type: Some(InstanceType::Object.into()),
            object: Some(Box::new(object)),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape_nests_variant_under_its_type() {
        let src = SourceSpec::Inline { inline: InlineSource { code: "def handler(e): pass".into(), dependencies: None } };
        let v = serde_json::to_value(&src).unwrap_or_default();
        assert_eq!(v["type"], "inline");
        assert_eq!(v["inline"]["code"], "def handler(e): pass");
    }

    #[test]
    fn empty_type_is_rejected() {
        let err = SourceSpec::from_value(&json!({"type": "", "inline": {"code": "x"}})).err();
        assert_eq!(err, Some(LambdaError::Validation("source.type is required".into())));
        let err = SourceSpec::from_value(&json!({"inline": {"code": "x"}})).err();
        assert!(matches!(err, Some(LambdaError::Validation(_))));
    }

    #[test]
    fn mismatched_type_is_rejected() {
        let err = SourceSpec::from_value(&json!({"type": "git", "s3": {"bucket": "b", "key": "k"}}));
        assert!(matches!(err, Err(LambdaError::Validation(m)) if m.contains("source.git is required")));
    }

    #[test]
    fn second_populated_variant_is_rejected() {
        let err = SourceSpec::from_value(&json!({
            "type": "git",
            "git": {"url": "https://github.com/acme/fn.git"},
            "inline": {"code": "x"}
        }));
        assert!(matches!(err, Err(LambdaError::Validation(m)) if m.contains("inline also populated")));
    }

    #[test]
    fn git_ref_uses_wire_name() {
        let src = SourceSpec::from_value(&json!({
            "type": "git",
            "git": {"url": "https://github.com/acme/fn.git", "ref": "v1.2.0", "path": "src"}
        }));
        match src {
            Ok(SourceSpec::Git { git }) => {
                assert_eq!(git.git_ref.as_deref(), Some("v1.2.0"));
                assert_eq!(git.path.as_deref(), Some("src"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn image_reference_prefers_digest() {
        let mut img = ImageSource { repository: "ghcr.io/acme/fn".into(), ..Default::default() };
        assert_eq!(img.reference(), "ghcr.io/acme/fn:latest");
        img.tag = Some("v2".into());
        assert_eq!(img.reference(), "ghcr.io/acme/fn:v2");
        img.digest = Some(format!("sha256:{}", "a".repeat(64)));
        assert!(img.reference().starts_with("ghcr.io/acme/fn@sha256:"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = SourceSpec::from_value(&json!({"type": "ftp", "ftp": {}}));
        assert!(matches!(err, Err(LambdaError::Validation(m)) if m.contains("unsupported source type")));
    }
}
