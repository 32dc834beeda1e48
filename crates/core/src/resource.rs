use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Condition, SourceSpec};

/// Desired state of a serverless function.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "lambda.knative.io",
    version = "v1alpha1",
    kind = "LambdaFunction",
    namespaced,
    status = "LambdaFunctionStatus",
    shortname = "lf",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".status.buildStatus.imageUri"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LambdaFunctionSpec {
    pub source: SourceSpec,
    pub runtime: RuntimeSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVarSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling: Option<ScalingSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    pub language: String,
    #[serde(default)]
    pub version: String,
    /// `module.function` reference into the user code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    #[serde(default)]
    pub force_rebuild: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct EnvVarSpec {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScalingSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_concurrency: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum Phase {
    #[default]
    Pending,
    Building,
    Ready,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Building => "Building",
            Phase::Ready => "Ready",
            Phase::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LambdaFunctionStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_status: Option<BuildStatusInfo>,
    #[serde(default)]
    pub service_status: ServiceStatusInfo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: i64,
    /// Last `rebuild-requested` annotation value acted upon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_rebuild_request: Option<String>,
    /// Last `cancel-requested` annotation value acted upon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_cancel_request: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatusInfo {
    #[serde(default)]
    pub job_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempt: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatusInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_revision: Option<String>,
}

/// Supported runtimes after alias folding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Python,
    Node,
    Go,
}

impl Language {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" => Some(Self::Python),
            "nodejs" | "node" | "javascript" => Some(Self::Node),
            "go" | "golang" => Some(Self::Go),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Node => "nodejs",
            Self::Go => "go",
        }
    }

    /// Canonical entry file the build expects.
    pub fn source_filename(&self) -> &'static str {
        match self {
            Self::Python => "main.py",
            Self::Node => "index.js",
            Self::Go => "main.go",
        }
    }

    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Python => &[".py"],
            Self::Node => &[".js", ".mjs"],
            Self::Go => &[".go"],
        }
    }

    /// Go compiles the user code directly and needs no wrapper.
    pub fn wrapper_filename(&self) -> Option<&'static str> {
        match self {
            Self::Python => Some("runtime.py"),
            Self::Node => Some("runtime.js"),
            Self::Go => None,
        }
    }

    pub fn dependency_filename(&self) -> &'static str {
        match self {
            Self::Python => "requirements.txt",
            Self::Node => "package.json",
            Self::Go => "go.mod",
        }
    }

    pub fn default_version(&self) -> &'static str {
        match self {
            Self::Python => "3.11",
            Self::Node => "20",
            Self::Go => "1.22",
        }
    }
}

impl LambdaFunction {
    pub fn phase(&self) -> Phase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn status_mut(&mut self) -> &mut LambdaFunctionStatus {
        self.status.get_or_insert_with(LambdaFunctionStatus::default)
    }

    pub fn force_rebuild(&self) -> bool {
        self.spec.build.as_ref().map(|b| b.force_rebuild).unwrap_or(false)
    }

    pub fn language(&self) -> Option<Language> {
        Language::parse(&self.spec.runtime.language)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations().get(key).map(String::as_str)
    }

    /// `namespace/name`, used in logs and errors.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;
    use serde_json::json;

    #[test]
    fn crd_is_namespaced_with_status() {
        let crd = LambdaFunction::crd();
        assert_eq!(crd.spec.group, "lambda.knative.io");
        assert_eq!(crd.spec.scope, "Namespaced");
        let version = &crd.spec.versions[0];
        assert!(version.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());
        let yaml = serde_yaml::to_string(&crd).unwrap_or_default();
        assert!(yaml.contains("LambdaFunction"));
    }

    #[test]
    fn deserialises_deploy_payload_spec() {
        let f: LambdaFunction = serde_json::from_value(json!({
            "apiVersion": "lambda.knative.io/v1alpha1",
            "kind": "LambdaFunction",
            "metadata": {"name": "f1", "namespace": "knative-lambda"},
            "spec": {
                "source": {"type": "inline", "inline": {"code": "def handler(e):\n    return e"}},
                "runtime": {"language": "python", "version": "3.11", "handler": "main.handler"}
            }
        }))
        .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(f.phase(), Phase::Pending);
        assert_eq!(f.language(), Some(Language::Python));
        assert!(!f.force_rebuild());
        assert_eq!(f.key(), "knative-lambda/f1");
    }

    #[test]
    fn language_aliases_fold() {
        assert_eq!(Language::parse("Python3"), Some(Language::Python));
        assert_eq!(Language::parse("javascript"), Some(Language::Node));
        assert_eq!(Language::parse("golang"), Some(Language::Go));
        assert_eq!(Language::parse("ruby"), None);
        assert_eq!(Language::Go.wrapper_filename(), None);
    }
}
