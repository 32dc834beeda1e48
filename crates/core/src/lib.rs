//! Lambda core types (LambdaFunction resource, source variants, error taxonomy)

#![forbid(unsafe_code)]

mod condition;
mod error;
mod resource;
mod source;

pub use condition::{set_condition, Condition, ConditionStatus};
pub use error::{LambdaError, LambdaResult, StoreError};
pub use resource::{
    BuildSpec, BuildStatusInfo, EnvVarSpec, Language, LambdaFunction, LambdaFunctionSpec, LambdaFunctionStatus,
    Phase, ResourceSpec, RuntimeSpec, ScalingSpec, ServiceStatusInfo,
};
pub use source::{
    GcsSource, GitSource, GithubSource, ImageSource, InlineSource, MinioSource, S3Source, SecretRef, SourceSpec,
    SOURCE_TYPES,
};

pub const GROUP: &str = "lambda.knative.io";
pub const VERSION: &str = "v1alpha1";
pub const KIND: &str = "LambdaFunction";
pub const FINALIZER: &str = "lambdafunction.lambda.knative.io/finalizer";
pub const MANAGER: &str = "knative-lambda-operator";

/// Annotation and label keys written on functions and their derived objects.
pub mod keys {
    pub const LAST_CLOUDEVENT_ID: &str = "lambda.knative.io/last-cloudevent-id";
    pub const CREATED_BY_CLOUDEVENT: &str = "lambda.knative.io/created-by-cloudevent";
    pub const CLOUDEVENT_ID: &str = "lambda.knative.io/cloudevent-id";
    pub const CLOUDEVENT_SOURCE: &str = "lambda.knative.io/cloudevent-source";
    pub const REBUILD_REQUESTED: &str = "lambda.knative.io/rebuild-requested";
    /// `"true"` when the request next to it must skip image reuse.
    pub const REBUILD_FORCE: &str = "lambda.knative.io/rebuild-force";
    pub const CANCEL_REQUESTED: &str = "lambda.knative.io/cancel-requested";
    pub const CANCEL_REASON: &str = "lambda.knative.io/cancel-reason";
    pub const ROLLBACK_REQUESTED: &str = "lambda.knative.io/rollback-requested";
    pub const ROLLBACK_REASON: &str = "lambda.knative.io/rollback-reason";
    pub const ROLLBACK_TARGET: &str = "lambda.knative.io/rollback-target";

    pub const NAME_LABEL: &str = "lambda.knative.io/name";
    pub const BUILD_LABEL: &str = "lambda.knative.io/build";
    pub const IMAGE_URI: &str = "lambda.knative.io/image-uri";
    pub const CONTENT_HASH: &str = "lambda.knative.io/content-hash";
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
}

/// Condition types recorded in `status.conditions`.
pub mod conditions {
    pub const SOURCE_READY: &str = "SourceReady";
    pub const BUILD_READY: &str = "BuildReady";
    pub const SERVICE_READY: &str = "ServiceReady";
    pub const EVENTING_READY: &str = "EventingReady";
}

/// RFC3339 timestamp for status and annotation fields.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
