//! CloudEvent `type` values understood by the receiver.

pub const FUNCTION_DEPLOY: &str = "io.knative.lambda.command.function.deploy";
pub const SERVICE_CREATE: &str = "io.knative.lambda.command.service.create";
pub const SERVICE_UPDATE: &str = "io.knative.lambda.command.service.update";
pub const SERVICE_DELETE: &str = "io.knative.lambda.command.service.delete";
pub const BUILD_START: &str = "io.knative.lambda.command.build.start";
pub const BUILD_RETRY: &str = "io.knative.lambda.command.build.retry";
pub const BUILD_CANCEL: &str = "io.knative.lambda.command.build.cancel";
pub const FUNCTION_ROLLBACK: &str = "io.knative.lambda.command.function.rollback";
pub const RESPONSE_SUCCESS: &str = "io.knative.lambda.response.success";
pub const RESPONSE_ERROR: &str = "io.knative.lambda.response.error";

pub const LIFECYCLE_BUILD_STARTED: &str = "io.knative.lambda.lifecycle.build.started";
pub const LIFECYCLE_BUILD_COMPLETED: &str = "io.knative.lambda.lifecycle.build.completed";
pub const LIFECYCLE_BUILD_FAILED: &str = "io.knative.lambda.lifecycle.build.failed";
pub const LIFECYCLE_BUILD_CANCELLED: &str = "io.knative.lambda.lifecycle.build.cancelled";
pub const LIFECYCLE_FUNCTION_READY: &str = "io.knative.lambda.lifecycle.function.ready";
pub const LIFECYCLE_FUNCTION_DELETED: &str = "io.knative.lambda.lifecycle.function.deleted";

pub fn is_command(event_type: &str) -> bool {
    event_type.starts_with("io.knative.lambda.command.")
}

pub fn is_response(event_type: &str) -> bool {
    event_type.starts_with("io.knative.lambda.response.")
}
