use serde_json::{json, Value};

use crate::event_types as et;

const DNS_LABEL: &str = "^[a-z0-9]([-a-z0-9]*[a-z0-9])?$";

fn name_schema() -> Value {
    json!({ "type": "string", "pattern": DNS_LABEL, "minLength": 1, "maxLength": 63 })
}

fn secret_ref() -> Value {
    json!({ "type": "object", "required": ["name"], "properties": { "name": name_schema() } })
}

/// Full deploy/create/update payload: a LambdaFunction manifest.
pub fn function_deploy() -> Value {
    let source_types: Vec<&str> = lambda_core::SOURCE_TYPES.to_vec();
    let requires_variant: Vec<Value> = source_types
        .iter()
        .map(|t| {
            json!({
                "if": { "properties": { "type": { "const": t } }, "required": ["type"] },
                "then": { "required": [t] }
            })
        })
        .collect();
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["metadata", "spec"],
        "additionalProperties": false,
        "properties": {
            "apiVersion": { "type": "string" },
            "kind": { "type": "string" },
            "metadata": {
                "type": "object",
                "required": ["name"],
                "properties": {
                    "name": name_schema(),
                    "namespace": name_schema(),
                    "labels": { "type": "object", "additionalProperties": { "type": "string" } },
                    "annotations": { "type": "object", "additionalProperties": { "type": "string" } }
                }
            },
            "spec": {
                "type": "object",
                "required": ["source", "runtime"],
                "properties": {
                    "source": {
                        "type": "object",
                        "required": ["type"],
                        "properties": {
                            "type": { "type": "string", "enum": source_types },
                            "git": {
                                "type": "object",
                                "required": ["url"],
                                "properties": {
                                    "url": { "type": "string", "pattern": "^(https?://|git@|ssh://)" },
                                    "ref": { "type": "string", "maxLength": 256 },
                                    "path": { "type": "string", "maxLength": 512 },
                                    "secretRef": secret_ref()
                                }
                            },
                            "s3": {
                                "type": "object",
                                "required": ["bucket", "key"],
                                "properties": {
                                    "bucket": { "type": "string", "minLength": 3, "maxLength": 63 },
                                    "key": { "type": "string", "minLength": 1, "maxLength": 1024 },
                                    "region": { "type": "string" },
                                    "secretRef": secret_ref()
                                }
                            },
                            "minio": {
                                "type": "object",
                                "required": ["bucket", "key"],
                                "properties": {
                                    "endpoint": { "type": "string" },
                                    "bucket": { "type": "string", "minLength": 3, "maxLength": 63 },
                                    "key": { "type": "string", "minLength": 1, "maxLength": 1024 },
                                    "secretRef": secret_ref()
                                }
                            },
                            "gcs": {
                                "type": "object",
                                "required": ["bucket", "key"],
                                "properties": {
                                    "bucket": { "type": "string", "minLength": 3, "maxLength": 63 },
                                    "key": { "type": "string", "minLength": 1, "maxLength": 1024 },
                                    "project": { "type": "string" },
                                    "secretRef": secret_ref()
                                }
                            },
                            "github": {
                                "type": "object",
                                "required": ["owner", "repo"],
                                "properties": {
                                    "owner": { "type": "string", "minLength": 1, "maxLength": 39 },
                                    "repo": { "type": "string", "minLength": 1, "maxLength": 100 },
                                    "ref": { "type": "string", "maxLength": 256 },
                                    "path": { "type": "string", "maxLength": 512 },
                                    "secretRef": secret_ref()
                                }
                            },
                            "inline": {
                                "type": "object",
                                "required": ["code"],
                                "properties": {
                                    "code": { "type": "string", "minLength": 1 },
                                    "dependencies": { "type": "string" }
                                }
                            },
                            "image": {
                                "type": "object",
                                "required": ["repository"],
                                "properties": {
                                    "repository": { "type": "string", "minLength": 1 },
                                    "tag": { "type": "string" },
                                    "digest": { "type": "string", "pattern": "^sha256:[a-f0-9]{64}$" },
                                    "port": { "type": "integer", "minimum": 1, "maximum": 65535 }
                                }
                            }
                        },
                        "allOf": requires_variant
                    },
                    "runtime": {
                        "type": "object",
                        "required": ["language"],
                        "properties": {
                            "language": { "type": "string", "enum": ["python", "python3", "nodejs", "node", "javascript", "go", "golang"] },
                            "version": { "type": "string" },
                            "handler": { "type": "string", "maxLength": 100 }
                        }
                    },
                    "build": {
                        "type": "object",
                        "properties": {
                            "forceRebuild": { "type": "boolean" },
                            "timeoutSecs": { "type": "integer", "minimum": 1 }
                        }
                    },
                    "env": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["name"],
                            "properties": { "name": { "type": "string" }, "value": { "type": "string" } }
                        }
                    }
                }
            }
        }
    })
}

/// Delete: the name may instead come from the event subject.
pub fn service_delete() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "properties": {
            "name": name_schema(),
            "namespace": name_schema()
        }
    })
}

pub fn build_command() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "properties": {
            "name": name_schema(),
            "namespace": name_schema(),
            "forceRebuild": { "type": "boolean" },
            "reason": { "type": "string", "maxLength": 1024 }
        }
    })
}

pub fn rollback() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "properties": {
            "name": name_schema(),
            "namespace": name_schema(),
            "revision": { "type": "string", "maxLength": 253 },
            "reason": { "type": "string", "maxLength": 1024 }
        }
    })
}

/// Runtime telemetry. Loose on purpose: malformed telemetry is skipped, not rejected.
pub fn response() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "properties": {
            "functionName": { "type": "string" },
            "namespace": { "type": "string" },
            "invocationId": { "type": "string" },
            "correlationId": { "type": "string" },
            "result": { "type": "object" },
            "error": {
                "type": "object",
                "properties": {
                    "code": { "type": "string" },
                    "message": { "type": "string" },
                    "retryable": { "type": "boolean" }
                }
            },
            "metrics": {
                "type": "object",
                "properties": {
                    "durationMs": { "type": "number", "minimum": 0 },
                    "coldStart": { "type": "boolean" },
                    "memoryUsedMb": { "type": "number", "minimum": 0 }
                }
            }
        }
    })
}

/// Every schema registered by `SchemaRegistry::with_builtin`.
pub fn builtin_schemas() -> Vec<(&'static str, Value)> {
    vec![
        (et::FUNCTION_DEPLOY, function_deploy()),
        (et::SERVICE_CREATE, function_deploy()),
        (et::SERVICE_UPDATE, function_deploy()),
        (et::SERVICE_DELETE, service_delete()),
        (et::BUILD_START, build_command()),
        (et::BUILD_RETRY, build_command()),
        (et::BUILD_CANCEL, build_command()),
        (et::FUNCTION_ROLLBACK, rollback()),
        (et::RESPONSE_SUCCESS, response()),
        (et::RESPONSE_ERROR, response()),
    ]
}
