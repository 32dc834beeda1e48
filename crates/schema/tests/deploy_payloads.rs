#![forbid(unsafe_code)]

use lambda_schema::{event_types, SchemaRegistry};
use serde_json::json;

fn registry() -> SchemaRegistry {
    SchemaRegistry::with_builtin().unwrap_or_else(|e| panic!("{e}"))
}

fn inline_deploy(name: &str) -> serde_json::Value {
    json!({
        "metadata": { "name": name, "namespace": "knative-lambda" },
        "spec": {
            "source": { "type": "inline", "inline": { "code": "def handler(event):\n    return event" } },
            "runtime": { "language": "python", "version": "3.11", "handler": "main.handler" }
        }
    })
}

#[test]
fn valid_inline_deploy_passes() {
    let reg = registry();
    assert!(reg.validate("e1", event_types::FUNCTION_DEPLOY, &inline_deploy("f1")).is_ok());
    assert!(reg.validate("e1", event_types::SERVICE_UPDATE, &inline_deploy("f1")).is_ok());
}

#[test]
fn missing_metadata_is_rejected() {
    let reg = registry();
    let mut payload = inline_deploy("f1");
    payload.as_object_mut().map(|o| o.remove("metadata"));
    let err = reg.validate("e2", event_types::FUNCTION_DEPLOY, &payload).err();
    let err = err.unwrap_or_else(|| panic!("expected rejection"));
    assert!(err.errors.iter().any(|e| e.contains("metadata")));
}

#[test]
fn invalid_names_and_unknown_top_level_keys_are_rejected() {
    let reg = registry();
    assert!(reg.validate("e3", event_types::FUNCTION_DEPLOY, &inline_deploy("Bad_Name")).is_err());
    let long = "a".repeat(64);
    assert!(reg.validate("e3", event_types::FUNCTION_DEPLOY, &inline_deploy(&long)).is_err());
    let mut payload = inline_deploy("f1");
    payload["status"] = json!({ "phase": "Ready" });
    assert!(reg.validate("e3", event_types::FUNCTION_DEPLOY, &payload).is_err());
}

#[test]
fn source_type_must_have_matching_variant() {
    let reg = registry();
    let mut payload = inline_deploy("f1");
    payload["spec"]["source"] = json!({ "type": "git", "inline": { "code": "x" } });
    assert!(reg.validate("e4", event_types::FUNCTION_DEPLOY, &payload).is_err());
    payload["spec"]["source"] = json!({ "type": "ftp" });
    assert!(reg.validate("e4", event_types::FUNCTION_DEPLOY, &payload).is_err());
}

#[test]
fn git_url_scheme_is_constrained() {
    let reg = registry();
    let mut payload = inline_deploy("f1");
    payload["spec"]["source"] = json!({ "type": "git", "git": { "url": "file:///etc/passwd" } });
    assert!(reg.validate("e5", event_types::FUNCTION_DEPLOY, &payload).is_err());
    payload["spec"]["source"] = json!({ "type": "git", "git": { "url": "https://github.com/acme/fn.git", "ref": "main" } });
    assert!(reg.validate("e5", event_types::FUNCTION_DEPLOY, &payload).is_ok());
}

#[test]
fn command_payloads_allow_subject_addressing() {
    let reg = registry();
    assert!(reg.validate("e6", event_types::BUILD_START, &json!({ "forceRebuild": true })).is_ok());
    assert!(reg.validate("e6", event_types::BUILD_CANCEL, &json!({ "reason": "superseded" })).is_ok());
    assert!(reg.validate("e6", event_types::SERVICE_DELETE, &json!({})).is_ok());
    assert!(reg.validate("e6", event_types::BUILD_START, &json!({ "forceRebuild": "yes" })).is_err());
    assert!(reg.validate("e6", event_types::FUNCTION_ROLLBACK, &json!({ "name": "f1", "revision": "f1-00002" })).is_ok());
}

#[test]
fn response_metrics_must_be_non_negative() {
    let reg = registry();
    let ok = json!({ "functionName": "f1", "metrics": { "durationMs": 12.5, "coldStart": true } });
    assert!(reg.validate("e7", event_types::RESPONSE_SUCCESS, &ok).is_ok());
    let bad = json!({ "functionName": "f1", "metrics": { "durationMs": -1 } });
    assert!(reg.validate("e7", event_types::RESPONSE_SUCCESS, &bad).is_err());
}
