//! Knative `Service` manifest for a built function.

use kube::{Resource, ResourceExt};
use lambda_core::{keys, LambdaFunction, SourceSpec, MANAGER};
use serde_json::{json, Map, Value};

pub const DEFAULT_PORT: i32 = 8080;
pub const DEFAULT_CONCURRENCY: i32 = 10;
pub const DEFAULT_MIN_SCALE: i32 = 0;
pub const DEFAULT_MAX_SCALE: i32 = 50;

const DEFAULT_REQUESTS: [(&str, &str); 2] = [("cpu", "50m"), ("memory", "64Mi")];
const DEFAULT_LIMITS: [(&str, &str); 2] = [("cpu", "100m"), ("memory", "128Mi")];

fn string_map<'a>(pairs: impl IntoIterator<Item = (&'a str, String)>) -> Value {
    Value::Object(pairs.into_iter().map(|(k, v)| (k.to_string(), Value::String(v))).collect::<Map<_, _>>())
}

fn resource_list(defaults: [(&str, &str); 2], overrides: Option<&std::collections::BTreeMap<String, String>>) -> Value {
    let mut out: Map<String, Value> = defaults.iter().map(|(k, v)| (k.to_string(), Value::from(*v))).collect();
    for (k, v) in overrides.into_iter().flatten().filter(|(_, v)| !v.is_empty()) {
        out.insert(k.clone(), Value::from(v.as_str()));
    }
    Value::Object(out)
}

/// Full manifest, server-side applied on every deploy.
pub fn service_manifest(f: &LambdaFunction, image_uri: &str, service_account: Option<&str>) -> Value {
    let name = f.name_any();
    let prebuilt = match &f.spec.source {
        SourceSpec::Image { image } => Some(image),
        _ => None,
    };

    let scaling = f.spec.scaling.clone().unwrap_or_default();
    let target = scaling.target_concurrency.filter(|t| *t > 0).unwrap_or(DEFAULT_CONCURRENCY);
    let min_scale = scaling.min_replicas.filter(|m| *m >= 0).unwrap_or(DEFAULT_MIN_SCALE);
    let max_scale = scaling.max_replicas.filter(|m| *m > 0).unwrap_or(DEFAULT_MAX_SCALE).max(min_scale);

    let mut env = Vec::new();
    // Pre-built images bring their own entrypoint.
    if prebuilt.is_none() {
        if let Some(h) = f.spec.runtime.handler.as_deref().filter(|h| !h.is_empty()) {
            env.push(json!({"name": "HANDLER", "value": h}));
        }
    }
    env.extend(f.spec.env.iter().filter(|e| !e.name.is_empty() && e.name != "PORT").map(|e| json!({"name": e.name, "value": e.value})));

    let port = prebuilt.and_then(|i| i.port).filter(|p| (1..=65535).contains(p)).unwrap_or(DEFAULT_PORT);
    let pull_policy = prebuilt
        .and_then(|i| i.pull_policy.clone())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| if prebuilt.is_some() { "IfNotPresent" } else { "Always" }.to_string());
    let resources = f.spec.resources.as_ref();

    let mut container = json!({
        "image": image_uri,
        "imagePullPolicy": pull_policy,
        "ports": [{"containerPort": port, "protocol": "TCP"}],
        "env": env,
        "resources": {
            "requests": resource_list(DEFAULT_REQUESTS, resources.map(|r| &r.requests)),
            "limits": resource_list(DEFAULT_LIMITS, resources.map(|r| &r.limits)),
        },
        "readinessProbe": {"httpGet": {"path": "/health", "port": port}, "initialDelaySeconds": 5, "periodSeconds": 10},
    });
    if let Some(image) = prebuilt {
        if !image.command.is_empty() {
            container["command"] = json!(image.command);
        }
        if !image.args.is_empty() {
            container["args"] = json!(image.args);
        }
    }

    let mut pod = json!({
        "containerConcurrency": target,
        "automountServiceAccountToken": false,
        "containers": [container],
    });
    if let Some(sa) = service_account.filter(|s| !s.is_empty()) {
        pod["serviceAccountName"] = json!(sa);
    }

    let owner = f.controller_owner_ref(&()).map(|o| {
        json!([{
            "apiVersion": o.api_version, "kind": o.kind, "name": o.name, "uid": o.uid,
            "controller": true, "blockOwnerDeletion": true,
        }])
    });

    let mut manifest = json!({
        "apiVersion": "serving.knative.dev/v1",
        "kind": "Service",
        "metadata": {
            "name": name,
            "namespace": f.namespace(),
            "labels": string_map([
                (keys::MANAGED_BY, MANAGER.to_string()),
                (keys::NAME_LABEL, name.clone()),
                ("app.kubernetes.io/name", name.clone()),
                ("app.kubernetes.io/component", "lambda".to_string()),
            ]),
            "annotations": string_map([
                ("lambda.knative.io/runtime", f.spec.runtime.language.clone()),
                ("lambda.knative.io/version", f.spec.runtime.version.clone()),
            ]),
        },
        "spec": {
            "template": {
                "metadata": {
                    "annotations": string_map([
                        ("autoscaling.knative.dev/class", "kpa.autoscaling.knative.dev".to_string()),
                        ("autoscaling.knative.dev/metric", "concurrency".to_string()),
                        ("autoscaling.knative.dev/target", target.to_string()),
                        ("autoscaling.knative.dev/min-scale", min_scale.to_string()),
                        ("autoscaling.knative.dev/max-scale", max_scale.to_string()),
                    ]),
                },
                "spec": pod,
            },
        },
    });
    if let Some(owner) = owner {
        manifest["metadata"]["ownerReferences"] = owner;
    }
    manifest
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(source: Value, extra: Value) -> LambdaFunction {
        let mut spec = json!({"source": source, "runtime": {"language": "python", "version": "3.11", "handler": "main.handler"}});
        if let (Some(s), Some(e)) = (spec.as_object_mut(), extra.as_object()) {
            for (k, v) in e {
                s.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(json!({
            "apiVersion": "lambda.knative.io/v1alpha1",
            "kind": "LambdaFunction",
            "metadata": {"name": "hello", "namespace": "fns", "uid": "6f1d2c8e-0000-4000-8000-000000000001"},
            "spec": spec,
        }))
        .unwrap_or_else(|e| panic!("{e}"))
    }

    #[test]
    fn built_function_gets_handler_defaults_and_owner() {
        let f = function(
            json!({"type": "inline", "inline": {"code": "def handler(e):\n    return e\n"}}),
            json!({"env": [{"name": "LOG_LEVEL", "value": "debug"}, {"name": "PORT", "value": "1"}]}),
        );
        let m = service_manifest(&f, "localhost:5001/fns/hello:abc", None);
        let container = &m["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], "localhost:5001/fns/hello:abc");
        assert_eq!(container["imagePullPolicy"], "Always");
        assert_eq!(container["env"][0], json!({"name": "HANDLER", "value": "main.handler"}));
        assert_eq!(container["env"].as_array().map(Vec::len), Some(2));
        assert_eq!(container["resources"]["limits"]["memory"], "128Mi");
        assert_eq!(m["spec"]["template"]["spec"]["automountServiceAccountToken"], false);
        assert_eq!(m["spec"]["template"]["metadata"]["annotations"]["autoscaling.knative.dev/max-scale"], "50");
        assert_eq!(m["metadata"]["ownerReferences"][0]["kind"], "LambdaFunction");
    }

    #[test]
    fn prebuilt_image_keeps_its_entrypoint_and_port() {
        let f = function(
            json!({"type": "image", "image": {"repository": "ghcr.io/acme/api", "tag": "v1", "port": 9000, "command": ["/app"], "args": ["--serve"]}}),
            json!({"scaling": {"minReplicas": 1, "maxReplicas": 3, "targetConcurrency": 5}, "resources": {"limits": {"memory": "512Mi"}}}),
        );
        let m = service_manifest(&f, "ghcr.io/acme/api:v1", Some("knative-lambda-function"));
        let pod = &m["spec"]["template"]["spec"];
        let container = &pod["containers"][0];
        assert_eq!(container["ports"][0]["containerPort"], 9000);
        assert_eq!(container["imagePullPolicy"], "IfNotPresent");
        assert_eq!(container["command"], json!(["/app"]));
        assert!(container["env"].as_array().map(|e| e.is_empty()).unwrap_or(false));
        assert_eq!(container["resources"]["limits"]["memory"], "512Mi");
        assert_eq!(container["resources"]["limits"]["cpu"], "100m");
        assert_eq!(pod["containerConcurrency"], 5);
        assert_eq!(pod["serviceAccountName"], "knative-lambda-function");
        assert_eq!(m["spec"]["template"]["metadata"]["annotations"]["autoscaling.knative.dev/min-scale"], "1");
    }
}
