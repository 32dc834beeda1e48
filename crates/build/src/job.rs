//! Kubernetes objects for one build: the context ConfigMap and the Kaniko Job.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, PodSpec, PodTemplateSpec, ResourceRequirements,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};
use lambda_core::{keys, LambdaFunction, MANAGER};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{BuildConfig, BuildContext, ComputeResources, JobState};

pub const CONTEXT_SUFFIX: &str = "-build-context";
const MAX_ERROR_LEN: usize = 256;

pub fn context_name(function: &str) -> String {
    format!("{function}{CONTEXT_SUFFIX}")
}

/// `<name>-build-<unix>`, with the name cut so the whole stays a valid label value.
pub fn job_name(function: &str, unix: i64) -> String {
    let suffix = format!("-build-{unix}");
    let keep = 63usize.saturating_sub(suffix.len()).min(function.len());
    format!("{}{suffix}", function[..keep].trim_end_matches('-'))
}

/// Where Kaniko pushes and where kubelet pulls the same image from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTarget {
    pub push: String,
    pub pull: String,
}

impl ImageTarget {
    pub fn for_function(f: &LambdaFunction, tag: &str, config: &BuildConfig) -> Self {
        let ns = f.namespace().unwrap_or_default();
        let build = f.spec.build.as_ref();
        let repo = build
            .and_then(|b| b.repository.as_deref())
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{ns}/{}", f.name_any()));
        let tag = build.and_then(|b| b.tag.as_deref()).filter(|t| !t.is_empty()).unwrap_or(tag);
        match build.and_then(|b| b.registry.as_deref()).filter(|r| !r.is_empty()) {
            // An explicit registry is used for both sides.
            Some(reg) => {
                let uri = format!("{}/{repo}:{tag}", reg.trim_end_matches('/'));
                Self { push: uri.clone(), pull: uri }
            }
            None => Self {
                push: format!("{}/{repo}:{tag}", config.push_registry.trim_end_matches('/')),
                pull: format!("{}/{repo}:{tag}", config.pull_registry.trim_end_matches('/')),
            },
        }
    }
}

fn labels(function: &str, build: bool) -> BTreeMap<String, String> {
    let mut l = BTreeMap::from([
        (keys::MANAGED_BY.to_string(), MANAGER.to_string()),
        (keys::NAME_LABEL.to_string(), function.to_string()),
    ]);
    if build {
        l.insert(keys::BUILD_LABEL.to_string(), "true".to_string());
    }
    l
}

fn owned_meta(f: &LambdaFunction, name: String, build: bool) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: f.namespace(),
        labels: Some(labels(&f.name_any(), build)),
        owner_references: f.controller_owner_ref(&()).map(|o| vec![o]),
        ..Default::default()
    }
}

/// One key per context file. Text goes to `data`, anything else to `binaryData`.
pub fn context_config_map(f: &LambdaFunction, ctx: &BuildContext) -> ConfigMap {
    let mut data = BTreeMap::new();
    let mut binary = BTreeMap::new();
    for (name, bytes) in &ctx.files {
        match std::str::from_utf8(bytes) {
            Ok(text) => {
                data.insert(name.clone(), text.to_string());
            }
            Err(_) => {
                binary.insert(name.clone(), ByteString(bytes.clone()));
            }
        }
    }
    ConfigMap {
        metadata: owned_meta(f, context_name(&f.name_any()), false),
        data: (!data.is_empty()).then_some(data),
        binary_data: (!binary.is_empty()).then_some(binary),
        ..Default::default()
    }
}

fn resources(requests: &ComputeResources, limits: &ComputeResources) -> ResourceRequirements {
    let list = |r: &ComputeResources| {
        BTreeMap::from([("cpu".to_string(), Quantity(r.cpu.clone())), ("memory".to_string(), Quantity(r.memory.clone()))])
    };
    ResourceRequirements { requests: Some(list(requests)), limits: Some(list(limits)), ..Default::default() }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount { name: name.to_string(), mount_path: path.to_string(), ..Default::default() }
}

/// The Kaniko job. Runs without a service-account token and with bounded CPU and memory.
pub fn kaniko_job(f: &LambdaFunction, ctx: &BuildContext, job_name: &str, target: &ImageTarget, config: &BuildConfig) -> Job {
    let mut meta = owned_meta(f, job_name.to_string(), true);
    meta.annotations = Some(BTreeMap::from([
        (keys::IMAGE_URI.to_string(), target.pull.clone()),
        (keys::CONTENT_HASH.to_string(), ctx.content_hash.clone()),
    ]));
    let build = f.spec.build.as_ref();
    let mut args = vec![
        "--dockerfile=/workspace/Dockerfile".to_string(),
        "--context=dir:///workspace".to_string(),
        format!("--destination={}", target.push),
        "--cache=false".to_string(),
    ];
    if config.insecure_registry || build.map(|b| b.insecure).unwrap_or(false) {
        args.extend(["--insecure", "--insecure-pull", "--skip-tls-verify"].map(String::from));
    }
    let deadline = build.and_then(|b| b.timeout_secs).filter(|t| *t > 0).unwrap_or(config.deadline_secs);

    let init = Container {
        name: "extract-context".to_string(),
        image: Some(config.init_image.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        args: Some(vec!["cp -L /build-context/* /workspace/ && ls -la /workspace".to_string()]),
        resources: Some(resources(&config.init_requests, &config.init_limits)),
        volume_mounts: Some(vec![mount("build-context", "/build-context"), mount("workspace", "/workspace")]),
        security_context: Some(SecurityContext { allow_privilege_escalation: Some(false), ..Default::default() }),
        ..Default::default()
    };
    let kaniko = Container {
        name: "kaniko".to_string(),
        image: Some(config.kaniko_image.clone()),
        args: Some(args),
        resources: Some(resources(&config.kaniko_requests, &config.kaniko_limits)),
        volume_mounts: Some(vec![mount("workspace", "/workspace")]),
        ..Default::default()
    };
    let volumes = vec![
        Volume {
            name: "build-context".to_string(),
            config_map: Some(ConfigMapVolumeSource { name: Some(context_name(&f.name_any())), ..Default::default() }),
            ..Default::default()
        },
        Volume { name: "workspace".to_string(), empty_dir: Some(EmptyDirVolumeSource::default()), ..Default::default() },
    ];

    Job {
        metadata: meta,
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(config.ttl_secs),
            active_deadline_seconds: Some(deadline),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels(&f.name_any(), true)), ..Default::default() }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    automount_service_account_token: Some(false),
                    service_account_name: Some(config.service_account.clone()),
                    init_containers: Some(vec![init]),
                    containers: vec![kaniko],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Terminal state from the job's conditions; anything else is still running.
pub fn job_state(job: &Job) -> JobState {
    let conditions = job.status.as_ref().and_then(|s| s.conditions.as_ref());
    for c in conditions.into_iter().flatten() {
        if c.status != "True" {
            continue;
        }
        match c.type_.as_str() {
            "Complete" => return JobState::Succeeded,
            "Failed" => {
                let msg = c.message.as_deref().filter(|m| !m.is_empty()).or(c.reason.as_deref()).unwrap_or("Build job failed");
                return JobState::Failed(sanitize_error(msg));
            }
            _ => {}
        }
    }
    if job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0) > 0 {
        return JobState::Succeeded;
    }
    JobState::Running
}

static SECRET_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(authorization:\s*)(basic|bearer)\s+\S+",
        r"(?i)\b(token|password|passwd|secret|api[_-]?key|access[_-]?key)(\s*[=:]\s*)\S+",
        r"://[^/\s:@]+:[^@\s]+@",
        r"\b(ghp|gho|ghs|ghu|github_pat)_[A-Za-z0-9_]{10,}",
        r"\bAKIA[0-9A-Z]{16}\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

/// First line only, control characters removed, credentials redacted, at most 256 chars.
pub fn sanitize_error(raw: &str) -> String {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let mut out: String = line.chars().filter(|c| !c.is_control()).collect();
    for (i, re) in SECRET_RES.iter().enumerate() {
        let replacement = match i {
            0 => "${1}${2} [REDACTED]",
            1 => "${1}${2}[REDACTED]",
            2 => "://[REDACTED]@",
            _ => "[REDACTED]",
        };
        out = re.replace_all(&out, replacement).into_owned();
    }
    if out.chars().count() > MAX_ERROR_LEN {
        out = out.chars().take(MAX_ERROR_LEN - 3).collect::<String>() + "...";
    }
    if out.is_empty() {
        "Build job failed".to_string()
    } else {
        out
    }
}
