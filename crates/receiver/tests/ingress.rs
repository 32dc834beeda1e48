#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use lambda_core::{keys, Phase};
use lambda_kubehub::mem::MemoryStore;
use lambda_kubehub::FunctionStore;
use lambda_receiver::{router, Receiver, ReceiverConfig};
use lambda_schema::event_types as et;
use serde_json::{json, Value};
use tower::ServiceExt;

fn receiver(config: ReceiverConfig) -> (Arc<MemoryStore>, Arc<Receiver>, Router) {
    let store = Arc::new(MemoryStore::new());
    let rx = Arc::new(Receiver::new(config, store.clone()).unwrap_or_else(|e| panic!("{e}")));
    (store, rx.clone(), router(rx))
}

fn binary(path: &str, event_type: &str, id: &str, subject: Option<&str>, data: &Value) -> Request<Body> {
    let mut req = Request::builder()
        .method("POST")
        .uri(path)
        .header("ce-specversion", "1.0")
        .header("ce-id", id)
        .header("ce-type", event_type)
        .header("ce-source", "/tests")
        .header("content-type", "application/json");
    if let Some(s) = subject {
        req = req.header("ce-subject", s);
    }
    req.body(Body::from(data.to_string())).unwrap_or_else(|e| panic!("{e}"))
}

fn deploy_payload(name: &str, code: &str) -> Value {
    json!({
        "metadata": {"name": name},
        "spec": {"source": {"type": "inline", "inline": {"code": code}}, "runtime": {"language": "python", "version": "3.11", "handler": "main.handler"}}
    })
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Option<String>, Value) {
    let resp = app.clone().oneshot(req).await.unwrap_or_else(|e| panic!("{e}"));
    let status = resp.status();
    let correlation = resp.headers().get("x-correlation-id").and_then(|v| v.to_str().ok()).map(str::to_string);
    let bytes = resp.into_body().collect().await.unwrap_or_else(|e| panic!("{e}")).to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, correlation, body)
}

#[tokio::test]
async fn repeated_deploy_creates_exactly_one_function() {
    let (store, _, app) = receiver(ReceiverConfig::default());
    let payload = deploy_payload("f1", "def handler(e):\n    return e\n");
    let (status, _, body) = send(&app, binary("/", et::FUNCTION_DEPLOY, "e1", None, &payload)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["eventId"], "e1");
    let (status, _, _) = send(&app, binary("/events", et::FUNCTION_DEPLOY, "e2", None, &payload)).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    assert_eq!(store.len(), 1);
    let f = store.get("knative-lambda", "f1").await.unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(f.annotation(keys::LAST_CLOUDEVENT_ID), Some("e2"));
    assert_eq!(f.generation(), 1);
}

#[tokio::test]
async fn burst_is_admitted_then_limited_with_retry_hint() {
    let config = ReceiverConfig {
        rate_limit_qps: 0.01,
        rate_limit_burst: 3,
        processing_timeout: Duration::from_millis(20),
        ..ReceiverConfig::default()
    };
    let (_, _, app) = receiver(config);
    for i in 0..3 {
        let (status, _, _) = send(&app, binary("/", "com.example.noop", &format!("n{i}"), None, &json!({}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
    let req = binary("/", "com.example.noop", "n3", None, &json!({}));
    let resp = app.clone().oneshot(req).await.unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers().get("retry-after").and_then(|v| v.to_str().ok()), Some("5"));
}

#[tokio::test]
async fn correlation_id_is_echoed_on_every_path() {
    let (_, _, app) = receiver(ReceiverConfig::default());
    let with_id = |mut req: Request<Body>| {
        req.headers_mut().insert("x-correlation-id", axum::http::HeaderValue::from_static("abc"));
        req
    };

    let ok = with_id(binary("/", "com.example.noop", "c1", None, &json!({})));
    let (status, header, body) = send(&app, ok).await;
    assert_eq!((status, header.as_deref(), body["correlationId"].as_str()), (StatusCode::ACCEPTED, Some("abc"), Some("abc")));

    let malformed = with_id(Request::builder().method("POST").uri("/").body(Body::from("{}")).unwrap_or_else(|e| panic!("{e}")));
    let (status, header, body) = send(&app, malformed).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_cloudevent");
    assert_eq!((header.as_deref(), body["correlationId"].as_str()), (Some("abc"), Some("abc")));

    let missing = with_id(binary("/", et::BUILD_START, "c2", Some("ghost"), &json!({})));
    let (status, header, body) = send(&app, missing).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!((header.as_deref(), body["correlationId"].as_str()), (Some("abc"), Some("abc")));

    let (_, generated, body) = send(&app, binary("/", "com.example.noop", "c3", None, &json!({}))).await;
    assert!(generated.as_deref().map(|g| !g.is_empty() && g != "abc").unwrap_or(false));
    assert_eq!(body["correlationId"].as_str(), generated.as_deref());
}

#[tokio::test]
async fn deploy_without_metadata_fails_schema_validation() {
    let (store, rx, app) = receiver(ReceiverConfig::default());
    let payload = json!({"spec": {"source": {"type": "inline", "inline": {"code": "x"}}, "runtime": {"language": "python", "version": "3.11"}}});
    let (status, _, body) = send(&app, binary("/", et::FUNCTION_DEPLOY, "s1", None, &payload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "schema_validation_failed");
    assert_eq!(body["eventType"], et::FUNCTION_DEPLOY);
    assert!(store.is_empty());
    let counters = rx.counters();
    assert_eq!(counters.events_schema_rejected, 1);
    assert_eq!(counters.events_failed, 1);
}

#[tokio::test]
async fn empty_source_type_is_a_validation_error_without_schemas() {
    let (store, _, app) = receiver(ReceiverConfig { schema_validation: false, ..ReceiverConfig::default() });
    let payload = json!({"metadata": {"name": "f1"}, "spec": {"source": {"type": ""}, "runtime": {"language": "python", "version": "3.11"}}});
    let (status, _, body) = send(&app, binary("/", et::FUNCTION_DEPLOY, "v1", None, &payload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_failed");
    assert!(store.is_empty());
}

#[tokio::test]
async fn cancel_outside_a_build_succeeds_without_a_write() {
    let (store, _, app) = receiver(ReceiverConfig::default());
    send(&app, binary("/", et::FUNCTION_DEPLOY, "d1", None, &deploy_payload("f1", "x = 1\n"))).await;
    let mut f = store.get("knative-lambda", "f1").await.unwrap_or_else(|e| panic!("{e}"));
    f.status_mut().phase = Phase::Ready;
    let f = store.update_status(&f).await.unwrap_or_else(|e| panic!("{e}"));
    let version = f.metadata.resource_version.clone();

    let (status, _, _) = send(&app, binary("/", et::BUILD_CANCEL, "x1", Some("f1"), &json!({"reason": "stop"}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let after = store.get("knative-lambda", "f1").await.unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(after.metadata.resource_version, version);
    assert_eq!(after.annotation(keys::CANCEL_REQUESTED), None);
}

#[tokio::test]
async fn cancel_during_a_build_records_the_intent() {
    let (store, _, app) = receiver(ReceiverConfig::default());
    send(&app, binary("/", et::FUNCTION_DEPLOY, "d1", None, &deploy_payload("f1", "x = 1\n"))).await;
    let mut f = store.get("knative-lambda", "f1").await.unwrap_or_else(|e| panic!("{e}"));
    f.status_mut().phase = Phase::Building;
    store.update_status(&f).await.unwrap_or_else(|e| panic!("{e}"));

    let (status, _, _) = send(&app, binary("/", et::BUILD_CANCEL, "x1", None, &json!({"name": "f1", "reason": "stop"}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let after = store.get("knative-lambda", "f1").await.unwrap_or_else(|e| panic!("{e}"));
    assert!(after.annotation(keys::CANCEL_REQUESTED).is_some());
    assert_eq!(after.annotation(keys::CANCEL_REASON), Some("stop"));
    assert_eq!(after.phase(), Phase::Building);
}

#[tokio::test]
async fn structured_mode_and_health_endpoints() {
    let (_, rx, app) = receiver(ReceiverConfig::default());
    let event = json!({
        "specversion": "1.0", "id": "r1", "type": et::RESPONSE_ERROR, "source": "/fn/f1", "subject": "f1",
        "data": {"namespace": "fns", "error": {"code": "ModuleNotFound"}, "metrics": {"durationMs": 40, "coldStart": true}}
    });
    let req = Request::builder()
        .method("POST")
        .uri("/")
        .header("content-type", "application/cloudevents+json")
        .body(Body::from(event.to_string()))
        .unwrap_or_else(|e| panic!("{e}"));
    let (status, _, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let get = |uri: &str| Request::builder().uri(uri).body(Body::empty()).unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(send(&app, get("/health")).await.2, Value::String("ok".into()));
    assert_eq!(send(&app, get("/ready")).await.2, Value::String("ready".into()));
    let (_, _, metrics) = send(&app, get("/metrics")).await;
    assert_eq!(metrics["events_received"], 1);
    assert_eq!(metrics["events_processed"], 1);
    assert_eq!(metrics["events_schema_rejected"], 0);
    assert_eq!(rx.counters().events_failed, 0);

    let (status, correlation, body) = send(&app, get("/")).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert!(correlation.is_some_and(|c| !c.is_empty()));
    assert_eq!(body["error"], "method_not_allowed");
}

#[tokio::test]
async fn oversized_and_misrouted_requests_are_counted_and_correlated() {
    let config = ReceiverConfig { max_event_bytes: 64, ..ReceiverConfig::default() };
    let (_, rx, app) = receiver(config);

    let mut big = binary("/", "com.example.noop", "big-1", None, &json!({"pad": "x".repeat(256)}));
    big.headers_mut().insert("x-correlation-id", "corr-413".parse().unwrap_or_else(|e| panic!("{e}")));
    let (status, correlation, body) = send(&app, big).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(correlation.as_deref(), Some("corr-413"));
    assert_eq!(body["error"], "payload_too_large");
    assert_eq!(body["correlationId"], "corr-413");

    let put = Request::builder()
        .method("PUT")
        .uri("/events")
        .header("x-correlation-id", "corr-405")
        .body(Body::from("{}"))
        .unwrap_or_else(|e| panic!("{e}"));
    let (status, correlation, body) = send(&app, put).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(correlation.as_deref(), Some("corr-405"));
    assert_eq!(body["correlationId"], "corr-405");

    let small = binary("/", "com.example.noop", "ok-1", None, &json!({}));
    assert_eq!(send(&app, small).await.0, StatusCode::ACCEPTED);

    let c = rx.counters();
    assert_eq!(c.events_received, 3);
    assert_eq!(c.events_failed, 2);
    assert_eq!(c.events_processed, 1);
}

#[tokio::test]
async fn concurrent_requests_are_all_counted() {
    let (_, rx, app) = receiver(ReceiverConfig::default());
    let mut tasks = Vec::new();
    for i in 0..20 {
        let app = app.clone();
        tasks.push(tokio::spawn(async move {
            for j in 0..5 {
                let req = binary("/", "com.example.noop", &format!("{i}-{j}"), None, &json!({}));
                let resp = app.clone().oneshot(req).await.unwrap_or_else(|e| panic!("{e}"));
                assert_eq!(resp.status(), StatusCode::ACCEPTED);
            }
        }));
    }
    for t in tasks {
        t.await.unwrap_or_else(|e| panic!("{e}"));
    }
    let c = rx.counters();
    assert_eq!(c.events_received, 100);
    assert_eq!(c.events_processed, 100);
}
