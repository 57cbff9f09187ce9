//! Integration tests for the API server.

use std::sync::OnceLock;
use std::time::Duration;

use api::SagaRuntime;
use api::config::Config;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use metrics_exporter_prometheus::PrometheusHandle;
use saga_store::{InMemoryIdempotencyTracker, InMemorySagaStore};
use serde_json::{Value, json};
use tokio::sync::watch;
use tower::ServiceExt;

type TestRuntime = SagaRuntime<InMemorySagaStore, InMemoryIdempotencyTracker>;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            api::routes::metrics::recorder_builder()
                .unwrap()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn setup() -> (axum::Router, TestRuntime) {
    let runtime = SagaRuntime::new(
        &Config::default(),
        "memory",
        std::sync::Arc::new(InMemorySagaStore::new()),
        |_| InMemoryIdempotencyTracker::new(),
    )
    .unwrap();
    let app = api::create_app(runtime.state(), get_metrics_handle());
    (app, runtime)
}

async fn send(app: &axum::Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn get(app: &axum::Router, uri: &str) -> Response {
    send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

async fn start(app: &axum::Router, body: Value) -> Response {
    send(
        app,
        Request::builder()
            .method("POST")
            .uri("/api/sagas/start")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
    )
    .await
}

async fn json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn account_request(reference_id: &str) -> Value {
    json!({
        "sagaType": "ACCOUNT_CREATION",
        "referenceId": reference_id,
        "payload": {
            "userId": "u-1",
            "username": "alice",
            "fullName": "Alice Liddell",
            "accountType": "SAVINGS",
            "initialBalance": 50.0
        }
    })
}

#[tokio::test]
async fn test_health_check() {
    let (app, _runtime) = setup();

    let response = get(&app, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["backend"], "memory");
    assert_eq!(json["deadLetters"], 0);
}

#[tokio::test]
async fn test_start_saga_returns_created() {
    let (app, _runtime) = setup();

    let response = start(&app, account_request("ref-1")).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let json = json_body(response).await;
    let saga_id = json["sagaId"].as_str().unwrap().to_string();

    // No consumers are running, so the saga waits on its first step.
    let saga = json_body(get(&app, &format!("/api/sagas/{saga_id}")).await).await;
    assert_eq!(saga["state"], "INITIATED");
    assert_eq!(saga["currentStep"], "create_account");
    assert_eq!(saga["referenceId"], "ref-1");
    assert_eq!(saga["payload"]["username"], "alice");
    assert_eq!(saga["unpublished"], 0);
}

#[tokio::test]
async fn test_string_payload_is_used_verbatim() {
    let (app, runtime) = setup();

    let raw = r#"{"userId":"u-2","username":"bob","fullName":"Bob","accountType":"CHECKING"}"#;
    let response = start(
        &app,
        json!({ "sagaType": "ACCOUNT_CREATION", "referenceId": "ref-2", "payload": raw }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let published = runtime.bus.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].payload, raw.as_bytes());
}

#[tokio::test]
async fn test_duplicate_reference_conflicts() {
    let (app, _runtime) = setup();

    let first = start(&app, account_request("ref-1")).await;
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = start(&app, account_request("ref-1")).await;
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let json = json_body(second).await;
    assert!(json["error"].as_str().unwrap().contains("ref-1"));
}

#[tokio::test]
async fn test_unknown_saga_type_is_bad_request() {
    let (app, _runtime) = setup();

    let response = start(
        &app,
        json!({ "sagaType": "LOAN_APPROVAL", "referenceId": "r", "payload": {} }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_blank_reference_is_bad_request() {
    let (app, _runtime) = setup();

    let response = start(&app, account_request("  ")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_saga_errors() {
    let (app, _runtime) = setup();

    let response = get(&app, "/api/sagas/not-a-uuid").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let unknown = common::SagaId::new();
    let response = get(&app, &format!("/api/sagas/{unknown}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = get(&app, &format!("/api/sagas/{unknown}/history")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_filters_by_type_and_state() {
    let (app, _runtime) = setup();

    start(&app, account_request("ref-1")).await;
    start(&app, account_request("ref-2")).await;

    let all = json_body(get(&app, "/api/sagas?sagaType=ACCOUNT_CREATION").await).await;
    assert_eq!(all.as_array().unwrap().len(), 2);

    let page = json_body(get(&app, "/api/sagas?state=INITIATED&limit=1").await).await;
    assert_eq!(page.as_array().unwrap().len(), 1);

    let none = json_body(get(&app, "/api/sagas?sagaType=PAYMENT_TRANSFER").await).await;
    assert!(none.as_array().unwrap().is_empty());

    let response = get(&app, "/api/sagas?state=SLEEPING").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_saga_runs_to_completion() {
    let (app, runtime) = setup();
    let (shutdown, shutdown_rx) = watch::channel(false);
    runtime.spawn(shutdown_rx).await;

    let json = json_body(start(&app, account_request("ref-1")).await).await;
    let saga_id = json["sagaId"].as_str().unwrap().to_string();

    let mut state = Value::Null;
    for _ in 0..400 {
        let saga = json_body(get(&app, &format!("/api/sagas/{saga_id}")).await).await;
        state = saga["state"].clone();
        if state == "COMPLETED" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(state, "COMPLETED");
    assert_eq!(runtime.accounts.active_count(), 1);

    let history = json_body(get(&app, &format!("/api/sagas/{saga_id}/history")).await).await;
    let events: Vec<&str> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["eventType"].as_str().unwrap())
        .collect();
    assert_eq!(events, vec!["START", "STEP_COMPLETED", "COMPLETED"]);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_dead_letters_endpoint() {
    let (app, runtime) = setup();

    runtime
        .dead_letters
        .push(event_bus::DeadLetter::rejected(
            b"garbage".to_vec(),
            "account-service",
            "Malformed payload",
        ))
        .await;

    let letters = json_body(get(&app, "/api/dead-letters").await).await;
    assert_eq!(letters[0]["consumerGroup"], "account-service");
    assert_eq!(letters[0]["payload"], "garbage");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, _runtime) = setup();

    start(&app, account_request("ref-metrics")).await;

    let response = get(&app, "/metrics").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("saga_started_total"));
    assert!(text.contains("saga_start_requests_total"));
}
