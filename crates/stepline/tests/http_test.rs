//! HttpStepFunctions against a local mock of the JSON API
//!
//! Run with: cargo test -p stepline --test http_test

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use serde_json::{json, Value};

use stepline::config::{AwsConfig, Credentials};
use stepline::service::{HttpStepFunctions, ServiceError, StepFunctions};

#[derive(Debug, Clone)]
struct Recorded {
    target: String,
    authorization: String,
    body: Value,
}

#[derive(Default)]
struct MockState {
    requests: Mutex<Vec<Recorded>>,
}

async fn handle(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, String) {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let target = header("x-amz-target");
    let body: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    state.requests.lock().push(Recorded {
        target: target.clone(),
        authorization: header("authorization"),
        body: body.clone(),
    });

    let ok = |value: Value| (StatusCode::OK, value.to_string());
    let fail = |code: &str, message: &str| {
        (
            StatusCode::BAD_REQUEST,
            json!({"__type": format!("com.amazonaws.swf.service.v2.model#{code}"), "message": message})
                .to_string(),
        )
    };

    match target.trim_start_matches("AWSStepFunctions.") {
        "GetActivityTask" if body["workerName"] == "slow" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ok(json!({}))
        }
        "GetActivityTask" if body["workerName"] == "idle" => ok(json!({})),
        "GetActivityTask" => ok(json!({"taskToken": "tok-1", "input": "{\"x\":7}"})),
        "SendTaskHeartbeat" if body["taskToken"] == "expired" => {
            fail("TaskTimedOut", "Task Timed Out")
        }
        "SendTaskHeartbeat" | "SendTaskSuccess" | "SendTaskFailure" | "DeleteActivity" => {
            ok(json!({}))
        }
        "CreateActivity" => ok(json!({
            "activityArn": format!("arn:aws:states:us-east-1:123456789012:activity:{}", body["name"].as_str().unwrap_or_default()),
            "creationDate": 1700000000.5,
        })),
        "ListActivities" if body.get("nextToken").is_none() => ok(json!({
            "activities": [{
                "activityArn": "arn:aws:states:us-east-1:123456789012:activity:a",
                "name": "a",
                "creationDate": 1700000000.0,
            }],
            "nextToken": "page-2",
        })),
        "ListActivities" => ok(json!({
            "activities": [{
                "activityArn": "arn:aws:states:us-east-1:123456789012:activity:b",
                "name": "b",
                "creationDate": 1700000001.0,
            }],
        })),
        _ => fail("UnknownOperationException", "unknown operation"),
    }
}

async fn serve() -> (SocketAddr, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    let app = Router::new()
        .route("/", post(handle))
        .with_state(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

fn client(addr: SocketAddr) -> HttpStepFunctions {
    let config = AwsConfig::new("us-east-1")
        .with_credentials(Credentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            session_token: None,
        })
        .with_endpoint(format!("http://{addr}/"));
    HttpStepFunctions::new(config).unwrap()
}

#[test_log::test(tokio::test)]
async fn test_get_activity_task_parses_input() {
    let (addr, state) = serve().await;
    let client = client(addr);

    let task = client
        .get_activity_task("arn:aws:states:us-east-1:123456789012:activity:a", "w-1")
        .await
        .unwrap()
        .expect("task");

    assert_eq!(task.task_token, "tok-1");
    assert_eq!(task.input, json!({"x": 7}));

    let requests = state.requests.lock().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].target, "AWSStepFunctions.GetActivityTask");
    assert_eq!(requests[0].body["workerName"], "w-1");
    assert!(requests[0]
        .authorization
        .starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
    assert!(requests[0].authorization.contains("/us-east-1/states/aws4_request"));
}

#[test_log::test(tokio::test)]
async fn test_empty_poll_is_none() {
    let (addr, _state) = serve().await;
    let task = client(addr)
        .get_activity_task("arn:aws:states:us-east-1:123456789012:activity:a", "idle")
        .await
        .unwrap();
    assert!(task.is_none());
}

#[test_log::test(tokio::test)]
async fn test_poll_request_timeout() {
    let (addr, _state) = serve().await;
    let client = client(addr).with_poll_timeout(Duration::from_millis(200));

    let err = client
        .get_activity_task("arn:aws:states:us-east-1:123456789012:activity:a", "slow")
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {err:?}");
}

#[test_log::test(tokio::test)]
async fn test_heartbeat_timed_out_maps_error() {
    let (addr, _state) = serve().await;
    let client = client(addr);

    client.send_task_heartbeat("tok-1").await.unwrap();
    let err = client.send_task_heartbeat("expired").await.unwrap_err();
    assert!(matches!(err, ServiceError::TaskTimedOut(ref m) if m == "Task Timed Out"));
}

#[test_log::test(tokio::test)]
async fn test_reports_send_expected_bodies() {
    let (addr, state) = serve().await;
    let client = client(addr);

    client.send_task_success("tok-1", r#"{"result":7}"#).await.unwrap();
    client
        .send_task_failure("tok-2", "ValueError", "bad input")
        .await
        .unwrap();

    let requests = state.requests.lock().clone();
    assert_eq!(requests[0].target, "AWSStepFunctions.SendTaskSuccess");
    assert_eq!(
        requests[0].body,
        json!({"taskToken": "tok-1", "output": "{\"result\":7}"})
    );
    assert_eq!(requests[1].target, "AWSStepFunctions.SendTaskFailure");
    assert_eq!(
        requests[1].body,
        json!({"taskToken": "tok-2", "error": "ValueError", "cause": "bad input"})
    );
}

#[test_log::test(tokio::test)]
async fn test_list_activities_follows_pages() {
    let (addr, state) = serve().await;
    let activities = client(addr).list_activities().await.unwrap();

    let names: Vec<&str> = activities.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);
    assert_eq!(activities[1].creation_date.timestamp(), 1_700_000_001);

    let requests = state.requests.lock().clone();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].body, json!({"nextToken": "page-2"}));
}

#[test_log::test(tokio::test)]
async fn test_create_activity() {
    let (addr, _state) = serve().await;
    let created = client(addr).create_activity("resize").await.unwrap();

    assert_eq!(
        created.activity_arn,
        "arn:aws:states:us-east-1:123456789012:activity:resize"
    );
    assert_eq!(created.creation_date.timestamp_millis(), 1_700_000_000_500);
}
