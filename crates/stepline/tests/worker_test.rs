//! Worker scenarios against the in-memory service
//!
//! Run with: cargo test -p stepline --test worker_test

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use stepline::activity::{Activity, ActivityError};
use stepline::config::{Session, WorkerConfig};
use stepline::service::{
    InMemoryStepFunctions, StepFunctions, TaskReport, TaskState, MAX_CAUSE_CHARS,
};
use stepline::worker::{Worker, WorkerStatus, CANCELLED_ERROR};

#[derive(Debug, thiserror::Error)]
#[error("bad input")]
struct ValueError;

fn session(service: &Arc<InMemoryStepFunctions>) -> Session {
    Session::new(service.clone(), service.region()).with_account_id(service.account_id())
}

fn worker(service: &Arc<InMemoryStepFunctions>, activity: Activity) -> Worker {
    Worker::with_config(
        activity,
        Some("test-host-1a2b3c4d".to_string()),
        session(service),
        WorkerConfig::new().with_poll_wait(Duration::from_secs(5)),
    )
}

/// Wait (in virtual time) until `done` holds
async fn until(mut done: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached");
}

fn double() -> Activity {
    Activity::new("double", |_ctx, input| async move {
        let x = input["x"]
            .as_i64()
            .ok_or_else(|| ActivityError::from_error(ValueError))?;
        Ok(json!({"result": x}))
    })
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_success_reported() {
    let service = Arc::new(InMemoryStepFunctions::new());
    let arn = service.activity_arn("double");
    let token = service.enqueue_task(&arn, json!({"x": 7}));

    let worker = worker(&service, double());
    worker.start().await.unwrap();
    until(|| !service.reports_for(&token).is_empty()).await;
    worker.end();
    worker.wait().await.unwrap();

    assert_eq!(
        service.reports_for(&token),
        vec![TaskReport::Success {
            task_token: token.clone(),
            output: r#"{"result":7}"#.to_string(),
        }]
    );
    assert_eq!(service.task_state(&token), Some(TaskState::Succeeded));
    assert_eq!(
        service.claimed_by(&token).as_deref(),
        Some("test-host-1a2b3c4d")
    );
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_failure_reported_and_worker_continues() {
    let service = Arc::new(InMemoryStepFunctions::new());
    let arn = service.activity_arn("double");
    let bad = service.enqueue_task(&arn, json!({"x": "seven"}));
    let good = service.enqueue_task(&arn, json!({"x": 3}));

    let worker = worker(&service, double());
    worker.start().await.unwrap();
    until(|| !service.reports_for(&good).is_empty()).await;
    worker.end();
    worker.wait().await.unwrap();

    assert_eq!(
        service.reports_for(&bad),
        vec![TaskReport::Failure {
            task_token: bad.clone(),
            error: "ValueError".to_string(),
            cause: "bad input".to_string(),
        }]
    );
    assert!(matches!(
        &service.reports_for(&good)[..],
        [TaskReport::Success { output, .. }] if output == r#"{"result":3}"#
    ));
    // reports arrive in claim order
    let reports = service.reports();
    assert_eq!(reports[0].task_token(), bad);
    assert_eq!(reports[1].task_token(), good);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_oversized_failure_truncated_and_worker_continues() {
    let service = Arc::new(InMemoryStepFunctions::new());
    let arn = service.activity_arn("verbose");
    let first = service.enqueue_task(&arn, json!({"fail": true}));
    let second = service.enqueue_task(&arn, json!({"fail": false}));

    let verbose = Activity::new("verbose", |_ctx, input| async move {
        if input["fail"] == json!(true) {
            return Err(ActivityError::failed("TracebackError", "line\n".repeat(10_000)));
        }
        Ok(json!("ok"))
    });

    let worker = worker(&service, verbose);
    worker.start().await.unwrap();
    until(|| !service.reports_for(&second).is_empty()).await;
    worker.end();
    worker.wait().await.unwrap();

    match &service.reports_for(&first)[..] {
        [TaskReport::Failure { error, cause, .. }] => {
            assert_eq!(error, "TracebackError");
            assert_eq!(cause.chars().count(), MAX_CAUSE_CHARS);
        }
        other => panic!("unexpected reports: {other:?}"),
    }
    assert_eq!(service.task_state(&second), Some(TaskState::Succeeded));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_expiry_at_third_heartbeat() {
    let service = Arc::new(InMemoryStepFunctions::new());
    let arn = service.activity_arn("slow");
    let expired = service.enqueue_task(&arn, json!({"sleep": 3600}));
    service.expire_at_heartbeat(&expired, 3);

    let slow = Activity::new("slow", |_ctx, input| async move {
        let secs = input["sleep"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_secs(secs)).await;
        Ok(json!({"slept": secs}))
    })
    .with_heartbeat_secs(10);

    let worker = worker(&service, slow);
    worker.start().await.unwrap();
    until(|| service.task_state(&expired) == Some(TaskState::TimedOut)).await;

    let next = service.enqueue_task(&arn, json!({"sleep": 1}));
    until(|| !service.reports_for(&next).is_empty()).await;
    worker.end();
    worker.wait().await.unwrap();

    assert!(service.reports_for(&expired).is_empty());
    assert_eq!(service.heartbeats(&expired).len(), 3);
    assert_eq!(service.task_state(&next), Some(TaskState::Succeeded));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_empty_polls_then_task() {
    let service = Arc::new(
        InMemoryStepFunctions::new().with_long_poll(Duration::from_secs(20)),
    );
    let arn = service.activity_arn("double");

    let worker = worker(&service, double());
    worker.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(50)).await;
    assert_eq!(service.poll_count(&arn), 3);
    assert_eq!(worker.status(), WorkerStatus::Polling);

    let token = service.enqueue_task(&arn, json!({"x": 1}));
    until(|| !service.reports_for(&token).is_empty()).await;
    worker.end();
    worker.wait().await.unwrap();

    assert_eq!(service.task_state(&token), Some(TaskState::Succeeded));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_end_between_claim_and_run_reports_cancelled() {
    let service = Arc::new(InMemoryStepFunctions::new());
    let arn = service.activity_arn("double");
    let token = service.enqueue_task(&arn, json!({"x": 1}));

    let worker = worker(&service, double());
    let handle = worker.stop_handle();
    worker.add_pre_execute_hook(move || {
        let handle = handle.clone();
        async move { handle.end() }
    });

    worker.start().await.unwrap();
    worker.wait().await.unwrap();

    assert!(matches!(
        &service.reports_for(&token)[..],
        [TaskReport::Failure { error, .. }] if error == CANCELLED_ERROR
    ));
    assert!(service.heartbeats(&token).is_empty());
    assert_eq!(worker.status(), WorkerStatus::Stopped);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_end_during_execution_lets_task_finish() {
    let service = Arc::new(InMemoryStepFunctions::new());
    let arn = service.activity_arn("slow");
    let first = service.enqueue_task(&arn, json!({}));
    let second = service.enqueue_task(&arn, json!({}));

    let slow = Activity::new("slow", |_ctx, _input| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!("done"))
    });

    let worker = worker(&service, slow);
    worker.start().await.unwrap();
    until(|| worker.status() == WorkerStatus::Executing).await;

    worker.end();
    assert_eq!(worker.status(), WorkerStatus::Stopping);
    worker.wait().await.unwrap();

    assert_eq!(service.task_state(&first), Some(TaskState::Succeeded));
    assert_eq!(service.task_state(&second), Some(TaskState::Queued));
    assert_eq!(service.pending_tasks(&arn), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_interrupt_reports_cancelled() {
    let service = Arc::new(InMemoryStepFunctions::new());
    let arn = service.activity_arn("slow");
    let token = service.enqueue_task(&arn, json!({}));

    let slow = Activity::new("slow", |ctx, _input| async move {
        ctx.cancelled().await;
        Err(ActivityError::Cancelled)
    });

    let worker = worker(&service, slow);
    worker.start().await.unwrap();
    until(|| worker.status() == WorkerStatus::Executing).await;

    worker.end();
    worker.interrupt();
    worker.wait().await.unwrap();

    assert!(matches!(
        &service.reports_for(&token)[..],
        [TaskReport::Failure { error, .. }] if error == CANCELLED_ERROR
    ));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_end_is_idempotent() {
    let service = Arc::new(InMemoryStepFunctions::new());
    let worker = worker(&service, double());
    worker.start().await.unwrap();

    worker.end();
    worker.end();
    worker.stop_handle().end();
    worker.wait().await.unwrap();
    worker.end();

    assert_eq!(worker.status(), WorkerStatus::Stopped);
    assert!(worker.wait().await.is_ok());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_arn_resolved_by_lookup() {
    let service = Arc::new(InMemoryStepFunctions::new());
    let created = service.create_activity("double").await.unwrap();
    let token = service.enqueue_task(&created.activity_arn, json!({"x": 2}));

    let worker = Worker::new(
        double(),
        None,
        Session::new(service.clone(), service.region()),
    );
    worker.start().await.unwrap();
    until(|| !service.reports_for(&token).is_empty()).await;
    worker.end();
    worker.wait().await.unwrap();

    assert_eq!(service.task_state(&token), Some(TaskState::Succeeded));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_unknown_activity_fails_start() {
    let service = Arc::new(InMemoryStepFunctions::new());
    let worker = Worker::new(
        double(),
        None,
        Session::new(service.clone(), service.region()),
    );

    assert!(worker.start().await.is_err());
    assert_eq!(worker.status(), WorkerStatus::Created);
}
