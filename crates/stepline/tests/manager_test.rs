//! Integration tests for WorkersManager
//!
//! Run with: cargo test -p stepline --test manager_test

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use stepline::activity::Activity;
use stepline::config::{Session, WorkerConfig};
use stepline::service::{InMemoryStepFunctions, TaskState};
use stepline::worker::{WorkerError, WorkersManager};

fn session(service: &Arc<InMemoryStepFunctions>) -> Session {
    Session::new(service.clone(), service.region()).with_account_id(service.account_id())
}

#[derive(Default)]
struct Concurrency {
    current: AtomicUsize,
    max: AtomicUsize,
    total: AtomicUsize,
}

fn tracked(name: &str, concurrency: Arc<Concurrency>) -> Activity {
    Activity::new(name, move |_ctx, input| {
        let concurrency = Arc::clone(&concurrency);
        async move {
            let now = concurrency.current.fetch_add(1, Ordering::SeqCst) + 1;
            concurrency.max.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(250)).await;
            concurrency.current.fetch_sub(1, Ordering::SeqCst);
            concurrency.total.fetch_add(1, Ordering::SeqCst);
            Ok(input)
        }
    })
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_executions_are_mutually_exclusive() {
    let service = Arc::new(InMemoryStepFunctions::new());
    let concurrency = Arc::new(Concurrency::default());
    let names = ["resize", "upload", "notify"];

    let manager = WorkersManager::with_config(
        names
            .iter()
            .map(|name| tracked(name, Arc::clone(&concurrency)))
            .collect(),
        Some("manager-test".to_string()),
        session(&service),
        WorkerConfig::new().with_poll_wait(Duration::from_secs(1)),
    );
    manager.start().await.unwrap();

    let mut tokens = Vec::new();
    for i in 0..4 {
        for name in names {
            tokens.push(service.enqueue_task(&service.activity_arn(name), json!({"i": i})));
        }
    }

    for _ in 0..10_000 {
        if concurrency.total.load(Ordering::SeqCst) == tokens.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    manager.end();
    manager.wait().await.unwrap();

    assert_eq!(concurrency.total.load(Ordering::SeqCst), tokens.len());
    assert_eq!(concurrency.max.load(Ordering::SeqCst), 1);
    for token in &tokens {
        assert_eq!(service.task_state(token), Some(TaskState::Succeeded));
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_poll_error_ends_all_workers() {
    let service = Arc::new(InMemoryStepFunctions::new());
    let manager = WorkersManager::new(
        vec![
            Activity::new("a", |_, input| async move { Ok(input) }),
            Activity::new("b", |_, input| async move { Ok(input) }),
        ],
        None,
        session(&service),
    );

    service.fail_next_poll("AccessDeniedException");
    manager.start().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(600), manager.wait())
        .await
        .expect("manager should stop");

    assert!(matches!(result, Err(WorkerError::Poller(_))));
    assert!(manager.workers().iter().all(|w| w.is_finishing()));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_end_before_any_task() {
    let service = Arc::new(InMemoryStepFunctions::new());
    let manager = WorkersManager::new(
        vec![Activity::new("a", |_, input| async move { Ok(input) })],
        None,
        session(&service),
    );

    manager.start().await.unwrap();
    manager.end();
    manager.end();
    manager.wait().await.unwrap();

    let token = service.enqueue_task(&service.activity_arn("a"), json!({}));
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(service.task_state(&token), Some(TaskState::Queued));
}
