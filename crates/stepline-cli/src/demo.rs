// Demo activities served by the `stepline` binary

use std::time::Duration;

use stepline::activity::RegistrationError;
use stepline::prelude::*;

/// Input of the sleep activity
#[derive(Debug, Deserialize)]
pub struct SleepInput {
    pub seconds: u64,
}

/// Output of the sleep activity
#[derive(Debug, Serialize, PartialEq)]
pub struct SleepOutput {
    pub slept: u64,
}

/// Sleeps for the requested number of seconds, stopping early on cancellation
pub struct Sleep;

#[async_trait]
impl ActivityHandler for Sleep {
    const NAME: &'static str = "Sleep";
    type Input = SleepInput;
    type Output = SleepOutput;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: SleepInput,
    ) -> Result<SleepOutput, ActivityError> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(input.seconds)) => {
                Ok(SleepOutput { slept: input.seconds })
            }
            _ = ctx.cancelled() => Err(ActivityError::Cancelled),
        }
    }
}

/// The demo activity group: `{prefix}Echo` and `{prefix}Sleep`
pub fn demo_activities(prefix: &str) -> Result<ActivityRegistration, RegistrationError> {
    let mut group = ActivityRegistration::new(prefix);
    group.activity("Echo", |_ctx, input| async move { Ok(input) })?;
    group.add_activity(
        Activity::from_handler(Sleep)
            .with_name(format!("{}{}", prefix, Sleep::NAME))
            .with_heartbeat_secs(10),
    )?;
    Ok(group)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stepline::service::{TaskReport, TaskState};

    async fn serve_one(activity: Activity, input: Value) -> (Arc<InMemoryStepFunctions>, String) {
        let service = Arc::new(InMemoryStepFunctions::new());
        let token = service.enqueue_task(&service.activity_arn(activity.name()), input);
        let session =
            Session::new(service.clone(), service.region()).with_account_id(service.account_id());

        let worker = Worker::new(activity, None, session);
        worker.start().await.unwrap();
        while service.reports_for(&token).is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        worker.end();
        worker.wait().await.unwrap();
        (service, token)
    }

    #[test]
    fn test_demo_names() {
        let group = demo_activities("demo").unwrap();
        assert_eq!(group.names(), vec!["demoEcho", "demoSleep"]);
        assert_eq!(
            group.get("demoSleep").unwrap().heartbeat(),
            Duration::from_secs(10)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_returns_input() {
        let group = demo_activities("demo").unwrap();
        let echo = group.find("Echo").unwrap().clone();
        let (service, token) = serve_one(echo, json!({"hello": "world"})).await;

        assert!(matches!(
            &service.reports_for(&token)[..],
            [TaskReport::Success { output, .. }] if output == r#"{"hello":"world"}"#
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_reports_duration() {
        let group = demo_activities("demo").unwrap();
        let sleep = group.find("Sleep").unwrap().clone();
        let (service, token) = serve_one(sleep, json!({"seconds": 25})).await;

        assert_eq!(service.task_state(&token), Some(TaskState::Succeeded));
        assert!(matches!(
            &service.reports_for(&token)[..],
            [TaskReport::Success { output, .. }] if output == r#"{"slept":25}"#
        ));
        // t = 0, 10 s, 20 s
        assert_eq!(service.heartbeats(&token).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_rejects_bad_input() {
        let group = demo_activities("demo").unwrap();
        let sleep = group.find("Sleep").unwrap().clone();
        let (service, token) = serve_one(sleep, json!({"seconds": "soon"})).await;

        assert!(matches!(
            &service.reports_for(&token)[..],
            [TaskReport::Failure { error, .. }] if error == "InputError"
        ));
    }
}
