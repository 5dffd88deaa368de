//! Activity execution context

use tokio_util::sync::CancellationToken;

/// Context provided to activity handlers during execution
///
/// The context provides:
/// - The task token and activity name of the current claim
/// - Cancellation detection
///
/// Cancellation fires when the worker abandons the task: the task expired
/// on the service side, the worker was interrupted, or a fatal error ended
/// the execution. A handler that notices it may return
/// [`ActivityError::Cancelled`](super::ActivityError::Cancelled); whatever it
/// returns afterwards is not reported.
///
/// # Example
///
/// ```ignore
/// Activity::new("crunch", |ctx, input| async move {
///     for chunk in chunks(&input) {
///         if ctx.is_cancelled() {
///             return Err(ActivityError::Cancelled);
///         }
///         crunch(chunk).await;
///     }
///     Ok(json!({"done": true}))
/// });
/// ```
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Token of the claimed task
    pub task_token: String,

    /// Name of the activity being executed
    pub activity_name: String,

    cancel: CancellationToken,
}

impl ActivityContext {
    /// Create a new activity context
    pub fn new(
        activity_name: impl Into<String>,
        task_token: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_token: task_token.into(),
            activity_name: activity_name.into(),
            cancel,
        }
    }

    /// Get a handle that can be used to cancel this activity
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancel: self.cancel.clone(),
        }
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Get a future that resolves when cancellation is requested
    ///
    /// This is useful for select! patterns:
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = do_work() => { ... }
    ///     _ = ctx.cancelled() => return Err(ActivityError::Cancelled),
    /// }
    /// ```
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Handle to cancel an activity
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancel: CancellationToken,
}

impl CancellationHandle {
    /// Cancel the activity
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_activity_context_creation() {
        let ctx = ActivityContext::new("spam", "token-1", CancellationToken::new());

        assert_eq!(ctx.activity_name, "spam");
        assert_eq!(ctx.task_token, "token-1");
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_cancellation() {
        let ctx = ActivityContext::new("spam", "token-1", CancellationToken::new());
        let handle = ctx.cancellation_handle();

        assert!(!ctx.is_cancelled());

        handle.cancel();

        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let token = CancellationToken::new();
        let ctx = ActivityContext::new("spam", "token-1", token.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), ctx.cancelled())
            .await
            .expect("cancellation should be observed");
    }
}
