//! Activity definition

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use super::ActivityContext;

/// Default heartbeat interval in seconds
pub const DEFAULT_HEARTBEAT_SECS: u64 = 20;

/// Error name reported when task input cannot be decoded
pub const INPUT_ERROR: &str = "InputError";

/// Error name reported when handler output cannot be encoded
pub const OUTPUT_ERROR: &str = "OutputError";

/// Error type for activity failures
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityError {
    /// The handler gave up because the task was cancelled
    Cancelled,

    /// The handler failed; reported as a task failure
    Failed {
        /// Error name (e.g. an exception class name)
        error: String,
        /// Human-readable cause
        cause: String,
    },
}

impl ActivityError {
    /// Create a failure with an error name and cause
    pub fn failed(error: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
            cause: cause.into(),
        }
    }

    /// Create a failure from any error
    ///
    /// The error name is the short type name of `E`, the cause is the
    /// error's message followed by its source chain.
    pub fn from_error<E>(err: E) -> Self
    where
        E: std::error::Error,
    {
        let mut cause = err.to_string();
        let mut source = err.source();
        while let Some(inner) = source {
            cause.push_str(": ");
            cause.push_str(&inner.to_string());
            source = inner.source();
        }
        Self::Failed {
            error: short_type_name::<E>().to_string(),
            cause,
        }
    }

    /// Whether this is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

impl fmt::Display for ActivityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "activity cancelled"),
            Self::Failed { error, cause } => write!(f, "{}: {}", error, cause),
        }
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::failed("Error", format!("{:#}", err))
    }
}

/// Activity execution result
pub type ActivityResult = Result<Value, ActivityError>;

/// Activity handler function type
pub type ActivityFn =
    Arc<dyn Fn(ActivityContext, Value) -> BoxFuture<'static, ActivityResult> + Send + Sync>;

/// Strongly-typed activity handler
///
/// # Example
///
/// ```ignore
/// struct Double;
///
/// #[async_trait]
/// impl ActivityHandler for Double {
///     const NAME: &'static str = "Double";
///     type Input = Payload;
///     type Output = Payload;
///
///     async fn execute(
///         &self,
///         ctx: &ActivityContext,
///         input: Payload,
///     ) -> Result<Payload, ActivityError> {
///         Ok(Payload { x: input.x * 2 })
///     }
/// }
///
/// let activity = Activity::from_handler(Double);
/// ```
#[async_trait]
pub trait ActivityHandler: Send + Sync + 'static {
    /// Activity name
    const NAME: &'static str;

    /// Input type for the activity
    type Input: DeserializeOwned + Send;

    /// Output type for the activity
    type Output: Serialize + Send;

    /// Execute the activity
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}

/// A named unit of work executed by workers
///
/// An activity without a handler is a reference: it can be registered
/// with the service and named in state machine definitions, but a worker
/// cannot execute it.
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use stepline::activity::Activity;
///
/// let activity = Activity::new("spam", |_ctx, input| async move {
///     Ok(json!({"result": input["x"]}))
/// })
/// .with_heartbeat_secs(30);
///
/// assert!(activity.is_callable());
/// assert!(!Activity::reference("eggs").is_callable());
/// ```
#[derive(Clone)]
pub struct Activity {
    name: String,
    heartbeat: Duration,
    handler: Option<ActivityFn>,
}

impl Activity {
    /// Create an activity with a raw JSON handler
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActivityResult> + Send + 'static,
    {
        let handler: ActivityFn = Arc::new(move |ctx, input| Box::pin(handler(ctx, input)));
        Self {
            name: name.into(),
            heartbeat: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            handler: Some(handler),
        }
    }

    /// Create an activity whose input and output are serde types
    ///
    /// Input that does not decode into `I` fails the task with error name
    /// `InputError`.
    pub fn typed<I, O, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(ActivityContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ActivityError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Self::new(name, move |ctx, input| {
            let handler = handler.clone();
            async move {
                let input = decode_input::<I>(input)?;
                let output = handler(ctx, input).await?;
                encode_output(&output)
            }
        })
    }

    /// Create an activity from an [`ActivityHandler`]
    pub fn from_handler<H: ActivityHandler>(handler: H) -> Self {
        let handler = Arc::new(handler);
        Self::new(H::NAME, move |ctx, input| {
            let handler = handler.clone();
            async move {
                let input = decode_input::<H::Input>(input)?;
                let output = handler.execute(&ctx, input).await?;
                encode_output(&output)
            }
        })
    }

    /// Create a reference to an activity without a handler
    pub fn reference(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            heartbeat: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            handler: None,
        }
    }

    /// Set the heartbeat interval in seconds (at least one)
    pub fn with_heartbeat_secs(self, secs: u64) -> Self {
        self.with_heartbeat(Duration::from_secs(secs.max(1)))
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval.max(Duration::from_millis(1));
        self
    }

    /// Rename the activity, keeping its handler
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Activity name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Heartbeat interval
    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    /// Whether a worker can execute this activity
    pub fn is_callable(&self) -> bool {
        self.handler.is_some()
    }

    /// Invoke the handler, or `None` for a reference activity
    pub fn call(&self, ctx: ActivityContext, input: Value) -> Option<BoxFuture<'static, ActivityResult>> {
        self.handler.as_ref().map(|handler| handler(ctx, input))
    }
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("name", &self.name)
            .field("heartbeat", &self.heartbeat)
            .field("callable", &self.is_callable())
            .finish()
    }
}

fn decode_input<I: DeserializeOwned>(input: Value) -> Result<I, ActivityError> {
    serde_json::from_value(input).map_err(|e| ActivityError::failed(INPUT_ERROR, e.to_string()))
}

fn encode_output<O: Serialize>(output: &O) -> ActivityResult {
    serde_json::to_value(output).map_err(|e| ActivityError::failed(OUTPUT_ERROR, e.to_string()))
}
