//! Step Functions client backed by the rusoto SDK
//!
//! Request signing and credential resolution (environment, profile files,
//! container and instance roles) are left to `rusoto_core`; this adapter
//! bounds each call with a timeout and maps SDK errors to [`ServiceError`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusoto_core::credential::{ChainProvider, StaticProvider};
use rusoto_core::request::BufferedHttpResponse;
use rusoto_core::{HttpClient, Region, RusotoError};
use rusoto_stepfunctions::{
    CreateActivityError, CreateActivityInput, DeleteActivityError, DeleteActivityInput,
    GetActivityTaskError, GetActivityTaskInput, ListActivitiesError, ListActivitiesInput,
    SendTaskFailureError, SendTaskFailureInput, SendTaskHeartbeatError, SendTaskHeartbeatInput,
    SendTaskSuccessError, SendTaskSuccessInput, StepFunctions as _, StepFunctionsClient,
};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::client::{
    epoch_seconds, ActivityListItem, ActivityTask, CreatedActivity, ServiceError, StepFunctions,
};
use crate::config::{AwsConfig, ConfigError};

/// Long-poll request timeout; longer than the service's 60 second hold so a
/// poll normally completes (with or without a task) rather than being cut off
pub const POLL_TIMEOUT: Duration = Duration::from_secs(65);

/// Timeout for every other request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Step Functions client over the AWS API
pub struct HttpStepFunctions {
    client: StepFunctionsClient,
    region: Region,
    poll_timeout: Duration,
    request_timeout: Duration,
}

impl HttpStepFunctions {
    /// Create a client from AWS configuration
    ///
    /// Explicit credentials in `config` are used as given; otherwise the
    /// default provider chain resolves them.
    ///
    /// # Errors
    ///
    /// Fails if the region is unknown or the HTTP client cannot be built.
    pub fn new(config: AwsConfig) -> Result<Self, ConfigError> {
        let region = region_for(&config)?;
        let dispatcher = HttpClient::new().map_err(|e| ConfigError::Client(e.to_string()))?;

        let client = match config.credentials {
            Some(credentials) => StepFunctionsClient::new_with(
                dispatcher,
                StaticProvider::new(
                    credentials.access_key_id,
                    credentials.secret_access_key,
                    credentials.session_token,
                    None,
                ),
                region.clone(),
            ),
            None => StepFunctionsClient::new_with(dispatcher, ChainProvider::new(), region.clone()),
        };

        Ok(Self {
            client,
            region,
            poll_timeout: POLL_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    /// Set the long-poll request timeout
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the timeout for non-poll requests
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Region (and endpoint) this client talks to
    pub fn region(&self) -> &Region {
        &self.region
    }
}

/// Resolve the SDK region, honouring an endpoint override
fn region_for(config: &AwsConfig) -> Result<Region, ConfigError> {
    match &config.endpoint {
        Some(endpoint) => Ok(Region::Custom {
            name: config.region.clone(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }),
        None => config
            .region
            .parse::<Region>()
            .map_err(|e| ConfigError::InvalidValue {
                key: "region".to_string(),
                value: format!("{} ({})", config.region, e),
            }),
    }
}

/// Map an operation's modelled errors onto [`ServiceError`]
trait ServiceCode {
    fn into_service_error(self) -> ServiceError;
}

impl ServiceCode for GetActivityTaskError {
    fn into_service_error(self) -> ServiceError {
        match self {
            Self::ActivityDoesNotExist(m) => ServiceError::ActivityDoesNotExist(m),
            Self::ActivityWorkerLimitExceeded(m) => api_error("ActivityWorkerLimitExceeded", m),
            Self::InvalidArn(m) => api_error("InvalidArn", m),
        }
    }
}

impl ServiceCode for SendTaskHeartbeatError {
    fn into_service_error(self) -> ServiceError {
        match self {
            Self::InvalidToken(m) => api_error("InvalidToken", m),
            Self::TaskDoesNotExist(m) => ServiceError::TaskDoesNotExist(m),
            Self::TaskTimedOut(m) => ServiceError::TaskTimedOut(m),
        }
    }
}

impl ServiceCode for SendTaskSuccessError {
    fn into_service_error(self) -> ServiceError {
        match self {
            Self::InvalidOutput(m) => api_error("InvalidOutput", m),
            Self::InvalidToken(m) => api_error("InvalidToken", m),
            Self::TaskDoesNotExist(m) => ServiceError::TaskDoesNotExist(m),
            Self::TaskTimedOut(m) => ServiceError::TaskTimedOut(m),
        }
    }
}

impl ServiceCode for SendTaskFailureError {
    fn into_service_error(self) -> ServiceError {
        match self {
            Self::InvalidToken(m) => api_error("InvalidToken", m),
            Self::TaskDoesNotExist(m) => ServiceError::TaskDoesNotExist(m),
            Self::TaskTimedOut(m) => ServiceError::TaskTimedOut(m),
        }
    }
}

impl ServiceCode for CreateActivityError {
    fn into_service_error(self) -> ServiceError {
        match self {
            Self::ActivityLimitExceeded(m) => api_error("ActivityLimitExceeded", m),
            Self::InvalidName(m) => api_error("InvalidName", m),
            Self::TooManyTags(m) => api_error("TooManyTags", m),
        }
    }
}

impl ServiceCode for DeleteActivityError {
    fn into_service_error(self) -> ServiceError {
        match self {
            Self::InvalidArn(m) => api_error("InvalidArn", m),
        }
    }
}

impl ServiceCode for ListActivitiesError {
    fn into_service_error(self) -> ServiceError {
        match self {
            Self::InvalidToken(m) => api_error("InvalidToken", m),
        }
    }
}

fn api_error(code: &str, message: String) -> ServiceError {
    ServiceError::from_code(400, code, message)
}

fn map_error<E>(err: RusotoError<E>) -> ServiceError
where
    E: ServiceCode + std::error::Error + 'static,
{
    match err {
        RusotoError::Service(e) => e.into_service_error(),
        RusotoError::Validation(message) => api_error("ValidationException", message),
        RusotoError::Unknown(response) => unmodelled_error(&response),
        RusotoError::HttpDispatch(e) => ServiceError::Http(e.to_string()),
        RusotoError::ParseError(message) => ServiceError::Serialization(message),
        other => ServiceError::Http(other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "__type")]
    error_type: Option<String>,
    #[serde(alias = "Message")]
    message: Option<String>,
}

/// Map an error the SDK does not model (`{"__type": "...#Code", "message": "..."}`)
fn unmodelled_error(response: &BufferedHttpResponse) -> ServiceError {
    error_from_body(response.status.as_u16(), &response.body)
}

fn error_from_body(status: u16, body: &[u8]) -> ServiceError {
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(ErrorBody {
            error_type: Some(error_type),
            message,
        }) => {
            let code = error_type
                .rsplit('#')
                .next()
                .and_then(|c| c.split(':').next())
                .unwrap_or(&error_type);
            ServiceError::from_code(status, code, message.unwrap_or_default())
        }
        _ => ServiceError::Api {
            status,
            code: "Unknown".to_string(),
            message: String::from_utf8_lossy(body).into_owned(),
        },
    }
}

fn timestamp(secs: f64) -> DateTime<Utc> {
    epoch_seconds::from_secs(secs).unwrap_or_default()
}

/// Bound an SDK call by `timeout`
async fn bounded<T, E, F>(timeout: Duration, call: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, RusotoError<E>>>,
    E: ServiceCode + std::error::Error + 'static,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| ServiceError::Timeout)?
        .map_err(map_error)
}

#[async_trait]
impl StepFunctions for HttpStepFunctions {
    #[instrument(skip(self))]
    async fn get_activity_task(
        &self,
        activity_arn: &str,
        worker_name: &str,
    ) -> Result<Option<ActivityTask>, ServiceError> {
        let request = GetActivityTaskInput {
            activity_arn: activity_arn.to_string(),
            worker_name: Some(worker_name.to_string()),
        };
        let response = bounded(self.poll_timeout, self.client.get_activity_task(request)).await?;

        let task_token = match response.task_token {
            Some(token) if !token.is_empty() => token,
            _ => {
                debug!("Poll returned no task");
                return Ok(None);
            }
        };
        let input = match response.input.as_deref() {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => serde_json::Value::Null,
        };

        Ok(Some(ActivityTask { task_token, input }))
    }

    async fn send_task_heartbeat(&self, task_token: &str) -> Result<(), ServiceError> {
        let request = SendTaskHeartbeatInput {
            task_token: task_token.to_string(),
        };
        bounded(self.request_timeout, self.client.send_task_heartbeat(request)).await?;
        Ok(())
    }

    async fn send_task_success(&self, task_token: &str, output: &str) -> Result<(), ServiceError> {
        let request = SendTaskSuccessInput {
            task_token: task_token.to_string(),
            output: output.to_string(),
        };
        bounded(self.request_timeout, self.client.send_task_success(request)).await?;
        Ok(())
    }

    async fn send_task_failure(
        &self,
        task_token: &str,
        error: &str,
        cause: &str,
    ) -> Result<(), ServiceError> {
        let request = SendTaskFailureInput {
            task_token: task_token.to_string(),
            error: Some(error.to_string()),
            cause: Some(cause.to_string()),
        };
        bounded(self.request_timeout, self.client.send_task_failure(request)).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_activity(&self, name: &str) -> Result<CreatedActivity, ServiceError> {
        let request = CreateActivityInput {
            name: name.to_string(),
            ..Default::default()
        };
        let response = bounded(self.request_timeout, self.client.create_activity(request)).await?;
        Ok(CreatedActivity {
            activity_arn: response.activity_arn,
            creation_date: timestamp(response.creation_date),
        })
    }

    #[instrument(skip(self))]
    async fn delete_activity(&self, activity_arn: &str) -> Result<(), ServiceError> {
        let request = DeleteActivityInput {
            activity_arn: activity_arn.to_string(),
        };
        bounded(self.request_timeout, self.client.delete_activity(request)).await?;
        Ok(())
    }

    async fn list_activities(&self) -> Result<Vec<ActivityListItem>, ServiceError> {
        let mut activities = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let request = ListActivitiesInput {
                next_token: next_token.take(),
                ..Default::default()
            };
            let page = bounded(self.request_timeout, self.client.list_activities(request)).await?;
            activities.extend(page.activities.into_iter().map(|a| ActivityListItem {
                activity_arn: a.activity_arn,
                name: a.name,
                creation_date: timestamp(a.creation_date),
            }));

            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }

        Ok(activities)
    }
}
