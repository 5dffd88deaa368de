//! Configuration: AWS settings, the shared session, and worker tuning

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::service::{HttpStepFunctions, ServiceError, StepFunctions};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("AWS region not configured (set AWS_REGION or AWS_DEFAULT_REGION)")]
    MissingRegion,

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("activity '{0}' is not registered")]
    ActivityNotFound(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Static AWS credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// AWS connection settings
#[derive(Debug, Clone, PartialEq)]
pub struct AwsConfig {
    /// Region hosting the state machines and activities
    pub region: String,

    /// Explicit credentials; the default provider chain is used when absent
    pub credentials: Option<Credentials>,

    /// Account ID, used to build activity ARNs without a lookup
    pub account_id: Option<String>,

    /// Endpoint override (e.g. a local Step Functions emulator)
    pub endpoint: Option<String>,
}

impl AwsConfig {
    /// Create a configuration for a region with no credentials
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            credentials: None,
            account_id: None,
            endpoint: None,
        }
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `AWS_REGION` or `AWS_DEFAULT_REGION`: region (required)
    /// - `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`: credentials
    /// - `AWS_SESSION_TOKEN`: temporary credentials token
    /// - `AWS_ACCOUNT_ID`: account ID for activity ARNs
    /// - `STEPLINE_SFN_ENDPOINT`: endpoint override
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let region = non_empty("AWS_REGION")
            .or_else(|| non_empty("AWS_DEFAULT_REGION"))
            .ok_or(ConfigError::MissingRegion)?;

        let credentials = match (
            non_empty("AWS_ACCESS_KEY_ID"),
            non_empty("AWS_SECRET_ACCESS_KEY"),
        ) {
            (Some(access_key_id), Some(secret_access_key)) => Some(Credentials {
                access_key_id,
                secret_access_key,
                session_token: non_empty("AWS_SESSION_TOKEN"),
            }),
            _ => None,
        };

        Ok(Self {
            region,
            credentials,
            account_id: non_empty("AWS_ACCOUNT_ID"),
            endpoint: non_empty("STEPLINE_SFN_ENDPOINT"),
        })
    }

    /// Set credentials
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Set the account ID
    pub fn with_account_id(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// Set an endpoint override
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// Build an activity ARN
pub fn activity_arn(region: &str, account_id: &str, name: &str) -> String {
    format!("arn:aws:states:{}:{}:activity:{}", region, account_id, name)
}

/// Communication context shared by workers, executions and registration
///
/// Cloning is cheap; all clones share one service client.
#[derive(Clone)]
pub struct Session {
    service: Arc<dyn StepFunctions>,
    region: String,
    account_id: Option<String>,
}

impl Session {
    /// Create a session around an existing service client
    pub fn new(service: Arc<dyn StepFunctions>, region: impl Into<String>) -> Self {
        Self {
            service,
            region: region.into(),
            account_id: None,
        }
    }

    /// Create a session talking to AWS, configured from the environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_config(AwsConfig::from_env()?)
    }

    /// Create a session talking to AWS
    pub fn from_config(config: AwsConfig) -> Result<Self, ConfigError> {
        let account_id = config.account_id.clone();
        let region = config.region.clone();
        let service = HttpStepFunctions::new(config)?;
        Ok(Self {
            service: Arc::new(service),
            region,
            account_id,
        })
    }

    /// Set the account ID
    pub fn with_account_id(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// The service client
    pub fn service(&self) -> &Arc<dyn StepFunctions> {
        &self.service
    }

    /// The AWS region
    pub fn region(&self) -> &str {
        &self.region
    }

    /// The account ID, if known
    pub fn account_id(&self) -> Option<&str> {
        self.account_id.as_deref()
    }

    /// Resolve the ARN of an activity by name
    ///
    /// Built locally when the account ID is known, otherwise looked up in
    /// the service's activity list.
    pub async fn activity_arn(&self, name: &str) -> Result<String, ConfigError> {
        if let Some(account_id) = &self.account_id {
            return Ok(activity_arn(&self.region, account_id, name));
        }

        debug!(activity = %name, "Looking up activity ARN");
        self.service
            .list_activities()
            .await?
            .into_iter()
            .find(|a| a.name == name)
            .map(|a| a.activity_arn)
            .ok_or_else(|| ConfigError::ActivityNotFound(name.to_string()))
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("region", &self.region)
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

/// Worker tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// How long the worker loop waits for a polled task before re-checking
    /// whether it should finish
    #[serde(with = "duration_millis")]
    pub poll_wait: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_wait: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    /// Create a new worker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// - `STEPLINE_POLL_WAIT_MS`: worker loop poll wait in milliseconds
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("STEPLINE_POLL_WAIT_MS") {
            let millis: u64 = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "STEPLINE_POLL_WAIT_MS".to_string(),
                value: value.clone(),
            })?;
            config.poll_wait = Duration::from_millis(millis);
        }
        Ok(config)
    }

    /// Set the poll wait
    pub fn with_poll_wait(mut self, wait: Duration) -> Self {
        self.poll_wait = wait.max(Duration::from_millis(1));
        self
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
