//! Activity groups and their registration with the service

use std::future::Future;

use serde_json::Value;
use tracing::{info, instrument};

use super::{Activity, ActivityContext, ActivityResult};
use crate::config::Session;
use crate::naming::{validate_name, NameError};
use crate::service::{CreatedActivity, ServiceError};

/// Registration errors
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// An activity with this name is already in the group
    #[error("activity '{0}' is already registered")]
    Duplicate(String),

    /// Activity name rejected by the service's naming rules
    #[error("invalid activity name: {0}")]
    InvalidName(#[from] NameError),

    /// Service error
    #[error("service error: {0}")]
    Service(#[from] ServiceError),
}

/// A group of activities sharing a name prefix
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use stepline::activity::ActivityRegistration;
///
/// let mut activities = ActivityRegistration::new("myPackage");
/// activities
///     .activity("Echo", |_ctx, input| async move { Ok(input) })
///     .unwrap();
///
/// assert_eq!(activities.names(), vec!["myPackageEcho"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ActivityRegistration {
    prefix: String,
    activities: Vec<Activity>,
}

impl ActivityRegistration {
    /// Create an empty group
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            activities: Vec::new(),
        }
    }

    /// Name prefix of the group
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Add an activity under its own name
    pub fn add_activity(&mut self, activity: Activity) -> Result<(), RegistrationError> {
        if self.get(activity.name()).is_some() {
            return Err(RegistrationError::Duplicate(activity.name().to_string()));
        }
        self.activities.push(activity);
        Ok(())
    }

    /// Add an activity named `{prefix}{name}` with a raw JSON handler
    pub fn activity<F, Fut>(
        &mut self,
        name: &str,
        handler: F,
    ) -> Result<Activity, RegistrationError>
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActivityResult> + Send + 'static,
    {
        let activity = Activity::new(format!("{}{}", self.prefix, name), handler);
        self.add_activity(activity.clone())?;
        Ok(activity)
    }

    /// Look up an activity by full name
    pub fn get(&self, name: &str) -> Option<&Activity> {
        self.activities.iter().find(|a| a.name() == name)
    }

    /// Look up an activity by full name or by its name without the prefix
    pub fn find(&self, name: &str) -> Option<&Activity> {
        self.get(name)
            .or_else(|| self.get(&format!("{}{}", self.prefix, name)))
    }

    /// Names of all activities, in insertion order
    pub fn names(&self) -> Vec<&str> {
        self.activities.iter().map(Activity::name).collect()
    }

    /// All activities, in insertion order
    pub fn activities(&self) -> &[Activity] {
        &self.activities
    }

    /// Number of activities
    pub fn len(&self) -> usize {
        self.activities.len()
    }

    /// Whether the group is empty
    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    /// Create every activity of the group on the service
    ///
    /// All names are validated before anything is created.
    #[instrument(skip(self, session), fields(prefix = %self.prefix))]
    pub async fn register(
        &self,
        session: &Session,
    ) -> Result<Vec<CreatedActivity>, RegistrationError> {
        for activity in &self.activities {
            validate_name(activity.name())?;
        }

        let mut created = Vec::with_capacity(self.activities.len());
        for activity in &self.activities {
            let result = session.service().create_activity(activity.name()).await?;
            info!(activity = %activity.name(), arn = %result.activity_arn, "Registered activity");
            created.push(result);
        }
        Ok(created)
    }

    /// Delete the group's activities from the service
    ///
    /// Removes every remote activity whose name carries the group prefix
    /// (or, without a prefix, is a member of the group). Returns the ARNs
    /// deleted.
    #[instrument(skip(self, session), fields(prefix = %self.prefix))]
    pub async fn deregister(&self, session: &Session) -> Result<Vec<String>, RegistrationError> {
        let remote = session.service().list_activities().await?;

        let mut deleted = Vec::new();
        for item in remote {
            let ours = if self.prefix.is_empty() {
                self.get(&item.name).is_some()
            } else {
                item.name.starts_with(&self.prefix)
            };
            if !ours {
                continue;
            }
            session.service().delete_activity(&item.activity_arn).await?;
            info!(activity = %item.name, arn = %item.activity_arn, "Deregistered activity");
            deleted.push(item.activity_arn);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::service::{InMemoryStepFunctions, StepFunctions};

    fn session(service: Arc<InMemoryStepFunctions>) -> Session {
        Session::new(service, "us-east-1")
    }

    #[test]
    fn test_prefixed_names() {
        let mut group = ActivityRegistration::new("pkg");
        group.activity("A", |_, input| async move { Ok(input) }).unwrap();
        group.add_activity(Activity::reference("other")).unwrap();

        assert_eq!(group.names(), vec!["pkgA", "other"]);
        assert!(group.get("pkgA").is_some());
        assert!(group.find("A").is_some());
        assert!(group.get("A").is_none());
        assert_eq!(group.len(), 2);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut group = ActivityRegistration::new("");
        group.add_activity(Activity::reference("spam")).unwrap();
        assert!(matches!(
            group.add_activity(Activity::reference("spam")),
            Err(RegistrationError::Duplicate(name)) if name == "spam"
        ));
    }

    #[tokio::test]
    async fn test_register_validates_all_names_first() {
        let service = Arc::new(InMemoryStepFunctions::new());
        let mut group = ActivityRegistration::new("");
        group.add_activity(Activity::reference("good")).unwrap();
        group.add_activity(Activity::reference("bad name")).unwrap();

        let result = group.register(&session(service.clone())).await;

        assert!(matches!(result, Err(RegistrationError::InvalidName(_))));
        assert!(service.list_activities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let service = Arc::new(InMemoryStepFunctions::new());
        service.create_activity("unrelated").await.unwrap();

        let mut group = ActivityRegistration::new("pkg");
        group.activity("A", |_, input| async move { Ok(input) }).unwrap();
        group.activity("B", |_, input| async move { Ok(input) }).unwrap();

        let created = group.register(&session(service.clone())).await.unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(service.list_activities().await.unwrap().len(), 3);

        let deleted = group.deregister(&session(service.clone())).await.unwrap();
        assert_eq!(deleted.len(), 2);

        let remaining = service.list_activities().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "unrelated");
    }
}
