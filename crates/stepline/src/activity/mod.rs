//! Activity abstractions
//!
//! Activities are named units of work executed by workers. They:
//! - Receive JSON task input (or a serde type via [`Activity::typed`])
//! - Report a JSON output, a named failure, or a cancellation
//! - Are kept alive with heartbeats while they run
//! - Support cancellation via tokens

mod context;
mod definition;
mod registration;

pub use context::{ActivityContext, CancellationHandle};
pub use definition::{
    Activity, ActivityError, ActivityFn, ActivityHandler, ActivityResult, DEFAULT_HEARTBEAT_SECS,
    INPUT_ERROR, OUTPUT_ERROR,
};
pub use registration::{ActivityRegistration, RegistrationError};
