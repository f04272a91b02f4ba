//! Error types for the orchestration domain.
//!
//! Two layers of errors exist:
//!
//! - [`GatewayError`]: the fixed taxonomy every controller-facing failure is
//!   wrapped into before it crosses a component boundary. The Supervisor's
//!   retry classification matches on these tags.
//! - [`Error`]: orchestration-level failures (storage, state machine,
//!   configuration) used by the Scheduler and stores.

use kiln_core::TaskId;

/// The result type used throughout kiln-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type for gateway operations.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Controller-facing error taxonomy.
///
/// Every transport or validation failure is wrapped into one of these tags
/// inside the gateway; a bare transport error never reaches callers. The
/// stable tag (see [`GatewayError::tag`]) is what the Supervisor's
/// non-retryable deny-list matches against.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// The controller could not be reached or answered with a server error
    /// after the retry budget was exhausted.
    #[error("controller_unavailable: {message}")]
    ControllerUnavailable {
        /// Description of the transport failure.
        message: String,
    },

    /// The controller is reachable but refusing work (429 or equivalent).
    #[error("controller_busy: {message}")]
    ControllerBusy {
        /// Description of the refusal.
        message: String,
    },

    /// The requested action name is not offered by the controller.
    #[error("unknown_action: {name}")]
    UnknownAction {
        /// The rejected action name.
        name: String,
    },

    /// The requested activity name is not offered by the controller.
    #[error("unknown_activity: {name}")]
    UnknownActivity {
        /// The rejected activity name.
        name: String,
    },

    /// The referenced activity instance does not exist on the controller.
    #[error("unknown_activity_id: {id}")]
    UnknownActivityId {
        /// The unrecognized activity id.
        id: String,
    },

    /// The supplied activity options failed schema validation.
    #[error("invalid_options: {}", errors.join("; "))]
    InvalidOptions {
        /// One entry per failed option check.
        errors: Vec<String>,
    },

    /// The supplied activity deadline could not be honored.
    #[error("deadline_invalid: {message}")]
    DeadlineInvalid {
        /// Description of the rejection.
        message: String,
    },

    /// Data products were requested before the activity completed.
    #[error("data_not_ready: {message}")]
    DataNotReady {
        /// Controller-supplied message, when present.
        message: String,
    },

    /// The controller rejected the caller's credentials.
    #[error("authorization_failed: {message}")]
    AuthorizationFailed {
        /// Description of the rejection.
        message: String,
    },

    /// A failure that does not fit the taxonomy.
    #[error("internal_error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl GatewayError {
    /// Returns the stable taxonomy tag for this error.
    ///
    /// Tags are what retry classification and escalation reporting key on,
    /// so they must never change once released.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::ControllerUnavailable { .. } => "controller_unavailable",
            Self::ControllerBusy { .. } => "controller_busy",
            Self::UnknownAction { .. } => "unknown_action",
            Self::UnknownActivity { .. } => "unknown_activity",
            Self::UnknownActivityId { .. } => "unknown_activity_id",
            Self::InvalidOptions { .. } => "invalid_options",
            Self::DeadlineInvalid { .. } => "deadline_invalid",
            Self::DataNotReady { .. } => "data_not_ready",
            Self::AuthorizationFailed { .. } => "authorization_failed",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Returns true if the gateway may transparently retry this failure.
    ///
    /// Only transport-level unavailability qualifies; everything else
    /// propagates to the caller immediately.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ControllerUnavailable { .. } | Self::ControllerBusy { .. }
        )
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a controller-unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::ControllerUnavailable {
            message: message.into(),
        }
    }
}

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A task was not found in the store.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The task ID that was not found.
        task_id: TaskId,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current status.
        from: String,
        /// The attempted target status.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A configuration value was invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// No registered controller matched the requested id.
    #[error("unknown controller: {controller_id}")]
    UnknownController {
        /// The controller id that was looked up.
        controller_id: String,
    },

    /// A gateway RPC failed.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// An error from kiln-core.
    #[error("core error: {0}")]
    Core(#[from] kiln_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}
