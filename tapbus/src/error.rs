use std::sync::Arc;

use crate::InstanceId;

/// Boxed error type returned by listener callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The single error type for all tapbus operations.
///
/// Data-level problems (malformed payloads, filtered events, failing
/// listeners) never surface here unless the pipeline is configured with
/// [`ErrorMode::Propagate`](crate::ErrorMode::Propagate); they are logged and
/// counted in [`Metrics`](crate::MetricsSnapshot) instead. What remains are
/// programmer and lifecycle errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("A discovery window is already open")]
    DiscoveryInProgress,

    #[error("Discovery window closed before completing")]
    DiscoveryAborted,

    #[error("Pipeline '{0}' has been destroyed")]
    Destroyed(InstanceId),

    #[error("Pipeline '{0}' already exists")]
    DuplicateInstance(InstanceId),

    #[error("Failed to install message source: {0}")]
    InstallFailed(#[source] Arc<dyn std::error::Error + Send + Sync>),

    #[error("Listener for '{event_type}' failed: {reason}")]
    Listener { event_type: String, reason: String },

    #[error("Listener for '{event_type}' panicked")]
    ListenerPanicked { event_type: String },

    #[error("No Tokio runtime available")]
    NoRuntime,

    #[error("External error: {0}")]
    External(#[source] Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn external(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::External(Arc::new(e))
    }

    pub fn install_failed(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::InstallFailed(Arc::new(e))
    }

    pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }

    /// Returns `true` for failures raised by a listener callback.
    pub fn is_listener_failure(&self) -> bool {
        matches!(self, Error::Listener { .. } | Error::ListenerPanicked { .. })
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::InvalidConfig(a), Self::InvalidConfig(b)) => a == b,
            (Self::DiscoveryInProgress, Self::DiscoveryInProgress) => true,
            (Self::DiscoveryAborted, Self::DiscoveryAborted) => true,
            (Self::Destroyed(a), Self::Destroyed(b)) => a == b,
            (Self::DuplicateInstance(a), Self::DuplicateInstance(b)) => a == b,
            (Self::InstallFailed(a), Self::InstallFailed(b)) => Arc::ptr_eq(a, b),
            (
                Self::Listener {
                    event_type: a,
                    reason: ra,
                },
                Self::Listener {
                    event_type: b,
                    reason: rb,
                },
            ) => a == b && ra == rb,
            (
                Self::ListenerPanicked { event_type: a },
                Self::ListenerPanicked { event_type: b },
            ) => a == b,
            (Self::NoRuntime, Self::NoRuntime) => true,
            (Self::External(a), Self::External(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
