use std::fmt;

/// Controls how a [`Pipeline`](crate::Pipeline) invokes listeners and
/// what happens when one of them fails.
///
/// A listener fails when it returns `Err` or panics. Every failure is logged
/// at error level with the event type and counted in the pipeline metrics,
/// whatever the mode.
///
/// | Mode | Invocation | On failure |
/// |------|-----------|------------|
/// | [`Isolate`](Self::Isolate) | each listener on its own Tokio task | siblings unaffected |
/// | [`Suppress`](Self::Suppress) | inline, in registration order | next listener still runs |
/// | [`Propagate`](Self::Propagate) | inline, in registration order | remaining listeners skipped, `emit` returns the error |
///
/// # Example
///
/// ```rust
/// use tapbus::{Config, ErrorMode};
///
/// let config = Config::default().with_error_mode(ErrorMode::Suppress);
/// assert!(config.error_mode().is_suppress());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    /// Defer every listener invocation to its own task.
    ///
    /// `emit` returns once all invocations are scheduled. A slow listener
    /// cannot hold up delivery to the others, and there is no ordering
    /// guarantee among them.
    #[default]
    Isolate,

    /// Run listeners inline and catch each failure.
    Suppress,

    /// Run listeners inline; the first failure aborts the emission.
    ///
    /// Inside the batch path the error is still caught per envelope, so the
    /// message source never observes it.
    Propagate,
}

impl ErrorMode {
    pub fn is_isolate(&self) -> bool {
        matches!(self, ErrorMode::Isolate)
    }

    pub fn is_suppress(&self) -> bool {
        matches!(self, ErrorMode::Suppress)
    }

    pub fn is_propagate(&self) -> bool {
        matches!(self, ErrorMode::Propagate)
    }
}

impl fmt::Display for ErrorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorMode::Isolate => write!(f, "isolate"),
            ErrorMode::Suppress => write!(f, "suppress"),
            ErrorMode::Propagate => write!(f, "propagate"),
        }
    }
}
