use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Config, InstanceId};

/// Severity of a pipeline diagnostic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Level-gated diagnostic sink bound to one pipeline configuration.
///
/// Records go to the `tracing` crate with an `instance` field; the gate sits
/// in front of it so that each pipeline keeps its own verbosity while sharing
/// the process-wide subscriber. A fresh logger is built on every
/// [`Pipeline::configure`](crate::Pipeline::configure) and handed to each
/// component.
#[derive(Debug, Clone)]
pub struct Logger {
    instance: InstanceId,
    threshold: LogLevel,
}

impl Logger {
    pub fn new(instance: InstanceId, config: &Config) -> Self {
        let threshold = if config.debug() {
            config.log_level().min(LogLevel::Debug)
        } else {
            config.log_level()
        };
        Self {
            instance,
            threshold,
        }
    }

    #[inline]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.threshold
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn threshold(&self) -> LogLevel {
        self.threshold
    }

    pub fn trace(&self, msg: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Trace) {
            tracing::trace!(instance = %self.instance, "{}", msg);
        }
    }

    pub fn debug(&self, msg: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Debug) {
            tracing::debug!(instance = %self.instance, "{}", msg);
        }
    }

    pub fn info(&self, msg: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Info) {
            tracing::info!(instance = %self.instance, "{}", msg);
        }
    }

    pub fn warn(&self, msg: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Warn) {
            tracing::warn!(instance = %self.instance, "{}", msg);
        }
    }

    /// Failure of a listener or of a batch step, tagged with the event type.
    pub fn event_error(&self, event_type: &str, error: &dyn fmt::Display, msg: &str) {
        if self.enabled(LogLevel::Error) {
            tracing::error!(instance = %self.instance, event_type, error = %error, "{}", msg);
        }
    }

    pub fn error(&self, msg: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Error) {
            tracing::error!(instance = %self.instance, "{}", msg);
        }
    }
}
