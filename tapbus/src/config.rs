use std::{collections::BTreeSet, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{Error, ErrorMode, LogLevel, Result};

/// Configuration record of a single [`Pipeline`](crate::Pipeline).
///
/// Use the builder methods to customize, or [`Default`] for sensible
/// defaults. A running pipeline only changes its configuration through
/// [`Pipeline::configure`](crate::Pipeline::configure), which merges a
/// [`ConfigPatch`] and validates the result before anything takes effect.
///
/// Serializes as a flat JSON object; durations are expressed in
/// milliseconds (`batch_interval_ms`).
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use tapbus::{Config, ErrorMode};
///
/// let config = Config::default()
///     .with_batch_interval(Duration::from_millis(50))
///     .with_max_batch_size(100)
///     .with_whitelist(["chat_message", "items_updated"])
///     .with_error_mode(ErrorMode::Suppress);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    enable_batching: bool,
    #[serde(rename = "batch_interval_ms", with = "duration_ms")]
    batch_interval: Duration,
    max_batch_size: usize,
    enable_prefilter: bool,
    type_field: String,
    event_whitelist: BTreeSet<String>,
    event_blacklist: BTreeSet<String>,
    discovery_mode: bool,
    discovery_limit: usize,
    debug: bool,
    log_level: LogLevel,
    history_size: usize,
    enable_cache: bool,
    cache_size: usize,
    error_mode: ErrorMode,
    max_listeners_per_event: usize,
    profiling: bool,
    intake_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enable_batching: true,
            batch_interval: Duration::from_millis(16),
            max_batch_size: 50,
            enable_prefilter: true,
            type_field: "type".to_string(),
            event_whitelist: BTreeSet::new(),
            event_blacklist: BTreeSet::new(),
            discovery_mode: false,
            discovery_limit: 100,
            debug: false,
            log_level: LogLevel::Warn,
            history_size: 100,
            enable_cache: true,
            cache_size: 50,
            error_mode: ErrorMode::Isolate,
            max_listeners_per_event: 100,
            profiling: true,
            intake_channel_capacity: 1024,
        }
    }
}

impl Config {
    /// Parse a configuration from a JSON object. Missing keys take their
    /// default value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the text is not a valid
    /// configuration object or the result fails [`validate`](Self::validate).
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants every running pipeline relies on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::invalid_config("max_batch_size must be at least 1"));
        }
        if self.enable_batching && self.batch_interval.is_zero() {
            return Err(Error::invalid_config(
                "batch_interval must be positive while batching is enabled",
            ));
        }
        if self.max_listeners_per_event == 0 {
            return Err(Error::invalid_config(
                "max_listeners_per_event must be at least 1",
            ));
        }
        if self.discovery_limit == 0 {
            return Err(Error::invalid_config("discovery_limit must be at least 1"));
        }
        if self.intake_channel_capacity == 0 {
            return Err(Error::invalid_config(
                "intake_channel_capacity must be at least 1",
            ));
        }
        if self.type_field.is_empty() {
            return Err(Error::invalid_config("type_field must not be empty"));
        }
        Ok(())
    }

    /// Returns a copy of `self` with every option present in `patch` replaced.
    pub fn merge(&self, patch: &ConfigPatch) -> Config {
        let mut next = self.clone();
        if let Some(v) = patch.enable_batching {
            next.enable_batching = v;
        }
        if let Some(v) = patch.batch_interval {
            next.batch_interval = v;
        }
        if let Some(v) = patch.max_batch_size {
            next.max_batch_size = v;
        }
        if let Some(v) = patch.enable_prefilter {
            next.enable_prefilter = v;
        }
        if let Some(v) = &patch.type_field {
            next.type_field = v.clone();
        }
        if let Some(v) = &patch.event_whitelist {
            next.event_whitelist = v.clone();
        }
        if let Some(v) = &patch.event_blacklist {
            next.event_blacklist = v.clone();
        }
        if let Some(v) = patch.discovery_mode {
            next.discovery_mode = v;
        }
        if let Some(v) = patch.discovery_limit {
            next.discovery_limit = v;
        }
        if let Some(v) = patch.debug {
            next.debug = v;
        }
        if let Some(v) = patch.log_level {
            next.log_level = v;
        }
        if let Some(v) = patch.history_size {
            next.history_size = v;
        }
        if let Some(v) = patch.enable_cache {
            next.enable_cache = v;
        }
        if let Some(v) = patch.cache_size {
            next.cache_size = v;
        }
        if let Some(v) = patch.error_mode {
            next.error_mode = v;
        }
        if let Some(v) = patch.max_listeners_per_event {
            next.max_listeners_per_event = v;
        }
        if let Some(v) = patch.profiling {
            next.profiling = v;
        }
        if let Some(v) = patch.intake_channel_capacity {
            next.intake_channel_capacity = v;
        }
        next
    }

    /// Short description used by [`InstanceRegistry::info`](crate::InstanceRegistry::info).
    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            enable_batching: self.enable_batching,
            batch_interval_ms: self.batch_interval.as_millis() as u64,
            max_batch_size: self.max_batch_size,
            whitelist: self.event_whitelist.len(),
            blacklist: self.event_blacklist.len(),
            discovery_mode: self.discovery_mode,
            history_size: self.history_size,
            cache_size: if self.enable_cache { self.cache_size } else { 0 },
            error_mode: self.error_mode,
        }
    }

    /// Enable or disable batching. Disabled batching dispatches each event
    /// as soon as it is classified.
    pub fn with_batching(mut self, enabled: bool) -> Self {
        self.enable_batching = enabled;
        self
    }

    pub fn batching_enabled(&self) -> bool {
        self.enable_batching
    }

    /// How long the first queued event waits before its batch is flushed.
    /// Default: 16ms
    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval = interval;
        self
    }

    pub fn batch_interval(&self) -> Duration {
        self.batch_interval
    }

    /// Queue length that triggers an immediate flush, and the largest slice
    /// handed to the batch processor at once. Default: 50
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Reject payloads that do not contain the quoted type field before
    /// parsing them. Default: true
    pub fn with_prefilter(mut self, enabled: bool) -> Self {
        self.enable_prefilter = enabled;
        self
    }

    pub fn prefilter_enabled(&self) -> bool {
        self.enable_prefilter
    }

    /// Name of the string field that carries the event type. Default: `type`
    pub fn with_type_field(mut self, field: impl Into<String>) -> Self {
        self.type_field = field.into();
        self
    }

    pub fn type_field(&self) -> &str {
        &self.type_field
    }

    /// Only these event types pass intake. An empty whitelist admits every type.
    pub fn with_whitelist<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_whitelist = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn whitelist(&self) -> &BTreeSet<String> {
        &self.event_whitelist
    }

    /// These event types are dropped at intake. Checked before the whitelist.
    pub fn with_blacklist<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_blacklist = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn blacklist(&self) -> &BTreeSet<String> {
        &self.event_blacklist
    }

    /// Record every classified event into the discovery census, not only
    /// during [`Pipeline::discover`](crate::Pipeline::discover) windows.
    pub fn with_discovery_mode(mut self, enabled: bool) -> Self {
        self.discovery_mode = enabled;
        self
    }

    pub fn discovery_mode(&self) -> bool {
        self.discovery_mode
    }

    /// Maximum number of distinct event types the discovery census tracks.
    /// Default: 100
    pub fn with_discovery_limit(mut self, limit: usize) -> Self {
        self.discovery_limit = limit;
        self
    }

    pub fn discovery_limit(&self) -> usize {
        self.discovery_limit
    }

    /// Lower the log threshold to at least `debug`.
    pub fn with_debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Minimum level of diagnostics this pipeline emits. Default: warn
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    /// Number of recent envelopes kept in the history buffer. Default: 100
    pub fn with_history_size(mut self, size: usize) -> Self {
        self.history_size = size;
        self
    }

    pub fn history_size(&self) -> usize {
        self.history_size
    }

    /// Keep the latest envelope per event type. Default: true
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.enable_cache = enabled;
        self
    }

    pub fn cache_enabled(&self) -> bool {
        self.enable_cache
    }

    /// Number of event types the latest-event cache holds. Default: 50
    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn with_error_mode(mut self, mode: ErrorMode) -> Self {
        self.error_mode = mode;
        self
    }

    pub fn error_mode(&self) -> ErrorMode {
        self.error_mode
    }

    /// Cap on listeners registered under one key. Default: 100
    pub fn with_max_listeners_per_event(mut self, max: usize) -> Self {
        self.max_listeners_per_event = max;
        self
    }

    pub fn max_listeners_per_event(&self) -> usize {
        self.max_listeners_per_event
    }

    /// Sample per-event processing durations and warn about slow batches.
    /// Default: true
    pub fn with_profiling(mut self, enabled: bool) -> Self {
        self.profiling = enabled;
        self
    }

    pub fn profiling(&self) -> bool {
        self.profiling
    }

    /// Number of raw payloads that may wait for classification before intake
    /// starts dropping them. Default: 1024
    pub fn with_intake_channel_capacity(mut self, capacity: usize) -> Self {
        self.intake_channel_capacity = capacity;
        self
    }

    pub fn intake_channel_capacity(&self) -> usize {
        self.intake_channel_capacity
    }
}

/// A partial [`Config`]: every option that is `Some` replaces the current value.
///
/// ```rust
/// use tapbus::ConfigPatch;
///
/// let patch = ConfigPatch {
///     max_batch_size: Some(10),
///     ..Default::default()
/// };
/// let from_json = ConfigPatch::from_json(r#"{"max_batch_size": 10}"#).unwrap();
/// assert_eq!(patch, from_json);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigPatch {
    pub enable_batching: Option<bool>,
    #[serde(rename = "batch_interval_ms", with = "duration_ms::option")]
    pub batch_interval: Option<Duration>,
    pub max_batch_size: Option<usize>,
    pub enable_prefilter: Option<bool>,
    pub type_field: Option<String>,
    pub event_whitelist: Option<BTreeSet<String>>,
    pub event_blacklist: Option<BTreeSet<String>>,
    pub discovery_mode: Option<bool>,
    pub discovery_limit: Option<usize>,
    pub debug: Option<bool>,
    pub log_level: Option<LogLevel>,
    pub history_size: Option<usize>,
    pub enable_cache: Option<bool>,
    pub cache_size: Option<usize>,
    pub error_mode: Option<ErrorMode>,
    pub max_listeners_per_event: Option<usize>,
    pub profiling: Option<bool>,
    /// Fixed at creation. A running pipeline rejects any other value.
    pub intake_channel_capacity: Option<usize>,
}

impl ConfigPatch {
    /// Parse a patch from a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for unknown keys or mistyped values.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn is_empty(&self) -> bool {
        *self == ConfigPatch::default()
    }
}

impl From<Config> for ConfigPatch {
    fn from(config: Config) -> Self {
        ConfigPatch {
            enable_batching: Some(config.enable_batching),
            batch_interval: Some(config.batch_interval),
            max_batch_size: Some(config.max_batch_size),
            enable_prefilter: Some(config.enable_prefilter),
            type_field: Some(config.type_field),
            event_whitelist: Some(config.event_whitelist),
            event_blacklist: Some(config.event_blacklist),
            discovery_mode: Some(config.discovery_mode),
            discovery_limit: Some(config.discovery_limit),
            debug: Some(config.debug),
            log_level: Some(config.log_level),
            history_size: Some(config.history_size),
            enable_cache: Some(config.enable_cache),
            cache_size: Some(config.cache_size),
            error_mode: Some(config.error_mode),
            max_listeners_per_event: Some(config.max_listeners_per_event),
            profiling: Some(config.profiling),
            intake_channel_capacity: Some(config.intake_channel_capacity),
        }
    }
}

/// Condensed view of a [`Config`] for registry introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigSummary {
    pub enable_batching: bool,
    pub batch_interval_ms: u64,
    pub max_batch_size: usize,
    pub whitelist: usize,
    pub blacklist: usize,
    pub discovery_mode: bool,
    pub history_size: usize,
    pub cache_size: usize,
    pub error_mode: ErrorMode,
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&(d.as_millis() as u64)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn merge_replaces_only_present_keys() {
        let base = Config::default().with_history_size(10);
        let patch = ConfigPatch {
            max_batch_size: Some(5),
            error_mode: Some(ErrorMode::Propagate),
            ..Default::default()
        };
        let merged = base.merge(&patch);
        assert_eq!(merged.max_batch_size(), 5);
        assert_eq!(merged.error_mode(), ErrorMode::Propagate);
        assert_eq!(merged.history_size(), 10);
        assert_eq!(merged.batch_interval(), base.batch_interval());
    }

    #[test]
    fn validate_rejects_zero_batch_size() {
        let config = Config::default().with_max_batch_size(0);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn zero_interval_is_fine_without_batching() {
        let config = Config::default()
            .with_batching(false)
            .with_batch_interval(Duration::ZERO);
        assert!(config.validate().is_ok());
        assert!(config.with_batching(true).validate().is_err());
    }

    #[test]
    fn json_round_trip_uses_milliseconds() {
        let config = Config::default().with_batch_interval(Duration::from_millis(40));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"batch_interval_ms\":40"));
        assert_eq!(Config::from_json(&json).unwrap(), config);
    }

    #[test]
    fn from_json_fills_defaults() {
        let config = Config::from_json(r#"{"event_whitelist": ["a", "b"]}"#).unwrap();
        assert_eq!(config.whitelist().len(), 2);
        assert_eq!(config.max_batch_size(), 50);
    }

    #[test]
    fn patch_rejects_unknown_keys() {
        assert!(ConfigPatch::from_json(r#"{"maxBatchSize": 3}"#).is_err());
    }

    #[test]
    fn patch_rejects_mistyped_values() {
        assert!(ConfigPatch::from_json(r#"{"max_batch_size": "ten"}"#).is_err());
    }

    #[test]
    fn patch_from_config_reproduces_config() {
        let config = Config::default().with_cache(false).with_debug(true);
        let merged = Config::default().merge(&ConfigPatch::from(config.clone()));
        assert_eq!(merged, config);
    }

    #[test]
    fn summary_reports_zero_cache_when_disabled() {
        let summary = Config::default().with_cache(false).summary();
        assert_eq!(summary.cache_size, 0);
    }
}
