use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::{Config, Error, Logger, Result, envelope::now_millis};

/// Number of example payloads kept per discovered event type.
pub const MAX_SAMPLES: usize = 3;

/// Census entry for one event type seen during discovery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredEvent {
    pub event_type: String,
    pub count: u64,
    /// Milliseconds since the Unix epoch.
    pub first_seen: u64,
    pub last_seen: u64,
    /// Copies of the first payloads observed, at most [`MAX_SAMPLES`].
    pub samples: Vec<Value>,
}

/// Time-boxed census of every event type flowing through a pipeline.
///
/// Records while a discovery window is open, or permanently when the
/// configuration enables discovery mode. The window itself is driven by
/// [`Pipeline::discover`](crate::Pipeline::discover); this type only holds
/// the state machine (`Idle -> Discovering -> Idle`) and the records.
#[derive(Debug)]
pub struct DiscoveryRecorder {
    records: HashMap<String, DiscoveredEvent>,
    limit: usize,
    always_on: bool,
    window_open: bool,
    logger: Logger,
}

impl DiscoveryRecorder {
    pub fn new(config: &Config, logger: Logger) -> Self {
        Self {
            records: HashMap::new(),
            limit: config.discovery_limit(),
            always_on: config.discovery_mode(),
            window_open: false,
            logger,
        }
    }

    pub fn reconfigure(&mut self, config: &Config, logger: Logger) {
        self.limit = config.discovery_limit();
        self.always_on = config.discovery_mode();
        self.logger = logger;
    }

    #[inline]
    pub fn is_recording(&self) -> bool {
        self.window_open || self.always_on
    }

    pub fn is_window_open(&self) -> bool {
        self.window_open
    }

    /// Open a window: drop previous records and start recording.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DiscoveryInProgress`] if a window is already open.
    pub fn open_window(&mut self) -> Result<()> {
        if self.window_open {
            return Err(Error::DiscoveryInProgress);
        }
        self.records.clear();
        self.window_open = true;
        self.logger.debug(format_args!("discovery window opened"));
        Ok(())
    }

    /// Close the window and return the census, most frequent type first.
    pub fn close_window(&mut self) -> Vec<DiscoveredEvent> {
        self.window_open = false;
        let snapshot = self.snapshot();
        self.logger.debug(format_args!(
            "discovery window closed with {} event types",
            snapshot.len()
        ));
        snapshot
    }

    /// Abandon an open window without producing a result.
    pub fn abort_window(&mut self) {
        self.window_open = false;
    }

    pub fn record(&mut self, event_type: &str, payload: &Value) {
        if !self.is_recording() {
            return;
        }
        let now = now_millis();
        if let Some(entry) = self.records.get_mut(event_type) {
            entry.count += 1;
            entry.last_seen = now;
            if entry.samples.len() < MAX_SAMPLES {
                entry.samples.push(payload.clone());
            }
            return;
        }
        if self.records.len() >= self.limit {
            self.logger.trace(format_args!(
                "discovery limit {} reached, ignoring '{}'",
                self.limit, event_type
            ));
            return;
        }
        self.records.insert(
            event_type.to_string(),
            DiscoveredEvent {
                event_type: event_type.to_string(),
                count: 1,
                first_seen: now,
                last_seen: now,
                samples: vec![payload.clone()],
            },
        );
    }

    /// Current records sorted by descending count, then by type name.
    pub fn snapshot(&self) -> Vec<DiscoveredEvent> {
        let mut out: Vec<DiscoveredEvent> = self.records.values().cloned().collect();
        out.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.event_type.cmp(&b.event_type))
        });
        out
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::InstanceId;

    fn recorder(config: Config) -> DiscoveryRecorder {
        let logger = Logger::new(InstanceId::new("test"), &config);
        DiscoveryRecorder::new(&config, logger)
    }

    #[test]
    fn idle_recorder_ignores_events() {
        let mut r = recorder(Config::default());
        r.record("foo", &json!({}));
        assert!(r.snapshot().is_empty());
    }

    #[test]
    fn window_census_sorted_by_count() {
        let mut r = recorder(Config::default());
        r.open_window().unwrap();
        r.record("bar", &json!({"type": "bar"}));
        for i in 0..3 {
            r.record("foo", &json!({"type": "foo", "i": i}));
        }
        let snap = r.close_window();

        assert_eq!(snap.len(), 2);
        assert_eq!((snap[0].event_type.as_str(), snap[0].count), ("foo", 3));
        assert_eq!((snap[1].event_type.as_str(), snap[1].count), ("bar", 1));
        assert!(!r.is_recording());
    }

    #[test]
    fn samples_are_capped() {
        let mut r = recorder(Config::default());
        r.open_window().unwrap();
        for i in 0..10 {
            r.record("foo", &json!({ "i": i }));
        }
        let snap = r.close_window();
        assert_eq!(snap[0].count, 10);
        assert_eq!(snap[0].samples, vec![json!({"i": 0}), json!({"i": 1}), json!({"i": 2})]);
        assert!(snap[0].first_seen <= snap[0].last_seen);
    }

    #[test]
    fn reopening_while_open_is_rejected() {
        let mut r = recorder(Config::default());
        r.open_window().unwrap();
        assert_eq!(r.open_window(), Err(Error::DiscoveryInProgress));
    }

    #[test]
    fn new_window_clears_previous_records() {
        let mut r = recorder(Config::default());
        r.open_window().unwrap();
        r.record("old", &json!({}));
        r.close_window();
        r.open_window().unwrap();
        assert!(r.snapshot().is_empty());
    }

    #[test]
    fn limit_caps_distinct_types() {
        let mut r = recorder(Config::default().with_discovery_limit(2));
        r.open_window().unwrap();
        r.record("a", &json!({}));
        r.record("b", &json!({}));
        r.record("c", &json!({}));
        r.record("a", &json!({}));
        let snap = r.close_window();
        assert_eq!(snap.len(), 2);
        assert!(snap.iter().all(|e| e.event_type != "c"));
    }

    #[test]
    fn discovery_mode_records_without_window() {
        let mut r = recorder(Config::default().with_discovery_mode(true));
        r.record("foo", &json!({}));
        assert_eq!(r.snapshot().len(), 1);
        assert!(!r.is_window_open());
    }

    #[test]
    fn ties_are_ordered_by_name() {
        let mut r = recorder(Config::default());
        r.open_window().unwrap();
        r.record("zeta", &json!({}));
        r.record("alpha", &json!({}));
        let names: Vec<_> = r.close_window().into_iter().map(|e| e.event_type).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
