//! Per-pipeline counters and processing-time samples.
//!
//! Counters use relaxed atomics; they are eventually consistent, not a
//! transactional view. Per-type counts and the timing window sit behind a
//! mutex that is only held for the duration of a single update.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use serde::Serialize;

/// Number of processing-time samples kept for average and peak.
pub const SAMPLE_WINDOW: usize = 100;

/// Distinct event types counted individually. Events of further types only
/// count towards the total and [`MetricsSnapshot::untracked_events`].
pub const MAX_TRACKED_TYPES: usize = 1000;

#[derive(Debug)]
pub struct Metrics {
    total_events: AtomicU64,
    dropped_events: AtomicU64,
    errors: AtomicU64,
    batches_processed: AtomicU64,
    inner: Mutex<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    by_type: HashMap<String, u64>,
    untracked: u64,
    samples: VecDeque<Duration>,
    since: Instant,
}

impl MetricsInner {
    fn new() -> Self {
        Self {
            by_type: HashMap::new(),
            untracked: 0,
            samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            since: Instant::now(),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            total_events: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            batches_processed: AtomicU64::new(0),
            inner: Mutex::new(MetricsInner::new()),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, MetricsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count an accepted event, optionally with the time it took to classify.
    pub fn record_event(&self, event_type: &str, elapsed: Option<Duration>) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner();
        let tracked = inner.by_type.len();
        match inner.by_type.get_mut(event_type) {
            Some(count) => *count += 1,
            None if tracked < MAX_TRACKED_TYPES => {
                inner.by_type.insert(event_type.to_string(), 1);
            }
            None => inner.untracked += 1,
        }
        if let Some(elapsed) = elapsed {
            if inner.samples.len() == SAMPLE_WINDOW {
                inner.samples.pop_front();
            }
            inner.samples.push_back(elapsed);
        }
    }

    #[inline]
    pub fn record_dropped(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_batch(&self) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_events(&self) -> u64 {
        self.total_events.load(Ordering::Relaxed)
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Count for one type, or the total when `event_type` is `None`.
    pub fn event_count(&self, event_type: Option<&str>) -> u64 {
        match event_type {
            Some(t) => self.inner().by_type.get(t).copied().unwrap_or(0),
            None => self.total_events(),
        }
    }

    /// Every event type counted since the last reset, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.inner().by_type.keys().cloned().collect();
        types.sort();
        types
    }

    /// Zero every counter and clear the timing window.
    pub fn reset(&self) {
        let mut inner = self.inner();
        self.total_events.store(0, Ordering::Relaxed);
        self.dropped_events.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.batches_processed.store(0, Ordering::Relaxed);
        *inner = MetricsInner::new();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner();
        let total_events = self.total_events();
        let samples = inner.samples.len();
        let sum: Duration = inner.samples.iter().sum();
        let peak = inner.samples.iter().max().copied().unwrap_or_default();
        let avg = if samples == 0 {
            Duration::ZERO
        } else {
            sum / samples as u32
        };
        let uptime = inner.since.elapsed();
        let secs = uptime.as_secs_f64();
        MetricsSnapshot {
            total_events,
            events_by_type: inner
                .by_type
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            untracked_events: inner.untracked,
            dropped_events: self.dropped_events(),
            errors: self.errors(),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            avg_processing_time: avg,
            peak_processing_time: peak,
            samples,
            uptime,
            events_per_second: if secs > 0.0 {
                total_events as f64 / secs
            } else {
                0.0
            },
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of a pipeline's [`Metrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_events: u64,
    pub events_by_type: BTreeMap<String, u64>,
    /// Accepted events whose type arrived after [`MAX_TRACKED_TYPES`] others.
    pub untracked_events: u64,
    /// Events rejected by the black/whitelist or an overflowing intake channel.
    pub dropped_events: u64,
    /// Listener and batch-processing failures.
    pub errors: u64,
    pub batches_processed: u64,
    pub avg_processing_time: Duration,
    pub peak_processing_time: Duration,
    /// Number of timing samples behind the average and peak.
    pub samples: usize,
    /// Time since creation or the last reset.
    pub uptime: Duration,
    pub events_per_second: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_type_and_total() {
        let m = Metrics::new();
        m.record_event("a", None);
        m.record_event("a", None);
        m.record_event("b", None);

        assert_eq!(m.event_count(None), 3);
        assert_eq!(m.event_count(Some("a")), 2);
        assert_eq!(m.event_count(Some("missing")), 0);
        assert_eq!(m.event_types(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn average_and_peak_from_samples() {
        let m = Metrics::new();
        m.record_event("a", Some(Duration::from_micros(10)));
        m.record_event("a", Some(Duration::from_micros(30)));
        m.record_event("a", None);

        let snap = m.snapshot();
        assert_eq!(snap.samples, 2);
        assert_eq!(snap.avg_processing_time, Duration::from_micros(20));
        assert_eq!(snap.peak_processing_time, Duration::from_micros(30));
    }

    #[test]
    fn sample_window_is_bounded() {
        let m = Metrics::new();
        m.record_event("a", Some(Duration::from_secs(1)));
        for _ in 0..SAMPLE_WINDOW {
            m.record_event("a", Some(Duration::from_micros(1)));
        }
        let snap = m.snapshot();
        assert_eq!(snap.samples, SAMPLE_WINDOW);
        // the one-second outlier has rolled out of the window
        assert_eq!(snap.peak_processing_time, Duration::from_micros(1));
    }

    #[test]
    fn reset_zeroes_everything() {
        let m = Metrics::new();
        m.record_event("a", Some(Duration::from_micros(5)));
        m.record_dropped();
        m.record_error();
        m.record_batch();
        m.reset();

        let snap = m.snapshot();
        assert_eq!(snap.total_events, 0);
        assert_eq!(snap.dropped_events, 0);
        assert_eq!(snap.errors, 0);
        assert_eq!(snap.batches_processed, 0);
        assert_eq!(snap.samples, 0);
        assert_eq!(snap.untracked_events, 0);
        assert!(snap.events_by_type.is_empty());
    }

    #[test]
    fn per_type_counts_are_capped() {
        let m = Metrics::new();
        for i in 0..MAX_TRACKED_TYPES {
            m.record_event(&format!("t{i}"), None);
        }
        m.record_event("late", None);
        m.record_event("late", None);
        m.record_event("t0", None);

        let snap = m.snapshot();
        assert_eq!(snap.events_by_type.len(), MAX_TRACKED_TYPES);
        assert_eq!(snap.events_by_type["t0"], 2);
        assert_eq!(snap.untracked_events, 2);
        assert_eq!(snap.total_events, MAX_TRACKED_TYPES as u64 + 3);
        assert_eq!(m.event_count(Some("late")), 0);
    }

    #[test]
    fn empty_snapshot_has_zero_average() {
        let snap = Metrics::new().snapshot();
        assert_eq!(snap.avg_processing_time, Duration::ZERO);
        assert_eq!(snap.peak_processing_time, Duration::ZERO);
    }
}
