use std::{
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind},
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use serde_json::Value;
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot, watch},
};
use tokio_util::sync::CancellationToken;

use crate::{
    Config, ConfigPatch, DiscoveredEvent, Envelope, Error, InstanceId, Keys, Listener, Logger,
    MetricsSnapshot, Result, Subscription,
    batch::{BatchProcessor, BatchScheduler},
    discovery::DiscoveryRecorder,
    dispatcher::Dispatcher,
    intake::{Classifier, Verdict},
    internal::worker,
    metrics::Metrics,
    registry::RegistryShared,
    store::{EventCache, History},
};

/// Batches taking longer than this are reported when profiling is on.
const SLOW_BATCH: Duration = Duration::from_millis(16);

/// An isolated event pipeline.
///
/// Each pipeline has its own configuration, listeners, history, cache,
/// metrics and discovery state, and receives every payload delivered by the
/// shared [`MessageSource`](crate::MessageSource). Pipelines are created
/// through an [`InstanceRegistry`](crate::InstanceRegistry).
///
/// `Pipeline` is a cheap handle; clones refer to the same instance. When the
/// last handle is dropped the instance is torn down as if
/// [`destroy`](Self::destroy) had been called.
///
/// # Flow
///
/// 1. [`intake`](Self::intake) screens a raw payload on the caller's thread
///    and queues it for the intake worker
/// 2. the worker parses it, applies the type filters and hands envelopes to
///    the batch scheduler
/// 3. each flushed batch is appended to history and cache, then emitted to
///    listeners according to the configured [`ErrorMode`](crate::ErrorMode)
///
/// ```rust
/// use std::time::Duration;
/// use tapbus::{InstanceRegistry, Listener, ManualSource};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> tapbus::Result<()> {
/// let source = ManualSource::new();
/// let registry = InstanceRegistry::new(source.clone());
/// let pipeline = registry.create_instance(None)?;
///
/// pipeline.on("price_*", Listener::new(|envelope| {
///     println!("{envelope}");
///     Ok(())
/// }));
///
/// source.push(r#"{"type":"price_update","px":101.5}"#);
/// tokio::time::sleep(Duration::from_millis(50)).await;
/// assert_eq!(pipeline.event_count(Some("price_update")), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

pub(crate) struct PipelineInner {
    id: InstanceId,
    slot: u64,
    settings: RwLock<Arc<Settings>>,
    dispatcher: Dispatcher,
    metrics: Arc<Metrics>,
    discovery: Mutex<DiscoveryRecorder>,
    batch: BatchScheduler,
    store: Mutex<Store>,
    sequence: AtomicU64,
    intake: mpsc::Sender<String>,
    cancel: CancellationToken,
    destroyed: AtomicBool,
    registry: Weak<RegistryShared>,
    ready: watch::Receiver<bool>,
    runtime: Handle,
}

struct Settings {
    config: Config,
    logger: Logger,
    classifier: Classifier,
}

impl Settings {
    fn new(id: &InstanceId, config: Config) -> Self {
        Self {
            logger: Logger::new(id.clone(), &config),
            classifier: Classifier::new(&config),
            config,
        }
    }
}

struct Store {
    history: History,
    cache: EventCache,
}

fn cache_capacity(config: &Config) -> usize {
    if config.cache_enabled() {
        config.cache_size()
    } else {
        0
    }
}

impl Pipeline {
    pub(crate) fn new(
        id: InstanceId,
        slot: u64,
        config: Config,
        registry: Weak<RegistryShared>,
        ready: watch::Receiver<bool>,
        runtime: Handle,
    ) -> Self {
        let settings = Settings::new(&id, config);
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(settings.config.intake_channel_capacity());

        let inner = Arc::new_cyclic(|weak: &Weak<PipelineInner>| {
            let pipeline = weak.clone();
            let processor: BatchProcessor = Arc::new(move |batch: Vec<Arc<Envelope>>| {
                match pipeline.upgrade() {
                    Some(inner) => inner.process_batch(batch),
                    None => Ok(()),
                }
            });
            let config = &settings.config;
            let logger = settings.logger.clone();

            PipelineInner {
                dispatcher: Dispatcher::new(
                    config,
                    logger.clone(),
                    metrics.clone(),
                    runtime.clone(),
                ),
                discovery: Mutex::new(DiscoveryRecorder::new(config, logger.clone())),
                batch: BatchScheduler::new(
                    config,
                    logger,
                    processor,
                    runtime.clone(),
                    cancel.clone(),
                ),
                store: Mutex::new(Store {
                    history: History::new(config.history_size()),
                    cache: EventCache::new(cache_capacity(config)),
                }),
                id,
                slot,
                settings: RwLock::new(Arc::new(settings)),
                metrics,
                sequence: AtomicU64::new(1),
                intake: tx,
                cancel: cancel.clone(),
                destroyed: AtomicBool::new(false),
                registry,
                ready,
                runtime: runtime.clone(),
            }
        });

        runtime.spawn(worker::run(rx, Arc::downgrade(&inner), cancel));
        inner.settings().logger.debug(format_args!("pipeline created"));
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<PipelineInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<PipelineInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> &InstanceId {
        &self.inner.id
    }

    /// Returns `true` if both handles refer to the same pipeline.
    pub fn same_instance(&self, other: &Pipeline) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Feed one raw payload into the pipeline.
    ///
    /// Runs the cheap rejection filters and queues the survivor for the
    /// intake worker; never blocks. A payload that does not fit in the
    /// intake channel is dropped and counted. The
    /// [`InstanceRegistry`](crate::InstanceRegistry) calls this for every
    /// payload its source delivers.
    pub fn intake(&self, raw: &str) {
        let inner = &self.inner;
        if inner.is_destroyed() {
            return;
        }
        let settings = inner.settings();
        if !settings.classifier.screen(raw) {
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(_)) = inner.intake.try_send(raw.to_owned()) {
            inner.metrics.record_dropped();
            settings
                .logger
                .debug(format_args!("intake channel full, payload dropped"));
        }
    }

    /// Register `listener` under one or more event-type keys. A key
    /// containing `*` is a wildcard pattern.
    pub fn on(&self, keys: impl Into<Keys>, listener: Listener) -> Subscription {
        self.inner.dispatcher.subscribe(keys, listener)
    }

    /// Register `listener` under `key` for exactly one invocation.
    pub fn once(&self, key: &str, listener: Listener) -> Subscription {
        self.inner.dispatcher.subscribe_once(key, listener)
    }

    /// Remove `listener` from `keys`.
    pub fn off(&self, keys: impl Into<Keys>, listener: &Listener) {
        self.inner.dispatcher.unsubscribe(keys, listener);
    }

    /// Remove all listeners of `key`, or every listener when `None`.
    pub fn off_all(&self, key: Option<&str>) {
        self.inner.dispatcher.unsubscribe_all(key);
    }

    pub fn listener_count(&self, key: Option<&str>) -> usize {
        self.inner.dispatcher.listener_count(key)
    }

    /// Every key with at least one listener, sorted.
    pub fn listened_types(&self) -> Vec<String> {
        self.inner.dispatcher.registered_types()
    }

    /// Emit an event directly to the listeners, bypassing intake, batching,
    /// history and cache. Returns the number of listeners notified.
    ///
    /// # Errors
    ///
    /// [`Error::Destroyed`] after teardown, or the first listener failure
    /// under [`ErrorMode::Propagate`](crate::ErrorMode::Propagate).
    pub fn emit(&self, event_type: impl Into<String>, payload: Value) -> Result<usize> {
        self.inner.ensure_alive()?;
        let envelope = Envelope::new(event_type, payload, self.inner.next_sequence());
        self.inner.dispatcher.emit(Arc::new(envelope))
    }

    /// Open a discovery window for `duration`.
    ///
    /// The returned future resolves with a census of every event type seen
    /// during the window, most frequent first. It fails immediately with
    /// [`Error::DiscoveryInProgress`] if another window is open, and with
    /// [`Error::DiscoveryAborted`] if the pipeline is torn down first.
    pub fn discover(&self, duration: Duration) -> Discovery {
        match self.inner.open_discovery(duration) {
            Ok(rx) => Discovery::pending(rx),
            Err(e) => Discovery::failed(e),
        }
    }

    /// Census recorded so far, most frequent type first.
    ///
    /// With [`Config::with_discovery_mode`] on, records accumulate for the
    /// life of the pipeline; otherwise this reflects the last window. Opening
    /// a new window starts from scratch.
    pub fn discovered_events(&self) -> Vec<DiscoveredEvent> {
        self.inner.discovery().snapshot()
    }

    /// Returns `true` while a [`discover`](Self::discover) window is open.
    pub fn is_discovering(&self) -> bool {
        self.inner.discovery().is_window_open()
    }

    /// The `limit` most recent processed envelopes (all when `None`), oldest
    /// first.
    pub fn event_history(&self, limit: Option<usize>) -> Vec<Arc<Envelope>> {
        self.inner.store().history.recent(limit)
    }

    /// Every event type classified since the last metrics reset, sorted.
    pub fn event_types(&self) -> Vec<String> {
        self.inner.metrics.event_types()
    }

    /// Events classified for `event_type`, or in total when `None`.
    pub fn event_count(&self, event_type: Option<&str>) -> u64 {
        self.inner.metrics.event_count(event_type)
    }

    pub fn cached_event(&self, event_type: &str) -> Option<Arc<Envelope>> {
        self.inner.store().cache.get(event_type)
    }

    /// Event types currently cached, next to be evicted first.
    pub fn cached_types(&self) -> Vec<String> {
        self.inner.store().cache.types()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    /// Toggle duration sampling and slow-batch warnings.
    pub fn enable_profiling(&self, enabled: bool) -> Result<()> {
        self.configure(ConfigPatch {
            profiling: Some(enabled),
            ..ConfigPatch::default()
        })
    }

    /// Merge `patch` into the current configuration.
    ///
    /// The merged configuration is validated as a whole before anything
    /// changes; on error the pipeline keeps its previous configuration.
    /// History and cache are trimmed to the new capacities immediately.
    /// The intake channel capacity is fixed at creation.
    pub fn configure(&self, patch: ConfigPatch) -> Result<()> {
        self.inner.configure(&patch)
    }

    pub fn config(&self) -> Config {
        self.inner.settings().config.clone()
    }

    /// Returns `true` while the upstream source is installed and this
    /// pipeline is alive.
    pub fn is_ready(&self) -> bool {
        !self.inner.is_destroyed() && *self.inner.ready.borrow()
    }

    /// Wait until the upstream source is installed.
    ///
    /// # Errors
    ///
    /// [`Error::Destroyed`] if the pipeline has been torn down or its
    /// registry is gone.
    pub async fn wait_for_ready(&self) -> Result<()> {
        self.inner.ensure_alive()?;
        let mut ready = self.inner.ready.clone();
        ready
            .wait_for(|installed| *installed)
            .await
            .map(|_| ())
            .map_err(|_| Error::Destroyed(self.inner.id.clone()))
    }

    /// Empty history, cache and the batch queue, and reset metrics.
    /// Listeners stay registered.
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Tear the pipeline down: unregister it, drop all listeners and state,
    /// and stop its worker and timers. Idempotent.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// Envelopes waiting in the batch queue.
    pub fn queued(&self) -> usize {
        self.inner.batch.size()
    }

    /// Flush the batch queue now instead of waiting for the timer.
    pub fn flush(&self) -> bool {
        self.inner.batch.flush()
    }
}

impl PipelineInner {
    fn settings(&self) -> Arc<Settings> {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn discovery(&self) -> MutexGuard<'_, DiscoveryRecorder> {
        self.discovery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Destroyed(self.id.clone()));
        }
        Ok(())
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Parse and classify one screened payload. Runs on the intake worker.
    pub(crate) fn classify(&self, raw: &str) {
        let started = Instant::now();
        let settings = self.settings();
        let events = match settings.classifier.parse(raw) {
            Ok(events) => events,
            Err(e) => {
                settings
                    .logger
                    .debug(format_args!("malformed payload ignored: {e}"));
                return;
            }
        };

        for (event_type, payload) in events {
            match settings.classifier.verdict(&event_type) {
                Verdict::Accept => {}
                verdict => {
                    self.metrics.record_dropped();
                    settings
                        .logger
                        .trace(format_args!("'{event_type}' filtered: {verdict:?}"));
                    continue;
                }
            }

            let envelope = Arc::new(Envelope::new(event_type, payload, self.next_sequence()));
            self.discovery()
                .record(envelope.event_type(), envelope.payload());
            let elapsed = settings.config.profiling().then(|| started.elapsed());
            self.metrics.record_event(envelope.event_type(), elapsed);
            self.batch.add(envelope);
        }
    }

    fn process_batch(&self, batch: Vec<Arc<Envelope>>) -> Result<()> {
        let started = Instant::now();
        let settings = self.settings();
        let size = batch.len();

        for envelope in batch {
            let outcome = catch_unwind(AssertUnwindSafe(|| self.deliver(envelope.clone())));
            match outcome {
                Ok(Ok(())) => {}
                // listener failures were already counted by the dispatcher
                Ok(Err(e)) if e.is_listener_failure() => {}
                Ok(Err(e)) => {
                    self.metrics.record_error();
                    settings
                        .logger
                        .event_error(envelope.event_type(), &e, "event processing failed");
                }
                Err(_) => {
                    self.metrics.record_error();
                    settings.logger.event_error(
                        envelope.event_type(),
                        &"panic",
                        "event processing panicked",
                    );
                }
            }
        }

        self.metrics.record_batch();
        let elapsed = started.elapsed();
        if settings.config.profiling() && elapsed > SLOW_BATCH {
            settings.logger.warn(format_args!(
                "slow batch: {size} events took {}ms",
                elapsed.as_millis()
            ));
        }
        Ok(())
    }

    fn deliver(&self, envelope: Arc<Envelope>) -> Result<()> {
        {
            let mut store = self.store();
            store.history.push(envelope.clone());
            store.cache.insert(envelope.clone());
        }
        self.dispatcher.emit(envelope).map(|_| ())
    }

    fn configure(&self, patch: &ConfigPatch) -> Result<()> {
        self.ensure_alive()?;
        let (config, logger) = {
            let mut current = self.settings.write().unwrap_or_else(PoisonError::into_inner);
            let config = current.config.merge(patch);
            config.validate()?;
            if config.intake_channel_capacity() != current.config.intake_channel_capacity() {
                return Err(Error::invalid_config(
                    "intake_channel_capacity is fixed when the pipeline is created",
                ));
            }

            let next = Settings::new(&self.id, config.clone());
            let logger = next.logger.clone();
            self.dispatcher.reconfigure(&config, logger.clone());
            self.discovery().reconfigure(&config, logger.clone());
            {
                let mut store = self.store();
                store.history.set_capacity(config.history_size());
                store.cache.set_capacity(cache_capacity(&config));
            }
            *current = Arc::new(next);
            (config, logger)
        };
        // may flush, which reads the settings again
        self.batch.reconfigure(&config, logger.clone());
        logger.debug(format_args!("configuration updated"));
        Ok(())
    }

    fn open_discovery(self: &Arc<Self>, duration: Duration) -> Result<oneshot::Receiver<Vec<DiscoveredEvent>>> {
        self.ensure_alive()?;
        self.discovery().open_window()?;

        let (tx, rx) = oneshot::channel();
        let pipeline = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(duration) => {
                    if let Some(inner) = pipeline.upgrade() {
                        let census = inner.discovery().close_window();
                        let _ = tx.send(census);
                    }
                }
            }
        });
        Ok(rx)
    }

    fn clear(&self) {
        {
            let mut store = self.store();
            store.history.clear();
            store.cache.clear();
        }
        self.batch.clear();
        self.metrics.reset();
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.slot);
        }
        self.dispatcher.unsubscribe_all(None);
        self.clear();
        {
            let mut discovery = self.discovery();
            discovery.abort_window();
            discovery.clear();
        }
        self.cancel.cancel();
        self.settings().logger.info(format_args!("pipeline destroyed"));
    }
}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        if !self.destroyed.load(Ordering::Acquire) {
            if let Some(registry) = self.registry.upgrade() {
                registry.unregister(self.slot);
            }
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (history, cached) = {
            let store = self.inner.store();
            (store.history.len(), store.cache.len())
        };
        f.debug_struct("Pipeline")
            .field("id", &self.inner.id)
            .field("destroyed", &self.inner.is_destroyed())
            .field("queued", &self.inner.batch.size())
            .field("history", &history)
            .field("cached", &cached)
            .finish()
    }
}

/// Future returned by [`Pipeline::discover`].
///
/// Resolves when the discovery window closes. Dropping it does not close the
/// window early.
#[derive(Debug)]
pub struct Discovery {
    state: DiscoveryState,
}

#[derive(Debug)]
enum DiscoveryState {
    Failed(Option<Error>),
    Pending(oneshot::Receiver<Vec<DiscoveredEvent>>),
}

impl Discovery {
    fn pending(rx: oneshot::Receiver<Vec<DiscoveredEvent>>) -> Self {
        Self {
            state: DiscoveryState::Pending(rx),
        }
    }

    fn failed(error: Error) -> Self {
        Self {
            state: DiscoveryState::Failed(Some(error)),
        }
    }
}

impl Future for Discovery {
    type Output = Result<Vec<DiscoveredEvent>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            DiscoveryState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(Error::DiscoveryAborted)))
            }
            DiscoveryState::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|census| census.map_err(|_| Error::DiscoveryAborted)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;
    use crate::{ErrorMode, InstanceRegistry, ManualSource};

    struct Fixture {
        _registry: InstanceRegistry,
        source: ManualSource,
        pipeline: Pipeline,
    }

    fn fixture(config: Config) -> Fixture {
        let source = ManualSource::new();
        let registry = InstanceRegistry::new(source.clone());
        let pipeline = registry.create_instance(Some(config)).unwrap();
        Fixture {
            _registry: registry,
            source,
            pipeline,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn counter() -> (Listener, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let listener = Listener::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (listener, hits)
    }

    #[tokio::test(start_paused = true)]
    async fn payload_round_trips_to_listener() {
        let f = fixture(Config::default());
        let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
        let s = seen.clone();
        f.pipeline.on(
            "order",
            Listener::new(move |e| {
                s.lock().unwrap().push(e.payload().clone());
                Ok(())
            }),
        );

        let raw = r#"{"type":"order","id":7,"legs":[{"px":1.25},{"px":null}],"tag":"ü"}"#;
        f.source.push(raw);
        settle().await;

        let expected: Value = serde_json::from_str(raw).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![expected]);
        assert_eq!(f.pipeline.event_count(Some("order")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn whitelist_drops_and_counts_others() {
        let f = fixture(Config::default().with_whitelist(["a"]));
        f.source.push(r#"{"type":"a"}"#);
        f.source.push(r#"{"type":"b"}"#);
        settle().await;

        let history = f.pipeline.event_history(None);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type(), "a");
        assert_eq!(f.pipeline.metrics().dropped_events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cheap_rejections_are_not_counted() {
        let f = fixture(Config::default());
        f.source.push("ping");
        f.source.push(r#"{"kind":"x","value":1}"#);
        f.source.push(r#"{"type":"broken""#);
        f.source.push(r#"{"type":42,"x":1}"#);
        settle().await;

        let m = f.pipeline.metrics();
        assert_eq!(m.total_events, 0);
        assert_eq!(m.dropped_events, 0);
        assert_eq!(m.errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn array_frame_yields_one_event_per_element() {
        let f = fixture(Config::default());
        f.source.push(r#"[{"type":"a"},{"type":"b"},{"type":"a"}]"#);
        settle().await;

        assert_eq!(f.pipeline.event_count(Some("a")), 2);
        assert_eq!(f.pipeline.event_count(None), 3);
        let order: Vec<_> = f
            .pipeline
            .event_history(None)
            .iter()
            .map(|e| e.event_type().to_string())
            .collect();
        assert_eq!(order, vec!["a", "b", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_window_reports_census() {
        let f = fixture(Config::default());
        let window = f.pipeline.discover(Duration::from_millis(100));
        for _ in 0..3 {
            f.source.push(r#"{"type":"foo"}"#);
        }
        f.source.push(r#"{"type":"bar"}"#);

        assert!(f.pipeline.is_discovering());
        let census = window.await.unwrap();
        assert!(!f.pipeline.is_discovering());
        assert_eq!(census.len(), 2);
        assert_eq!((census[0].event_type.as_str(), census[0].count), ("foo", 3));
        assert_eq!((census[1].event_type.as_str(), census[1].count), ("bar", 1));
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_mode_records_without_a_window() {
        let f = fixture(
            Config::default()
                .with_discovery_mode(true)
                .with_blacklist(["noise"]),
        );
        f.source.push(r#"{"type":"x","n":1}"#);
        f.source.push(r#"{"type":"x","n":2}"#);
        f.source.push(r#"{"type":"noise"}"#);
        settle().await;

        assert!(!f.pipeline.is_discovering());
        let census = f.pipeline.discovered_events();
        assert_eq!(census.len(), 1);
        assert_eq!(census[0].event_type, "x");
        assert_eq!(census[0].count, 2);
        assert_eq!(census[0].samples.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_discovery_is_rejected() {
        let f = fixture(Config::default());
        let first = f.pipeline.discover(Duration::from_millis(100));
        let second = f.pipeline.discover(Duration::from_millis(100)).await;
        assert_eq!(second.unwrap_err(), Error::DiscoveryInProgress);

        assert!(first.await.unwrap().is_empty());
        // idle again
        let third = f.pipeline.discover(Duration::from_millis(10));
        assert!(third.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_aborts_discovery() {
        let f = fixture(Config::default());
        let window = f.pipeline.discover(Duration::from_secs(10));
        f.pipeline.destroy();
        assert_eq!(window.await.unwrap_err(), Error::DiscoveryAborted);
    }

    #[tokio::test]
    async fn max_listeners_rejects_excess() {
        let f = fixture(Config::default().with_max_listeners_per_event(2));
        for _ in 0..3 {
            let (l, _) = counter();
            f.pipeline.on("x", l);
        }
        assert_eq!(f.pipeline.listener_count(Some("x")), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn isolated_failures_do_not_stop_siblings() {
        let f = fixture(Config::default().with_error_mode(ErrorMode::Isolate));
        f.pipeline.on("x", Listener::new(|_| Err("boom".into())));
        f.pipeline.on("x", Listener::new(|_| panic!("listener panic")));
        let (ok, hits) = counter();
        f.pipeline.on("x", ok);

        f.source.push(r#"{"type":"x"}"#);
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(f.pipeline.metrics().errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn propagate_failures_counted_once_on_batch_path() {
        let f = fixture(Config::default().with_error_mode(ErrorMode::Propagate));
        f.pipeline.on("x", Listener::new(|_| Err("boom".into())));
        let (after, hits) = counter();
        f.pipeline.on("x", after);

        f.source.push(r#"{"type":"x"}"#);
        f.source.push(r#"{"type":"x"}"#);
        settle().await;

        // the failing listener was registered first and stops the fan-out
        assert_eq!(f.pipeline.metrics().errors, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(f.pipeline.event_history(None).len(), 2);
    }

    #[tokio::test]
    async fn direct_emit_under_propagate_returns_error() {
        let f = fixture(Config::default().with_error_mode(ErrorMode::Propagate));
        f.pipeline.on("x", Listener::new(|_| Err("boom".into())));
        let err = f.pipeline.emit("x", json!({})).unwrap_err();
        assert!(err.is_listener_failure());
    }

    #[tokio::test]
    async fn emit_reaches_exact_and_wildcard_once() {
        let f = fixture(Config::default().with_error_mode(ErrorMode::Suppress));
        let (listener, hits) = counter();
        f.pipeline.on(["items_updated", "items_*"], listener);

        assert_eq!(f.pipeline.emit("items_updated", json!({})).unwrap(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(f.pipeline.emit("items_removed", json!({})).unwrap(), 1);
        assert_eq!(f.pipeline.emit("other", json!({})).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn once_fires_a_single_time() {
        let f = fixture(Config::default().with_error_mode(ErrorMode::Suppress));
        let (listener, hits) = counter();
        f.pipeline.once("tick", listener);

        f.source.push(r#"{"type":"tick"}"#);
        f.source.push(r#"{"type":"tick"}"#);
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(f.pipeline.listener_count(Some("tick")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn history_and_cache_respect_capacity() {
        let f = fixture(Config::default().with_history_size(2).with_cache_size(2));
        for t in ["a", "b", "c"] {
            f.source.push(&format!(r#"{{"type":"{t}"}}"#));
        }
        settle().await;

        let history = f.pipeline.event_history(None);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].event_type(), "c");
        assert!(f.pipeline.cached_event("a").is_none());
        assert!(f.pipeline.cached_event("c").is_some());
        assert_eq!(f.pipeline.cached_types(), vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn configure_trims_and_rejects_invalid() {
        let f = fixture(Config::default());
        for i in 0..5 {
            f.source.push(&format!(r#"{{"type":"t{i}"}}"#));
        }
        settle().await;

        f.pipeline
            .configure(ConfigPatch {
                history_size: Some(2),
                enable_cache: Some(false),
                ..ConfigPatch::default()
            })
            .unwrap();
        assert_eq!(f.pipeline.event_history(None).len(), 2);
        assert!(f.pipeline.cached_event("t4").is_none());

        let err = f
            .pipeline
            .configure(ConfigPatch {
                max_batch_size: Some(0),
                history_size: Some(10),
                ..ConfigPatch::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert_eq!(f.pipeline.config().history_size(), 2);
    }

    #[tokio::test]
    async fn intake_capacity_is_fixed_after_creation() {
        let f = fixture(Config::default());
        let err = f
            .pipeline
            .configure(ConfigPatch {
                intake_channel_capacity: Some(1),
                ..ConfigPatch::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert_eq!(f.pipeline.config().intake_channel_capacity(), 1024);

        // restating the current value is accepted
        f.pipeline
            .configure(ConfigPatch {
                intake_channel_capacity: Some(1024),
                history_size: Some(5),
                ..ConfigPatch::default()
            })
            .unwrap();
        assert_eq!(f.pipeline.config().history_size(), 5);
    }

    #[tokio::test]
    async fn full_intake_channel_drops_payloads() {
        let f = fixture(Config::default().with_intake_channel_capacity(1));
        // the worker cannot run until this task yields
        for _ in 0..5 {
            f.source.push(r#"{"type":"burst"}"#);
        }
        assert_eq!(f.pipeline.metrics().dropped_events, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn configure_changes_type_filters() {
        let f = fixture(Config::default());
        f.pipeline
            .configure(ConfigPatch::from_json(r#"{"event_blacklist":["noise"]}"#).unwrap())
            .unwrap();
        f.source.push(r#"{"type":"noise"}"#);
        f.source.push(r#"{"type":"signal"}"#);
        settle().await;

        assert_eq!(f.pipeline.event_types(), vec!["signal".to_string()]);
        assert_eq!(f.pipeline.metrics().dropped_events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_keeps_listeners() {
        let f = fixture(Config::default());
        let (listener, _) = counter();
        f.pipeline.on("a", listener);
        f.source.push(r#"{"type":"a"}"#);
        settle().await;

        f.pipeline.clear();
        assert!(f.pipeline.event_history(None).is_empty());
        assert!(f.pipeline.cached_event("a").is_none());
        assert_eq!(f.pipeline.metrics().total_events, 0);
        assert_eq!(f.pipeline.listener_count(None), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_detaches_everything() {
        let f = fixture(Config::default());
        let (listener, hits) = counter();
        f.pipeline.on("a", listener);
        assert!(f.pipeline.is_ready());

        f.pipeline.destroy();
        f.pipeline.destroy();
        assert!(!f.source.is_installed());
        assert!(!f.pipeline.is_ready());
        assert_eq!(f.pipeline.listener_count(None), 0);

        f.pipeline.intake(r#"{"type":"a"}"#);
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(
            f.pipeline.configure(ConfigPatch::default()).unwrap_err(),
            Error::Destroyed(f.pipeline.id().clone())
        );
        assert!(f.pipeline.wait_for_ready().await.is_err());
    }

    #[tokio::test]
    async fn ready_once_registered() {
        let f = fixture(Config::default());
        f.pipeline.wait_for_ready().await.unwrap();
        assert!(f.pipeline.is_ready());
    }

    #[tokio::test]
    async fn unbatched_events_are_processed_by_the_worker() {
        let f = fixture(Config::default().with_batching(false));
        f.source.push(r#"{"type":"a"}"#);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.pipeline.event_history(None).len(), 1);
        assert_eq!(f.pipeline.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn profiling_toggle_controls_samples() {
        let f = fixture(Config::default());
        f.pipeline.enable_profiling(false).unwrap();
        f.source.push(r#"{"type":"a"}"#);
        settle().await;
        assert_eq!(f.pipeline.metrics().samples, 0);

        f.pipeline.enable_profiling(true).unwrap();
        f.source.push(r#"{"type":"a"}"#);
        settle().await;
        assert_eq!(f.pipeline.metrics().samples, 1);
    }
}
