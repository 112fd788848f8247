use std::{
    collections::{HashMap, HashSet},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::runtime::Handle;

use crate::{
    Config, Envelope, Error, ErrorMode, Keys, Listener, ListenerId, Logger, Result,
    metrics::Metrics,
    pattern::{Pattern, is_wildcard},
};

/// Subscription registry and fan-out.
///
/// Maps event-type keys to listener sets. A key is either a literal event
/// type or a wildcard pattern (see [`pattern`](crate::pattern)). An emission
/// reaches the listeners of the literal key plus those of every matching
/// wildcard key, each listener at most once.
///
/// The registry lock is never held while a listener runs, so listeners may
/// subscribe and unsubscribe freely from inside a callback.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

struct Shared {
    registry: Mutex<Registry>,
    settings: RwLock<Settings>,
    metrics: Arc<Metrics>,
    runtime: Handle,
}

#[derive(Clone)]
struct Settings {
    error_mode: ErrorMode,
    max_listeners: usize,
    logger: Logger,
}

#[derive(Default)]
struct Registry {
    exact: HashMap<String, Vec<Listener>>,
    wildcards: HashMap<String, (Pattern, Vec<Listener>)>,
}

impl Registry {
    fn listeners(&self, key: &str) -> Option<&Vec<Listener>> {
        if is_wildcard(key) {
            self.wildcards.get(key).map(|(_, l)| l)
        } else {
            self.exact.get(key)
        }
    }

    fn insert(&mut self, key: &str, listener: &Listener, max: usize) -> Insert {
        let set = if is_wildcard(key) {
            let (_, set) = self
                .wildcards
                .entry(key.to_string())
                .or_insert_with(|| (Pattern::new(key), Vec::new()));
            set
        } else {
            self.exact.entry(key.to_string()).or_default()
        };

        if set.iter().any(|l| l.id() == listener.id()) {
            return Insert::AlreadyPresent;
        }
        if set.len() >= max {
            // a fresh key cannot be full, so no empty entry is left behind
            return Insert::Full;
        }
        set.push(listener.clone());
        Insert::Added
    }

    fn remove(&mut self, key: &str, id: ListenerId) -> bool {
        let (removed, now_empty) = {
            let set = if is_wildcard(key) {
                self.wildcards.get_mut(key).map(|(_, l)| l)
            } else {
                self.exact.get_mut(key)
            };
            let Some(set) = set else {
                return false;
            };
            let before = set.len();
            set.retain(|l| !l.answers_to(id));
            (before != set.len(), set.is_empty())
        };
        if now_empty {
            if is_wildcard(key) {
                self.wildcards.remove(key);
            } else {
                self.exact.remove(key);
            }
        }
        removed
    }

    fn clear_key(&mut self, key: &str) {
        if is_wildcard(key) {
            self.wildcards.remove(key);
        } else {
            self.exact.remove(key);
        }
    }

    /// Listeners for `event_type`, literal key first, de-duplicated by id.
    fn targets(&self, event_type: &str) -> Vec<Listener> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        if let Some(set) = self.exact.get(event_type) {
            for l in set {
                if seen.insert(l.id()) {
                    out.push(l.clone());
                }
            }
        }
        for (pattern, set) in self.wildcards.values() {
            if !pattern.matches(event_type) {
                continue;
            }
            for l in set {
                if seen.insert(l.id()) {
                    out.push(l.clone());
                }
            }
        }
        out
    }
}

enum Insert {
    Added,
    AlreadyPresent,
    Full,
}

impl Dispatcher {
    /// Create a dispatcher that spawns isolated listener invocations on `runtime`.
    pub fn new(config: &Config, logger: Logger, metrics: Arc<Metrics>, runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                settings: RwLock::new(Settings {
                    error_mode: config.error_mode(),
                    max_listeners: config.max_listeners_per_event(),
                    logger,
                }),
                metrics,
                runtime,
            }),
        }
    }

    /// Apply a new configuration. Existing registrations above a lowered
    /// listener cap are kept; the cap applies to new registrations.
    pub fn reconfigure(&self, config: &Config, logger: Logger) {
        let mut settings = self
            .shared
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        settings.error_mode = config.error_mode();
        settings.max_listeners = config.max_listeners_per_event();
        settings.logger = logger;
    }

    /// Register `listener` under every key in `keys`.
    ///
    /// A key whose listener set is already at the configured cap rejects the
    /// registration with a warning; the other keys are unaffected. Registering
    /// the same listener twice under one key is a no-op.
    pub fn subscribe(&self, keys: impl Into<Keys>, listener: Listener) -> Subscription {
        let keys = keys.into().0;
        let settings = self.shared.settings();
        let mut accepted = Vec::with_capacity(keys.len());
        {
            let mut registry = self.shared.registry();
            for key in keys {
                match registry.insert(&key, &listener, settings.max_listeners) {
                    Insert::Added | Insert::AlreadyPresent => accepted.push(key),
                    Insert::Full => settings.logger.warn(format_args!(
                        "listener limit {} reached for '{}', registration rejected",
                        settings.max_listeners, key
                    )),
                }
            }
        }
        Subscription {
            dispatcher: Arc::downgrade(&self.shared),
            keys: accepted,
            listener: listener.id(),
        }
    }

    /// Register `listener` under `key` for a single invocation.
    ///
    /// The wrapper removes itself from the registry before calling
    /// `listener`, and a flag guarantees that emissions already in flight
    /// when it fired cannot invoke it a second time.
    pub fn subscribe_once(&self, key: &str, listener: Listener) -> Subscription {
        let wrapper_id = ListenerId::next();
        let fired = AtomicBool::new(false);
        let weak = Arc::downgrade(&self.shared);
        let owned_key = key.to_string();
        let inner = listener.clone();

        let wrapper = Listener::wrapping(wrapper_id, listener.id(), move |envelope| {
            if fired.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            if let Some(shared) = weak.upgrade() {
                shared.registry().remove(&owned_key, wrapper_id);
            }
            inner.call(envelope)
        });

        let mut subscription = self.subscribe(key, wrapper);
        subscription.listener = wrapper_id;
        subscription
    }

    /// Remove `listener` (and any `once` wrapper registered for it) from `keys`.
    pub fn unsubscribe(&self, keys: impl Into<Keys>, listener: &Listener) {
        self.unsubscribe_id(keys, listener.id());
    }

    /// Remove the listener with `id` from `keys`. Unknown keys or ids are ignored.
    pub fn unsubscribe_id(&self, keys: impl Into<Keys>, id: ListenerId) {
        let mut registry = self.shared.registry();
        for key in keys.into().0 {
            registry.remove(&key, id);
        }
    }

    /// Remove every listener under `key`, or every listener and wildcard
    /// when `key` is `None`.
    pub fn unsubscribe_all(&self, key: Option<&str>) {
        let mut registry = self.shared.registry();
        match key {
            Some(key) => registry.clear_key(key),
            None => *registry = Registry::default(),
        }
    }

    /// Number of listeners registered under exactly `key`, or under all keys
    /// when `key` is `None`.
    pub fn listener_count(&self, key: Option<&str>) -> usize {
        let registry = self.shared.registry();
        match key {
            Some(key) => registry.listeners(key).map_or(0, Vec::len),
            None => {
                registry.exact.values().map(Vec::len).sum::<usize>()
                    + registry.wildcards.values().map(|(_, l)| l.len()).sum::<usize>()
            }
        }
    }

    /// Every key with at least one listener, literal and wildcard, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let registry = self.shared.registry();
        let mut keys: Vec<String> = registry
            .exact
            .keys()
            .chain(registry.wildcards.keys())
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Deliver `envelope` to every matching listener.
    ///
    /// Returns the number of distinct listeners notified (scheduled, under
    /// [`ErrorMode::Isolate`]).
    ///
    /// # Errors
    ///
    /// Only under [`ErrorMode::Propagate`]: the first listener failure, after
    /// which the remaining listeners are skipped.
    pub fn emit(&self, envelope: Arc<Envelope>) -> Result<usize> {
        let targets = self.shared.registry().targets(envelope.event_type());
        if targets.is_empty() {
            return Ok(0);
        }
        let settings = self.shared.settings();

        match settings.error_mode {
            ErrorMode::Isolate => {
                for listener in &targets {
                    let listener = listener.clone();
                    let envelope = envelope.clone();
                    let logger = settings.logger.clone();
                    let metrics = self.shared.metrics.clone();
                    self.shared.runtime.spawn(async move {
                        if let Err(e) = invoke(&listener, &envelope) {
                            report(&logger, &metrics, &envelope, &e);
                        }
                    });
                }
            }
            ErrorMode::Suppress => {
                for listener in &targets {
                    if let Err(e) = invoke(listener, &envelope) {
                        report(&settings.logger, &self.shared.metrics, &envelope, &e);
                    }
                }
            }
            ErrorMode::Propagate => {
                for listener in &targets {
                    if let Err(e) = invoke(listener, &envelope) {
                        report(&settings.logger, &self.shared.metrics, &envelope, &e);
                        return Err(e);
                    }
                }
            }
        }

        Ok(targets.len())
    }
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn invoke(listener: &Listener, envelope: &Envelope) -> Result<()> {
    match catch_unwind(AssertUnwindSafe(|| listener.call(envelope))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::Listener {
            event_type: envelope.event_type().to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(Error::ListenerPanicked {
            event_type: envelope.event_type().to_string(),
        }),
    }
}

fn report(logger: &Logger, metrics: &Metrics, envelope: &Envelope, error: &Error) {
    metrics.record_error();
    logger.event_error(envelope.event_type(), error, "listener failed");
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.shared.registry();
        f.debug_struct("Dispatcher")
            .field("exact_keys", &registry.exact.len())
            .field("wildcard_keys", &registry.wildcards.len())
            .finish()
    }
}

/// Handle to one registration made through [`Dispatcher::subscribe`] or
/// [`Dispatcher::subscribe_once`].
///
/// Dropping the handle keeps the registration alive; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
#[derive(Debug, Clone)]
pub struct Subscription {
    dispatcher: Weak<Shared>,
    keys: Vec<String>,
    listener: ListenerId,
}

impl Subscription {
    /// Remove exactly this registration from exactly the keys it was accepted
    /// under. Calling it again, or after the pipeline is gone, does nothing.
    pub fn unsubscribe(&self) {
        if let Some(shared) = self.dispatcher.upgrade() {
            let mut registry = shared.registry();
            for key in &self.keys {
                registry.remove(key, self.listener);
            }
        }
    }

    /// Keys the registration was accepted under. Keys rejected by the
    /// listener cap are not included.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn listener_id(&self) -> ListenerId {
        self.listener
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared").finish_non_exhaustive()
    }
}
