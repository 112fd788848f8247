use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use crate::{Error, Result};

/// Entry point a [`MessageSource`] calls for every raw payload it intercepts.
///
/// Cheap to clone. Delivery never blocks: each pipeline screens the payload
/// and queues it for its own intake worker.
#[derive(Clone)]
pub struct PayloadSink(Arc<dyn Fn(&str) + Send + Sync>);

impl PayloadSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self(Arc::new(deliver))
    }

    #[inline]
    pub fn deliver(&self, raw: &str) {
        (self.0)(raw)
    }
}

impl fmt::Debug for PayloadSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PayloadSink")
    }
}

/// The upstream interception point shared by every pipeline.
///
/// The [`InstanceRegistry`](crate::InstanceRegistry) calls
/// [`install`](Self::install) when the first pipeline is registered and
/// [`uninstall`](Self::uninstall) when the last one goes away. Between the
/// two, the source hands every inbound text frame to the sink.
///
/// # Example
///
/// ```rust
/// use std::sync::Mutex;
/// use tapbus::{MessageSource, PayloadSink, Result};
///
/// #[derive(Default)]
/// struct Socket {
///     sink: Mutex<Option<PayloadSink>>,
/// }
///
/// impl MessageSource for Socket {
///     fn install(&self, sink: PayloadSink) -> Result<()> {
///         *self.sink.lock().unwrap() = Some(sink);
///         Ok(())
///     }
///
///     fn uninstall(&self) {
///         self.sink.lock().unwrap().take();
///     }
/// }
/// ```
pub trait MessageSource: Send + Sync {
    /// Start forwarding payloads to `sink`.
    ///
    /// # Errors
    ///
    /// Any error is fatal for the pipeline being created; the registry
    /// surfaces it as [`Error::InstallFailed`].
    fn install(&self, sink: PayloadSink) -> Result<()>;

    /// Stop forwarding. Called once the last pipeline is gone.
    fn uninstall(&self) {}
}

#[derive(Debug, thiserror::Error)]
#[error("manual source refused installation")]
struct InstallRefused;

/// In-memory [`MessageSource`] fed by explicit [`push`](Self::push) calls.
///
/// Clones share the same installation, so a test or an embedder can keep a
/// handle while the registry owns another.
#[derive(Clone, Default)]
pub struct ManualSource {
    inner: Arc<ManualInner>,
}

#[derive(Default)]
struct ManualInner {
    sink: Mutex<Option<PayloadSink>>,
    refuse_install: AtomicBool,
    installs: AtomicUsize,
}

impl ManualSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent [`install`](MessageSource::install) calls fail.
    pub fn fail_install(&self, refuse: bool) {
        self.inner.refuse_install.store(refuse, Ordering::Relaxed);
    }

    /// Forward `raw` to the installed sink. Returns `false` when nothing is
    /// installed.
    pub fn push(&self, raw: &str) -> bool {
        // clone out so the sink runs without the lock held
        let sink = self
            .inner
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match sink {
            Some(sink) => {
                sink.deliver(raw);
                true
            }
            None => false,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.inner
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Number of successful installations so far.
    pub fn install_count(&self) -> usize {
        self.inner.installs.load(Ordering::Relaxed)
    }
}

impl MessageSource for ManualSource {
    fn install(&self, sink: PayloadSink) -> Result<()> {
        if self.inner.refuse_install.load(Ordering::Relaxed) {
            return Err(Error::install_failed(InstallRefused));
        }
        *self
            .inner
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
        self.inner.installs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn uninstall(&self) {
        self.inner
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl fmt::Debug for ManualSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualSource")
            .field("installed", &self.is_installed())
            .field("installs", &self.install_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting() -> (PayloadSink, Arc<Mutex<Vec<String>>>) {
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let s = seen.clone();
        (PayloadSink::new(move |raw| s.lock().unwrap().push(raw.to_string())), seen)
    }

    #[test]
    fn push_without_install_is_dropped() {
        let source = ManualSource::new();
        assert!(!source.push("{}"));
        assert!(!source.is_installed());
    }

    #[test]
    fn installed_sink_receives_payloads() {
        let source = ManualSource::new();
        let (sink, seen) = collecting();
        source.install(sink).unwrap();

        assert!(source.clone().push(r#"{"type":"a"}"#));
        assert_eq!(*seen.lock().unwrap(), vec![r#"{"type":"a"}"#.to_string()]);
        assert_eq!(source.install_count(), 1);
    }

    #[test]
    fn uninstall_detaches_sink() {
        let source = ManualSource::new();
        let (sink, seen) = collecting();
        source.install(sink).unwrap();
        source.uninstall();

        assert!(!source.push("{}"));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn refused_install_reports_install_failed() {
        let source = ManualSource::new();
        source.fail_install(true);
        let (sink, _) = collecting();

        let err = source.install(sink).unwrap_err();
        assert!(matches!(err, Error::InstallFailed(_)));
        assert!(!source.is_installed());
    }
}
