use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, Weak,
    atomic::{AtomicU64, Ordering},
};

use serde::Serialize;
use tokio::{runtime::Handle, sync::watch};

use crate::{
    Config, ConfigSummary, Error, InstanceId, MessageSource, PayloadSink, Pipeline, Result,
    pipeline::PipelineInner,
};

const DEFAULT_INSTANCE: &str = "default";

/// Table of live [`Pipeline`]s sharing one upstream [`MessageSource`].
///
/// The source is installed when the first pipeline registers and removed
/// when the last one is destroyed or dropped. While installed, every payload
/// the source delivers is handed to each registered pipeline independently.
///
/// ```rust
/// use tapbus::{Config, InstanceRegistry, ManualSource};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> tapbus::Result<()> {
/// let source = ManualSource::new();
/// let registry = InstanceRegistry::new(source.clone());
///
/// let pipeline = registry.create_instance(Some(Config::default()))?;
/// assert!(pipeline.is_ready());
/// assert_eq!(registry.info().active_instances, 1);
///
/// pipeline.destroy();
/// assert!(!source.is_installed());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InstanceRegistry {
    shared: Arc<RegistryShared>,
}

pub(crate) struct RegistryShared {
    source: Arc<dyn MessageSource>,
    state: Mutex<State>,
    default: Mutex<Option<Pipeline>>,
    ready: watch::Sender<bool>,
    next_slot: AtomicU64,
}

#[derive(Default)]
struct State {
    entries: Vec<Entry>,
    installed: bool,
    transitioning: bool,
}

struct Entry {
    slot: u64,
    id: InstanceId,
    pipeline: Weak<PipelineInner>,
}

/// Registry overview returned by [`InstanceRegistry::info`].
#[derive(Debug, Clone, Serialize)]
pub struct RegistryInfo {
    pub active_instances: usize,
    pub instances: Vec<InstanceSummary>,
    pub interception_installed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub config: ConfigSummary,
}

impl InstanceRegistry {
    pub fn new<S: MessageSource + 'static>(source: S) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            shared: Arc::new(RegistryShared {
                source: Arc::new(source),
                state: Mutex::new(State::default()),
                default: Mutex::new(None),
                ready,
                next_slot: AtomicU64::new(1),
            }),
        }
    }

    /// Create and register a pipeline with a generated id.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if `config` does not validate
    /// - [`Error::NoRuntime`] outside a Tokio runtime
    /// - [`Error::InstallFailed`] if this is the first pipeline and the
    ///   message source cannot be installed
    pub fn create_instance(&self, config: Option<Config>) -> Result<Pipeline> {
        self.create(InstanceId::anonymous(), config.unwrap_or_default())
    }

    /// Like [`create_instance`](Self::create_instance) with a caller-chosen id.
    ///
    /// # Errors
    ///
    /// Additionally returns [`Error::DuplicateInstance`] if a live pipeline
    /// already uses `id`.
    pub fn create_named_instance(
        &self,
        id: impl Into<InstanceId>,
        config: Option<Config>,
    ) -> Result<Pipeline> {
        self.create(id.into(), config.unwrap_or_default())
    }

    /// The shared default pipeline, built on first use with the default
    /// configuration. A destroyed default is replaced by a fresh one.
    pub fn default_instance(&self) -> Result<Pipeline> {
        let mut slot = self
            .shared
            .default
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pipeline) = slot.as_ref().filter(|p| !p.is_destroyed()) {
            return Ok(pipeline.clone());
        }
        let pipeline = self.create(InstanceId::new(DEFAULT_INSTANCE), Config::default())?;
        *slot = Some(pipeline.clone());
        Ok(pipeline)
    }

    pub fn info(&self) -> RegistryInfo {
        let (pipelines, installed) = {
            let state = self.shared.state();
            (state.live(), state.installed)
        };
        RegistryInfo {
            active_instances: pipelines.len(),
            instances: pipelines
                .iter()
                .map(|p| InstanceSummary {
                    id: p.id().clone(),
                    config: p.config().summary(),
                })
                .collect(),
            interception_installed: installed,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.shared.state().installed
    }

    fn create(&self, id: InstanceId, config: Config) -> Result<Pipeline> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let slot = self.shared.next_slot.fetch_add(1, Ordering::Relaxed);
        let pipeline = Pipeline::new(
            id,
            slot,
            config,
            Arc::downgrade(&self.shared),
            self.shared.ready.subscribe(),
            runtime,
        );
        self.shared.register(&pipeline, slot)?;
        Ok(pipeline)
    }
}

impl RegistryShared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(self: &Arc<Self>, pipeline: &Pipeline, slot: u64) -> Result<()> {
        {
            let mut state = self.state();
            state.entries.retain(|e| e.pipeline.strong_count() > 0);
            if state.entries.iter().any(|e| &e.id == pipeline.id()) {
                return Err(Error::DuplicateInstance(pipeline.id().clone()));
            }
            state.entries.push(Entry {
                slot,
                id: pipeline.id().clone(),
                pipeline: pipeline.downgrade(),
            });
            tracing::debug!(instance = %pipeline.id(), active = state.entries.len(), "pipeline registered");
        }

        if let Err(e) = self.reconcile() {
            self.state().entries.retain(|entry| entry.slot != slot);
            return Err(e);
        }
        Ok(())
    }

    /// Remove the pipeline registered under `slot`; uninstall the source if
    /// nothing is left.
    pub(crate) fn unregister(self: &Arc<Self>, slot: u64) {
        {
            let mut state = self.state();
            let before = state.entries.len();
            state
                .entries
                .retain(|e| e.slot != slot && e.pipeline.strong_count() > 0);
            if state.entries.len() == before {
                return;
            }
            tracing::debug!(active = state.entries.len(), "pipeline unregistered");
        }
        // a concurrent registration may turn this into a reinstall
        if let Err(e) = self.reconcile() {
            tracing::warn!(error = %e, "message source install failed");
        }
    }

    /// Bring the source installation in line with the entry table.
    ///
    /// Source calls run without the state lock held, so a source may deliver
    /// payloads from inside `install`. Only one caller drives transitions at
    /// a time; others leave their change for it to pick up on its next loop.
    fn reconcile(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state();
        loop {
            let wanted = !state.entries.is_empty();
            if state.transitioning || wanted == state.installed {
                return Ok(());
            }
            state.transitioning = true;
            drop(state);

            let outcome = if wanted {
                self.source.install(self.sink())
            } else {
                self.source.uninstall();
                Ok(())
            };

            state = self.state();
            state.transitioning = false;
            match outcome {
                Ok(()) => {
                    state.installed = wanted;
                    self.ready.send_replace(wanted);
                    if wanted {
                        tracing::debug!("message source installed");
                    } else {
                        tracing::debug!("message source uninstalled");
                    }
                }
                Err(e @ Error::InstallFailed(_)) => return Err(e),
                Err(e) => return Err(Error::InstallFailed(Arc::new(e))),
            }
        }
    }

    fn sink(self: &Arc<Self>) -> PayloadSink {
        let registry = Arc::downgrade(self);
        PayloadSink::new(move |raw| {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let targets = registry.state().live();
            for pipeline in targets {
                pipeline.intake(raw);
            }
        })
    }
}

impl State {
    fn live(&self) -> Vec<Pipeline> {
        self.entries
            .iter()
            .filter_map(|e| e.pipeline.upgrade().map(Pipeline::from_inner))
            .collect()
    }
}

impl Drop for RegistryShared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.installed {
            self.source.uninstall();
            state.installed = false;
            self.ready.send_replace(false);
        }
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state();
        f.debug_struct("InstanceRegistry")
            .field("instances", &state.entries.len())
            .field("installed", &state.installed)
            .finish()
    }
}
