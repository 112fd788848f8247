use std::{
    collections::VecDeque,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{Config, Envelope, Logger, Result};

/// Callback receiving each flushed batch, oldest envelope first.
pub type BatchProcessor = Arc<dyn Fn(Vec<Arc<Envelope>>) -> Result<()> + Send + Sync>;

/// Buffers classified envelopes and hands them to a [`BatchProcessor`] in
/// FIFO slices.
///
/// A batch is flushed when the first queued envelope has waited
/// `batch_interval`, or as soon as the queue reaches `max_batch_size`. At
/// most one flush runs at a time: a trigger that arrives while a flush is in
/// progress is a no-op, and whatever is left in the queue afterwards gets a
/// fresh timer.
///
/// Timers are Tokio tasks bound to the scheduler's [`CancellationToken`];
/// cancelling it (pipeline teardown) guarantees no timer fires afterwards.
#[derive(Clone)]
pub struct BatchScheduler {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    processor: BatchProcessor,
    runtime: Handle,
    cancel: CancellationToken,
}

struct State {
    queue: VecDeque<Arc<Envelope>>,
    timer: Option<Timer>,
    flushing: bool,
    enabled: bool,
    interval: Duration,
    max_batch: usize,
    logger: Logger,
    next_timer_id: u64,
}

struct Timer {
    id: u64,
    handle: JoinHandle<()>,
}

impl State {
    fn take_batch(&mut self) -> Vec<Arc<Envelope>> {
        let n = self.queue.len().min(self.max_batch);
        self.queue.drain(..n).collect()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }
}

impl BatchScheduler {
    pub fn new(
        config: &Config,
        logger: Logger,
        processor: BatchProcessor,
        runtime: Handle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    timer: None,
                    flushing: false,
                    enabled: config.batching_enabled(),
                    interval: config.batch_interval(),
                    max_batch: config.max_batch_size(),
                    logger,
                    next_timer_id: 0,
                }),
                processor,
                runtime,
                cancel,
            }),
        }
    }

    /// Queue an envelope, or process it right away when batching is disabled.
    pub fn add(&self, envelope: Arc<Envelope>) {
        let mut state = self.shared.state();
        if !state.enabled {
            let logger = state.logger.clone();
            drop(state);
            self.shared.run(vec![envelope], &logger);
            return;
        }

        state.queue.push_back(envelope);
        if state.queue.len() >= state.max_batch {
            state.cancel_timer();
            drop(state);
            self.flush();
        } else if state.timer.is_none() {
            self.shared.arm(&mut state);
        }
    }

    /// Hand up to `max_batch_size` of the oldest envelopes to the processor.
    ///
    /// Returns `false` without doing anything if the queue is empty or a
    /// flush is already running.
    pub fn flush(&self) -> bool {
        let mut batch = {
            let mut state = self.shared.state();
            if state.flushing || state.queue.is_empty() {
                return false;
            }
            state.flushing = true;
            state.take_batch()
        };

        loop {
            let logger = self.shared.state().logger.clone();
            self.shared.run(batch, &logger);

            let mut state = self.shared.state();
            if !state.enabled && !state.queue.is_empty() {
                // batching was switched off mid-flight: drain what is left
                batch = state.take_batch();
                continue;
            }
            state.flushing = false;
            if !state.queue.is_empty() && state.timer.is_none() {
                self.shared.arm(&mut state);
            }
            return true;
        }
    }

    /// Drop every queued envelope and cancel the pending timer.
    pub fn clear(&self) {
        let mut state = self.shared.state();
        state.queue.clear();
        state.cancel_timer();
    }

    pub fn size(&self) -> usize {
        self.shared.state().queue.len()
    }

    #[cfg(test)]
    fn is_flushing(&self) -> bool {
        self.shared.state().flushing
    }

    #[cfg(test)]
    fn has_pending_timer(&self) -> bool {
        self.shared.state().timer.is_some()
    }

    /// Apply new batching options.
    ///
    /// A pending timer is restarted from scratch when the interval changes.
    /// Disabling batching flushes whatever is queued.
    pub fn reconfigure(&self, config: &Config, logger: Logger) {
        let drain = {
            let mut state = self.shared.state();
            let interval_changed = state.interval != config.batch_interval();
            state.enabled = config.batching_enabled();
            state.interval = config.batch_interval();
            state.max_batch = config.max_batch_size();
            state.logger = logger;

            if !state.enabled {
                state.cancel_timer();
            } else if interval_changed && state.timer.is_some() {
                state.cancel_timer();
                self.shared.arm(&mut state);
            }
            !state.enabled && !state.queue.is_empty()
        };
        if drain {
            self.flush();
        }
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm(self: &Arc<Self>, state: &mut State) {
        if self.cancel.is_cancelled() {
            return;
        }
        let id = state.next_timer_id;
        state.next_timer_id = state.next_timer_id.wrapping_add(1);

        let weak: Weak<Shared> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let interval = state.interval;
        let handle = self.runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(interval) => {
                    if let Some(shared) = weak.upgrade() {
                        BatchScheduler { shared }.on_timer(id);
                    }
                }
            }
        });
        state.timer = Some(Timer { id, handle });
    }

    fn run(&self, batch: Vec<Arc<Envelope>>, logger: &Logger) {
        let size = batch.len();
        match catch_unwind(AssertUnwindSafe(|| (self.processor)(batch))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => logger.error(format_args!("batch of {size} failed: {e}")),
            Err(_) => logger.error(format_args!("batch processor panicked on {size} events")),
        }
    }
}

impl BatchScheduler {
    fn on_timer(&self, id: u64) {
        {
            let mut state = self.shared.state();
            if state.timer.as_ref().map(|t| t.id) != Some(id) {
                // superseded by a flush or a reconfigure
                return;
            }
            state.timer = None;
        }
        if !self.shared.cancel.is_cancelled() {
            self.flush();
        }
    }
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state();
        f.debug_struct("BatchScheduler")
            .field("queued", &state.queue.len())
            .field("flushing", &state.flushing)
            .field("timer", &state.timer.as_ref().map(|t| t.id))
            .field("enabled", &state.enabled)
            .field("interval", &state.interval)
            .field("max_batch", &state.max_batch)
            .finish()
    }
}
