//! # tapbus
//!
//! An in-process event pipeline for Tokio.
//!
//! tapbus sits behind a single message source (typically one WebSocket
//! connection), classifies every JSON payload it delivers by a type field,
//! and redistributes the resulting events to any number of independently
//! configured pipelines. Each pipeline batches, filters, caches and
//! instruments its events on its own, so a slow or failing consumer never
//! degrades the others, and the caller delivering payloads never blocks.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use tapbus::*;
//!
//! #[tokio::main]
//! async fn main() -> Result {
//!     let source = ManualSource::new();
//!     let registry = InstanceRegistry::new(source.clone());
//!
//!     let pipeline = registry.create_instance(Some(
//!         Config::default().with_blacklist(["heartbeat"]),
//!     ))?;
//!     pipeline.on("chat_*", Listener::new(|envelope| {
//!         println!("{} {}", envelope.event_type(), envelope.payload());
//!         Ok(())
//!     }));
//!
//!     source.push(r#"{"type":"chat_message","text":"hi"}"#);
//!     source.push(r#"{"type":"heartbeat"}"#);
//!     tokio::time::sleep(Duration::from_millis(50)).await;
//!
//!     assert_eq!(pipeline.metrics().dropped_events, 1);
//!     pipeline.destroy();
//!     Ok(())
//! }
//! ```
//!
//! ## Core Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`InstanceRegistry`] | Creates pipelines and shares one [`MessageSource`] between them |
//! | [`Pipeline`] | Isolated config, listeners, history, cache, metrics and discovery |
//! | [`Listener`] | Callback with a stable [`ListenerId`] |
//! | [`Envelope`] | Classified event: type, JSON payload, arrival time |
//! | [`Config`] / [`ConfigPatch`] | Full configuration and partial updates |
//! | [`ErrorMode`] | How listener failures are contained |
//! | [`MessageSource`] | Contract for the upstream interception point |
//! | [`ManualSource`] | In-memory source fed by explicit `push` calls |
//!
//! ## Event Flow
//!
//! 1. **Intake**: cheap rejection on the caller's thread, then a bounded hand-off
//!    to the pipeline's intake worker (overflow is dropped and counted)
//! 2. **Classification**: JSON parse, type extraction, blacklist then whitelist
//! 3. **Batching**: flushed every `batch_interval` or at `max_batch_size`
//! 4. **Dispatch**: history and cache update, then fan-out to exact and
//!    wildcard subscribers under the configured [`ErrorMode`]
//!
//! ## Discovery
//!
//! [`Pipeline::discover`] opens a time-boxed window and resolves with a census
//! of every event type seen, which is handy when wiring up an unfamiliar
//! feed:
//!
//! ```rust,ignore
//! for event in pipeline.discover(Duration::from_secs(5)).await? {
//!     println!("{:>6} {}", event.count, event.event_type);
//! }
//! ```
//!
//! ## Logging
//!
//! Diagnostics go through [`tracing`](https://docs.rs/tracing), gated per
//! pipeline by [`Config::with_log_level`] and tagged with the pipeline id.
//! Install any subscriber to see them.
//!
//! ## Examples
//!
//! See the `examples/` directory of the crate:
//!
//! - `hello-world.rs`  - One pipeline, two listeners
//! - `multi-instance.rs`  - Several pipelines with different filters and discovery

mod batch;
mod config;
mod discovery;
mod dispatcher;
mod envelope;
mod error;
mod error_mode;
mod instance_id;
mod intake;
mod listener;
mod logger;
mod metrics;
mod pipeline;
mod registry;
mod source;
mod store;

mod internal;

pub mod pattern;

pub use config::{Config, ConfigPatch, ConfigSummary};
pub use discovery::{DiscoveredEvent, MAX_SAMPLES};
pub use dispatcher::Subscription;
pub use envelope::Envelope;
pub use error::{BoxError, Error};
pub use error_mode::ErrorMode;
pub use instance_id::InstanceId;
pub use listener::{Keys, Listener, ListenerId, ListenerResult};
pub use logger::{LogLevel, Logger};
pub use metrics::{MAX_TRACKED_TYPES, MetricsSnapshot, SAMPLE_WINDOW};
pub use pipeline::{Discovery, Pipeline};
pub use registry::{InstanceRegistry, InstanceSummary, RegistryInfo};
pub use source::{ManualSource, MessageSource, PayloadSink};

/// Convenience alias for `Result<T, tapbus::Error>`.
pub type Result<T = ()> = std::result::Result<T, Error>;
