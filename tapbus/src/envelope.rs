use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use serde_json::Value;

/// A classified event: the unit carried through batching, history, cache and
/// dispatch.
///
/// Created once at intake and never mutated afterwards. Listeners receive it
/// as `Arc<Envelope>`, so every subscriber reads the same immutable value.
///
/// - `event_type`: value of the type discriminator field.
/// - `payload`: the whole parsed message, discriminator included.
/// - `received_at`: classification time in milliseconds since the Unix epoch.
/// - `sequence`: per-pipeline ordinal, strictly increasing in intake order.
#[derive(Clone, PartialEq, Serialize)]
pub struct Envelope {
    event_type: String,
    payload: Value,
    received_at: u64,
    sequence: u64,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(event_type: impl Into<String>, payload: Value, sequence: u64) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            received_at: now_millis(),
            sequence,
        }
    }

    #[inline]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    #[inline]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Milliseconds since the Unix epoch at classification time.
    #[inline]
    pub fn received_at(&self) -> u64 {
        self.received_at
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Shorthand for `self.payload().get(field)`.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("type", &self.event_type)
            .field("sequence", &self.sequence)
            .field("received_at", &self.received_at)
            .field("payload", &self.payload)
            .finish()
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope {{ type: {}, sequence: {}, payload: {} }}",
            self.event_type, self.sequence, self.payload
        )
    }
}
