//! Intake classification.
//!
//! Raw payloads pass two stages. [`Classifier::screen`] runs on the caller's
//! thread and must stay cheap: length, leading byte and an optional substring
//! probe for the type field. Whatever survives is parsed and classified on
//! the pipeline's intake worker by [`Classifier::parse`] and
//! [`Classifier::verdict`].

use std::collections::BTreeSet;

use serde_json::Value;

use crate::Config;

/// Characters a payload needs beyond the field name: `{"<field>":""}`.
const MIN_OVERHEAD: usize = 7;

/// Outcome of the type filters for one classified event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Accept,
    Blacklisted,
    NotWhitelisted,
}

/// Filter cascade derived from a pipeline's [`Config`]. Rebuilt on every
/// `configure`.
#[derive(Debug, Clone)]
pub(crate) struct Classifier {
    type_field: String,
    needle: String,
    min_len: usize,
    prefilter: bool,
    whitelist: BTreeSet<String>,
    blacklist: BTreeSet<String>,
}

impl Classifier {
    pub(crate) fn new(config: &Config) -> Self {
        let type_field = config.type_field().to_string();
        Self {
            needle: format!("\"{type_field}\""),
            min_len: type_field.len() + MIN_OVERHEAD,
            type_field,
            prefilter: config.prefilter_enabled(),
            whitelist: config.whitelist().clone(),
            blacklist: config.blacklist().clone(),
        }
    }

    /// Cheap reject filters. `false` means the payload cannot carry an event.
    pub(crate) fn screen(&self, raw: &str) -> bool {
        if raw.len() < self.min_len {
            return false;
        }
        match raw.trim_start().as_bytes().first() {
            Some(b'{' | b'[') => {}
            _ => return false,
        }
        !self.prefilter || raw.contains(&self.needle)
    }

    /// Parse `raw` and extract `(event_type, payload)` pairs.
    ///
    /// An object root yields at most one event. An array root is a frame of
    /// messages and yields one event per element that carries a string type
    /// field. Elements without one are skipped silently.
    pub(crate) fn parse(&self, raw: &str) -> serde_json::Result<Vec<(String, Value)>> {
        let root: Value = serde_json::from_str(raw)?;
        let events = match root {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| self.extract(item))
                .collect(),
            other => self.extract(other).into_iter().collect(),
        };
        Ok(events)
    }

    /// Apply the blacklist, then the whitelist (when non-empty).
    pub(crate) fn verdict(&self, event_type: &str) -> Verdict {
        if self.blacklist.contains(event_type) {
            Verdict::Blacklisted
        } else if !self.whitelist.is_empty() && !self.whitelist.contains(event_type) {
            Verdict::NotWhitelisted
        } else {
            Verdict::Accept
        }
    }

    fn extract(&self, payload: Value) -> Option<(String, Value)> {
        let event_type = payload.get(&self.type_field)?.as_str()?.to_string();
        Some((event_type, payload))
    }
}
