use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{BoxError, Envelope};

static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);

/// Outcome of a listener invocation. `Err` counts as a listener failure.
pub type ListenerResult = std::result::Result<(), BoxError>;

type Callback = dyn Fn(&Envelope) -> ListenerResult + Send + Sync;

/// Identity of a [`Listener`]. Registrations, removal and de-duplication
/// during fan-out all go by this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LISTENER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// A callback with a stable identity.
///
/// Cloning a `Listener` keeps its identity, so the same listener can be
/// registered under several keys (say `items_updated` and `items_*`) and
/// still fires once per emission.
///
/// ```rust
/// use tapbus::Listener;
///
/// let listener = Listener::new(|envelope| {
///     println!("{} -> {}", envelope.event_type(), envelope.payload());
///     Ok(())
/// });
/// let same = listener.clone();
/// assert_eq!(listener.id(), same.id());
/// ```
#[derive(Clone)]
pub struct Listener {
    id: ListenerId,
    // set on `once` wrappers so that removing the original also removes them
    origin: Option<ListenerId>,
    callback: Arc<Callback>,
}

impl Listener {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Envelope) -> ListenerResult + Send + Sync + 'static,
    {
        Self {
            id: ListenerId::next(),
            origin: None,
            callback: Arc::new(callback),
        }
    }

    pub(crate) fn wrapping<F>(id: ListenerId, origin: ListenerId, callback: F) -> Self
    where
        F: Fn(&Envelope) -> ListenerResult + Send + Sync + 'static,
    {
        Self {
            id,
            origin: Some(origin),
            callback: Arc::new(callback),
        }
    }

    #[inline]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Returns `true` if this is `id` itself or a wrapper registered on its behalf.
    #[inline]
    pub(crate) fn answers_to(&self, id: ListenerId) -> bool {
        self.id == id || self.origin == Some(id)
    }

    #[inline]
    pub(crate) fn call(&self, envelope: &Envelope) -> ListenerResult {
        (self.callback)(envelope)
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// One or more subscription keys.
///
/// Converts from `&str`, `String`, arrays, slices and vectors of them, so
/// `on("chat", ..)` and `on(["chat", "items_*"], ..)` both work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys(pub(crate) Vec<String>);

impl Keys {
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for Keys {
    fn from(key: &str) -> Self {
        Keys(vec![key.to_string()])
    }
}

impl From<String> for Keys {
    fn from(key: String) -> Self {
        Keys(vec![key])
    }
}

impl From<&String> for Keys {
    fn from(key: &String) -> Self {
        Keys(vec![key.clone()])
    }
}

impl<const N: usize> From<[&str; N]> for Keys {
    fn from(keys: [&str; N]) -> Self {
        Keys(keys.iter().map(|k| k.to_string()).collect())
    }
}

impl From<&[&str]> for Keys {
    fn from(keys: &[&str]) -> Self {
        Keys(keys.iter().map(|k| k.to_string()).collect())
    }
}

impl From<Vec<String>> for Keys {
    fn from(keys: Vec<String>) -> Self {
        Keys(keys)
    }
}

impl From<Vec<&str>> for Keys {
    fn from(keys: Vec<&str>) -> Self {
        Keys(keys.into_iter().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn clones_share_identity() {
        let a = Listener::new(|_| Ok(()));
        let b = a.clone();
        let c = Listener::new(|_| Ok(()));
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn wrapper_answers_to_origin() {
        let original = Listener::new(|_| Ok(()));
        let wrapper = Listener::wrapping(ListenerId::next(), original.id(), |_| Ok(()));
        assert!(wrapper.answers_to(original.id()));
        assert!(wrapper.answers_to(wrapper.id()));
        assert!(!original.answers_to(wrapper.id()));
    }

    #[test]
    fn call_returns_callback_result() {
        let failing = Listener::new(|_| Err("nope".into()));
        let envelope = Envelope::new("a", Value::Null, 0);
        let err = failing.call(&envelope).unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }

    #[test]
    fn keys_from_various_shapes() {
        assert_eq!(Keys::from("a").as_slice(), ["a"]);
        assert_eq!(Keys::from(["a", "b*"]).as_slice(), ["a", "b*"]);
        assert_eq!(Keys::from(vec!["x".to_string()]).as_slice(), ["x"]);
    }
}
