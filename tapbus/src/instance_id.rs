use std::{
    hash::Hash,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

static NEXT_ANONYMOUS: AtomicU64 = AtomicU64::new(1);

/// Name of a [`Pipeline`](crate::Pipeline) within an
/// [`InstanceRegistry`](crate::InstanceRegistry).
///
/// Names are unique per registry. Pipelines created without an explicit name
/// get `pipeline-<n>`, where `n` is process-wide and never reused.
///
/// `InstanceId` is cheap to clone; equality takes a pointer fast-path when two
/// ids share an allocation.
#[derive(Debug, Clone, Ord, PartialOrd)]
pub struct InstanceId(Arc<str>);

impl InstanceId {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub(crate) fn anonymous() -> Self {
        let n = NEXT_ANONYMOUS.fetch_add(1, Ordering::Relaxed);
        Self(Arc::from(format!("pipeline-{n}")))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for InstanceId {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

impl Eq for InstanceId {}

impl Hash for InstanceId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for InstanceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_ids_are_unique() {
        let a = InstanceId::anonymous();
        let b = InstanceId::anonymous();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("pipeline-"));
    }

    #[test]
    fn equality_is_by_name() {
        assert_eq!(InstanceId::new("overlay"), InstanceId::from("overlay".to_string()));
    }

    #[test]
    fn serializes_as_plain_string() {
        let json = serde_json::to_string(&InstanceId::new("overlay")).unwrap();
        assert_eq!(json, r#""overlay""#);
    }
}
