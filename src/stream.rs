//! Stream identifiers for the per-stream pool gate.

use std::fmt;
use std::sync::Arc;

/// An opaque stream identifier, comparable by value.
///
/// Stream IDs gate CPU requests between the shared pool and the local
/// fallback allocator (see
/// [`HybridMemoryPool::activate_stream`](crate::pool::HybridMemoryPool::activate_stream)).
/// Cloning is cheap: the name is interned behind an `Arc`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(Arc<str>);

impl StreamId {
    /// Create a stream ID from a name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// The stream name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({:?})", &*self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_value_equality() {
        let a = StreamId::new("camera0");
        let b = StreamId::from("camera0");
        let c = StreamId::new("camera1");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_map_key() {
        let mut gates: HashMap<StreamId, bool> = HashMap::new();
        gates.insert(StreamId::new("a"), false);
        gates.insert(StreamId::new("a"), true); // overwrite, not duplicate
        assert_eq!(gates.len(), 1);
        assert_eq!(gates[&StreamId::new("a")], true);
    }
}
