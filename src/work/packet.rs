//! Per-fiber context carried through a step chain
//!
//! A packet holds two maps:
//! - keyed values: loosely typed scratch data addressed by string keys
//! - components: service objects registered explicitly by their concrete type
//!
//! Values are stored behind `Arc`, so [`Packet::copy`] is a shallow copy suitable for
//! handing to forked fibers.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type Value = Arc<dyn Any + Send + Sync>;

/// Well-known packet keys
pub mod keys {
    /// Continue token of a paginated list request
    pub const CONTINUE: &str = "continue";
    /// Request step of the Kubernetes call in flight
    pub const REQUEST: &str = "request";
    /// Response of the most recent Kubernetes call
    pub const RESPONSE: &str = "response";
    /// Terminal failure of the fiber that owned the packet
    pub const FAILURE: &str = "failure";
    /// Server a restart chain is working on
    pub const SERVER_NAME: &str = "serverName";
    /// Cluster the server belongs to, if any
    pub const CLUSTER_NAME: &str = "clusterName";
    /// Cluster topology of the domain
    pub const DOMAIN_TOPOLOGY: &str = "domainTopology";
    /// One-shot marker set when a roll starts, consumed when it completes
    pub const ROLL_START_EVENT_GENERATED: &str = "rollStartEventGenerated";
}

#[derive(Default, Clone)]
pub struct Packet {
    values: HashMap<String, Value>,
    components: HashMap<TypeId, Value>,
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed read of a keyed value; `None` when absent or of another type
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Shared handle to a keyed value
    pub fn get_arc<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.values
            .get(key)
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
    }

    pub fn put<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Arc::new(value));
    }

    pub fn put_arc<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: Arc<T>) {
        self.values.insert(key.into(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Remove a keyed value, returning it when it was present with the requested type
    ///
    /// A value of a different type is still removed.
    pub fn remove<T: Any + Send + Sync>(&mut self, key: &str) -> Option<Arc<T>> {
        self.values
            .remove(key)
            .and_then(|v| v.downcast::<T>().ok())
    }

    /// Register a component under its concrete type, replacing any previous one
    pub fn put_spi<T: Any + Send + Sync>(&mut self, component: Arc<T>) {
        self.components.insert(TypeId::of::<T>(), component);
    }

    /// Look up a component by capability type
    pub fn spi<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.components
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|c| c.downcast::<T>().ok())
    }

    pub fn remove_spi<T: Any + Send + Sync>(&mut self) -> Option<Arc<T>> {
        self.components
            .remove(&TypeId::of::<T>())
            .and_then(|c| c.downcast::<T>().ok())
    }

    /// Shallow copy for a forked fiber
    ///
    /// Both maps are duplicated; the values themselves are shared.
    pub fn copy(&self) -> Self {
        self.clone()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("Packet")
            .field("keys", &keys)
            .field("components", &self.components.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Topology(&'static str);

    #[test]
    fn test_get_returns_typed_value() {
        let mut packet = Packet::new();
        packet.put(keys::SERVER_NAME, "ms1".to_string());

        assert_eq!(
            packet.get::<String>(keys::SERVER_NAME).map(String::as_str),
            Some("ms1")
        );
        assert!(packet.get::<i32>(keys::SERVER_NAME).is_none());
        assert!(packet.get::<String>(keys::CLUSTER_NAME).is_none());
    }

    #[test]
    fn test_remove_clears_key() {
        let mut packet = Packet::new();
        packet.put(keys::CONTINUE, "token".to_string());

        let removed = packet.remove::<String>(keys::CONTINUE);
        assert_eq!(removed.as_deref().map(String::as_str), Some("token"));
        assert!(!packet.contains(keys::CONTINUE));
        assert!(packet.remove::<String>(keys::CONTINUE).is_none());
    }

    #[test]
    fn test_spi_lookup_by_type() {
        let mut packet = Packet::new();
        packet.put_spi(Arc::new(Topology("cluster-1")));

        assert_eq!(packet.spi::<Topology>().map(|t| t.0), Some("cluster-1"));
        assert!(packet.spi::<String>().is_none());

        packet.remove_spi::<Topology>();
        assert!(packet.spi::<Topology>().is_none());
    }

    #[test]
    fn test_copy_is_independent_but_shares_values() {
        let mut parent = Packet::new();
        parent.put_spi(Arc::new(Topology("shared")));
        parent.put(keys::CLUSTER_NAME, "c1".to_string());

        let mut child = parent.copy();
        child.put(keys::SERVER_NAME, "ms1".to_string());
        child.remove::<String>(keys::CLUSTER_NAME);

        assert!(!parent.contains(keys::SERVER_NAME));
        assert!(parent.contains(keys::CLUSTER_NAME));

        let parent_topology = parent.spi::<Topology>();
        let child_topology = child.spi::<Topology>();
        assert!(matches!(
            (parent_topology, child_topology),
            (Some(a), Some(b)) if Arc::ptr_eq(&a, &b)
        ));
    }
}
