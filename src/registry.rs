use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use rand::seq::SliceRandom;
use rand::thread_rng;
use tracing::info;

use crate::config::NodeConfig;

/// A physical backend endpoint (`host:port`). Health and connection state
/// are keyed by address, never by node name: one node may have several
/// addresses and one address may back several nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addr(Arc<str>);

impl Addr {
    pub fn new(addr: impl AsRef<str>) -> Self {
        Self(Arc::from(addr.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct NodeEntry {
    addrs: VecDeque<Addr>,
}

/// Maps logical node names to their physical addresses and tracks which
/// alternate is currently selected.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: HashMap<Arc<str>, NodeEntry>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Multi-address lists are shuffled once here so
    /// independent processes stagger which alternate they prefer.
    pub fn insert(&mut self, name: &str, config: &NodeConfig) {
        let mut addrs: Vec<Addr> = config.addresses().map(Addr::new).collect();
        if addrs.len() > 1 {
            addrs.shuffle(&mut thread_rng());
        }
        self.nodes.insert(
            Arc::from(name),
            NodeEntry {
                addrs: addrs.into(),
            },
        );
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.nodes.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// The currently selected address for `node`.
    pub fn address_of(&self, node: &str) -> Option<Addr> {
        self.nodes
            .get(node)
            .and_then(|entry| entry.addrs.front().cloned())
    }

    pub fn has_alternates(&self, node: &str) -> bool {
        self.nodes
            .get(node)
            .map(|entry| entry.addrs.len() > 1)
            .unwrap_or(false)
    }

    /// Move the selected address to the back of the list and return the
    /// new selection. A no-op for nodes with a single address.
    pub fn rotate(&mut self, node: &str) -> Option<Addr> {
        let entry = self.nodes.get_mut(node)?;
        if entry.addrs.len() > 1 {
            let retired = entry.addrs.pop_front()?;
            entry.addrs.push_back(retired.clone());
            let selected = entry.addrs.front().cloned()?;
            info!(node, from = %retired, to = %selected, "rotated to alternate address");
            return Some(selected);
        }
        entry.addrs.front().cloned()
    }

    /// Every address referenced by any registered node.
    pub fn addresses(&self) -> HashSet<Addr> {
        self.nodes
            .values()
            .flat_map(|entry| entry.addrs.iter().cloned())
            .collect()
    }

    pub fn node_names(&self) -> Vec<Arc<str>> {
        self.nodes.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multi(addrs: &[&str]) -> NodeConfig {
        NodeConfig::Multi {
            addresses: addrs.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn single_address_rotation_is_a_noop() {
        let mut registry = NodeRegistry::new();
        registry.insert(
            "solo",
            &NodeConfig::Single {
                address: "127.0.0.1:6379".into(),
            },
        );
        let selected = registry.address_of("solo").unwrap();
        assert_eq!(registry.rotate("solo"), Some(selected.clone()));
        assert_eq!(registry.address_of("solo"), Some(selected));
        assert!(!registry.has_alternates("solo"));
    }

    #[test]
    fn rotation_cycles_through_every_alternate() {
        let mut registry = NodeRegistry::new();
        registry.insert("pool", &multi(&["a:1", "b:2", "c:3"]));
        assert!(registry.has_alternates("pool"));

        let mut seen = HashSet::new();
        seen.insert(registry.address_of("pool").unwrap());
        for _ in 0..2 {
            seen.insert(registry.rotate("pool").unwrap());
        }
        assert_eq!(seen.len(), 3);

        // A full cycle returns to the original selection.
        let start = registry.address_of("pool").unwrap();
        registry.rotate("pool");
        registry.rotate("pool");
        registry.rotate("pool");
        assert_eq!(registry.address_of("pool"), Some(start));
    }

    #[test]
    fn addresses_cover_all_nodes() {
        let mut registry = NodeRegistry::new();
        registry.insert("pool", &multi(&["a:1", "b:2"]));
        registry.insert(
            "solo",
            &NodeConfig::Single {
                address: "c:3".into(),
            },
        );
        let addrs = registry.addresses();
        assert_eq!(addrs.len(), 3);
        assert!(addrs.contains(&Addr::new("c:3")));

        registry.remove("pool");
        assert_eq!(registry.addresses().len(), 1);
        assert!(registry.address_of("pool").is_none());
    }

    #[test]
    fn unknown_nodes_resolve_to_nothing() {
        let mut registry = NodeRegistry::new();
        assert!(registry.address_of("ghost").is_none());
        assert!(registry.rotate("ghost").is_none());
        assert!(!registry.remove("ghost"));
    }
}
