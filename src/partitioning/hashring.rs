//! Consistent hashing implementation with virtual nodes.
//!
//! Each member is represented by multiple virtual nodes (vnodes) placed on a
//! 64-bit ring by xxHash64, so keys spread evenly and adding or removing a
//! member only moves the keys between it and its ring neighbours.

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Number of virtual nodes per member.
/// More vnodes = more even distribution but higher memory usage.
pub const DEFAULT_VNODES_PER_NODE: usize = 256;

/// Hash arbitrary bytes onto the ring using xxHash64.
pub fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    key.hash(&mut hasher);
    hasher.finish()
}

/// A consistent hash ring mapping keys to member ids.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Ring position -> owning member.
    vnodes: BTreeMap<u64, String>,

    /// Number of virtual nodes per member.
    vnodes_per_node: usize,

    /// Members in insertion order.
    nodes: Vec<String>,
}

impl HashRing {
    /// Create a new empty hash ring.
    pub fn new() -> Self {
        Self::with_vnodes(DEFAULT_VNODES_PER_NODE)
    }

    /// Create a new hash ring with custom vnode count.
    pub fn with_vnodes(vnodes_per_node: usize) -> Self {
        Self {
            vnodes: BTreeMap::new(),
            vnodes_per_node: vnodes_per_node.max(1),
            nodes: Vec::new(),
        }
    }

    /// Get the number of members in the ring.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Get all members in the ring.
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Check if a member is in the ring.
    pub fn contains_node(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n == node)
    }

    fn vnode_positions<'a>(&self, node: &'a str) -> impl Iterator<Item = u64> + 'a {
        (0..self.vnodes_per_node).map(move |i| hash_key(format!("{}:{}", node, i).as_bytes()))
    }

    /// Add a member to the ring. Adding an existing member is a no-op.
    pub fn add_node(&mut self, node: &str) {
        if self.contains_node(node) {
            return;
        }
        self.nodes.push(node.to_string());

        let positions: Vec<u64> = self.vnode_positions(node).collect();
        for position in positions {
            self.vnodes.insert(position, node.to_string());
        }
    }

    /// Remove a member from the ring.
    pub fn remove_node(&mut self, node: &str) {
        if !self.contains_node(node) {
            return;
        }
        self.nodes.retain(|n| n != node);

        let positions: Vec<u64> = self.vnode_positions(node).collect();
        for position in positions {
            if self.vnodes.get(&position).is_some_and(|owner| owner == node) {
                self.vnodes.remove(&position);
            }
        }
    }

    /// Distinct members in ring order starting at the key's position.
    ///
    /// The first element is the key's owner; the rest are the successors a
    /// caller falls back to (replicas, or the next healthy backend).
    pub fn walk(&self, key: &[u8]) -> Vec<&str> {
        let hash = hash_key(key);
        let mut seen: Vec<&str> = Vec::with_capacity(self.nodes.len());

        for (_, node) in self.vnodes.range(hash..).chain(self.vnodes.range(..hash)) {
            if !seen.contains(&node.as_str()) {
                seen.push(node.as_str());
                if seen.len() == self.nodes.len() {
                    break;
                }
            }
        }
        seen
    }

    /// Get the owner for a key. Returns None if the ring is empty.
    pub fn get_primary(&self, key: &[u8]) -> Option<&str> {
        let hash = hash_key(key);
        self.vnodes
            .range(hash..)
            .next()
            .or_else(|| self.vnodes.iter().next())
            .map(|(_, node)| node.as_str())
    }

    /// Get up to `count` distinct owners for a key, primary first.
    pub fn get_owners(&self, key: &[u8], count: usize) -> Vec<&str> {
        let mut owners = self.walk(key);
        owners.truncate(count);
        owners
    }

    /// Get the distribution of keys across members for a sample.
    pub fn get_distribution(&self, sample_size: usize) -> HashMap<String, usize> {
        let mut distribution = HashMap::new();
        for i in 0..sample_size {
            let key = format!("sample_key_{}", i);
            if let Some(owner) = self.get_primary(key.as_bytes()) {
                *distribution.entry(owner.to_string()).or_insert(0) += 1;
            }
        }
        distribution
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_of(nodes: &[&str]) -> HashRing {
        let mut ring = HashRing::new();
        for node in nodes {
            ring.add_node(node);
        }
        ring
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::new();
        assert_eq!(ring.node_count(), 0);
        assert!(ring.get_primary(b"key").is_none());
        assert!(ring.get_owners(b"key", 3).is_empty());
    }

    #[test]
    fn test_single_node() {
        let ring = ring_of(&["a"]);
        assert_eq!(ring.get_primary(b"key"), Some("a"));
        assert_eq!(ring.get_owners(b"key", 3), vec!["a"]);
    }

    #[test]
    fn test_owners_are_distinct() {
        let ring = ring_of(&["a", "b", "c"]);
        let owners = ring.get_owners(b"key", 2);
        assert_eq!(owners.len(), 2);
        assert_ne!(owners[0], owners[1]);
        assert_eq!(Some(owners[0]), ring.get_primary(b"key"));

        let walk = ring.walk(b"key");
        assert_eq!(walk.len(), 3);
    }

    #[test]
    fn test_add_remove_node() {
        let mut ring = ring_of(&["a", "b"]);
        ring.remove_node("a");

        assert_eq!(ring.node_count(), 1);
        assert!(!ring.contains_node("a"));
        assert_eq!(ring.get_primary(b"key"), Some("b"));

        ring.remove_node("missing");
        ring.add_node("b");
        assert_eq!(ring.node_count(), 1);
    }

    #[test]
    fn test_distribution() {
        let ring = ring_of(&["a", "b", "c"]);
        let distribution = ring.get_distribution(10000);

        for node in ring.nodes() {
            let count = distribution.get(node).copied().unwrap_or(0);
            assert!(count > 2500 && count < 4500, "Node {} has {} keys", node, count);
        }
    }

    #[test]
    fn test_adding_node_moves_keys_only_to_new_node() {
        let mut ring = ring_of(&["s0", "s1", "s2", "s3", "s4"]);
        let keys: Vec<String> = (0..10_000).map(|i| format!("key-{}", i)).collect();
        let before: Vec<String> = keys
            .iter()
            .map(|k| ring.get_primary(k.as_bytes()).unwrap().to_string())
            .collect();

        ring.add_node("s5");

        let mut moved = 0;
        for (key, old) in keys.iter().zip(&before) {
            let new = ring.get_primary(key.as_bytes()).unwrap();
            if new != old {
                assert_eq!(new, "s5");
                moved += 1;
            }
        }
        // Ideal is 10_000 / 6 ≈ 1667.
        assert!(moved < 2500, "{} keys moved", moved);
        assert!(moved > 800, "{} keys moved", moved);
    }
}
