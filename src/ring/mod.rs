use std::sync::Arc;

use tracing::debug;

/// Number of fixed slots in the bucket array. Protocol-visible: every
/// client maps `hash(key) % BUCKETS` onto the same assignments.
pub const BUCKETS: usize = 1024;

/// Nominal weight given to a node when none is specified.
pub const DEFAULT_WEIGHT: usize = 10;

// Continuum points per unit of weight; the default weight yields 160
// points per node, four per MD5 digest.
const POINTS_PER_WEIGHT: usize = 16;

/// First 32 bits of the MD5 of `key`, big-endian. This value fixes which
/// keys land on which node across independent clients.
pub fn hash32(key: &[u8]) -> u32 {
    let digest = md5::compute(key);
    u32::from_be_bytes([digest.0[0], digest.0[1], digest.0[2], digest.0[3]])
}

/// Consistent-hash ring over logical node names.
///
/// A ketama-style continuum is projected onto a fixed array of
/// [`BUCKETS`] buckets: each bucket takes the node owning the continuum
/// successor of its ring position. Membership changes rebuild the array,
/// touching only buckets whose owning segment changed.
pub struct HashRing {
    nodes: Vec<(Arc<str>, usize)>,
    buckets: Vec<Arc<str>>,
}

impl HashRing {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ring = HashRing {
            nodes: names
                .into_iter()
                .map(|name| (Arc::from(name.into()), DEFAULT_WEIGHT))
                .collect(),
            buckets: Vec::new(),
        };
        ring.rebuild();
        ring
    }

    /// Node that owns `key`, or `None` when the ring is empty.
    pub fn lookup(&self, key: &[u8]) -> Option<&Arc<str>> {
        if self.buckets.is_empty() {
            return None;
        }
        let slot = hash32(key) as usize % BUCKETS;
        Some(&self.buckets[slot])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.iter().any(|(node, _)| node.as_ref() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a node, or update its weight when already present. A weight of
    /// zero removes it.
    pub fn add(&mut self, name: &str, weight: usize) {
        if weight == 0 {
            self.remove(name);
            return;
        }
        match self.nodes.iter_mut().find(|(node, _)| node.as_ref() == name) {
            Some(entry) => entry.1 = weight,
            None => self.nodes.push((Arc::from(name), weight)),
        }
        self.rebuild();
    }

    pub fn remove(&mut self, name: &str) {
        let before = self.nodes.len();
        self.nodes.retain(|(node, _)| node.as_ref() != name);
        if self.nodes.len() != before {
            self.rebuild();
        }
    }

    /// Bucket assignments, exposed for stability checks.
    pub fn buckets(&self) -> &[Arc<str>] {
        &self.buckets
    }

    fn rebuild(&mut self) {
        self.buckets.clear();
        if self.nodes.is_empty() {
            return;
        }

        let mut points: Vec<(u32, &Arc<str>)> = Vec::new();
        for (name, weight) in &self.nodes {
            let digests = weight * POINTS_PER_WEIGHT / 4;
            for replica in 0..digests {
                let label = format!("{}-{}", name, replica);
                let digest = md5::compute(label.as_bytes());
                for align in 0..4 {
                    let window = [
                        digest.0[align * 4],
                        digest.0[align * 4 + 1],
                        digest.0[align * 4 + 2],
                        digest.0[align * 4 + 3],
                    ];
                    points.push((u32::from_be_bytes(window), name));
                }
            }
        }
        // Ties sort by name so every process agrees on the winner.
        points.sort_unstable_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));

        let mut buckets = Vec::with_capacity(BUCKETS);
        let step = (u32::MAX as u64 + 1) / BUCKETS as u64;
        for slot in 0..BUCKETS {
            let position = (slot as u64 * step) as u32;
            let idx = points.partition_point(|(point, _)| *point < position);
            let owner = if idx == points.len() {
                points[0].1
            } else {
                points[idx].1
            };
            buckets.push(owner.clone());
        }
        self.buckets = buckets;
        debug!(nodes = self.nodes.len(), "hash ring rebuilt");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("redis_{}", i)).collect()
    }

    #[test]
    fn key_hash_matches_md5_prefix() {
        // RFC 1321 test vectors: md5("") = d41d8cd9..., md5("abc") = 90015098...
        assert_eq!(hash32(b""), 0xd41d_8cd9);
        assert_eq!(hash32(b"abc"), 0x9001_5098);
    }

    #[test]
    fn lookup_is_deterministic_across_instances() {
        let a = HashRing::new(names(4));
        let b = HashRing::new(names(4));
        for i in 0..200 {
            let key = format!("key-{}", i);
            assert_eq!(a.lookup(key.as_bytes()), b.lookup(key.as_bytes()));
        }
    }

    #[test]
    fn construction_order_does_not_matter() {
        let forward = HashRing::new(names(4));
        let mut reversed = names(4);
        reversed.reverse();
        let backward = HashRing::new(reversed);
        assert_eq!(forward.buckets(), backward.buckets());
    }

    #[test]
    fn every_bucket_maps_to_a_configured_node() {
        let ring = HashRing::new(names(3));
        assert_eq!(ring.buckets().len(), BUCKETS);
        for bucket in ring.buckets() {
            assert!(ring.contains(bucket));
        }
        let distinct: std::collections::HashSet<_> =
            ring.buckets().iter().map(|b| b.to_string()).collect();
        assert!(distinct.len() > 1, "ring collapsed onto a single node");
    }

    #[test]
    fn add_then_remove_restores_assignments() {
        let mut ring = HashRing::new(names(4));
        let before: Vec<_> = ring.buckets().to_vec();
        ring.add("redis_extra", DEFAULT_WEIGHT);
        ring.remove("redis_extra");
        assert_eq!(ring.buckets(), before.as_slice());
    }

    #[test]
    fn removal_only_reassigns_the_victims_buckets() {
        let mut ring = HashRing::new(names(4));
        let before: Vec<_> = ring.buckets().to_vec();
        ring.remove("redis_3");
        for (slot, owner) in ring.buckets().iter().enumerate() {
            if before[slot].as_ref() != "redis_3" {
                assert_eq!(owner, &before[slot]);
            } else {
                assert_ne!(owner.as_ref(), "redis_3");
            }
        }
    }

    #[test]
    fn zero_weight_removes_a_node() {
        let mut ring = HashRing::new(names(2));
        ring.add("redis_0", 0);
        assert!(!ring.contains("redis_0"));
        for bucket in ring.buckets() {
            assert_eq!(bucket.as_ref(), "redis_1");
        }
    }

    #[test]
    fn empty_ring_has_no_owner() {
        let mut ring = HashRing::new(Vec::<String>::new());
        assert!(ring.lookup(b"anything").is_none());
        ring.add("solo", DEFAULT_WEIGHT);
        assert_eq!(ring.lookup(b"anything").map(|n| n.as_ref()), Some("solo"));
    }
}
