//! Consistent Hash Ring
//!
//! Sorted map from 32-bit points to node ids. Each physical node contributes
//! `virtual_nodes` points hashed from `"<node_id>#<i>"`. The ring is an
//! immutable value; membership changes build a new one.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

/// Hashes a string onto the ring: the low 32 bits of its MD5 digest.
pub fn ring_hash(key: &str) -> u32 {
    let digest = md5::compute(key.as_bytes());
    u32::from_be_bytes([digest[12], digest[13], digest[14], digest[15]])
}

/// Share of the ring held by one physical node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NodeShare {
    pub virtual_nodes: usize,
    pub percentage: f64,
}

// == Hash Ring ==
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    points: BTreeMap<u32, String>,
    virtual_nodes: usize,
}

impl HashRing {
    /// Builds a ring over `node_ids`.
    ///
    /// Nodes are inserted in sorted id order, and on a point collision the
    /// first insertion keeps the point, so the result depends only on the
    /// set of ids.
    pub fn build<I, S>(node_ids: I, virtual_nodes: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: BTreeSet<String> = node_ids
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .collect();

        let mut points = BTreeMap::new();
        for id in &ids {
            for i in 0..virtual_nodes {
                points
                    .entry(ring_hash(&format!("{}#{}", id, i)))
                    .or_insert_with(|| id.clone());
            }
        }

        Self {
            points,
            virtual_nodes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Number of points on the ring.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// Points clockwise from the key's hash, wrapping once.
    fn walk(&self, key: &str) -> impl Iterator<Item = &String> {
        let hash = ring_hash(key);
        self.points
            .range(hash..)
            .chain(self.points.range(..hash))
            .map(|(_, id)| id)
    }

    /// Owner of `key`: the first point at or after its hash, wrapping to the
    /// smallest point. `None` on an empty ring.
    pub fn owner_of(&self, key: &str) -> Option<&str> {
        self.walk(key).next().map(String::as_str)
    }

    /// Owner plus the next distinct nodes clockwise, up to `n` in total.
    pub fn replica_set(&self, key: &str, n: usize) -> Vec<String> {
        let mut replicas: Vec<String> = Vec::with_capacity(n);
        for id in self.walk(key) {
            if replicas.len() >= n {
                break;
            }
            if !replicas.contains(id) {
                replicas.push(id.clone());
            }
        }
        replicas
    }

    /// Percentage of points per physical node.
    pub fn distribution(&self) -> BTreeMap<String, NodeShare> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for id in self.points.values() {
            *counts.entry(id.clone()).or_default() += 1;
        }

        let total = self.points.len() as f64;
        counts
            .into_iter()
            .map(|(id, count)| {
                let percentage = (count as f64 / total * 100.0 * 100.0).round() / 100.0;
                (
                    id,
                    NodeShare {
                        virtual_nodes: count,
                        percentage,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ring_hash_matches_md5_low_bits() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(ring_hash(""), 0xecf8_427e);
    }

    #[test]
    fn test_empty_ring_has_no_owner() {
        let ring = HashRing::build(Vec::<String>::new(), 100);
        assert!(ring.is_empty());
        assert_eq!(ring.owner_of("anything"), None);
        assert!(ring.replica_set("anything", 2).is_empty());
    }

    #[test]
    fn test_single_node_owns_everything() {
        let ring = HashRing::build(["solo"], 10);
        assert_eq!(ring.len(), 10);
        assert_eq!(ring.owner_of("a"), Some("solo"));
        assert_eq!(ring.replica_set("a", 3), vec!["solo"]);
    }

    #[test]
    fn test_three_nodes_share_evenly() {
        let ring = HashRing::build(["n1", "n2", "n3"], 100);
        let dist = ring.distribution();

        assert_eq!(dist.len(), 3);
        for share in dist.values() {
            assert!(
                (share.percentage - 33.3).abs() < 12.0,
                "share {} too far from a third",
                share.percentage
            );
        }
        let total: f64 = dist.values().map(|s| s.percentage).sum();
        assert!((total - 100.0).abs() < 0.1);
    }

    #[test]
    fn test_removing_a_node_only_moves_its_keys() {
        let before = HashRing::build(["n1", "n2", "n3"], 100);
        let after = HashRing::build(["n1", "n2"], 100);

        for i in 0..500 {
            let key = format!("key:{}", i);
            let old = before.owner_of(&key).unwrap();
            if old != "n3" {
                assert_eq!(after.owner_of(&key), Some(old));
            }
        }

        let dist = after.distribution();
        assert!((dist["n1"].percentage - 50.0).abs() < 15.0);
    }

    #[test]
    fn test_replicas_are_distinct_and_start_with_owner() {
        let ring = HashRing::build(["n1", "n2", "n3"], 50);
        for i in 0..100 {
            let key = format!("k{}", i);
            let replicas = ring.replica_set(&key, 2);
            assert_eq!(replicas.len(), 2);
            assert_eq!(Some(replicas[0].as_str()), ring.owner_of(&key));
            assert_ne!(replicas[0], replicas[1]);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Routing is a pure function of the node set, independent of the
        // order nodes were listed in.
        #[test]
        fn prop_owner_stable(
            nodes in prop::collection::btree_set("[a-z]{3,8}", 1..6),
            key in "[a-zA-Z0-9:_]{1,40}",
        ) {
            let forward = HashRing::build(nodes.iter(), 20);
            let reversed = HashRing::build(nodes.iter().rev(), 20);

            let owner = forward.owner_of(&key).map(str::to_string);
            prop_assert!(owner.is_some());
            prop_assert_eq!(forward.owner_of(&key).map(str::to_string), owner.clone());
            prop_assert_eq!(reversed.owner_of(&key).map(str::to_string), owner);
        }
    }
}
