//! Counting of distinct tree topologies.
//!
//! A topology is identified by the sorted set of a tree's non-trivial
//! canonical splits, so edge lengths, child order and labels do not matter.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::bitset::Bitset;
use crate::consensus::tree_from_split_set;
use crate::error::Result;
use crate::splits::{encode_splits, is_trivial, normalize};
use crate::taxon::TaxonNamespace;
use crate::tree::{Rooting, Tree};

/// Order-independent identity of a topology.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopologyKey {
    pub rooted: bool,
    /// Sorted, deduplicated non-trivial splits.
    pub splits: Vec<Bitset>,
}

/// One row of the ranked topology table.
#[derive(Clone, Debug, PartialEq)]
pub struct TopologyFrequency {
    pub key: TopologyKey,
    pub count: f64,
    pub frequency: f64,
}

/// A topology rebuilt as a tree, with its count and probabilities.
#[derive(Clone, Debug)]
pub struct TreeProbability {
    pub tree: Tree,
    pub count: f64,
    pub probability: f64,
    pub cumulative_probability: f64,
}

#[derive(Clone, Debug)]
pub struct TopologyCounter {
    namespace: Arc<TaxonNamespace>,
    topology_hash_map: IndexMap<TopologyKey, f64>,
    pub ignore_tree_weights: bool,
}

impl TopologyCounter {
    pub fn new(namespace: Arc<TaxonNamespace>) -> Self {
        namespace.lock();
        TopologyCounter {
            namespace,
            topology_hash_map: IndexMap::new(),
            ignore_tree_weights: false,
        }
    }

    /// Canonical key of `tree`, encoding its splits first if needed.
    pub fn topology_key(&self, tree: &mut Tree) -> Result<TopologyKey> {
        if !tree.is_encoded() {
            encode_splits(tree, &self.namespace)?;
        }
        let mask = self.namespace.all_taxa_mask();
        let rooted = tree.is_rooted();
        let mut splits: Vec<Bitset> = tree
            .nodes()
            .iter()
            .filter_map(|n| n.edge.split.as_ref())
            .map(|s| s.and(&mask))
            .filter(|s| !is_trivial(s, &mask))
            .map(|s| if rooted { s } else { normalize(&s, &mask) })
            .collect();
        splits.sort_unstable();
        splits.dedup();
        Ok(TopologyKey { rooted, splits })
    }

    /// Adds `tree`'s topology with the tree's weight (1.0 when absent or ignored).
    pub fn count(&mut self, tree: &mut Tree) -> Result<()> {
        let key = self.topology_key(tree)?;
        let weight = match (self.ignore_tree_weights, tree.weight) {
            (false, Some(w)) => w,
            _ => 1.0,
        };
        *self.topology_hash_map.entry(key).or_insert(0.0) += weight;
        Ok(())
    }

    pub fn topology_hash_map(&self) -> &IndexMap<TopologyKey, f64> {
        &self.topology_hash_map
    }

    /// Sums counts per key from another worker's map.
    pub fn update_topology_hash_map(&mut self, other: &IndexMap<TopologyKey, f64>) {
        for (key, count) in other {
            *self.topology_hash_map.entry(key.clone()).or_insert(0.0) += count;
        }
    }

    pub fn merge(&mut self, other: &TopologyCounter) {
        self.update_topology_hash_map(&other.topology_hash_map);
    }

    pub fn total(&self) -> f64 {
        self.topology_hash_map.values().sum()
    }

    pub fn len(&self) -> usize {
        self.topology_hash_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topology_hash_map.is_empty()
    }

    /// Topologies by descending frequency; ties keep first-seen order.
    pub fn calc_tree_freqs(&self) -> Vec<TopologyFrequency> {
        let total = self.total();
        let mut rows: Vec<TopologyFrequency> = self
            .topology_hash_map
            .iter()
            .map(|(key, &count)| TopologyFrequency {
                key: key.clone(),
                count,
                frequency: if total > 0.0 { count / total } else { 0.0 },
            })
            .collect();
        // stable sort keeps insertion order among equal frequencies
        rows.sort_by(|a, b| b.frequency.total_cmp(&a.frequency));
        rows
    }

    /// Ranked topologies rebuilt as trees, with the running cumulative probability.
    pub fn tree_probabilities(&self) -> Vec<TreeProbability> {
        let mut cumulative = 0.0;
        self.calc_tree_freqs()
            .into_iter()
            .enumerate()
            .map(|(idx, row)| {
                cumulative += row.frequency;
                let rooting = if row.key.rooted { Rooting::Rooted } else { Rooting::Unrooted };
                let mut tree = tree_from_split_set(&self.namespace, &row.key.splits, rooting);
                tree.label = Some(format!("Tree{}", idx + 1));
                TreeProbability {
                    tree,
                    count: row.count,
                    probability: row.frequency,
                    cumulative_probability: cumulative,
                }
            })
            .collect()
    }
}
