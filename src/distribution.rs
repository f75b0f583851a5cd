//! Aggregation of split statistics across many trees.
//!
//! # Overview
//! A [`SplitDistribution`] maps each canonical split to the weight of the
//! trees that contained it, plus the edge lengths and node ages observed for
//! it. Distributions built over disjoint sets of trees against the same
//! locked [`TaxonNamespace`] can be merged in any order with the same result
//! as one serial pass.
//!
//! # Canonical keys
//! Rooted trees are keyed by their unnormalized clades, unrooted trees by
//! [`normalize`]d splits. Mixing both in one distribution is rejected with
//! [`SumTreesError::MixedRooting`], since the keys would no longer be
//! comparable. The root of a rooted tree is recorded as the all-taxa clade
//! so that root ages can be summarized.
//!
//! An unrooted tree drawn with a bifurcating root has two root edges
//! carrying the same bipartition; they are counted once, with their
//! lengths summed.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::bitset::Bitset;
use crate::error::{Result, SumTreesError};
use crate::splits::{encode_splits, is_trivial, normalize};
use crate::taxon::TaxonNamespace;
use crate::tree::{Rooting, Tree};

/// Statistics accumulated for one split.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SplitStats {
    /// Summed weight of the trees containing the split.
    pub count: f64,
    /// Edge lengths in observation order.
    pub edge_lengths: Vec<f64>,
    /// Ages of the subtended node, only when node ages are tracked.
    pub node_ages: Vec<f64>,
}

#[derive(Clone, Debug)]
pub struct SplitDistribution {
    namespace: Arc<TaxonNamespace>,
    all_taxa: Bitset,
    splits: IndexMap<Bitset, SplitStats>,
    total_trees_counted: usize,
    sum_of_tree_weights: f64,
    rootings_counted: BTreeSet<Rooting>,
    trees_counted_for_freqs: usize,
    split_frequencies: Option<IndexMap<Bitset, f64>>,
    pub ignore_edge_lengths: bool,
    pub ignore_node_ages: bool,
    /// When false, a tree's own weight replaces the weight passed in.
    pub ignore_tree_weights: bool,
    pub ultrametricity_precision: f64,
}

impl SplitDistribution {
    /// Creates an empty distribution and locks `namespace`.
    pub fn new(namespace: Arc<TaxonNamespace>) -> Self {
        namespace.lock();
        let all_taxa = namespace.all_taxa_mask();
        SplitDistribution {
            namespace,
            all_taxa,
            splits: IndexMap::new(),
            total_trees_counted: 0,
            sum_of_tree_weights: 0.0,
            rootings_counted: BTreeSet::new(),
            trees_counted_for_freqs: 0,
            split_frequencies: None,
            ignore_edge_lengths: false,
            ignore_node_ages: true,
            ignore_tree_weights: false,
            ultrametricity_precision: 1e-7,
        }
    }

    pub fn namespace(&self) -> &Arc<TaxonNamespace> {
        &self.namespace
    }

    pub fn all_taxa_mask(&self) -> &Bitset {
        &self.all_taxa
    }

    /// Counts every split of `tree`.
    ///
    /// Splits are encoded first if the tree does not carry them yet. The
    /// tree contributes `weight`, or its own weight when tree weights are
    /// honoured and it has one.
    ///
    /// # Errors
    /// - `DistributionFinalized` after [`calc_freqs`](Self::calc_freqs)
    /// - `MixedRooting` if rooted and unrooted trees have now both been seen
    /// - `NotUltrametric` / `MissingEdgeLength` when node ages are tracked
    pub fn count_splits_on_tree(&mut self, tree: &mut Tree, weight: f64) -> Result<()> {
        if self.split_frequencies.is_some() {
            return Err(SumTreesError::DistributionFinalized);
        }
        if !tree.is_encoded() {
            encode_splits(tree, &self.namespace)?;
        }
        self.rootings_counted.insert(tree.rooting);
        if self.is_mixed_rootings_counted() {
            return Err(SumTreesError::MixedRooting);
        }
        if !self.ignore_node_ages {
            tree.calc_node_ages(self.ultrametricity_precision)?;
        }

        let weight = match (self.ignore_tree_weights, tree.weight) {
            (false, Some(w)) => w,
            _ => weight,
        };
        let rooted = tree.is_rooted();
        let root = tree.root();
        // key -> whether this tree already pushed an edge length for it
        let mut seen: HashMap<Bitset, bool> = HashMap::new();
        for id in tree.preorder() {
            let node = tree.node(id);
            let Some(split) = &node.edge.split else {
                continue;
            };
            let masked = split.and(&self.all_taxa);
            // A rooted tree's root is kept as the all-taxa clade even though it
            // is trivial: it carries the root age sample. Consensus building
            // skips trivial splits, so it never becomes a clade.
            if id == root && !rooted {
                continue;
            }
            let key = if rooted { masked } else { normalize(&masked, &self.all_taxa) };
            let length = node.edge.length.filter(|_| !self.ignore_edge_lengths);
            if let Some(pushed) = seen.get_mut(&key) {
                // the two edges around an unrooted basal bifurcation form one edge
                if let (Some(length), Some(stats)) = (length, self.splits.get_mut(&key)) {
                    match (*pushed, stats.edge_lengths.last_mut()) {
                        (true, Some(last)) => *last += length,
                        _ => stats.edge_lengths.push(length),
                    }
                    *pushed = true;
                }
                continue;
            }
            seen.insert(key.clone(), length.is_some());
            let stats = self.splits.entry(key).or_default();
            stats.count += weight;
            if let Some(length) = length {
                stats.edge_lengths.push(length);
            }
            if !self.ignore_node_ages {
                if let Some(age) = node.age {
                    stats.node_ages.push(age);
                }
            }
        }
        self.total_trees_counted += 1;
        self.sum_of_tree_weights += weight;
        Ok(())
    }

    /// Folds `other` into `self`: counts and weights are summed, sample lists
    /// concatenated and rooting sets united.
    ///
    /// # Errors
    /// `NamespaceMismatch`, `DistributionFinalized` or `MixedRooting`.
    pub fn merge(&mut self, other: &SplitDistribution) -> Result<()> {
        if self.split_frequencies.is_some() {
            return Err(SumTreesError::DistributionFinalized);
        }
        if !Arc::ptr_eq(&self.namespace, &other.namespace) && *self.namespace != *other.namespace {
            return Err(SumTreesError::NamespaceMismatch);
        }
        self.rootings_counted.extend(other.rootings_counted.iter().copied());
        if self.is_mixed_rootings_counted() {
            return Err(SumTreesError::MixedRooting);
        }
        for (split, theirs) in &other.splits {
            let ours = self.splits.entry(split.clone()).or_default();
            ours.count += theirs.count;
            ours.edge_lengths.extend_from_slice(&theirs.edge_lengths);
            ours.node_ages.extend_from_slice(&theirs.node_ages);
        }
        self.total_trees_counted += other.total_trees_counted;
        self.sum_of_tree_weights += other.sum_of_tree_weights;
        debug!(
            trees = self.total_trees_counted,
            splits = self.splits.len(),
            "merged split distribution"
        );
        Ok(())
    }

    /// Maps a raw split onto the key it would be counted under.
    pub fn canonical_key(&self, split: &Bitset) -> Bitset {
        let masked = split.and(&self.all_taxa);
        if self.is_all_counted_trees_rooted() {
            masked
        } else {
            normalize(&masked, &self.all_taxa)
        }
    }

    /// `count / total weight`, or 0 for a split never observed.
    pub fn frequency(&self, split: &Bitset) -> f64 {
        if self.sum_of_tree_weights <= 0.0 {
            return 0.0;
        }
        self.splits
            .get(&self.canonical_key(split))
            .map_or(0.0, |s| s.count / self.sum_of_tree_weights)
    }

    /// Computes and caches the frequency of every split. The distribution
    /// then refuses further counting until [`reset_freqs`](Self::reset_freqs).
    pub fn calc_freqs(&mut self) -> &IndexMap<Bitset, f64> {
        let total = self.sum_of_tree_weights;
        let freqs = self
            .splits
            .iter()
            .map(|(split, stats)| {
                let f = if total > 0.0 { stats.count / total } else { 0.0 };
                (split.clone(), f)
            })
            .collect();
        self.trees_counted_for_freqs = self.total_trees_counted;
        self.split_frequencies.insert(freqs)
    }

    pub fn split_frequencies(&self) -> Option<&IndexMap<Bitset, f64>> {
        self.split_frequencies.as_ref()
    }

    pub fn reset_freqs(&mut self) {
        self.split_frequencies = None;
        self.trees_counted_for_freqs = 0;
    }

    pub fn is_finalized(&self) -> bool {
        self.split_frequencies.is_some()
    }

    /// `(total, unique, non-trivial total, non-trivial unique)` split counts.
    /// Totals are weighted.
    pub fn splits_considered(&self) -> (f64, usize, f64, usize) {
        let mut total = 0.0;
        let mut nt_total = 0.0;
        let mut nt_unique = 0;
        for (split, stats) in &self.splits {
            total += stats.count;
            if !is_trivial(split, &self.all_taxa) {
                nt_total += stats.count;
                nt_unique += 1;
            }
        }
        (total, self.splits.len(), nt_total, nt_unique)
    }

    /// Sum of the support of `tree`'s splits. Leaf edges are only included
    /// with `include_external_splits`; the root edge never is.
    pub fn sum_of_split_support_on_tree(&self, tree: &mut Tree, include_external_splits: bool) -> Result<f64> {
        let freqs = self.scored_frequencies(tree, include_external_splits)?;
        Ok(freqs.iter().sum())
    }

    /// Natural log of the product of the support of `tree`'s splits.
    /// A split never observed makes the product 0 (log = -inf).
    pub fn product_of_split_support_on_tree(
        &self,
        tree: &mut Tree,
        include_external_splits: bool,
    ) -> Result<f64> {
        let freqs = self.scored_frequencies(tree, include_external_splits)?;
        Ok(freqs.iter().map(|f| f.ln()).sum())
    }

    fn scored_frequencies(&self, tree: &mut Tree, include_external_splits: bool) -> Result<Vec<f64>> {
        if !tree.is_encoded() {
            encode_splits(tree, &self.namespace)?;
        }
        let root = tree.root();
        Ok(tree
            .preorder()
            .into_iter()
            .filter(|&id| id != root && (include_external_splits || !tree.is_leaf(id)))
            .filter_map(|id| tree.node(id).edge.split.as_ref())
            .map(|split| self.frequency(split))
            .collect())
    }

    /// True if rooted trees were counted together with unrooted or
    /// unspecified ones.
    pub fn is_mixed_rootings_counted(&self) -> bool {
        self.rootings_counted.contains(&Rooting::Rooted)
            && (self.rootings_counted.contains(&Rooting::Unrooted)
                || self.rootings_counted.contains(&Rooting::Unknown))
    }

    pub fn is_all_counted_trees_rooted(&self) -> bool {
        self.rootings_counted.len() == 1 && self.rootings_counted.contains(&Rooting::Rooted)
    }

    pub fn is_all_counted_trees_strictly_unrooted(&self) -> bool {
        self.rootings_counted.len() == 1 && self.rootings_counted.contains(&Rooting::Unrooted)
    }

    /// True if no counted tree was rooted (unspecified rooting is treated as unrooted).
    pub fn is_all_counted_trees_treated_as_unrooted(&self) -> bool {
        !self.rootings_counted.is_empty() && !self.rootings_counted.contains(&Rooting::Rooted)
    }

    pub fn rootings_counted(&self) -> &BTreeSet<Rooting> {
        &self.rootings_counted
    }

    pub fn total_trees_counted(&self) -> usize {
        self.total_trees_counted
    }

    pub fn sum_of_tree_weights(&self) -> f64 {
        self.sum_of_tree_weights
    }

    pub fn trees_counted_for_freqs(&self) -> usize {
        self.trees_counted_for_freqs
    }

    /// Accumulated statistics for `split` (already canonical).
    pub fn split_stats(&self, split: &Bitset) -> Option<&SplitStats> {
        self.splits.get(split)
    }

    /// Statistics for the canonical form of a raw edge split.
    pub fn stats_for_edge(&self, split: &Bitset) -> Option<&SplitStats> {
        self.splits.get(&self.canonical_key(split))
    }

    /// Splits with their statistics, in first-observation order.
    pub fn splits(&self) -> impl Iterator<Item = (&Bitset, &SplitStats)> {
        self.splits.iter()
    }

    pub fn len(&self) -> usize {
        self.splits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }
}
