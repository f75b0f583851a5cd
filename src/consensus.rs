//! Majority-rule consensus construction.
//!
//! # Algorithm
//! 1. Rank non-trivial splits by descending frequency. Ties go to the split
//!    with the lower lowest set bit, then to the lower canonical bitmask.
//! 2. Start from a star tree with one leaf per taxon.
//! 3. Accept each split clearing the threshold if it is compatible with
//!    every split accepted so far, and insert it as a new internal node.
//!
//! # Compatibility
//! Unrooted splits are first oriented as the clade *not* containing the
//! reference taxon (the lowest bit of the taxon mask). Two clades are then
//! compatible when one contains the other or they are disjoint, which is
//! exactly the four-way test on the underlying bipartitions.
//! ```text
//! {A,B} vs {A,B,C}  nested    → compatible
//! {A,B} vs {C,D}    disjoint  → compatible
//! {A,B} vs {B,C}    overlap   → rejected
//! ```

use tracing::warn;

use crate::bitset::Bitset;
use crate::distribution::SplitDistribution;
use crate::error::Result;
use crate::splits::{is_trivial, lowest_bit_only};
use crate::taxon::TaxonNamespace;
use crate::tree::{Edge, Node, NodeId, Rooting, Tree};

/// The smallest double above 0.5: strict majority.
pub const GREATER_THAN_HALF: f64 = f64::from_bits(0.5f64.to_bits() + 1);

/// Builds the consensus tree of all splits with frequency of at least
/// `min_freq` that are compatible with higher-ranked splits.
///
/// `min_freq` above 1.0 is clamped to 1.0; exactly 0.5 is read as a strict
/// majority so that splits found in exactly half of the trees are excluded.
/// Every edge of the result carries its split and support.
pub fn tree_from_splits(distribution: &SplitDistribution, min_freq: f64) -> Result<Tree> {
    let min_freq = clamp_min_freq(min_freq);
    let namespace = distribution.namespace();
    let mask = distribution.all_taxa_mask();
    let rooting = if distribution.is_all_counted_trees_rooted() {
        Rooting::Rooted
    } else {
        Rooting::Unrooted
    };

    let mut ranked: Vec<(&Bitset, f64)> = distribution
        .splits()
        .filter(|(split, _)| !is_trivial(split, mask))
        .map(|(split, _)| (split, distribution.frequency(split)))
        .filter(|(_, freq)| *freq >= min_freq)
        .collect();
    ranked.sort_by(|a, b| {
        b.1.total_cmp(&a.1)
            .then_with(|| lowest_bit_only(a.0).cmp(&lowest_bit_only(b.0)))
            .then_with(|| a.0.cmp(b.0))
    });

    let mut builder = ConsensusBuilder::star(namespace, rooting);
    for (split, freq) in ranked {
        builder.insert(split, Some(freq));
    }
    let mut tree = builder.finish();
    for id in tree.leaves() {
        if let Some(split) = tree.node(id).edge.split.clone() {
            tree.node_mut(id).edge.support = Some(distribution.frequency(&split));
        }
    }
    Ok(tree)
}

/// Builds the tree displaying every compatible split of `splits`, without
/// support values. Used to rebuild counted topologies.
pub fn tree_from_split_set(namespace: &TaxonNamespace, splits: &[Bitset], rooting: Rooting) -> Tree {
    let mut builder = ConsensusBuilder::star(namespace, rooting);
    for split in splits {
        builder.insert(split, None);
    }
    builder.finish()
}

fn clamp_min_freq(min_freq: f64) -> f64 {
    if min_freq > 1.0 {
        warn!(min_freq, "maximum frequency threshold for clade inclusion is 1.0: reset to 1.0");
        1.0
    } else if min_freq == 0.5 {
        GREATER_THAN_HALF
    } else {
        min_freq
    }
}

/// Incrementally refines a star tree. Each node's edge split holds its
/// clade, so insertion only has to walk down from the root.
struct ConsensusBuilder {
    tree: Tree,
    mask: Bitset,
    /// Taxon kept outside every clade of an unrooted tree.
    reference: Option<usize>,
    accepted: Vec<Bitset>,
}

impl ConsensusBuilder {
    fn star(namespace: &TaxonNamespace, rooting: Rooting) -> Self {
        namespace.lock();
        let mask = namespace.all_taxa_mask();
        let mut tree = Tree::new(rooting);
        let root = tree.root();
        tree.node_mut(root).edge.split = Some(mask.clone());
        for idx in 0..namespace.len() {
            let leaf = tree.add_leaf(root, idx, None);
            tree.node_mut(leaf).edge.split = Some(namespace.taxon_mask(idx));
        }
        let reference = if rooting.is_rooted() { None } else { mask.lowest_set_index() };
        ConsensusBuilder {
            tree,
            mask,
            reference,
            accepted: Vec::new(),
        }
    }

    /// Orients a split as the clade it forms in the tree being built.
    fn clade_of(&self, split: &Bitset) -> Bitset {
        let masked = split.and(&self.mask);
        match self.reference {
            Some(r) if masked.contains(r) => masked.complement_within(&self.mask),
            _ => masked,
        }
    }

    fn is_compatible(&self, clade: &Bitset) -> bool {
        self.accepted
            .iter()
            .all(|other| clade.is_subset_of(other) || other.is_subset_of(clade) || clade.is_disjoint(other))
    }

    /// Inserts `split` if it is new and compatible; returns whether it was.
    fn insert(&mut self, split: &Bitset, support: Option<f64>) -> bool {
        let clade = self.clade_of(split);
        if is_trivial(&clade, &self.mask) || !self.is_compatible(&clade) {
            return false;
        }
        let Some(parent) = self.attachment_point(&clade) else {
            return false;
        };
        let moved: Vec<NodeId> = self
            .tree
            .node(parent)
            .children
            .iter()
            .copied()
            .filter(|&c| {
                self.tree
                    .node(c)
                    .edge
                    .split
                    .as_ref()
                    .is_some_and(|s| s.is_subset_of(&clade))
            })
            .collect();
        let node = self.tree.add_child(
            parent,
            Node {
                edge: Edge {
                    split: Some(clade.clone()),
                    support,
                    ..Edge::default()
                },
                ..Node::default()
            },
        );
        for child in moved {
            self.tree.reparent(child, node);
        }
        self.accepted.push(clade);
        true
    }

    /// Deepest node whose clade strictly contains `clade`; `None` if the
    /// clade is already present.
    fn attachment_point(&self, clade: &Bitset) -> Option<NodeId> {
        let mut current = self.tree.root();
        'descend: loop {
            for &child in &self.tree.node(current).children {
                let Some(child_clade) = &self.tree.node(child).edge.split else {
                    continue;
                };
                if child_clade == clade {
                    return None;
                }
                if clade.is_subset_of(child_clade) {
                    current = child;
                    continue 'descend;
                }
            }
            return Some(current);
        }
    }

    fn finish(self) -> Tree {
        self.tree
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::splits::{encode_splits, normalize};

    fn namespace(n: usize) -> Arc<TaxonNamespace> {
        Arc::new(TaxonNamespace::from_labels((0..n).map(|i| format!("T{i}"))))
    }

    /// Unrooted tree with `clade` grouped under one internal node and every
    /// other taxon attached to the root.
    fn one_clade_tree(n: usize, clade: &[usize]) -> Tree {
        let mut t = Tree::new(Rooting::Unrooted);
        let x = t.add_child(0, Node::default());
        for taxon in 0..n {
            let parent = if clade.contains(&taxon) { x } else { 0 };
            t.add_leaf(parent, taxon, None);
        }
        t
    }

    fn nontrivial_normalized(tree: &Tree, mask: &Bitset) -> Vec<Bitset> {
        let mut splits: Vec<Bitset> = tree
            .nodes()
            .iter()
            .filter_map(|n| n.edge.split.as_ref())
            .filter(|s| !is_trivial(s, mask))
            .map(|s| normalize(s, mask))
            .collect();
        splits.sort();
        splits.dedup();
        splits
    }

    #[test]
    fn threshold_constant_is_just_above_half() {
        assert!(GREATER_THAN_HALF > 0.5);
        assert!(GREATER_THAN_HALF < 0.50000001);
        assert_eq!(clamp_min_freq(0.5), GREATER_THAN_HALF);
        assert_eq!(clamp_min_freq(3.0), 1.0);
        assert_eq!(clamp_min_freq(0.3), 0.3);
    }

    #[test]
    fn incompatible_split_is_skipped() {
        let tns = namespace(5);
        let mut builder = ConsensusBuilder::star(&tns, Rooting::Rooted);
        assert!(builder.insert(&Bitset::from_u64(0b00011), Some(0.9)));
        assert!(builder.insert(&Bitset::from_u64(0b00111), Some(0.8)));
        assert!(!builder.insert(&Bitset::from_u64(0b00110), Some(0.7)));
        assert!(builder.insert(&Bitset::from_u64(0b11000), Some(0.6)));
        assert!(!builder.insert(&Bitset::from_u64(0b11000), Some(0.6)));
        let tree = builder.finish();
        assert_eq!(tree.internal_nodes().len(), 3);
        assert_eq!(tree.leaves().len(), 5);
    }

    #[test]
    fn unrooted_clades_exclude_reference_taxon() {
        let tns = namespace(6);
        let mut builder = ConsensusBuilder::star(&tns, Rooting::Unrooted);
        // {T0,T1,T2} is stored as {T3,T4,T5}
        assert!(builder.insert(&Bitset::from_u64(0b000111), Some(1.0)));
        // {T3,T4} nests inside it
        assert!(builder.insert(&Bitset::from_u64(0b011000), Some(1.0)));
        // {T2,T3} crosses the first split
        assert!(!builder.insert(&Bitset::from_u64(0b001100), Some(1.0)));
        let tree = builder.finish();
        let root_children = &tree.node(tree.root()).children;
        assert_eq!(root_children.len(), 4);
    }

    #[test]
    fn polytomies_remain_when_support_is_low() {
        let tns = namespace(4);
        let tree = tree_from_split_set(&tns, &[], Rooting::Unrooted);
        assert_eq!(tree.node(tree.root()).children.len(), 4);
        assert!(tree.internal_nodes().is_empty());
    }

    #[test]
    fn round_trip_through_distribution() {
        let tns = namespace(6);
        // ((T0,T1),(T2,(T3,(T4,T5))))
        let mut original = Tree::new(Rooting::Unrooted);
        let a = original.add_child(0, Node::default());
        original.add_leaf(a, 0, Some(1.0));
        original.add_leaf(a, 1, Some(1.0));
        let b = original.add_child(0, Node::default());
        original.add_leaf(b, 2, Some(1.0));
        let c = original.add_child(b, Node::default());
        original.add_leaf(c, 3, Some(1.0));
        let d = original.add_child(c, Node::default());
        original.add_leaf(d, 4, Some(1.0));
        original.add_leaf(d, 5, Some(1.0));

        let mut sd = SplitDistribution::new(tns.clone());
        sd.count_splits_on_tree(&mut original, 1.0).unwrap();
        let mut consensus = tree_from_splits(&sd, GREATER_THAN_HALF).unwrap();

        let mask = tns.all_taxa_mask();
        let expected = nontrivial_normalized(&original, &mask);
        for id in 0..consensus.len() {
            consensus.node_mut(id).edge.split = None;
        }
        encode_splits(&mut consensus, &tns).unwrap();
        assert_eq!(nontrivial_normalized(&consensus, &mask), expected);
        for id in consensus.internal_nodes() {
            assert_eq!(consensus.node(id).edge.support, Some(1.0));
        }
    }

    #[test]
    fn half_frequency_split_is_excluded() {
        let tns = namespace(4);
        let mut sd = SplitDistribution::new(tns);
        let quartet = |pair: [usize; 2], rest: [usize; 2]| {
            let mut t = Tree::new(Rooting::Unrooted);
            let x = t.add_child(0, Node::default());
            t.add_leaf(x, pair[0], None);
            t.add_leaf(x, pair[1], None);
            t.add_leaf(0, rest[0], None);
            t.add_leaf(0, rest[1], None);
            t
        };
        sd.count_splits_on_tree(&mut quartet([0, 1], [2, 3]), 1.0).unwrap();
        sd.count_splits_on_tree(&mut quartet([0, 2], [1, 3]), 1.0).unwrap();

        let strict = tree_from_splits(&sd, 0.5).unwrap();
        assert!(strict.internal_nodes().is_empty());

        let loose = tree_from_splits(&sd, 0.4).unwrap();
        // both splits clear 0.4 but only the first ranked one fits
        assert_eq!(loose.internal_nodes().len(), 1);
        let kept = loose.node(loose.internal_nodes()[0]).edge.split.clone().unwrap();
        // equal lowest bits, so the lower bitmask {T0,T1} (0b0011) wins, oriented away from T0
        assert_eq!(kept, Bitset::from_u64(0b1100));
    }

    #[test]
    fn ties_prefer_the_lower_lowest_bit() {
        let mut sd = SplitDistribution::new(namespace(5));
        // {T1,T2} is 0b00110; {T0,T1,T3} is stored as 0b01011, which has the lower lowest bit
        sd.count_splits_on_tree(&mut one_clade_tree(5, &[1, 2]), 1.0).unwrap();
        sd.count_splits_on_tree(&mut one_clade_tree(5, &[0, 1, 3]), 1.0).unwrap();
        let tree = tree_from_splits(&sd, 0.4).unwrap();
        let internal = tree.internal_nodes();
        assert_eq!(internal.len(), 1);
        assert_eq!(tree.node(internal[0]).edge.split, Some(Bitset::from_u64(0b10100)));
    }

    #[test]
    fn majority_split_is_included() {
        let mut sd = SplitDistribution::new(namespace(5));
        for _ in 0..3 {
            sd.count_splits_on_tree(&mut one_clade_tree(5, &[3, 4]), 1.0).unwrap();
        }
        for _ in 0..2 {
            sd.count_splits_on_tree(&mut one_clade_tree(5, &[2, 4]), 1.0).unwrap();
        }
        for min_freq in [GREATER_THAN_HALF, 0.5] {
            let tree = tree_from_splits(&sd, min_freq).unwrap();
            let internal = tree.internal_nodes();
            assert_eq!(internal.len(), 1);
            let node = tree.node(internal[0]);
            assert_eq!(node.edge.split, Some(Bitset::from_u64(0b11000)));
            assert!((node.edge.support.unwrap() - 0.6).abs() < 1e-12);
        }
    }

    #[test]
    fn split_just_above_half_is_included() {
        let mut sd = SplitDistribution::new(namespace(4));
        sd.count_splits_on_tree(&mut one_clade_tree(4, &[2, 3]), 0.50000001).unwrap();
        sd.count_splits_on_tree(&mut one_clade_tree(4, &[1, 3]), 0.49999999).unwrap();
        let tree = tree_from_splits(&sd, 0.5).unwrap();
        let internal = tree.internal_nodes();
        assert_eq!(internal.len(), 1);
        assert_eq!(tree.node(internal[0]).edge.split, Some(Bitset::from_u64(0b1100)));
    }

    #[test]
    fn threshold_above_one_requires_unanimity() {
        let mut sd = SplitDistribution::new(namespace(6));
        // {T0,T1} in every tree, {T4,T5} in three of four
        let mut resolved = |second: [usize; 2]| {
            let mut t = Tree::new(Rooting::Unrooted);
            let x = t.add_child(0, Node::default());
            let y = t.add_child(0, Node::default());
            let mut placed = vec![0, 1];
            placed.extend(second);
            t.add_leaf(x, 0, None);
            t.add_leaf(x, 1, None);
            t.add_leaf(y, second[0], None);
            t.add_leaf(y, second[1], None);
            for taxon in (0..6).filter(|x| !placed.contains(x)) {
                t.add_leaf(0, taxon, None);
            }
            sd.count_splits_on_tree(&mut t, 1.0).unwrap();
        };
        for _ in 0..3 {
            resolved([4, 5]);
        }
        resolved([3, 5]);

        let unanimous = tree_from_splits(&sd, 3.0).unwrap();
        let splits: Vec<_> = unanimous
            .internal_nodes()
            .into_iter()
            .filter_map(|id| unanimous.node(id).edge.split.clone())
            .collect();
        // {T0,T1} oriented away from T0
        assert_eq!(splits, vec![Bitset::from_u64(0b111100)]);
        assert_eq!(tree_from_splits(&sd, 0.75).unwrap().internal_nodes().len(), 2);
    }
}
