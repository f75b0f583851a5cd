use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use sumtrees::splits::{is_trivial, normalize};
use sumtrees::tree::Node;
use sumtrees::{Bitset, Rooting, SplitDistribution, TaxonNamespace, Tree};

const TAXA: usize = 6;

fn namespace() -> Arc<TaxonNamespace> {
    Arc::new(TaxonNamespace::from_labels(["A", "B", "C", "D", "E", "F"]))
}

/// Unrooted caterpillar over `order`, every edge of length 1.
fn caterpillar(order: &[usize]) -> Tree {
    let mut tree = Tree::new(Rooting::Unrooted);
    let mut parent = tree.root();
    tree.add_leaf(parent, order[0], Some(1.0));
    for &taxon in &order[1..order.len() - 2] {
        tree.add_leaf(parent, taxon, Some(1.0));
        let next = tree.add_child(parent, Node::default());
        tree.node_mut(next).edge.length = Some(1.0);
        parent = next;
    }
    tree.add_leaf(parent, order[order.len() - 2], Some(1.0));
    tree.add_leaf(parent, order[order.len() - 1], Some(1.0));
    tree
}

fn weighted_trees() -> impl Strategy<Value = Vec<(Vec<usize>, u8)>> {
    prop::collection::vec(
        (Just((0..TAXA).collect::<Vec<_>>()).prop_shuffle(), 1u8..4),
        1..6,
    )
}

fn distribution(namespace: &Arc<TaxonNamespace>, trees: &[(Vec<usize>, u8)]) -> SplitDistribution {
    let mut dist = SplitDistribution::new(Arc::clone(namespace));
    for (order, weight) in trees {
        let mut tree = caterpillar(order);
        dist.count_splits_on_tree(&mut tree, f64::from(*weight)).unwrap();
    }
    dist
}

/// Order-independent view: key -> (count, sorted lengths).
fn snapshot(dist: &SplitDistribution) -> (BTreeMap<Bitset, (u64, Vec<u64>)>, u64, usize) {
    let splits = dist
        .splits()
        .map(|(key, stats)| {
            let mut lengths: Vec<u64> = stats.edge_lengths.iter().map(|l| *l as u64).collect();
            lengths.sort_unstable();
            (key.clone(), (stats.count as u64, lengths))
        })
        .collect();
    (splits, dist.sum_of_tree_weights() as u64, dist.total_trees_counted())
}

proptest! {
    #[test]
    fn normalization_is_idempotent_and_complement_invariant(bits in 0u64..(1 << TAXA)) {
        let mask = Bitset::full(1, TAXA);
        let split = Bitset::from_u64(bits);
        let once = normalize(&split, &mask);
        prop_assert_eq!(normalize(&once, &mask), once.clone());
        prop_assert_eq!(normalize(&split.complement_within(&mask), &mask), once.clone());
        prop_assert_eq!(is_trivial(&split, &mask), is_trivial(&once, &mask));
    }

    #[test]
    fn merge_is_commutative(a in weighted_trees(), b in weighted_trees()) {
        let ns = namespace();
        let mut ab = distribution(&ns, &a);
        ab.merge(&distribution(&ns, &b)).unwrap();
        let mut ba = distribution(&ns, &b);
        ba.merge(&distribution(&ns, &a)).unwrap();
        prop_assert_eq!(snapshot(&ab), snapshot(&ba));
    }

    #[test]
    fn merge_is_associative_and_matches_sequential_counting(
        a in weighted_trees(),
        b in weighted_trees(),
        c in weighted_trees(),
    ) {
        let ns = namespace();
        let mut left = distribution(&ns, &a);
        left.merge(&distribution(&ns, &b)).unwrap();
        left.merge(&distribution(&ns, &c)).unwrap();

        let mut bc = distribution(&ns, &b);
        bc.merge(&distribution(&ns, &c)).unwrap();
        let mut right = distribution(&ns, &a);
        right.merge(&bc).unwrap();
        prop_assert_eq!(snapshot(&left), snapshot(&right));

        let all: Vec<_> = a.iter().chain(&b).chain(&c).cloned().collect();
        prop_assert_eq!(snapshot(&left), snapshot(&distribution(&ns, &all)));
    }

    #[test]
    fn frequencies_are_proportions(trees in weighted_trees()) {
        let ns = namespace();
        let dist = distribution(&ns, &trees);
        for (split, _) in dist.splits() {
            let freq = dist.frequency(split);
            prop_assert!(freq > 0.0 && freq <= 1.0 + 1e-12, "frequency {} out of range", freq);
        }
    }
}
