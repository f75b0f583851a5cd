//! Split codec: computes, normalizes and renders edge bipartitions.
//!
//! # What is a split?
//! Removing an edge divides the taxa into two groups. The edge leading into
//! a node is encoded as the set of taxa below that node:
//! ```text
//!      root
//!     /    \
//!   {A,B}  {C,D}  ← this edge encodes {A,B} = 0b0011
//! ```
//!
//! # Normalization
//! In an unrooted tree `{A,B}|{C,D}` may show up as `0b0011` or `0b1100`
//! depending on where the traversal started. [`normalize`] keeps the
//! numerically smaller half, so both become `0b0011`. Rooted trees keep
//! the unnormalized clade, which is meaningful there.

use itertools::Itertools;

use crate::bitset::Bitset;
use crate::error::{Result, SumTreesError};
use crate::taxon::TaxonNamespace;
use crate::tree::Tree;

/// Sets `edge.split` on every node of `tree`, bottom-up.
///
/// A leaf edge gets the singleton bit of its taxon; an internal edge gets
/// the union of its children's splits. Locks `namespace`.
///
/// # Errors
/// `UnmappedLeaf` if a leaf carries no taxon.
pub fn encode_splits(tree: &mut Tree, namespace: &TaxonNamespace) -> Result<()> {
    namespace.lock();
    let words = namespace.words();
    for id in tree.postorder() {
        let node = tree.node(id);
        let mut split = Bitset::zeros(words);
        if let Some(taxon) = node.taxon {
            split.set(taxon);
        } else if node.is_leaf() {
            return Err(SumTreesError::UnmappedLeaf { node: id });
        }
        for &child in &node.children {
            if let Some(child_split) = &tree.node(child).edge.split {
                split.or_assign(child_split);
            }
        }
        tree.node_mut(id).edge.split = Some(split);
    }
    Ok(())
}

/// Canonical unrooted form: `min(split, mask ^ split)` after masking.
///
/// ```
/// # use sumtrees::bitset::Bitset;
/// # use sumtrees::splits::normalize;
/// let mask = Bitset::from_u64(0xF);
/// assert_eq!(normalize(&Bitset::from_u64(0b1100), &mask), Bitset::from_u64(0b0011));
/// assert_eq!(normalize(&Bitset::from_u64(0b0011), &mask), Bitset::from_u64(0b0011));
/// ```
pub fn normalize(split: &Bitset, mask: &Bitset) -> Bitset {
    let masked = split.and(mask);
    let complement = masked.complement_within(mask);
    if complement < masked { complement } else { masked }
}

/// True if `split` isolates at most one taxon of `mask` on either side.
///
/// Uses the taxon count implied by `mask`, so pruned leaf sets work.
/// Empty and full splits count as trivial too.
pub fn is_trivial(split: &Bitset, mask: &Bitset) -> bool {
    let size = split.and(mask).count_ones();
    let total = mask.count_ones();
    size <= 1 || size + 1 >= total
}

/// Value of the lowest set bit of `n`, or 0.
///
/// ```
/// # use sumtrees::splits::lowest_set_bit;
/// assert_eq!(lowest_set_bit(12), 4);
/// assert_eq!(lowest_set_bit(0), 0);
/// ```
pub fn lowest_set_bit(n: u64) -> u64 {
    n & n.wrapping_neg()
}

/// Bitset form of [`lowest_set_bit`].
pub fn lowest_bit_only(split: &Bitset) -> Bitset {
    let mut lowest = Bitset::zeros(split.0.len());
    if let Some((idx, word)) = split.0.iter().enumerate().find(|(_, w)| **w != 0) {
        lowest.0[idx] = lowest_set_bit(*word);
    }
    lowest
}

pub fn count_bits(split: &Bitset) -> usize {
    split.count_ones()
}

/// Indices of the set bits of `split`, optionally restricted to `mask`.
pub fn split_to_list(split: &Bitset, mask: Option<&Bitset>, one_based: bool) -> Vec<usize> {
    let offset = usize::from(one_based);
    let masked;
    let source = match mask {
        Some(m) => {
            masked = split.and(m);
            &masked
        }
        None => split,
    };
    source.iter_ones().map(|idx| idx + offset).collect()
}

/// Renders a split as `((in, side), (other, side))` using taxon labels.
pub fn split_as_newick_string(split: &Bitset, namespace: &TaxonNamespace) -> String {
    let inside = namespace.split_labels(split).map(quote_label).join(", ");
    let outside = namespace.split_labels(&split.complement_within(&namespace.all_taxa_mask()));
    let outside = outside.map(quote_label).join(", ");
    if outside.is_empty() {
        format!("({inside})")
    } else {
        format!("(({inside}), ({outside}))")
    }
}

/// Renders a split as one symbol per taxon, highest index first (`..**`).
pub fn split_as_string(split: &Bitset, width: usize) -> String {
    (0..width)
        .rev()
        .map(|idx| if split.contains(idx) { '*' } else { '.' })
        .collect()
}

/// Quotes a taxon label for Newick/NEXUS output when it holds punctuation
/// or whitespace. Embedded single quotes are doubled.
pub fn quote_label(label: &str) -> String {
    const SPECIAL: &[char] = &[
        '(', ')', '[', ']', '{', '}', '/', '\\', ',', ';', ':', '=', '*', '\'', '"', '`', '+',
        '<', '>',
    ];
    if label.is_empty() || label.chars().any(|c| c.is_whitespace() || SPECIAL.contains(&c)) {
        format!("'{}'", label.replace('\'', "''"))
    } else {
        label.to_string()
    }
}
