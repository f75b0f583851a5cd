//! Mapping of split statistics onto output trees.
//!
//! # Overview
//! A [`TreeSummarizer`] takes a consensus or target tree and decorates its
//! edges from a [`SplitDistribution`]:
//! - support (split frequency) on every edge
//! - summarized edge lengths or node ages
//! - optional `[&...]` metadata with the full sample summaries
//!
//! How support is shown (node label, edge length, percentage) is a
//! presentation choice applied separately by
//! [`TreeSummarizer::apply_support_presentation`].

use crate::distribution::SplitDistribution;
use crate::error::Result;
use crate::splits::encode_splits;
use crate::stats;
use crate::tree::{NodeId, Tree};

/// Presentation and metadata settings for summarized trees.
#[derive(Clone, Debug)]
pub struct TreeSummarizer {
    pub support_as_labels: bool,
    pub support_as_edge_lengths: bool,
    pub support_as_percentages: bool,
    pub support_label_decimals: usize,
    pub add_node_metadata: bool,
}

impl Default for TreeSummarizer {
    fn default() -> Self {
        TreeSummarizer {
            support_as_labels: true,
            support_as_edge_lengths: false,
            support_as_percentages: false,
            support_label_decimals: 8,
            add_node_metadata: true,
        }
    }
}

impl TreeSummarizer {
    /// Sets each non-root edge's support to the frequency of its split.
    ///
    /// The tree's splits are (re)computed against the distribution's
    /// namespace. A split never seen in the support trees gets support 0.
    pub fn map_split_support_to_tree(&self, mut tree: Tree, distribution: &SplitDistribution) -> Result<Tree> {
        if !tree.is_encoded() {
            encode_splits(&mut tree, distribution.namespace())?;
        }
        let root = tree.root();
        for id in tree.preorder() {
            if id == root {
                continue;
            }
            let support = tree
                .node(id)
                .edge
                .split
                .as_ref()
                .map(|split| distribution.frequency(split));
            tree.node_mut(id).edge.support = support;
        }
        Ok(tree)
    }

    /// Renders support as internal node labels and/or edge lengths.
    pub fn apply_support_presentation(&self, tree: &mut Tree) {
        if !self.support_as_labels && !self.support_as_edge_lengths {
            return;
        }
        let root = tree.root();
        for id in tree.preorder() {
            if id == root {
                continue;
            }
            let Some(support) = tree.node(id).edge.support else {
                continue;
            };
            let value = self.scale_support(support);
            let node = tree.node_mut(id);
            if self.support_as_labels && !node.is_leaf() {
                node.label = Some(format!("{:.*}", self.support_label_decimals, value));
            }
            if self.support_as_edge_lengths {
                node.edge.length = Some(value);
            }
        }
    }

    fn scale_support(&self, support: f64) -> f64 {
        if self.support_as_percentages { support * 100.0 } else { support }
    }

    /// Sets every edge length to `summarize` applied to the lengths sampled
    /// for its split. Edges whose split has no samples lose their length.
    ///
    /// When the root's two edges carry the same unrooted split (a rerooted
    /// tree, or an unrooted basal bifurcation) the summarized length is
    /// shared between them in proportion to their previous lengths.
    pub fn summarize_edge_lengths_on_tree<F>(&self, tree: &mut Tree, distribution: &SplitDistribution, summarize: F)
    where
        F: Fn(&[f64]) -> Option<f64>,
    {
        let basal = basal_pair(tree, distribution)
            .map(|(a, b)| (a, b, tree.node(a).edge.length, tree.node(b).edge.length));
        for id in tree.preorder() {
            let summarized = tree
                .node(id)
                .edge
                .split
                .as_ref()
                .and_then(|split| distribution.stats_for_edge(split))
                .and_then(|stats| summarize(&stats.edge_lengths));
            let edge = &mut tree.node_mut(id).edge;
            edge.summarized_length = summarized;
            edge.length = summarized;
        }
        let Some((a, b, before_a, before_b)) = basal else {
            return;
        };
        let Some(total) = tree.node(a).edge.length else {
            return;
        };
        let (before_a, before_b) = (before_a.unwrap_or(0.0), before_b.unwrap_or(0.0));
        let share = if before_a + before_b > 0.0 { before_a / (before_a + before_b) } else { 0.5 };
        for (id, length) in [(a, total * share), (b, total * (1.0 - share))] {
            let edge = &mut tree.node_mut(id).edge;
            edge.length = Some(length);
            edge.summarized_length = Some(length);
        }
    }

    /// Sets every node's summarized age to `summarize` over its split's
    /// sampled ages, visiting children before parents.
    ///
    /// With `collapse_negative_edges`, a parent is made at least as old as
    /// its oldest child. With `set_edge_lengths`, each edge length becomes
    /// the age difference to its parent, which may be negative if ages were
    /// not collapsed.
    pub fn summarize_node_ages_on_tree<F>(
        &self,
        tree: &mut Tree,
        distribution: &SplitDistribution,
        summarize: F,
        set_edge_lengths: bool,
        collapse_negative_edges: bool,
    ) where
        F: Fn(&[f64]) -> Option<f64>,
    {
        for id in tree.postorder() {
            let node = tree.node(id);
            let mut age = node
                .edge
                .split
                .as_ref()
                .and_then(|split| distribution.stats_for_edge(split))
                .and_then(|stats| summarize(&stats.node_ages));
            if collapse_negative_edges {
                let oldest_child = node
                    .children
                    .iter()
                    .filter_map(|&c| tree.node(c).summarized_age)
                    .fold(None, |acc: Option<f64>, a| Some(acc.map_or(a, |m| m.max(a))));
                age = match (age, oldest_child) {
                    (Some(own), Some(child)) => Some(own.max(child)),
                    (own, child) => own.or(child),
                };
            }
            tree.node_mut(id).summarized_age = age;
        }
        if set_edge_lengths {
            for id in tree.preorder() {
                let node = tree.node(id);
                let length = node
                    .parent
                    .and_then(|p| tree.node(p).summarized_age)
                    .zip(node.summarized_age)
                    .map(|(parent_age, age)| parent_age - age);
                let edge = &mut tree.node_mut(id).edge;
                edge.length = length;
                edge.summarized_length = length;
            }
        }
    }

    /// Attaches support and length/age summaries to every edge as
    /// `[&...]` metadata. Does nothing unless `add_node_metadata` is set.
    pub fn annotate_nodes_and_edges(&self, tree: &mut Tree, distribution: &SplitDistribution) {
        if !self.add_node_metadata {
            return;
        }
        for id in tree.preorder() {
            let Some(split) = tree.node(id).edge.split.clone() else {
                continue;
            };
            let mut annotations = Vec::new();
            let support = tree
                .node(id)
                .edge
                .support
                .unwrap_or_else(|| distribution.frequency(&split));
            annotations.push(("support".to_string(), self.format_support(support)));
            if let Some(stats) = distribution.stats_for_edge(&split) {
                push_sample_summary(&mut annotations, "length", &stats.edge_lengths);
                push_sample_summary(&mut annotations, "age", &stats.node_ages);
            }
            tree.node_mut(id).edge.annotations = annotations;
        }
    }

    fn format_support(&self, support: f64) -> String {
        format!("{:.*}", self.support_label_decimals, self.scale_support(support))
    }
}

/// The root's two children, if their edges map to the same split.
fn basal_pair(tree: &Tree, distribution: &SplitDistribution) -> Option<(NodeId, NodeId)> {
    let [a, b] = tree.node(tree.root()).children[..] else {
        return None;
    };
    let key = |id: NodeId| tree.node(id).edge.split.as_ref().map(|split| distribution.canonical_key(split));
    match (key(a), key(b)) {
        (Some(x), Some(y)) if x == y => Some((a, b)),
        _ => None,
    }
}

/// Appends `<prefix>_mean`, `_median`, `_sd`, `_range` and `_hpd95` for a
/// non-empty sample.
fn push_sample_summary(annotations: &mut Vec<(String, String)>, prefix: &str, values: &[f64]) {
    let (Some((mean, variance)), Some(median), Some((min, max)), Some((lo, hi))) = (
        stats::mean_and_sample_variance(values),
        stats::median(values),
        stats::range(values),
        stats::hpd_interval(values, 0.95),
    ) else {
        return;
    };
    annotations.push((format!("{prefix}_mean"), mean.to_string()));
    annotations.push((format!("{prefix}_median"), median.to_string()));
    annotations.push((format!("{prefix}_sd"), variance.sqrt().to_string()));
    annotations.push((format!("{prefix}_range"), format!("{{{min},{max}}}")));
    annotations.push((format!("{prefix}_hpd95"), format!("{{{lo},{hi}}}")));
}
