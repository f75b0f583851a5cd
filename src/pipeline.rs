//! A complete summarization run: count the support trees, then build or map
//! the summary trees and write them out.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local, TimeDelta};
use tracing::{info, warn};

use crate::config::{EdgeSummarization, SumTreesConfig, SupportTarget};
use crate::consensus::tree_from_splits;
use crate::distribution::SplitDistribution;
use crate::error::{Result, SumTreesError};
use crate::io::{
    create_output, discover_taxa, write_newick, write_nexus, write_split_edge_lengths, write_tree_probabilities,
    NewickOptions, NexusReader,
};
use crate::stats;
use crate::summarize::TreeSummarizer;
use crate::taxon::TaxonNamespace;
use crate::topology::TopologyCounter;
use crate::tree::Tree;
use crate::worker::{process_sources_parallel, process_sources_serial, CancellationToken, CountResult, CountingOptions};

/// Everything a run produces.
#[derive(Debug)]
pub struct SummaryOutput {
    pub trees: Vec<Tree>,
    pub namespace: Arc<TaxonNamespace>,
    pub distribution: SplitDistribution,
    pub topologies: TopologyCounter,
    /// Human-readable run summary, also written as NEXUS comments.
    pub report: Vec<String>,
    pub trees_read: usize,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
}

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Runs a summarization with a configuration already passed through
/// [`SumTreesConfig::resolve`].
pub fn run(config: &SumTreesConfig) -> Result<SummaryOutput> {
    run_with_cancel(config, &CancellationToken::new())
}

/// Like [`run`], with a token that stops parallel workers early. Cancelled
/// workers contribute nothing to the counts.
pub fn run_with_cancel(config: &SumTreesConfig, cancel: &CancellationToken) -> Result<SummaryOutput> {
    let started_at = Local::now();
    let first = config
        .support_files
        .first()
        .ok_or_else(|| SumTreesError::InvalidConfig("no support files given".to_string()))?;
    let namespace = Arc::new(discover_taxa(first)?);
    namespace.lock();
    info!(taxa = namespace.len(), source = %first.display(), "taxon namespace established");

    let reader = NexusReader {
        rooting: config.rooting,
        store_tree_weights: config.weighted_trees,
    };
    let options = CountingOptions {
        tree_offset: config.burnin,
        calc_tree_probs: config.calc_tree_probs(),
        ignore_edge_lengths: false,
        ignore_node_ages: config.ignore_node_ages(),
        ultrametricity_precision: config.ultrametricity_precision,
        ignore_tree_weights: !config.weighted_trees,
        log_frequency: config.log_frequency,
    };

    let started = Instant::now();
    let counts = count(config, &reader, &namespace, &options, cancel)?;
    info!(
        trees = counts.trees_read,
        elapsed_secs = started.elapsed().as_secs_f64(),
        "split counting done"
    );
    let CountResult {
        distribution,
        topologies,
        trees_read,
    } = counts;

    if distribution.is_mixed_rootings_counted() {
        return Err(SumTreesError::MixedRooting);
    }
    if distribution.total_trees_counted() == 0 {
        return Err(SumTreesError::NoTrees(first.clone()));
    }

    let mut report = run_report(config, &distribution, trees_read);

    let summarizer = TreeSummarizer {
        support_as_labels: config.support_target == SupportTarget::Labels,
        support_as_edge_lengths: config.support_target == SupportTarget::EdgeLengths,
        support_as_percentages: config.support_as_percentages,
        support_label_decimals: config.support_label_decimals,
        add_node_metadata: !config.suppress_summary_metadata,
    };

    let mut trees = match &config.target {
        Some(target) => {
            let targets = read_targets(&reader, target, &namespace, &distribution, config.root_target_at_midpoint)?;
            report.push(format!(
                "Split support mapped onto {} target tree(s) from '{}'.",
                targets.len(),
                target.display()
            ));
            if config.root_target_at_midpoint {
                report.push("Target tree(s) rooted at midpoint.".to_string());
            }
            targets
                .into_iter()
                .map(|tree| summarizer.map_split_support_to_tree(tree, &distribution))
                .collect::<Result<Vec<_>>>()?
        }
        None => {
            report.push(format!(
                "Majority-rule consensus tree with minimum clade frequency threshold {}.",
                config.min_clade_freq
            ));
            let mut consensus = tree_from_splits(&distribution, config.min_clade_freq)?;
            if config.root_target_at_midpoint {
                // consensus edges carry no lengths until summarized
                summarizer.summarize_edge_lengths_on_tree(&mut consensus, &distribution, stats::mean);
                consensus.reroot_at_midpoint();
                consensus = summarizer.map_split_support_to_tree(consensus, &distribution)?;
                report.push("Consensus tree rooted at midpoint.".to_string());
            }
            vec![consensus]
        }
    };
    report.extend(edge_report(config));
    for line in &report {
        info!("{line}");
    }

    for tree in &mut trees {
        summarizer.annotate_nodes_and_edges(tree, &distribution);
        summarize_edges(config, &summarizer, tree, &distribution);
        summarizer.apply_support_presentation(tree);
    }

    Ok(SummaryOutput {
        trees,
        namespace,
        distribution,
        topologies,
        report,
        trees_read,
        started_at,
        finished_at: Local::now(),
    })
}

fn count(
    config: &SumTreesConfig,
    reader: &NexusReader,
    namespace: &Arc<TaxonNamespace>,
    options: &CountingOptions,
    cancel: &CancellationToken,
) -> Result<CountResult> {
    let sources = &config.support_files;
    match config.num_workers() {
        Some(workers) if sources.len() > 1 => {
            let parallel = process_sources_parallel(reader, sources, namespace, options, workers, cancel)?;
            if !parallel.cancelled_workers.is_empty() {
                warn!(
                    cancelled = ?parallel.cancelled_workers,
                    "run was interrupted: summary is based on completed workers only"
                );
            }
            Ok(parallel.counts)
        }
        Some(_) => {
            warn!("only one source of trees: running in serial mode");
            process_sources_serial(reader, sources, namespace, options)
        }
        None => process_sources_serial(reader, sources, namespace, options),
    }
}

/// Reads the target trees and checks that their rooting matches the support
/// trees. Midpoint-rooted targets may be mapped onto unrooted support.
fn read_targets(
    reader: &NexusReader,
    target: &Path,
    namespace: &Arc<TaxonNamespace>,
    distribution: &SplitDistribution,
    midpoint: bool,
) -> Result<Vec<Tree>> {
    let mut trees = reader.read_trees(target, namespace)?;
    if trees.is_empty() {
        return Err(SumTreesError::NoTrees(target.to_path_buf()));
    }
    if midpoint {
        trees.iter_mut().for_each(Tree::reroot_at_midpoint);
    }
    for tree in &trees {
        if distribution.is_all_counted_trees_rooted() && !tree.is_rooted() {
            return Err(SumTreesError::InvalidConfig(
                "support trees are rooted, but target tree is unrooted: root the target tree(s) or force \
                 the support trees to be unrooted with '--unrooted'"
                    .to_string(),
            ));
        }
        if !midpoint && distribution.is_all_counted_trees_treated_as_unrooted() && tree.is_rooted() {
            return Err(SumTreesError::InvalidConfig(
                "support trees are unrooted, but target tree is rooted: unroot the target tree(s) or force \
                 the support trees to be rooted with '--rooted'"
                    .to_string(),
            ));
        }
    }
    Ok(trees)
}

fn summarize_edges(config: &SumTreesConfig, summarizer: &TreeSummarizer, tree: &mut Tree, distribution: &SplitDistribution) {
    let Some(method) = config.edge_summarization else {
        return;
    };
    let summary: fn(&[f64]) -> Option<f64> = if method.is_mean() { stats::mean } else { stats::median };
    match method {
        EdgeSummarization::Keep => {}
        EdgeSummarization::Unweighted => tree.clear_edge_lengths(),
        EdgeSummarization::MeanLength | EdgeSummarization::MedianLength => {
            summarizer.summarize_edge_lengths_on_tree(tree, distribution, summary);
        }
        EdgeSummarization::MeanAge | EdgeSummarization::MedianAge => {
            summarizer.summarize_node_ages_on_tree(tree, distribution, summary, true, config.collapse_negative_edges);
        }
    }
}

fn edge_report(config: &SumTreesConfig) -> Vec<String> {
    let Some(method) = config.edge_summarization else {
        return Vec::new();
    };
    let statistic = if method.is_mean() { "mean" } else { "median" };
    match method {
        EdgeSummarization::Keep => vec!["Not setting edge lengths on output tree(s).".to_string()],
        EdgeSummarization::Unweighted => vec!["Edge lengths removed from output tree(s).".to_string()],
        EdgeSummarization::MeanLength | EdgeSummarization::MedianLength => vec![format!(
            "Setting edge lengths of output tree(s) to {statistic} length of corresponding edges of input trees."
        )],
        EdgeSummarization::MeanAge | EdgeSummarization::MedianAge => vec![
            format!("Setting node ages of output tree(s) to {statistic} ages of corresponding nodes of input trees."),
            if config.collapse_negative_edges {
                "Parent node ages coerced to be at least as old as oldest daughter node age.".to_string()
            } else {
                "Parent node ages not adjusted: negative edge lengths allowed.".to_string()
            },
        ],
    }
}

fn run_time(elapsed: TimeDelta) -> String {
    let millis = elapsed.num_milliseconds().max(0);
    let hours = millis / 3_600_000;
    let minutes = millis / 60_000 % 60;
    let seconds = (millis % 60_000) as f64 / 1000.0;
    format!("Run time: {hours} hour(s), {minutes} minute(s), {seconds:.3} second(s).")
}

fn run_report(config: &SumTreesConfig, distribution: &SplitDistribution, trees_read: usize) -> Vec<String> {
    let mut report = Vec::new();
    let sources = config.support_files.len();
    report.push(format!(
        "{trees_read} trees read from {sources} source(s), {} discarded as burn-in.",
        trees_read - distribution.total_trees_counted()
    ));
    report.push(format!(
        "{} trees considered in total for split support assessment.",
        distribution.total_trees_counted()
    ));
    let rooting = if distribution.is_all_counted_trees_rooted() {
        "Trees treated as rooted."
    } else if distribution.is_all_counted_trees_strictly_unrooted() {
        "Trees treated as unrooted."
    } else {
        "Trees without rooting statements treated as unrooted."
    };
    report.push(rooting.to_string());
    if config.weighted_trees {
        report.push(format!(
            "Trees weighted by their tree weights (sum of weights {}).",
            distribution.sum_of_tree_weights()
        ));
    } else {
        report.push("Trees treated as unweighted.".to_string());
    }
    let (total, unique, nt_total, nt_unique) = distribution.splits_considered();
    report.push(format!("{unique} unique splits counted ({total} in total)."));
    report.push(format!(
        "{nt_unique} unique non-trivial splits counted ({nt_total} in total)."
    ));
    report
}

impl SummaryOutput {
    /// Lines of the NEXUS file comment: program version, support sources,
    /// timing and the run report (unless meta comments are off), then any
    /// additional comments.
    pub fn file_comments(&self, config: &SumTreesConfig) -> Vec<String> {
        let mut lines = Vec::new();
        if config.include_meta_comments {
            lines.push(format!("{} {}.", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")));
            lines.push("Basis of split support:".to_string());
            for source in &config.support_files {
                if source.as_os_str() == "-" {
                    lines.push("  - trees read from standard input".to_string());
                } else {
                    let path = std::path::absolute(source).unwrap_or_else(|_| source.clone());
                    lines.push(format!("  - '{}'", path.display()));
                }
            }
            lines.push(format!("Began at: {}.", self.started_at.format(TIMESTAMP_FORMAT)));
            lines.push(format!("Ended at: {}.", self.finished_at.format(TIMESTAMP_FORMAT)));
            lines.push(run_time(self.finished_at - self.started_at));
            lines.extend(self.report.iter().cloned());
        }
        if let Some(extra) = &config.additional_comments {
            if !lines.is_empty() {
                lines.push(String::new());
            }
            lines.push(extra.clone());
        }
        lines
    }

    /// Writes the summary trees, and the tree probability and split edge
    /// tables when requested.
    pub fn write(&self, config: &SumTreesConfig) -> Result<()> {
        let started = Instant::now();
        let options = NewickOptions {
            annotations: !config.suppress_summary_metadata,
            ..NewickOptions::default()
        };
        let destination = config.output.as_deref().unwrap_or(Path::new("-"));
        let mut out = create_output(destination, config.replace)?;
        if config.to_newick {
            write_newick(&mut out, &self.trees, &self.namespace, options)?;
        } else {
            let comments = self.file_comments(config);
            write_nexus(&mut out, &self.trees, &self.namespace, &comments, config.include_taxa_block, options)?;
        }
        out.finish()?;
        info!(
            output = %destination.display(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "summary trees written"
        );

        if let Some(path) = &config.trprobs {
            let mut out = create_output(path, config.replace)?;
            write_tree_probabilities(
                &mut out,
                &self.topologies.tree_probabilities(),
                &self.namespace,
                config.include_taxa_block,
            )?;
            out.finish()?;
            info!(output = %path.display(), topologies = self.topologies.len(), "tree probabilities written");
        }
        if let Some(path) = &config.extract_edges {
            let mut out = create_output(path, config.replace)?;
            write_split_edge_lengths(&mut out, &self.distribution)?;
            out.finish()?;
            info!(output = %path.display(), splits = self.distribution.len(), "split edge lengths written");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::bitset::Bitset;
    use crate::config::Parallelism;
    use crate::tree::RootingInterpretation;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn config(files: Vec<PathBuf>) -> SumTreesConfig {
        SumTreesConfig {
            support_files: files,
            ..SumTreesConfig::default()
        }
    }

    #[test]
    fn consensus_of_unrooted_trees() {
        let dir = tempfile::tempdir().unwrap();
        let support = write(
            dir.path(),
            "support.tre",
            "((A:1,B:1):1,(C:1,D:1):1,E:1);\n((A:1,B:1):3,(C:1,E:1):1,D:1);\n((A:1,C:1):1,(B:1,D:1):1,E:1);\n",
        );
        let config = config(vec![support]).resolve().unwrap();
        let output = run(&config).unwrap();
        assert_eq!(output.trees.len(), 1);
        assert_eq!(output.distribution.total_trees_counted(), 3);
        let ab = Bitset::from_u64(0b00011);
        assert!((output.distribution.frequency(&ab) - 2.0 / 3.0).abs() < 1e-12);

        let tree = &output.trees[0];
        let internal: Vec<_> = tree.internal_nodes().into_iter().filter(|&id| id != tree.root()).collect();
        assert_eq!(internal.len(), 1);
        let node = tree.node(internal[0]);
        assert_eq!(node.label.as_deref(), Some("0.66666667"));
        assert_eq!(node.edge.length, Some(2.0));
        assert!(output.report.iter().any(|l| l.starts_with("3 trees considered")));
    }

    #[test]
    fn burnin_and_tree_probabilities() {
        let dir = tempfile::tempdir().unwrap();
        let support = write(
            dir.path(),
            "support.tre",
            "(((A,B),D),C);\n(((A,C),B),D);\n(((A,B),C),D);\n(((A,B),C),D);\n",
        );
        let mut config = config(vec![support]);
        config.burnin = 1;
        config.rooting = RootingInterpretation::ForceRooted;
        config.trprobs = Some(dir.path().join("trprobs.nex"));
        let config = config.resolve().unwrap();
        let output = run(&config).unwrap();
        assert_eq!(output.trees_read, 4);
        assert_eq!(output.distribution.total_trees_counted(), 3);
        let ranked = output.topologies.calc_tree_freqs();
        assert_eq!(ranked.len(), 2);
        assert!((ranked[0].frequency - 2.0 / 3.0).abs() < 1e-12);

        output.write(&SumTreesConfig {
            output: Some(dir.path().join("out.nex")),
            ..config.clone()
        })
        .unwrap();
        let trprobs = std::fs::read_to_string(dir.path().join("trprobs.nex")).unwrap();
        assert!(trprobs.contains("TREE Tree1 = [&count=2,probability="));
        assert!(trprobs.contains("TREE Tree2"));
    }

    #[test]
    fn target_rooting_must_match() {
        let dir = tempfile::tempdir().unwrap();
        let support = write(dir.path(), "support.tre", "[&R] ((A:1,B:1):1,(C:1,D:1):1);\n");
        let target = write(dir.path(), "target.tre", "[&U] ((A,B),C,D);\n");
        let mut config = config(vec![support]);
        config.target = Some(target);
        let config = config.resolve().unwrap();
        assert!(matches!(run(&config), Err(SumTreesError::InvalidConfig(_))));
    }

    #[test]
    fn support_mapped_onto_target() {
        let dir = tempfile::tempdir().unwrap();
        let support = write(
            dir.path(),
            "support.tre",
            "((A:1,B:1):1,C:1,D:1);\n((A:1,C:1):1,B:1,D:1);\n",
        );
        let target = write(dir.path(), "target.tre", "((A:5,B:5):5,C:5,D:5);\n");
        let mut config = config(vec![support]);
        config.target = Some(target);
        config.support_as_percentages = true;
        config.support_label_decimals = 0;
        let config = config.resolve().unwrap();
        let output = run(&config).unwrap();
        let tree = &output.trees[0];
        let clade = tree
            .internal_nodes()
            .into_iter()
            .find(|&id| id != tree.root())
            .unwrap();
        assert_eq!(tree.node(clade).label.as_deref(), Some("50"));
        // keep is the default with a target
        assert_eq!(tree.node(clade).edge.length, Some(5.0));
    }

    #[test]
    fn mixed_rooting_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let support = write(dir.path(), "support.tre", "[&R] ((A,B),(C,D));\n[&U] ((A,B),C,D);\n");
        let config = config(vec![support]).resolve().unwrap();
        let err = run(&config).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn parallel_run_matches_serial() {
        let dir = tempfile::tempdir().unwrap();
        let first = write(dir.path(), "a.tre", "((A:1,B:1):1,C:1,D:1);\n((A:1,B:1):1,C:1,D:1);\n");
        let second = write(dir.path(), "b.tre", "((A:1,C:1):1,B:1,D:1);\n((A:1,B:1):1,C:1,D:1);\n");
        let serial = run(&config(vec![first.clone(), second.clone()]).resolve().unwrap()).unwrap();
        let mut parallel = config(vec![first, second]);
        parallel.parallelism = Some(Parallelism::PerSource);
        let parallel = run(&parallel.resolve().unwrap()).unwrap();
        let ab = Bitset::from_u64(0b0011);
        assert_eq!(serial.distribution.frequency(&ab), 0.75);
        assert_eq!(parallel.distribution.frequency(&ab), 0.75);
        assert_eq!(parallel.trees_read, 4);
    }

    #[test]
    fn target_rooted_at_midpoint() {
        let dir = tempfile::tempdir().unwrap();
        let trees = "((A:1,B:1):1,(C:1,D:1):1,E:6);\n";
        let support = write(dir.path(), "support.tre", &trees.repeat(2));
        let target = write(dir.path(), "target.tre", trees);
        let mut config = config(vec![support]);
        config.target = Some(target);
        config.root_target_at_midpoint = true;
        let config = config.resolve().unwrap();
        let output = run(&config).unwrap();
        assert!(output.report.iter().any(|l| l == "Target tree(s) rooted at midpoint."));

        // the A..E path has length 8: the root sits 4 above E
        let tree = &output.trees[0];
        assert!(tree.is_rooted());
        let root = tree.node(tree.root());
        assert_eq!(root.children.len(), 2);
        let e = root.children.iter().copied().find(|&c| tree.node(c).taxon == Some(4)).unwrap();
        assert_eq!(tree.node(e).edge.length, Some(4.0));
        let ab = tree
            .internal_nodes()
            .into_iter()
            .find(|&id| tree.node(id).edge.split == Some(Bitset::from_u64(0b00011)))
            .unwrap();
        assert_eq!(tree.node(ab).label.as_deref(), Some("1.00000000"));
    }

    #[test]
    fn consensus_rooted_at_midpoint_shares_the_basal_length() {
        let dir = tempfile::tempdir().unwrap();
        let support = write(dir.path(), "support.tre", &"((A:1,B:1):1,(C:1,D:1):1,E:6);\n".repeat(2));
        let mut config = config(vec![support]);
        config.root_target_at_midpoint = true;
        let output = run(&config.resolve().unwrap()).unwrap();
        assert!(output.report.iter().any(|l| l == "Consensus tree rooted at midpoint."));

        let tree = &output.trees[0];
        assert!(tree.is_rooted());
        let root = tree.node(tree.root());
        let e = root.children.iter().copied().find(|&c| tree.node(c).taxon == Some(4)).unwrap();
        let rest = root.children.iter().copied().find(|&c| c != e).unwrap();
        assert!((tree.node(e).edge.length.unwrap() - 4.0).abs() < 1e-12);
        assert!((tree.node(rest).edge.length.unwrap() - 2.0).abs() < 1e-12);
        assert_eq!(tree.node(rest).children.len(), 2);
    }

    #[test]
    fn file_comments_and_taxa_block() {
        let dir = tempfile::tempdir().unwrap();
        let support = write(dir.path(), "support.tre", "((A:1,B:1):1,C:1,D:1);\n");
        let mut config = config(vec![support.clone()]);
        config.output = Some(dir.path().join("out.nex"));
        config.additional_comments = Some("replicate 3".to_string());
        config.include_taxa_block = false;
        let config = config.resolve().unwrap();
        let output = run(&config).unwrap();

        let comments = output.file_comments(&config);
        assert!(comments[0].starts_with("sumtrees "));
        assert_eq!(comments[1], "Basis of split support:");
        let absolute = std::path::absolute(&support).unwrap();
        assert_eq!(comments[2], format!("  - '{}'", absolute.display()));
        assert!(comments[3].starts_with("Began at: "));
        assert!(comments[4].starts_with("Ended at: "));
        assert!(comments[5].starts_with("Run time: 0 hour(s), 0 minute(s), "));
        assert!(comments.iter().any(|l| l.starts_with("Setting edge lengths of output tree(s) to mean length")));
        assert_eq!(comments[comments.len() - 2], "");
        assert_eq!(comments[comments.len() - 1], "replicate 3");

        output.write(&config).unwrap();
        let text = std::fs::read_to_string(dir.path().join("out.nex")).unwrap();
        assert!(text.contains("Basis of split support:"));
        assert!(text.contains("replicate 3"));
        assert!(!text.contains("BEGIN TAXA;"));

        let quiet = SumTreesConfig {
            include_meta_comments: false,
            ..config.clone()
        };
        assert_eq!(output.file_comments(&quiet), vec!["replicate 3".to_string()]);
        let silent = SumTreesConfig {
            additional_comments: None,
            ..quiet
        };
        assert!(output.file_comments(&silent).is_empty());
    }

    #[test]
    fn run_time_is_split_into_units() {
        assert_eq!(
            run_time(TimeDelta::milliseconds(3_723_500)),
            "Run time: 1 hour(s), 2 minute(s), 3.500 second(s)."
        );
    }

    #[test]
    fn default_rooted_reads_plain_trees_as_rooted() {
        let dir = tempfile::tempdir().unwrap();
        let support = write(dir.path(), "support.tre", "((A:1,B:1):1,(C:1,D:1):1);\n[&U] ((A:1,B:1):1,C:1,D:1);\n");
        let mut config = config(vec![support.clone()]);
        config.rooting = RootingInterpretation::DefaultRooted;
        // the explicit [&U] statement still wins, so rootings are mixed
        assert!(matches!(run(&config.clone().resolve().unwrap()), Err(SumTreesError::MixedRooting)));

        let only_plain = write(dir.path(), "plain.tre", "((A:1,B:1):1,(C:1,D:1):1);\n");
        config.support_files = vec![only_plain];
        let output = run(&config.resolve().unwrap()).unwrap();
        assert!(output.distribution.is_all_counted_trees_rooted());
        assert!(output.trees[0].is_rooted());
    }
}
