//! Run configuration and the interactions between options.
//!
//! [`SumTreesConfig`] holds options as given. [`SumTreesConfig::resolve`]
//! turns it into a consistent run description: node-age summaries force
//! rooted ultrametric trees, a missing target can fall back to a consensus
//! tree, the default edge summarization depends on the output kind, and
//! worker counts are validated.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use crate::consensus::GREATER_THAN_HALF;
use crate::error::{Result, SumTreesError};
use crate::io::resolve_sources;
use crate::tree::RootingInterpretation;

/// How output edge lengths are set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeSummarization {
    MeanLength,
    MedianLength,
    MeanAge,
    MedianAge,
    /// Leave target tree lengths untouched.
    Keep,
    /// Strip all lengths.
    Unweighted,
}

impl EdgeSummarization {
    pub fn is_age(self) -> bool {
        matches!(self, EdgeSummarization::MeanAge | EdgeSummarization::MedianAge)
    }

    pub fn is_mean(self) -> bool {
        matches!(self, EdgeSummarization::MeanLength | EdgeSummarization::MeanAge)
    }
}

/// Where support values are shown besides node metadata.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SupportTarget {
    #[default]
    Labels,
    EdgeLengths,
    None,
}

/// Worker count request (`-m N`, `-m '*'`, `-m @`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parallelism {
    Processes(usize),
    /// One worker per available core.
    AllCores,
    /// One worker per support file.
    PerSource,
}

impl FromStr for Parallelism {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "*" => Ok(Parallelism::AllCores),
            "@" => Ok(Parallelism::PerSource),
            n => n
                .parse::<usize>()
                .map(Parallelism::Processes)
                .map_err(|_| format!("'{n}' is not a valid number of processes (must be a positive integer)")),
        }
    }
}

impl fmt::Display for Parallelism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parallelism::Processes(n) => write!(f, "{n}"),
            Parallelism::AllCores => write!(f, "*"),
            Parallelism::PerSource => write!(f, "@"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SumTreesConfig {
    pub support_files: Vec<PathBuf>,
    /// Trees skipped at the start of each support file.
    pub burnin: usize,
    /// How support (and target) trees' rooting statements are read.
    pub rooting: RootingInterpretation,
    pub ultrametric: bool,
    pub weighted_trees: bool,
    pub target: Option<PathBuf>,
    /// Reroot target trees, or the consensus tree, at their midpoint.
    pub root_target_at_midpoint: bool,
    pub min_clade_freq: f64,
    pub support_target: SupportTarget,
    pub support_as_percentages: bool,
    pub support_label_decimals: usize,
    pub edge_summarization: Option<EdgeSummarization>,
    pub collapse_negative_edges: bool,
    pub trprobs: Option<PathBuf>,
    pub extract_edges: Option<PathBuf>,
    pub calc_node_ages: Option<bool>,
    pub suppress_summary_metadata: bool,
    pub ultrametricity_precision: f64,
    /// `None` writes to standard output.
    pub output: Option<PathBuf>,
    pub to_newick: bool,
    pub replace: bool,
    pub parallelism: Option<Parallelism>,
    pub log_frequency: usize,
    pub ignore_missing_support: bool,
    pub ignore_missing_target: bool,
    /// Write the run report as a comment at the top of NEXUS output.
    pub include_meta_comments: bool,
    /// Extra text appended to the NEXUS file comment.
    pub additional_comments: Option<String>,
    pub include_taxa_block: bool,
}

impl Default for SumTreesConfig {
    fn default() -> Self {
        SumTreesConfig {
            support_files: Vec::new(),
            burnin: 0,
            rooting: RootingInterpretation::DefaultUnrooted,
            ultrametric: false,
            weighted_trees: false,
            target: None,
            root_target_at_midpoint: false,
            min_clade_freq: GREATER_THAN_HALF,
            support_target: SupportTarget::Labels,
            support_as_percentages: false,
            support_label_decimals: 8,
            edge_summarization: None,
            collapse_negative_edges: false,
            trprobs: None,
            extract_edges: None,
            calc_node_ages: None,
            suppress_summary_metadata: false,
            ultrametricity_precision: 1e-7,
            output: None,
            to_newick: false,
            replace: false,
            parallelism: None,
            log_frequency: 500,
            ignore_missing_support: false,
            ignore_missing_target: false,
            include_meta_comments: true,
            additional_comments: None,
            include_taxa_block: true,
        }
    }
}

impl SumTreesConfig {
    /// Applies option interactions and validates the result.
    ///
    /// # Errors
    /// `InvalidConfig` for zero workers, age summaries with node ages turned
    /// off, or no usable support file; `Io` for missing files that are not
    /// to be ignored.
    pub fn resolve(mut self) -> Result<Self> {
        self.support_files = resolve_sources(&self.support_files, self.ignore_missing_support)?;
        if self.support_files.is_empty() {
            return Err(SumTreesError::InvalidConfig(
                "no valid sources of input trees specified".to_string(),
            ));
        }

        if let Some(target) = &self.target {
            if !target.exists() {
                if !self.ignore_missing_target {
                    return Err(SumTreesError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("target tree file not found: {}", target.display()),
                    )));
                }
                warn!(target = %target.display(), "target tree file not found: using majority-rule consensus tree instead");
                self.target = None;
            }
        }

        if self.edge_summarization.is_some_and(EdgeSummarization::is_age) {
            if self.calc_node_ages == Some(false) {
                return Err(SumTreesError::InvalidConfig(
                    "summarizing node ages requires node ages to be calculated".to_string(),
                ));
            }
            self.ultrametric = true;
            self.rooting = RootingInterpretation::ForceRooted;
            self.calc_node_ages = Some(true);
        } else if self.ultrametric {
            self.rooting = RootingInterpretation::ForceRooted;
            self.calc_node_ages.get_or_insert(true);
        } else if self.calc_node_ages == Some(true) {
            self.ultrametric = true;
            self.rooting = RootingInterpretation::ForceRooted;
        } else {
            self.calc_node_ages = Some(false);
        }

        if self.edge_summarization.is_none() {
            self.edge_summarization = Some(if self.target.is_some() {
                EdgeSummarization::Keep
            } else if self.ultrametric {
                EdgeSummarization::MedianAge
            } else {
                EdgeSummarization::MeanLength
            });
        }

        if !self.support_as_percentages && self.support_label_decimals < 2 {
            warn!("reporting support by proportions requires at least 2 decimal places");
            self.support_label_decimals = 2;
        }

        self.parallelism = match self.parallelism {
            None => None,
            Some(Parallelism::Processes(0)) => {
                return Err(SumTreesError::InvalidConfig(
                    "cannot run with less than 1 worker process".to_string(),
                ));
            }
            Some(Parallelism::Processes(n)) => Some(Parallelism::Processes(n)),
            Some(Parallelism::AllCores) => Some(Parallelism::Processes(
                std::thread::available_parallelism().map_or(1, usize::from),
            )),
            Some(Parallelism::PerSource) => Some(Parallelism::Processes(self.support_files.len())),
        };
        if self.parallelism == Some(Parallelism::Processes(1)) {
            warn!("running in parallel mode limited to only 1 worker: serial mode is probably more efficient");
        }

        if !self.replace {
            let outputs = [&self.output, &self.trprobs, &self.extract_edges];
            for path in outputs.into_iter().flatten() {
                if path.as_os_str() != "-" && path.exists() {
                    return Err(SumTreesError::OutputExists(path.clone()));
                }
            }
        }
        Ok(self)
    }

    /// Worker count after [`resolve`](Self::resolve); `None` means serial.
    pub fn num_workers(&self) -> Option<usize> {
        match self.parallelism {
            Some(Parallelism::Processes(n)) => Some(n),
            _ => None,
        }
    }

    pub fn calc_tree_probs(&self) -> bool {
        self.trprobs.is_some()
    }

    pub fn ignore_node_ages(&self) -> bool {
        self.calc_node_ages != Some(true)
    }
}
