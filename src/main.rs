use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use sumtrees::config::{EdgeSummarization, Parallelism, SumTreesConfig, SupportTarget};
use sumtrees::{pipeline, RootingInterpretation, SumTreesError, GREATER_THAN_HALF};
use tracing::{error, info};

/// Summarize split support across a collection of trees, as a majority-rule
/// consensus tree or mapped onto target trees.
#[derive(Parser, Debug)]
#[command(name = "sumtrees", version, about = "Summarize split support across phylogenetic trees")]
struct Args {
    /// Support tree files (NEXUS or Newick, optionally gzipped); '-' reads stdin
    #[arg(required = true)]
    support_files: Vec<PathBuf>,

    /// Number of trees to skip at the start of each support file
    #[arg(short = 'b', long = "burnin", default_value_t = 0)]
    burnin: usize,

    /// Treat support trees as rooted
    #[arg(long = "rooted", conflicts_with_all = ["unrooted", "default_rooted"])]
    rooted: bool,

    /// Treat support trees as unrooted
    #[arg(long = "unrooted", conflicts_with = "default_rooted")]
    unrooted: bool,

    /// Treat trees without a rooting statement as rooted
    #[arg(long = "default-rooted")]
    default_rooted: bool,

    /// Support trees are ultrametric: summarize node ages
    #[arg(long = "ultrametric", default_value_t = false)]
    ultrametric: bool,

    /// Weight trees by their [&W ...] comments
    #[arg(long = "weighted-trees", default_value_t = false)]
    weighted_trees: bool,

    /// Map support onto the trees of this file instead of building a consensus
    #[arg(short = 't', long = "target")]
    target: Option<PathBuf>,

    /// Reroot the target or consensus tree(s) at their midpoint
    #[arg(long = "root-target-at-midpoint", default_value_t = false)]
    root_target_at_midpoint: bool,

    /// Minimum frequency for a split to enter the consensus tree
    #[arg(short = 'f', long = "min-clade-freq", default_value_t = GREATER_THAN_HALF)]
    min_clade_freq: f64,

    /// Show support as internal node labels (default)
    #[arg(short = 'l', long = "support-as-labels", conflicts_with_all = ["support_as_lengths", "no_support"])]
    support_as_labels: bool,

    /// Show support as edge lengths
    #[arg(short = 'v', long = "support-as-lengths", conflicts_with = "no_support")]
    support_as_lengths: bool,

    /// Do not show support except in node metadata
    #[arg(short = 'x', long = "no-support")]
    no_support: bool,

    /// Report support as percentages
    #[arg(short = 'p', long = "percentages", default_value_t = false)]
    percentages: bool,

    /// Decimal places of support values
    #[arg(short = 'd', long = "decimals", default_value_t = 8)]
    decimals: usize,

    /// How output edge lengths are set
    #[arg(short = 'e', long = "edges", value_enum)]
    edges: Option<EdgesArg>,

    /// Make parents at least as old as their children when summarizing ages
    #[arg(long = "collapse-negative-edges", default_value_t = false)]
    collapse_negative_edges: bool,

    /// Write topology frequencies to this file
    #[arg(long = "trprobs")]
    trprobs: Option<PathBuf>,

    /// Write every edge length observed per split to this file
    #[arg(long = "extract-edges")]
    extract_edges: Option<PathBuf>,

    /// Do not calculate node ages
    #[arg(long = "no-node-ages", default_value_t = false)]
    no_node_ages: bool,

    /// Do not annotate nodes and edges with summary metadata
    #[arg(long = "no-summary-metadata", default_value_t = false)]
    no_summary_metadata: bool,

    /// Tolerance when checking that trees are ultrametric
    #[arg(long = "ultrametricity-precision", default_value_t = 1e-7)]
    ultrametricity_precision: f64,

    /// Output path (default: stdout); '.gz' paths are compressed
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Write Newick (PHYLIP) instead of NEXUS
    #[arg(long = "to-newick", visible_alias = "to-phylip", default_value_t = false)]
    to_newick: bool,

    /// Do not write a TAXA block in NEXUS output
    #[arg(long = "no-taxa-block", default_value_t = false)]
    no_taxa_block: bool,

    /// Do not write the run report as a NEXUS file comment
    #[arg(long = "no-meta-comments", default_value_t = false)]
    no_meta_comments: bool,

    /// Additional text for the NEXUS file comment
    #[arg(short = 'c', long = "additional-comments")]
    additional_comments: Option<String>,

    /// Overwrite existing output files
    #[arg(short = 'r', long = "replace", default_value_t = false)]
    replace: bool,

    /// Parallel workers: a number, '*' for all cores or '@' for one per support file
    #[arg(short = 'm', long = "multiprocessing")]
    multiprocessing: Option<Parallelism>,

    /// Log progress every N trees (0 disables)
    #[arg(short = 'g', long = "log-frequency", default_value_t = 500)]
    log_frequency: usize,

    /// Quiet mode: only errors are logged
    #[arg(short = 'q', long = "quiet", default_value_t = false)]
    quiet: bool,

    /// Skip support files that do not exist
    #[arg(long = "ignore-missing-support", default_value_t = false)]
    ignore_missing_support: bool,

    /// Build a consensus tree if the target file does not exist
    #[arg(long = "ignore-missing-target", default_value_t = false)]
    ignore_missing_target: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum EdgesArg {
    MeanLength,
    MedianLength,
    MeanAge,
    MedianAge,
    Keep,
    Unweighted,
}

impl From<EdgesArg> for EdgeSummarization {
    fn from(arg: EdgesArg) -> Self {
        match arg {
            EdgesArg::MeanLength => EdgeSummarization::MeanLength,
            EdgesArg::MedianLength => EdgeSummarization::MedianLength,
            EdgesArg::MeanAge => EdgeSummarization::MeanAge,
            EdgesArg::MedianAge => EdgeSummarization::MedianAge,
            EdgesArg::Keep => EdgeSummarization::Keep,
            EdgesArg::Unweighted => EdgeSummarization::Unweighted,
        }
    }
}

impl Args {
    fn into_config(self) -> SumTreesConfig {
        let rooting = if self.rooted {
            RootingInterpretation::ForceRooted
        } else if self.unrooted {
            RootingInterpretation::ForceUnrooted
        } else if self.default_rooted {
            RootingInterpretation::DefaultRooted
        } else {
            RootingInterpretation::DefaultUnrooted
        };
        let support_target = if self.no_support {
            SupportTarget::None
        } else if self.support_as_lengths {
            SupportTarget::EdgeLengths
        } else {
            SupportTarget::Labels
        };
        SumTreesConfig {
            support_files: self.support_files,
            burnin: self.burnin,
            rooting,
            ultrametric: self.ultrametric,
            weighted_trees: self.weighted_trees,
            target: self.target,
            root_target_at_midpoint: self.root_target_at_midpoint,
            min_clade_freq: self.min_clade_freq,
            support_target,
            support_as_percentages: self.percentages,
            support_label_decimals: self.decimals,
            edge_summarization: self.edges.map(EdgeSummarization::from),
            collapse_negative_edges: self.collapse_negative_edges,
            trprobs: self.trprobs,
            extract_edges: self.extract_edges,
            calc_node_ages: self.no_node_ages.then_some(false),
            suppress_summary_metadata: self.no_summary_metadata,
            ultrametricity_precision: self.ultrametricity_precision,
            output: self.output,
            to_newick: self.to_newick,
            replace: self.replace,
            parallelism: self.multiprocessing,
            log_frequency: self.log_frequency,
            ignore_missing_support: self.ignore_missing_support,
            ignore_missing_target: self.ignore_missing_target,
            include_meta_comments: !self.no_meta_comments,
            additional_comments: self.additional_comments,
            include_taxa_block: !self.no_taxa_block,
        }
    }
}

fn init_tracing(quiet: bool) {
    // --quiet wins over RUST_LOG
    let filter = if quiet {
        tracing_subscriber::EnvFilter::new("error")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.quiet);

    let t0 = Instant::now();
    let config = match args.into_config().resolve() {
        Ok(config) => config,
        Err(e) => return fail(&e),
    };

    let output = match pipeline::run(&config) {
        Ok(output) => output,
        Err(e) => return fail(&e),
    };
    info!("Summarizing {:.3}s", t0.elapsed().as_secs_f64());

    let t1 = Instant::now();
    if let Err(e) = output.write(&config) {
        return fail(&e);
    }
    info!("Writing output {:.3}s", t1.elapsed().as_secs_f64());
    ExitCode::SUCCESS
}

fn fail(e: &SumTreesError) -> ExitCode {
    error!("{e}");
    match e {
        SumTreesError::InvalidConfig(_) => ExitCode::from(2),
        _ => ExitCode::from(1),
    }
}
