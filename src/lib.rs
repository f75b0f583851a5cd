//! Crate root: module orchestration and public re-exports.
//!
//! Modules:
//! - `bitset`: multi-word bitmask used to encode splits.
//! - `taxon`: lockable taxon namespace mapping labels to bit indices.
//! - `tree`: arena tree with per-edge split, length and support data.
//! - `splits`: split encoding, normalization and rendering helpers.
//! - `distribution`: weighted split counting and support scoring.
//! - `topology`: topology counting and tree probabilities.
//! - `consensus`: majority-rule consensus construction.
//! - `summarize`: support mapping, edge length / node age summaries, metadata.
//! - `stats`: sample statistics.
//! - `worker`: serial and parallel counting over tree sources.
//! - `io`: NEXUS/Newick reading and writing.
//! - `config`: run options and their interactions.
//! - `pipeline`: a complete summarization run.

pub mod bitset;
pub mod config;
pub mod consensus;
pub mod distribution;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod splits;
pub mod stats;
pub mod summarize;
pub mod taxon;
pub mod topology;
pub mod tree;
pub mod worker;

// Re-export frequently used types & functions
pub use bitset::Bitset;
pub use config::SumTreesConfig;
pub use consensus::{tree_from_splits, GREATER_THAN_HALF};
pub use distribution::{SplitDistribution, SplitStats};
pub use error::{Result, SumTreesError};
pub use pipeline::{run, SummaryOutput};
pub use summarize::TreeSummarizer;
pub use taxon::TaxonNamespace;
pub use topology::TopologyCounter;
pub use tree::{Rooting, RootingInterpretation, Tree};
pub use worker::{CancellationToken, TreeSource};
