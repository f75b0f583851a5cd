//! Error type shared by the aggregation engine, the readers and the run driver.

use std::path::PathBuf;

use crate::tree::NodeId;

/// Errors raised while encoding, counting or summarizing splits.
///
/// Variants reported by [`SumTreesError::is_fatal`] mean the aggregated
/// statistics can no longer be trusted and the whole run must stop.
#[derive(Debug, thiserror::Error)]
pub enum SumTreesError {
    #[error("taxon namespace is locked: cannot register taxon '{label}'")]
    NamespaceLocked { label: String },

    #[error("taxon '{label}' is not in the taxon namespace")]
    UnknownTaxon { label: String },

    #[error("leaf node {node} has no taxon assigned")]
    UnmappedLeaf { node: NodeId },

    #[error(
        "both rooted as well as unrooted trees found in input trees; support values are \
         meaningless (use '--rooted' or '--unrooted' to force a consistent rooting state)"
    )]
    MixedRooting,

    #[error("split frequencies have been finalized; reset the distribution before counting more trees")]
    DistributionFinalized,

    #[error("split distributions were built against different taxon namespaces")]
    NamespaceMismatch,

    #[error("tree is not ultrametric: node {node} has ages {first} and {second} (precision {precision})")]
    NotUltrametric {
        node: NodeId,
        first: f64,
        second: f64,
        precision: f64,
    },

    #[error("edge leading to node {node} has no length")]
    MissingEdgeLength { node: NodeId },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse tree {index} in {path:?}: {message}")]
    Parse {
        path: PathBuf,
        index: usize,
        message: String,
    },

    #[error("no trees found in {0:?}")]
    NoTrees(PathBuf),

    #[error("output file {0:?} already exists (use '--replace' to overwrite)")]
    OutputExists(PathBuf),

    #[error("worker pool error: {0}")]
    ThreadPool(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SumTreesError {
    /// True for errors that invalidate accumulated statistics.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SumTreesError::MixedRooting
                | SumTreesError::NamespaceLocked { .. }
                | SumTreesError::DistributionFinalized
                | SumTreesError::NamespaceMismatch
        )
    }
}

pub type Result<T> = std::result::Result<T, SumTreesError>;
