//! Serial and parallel split counting over tree sources.
//!
//! # Overview
//! Every worker owns its own [`SplitDistribution`] and [`TopologyCounter`]
//! built against the shared, already locked [`TaxonNamespace`]. Workers pull
//! source paths from a bounded queue until it is drained and send back a
//! single [`WorkerOutcome`]. The calling thread then merges completed
//! outcomes one by one; merge order does not change the result.
//!
//! A worker that sees the [`CancellationToken`] set stops reading and
//! reports [`WorkerOutcome::Cancelled`] without its partial counts.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::distribution::SplitDistribution;
use crate::error::{Result, SumTreesError};
use crate::taxon::TaxonNamespace;
use crate::topology::TopologyCounter;
use crate::tree::Tree;

/// Produces the trees of one source, mapped onto a locked namespace.
pub trait TreeSource: Send + Sync {
    fn trees<'a>(
        &'a self,
        source: &Path,
        namespace: &Arc<TaxonNamespace>,
    ) -> Result<Box<dyn Iterator<Item = Result<Tree>> + 'a>>;
}

/// Per-tree counting settings shared by every worker.
#[derive(Clone, Debug)]
pub struct CountingOptions {
    /// Trees skipped at the start of each source (burn-in).
    pub tree_offset: usize,
    pub calc_tree_probs: bool,
    pub ignore_edge_lengths: bool,
    pub ignore_node_ages: bool,
    pub ultrametricity_precision: f64,
    pub ignore_tree_weights: bool,
    /// Log progress every this many trees; 0 disables.
    pub log_frequency: usize,
}

impl Default for CountingOptions {
    fn default() -> Self {
        CountingOptions {
            tree_offset: 0,
            calc_tree_probs: false,
            ignore_edge_lengths: false,
            ignore_node_ages: true,
            ultrametricity_precision: 1e-7,
            ignore_tree_weights: true,
            log_frequency: 500,
        }
    }
}

/// Shared stop flag checked between trees.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Aggregated counts of one or more sources.
#[derive(Clone, Debug)]
pub struct CountResult {
    pub distribution: SplitDistribution,
    pub topologies: TopologyCounter,
    /// Trees read, burn-in included.
    pub trees_read: usize,
}

impl CountResult {
    pub fn new(namespace: &Arc<TaxonNamespace>, options: &CountingOptions) -> Self {
        let mut distribution = SplitDistribution::new(Arc::clone(namespace));
        distribution.ignore_edge_lengths = options.ignore_edge_lengths;
        distribution.ignore_node_ages = options.ignore_node_ages;
        distribution.ignore_tree_weights = options.ignore_tree_weights;
        distribution.ultrametricity_precision = options.ultrametricity_precision;
        let mut topologies = TopologyCounter::new(Arc::clone(namespace));
        topologies.ignore_tree_weights = options.ignore_tree_weights;
        CountResult {
            distribution,
            topologies,
            trees_read: 0,
        }
    }

    /// Folds another worker's counts into this one.
    pub fn merge(&mut self, other: &CountResult) -> Result<()> {
        self.distribution.merge(&other.distribution)?;
        self.topologies.merge(&other.topologies);
        self.trees_read += other.trees_read;
        Ok(())
    }
}

/// What a worker hands back to the aggregator.
#[derive(Debug)]
pub enum WorkerOutcome {
    Completed { worker: usize, counts: CountResult },
    /// Partial counts were dropped.
    Cancelled { worker: usize },
    Failed { worker: usize, error: SumTreesError },
}

/// Result of a parallel run.
#[derive(Debug)]
pub struct ParallelCount {
    pub counts: CountResult,
    pub completed_workers: usize,
    pub cancelled_workers: Vec<usize>,
}

/// Counts every tree of `sources` in order on the calling thread.
pub fn process_sources_serial(
    reader: &dyn TreeSource,
    sources: &[PathBuf],
    namespace: &Arc<TaxonNamespace>,
    options: &CountingOptions,
) -> Result<CountResult> {
    let mut counts = CountResult::new(namespace, options);
    let never = CancellationToken::new();
    for (idx, source) in sources.iter().enumerate() {
        info!(source = %source.display(), "processing source {} of {}", idx + 1, sources.len());
        count_source(reader, source, namespace, options, &never, &mut counts, None)?;
    }
    Ok(counts)
}

/// Counts `sources` on a pool of `num_workers` threads and merges the
/// results.
///
/// # Errors
/// The first error reported by a worker aborts the run; `ThreadPool` if the
/// pool cannot be built.
pub fn process_sources_parallel(
    reader: &dyn TreeSource,
    sources: &[PathBuf],
    namespace: &Arc<TaxonNamespace>,
    options: &CountingOptions,
    num_workers: usize,
    cancel: &CancellationToken,
) -> Result<ParallelCount> {
    if num_workers == 0 {
        return Err(SumTreesError::InvalidConfig(
            "number of worker processes must be at least 1".to_string(),
        ));
    }
    namespace.lock();

    let (task_tx, task_rx) = mpsc::sync_channel::<PathBuf>(sources.len().max(1));
    for source in sources {
        // capacity covers every source, so this never blocks
        task_tx
            .send(source.clone())
            .map_err(|e| SumTreesError::ThreadPool(format!("queue source: {e}")))?;
    }
    drop(task_tx);
    let task_rx = Mutex::new(task_rx);
    let (result_tx, result_rx) = mpsc::channel::<WorkerOutcome>();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_workers)
        .thread_name(|idx| format!("sumtrees-worker-{idx}"))
        .build()
        .map_err(|e| SumTreesError::ThreadPool(e.to_string()))?;

    info!(workers = num_workers, sources = sources.len(), "launching parallel workers");
    pool.scope(|scope| {
        for worker in 0..num_workers {
            let task_rx = &task_rx;
            let result_tx = result_tx.clone();
            scope.spawn(move |_| {
                let outcome = run_worker(worker, reader, task_rx, namespace, options, cancel);
                // the aggregator outlives the scope, so the receiver is alive
                let _ = result_tx.send(outcome);
            });
        }
    });
    drop(result_tx);

    let mut counts = CountResult::new(namespace, options);
    let mut completed_workers = 0;
    let mut cancelled_workers = Vec::new();
    for outcome in result_rx {
        match outcome {
            WorkerOutcome::Completed { worker, counts: partial } => {
                debug!(worker, trees = partial.trees_read, "merging worker results");
                counts.merge(&partial)?;
                completed_workers += 1;
            }
            WorkerOutcome::Cancelled { worker } => {
                warn!(worker, "worker was cancelled: its partial counts are discarded");
                cancelled_workers.push(worker);
            }
            WorkerOutcome::Failed { worker, error } => {
                warn!(worker, %error, "worker failed");
                return Err(error);
            }
        }
    }
    cancelled_workers.sort_unstable();
    Ok(ParallelCount {
        counts,
        completed_workers,
        cancelled_workers,
    })
}

fn run_worker(
    worker: usize,
    reader: &dyn TreeSource,
    tasks: &Mutex<mpsc::Receiver<PathBuf>>,
    namespace: &Arc<TaxonNamespace>,
    options: &CountingOptions,
    cancel: &CancellationToken,
) -> WorkerOutcome {
    let mut counts = CountResult::new(namespace, options);
    loop {
        let next = tasks.lock().unwrap_or_else(PoisonError::into_inner).try_recv();
        let source = match next {
            Ok(source) => source,
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
        };
        debug!(worker, source = %source.display(), "received source");
        match count_source(reader, &source, namespace, options, cancel, &mut counts, Some(worker)) {
            Ok(SourceStatus::Finished) => {}
            Ok(SourceStatus::Cancelled) => return WorkerOutcome::Cancelled { worker },
            Err(error) => return WorkerOutcome::Failed { worker, error },
        }
    }
    if cancel.is_cancelled() {
        return WorkerOutcome::Cancelled { worker };
    }
    debug!(worker, trees = counts.trees_read, "worker finished");
    WorkerOutcome::Completed { worker, counts }
}

enum SourceStatus {
    Finished,
    Cancelled,
}

fn count_source(
    reader: &dyn TreeSource,
    source: &Path,
    namespace: &Arc<TaxonNamespace>,
    options: &CountingOptions,
    cancel: &CancellationToken,
    counts: &mut CountResult,
    worker: Option<usize>,
) -> Result<SourceStatus> {
    let mut counted = 0usize;
    for (idx, tree) in reader.trees(source, namespace)?.enumerate() {
        if cancel.is_cancelled() {
            return Ok(SourceStatus::Cancelled);
        }
        let mut tree = tree?;
        counts.trees_read += 1;
        if options.log_frequency > 0 && (idx + 1) % options.log_frequency == 0 {
            info!(worker, source = %source.display(), tree = idx + 1, "processing tree");
        }
        if idx < options.tree_offset {
            continue;
        }
        counts.distribution.count_splits_on_tree(&mut tree, 1.0)?;
        if options.calc_tree_probs {
            counts.topologies.count(&mut tree)?;
        }
        counted += 1;
    }
    debug!(worker, source = %source.display(), counted, "source done");
    Ok(SourceStatus::Finished)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::bitset::Bitset;
    use crate::tree::{Node, Rooting};

    fn namespace() -> Arc<TaxonNamespace> {
        Arc::new(TaxonNamespace::from_labels(["A", "B", "C", "D", "E"]))
    }

    fn caterpillar(order: [usize; 5], length: f64) -> Tree {
        let mut tree = Tree::new(Rooting::Unrooted);
        tree.add_leaf(0, order[0], Some(length));
        tree.add_leaf(0, order[1], Some(length));
        let inner = tree.add_child(0, Node::default());
        tree.node_mut(inner).edge.length = Some(length);
        tree.add_leaf(inner, order[2], Some(length));
        let innermost = tree.add_child(inner, Node::default());
        tree.node_mut(innermost).edge.length = Some(length);
        tree.add_leaf(innermost, order[3], Some(length));
        tree.add_leaf(innermost, order[4], Some(length));
        tree
    }

    /// Serves pre-built trees keyed by path. Paths not present fail.
    #[derive(Default)]
    struct MemorySource {
        trees: HashMap<PathBuf, Vec<Tree>>,
        /// Cancel this token after handing out the first tree of any source.
        cancel_after_first: Option<CancellationToken>,
    }

    impl TreeSource for MemorySource {
        fn trees<'a>(
            &'a self,
            source: &Path,
            _namespace: &Arc<TaxonNamespace>,
        ) -> Result<Box<dyn Iterator<Item = Result<Tree>> + 'a>> {
            let trees = self
                .trees
                .get(source)
                .ok_or_else(|| SumTreesError::NoTrees(source.to_path_buf()))?;
            let cancel = self.cancel_after_first.clone();
            Ok(Box::new(trees.iter().cloned().enumerate().map(move |(idx, t)| {
                if idx == 0 {
                    if let Some(token) = &cancel {
                        token.cancel();
                    }
                }
                Ok(t)
            })))
        }
    }

    fn sources() -> (MemorySource, Vec<PathBuf>) {
        let mut source = MemorySource::default();
        let orders = [[0, 1, 2, 3, 4], [0, 2, 1, 3, 4], [1, 0, 2, 3, 4], [0, 3, 1, 2, 4]];
        let mut paths = Vec::new();
        for (i, chunk) in orders.chunks(2).enumerate() {
            let path = PathBuf::from(format!("run{i}.nex"));
            let trees = chunk
                .iter()
                .enumerate()
                .map(|(j, o)| caterpillar(*o, (i * 2 + j + 1) as f64))
                .collect();
            source.trees.insert(path.clone(), trees);
            paths.push(path);
        }
        paths.push(PathBuf::from("run2.nex"));
        source.trees.insert(
            PathBuf::from("run2.nex"),
            vec![caterpillar([0, 1, 2, 3, 4], 9.0), caterpillar([4, 3, 2, 1, 0], 10.0)],
        );
        (source, paths)
    }

    fn options() -> CountingOptions {
        CountingOptions {
            calc_tree_probs: true,
            log_frequency: 0,
            ..CountingOptions::default()
        }
    }

    #[test]
    fn burnin_applies_per_source() {
        let (source, paths) = sources();
        let tns = namespace();
        let opts = CountingOptions {
            tree_offset: 1,
            ..options()
        };
        let counts = process_sources_serial(&source, &paths, &tns, &opts).unwrap();
        assert_eq!(counts.trees_read, 6);
        assert_eq!(counts.distribution.total_trees_counted(), 3);
        assert_eq!(counts.topologies.total(), 3.0);
    }

    #[test]
    fn parallel_matches_serial() {
        let (source, paths) = sources();
        let tns = namespace();
        let serial = process_sources_serial(&source, &paths, &tns, &options()).unwrap();
        for workers in [1, 2, 4] {
            let parallel =
                process_sources_parallel(&source, &paths, &tns, &options(), workers, &CancellationToken::new())
                    .unwrap();
            assert!(parallel.cancelled_workers.is_empty());
            assert_eq!(parallel.completed_workers, workers);
            let merged = &parallel.counts;
            assert_eq!(merged.trees_read, serial.trees_read);
            assert_eq!(
                merged.distribution.total_trees_counted(),
                serial.distribution.total_trees_counted()
            );
            assert_eq!(merged.distribution.len(), serial.distribution.len());
            for (split, stats) in serial.distribution.splits() {
                let other = merged.distribution.split_stats(split).unwrap();
                assert_eq!(other.count, stats.count);
                let mut a = other.edge_lengths.clone();
                let mut b = stats.edge_lengths.clone();
                a.sort_by(f64::total_cmp);
                b.sort_by(f64::total_cmp);
                assert_eq!(a, b);
            }
            let mut a: Vec<_> = merged.topologies.topology_hash_map().iter().collect();
            let mut b: Vec<_> = serial.topologies.topology_hash_map().iter().collect();
            a.sort_by(|x, y| x.0.cmp(y.0));
            b.sort_by(|x, y| x.0.cmp(y.0));
            assert_eq!(a, b);
        }
        let first = Bitset::from_u64(0b00111);
        assert_eq!(serial.distribution.split_stats(&first).unwrap().count, 5.0);
    }

    #[test]
    fn cancelled_workers_contribute_nothing() {
        let (mut source, paths) = sources();
        let tns = namespace();
        let token = CancellationToken::new();
        source.cancel_after_first = Some(token.clone());
        let result = process_sources_parallel(&source, &paths, &tns, &options(), 2, &token).unwrap();
        assert_eq!(result.completed_workers + result.cancelled_workers.len(), 2);
        assert!(!result.cancelled_workers.is_empty());
        // the cancelling tree itself is never counted
        assert_eq!(result.counts.distribution.total_trees_counted(), 0);
    }

    #[test]
    fn pre_cancelled_run_is_empty() {
        let (source, paths) = sources();
        let tns = namespace();
        let token = CancellationToken::new();
        token.cancel();
        let result = process_sources_parallel(&source, &paths, &tns, &options(), 3, &token).unwrap();
        assert_eq!(result.cancelled_workers, vec![0, 1, 2]);
        assert!(result.counts.distribution.is_empty());
    }

    #[test]
    fn worker_failure_aborts_the_run() {
        let (source, mut paths) = sources();
        paths.push(PathBuf::from("missing.nex"));
        let tns = namespace();
        let err = process_sources_parallel(&source, &paths, &tns, &options(), 2, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, SumTreesError::NoTrees(_)));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let (source, paths) = sources();
        let err = process_sources_parallel(&source, &paths, &namespace(), &options(), 0, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, SumTreesError::InvalidConfig(_)));
    }
}
