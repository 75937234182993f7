//! The pool supervisor: one thread per partition, then finalize.

use crate::checkpoint::CheckpointStore;
use crate::collection::{Collection, QuerySpec};
use crate::config::ScanConfig;
use crate::metrics::MetricsCollector;
use crate::sink::{OpenMode, OutputSink};
use crate::transform::Transform;
use crate::worker::{PartitionReport, PartitionWorker, SweepContext};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::remove_file;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(
        "checkpoint directory {0} holds progress from an earlier run; set restart or reset it first"
    )]
    StaleCheckpoints(PathBuf),
    /// Stripes depend on the worker count, so checkpoints only resume under the count that wrote them.
    #[error("checkpoints were written for {found} workers, but the run has {workers}")]
    WorkerCountMismatch { found: usize, workers: usize },
    #[error("partitions {partitions:?} failed; artifact left open for restart: {first:#}")]
    PartitionsFailed {
        partitions: Vec<usize>,
        first: anyhow::Error,
    },
}

/// Outcome of a finished sweep.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub collection: String,
    /// Matching documents counted at startup.
    pub total: u64,
    pub output_path: PathBuf,
    /// Records appended during this run (earlier runs not included).
    pub records_written: u64,
    /// One entry per partition, ordered by partition id.
    pub partitions: Vec<PartitionReport>,
}

impl RunReport {
    /// Owned documents handled across all partitions and runs.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.partitions.iter().map(|p| p.processed).sum()
    }

    #[must_use]
    pub fn transform_errors(&self) -> u64 {
        self.partitions.iter().map(|p| p.transform_errors).sum()
    }

    #[must_use]
    pub fn retries(&self) -> u64 {
        self.partitions.iter().map(PartitionReport::retries).sum()
    }
}

/// Runs a sweep described by a [`ScanConfig`].
///
/// ```no_run
/// use ironsweep::collection::jsonl::JsonlCollection;
/// use ironsweep::{Document, Runner, ScanConfig, TransformContext};
/// use serde_json::{Value, json};
///
/// # fn main() -> anyhow::Result<()> {
/// let collection = JsonlCollection::open("readings.jsonl")?;
/// let runner = Runner::new(ScanConfig { workers: 4, ..Default::default() });
/// let transform = |ctx: &TransformContext, doc: &Document| -> anyhow::Result<Option<Value>> {
///     Ok(Some(json!({ "partition": ctx.partition, "id": doc["id"] })))
/// };
/// let report = runner.run(&collection, &transform)?;
/// println!("{} records", report.records_written);
/// # Ok(())
/// # }
/// ```
pub struct Runner {
    pub config: ScanConfig,
    metrics: MetricsCollector,
}

impl Runner {
    #[must_use]
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            metrics: MetricsCollector::new(),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Sweep `collection`, writing every record `transform` emits into the artifact.
    ///
    /// Blocks until all partitions finish, then finalizes the artifact.
    ///
    /// # Errors
    ///
    /// Startup failures are returned before any partition starts:
    /// - invalid config;
    /// - a fresh run over leftover checkpoints or a non-empty artifact;
    /// - a restart against a finalized artifact or with a different worker count than before;
    /// - a failed count.
    ///
    /// After startup, only local I/O failures inside a partition surface, as
    /// [`RunError::PartitionsFailed`]. The artifact is then left unfinalized so
    /// the run can be restarted.
    pub fn run<R, T>(&self, collection: &dyn Collection, transform: &T) -> Result<RunReport>
    where
        R: Serialize,
        T: Transform<R> + ?Sized,
    {
        let config = &self.config;
        config.validate()?;
        let workers = config.workers;

        let store = CheckpointStore::new(&config.checkpoint_dir);
        let mode = if config.restart {
            check_worker_count(&store, workers)?;
            OpenMode::Resume
        } else {
            if store.has_state()? {
                return Err(RunError::StaleCheckpoints(config.checkpoint_dir.clone()).into());
            }
            OpenMode::Fresh
        };
        let sink = OutputSink::open(&config.output_path, mode)?;
        let query = QuerySpec::snapshot(collection, config.filter.clone())
            .with_context(|| format!("count documents in {}", collection.name()))?;

        let name = if config.collection.is_empty() {
            collection.name()
        } else {
            config.collection.as_str()
        };
        info!(
            collection = name,
            total = query.total,
            workers,
            restart = config.restart,
            "starting sweep"
        );
        self.metrics.record_start();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("sweep-partition-{}", i + 1))
            .build()
            .context("build partition thread pool")?;
        let ctx = SweepContext {
            query: &query,
            workers,
            collection,
            sink: &sink,
            metrics: &self.metrics,
            retry_delay: config.retry_delay(),
        };
        let outcomes = Mutex::new(Vec::with_capacity(workers));
        pool.scope(|s| {
            for partition in 1..=workers {
                let (ctx, outcomes) = (&ctx, &outcomes);
                let log = store.partition(partition);
                s.spawn(move |_| {
                    let outcome = PartitionWorker::new(log, ctx).run::<R, T>(ctx, transform);
                    outcomes
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((partition, outcome));
                });
            }
        });

        let mut outcomes = outcomes.into_inner().unwrap_or_else(PoisonError::into_inner);
        outcomes.sort_by_key(|(partition, _)| *partition);
        let mut partitions = Vec::with_capacity(workers);
        let mut failed = Vec::new();
        let mut first_error = None;
        for (partition, outcome) in outcomes {
            match outcome {
                Ok(report) => partitions.push(report),
                Err(e) => {
                    failed.push(partition);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(first) = first_error {
            self.metrics.record_end();
            error!(partitions = ?failed, "sweep stopped before finalize");
            return Err(RunError::PartitionsFailed {
                partitions: failed,
                first,
            }
            .into());
        }

        sink.finalize().context("finalize output artifact")?;
        self.metrics.record_end();
        info!(
            records = sink.records_written(),
            output = %sink.path().display(),
            "sweep completed"
        );

        Ok(RunReport {
            collection: name.to_string(),
            total: query.total,
            output_path: config.output_path.clone(),
            records_written: sink.records_written(),
            partitions,
        })
    }

    /// Delete the checkpoint logs and the artifact so the next run starts fresh.
    /// The error log is left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but cannot be removed.
    pub fn reset(config: &ScanConfig) -> Result<()> {
        CheckpointStore::new(&config.checkpoint_dir).clear()?;
        match remove_file(&config.output_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", config.output_path.display())),
        }
    }
}

/// Refuse to resume checkpoints written by a run split a different number of ways.
fn check_worker_count(store: &CheckpointStore, workers: usize) -> Result<()> {
    for partition in store.partitions()? {
        let recorded = store.recorded_workers(partition)?;
        let found = match recorded {
            Some(found) if found != workers => found,
            None if partition > workers => partition,
            _ => continue,
        };
        return Err(RunError::WorkerCountMismatch { found, workers }.into());
    }
    Ok(())
}
