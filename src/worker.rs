//! One partition of a sweep, from resume to completion.
//!
//! A worker loops through `Resuming -> Scanning -> (Completed | Retrying -> Resuming)`:
//!
//! - **Resuming** reads the partition's checkpoint and opens a scan that skips
//!   everything up to the last absolute index it handled.
//! - **Scanning** numbers every document the scan yields, but only documents
//!   whose index falls in this partition's stripe are transformed, offered to
//!   the sink, and checkpointed.
//! - **Retrying** happens on scan failure. An invalidated cursor is reopened
//!   immediately; any other fault waits out the retry delay first. There is no
//!   retry ceiling, so the counters in [`PartitionReport`] and the metrics are
//!   the only signal of a query that keeps failing.
//!
//! Transform failures never leave the scanning state: the document is logged,
//! counted as processed, and checkpointed like any other.

use crate::checkpoint::{Checkpoint, PartitionLog};
use crate::collection::{Collection, Document, QuerySpec, ScanError, ScanOptions};
use crate::metrics::{
    CURSOR_INVALIDATIONS, DOCUMENTS_PROCESSED, DOCUMENTS_SCANNED, MetricsCollector,
    RECORDS_EMITTED, SCAN_FAULTS, TRANSFORM_ERRORS,
};
use crate::planner::{belongs_to, expected_count};
use crate::sink::{OutputSink, SinkError};
use crate::transform::{Transform, TransformContext};
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// State shared by every partition of one run.
pub struct SweepContext<'a> {
    pub query: &'a QuerySpec,
    pub workers: usize,
    pub collection: &'a dyn Collection,
    pub sink: &'a OutputSink,
    pub metrics: &'a MetricsCollector,
    pub retry_delay: Duration,
}

/// Outcome of a completed partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionReport {
    pub partition: usize,
    /// Share of the startup count assigned to this partition.
    pub expected: u64,
    /// Owned documents handled, across all runs.
    pub processed: u64,
    /// Absolute index of the last document handled.
    pub last_index: u64,
    /// The remaining counters cover this run only.
    pub records_emitted: u64,
    pub transform_errors: u64,
    pub cursor_invalidations: u64,
    pub scan_faults: u64,
    pub completed_at: DateTime<Utc>,
}

impl PartitionReport {
    /// Scans reopened for any reason.
    #[must_use]
    pub fn retries(&self) -> u64 {
        self.cursor_invalidations + self.scan_faults
    }
}

enum PassError {
    Scan(ScanError),
    /// Checkpoint or artifact I/O; not retried.
    Local(anyhow::Error),
}

#[derive(Default)]
struct PassCounters {
    scanned: u64,
    processed: u64,
    emitted: u64,
    transform_errors: u64,
}

pub struct PartitionWorker {
    partition: usize,
    expected: u64,
    log: PartitionLog,
    records_emitted: u64,
    transform_errors: u64,
    cursor_invalidations: u64,
    scan_faults: u64,
}

impl PartitionWorker {
    /// Worker for the partition owning `log`.
    #[must_use]
    pub fn new(log: PartitionLog, ctx: &SweepContext<'_>) -> Self {
        let partition = log.partition();
        Self {
            partition,
            expected: expected_count(partition, ctx.query.total, ctx.workers),
            log,
            records_emitted: 0,
            transform_errors: 0,
            cursor_invalidations: 0,
            scan_faults: 0,
        }
    }

    /// Drive the partition until its scan is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error only for local I/O failures: the checkpoint log or the
    /// artifact could not be written. Scan and transform failures are retried
    /// or skipped, never returned.
    pub fn run<R, T>(mut self, ctx: &SweepContext<'_>, transform: &T) -> Result<PartitionReport>
    where
        R: Serialize,
        T: Transform<R> + ?Sized,
    {
        let partition = self.partition;
        if self.log.record_start(ctx.workers)? {
            info!(partition, expected = self.expected, "partition started");
        }

        loop {
            let checkpoint = self.log.load()?;
            debug!(
                partition,
                last_index = checkpoint.last_index,
                processed = checkpoint.processed,
                expected = self.expected,
                "resuming scan"
            );
            match self.scan_pass::<R, T>(ctx, transform, checkpoint) {
                Ok(()) => break,
                Err(PassError::Scan(ScanError::CursorInvalidated(reason))) => {
                    self.cursor_invalidations += 1;
                    ctx.metrics
                        .increment_partition(partition, CURSOR_INVALIDATIONS, 1);
                    warn!(partition, error = %reason, "cursor invalidated; reopening scan");
                }
                Err(PassError::Scan(ScanError::Fault(err))) => {
                    self.scan_faults += 1;
                    ctx.metrics.increment_partition(partition, SCAN_FAULTS, 1);
                    error!(
                        partition,
                        error = %format!("{err:#}"),
                        attempt = self.scan_faults,
                        retry_in_ms = ctx.retry_delay.as_millis() as u64,
                        "scan failed; retrying"
                    );
                    sleep(ctx.retry_delay);
                }
                Err(PassError::Local(err)) => {
                    error!(partition, error = %format!("{err:#}"), "partition aborted");
                    return Err(err.context(format!("partition {partition} aborted")));
                }
            }
        }

        let Checkpoint {
            last_index,
            processed,
        } = self.log.load()?;
        let completed_at = Utc::now();
        info!(
            partition,
            processed,
            expected = self.expected,
            completed_at = %completed_at.format("%Y-%m-%d %H:%M:%S"),
            "partition completed"
        );
        Ok(PartitionReport {
            partition,
            expected: self.expected,
            processed,
            last_index,
            records_emitted: self.records_emitted,
            transform_errors: self.transform_errors,
            cursor_invalidations: self.cursor_invalidations,
            scan_faults: self.scan_faults,
            completed_at,
        })
    }

    /// One scan from `checkpoint` to exhaustion or failure. The cursor is
    /// closed either way.
    fn scan_pass<R, T>(
        &mut self,
        ctx: &SweepContext<'_>,
        transform: &T,
        checkpoint: Checkpoint,
    ) -> Result<(), PassError>
    where
        R: Serialize,
        T: Transform<R> + ?Sized,
    {
        let mut cursor = ctx
            .collection
            .scan(
                &ctx.query.filter,
                ScanOptions::resume_at(checkpoint.last_index),
            )
            .map_err(PassError::Scan)?;

        let mut counters = PassCounters::default();
        let mut index = checkpoint.last_index;
        let mut processed = checkpoint.processed;
        let outcome = loop {
            let document = match cursor.next_document() {
                Ok(Some(document)) => document,
                Ok(None) => break Ok(()),
                Err(e) => break Err(PassError::Scan(e)),
            };
            index += 1;
            counters.scanned += 1;
            if !belongs_to(self.partition, index, ctx.workers) {
                continue;
            }

            if let Err(e) = self.handle::<R, T>(ctx, transform, index, &document, &mut counters) {
                break Err(PassError::Local(e));
            }
            processed += 1;
            counters.processed += 1;
            if let Err(e) = self.log.advance(processed, self.expected, index) {
                break Err(PassError::Local(e));
            }
        };

        if let Err(e) = cursor.close() {
            debug!(partition = self.partition, error = %e, "closing scan failed");
        }
        self.flush(ctx.metrics, &counters);
        outcome
    }

    /// Transform one owned document and offer its record. Only artifact I/O
    /// failures are returned.
    fn handle<R, T>(
        &self,
        ctx: &SweepContext<'_>,
        transform: &T,
        index: u64,
        document: &Document,
        counters: &mut PassCounters,
    ) -> Result<()>
    where
        R: Serialize,
        T: Transform<R> + ?Sized,
    {
        let tctx = TransformContext {
            partition: self.partition,
            workers: ctx.workers,
            absolute_index: index,
        };
        let record = match catch_unwind(AssertUnwindSafe(|| transform.apply(&tctx, document))) {
            Ok(Ok(record)) => record,
            Ok(Err(err)) => {
                self.transform_failed(index, &err, counters);
                None
            }
            Err(payload) => {
                let err = anyhow!("transform panicked: {}", panic_message(payload.as_ref()));
                self.transform_failed(index, &err, counters);
                None
            }
        };

        let Some(record) = record else {
            return Ok(());
        };
        match ctx.sink.offer(&record) {
            Ok(()) => {
                counters.emitted += 1;
                Ok(())
            }
            Err(SinkError::Serialize(e)) => {
                self.transform_failed(index, &anyhow::Error::new(e), counters);
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("write record for document {index}")),
        }
    }

    fn transform_failed(&self, index: u64, err: &anyhow::Error, counters: &mut PassCounters) {
        counters.transform_errors += 1;
        error!(
            partition = self.partition,
            index,
            error = %format!("{err:#}"),
            "transform failed"
        );
    }

    fn flush(&mut self, metrics: &MetricsCollector, counters: &PassCounters) {
        self.records_emitted += counters.emitted;
        self.transform_errors += counters.transform_errors;
        let partition = self.partition;
        metrics.increment_partition(partition, DOCUMENTS_SCANNED, counters.scanned);
        metrics.increment_partition(partition, DOCUMENTS_PROCESSED, counters.processed);
        metrics.increment_partition(partition, RECORDS_EMITTED, counters.emitted);
        metrics.increment_partition(partition, TRANSFORM_ERRORS, counters.transform_errors);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
