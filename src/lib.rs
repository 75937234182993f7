//! # Ironsweep
//!
//! A **resumable, partitioned, single-pass transform** over every document of a
//! large collection, producing one JSON array artifact. Sweeps are meant to run
//! for hours against a live store, survive being killed, and pick up exactly
//! where they stopped.
//!
//! ## Key Features
//!
//! - **Static striped partitioning** - `N` workers, each owning every `N`-th document of the scan
//! - **Per-partition checkpoints** - append-only progress logs, no coordinator
//! - **Transient-failure recovery** - invalidated cursors reopen immediately, faults back off and retry
//! - **One shared artifact** - a mutex-guarded JSON array with an explicit finalize step
//! - **Pluggable stores** - implement [`Collection`] for your database; JSONL and in-memory ship built in
//!
//! ## Quick Start
//!
//! ```no_run
//! use ironsweep::collection::jsonl::JsonlCollection;
//! use ironsweep::{Document, Runner, ScanConfig, TransformContext};
//! use serde_json::{Value, json};
//! # use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! let collection = JsonlCollection::open("stations.jsonl")?;
//! let config = ScanConfig {
//!     filter: json!({ "active": true }),
//!     workers: 8,
//!     restart: std::env::args().any(|a| a == "--restart"),
//!     ..Default::default()
//! };
//!
//! let summarize = |_: &TransformContext, doc: &Document| -> Result<Option<Value>> {
//!     Ok(doc.get("id").map(|id| json!({ "id": id, "readings": doc["readings"].as_array().map_or(0, Vec::len) })))
//! };
//!
//! let report = Runner::new(config).run(&collection, &summarize)?;
//! println!("{} of {} documents processed", report.processed(), report.total);
//! # Ok(())
//! # }
//! ```
//!
//! ## How a sweep runs
//!
//! 1. The [`Runner`] counts the matching documents once. This count only sizes
//!    progress reporting (see [`planner::expected_count`]).
//! 2. It spawns one thread per partition `1..=N`. Each [`worker::PartitionWorker`]
//!    reads its checkpoint and opens a scan that skips to the last absolute index it handled.
//! 3. Every partition walks the **whole** result set. It transforms only the
//!    documents at indices `i` where `(i - 1) % N + 1` is its own id, and
//!    checkpoints after each one.
//! 4. After all partitions finish, the artifact gets its closing `]`.
//!
//! Step 3 makes each partition's resume point independent of every other
//! partition. The cost is `O(N * total)` scan work across the pool.
//! Transform work stays `O(total)`. For very large `N`, scanning dominates.
//!
//! ## Restarting
//!
//! With `restart: true` the runner resumes from the existing checkpoints and
//! keeps appending to the open artifact. With `restart: false` it refuses to
//! start over leftover checkpoints or a non-empty artifact. Call
//! [`Runner::reset`] to discard them first. Resuming against an already
//! finalized artifact is refused as well, since it would corrupt the array.
//! So is a restart with a different worker count, which would reassign stripes.
//!
//! A crash between appending a record and checkpointing it re-emits that one
//! record on resume. Transforms with external side effects should be idempotent.
//!
//! ## Module Overview
//!
//! - [`planner`] - partition sizing and membership
//! - [`checkpoint`] - per-partition progress logs
//! - [`sink`] - the shared output artifact
//! - [`collection`] - the store interface, plus JSONL and in-memory stores
//! - [`worker`] - one partition's resume/scan/retry loop
//! - [`runner`] - the pool supervisor
//! - [`metrics`] - run counters
//! - [`config`] - run configuration
//! - [`logging`] - error log setup

pub mod checkpoint;
pub mod collection;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod planner;
pub mod runner;
pub mod sink;
pub mod transform;
pub mod worker;

pub use checkpoint::{Checkpoint, CheckpointStore, PartitionLog};
pub use collection::{Collection, Cursor, Document, Filter, QuerySpec, ScanError, ScanOptions};
pub use config::ScanConfig;
pub use metrics::MetricsCollector;
pub use runner::{RunError, RunReport, Runner};
pub use sink::{ArtifactState, OpenMode, OutputSink, SinkError};
pub use transform::{Transform, TransformContext};
pub use worker::{PartitionReport, PartitionWorker, SweepContext};
