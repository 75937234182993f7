//! Whole-run behavior of the pool supervisor.

use anyhow::Result;
use ironsweep::collection::memory::{FaultKind, MemoryCollection};
use ironsweep::metrics::{CURSOR_INVALIDATIONS, DOCUMENTS_PROCESSED, SCAN_FAULTS};
use ironsweep::{
    ArtifactState, CheckpointStore, Document, RunError, Runner, ScanConfig, SinkError,
    TransformContext,
};
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

mod common;

fn numbered(total: u64) -> Vec<Value> {
    (1..=total).map(|id| json!({ "id": id })).collect()
}

fn echo(ctx: &TransformContext, doc: &Document) -> Result<Option<Value>> {
    Ok(Some(json!({ "id": doc["id"], "partition": ctx.partition })))
}

fn config(dir: &Path, workers: usize) -> ScanConfig {
    ScanConfig {
        collection: "docs".into(),
        workers,
        retry_delay_ms: 1,
        ..Default::default()
    }
    .rooted_at(dir)
}

fn artifact_ids(path: &Path) -> Result<Vec<u64>> {
    let records: Vec<Value> = serde_json::from_str(&fs::read_to_string(path)?)?;
    let mut ids: Vec<u64> = records.iter().filter_map(|r| r["id"].as_u64()).collect();
    ids.sort_unstable();
    Ok(ids)
}

#[test]
fn ten_documents_three_workers() -> Result<()> {
    let tmp = TempDir::new()?;
    let config = config(tmp.path(), 3);
    let collection = MemoryCollection::new("docs", numbered(10));

    let runner = Runner::new(config.clone());
    let report = runner.run(&collection, &echo)?;

    assert_eq!(report.collection, "docs");
    assert_eq!(report.total, 10);
    assert_eq!(report.records_written, 10);
    assert_eq!(report.processed(), 10);
    let expected: Vec<u64> = report.partitions.iter().map(|p| p.expected).collect();
    assert_eq!(expected, vec![4, 3, 3]);
    let ids: Vec<usize> = report.partitions.iter().map(|p| p.partition).collect();
    assert_eq!(ids, vec![1, 2, 3]);

    assert_eq!(artifact_ids(&config.output_path)?, (1..=10).collect::<Vec<_>>());
    assert_eq!(
        ArtifactState::inspect(&config.output_path)?,
        ArtifactState::Finalized
    );

    let store = CheckpointStore::new(&config.checkpoint_dir);
    assert_eq!(store.load(1)?.last_index, 10);
    assert_eq!(store.load(2)?.last_index, 8);
    assert_eq!(store.load(3)?.last_index, 9);
    assert_eq!(runner.metrics().counter(DOCUMENTS_PROCESSED), 10);
    assert!(runner.metrics().elapsed().is_some());
    Ok(())
}

#[test]
fn records_land_with_their_owning_partition() -> Result<()> {
    let tmp = TempDir::new()?;
    let config = config(tmp.path(), 4);
    let collection = MemoryCollection::new("docs", numbered(21));
    Runner::new(config.clone()).run(&collection, &echo)?;

    let records: Vec<Value> = serde_json::from_str(&fs::read_to_string(&config.output_path)?)?;
    assert_eq!(records.len(), 21);
    for record in records {
        let id = record["id"].as_u64().unwrap_or_default();
        let partition = record["partition"].as_u64().unwrap_or_default();
        assert_eq!((id - 1) % 4 + 1, partition, "record {record}");
    }
    Ok(())
}

#[test]
fn filter_applies_to_count_and_scan() -> Result<()> {
    let tmp = TempDir::new()?;
    let config = ScanConfig {
        filter: json!({ "kind": "keep" }),
        ..config(tmp.path(), 2)
    };
    let docs = (1..=8)
        .map(|id| json!({ "id": id, "kind": if id % 2 == 0 { "keep" } else { "drop" } }))
        .collect();
    let collection = MemoryCollection::new("docs", docs);

    let report = Runner::new(config.clone()).run(&collection, &echo)?;
    assert_eq!(report.total, 4);
    assert_eq!(artifact_ids(&config.output_path)?, vec![2, 4, 6, 8]);
    Ok(())
}

#[test]
fn empty_collection_finalizes_an_empty_array() -> Result<()> {
    let tmp = TempDir::new()?;
    let config = config(tmp.path(), 3);
    let collection = MemoryCollection::new("docs", Vec::new());

    let report = Runner::new(config.clone()).run(&collection, &echo)?;
    assert_eq!(report.total, 0);
    assert!(report.partitions.iter().all(|p| p.processed == 0));
    assert!(artifact_ids(&config.output_path)?.is_empty());
    Ok(())
}

#[test]
fn more_workers_than_documents() -> Result<()> {
    let tmp = TempDir::new()?;
    let config = config(tmp.path(), 5);
    let collection = MemoryCollection::new("docs", numbered(2));

    let report = Runner::new(config.clone()).run(&collection, &echo)?;
    let processed: Vec<u64> = report.partitions.iter().map(|p| p.processed).collect();
    assert_eq!(processed, vec![1, 1, 0, 0, 0]);
    assert_eq!(artifact_ids(&config.output_path)?, vec![1, 2]);
    Ok(())
}

#[test]
fn scan_failures_during_a_run_lose_nothing() -> Result<()> {
    let tmp = TempDir::new()?;
    let config = config(tmp.path(), 3);
    let collection = MemoryCollection::new("docs", numbered(12));
    collection.fail_before(5, FaultKind::Fault);
    collection.fail_before(7, FaultKind::CursorInvalidated);
    collection.fail_next_open(FaultKind::CursorInvalidated);

    let runner = Runner::new(config.clone());
    let report = runner.run(&collection, &echo)?;

    assert_eq!(report.retries(), 3);
    assert_eq!(runner.metrics().counter(SCAN_FAULTS), 1);
    assert_eq!(runner.metrics().counter(CURSOR_INVALIDATIONS), 2);
    assert_eq!(collection.pending_faults(), 0);
    assert_eq!(artifact_ids(&config.output_path)?, (1..=12).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn failed_partition_leaves_the_artifact_open_for_restart() -> Result<()> {
    let tmp = TempDir::new()?;
    // Both runs resume; the second picks up what the first left behind.
    let config = ScanConfig {
        restart: true,
        ..config(tmp.path(), 3)
    };
    let collection = MemoryCollection::new("docs", numbered(10));

    // A directory in place of partition 2's log makes it unreadable.
    let store = CheckpointStore::new(&config.checkpoint_dir);
    fs::create_dir_all(store.log_path(2))?;

    let err = Runner::new(config.clone())
        .run(&collection, &echo)
        .err()
        .expect("partition 2 must fail");
    match err.downcast_ref::<RunError>() {
        Some(RunError::PartitionsFailed { partitions, .. }) => assert_eq!(partitions, &vec![2]),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(ArtifactState::inspect(&config.output_path)?, ArtifactState::Open);
    let partial = fs::read_to_string(&config.output_path)?;
    assert!(serde_json::from_str::<Vec<Value>>(&partial).is_err());

    fs::remove_dir(store.log_path(2))?;
    let report = Runner::new(config.clone()).run(&collection, &echo)?;

    // Partitions 1 and 3 already finished; only partition 2 does new work.
    assert_eq!(report.records_written, 3);
    assert_eq!(report.processed(), 10);
    assert_eq!(artifact_ids(&config.output_path)?, (1..=10).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn restart_resumes_from_checkpoints_without_duplicates() -> Result<()> {
    let tmp = TempDir::new()?;
    let config = config(tmp.path(), 3);
    let collection = MemoryCollection::new("docs", numbered(10));

    // State left behind by a run killed after partition 1 handled 1 and 4.
    {
        let sink = ironsweep::OutputSink::open(&config.output_path, ironsweep::OpenMode::Fresh)?;
        sink.offer(&json!({ "id": 1, "partition": 1 }))?;
        sink.offer(&json!({ "id": 4, "partition": 1 }))?;
        let mut log = CheckpointStore::new(&config.checkpoint_dir).partition(1);
        log.record_start(3)?;
        log.advance(1, 4, 1)?;
        log.advance(2, 4, 4)?;
    }

    let restarted = ScanConfig {
        restart: true,
        ..config.clone()
    };
    let report = Runner::new(restarted).run(&collection, &echo)?;
    assert_eq!(report.records_written, 8);
    assert_eq!(report.partitions[0].processed, 4);
    assert_eq!(report.partitions[0].records_emitted, 2);

    let skips: Vec<u64> = collection.scans_opened().iter().map(|o| o.skip).collect();
    assert!(skips.contains(&4), "partition 1 resumes after index 4: {skips:?}");
    assert_eq!(artifact_ids(&config.output_path)?, (1..=10).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn fresh_run_refuses_leftover_checkpoints() -> Result<()> {
    let tmp = TempDir::new()?;
    let config = config(tmp.path(), 2);
    let collection = MemoryCollection::new("docs", numbered(4));
    Runner::new(config.clone()).run(&collection, &echo)?;
    let before = fs::read_to_string(&config.output_path)?;

    let err = Runner::new(config.clone())
        .run(&collection, &echo)
        .err()
        .expect("stale checkpoints");
    assert!(matches!(
        err.downcast_ref::<RunError>(),
        Some(RunError::StaleCheckpoints(_))
    ));
    assert_eq!(fs::read_to_string(&config.output_path)?, before);
    Ok(())
}

#[test]
fn fresh_run_refuses_a_leftover_artifact() -> Result<()> {
    let tmp = TempDir::new()?;
    let config = config(tmp.path(), 2);
    fs::write(&config.output_path, "[\n\t{\"id\":1}")?;

    let err = Runner::new(config)
        .run(&MemoryCollection::new("docs", numbered(4)), &echo)
        .err()
        .expect("leftover artifact");
    assert!(matches!(
        err.downcast_ref::<SinkError>(),
        Some(SinkError::ArtifactExists(_))
    ));
    Ok(())
}

#[test]
fn restart_refuses_a_finalized_artifact() -> Result<()> {
    let tmp = TempDir::new()?;
    let config = config(tmp.path(), 2);
    let collection = MemoryCollection::new("docs", numbered(4));
    Runner::new(config.clone()).run(&collection, &echo)?;

    let err = Runner::new(ScanConfig {
        restart: true,
        ..config.clone()
    })
    .run(&collection, &echo)
    .err()
    .expect("finalized artifact");
    assert!(matches!(
        err.downcast_ref::<SinkError>(),
        Some(SinkError::AlreadyFinalized(_))
    ));
    assert_eq!(artifact_ids(&config.output_path)?, vec![1, 2, 3, 4]);
    Ok(())
}

#[test]
fn restart_with_fewer_workers_is_refused() -> Result<()> {
    let tmp = TempDir::new()?;
    let config = config(tmp.path(), 4);
    let collection = MemoryCollection::new("docs", numbered(8));
    let store = CheckpointStore::new(&config.checkpoint_dir);
    store.partition(4).advance(1, 2, 4)?;

    let err = Runner::new(ScanConfig {
        restart: true,
        workers: 3,
        ..config
    })
    .run(&collection, &echo)
    .err()
    .expect("worker count mismatch");
    assert!(matches!(
        err.downcast_ref::<RunError>(),
        Some(RunError::WorkerCountMismatch {
            found: 4,
            workers: 3
        })
    ));
    Ok(())
}

#[test]
fn restart_with_more_workers_is_refused() -> Result<()> {
    let tmp = TempDir::new()?;
    let config = ScanConfig {
        restart: true,
        ..config(tmp.path(), 2)
    };
    let collection = MemoryCollection::new("docs", numbered(10));

    // Partition 2 of a two-way run was sabotaged, so the run stops unfinalized.
    let store = CheckpointStore::new(&config.checkpoint_dir);
    fs::create_dir_all(store.log_path(2))?;
    assert!(Runner::new(config.clone()).run(&collection, &echo).is_err());
    fs::remove_dir(store.log_path(2))?;
    let before = fs::read_to_string(&config.output_path)?;

    let err = Runner::new(ScanConfig {
        workers: 3,
        ..config.clone()
    })
    .run(&collection, &echo)
    .err()
    .expect("worker count mismatch");
    assert!(matches!(
        err.downcast_ref::<RunError>(),
        Some(RunError::WorkerCountMismatch {
            found: 2,
            workers: 3
        })
    ));
    assert_eq!(fs::read_to_string(&config.output_path)?, before);

    // The original split still resumes cleanly.
    Runner::new(config.clone()).run(&collection, &echo)?;
    assert_eq!(artifact_ids(&config.output_path)?, (1..=10).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn configured_name_is_used_in_logs_and_report() -> Result<()> {
    let tmp = TempDir::new()?;
    let config = ScanConfig {
        collection: "nightly-readings".into(),
        ..config(tmp.path(), 2)
    };
    let collection = MemoryCollection::new("docs", numbered(4));

    let (report, logs) = common::capture_logs(|| Runner::new(config).run(&collection, &echo));
    let report = report?;
    assert_eq!(report.collection, "nightly-readings");
    let start = logs
        .lines()
        .find(|line| line.contains("starting sweep"))
        .expect("start event");
    assert!(start.contains("nightly-readings"), "{start}");
    Ok(())
}

#[test]
fn reset_allows_a_fresh_run() -> Result<()> {
    let tmp = TempDir::new()?;
    let config = config(tmp.path(), 2);
    let collection = MemoryCollection::new("docs", numbered(4));
    Runner::new(config.clone()).run(&collection, &echo)?;

    Runner::reset(&config)?;
    assert!(!config.output_path.exists());
    assert!(!CheckpointStore::new(&config.checkpoint_dir).has_state()?);
    // Resetting twice is harmless.
    Runner::reset(&config)?;

    collection.push(json!({ "id": 5 }));
    let report = Runner::new(config.clone()).run(&collection, &echo)?;
    assert_eq!(report.total, 5);
    assert_eq!(artifact_ids(&config.output_path)?, vec![1, 2, 3, 4, 5]);
    Ok(())
}

#[test]
fn invalid_config_touches_nothing() -> Result<()> {
    let tmp = TempDir::new()?;
    let config = config(tmp.path(), 0);
    assert!(
        Runner::new(config.clone())
            .run(&MemoryCollection::new("docs", numbered(3)), &echo)
            .is_err()
    );
    assert!(!config.output_path.exists());
    assert!(!config.checkpoint_dir.exists());
    Ok(())
}
