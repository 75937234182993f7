//! Run counters.
//!
//! One [`MetricsCollector`] per run is lent to every partition worker through
//! [`SweepContext`](crate::worker::SweepContext). Each event is counted twice:
//! once under its run-wide name (e.g. `scan_faults`) and once under
//! `partition.<id>.<name>`, so a single misbehaving partition stands out.
//!
//! # Example
//!
//! ```no_run
//! use ironsweep::metrics::{MetricsCollector, SCAN_FAULTS};
//!
//! # fn main() -> anyhow::Result<()> {
//! let metrics = MetricsCollector::new();
//! metrics.record_start();
//! metrics.increment_partition(3, SCAN_FAULTS, 1);
//! metrics.record_end();
//!
//! assert_eq!(metrics.counter(SCAN_FAULTS), 1);
//! assert_eq!(metrics.partition_counter(3, SCAN_FAULTS), 1);
//! metrics.save_to_file("metrics.json")?;
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Every document a scan yielded, owned or not.
pub const DOCUMENTS_SCANNED: &str = "documents_scanned";
/// Owned documents handed to the transform.
pub const DOCUMENTS_PROCESSED: &str = "documents_processed";
/// Records appended to the output artifact.
pub const RECORDS_EMITTED: &str = "records_emitted";
/// Documents whose transform failed, panicked, or produced an unserializable record.
pub const TRANSFORM_ERRORS: &str = "transform_errors";
/// Scans reopened after the server invalidated the cursor.
pub const CURSOR_INVALIDATIONS: &str = "cursor_invalidations";
/// Scans reopened after a generic fault and backoff.
pub const SCAN_FAULTS: &str = "scan_faults";

const DESCRIPTIONS: [(&str, &str); 6] = [
    (DOCUMENTS_SCANNED, "Documents yielded by scans, owned or not"),
    (DOCUMENTS_PROCESSED, "Owned documents handed to the transform"),
    (RECORDS_EMITTED, "Records appended to the output artifact"),
    (TRANSFORM_ERRORS, "Documents whose transform failed"),
    (CURSOR_INVALIDATIONS, "Scans reopened after cursor invalidation"),
    (SCAN_FAULTS, "Scans reopened after a fault and backoff"),
];

/// Thread-safe registry of named counters plus run timing.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsInner>>,
}

#[derive(Default)]
struct MetricsInner {
    counters: BTreeMap<String, u64>,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&self) {
        self.lock().start_time = Some(Instant::now());
    }

    pub fn record_end(&self) {
        self.lock().end_time = Some(Instant::now());
    }

    /// Elapsed run time, once both start and end were recorded.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        let inner = self.lock();
        match (inner.start_time, inner.end_time) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }

    /// Add `value` to the counter `name`, creating it at zero if needed.
    pub fn increment_counter(&self, name: &str, value: u64) {
        *self.lock().counters.entry(name.to_string()).or_insert(0) += value;
    }

    /// Add `value` to both the run-wide and the per-partition counter.
    pub fn increment_partition(&self, partition: usize, name: &str, value: u64) {
        let mut inner = self.lock();
        *inner.counters.entry(name.to_string()).or_insert(0) += value;
        *inner
            .counters
            .entry(partition_key(partition, name))
            .or_insert(0) += value;
    }

    /// Current value of `name`, `0` if never incremented.
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.lock().counters.get(name).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn partition_counter(&self, partition: usize, name: &str) -> u64 {
        self.counter(&partition_key(partition, name))
    }

    /// All counters by name.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.lock().counters.clone()
    }

    /// Counters as a JSON object; built-in counters carry a description.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let inner = self.lock();
        let mut metrics_json = serde_json::Map::new();
        for (name, value) in &inner.counters {
            let mut metric_obj = serde_json::Map::new();
            metric_obj.insert("value".to_string(), json!(value));
            if let Some(desc) = description(name) {
                metric_obj.insert("description".to_string(), json!(desc));
            }
            metrics_json.insert(name.clone(), Value::Object(metric_obj));
        }
        if let (Some(start), Some(end)) = (inner.start_time, inner.end_time) {
            metrics_json.insert(
                "execution_time_ms".to_string(),
                json!({
                    "value": end.duration_since(start).as_millis(),
                    "description": "Total sweep time in milliseconds",
                }),
            );
        }
        drop(inner);
        Value::Object(metrics_json)
    }

    /// Print all counters to stdout, sorted by name.
    pub fn print(&self) {
        println!("\n=========== Sweep Metrics ===========");
        if let Some(elapsed) = self.elapsed() {
            println!(
                "Execution Time: {:.3}s ({} ms)",
                elapsed.as_secs_f64(),
                elapsed.as_millis()
            );
            println!("-------------------------------------");
        }
        for (name, value) in self.snapshot() {
            match description(&name) {
                Some(desc) => println!("{name}: {value} ({desc})"),
                None => println!("{name}: {value}"),
            }
        }
        println!("=====================================\n");
    }

    /// Write [`to_json`](Self::to_json) to `path`, pretty-printed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let formatted = serde_json::to_string_pretty(&self.to_json())?;
        let mut file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        file.write_all(formatted.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, MetricsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn partition_key(partition: usize, name: &str) -> String {
    format!("partition.{partition}.{name}")
}

fn description(name: &str) -> Option<&'static str> {
    let base = name.rsplit('.').next().unwrap_or(name);
    DESCRIPTIONS
        .iter()
        .find(|(key, _)| *key == base)
        .map(|(_, desc)| *desc)
}
