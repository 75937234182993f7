//! Run configuration.
//!
//! [`ScanConfig`] can be built in code with struct-update syntax or loaded from
//! a JSON file; any field left out falls back to its default.
//!
//! ```
//! use ironsweep::ScanConfig;
//! use serde_json::json;
//!
//! let config = ScanConfig {
//!     collection: "readings".into(),
//!     filter: json!({ "station": "lattice-7" }),
//!     workers: 8,
//!     restart: true,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Name used in logs and the run report. Empty means the collection's own name.
    pub collection: String,
    /// Query filter handed to the collection for both count and scan.
    pub filter: Value,
    /// Number of partitions, and of worker threads.
    pub workers: usize,
    /// Resume from existing checkpoints and an open artifact instead of starting fresh.
    pub restart: bool,
    /// The shared JSON array artifact.
    pub output_path: PathBuf,
    /// Directory holding one progress log per partition.
    pub checkpoint_dir: PathBuf,
    /// Leveled text log of transform and scan errors.
    pub error_log: PathBuf,
    /// Backoff after a generic scan fault before the scan is reopened.
    pub retry_delay_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            collection: String::new(),
            filter: Value::Object(serde_json::Map::new()),
            workers: num_cpus::get().max(1),
            restart: false,
            output_path: PathBuf::from("output.json"),
            checkpoint_dir: PathBuf::from("progress"),
            error_log: PathBuf::from("error.log"),
            retry_delay_ms: 5_000,
        }
    }
}

impl ScanConfig {
    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or fails [`validate`](Self::validate).
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns an error if `workers` is zero or the output and checkpoint paths collide.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.output_path == self.checkpoint_dir {
            bail!(
                "output path and checkpoint directory are both {}",
                self.output_path.display()
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Place the artifact, checkpoints, and error log under `dir`, keeping their file names.
    #[must_use]
    pub fn rooted_at(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        self.output_path = dir.join(&self.output_path);
        self.checkpoint_dir = dir.join(&self.checkpoint_dir);
        self.error_log = dir.join(&self.error_log);
        self
    }
}
