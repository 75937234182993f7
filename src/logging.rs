//! Error log setup.
//!
//! The engine only emits `tracing` events; where they go is up to the caller.
//! [`init_error_log`] is the usual choice for unattended sweeps: a plain-text,
//! leveled log file that every partition appends to through one writer.

use anyhow::{Context, Result};
use std::fs::{OpenOptions, create_dir_all};
use std::path::Path;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install a global subscriber writing to `path`.
///
/// `RUST_LOG` takes precedence over `default_level` when set. Returns `false`
/// if a global subscriber was already installed, in which case nothing changes.
///
/// # Errors
///
/// Returns an error if the log file or its directory cannot be created.
pub fn init_error_log(path: impl AsRef<Path>, default_level: Level) -> Result<bool> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open error log {}", path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str().to_ascii_lowercase()));

    Ok(tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_thread_names(true)
        .try_init()
        .is_ok())
}
