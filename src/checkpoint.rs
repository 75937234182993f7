//! Per-partition progress logs that survive process restart.
//!
//! Every partition owns one append-only text file in the checkpoint directory,
//! `partition_<id>.log`. The file starts with a `Started` marker and then gains
//! one line per processed document:
//!
//! ```text
//! 2026-10-16T09:12:44.120Z Started workers=3
//! 2026-10-16T09:12:44.583Z processed=1 expected=4 index=1
//! 2026-10-16T09:12:44.590Z processed=2 expected=4 index=4
//! ```
//!
//! The newest well-formed progress line is authoritative. Lines are only
//! trusted once terminated by a newline, so a line torn by a crash mid-append
//! is ignored on [`PartitionLog::load`] and cut off before the next append.
//!
//! The `Started` marker records how many partitions the run was split into.
//! Stripe membership depends on that number, so a restart must use the same one
//! (see [`CheckpointStore::recorded_workers`]).
//!
//! There is no cross-partition locking: a [`PartitionLog`] is handed to exactly
//! one worker, and appends go through `&mut self`.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use regex::Regex;
use std::fs::{File, OpenOptions, create_dir_all, read_dir, read_to_string, remove_file};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static PROGRESS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+) processed=(\d+) expected=(\d+) index=(\d+)$").expect("valid progress regex")
});

static START_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+) Started(?: workers=(\d+))?$").expect("valid start regex")
});

const LOG_PREFIX: &str = "partition_";
const LOG_SUFFIX: &str = ".log";

/// Resume point for one partition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Checkpoint {
    /// Absolute index of the last document this partition handled. `0` before any progress.
    pub last_index: u64,
    /// Number of owned documents handled so far (transform errors included).
    pub processed: u64,
}

/// Directory of per-partition progress logs.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    directory: PathBuf,
}

impl CheckpointStore {
    /// Store rooted at `directory`. Nothing is created until the first write.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the log file for `partition`.
    #[must_use]
    pub fn log_path(&self, partition: usize) -> PathBuf {
        self.directory
            .join(format!("{LOG_PREFIX}{partition}{LOG_SUFFIX}"))
    }

    /// Writable handle to one partition's log. Hand it to exactly one worker.
    #[must_use]
    pub fn partition(&self, partition: usize) -> PartitionLog {
        PartitionLog {
            partition,
            path: self.log_path(partition),
            file: None,
        }
    }

    /// Read the resume point of `partition` without taking a writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the log exists but cannot be read.
    pub fn load(&self, partition: usize) -> Result<Checkpoint> {
        read_checkpoint(&self.log_path(partition))
    }

    /// Worker count written in the `Started` marker of `partition`'s log.
    ///
    /// `None` when the log is absent or carries no marker with a count.
    ///
    /// # Errors
    ///
    /// Returns an error if the log exists but cannot be read.
    pub fn recorded_workers(&self, partition: usize) -> Result<Option<usize>> {
        let path = self.log_path(partition);
        let content = match read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        Ok(complete_lines(&content).lines().find_map(|line| {
            START_LINE
                .captures(line.trim_end_matches('\r'))?
                .get(2)?
                .as_str()
                .parse()
                .ok()
        }))
    }

    /// Whether any partition log exists in the directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be listed.
    pub fn has_state(&self) -> Result<bool> {
        Ok(!self.log_files()?.is_empty())
    }

    /// Ids of the partitions that have a log, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be listed.
    pub fn partitions(&self) -> Result<Vec<usize>> {
        let mut ids: Vec<usize> = self.log_files()?.into_iter().map(|(id, _)| id).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Delete every partition log. This is the external reset action; the
    /// engine never calls it while a run is in progress.
    ///
    /// # Errors
    ///
    /// Returns an error if a log file cannot be removed.
    pub fn clear(&self) -> Result<()> {
        for (_, path) in self.log_files()? {
            remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }
        Ok(())
    }

    fn log_files(&self) -> Result<Vec<(usize, PathBuf)>> {
        let entries = match read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("read checkpoint dir {}", self.directory.display()));
            }
        };
        Ok(entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                if !entry.file_type().ok()?.is_file() {
                    return None;
                }
                let id = entry
                    .file_name()
                    .to_str()?
                    .strip_prefix(LOG_PREFIX)?
                    .strip_suffix(LOG_SUFFIX)?
                    .parse::<usize>()
                    .ok()?;
                Some((id, entry.path()))
            })
            .collect())
    }
}

/// Append handle to a single partition's progress log.
#[derive(Debug)]
pub struct PartitionLog {
    partition: usize,
    path: PathBuf,
    file: Option<File>,
}

impl PartitionLog {
    #[must_use]
    pub fn partition(&self) -> usize {
        self.partition
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Latest resume point recorded in the log, `(0, 0)` if the log is absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the log exists but cannot be read.
    pub fn load(&self) -> Result<Checkpoint> {
        read_checkpoint(&self.path)
    }

    /// Write the `Started` marker, tagged with the run's worker count, if this
    /// partition has never run before.
    ///
    /// Returns `true` when the marker was written.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or log file cannot be created or written.
    pub fn record_start(&mut self, workers: usize) -> Result<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        self.append(&format!("{} Started workers={workers}\n", timestamp()))?;
        Ok(true)
    }

    /// Append a progress entry for the document at `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be written.
    pub fn advance(&mut self, processed: u64, expected: u64, index: u64) -> Result<()> {
        self.append(&format!(
            "{} processed={processed} expected={expected} index={index}\n",
            timestamp()
        ))
    }

    fn append(&mut self, line: &str) -> Result<()> {
        if self.file.is_none() {
            self.file = Some(open_for_append(&self.path)?);
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(line.as_bytes())
                .with_context(|| format!("append to {}", self.path.display()))?;
        }
        Ok(())
    }
}

/// Open a log for appending, creating its directory lazily. A trailing
/// fragment left by an interrupted write is truncated away; terminating it
/// instead could turn a prefix such as `index=1` (of `index=12`) into a
/// trusted entry.
fn open_for_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    }
    let keep = match read_to_string(path) {
        Ok(content) if !content.is_empty() && !content.ends_with('\n') => {
            Some(content.rfind('\n').map_or(0, |end| end + 1) as u64)
        }
        Ok(_) => None,
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    if let Some(len) = keep {
        file.set_len(len)
            .with_context(|| format!("truncate torn line in {}", path.display()))?;
    }
    Ok(file)
}

fn read_checkpoint(path: &Path) -> Result<Checkpoint> {
    let content = match read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Checkpoint::default()),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    Ok(parse_checkpoint(&content))
}

/// Latest complete progress line in `content`. The segment after the final
/// newline is an unfinished write and is never trusted.
fn parse_checkpoint(content: &str) -> Checkpoint {
    complete_lines(content)
        .lines()
        .rev()
        .find_map(parse_progress_line)
        .unwrap_or_default()
}

fn complete_lines(content: &str) -> &str {
    content.rfind('\n').map_or("", |end| &content[..end])
}

fn parse_progress_line(line: &str) -> Option<Checkpoint> {
    let caps = PROGRESS_LINE.captures(line.trim_end_matches('\r'))?;
    Some(Checkpoint {
        processed: caps[2].parse().ok()?,
        last_index: caps[4].parse().ok()?,
    })
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
