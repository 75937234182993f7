//! The shared output artifact.
//!
//! All partitions append into one JSON array on disk. The layout is
//!
//! ```text
//! [
//! 	{"id":1},
//! 	{"id":4}
//! ]
//! ```
//!
//! with every record serialized compactly on its own line. Because a record
//! never contains a raw newline, a last line consisting solely of `]` can only
//! come from [`OutputSink::finalize`], which is what makes the open/finalized
//! state of an artifact checkable ([`ArtifactState::inspect`]).

use serde::Serialize;
use std::fs::{File, OpenOptions, create_dir_all};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

const OPEN: &str = "[";
const SEPARATOR: &str = ",";
const RECORD_PREFIX: &str = "\n\t";
const CLOSE: &str = "\n]";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("artifact I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("output sink for {0} is already finalized")]
    Finalized(PathBuf),
    #[error("artifact {0} already exists; resume with restart or reset it first")]
    ArtifactExists(PathBuf),
    #[error("artifact {0} was already finalized and cannot be resumed")]
    AlreadyFinalized(PathBuf),
}

/// Observable state of an artifact file on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactState {
    Missing,
    /// Exists but holds no bytes (or only whitespace).
    Empty,
    /// Has an opening delimiter and zero or more records, but no closing one.
    Open,
    Finalized,
}

impl ArtifactState {
    /// Classify the artifact at `path` by looking at its tail.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn inspect(path: impl AsRef<Path>) -> io::Result<Self> {
        let mut file = match File::open(path.as_ref()) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::Missing),
            Err(e) => return Err(e),
        };
        let len = file.metadata()?.len();
        let tail_len = len.min(64);
        file.seek(SeekFrom::Start(len - tail_len))?;
        let mut tail = Vec::with_capacity(tail_len as usize);
        file.read_to_end(&mut tail)?;

        let trimmed = tail.trim_ascii_end();
        if trimmed.is_empty() && tail_len == len {
            return Ok(Self::Empty);
        }
        let last_line = trimmed
            .rsplit(|b| *b == b'\n')
            .next()
            .unwrap_or_default();
        // A lone `[` is an open artifact whose first record was never written.
        if (last_line.trim_ascii() == b"]" && trimmed.len() > 1) || trimmed == b"[]" {
            Ok(Self::Finalized)
        } else {
            Ok(Self::Open)
        }
    }
}

/// How [`OutputSink::open`] treats an existing artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// A new run: the artifact must be missing or empty.
    Fresh,
    /// Continue an unfinished run: the artifact must not be finalized.
    Resume,
}

struct SinkState {
    file: File,
    /// True until the opening delimiter has been written to this artifact.
    first_write: bool,
    finalized: bool,
}

/// Mutex-guarded append target shared by every partition of a run.
pub struct OutputSink {
    path: PathBuf,
    state: Mutex<SinkState>,
    records: AtomicU64,
}

impl OutputSink {
    /// Open the artifact at `path` for appending.
    ///
    /// Whether the opening delimiter still has to be written is derived from the
    /// artifact itself, so resuming a run that crashed before its first record
    /// still produces a well-formed array.
    ///
    /// # Errors
    ///
    /// - [`SinkError::ArtifactExists`] for [`OpenMode::Fresh`] when the artifact has content.
    /// - [`SinkError::AlreadyFinalized`] for [`OpenMode::Resume`] when the artifact was closed.
    /// - [`SinkError::Io`] when the file cannot be inspected or opened.
    pub fn open(path: impl Into<PathBuf>, mode: OpenMode) -> Result<Self, SinkError> {
        let path = path.into();
        let state = ArtifactState::inspect(&path)?;
        let first_write = match (mode, state) {
            (_, ArtifactState::Missing | ArtifactState::Empty) => true,
            (OpenMode::Fresh, _) => return Err(SinkError::ArtifactExists(path)),
            (OpenMode::Resume, ArtifactState::Finalized) => {
                return Err(SinkError::AlreadyFinalized(path));
            }
            (OpenMode::Resume, ArtifactState::Open) => false,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        Ok(Self {
            path,
            state: Mutex::new(SinkState {
                file,
                first_write,
                finalized: false,
            }),
            records: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records appended through this sink (not counting earlier runs).
    #[must_use]
    pub fn records_written(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    /// Append one record. Serialization happens before the lock is taken; the
    /// delimiter and record bytes then go out in a single write.
    ///
    /// # Errors
    ///
    /// - [`SinkError::Serialize`] if `record` cannot be encoded as JSON (nothing is written).
    /// - [`SinkError::Finalized`] if the sink was already finalized.
    /// - [`SinkError::Io`] if the write fails.
    pub fn offer<R: Serialize + ?Sized>(&self, record: &R) -> Result<(), SinkError> {
        let json = serde_json::to_string(record)?;
        let mut state = self.lock();
        if state.finalized {
            return Err(SinkError::Finalized(self.path.clone()));
        }
        let lead = if state.first_write { OPEN } else { SEPARATOR };
        let mut chunk = String::with_capacity(lead.len() + RECORD_PREFIX.len() + json.len());
        chunk.push_str(lead);
        chunk.push_str(RECORD_PREFIX);
        chunk.push_str(&json);
        state.file.write_all(chunk.as_bytes())?;
        state.first_write = false;
        self.records.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Close the array. Must only be called once no partition can still offer.
    ///
    /// An artifact that never received a record becomes `[` + `\n]`.
    ///
    /// # Errors
    ///
    /// - [`SinkError::Finalized`] on a second call.
    /// - [`SinkError::Io`] if the write or flush fails.
    pub fn finalize(&self) -> Result<(), SinkError> {
        let mut state = self.lock();
        if state.finalized {
            return Err(SinkError::Finalized(self.path.clone()));
        }
        let chunk = if state.first_write {
            format!("{OPEN}{CLOSE}")
        } else {
            CLOSE.to_string()
        };
        state.file.write_all(chunk.as_bytes())?;
        state.file.sync_all()?;
        state.first_write = false;
        state.finalized = true;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        // A panic while holding the lock happens outside any write, so the
        // artifact bytes are still consistent.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
