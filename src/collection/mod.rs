//! The queryable document store a sweep runs against.
//!
//! The engine only needs four things from a store: count the documents matching
//! a filter, open an ordered scan that skips a prefix of the results, pull
//! documents from that scan, and close it. Stores report scan failures as
//! [`ScanError`], which separates an invalidated cursor (resume right away)
//! from every other fault (back off, then resume).
//!
//! Two implementations ship with the crate:
//! - [`memory::MemoryCollection`] - in-memory documents with scripted faults, for tests
//! - [`jsonl::JsonlCollection`] - newline-delimited JSON on local disk

pub mod jsonl;
pub mod memory;

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// A document as returned by a scan.
pub type Document = Value;

/// Opaque query filter. Built-in stores treat it as a top-level equality match (see [`matches`]).
pub type Filter = Value;

/// Scan-level failures.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The server discarded the cursor (expiry, failover). Safe to reopen immediately.
    #[error("cursor invalidated: {0}")]
    CursorInvalidated(String),
    /// Connectivity loss, server error, or any other failure while scanning.
    #[error("scan fault: {0:#}")]
    Fault(anyhow::Error),
}

impl ScanError {
    pub fn fault(error: impl Into<anyhow::Error>) -> Self {
        Self::Fault(error.into())
    }

    #[must_use]
    pub fn is_cursor_invalidated(&self) -> bool {
        matches!(self, Self::CursorInvalidated(_))
    }
}

/// Options for opening a scan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// Number of leading results (in scan order) to skip.
    pub skip: u64,
    /// Server-side idle timeout for the cursor. `None` disables it.
    pub idle_timeout: Option<Duration>,
}

impl ScanOptions {
    /// Skip `skip` results and never let the cursor time out.
    #[must_use]
    pub fn resume_at(skip: u64) -> Self {
        Self {
            skip,
            idle_timeout: None,
        }
    }
}

/// An open, ordered scan.
pub trait Cursor: Send {
    /// Next document in scan order, `Ok(None)` once exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::CursorInvalidated`] if the server dropped the cursor,
    /// or [`ScanError::Fault`] for any other failure.
    fn next_document(&mut self) -> Result<Option<Document>, ScanError>;

    /// Release server-side resources. Called on exhaustion and before every retry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails to release the cursor.
    fn close(&mut self) -> Result<(), ScanError> {
        Ok(())
    }
}

/// A store that can count and scan documents matching a filter.
pub trait Collection: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Number of documents matching `filter` right now.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached or the filter is rejected.
    fn count(&self, filter: &Filter) -> anyhow::Result<u64>;

    /// Open an ordered scan over the documents matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns a [`ScanError`] if the scan cannot be opened.
    fn scan<'a>(
        &'a self,
        filter: &Filter,
        options: ScanOptions,
    ) -> Result<Box<dyn Cursor + 'a>, ScanError>;
}

/// Top-level equality match: `null` and `{}` match everything, otherwise every
/// key of the filter object must be present in `document` with an equal value.
/// A non-object filter matches documents equal to it.
#[must_use]
pub fn matches(filter: &Filter, document: &Document) -> bool {
    match filter {
        Value::Null => true,
        Value::Object(fields) => fields
            .iter()
            .all(|(key, expected)| document.get(key) == Some(expected)),
        other => other == document,
    }
}

/// A filter plus the matching-document count observed once at startup.
///
/// The count sizes partitions for progress reporting only; the collection may
/// grow or shrink during the sweep and nothing re-validates it.
#[derive(Clone, Debug, PartialEq)]
pub struct QuerySpec {
    pub filter: Filter,
    pub total: u64,
}

impl QuerySpec {
    /// Count the documents matching `filter` in `collection`.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot count.
    pub fn snapshot(collection: &dyn Collection, filter: Filter) -> anyhow::Result<Self> {
        let total = collection.count(&filter)?;
        Ok(Self { filter, total })
    }
}
