//! In-memory collection with scripted scan faults.
//!
//! Faults are keyed by absolute scan position, so a test can say "the pull that
//! would return document 9 fails with an invalidated cursor" regardless of
//! which skip the scan was opened with. Each scripted fault fires once and is
//! then consumed by whichever scan reached it first.

use super::{Collection, Cursor, Document, Filter, ScanError, ScanOptions, matches};
use anyhow::anyhow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Kind of failure to inject.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    CursorInvalidated,
    Fault,
}

impl FaultKind {
    fn to_error(self, position: u64) -> ScanError {
        match self {
            Self::CursorInvalidated => {
                ScanError::CursorInvalidated(format!("cursor lost before document {position}"))
            }
            Self::Fault => ScanError::fault(anyhow!("connection reset before document {position}")),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct ScriptedFault {
    /// `0` targets the open call itself.
    before_index: u64,
    kind: FaultKind,
}

/// Documents held in memory, in insertion order.
#[derive(Default)]
pub struct MemoryCollection {
    name: String,
    documents: Mutex<Vec<Document>>,
    faults: Mutex<Vec<ScriptedFault>>,
    opened: Mutex<Vec<ScanOptions>>,
    closed: AtomicUsize,
}

impl MemoryCollection {
    pub fn new(name: impl Into<String>, documents: Vec<Document>) -> Self {
        Self {
            name: name.into(),
            documents: Mutex::new(documents),
            ..Default::default()
        }
    }

    /// Append a document while scans may be running.
    pub fn push(&self, document: Document) {
        lock(&self.documents).push(document);
    }

    /// Fail the pull that would yield the document at absolute position `before_index`.
    ///
    /// # Panics
    ///
    /// Panics if `before_index == 0`; positions are 1-based.
    pub fn fail_before(&self, before_index: u64, kind: FaultKind) {
        assert!(before_index > 0, "scan positions are 1-based");
        lock(&self.faults).push(ScriptedFault { before_index, kind });
    }

    /// Fail the next `scan` call.
    pub fn fail_next_open(&self, kind: FaultKind) {
        lock(&self.faults).push(ScriptedFault {
            before_index: 0,
            kind,
        });
    }

    /// Options of every scan opened so far, in order.
    pub fn scans_opened(&self) -> Vec<ScanOptions> {
        lock(&self.opened).clone()
    }

    pub fn scans_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Scripted faults that have not fired yet.
    pub fn pending_faults(&self) -> usize {
        lock(&self.faults).len()
    }

    fn take_fault(&self, before_index: u64) -> Option<FaultKind> {
        let mut faults = lock(&self.faults);
        let at = faults.iter().position(|f| f.before_index == before_index)?;
        Some(faults.remove(at).kind)
    }
}

impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn count(&self, filter: &Filter) -> anyhow::Result<u64> {
        Ok(lock(&self.documents)
            .iter()
            .filter(|doc| matches(filter, doc))
            .count() as u64)
    }

    fn scan<'a>(
        &'a self,
        filter: &Filter,
        options: ScanOptions,
    ) -> Result<Box<dyn Cursor + 'a>, ScanError> {
        lock(&self.opened).push(options);
        if let Some(kind) = self.take_fault(0) {
            return Err(kind.to_error(options.skip + 1));
        }
        let mut cursor = MemoryCursor {
            collection: self,
            filter: filter.clone(),
            offset: 0,
            position: 0,
        };
        while cursor.position < options.skip && cursor.advance().is_some() {}
        Ok(Box::new(cursor))
    }
}

struct MemoryCursor<'a> {
    collection: &'a MemoryCollection,
    filter: Filter,
    /// Next slot of the backing vector to look at.
    offset: usize,
    /// Matching documents passed so far, skipped ones included.
    position: u64,
}

impl MemoryCursor<'_> {
    fn advance(&mut self) -> Option<Document> {
        let documents = lock(&self.collection.documents);
        while let Some(doc) = documents.get(self.offset) {
            self.offset += 1;
            if matches(&self.filter, doc) {
                self.position += 1;
                return Some(doc.clone());
            }
        }
        None
    }
}

impl Cursor for MemoryCursor<'_> {
    fn next_document(&mut self) -> Result<Option<Document>, ScanError> {
        let next = self.position + 1;
        if let Some(kind) = self.collection.take_fault(next) {
            return Err(kind.to_error(next));
        }
        Ok(self.advance())
    }

    fn close(&mut self) -> Result<(), ScanError> {
        self.collection.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
