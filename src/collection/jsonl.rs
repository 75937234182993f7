//! A collection backed by a JSON Lines file.
//!
//! Each non-empty line is one document; scan order is file order. Skipping is
//! done by re-reading and discarding the matching prefix, the same way a
//! database server walks past a cursor's `skip`.
//!
//! **Compression**: files ending in `.gz` are decompressed transparently when
//! the `compression-gzip` feature is enabled.

use super::{Collection, Cursor, Document, Filter, ScanError, ScanOptions, matches};
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

/// Documents stored one per line in a local file.
#[derive(Clone, Debug)]
pub struct JsonlCollection {
    name: String,
    path: PathBuf,
}

impl JsonlCollection {
    /// Collection over `path`, named after its file stem.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_file() {
            anyhow::bail!("{} is not a file", path.display());
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("jsonl")
            .trim_end_matches(".jsonl")
            .to_string();
        Ok(Self { name, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn reader(&self) -> Result<Box<dyn BufRead + Send>> {
        let file =
            File::open(&self.path).with_context(|| format!("open {}", self.path.display()))?;
        Ok(Box::new(BufReader::new(decompress(file, &self.path))))
    }
}

#[cfg(feature = "compression-gzip")]
fn decompress(file: File, path: &Path) -> Box<dyn Read + Send> {
    use flate2::read::MultiGzDecoder;
    if path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
    {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    }
}

#[cfg(not(feature = "compression-gzip"))]
fn decompress(file: File, _path: &Path) -> Box<dyn Read + Send> {
    Box::new(file)
}

impl Collection for JsonlCollection {
    fn name(&self) -> &str {
        &self.name
    }

    /// Counts matching documents. Any unparsable line fails the count, so a
    /// corrupt file is rejected before a sweep starts rather than mid-scan.
    fn count(&self, filter: &Filter) -> Result<u64> {
        let mut total = 0;
        for (i, line) in self.reader()?.lines().enumerate() {
            let line = line.with_context(|| format!("read line {} in {}", i + 1, self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let doc: Document = serde_json::from_str(&line)
                .with_context(|| format!("parse JSONL line {} in {}", i + 1, self.path.display()))?;
            if matches(filter, &doc) {
                total += 1;
            }
        }
        Ok(total)
    }

    fn scan<'a>(
        &'a self,
        filter: &Filter,
        options: ScanOptions,
    ) -> Result<Box<dyn Cursor + 'a>, ScanError> {
        let mut cursor = JsonlCursor {
            lines: self.reader().map_err(ScanError::Fault)?,
            filter: filter.clone(),
            line_no: 0,
            path: &self.path,
        };
        for _ in 0..options.skip {
            if cursor.next_document()?.is_none() {
                break;
            }
        }
        Ok(Box::new(cursor))
    }
}

struct JsonlCursor<'a> {
    lines: Box<dyn BufRead + Send>,
    filter: Filter,
    line_no: usize,
    path: &'a Path,
}

impl Cursor for JsonlCursor<'_> {
    fn next_document(&mut self) -> Result<Option<Document>, ScanError> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .lines
                .read_line(&mut line)
                .with_context(|| format!("read {}", self.path.display()))
                .map_err(ScanError::Fault)?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let doc: Document = serde_json::from_str(&line)
                .with_context(|| {
                    format!("parse JSONL line {} in {}", self.line_no, self.path.display())
                })
                .map_err(ScanError::Fault)?;
            if matches(&self.filter, &doc) {
                return Ok(Some(doc));
            }
        }
    }
}
