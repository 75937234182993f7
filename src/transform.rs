//! The per-document transform injected into a sweep.

use crate::collection::Document;
use anyhow::Result;

/// Where in the sweep a document is being transformed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransformContext {
    /// 1-based partition handling the document.
    pub partition: usize,
    /// Total number of partitions in the run.
    pub workers: usize,
    /// 1-based position of the document in the full scan.
    pub absolute_index: u64,
}

/// Maps one document to zero or one output record.
///
/// Errors (and panics) are isolated per document: the engine logs them and
/// moves on. Closures of the right shape implement this trait directly:
///
/// ```
/// use ironsweep::{Document, Transform, TransformContext};
/// use serde_json::{Value, json};
///
/// let keep_named = |_: &TransformContext, doc: &Document| -> anyhow::Result<Option<Value>> {
///     Ok(doc.get("name").map(|name| json!({ "name": name })))
/// };
/// # fn assert_transform<T: Transform<Value>>(_: &T) {}
/// # assert_transform(&keep_named);
/// ```
pub trait Transform<R>: Send + Sync {
    /// # Errors
    ///
    /// Any error marks this document as failed; the sweep continues with the next one.
    fn apply(&self, ctx: &TransformContext, document: &Document) -> Result<Option<R>>;
}

impl<R, F> Transform<R> for F
where
    F: Fn(&TransformContext, &Document) -> Result<Option<R>> + Send + Sync,
{
    fn apply(&self, ctx: &TransformContext, document: &Document) -> Result<Option<R>> {
        self(ctx, document)
    }
}
