//! Search indexing seam.
//!
//! The engine notifies an implementation after committed writes. Indexing
//! is fire-and-forget: failures are logged, never surfaced to the caller.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::record::Record;

/// A document to index or re-index.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchIndexRequest {
    pub collection: String,
    pub record_id: String,
    pub locale: String,
    pub title: Option<String>,
    pub content: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub embedding: Option<Vec<f32>>,
}

/// A document to drop from the index. Without a locale, every locale's
/// entry is removed.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRemoveRequest {
    pub collection: String,
    pub record_id: String,
    pub locale: Option<String>,
}

/// Receives index updates after committed writes.
pub trait SearchService: Send + Sync {
    fn index(&self, request: SearchIndexRequest) -> Result<()>;
    fn remove(&self, request: SearchRemoveRequest) -> Result<()>;
}

/// Default service that drops every request.
#[derive(Debug, Default)]
pub struct NoopSearch;

impl SearchService for NoopSearch {
    fn index(&self, _request: SearchIndexRequest) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _request: SearchRemoveRequest) -> Result<()> {
        Ok(())
    }
}

pub type ContentFn = Arc<dyn Fn(&Record) -> Option<String> + Send + Sync>;
pub type MetadataFn = Arc<dyn Fn(&Record) -> Option<serde_json::Value> + Send + Sync>;
pub type EmbeddingFn = Arc<dyn Fn(&Record) -> Option<Vec<f32>> + Send + Sync>;

/// How a collection projects records into search documents. The document
/// title always comes from the collection's title expression.
#[derive(Clone, Default)]
pub struct Searchable {
    pub content: Option<ContentFn>,
    pub metadata: Option<MetadataFn>,
    pub embedding: Option<EmbeddingFn>,
    /// Suppress automatic indexing; the application indexes explicitly.
    pub manual: bool,
}

impl Searchable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(
        mut self,
        f: impl Fn(&Record) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.content = Some(Arc::new(f));
        self
    }

    pub fn with_metadata(
        mut self,
        f: impl Fn(&Record) -> Option<serde_json::Value> + Send + Sync + 'static,
    ) -> Self {
        self.metadata = Some(Arc::new(f));
        self
    }

    pub fn with_embedding(
        mut self,
        f: impl Fn(&Record) -> Option<Vec<f32>> + Send + Sync + 'static,
    ) -> Self {
        self.embedding = Some(Arc::new(f));
        self
    }

    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }
}

impl fmt::Debug for Searchable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Searchable")
            .field("content", &self.content.is_some())
            .field("metadata", &self.metadata.is_some())
            .field("embedding", &self.embedding.is_some())
            .field("manual", &self.manual)
            .finish()
    }
}
