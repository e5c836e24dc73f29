//! Search engine abstraction.
//!
//! The [`SearchEngine`] trait is the narrow surface the pipeline, the
//! reconciler, and the query façade need from a document index: upsert by
//! id, atomic position updates, explicit commit and rollback, and a typed
//! query with filters, sort, paging, and highlighting.
//!
//! Two backends implement it:
//! - **[`SolrEngine`]** talks to a Solr core over HTTP.
//! - **[`InMemoryEngine`]** keeps documents in process. It honors the same
//!   commit/rollback visibility rules and is used by tests and `kind = "memory"`.
//!
//! Writes are invisible to queries until [`SearchEngine::commit`] succeeds.
//! [`SearchEngine::rollback`] discards everything written since the last
//! commit.

pub mod memory;
pub mod solr;

pub use memory::InMemoryEngine;
pub use solr::SolrEngine;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{ArchiveError, EngineError};
use crate::models::IndexedDocument;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Stored field that carries a top-level message's position.
pub const POSITION_FIELD: &str = "message_index_l";
/// Full-text field searched and highlighted.
pub const TEXT_FIELD: &str = "text_txt_en";

/// Set the position of one existing document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionUpdate {
    pub id: String,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Chat(String),
    /// Excludes thread replies.
    TopLevel,
    ThreadTs(String),
    /// Positions in `[from, to)`.
    PositionRange { from: i64, to: i64 },
    /// `ts` strictly later than the given microsecond timestamp.
    TsAfter(i64),
    /// `ts` at or before the given microsecond timestamp.
    TsAtMost(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sort {
    PositionAsc,
    PositionDesc,
    TsAsc,
    TsDesc,
}

/// Highlighting request for [`TEXT_FIELD`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Highlight {
    pub pre: String,
    pub post: String,
    /// Return the whole field as one fragment instead of snippets.
    pub whole_fragment: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineQuery {
    /// Free-text query against [`TEXT_FIELD`]. `None` matches everything.
    pub text: Option<String>,
    pub filters: Vec<Filter>,
    /// Field projection. Empty returns all stored fields.
    pub fields: Vec<String>,
    pub sort: Option<Sort>,
    pub start: u64,
    pub rows: u64,
    pub highlight: Option<Highlight>,
}

impl EngineQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn page(mut self, start: u64, rows: u64) -> Self {
        self.start = start;
        self.rows = rows;
        self
    }

    pub fn highlight(mut self, highlight: Highlight) -> Self {
        self.highlight = Some(highlight);
        self
    }

    /// Top-level messages of one chat.
    pub fn top_level(chat_id: &str) -> Self {
        Self::new()
            .filter(Filter::Chat(chat_id.to_string()))
            .filter(Filter::TopLevel)
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryResponse {
    /// Total matches, independent of paging.
    pub num_found: u64,
    pub docs: Vec<IndexedDocument>,
    /// Highlighted fragments of [`TEXT_FIELD`] by document id.
    pub highlighting: HashMap<String, Vec<String>>,
}

#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Upsert documents by id. Not visible until commit.
    async fn add(&self, docs: &[IndexedDocument]) -> EngineResult<()>;

    /// Atomically set [`POSITION_FIELD`] on existing documents.
    async fn set_positions(&self, updates: &[PositionUpdate]) -> EngineResult<()>;

    async fn commit(&self) -> EngineResult<()>;

    /// Discard uncommitted adds and updates.
    async fn rollback(&self) -> EngineResult<()>;

    async fn query(&self, query: &EngineQuery) -> EngineResult<QueryResponse>;

    async fn ping(&self) -> EngineResult<()>;
}

/// Create the engine selected by `config.kind`.
pub fn create_engine(config: &EngineConfig) -> Result<Arc<dyn SearchEngine>> {
    match config.kind.as_str() {
        "solr" => Ok(Arc::new(SolrEngine::new(config)?)),
        "memory" => Ok(Arc::new(InMemoryEngine::new())),
        other => Err(ArchiveError::Config(format!("unknown engine kind: {}", other)).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_filters() {
        let query = EngineQuery::top_level("C1")
            .sort(Sort::PositionDesc)
            .page(0, 1);
        assert_eq!(
            query.filters,
            vec![Filter::Chat("C1".into()), Filter::TopLevel]
        );
        assert_eq!(query.rows, 1);
        assert!(query.text.is_none());
    }

    #[test]
    fn factory_selects_backend() {
        let mut config = EngineConfig::default();
        config.kind = "memory".into();
        assert!(create_engine(&config).is_ok());

        config.kind = "elastic".into();
        assert!(create_engine(&config).is_err());
    }
}
