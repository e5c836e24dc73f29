//! # Slack Archive
//!
//! Incremental full-text indexing and position-addressable retrieval for
//! Slack export archives.
//!
//! An export is a directory tree of JSON files that only ever grows. Each
//! indexing pass pushes the messages of new files into a search engine,
//! gives every top-level message a dense per-chat position, and records the
//! files in a SQLite ledger so the next pass skips them. Clients page
//! through a chat by position, open threads, and run full-text searches.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Archive      │──▶│  Pipeline    │──▶│ Search engine│
//! │ Store (JSON) │   │ extract+batch│   │ (Solr/memory)│
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        │                  ▼                  │
//!        │           ┌──────────────┐          │
//!        │           │ Reconciler   │◀─────────┤
//!        │           └──────┬───────┘          │
//!        │                  ▼                  │
//!        │           ┌──────────────┐          │
//!        │           │ Ledger (SQL) │          │
//!        │           └──────────────┘          │
//!        ▼                                     ▼
//!   ┌─────────────────────────────────────────────┐
//!   │               ArchiveApi (query)            │
//!   └─────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Export entities and engine documents |
//! | [`archive`] | Export reading, chat naming, caches |
//! | [`ledger`] | Processed-file ledger and its batching queue |
//! | [`engine`] | Search engine abstraction (Solr, in-memory) |
//! | [`extract`] | Message → document projection |
//! | [`reconcile`] | Dense per-chat positions |
//! | [`ingest`] | Indexing pipeline |
//! | [`search`] | Full-text search with highlight extraction |
//! | [`query`] | Read-side API |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Ledger schema |

pub mod archive;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod query;
pub mod reconcile;
pub mod search;
