//! TOML configuration parsing and validation.
//!
//! A single file configures where the export lives, where the processed-file
//! ledger is stored, which search engine receives documents, and the batch
//! and cache sizes used by the pipeline. Every section except `[archive]` is
//! optional and falls back to defaults that match a stock Solr setup.
//!
//! ```toml
//! [archive]
//! path = "./data"
//!
//! [ledger]
//! path = "./processed_messages.db"
//!
//! [engine]
//! kind = "solr"
//! host = "localhost"
//! port = 8983
//! core = "slack_messages"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    /// Export base directory holding `users.json`, `channels.json`, ... and
    /// one subdirectory per chat.
    pub path: PathBuf,
    #[serde(default = "default_message_cache_size")]
    pub message_cache_size: usize,
    #[serde(default = "default_chat_list_ttl_secs")]
    pub chat_list_ttl_secs: u64,
    /// Upper bound on message files read in parallel for one chat.
    #[serde(default = "default_read_concurrency")]
    pub read_concurrency: usize,
}

impl ArchiveConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            message_cache_size: default_message_cache_size(),
            chat_list_ttl_secs: default_chat_list_ttl_secs(),
            read_concurrency: default_read_concurrency(),
        }
    }
}

fn default_message_cache_size() -> usize {
    50
}
fn default_chat_list_ttl_secs() -> u64 {
    300
}
fn default_read_concurrency() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
    #[serde(default = "default_ledger_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_idle_flush_secs")]
    pub idle_flush_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
            batch_size: default_ledger_batch_size(),
            idle_flush_secs: default_idle_flush_secs(),
        }
    }
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("./processed_messages.db")
}
fn default_ledger_batch_size() -> usize {
    100
}
fn default_idle_flush_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// `solr` or `memory`. The in-memory engine does not persist anything and
    /// is meant for dry runs and tests.
    #[serde(default = "default_engine_kind")]
    pub kind: String,
    #[serde(default = "default_engine_host")]
    pub host: String,
    #[serde(default = "default_engine_port")]
    pub port: u16,
    #[serde(default = "default_engine_core")]
    pub core: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: default_engine_kind(),
            host: default_engine_host(),
            port: default_engine_port(),
            core: default_engine_core(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl EngineConfig {
    /// Base URL of the configured Solr core, e.g. `http://localhost:8983/solr/slack_messages`.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/solr/{}", self.host, self.port, self.core)
    }
}

fn default_engine_kind() -> String {
    "solr".to_string()
}
fn default_engine_host() -> String {
    "localhost".to_string()
}
fn default_engine_port() -> u16 {
    8983
}
fn default_engine_core() -> String {
    "slack_messages".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_index_batch_size")]
    pub batch_size: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_index_batch_size(),
        }
    }
}

fn default_index_batch_size() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_search_limit")]
    pub default_search_limit: usize,
    /// Threads are fetched in one request without paging.
    #[serde(default = "default_max_thread_messages")]
    pub max_thread_messages: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_search_limit: default_search_limit(),
            max_thread_messages: default_max_thread_messages(),
        }
    }
}

fn default_search_limit() -> usize {
    50
}
fn default_max_thread_messages() -> usize {
    10_000
}

impl Config {
    /// Configuration for an archive at `archive_path` with every other
    /// section left at its default.
    pub fn with_archive(archive_path: impl Into<PathBuf>) -> Self {
        Self {
            archive: ArchiveConfig::new(archive_path),
            ledger: LedgerConfig::default(),
            engine: EngineConfig::default(),
            indexing: IndexingConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.archive.message_cache_size == 0 {
        anyhow::bail!("archive.message_cache_size must be > 0");
    }
    if config.archive.read_concurrency == 0 {
        anyhow::bail!("archive.read_concurrency must be > 0");
    }
    if config.ledger.batch_size == 0 {
        anyhow::bail!("ledger.batch_size must be > 0");
    }
    if config.indexing.batch_size == 0 {
        anyhow::bail!("indexing.batch_size must be > 0");
    }
    if config.query.default_search_limit == 0 {
        anyhow::bail!("query.default_search_limit must be > 0");
    }

    match config.engine.kind.as_str() {
        "solr" | "memory" => {}
        other => anyhow::bail!("Unknown engine kind: '{}'. Must be solr or memory.", other),
    }

    if config.engine.kind == "solr" && config.engine.core.trim().is_empty() {
        anyhow::bail!("engine.core must not be empty");
    }

    Ok(())
}
