//! Read-side API over the archive and the engine.
//!
//! The engine answers which messages belong in a window or thread; bodies
//! always come from the export files, so clients get the full message as
//! exported (blocks, files, reactions) rather than the indexed projection.
//! Only committed engine state is visible here, so reads can run while an
//! indexing pass is in progress.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::archive::{ArchiveStore, FileMode};
use crate::config::QueryConfig;
use crate::engine::{EngineQuery, Filter, SearchEngine, Sort};
use crate::models::{ChatRecord, ExportUser, IndexedDocument, Message};
use crate::search::{search_messages, SearchHit};

/// Which messages of a chat to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSelector {
    /// Top-level messages with positions in `[start, start + rows)`.
    Window { start: u64, rows: u64 },
    /// A thread parent and its replies.
    Thread { ts: String },
    /// Every message of the chat, straight from disk.
    All,
}

/// A message as returned to clients.
#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    #[serde(rename = "messageIndex", skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    #[serde(flatten)]
    pub message: Message,
}

/// Start of the last full page of `count` messages, where a client opens a
/// chat by default.
pub fn initial_offset(count: u64, rows: u64) -> u64 {
    count.saturating_sub(rows)
}

pub struct ArchiveApi {
    archive: Arc<ArchiveStore>,
    engine: Arc<dyn SearchEngine>,
    config: QueryConfig,
}

impl ArchiveApi {
    pub fn new(archive: Arc<ArchiveStore>, engine: Arc<dyn SearchEngine>, config: QueryConfig) -> Self {
        Self {
            archive,
            engine,
            config,
        }
    }

    pub async fn chats(&self) -> Result<Arc<Vec<ChatRecord>>> {
        self.archive.chats().await
    }

    pub async fn users(&self) -> Result<Vec<ExportUser>> {
        self.archive.users().await
    }

    pub async fn messages(&self, chat_id: &str, selector: MessageSelector) -> Result<Vec<MessageView>> {
        match selector {
            MessageSelector::Window { start, rows } => self.window(chat_id, start, rows).await,
            MessageSelector::Thread { ts } => self.thread(chat_id, &ts).await,
            MessageSelector::All => self.all(chat_id).await,
        }
    }

    /// Top-level messages at positions `[start, start + rows)`, ascending.
    pub async fn window(&self, chat_id: &str, start: u64, rows: u64) -> Result<Vec<MessageView>> {
        if rows == 0 {
            return Ok(Vec::new());
        }
        let from = i64::try_from(start).context("Window start out of range")?;
        let to = from.saturating_add(i64::try_from(rows).unwrap_or(i64::MAX));

        let resp = self
            .engine
            .query(
                &EngineQuery::top_level(chat_id)
                    .filter(Filter::PositionRange { from, to })
                    .fields(&["message_index_l", "file_path_s"])
                    .sort(Sort::PositionAsc)
                    .page(0, rows),
            )
            .await
            .with_context(|| format!("Failed to fetch window {}+{} of chat {}", start, rows, chat_id))?;

        self.hydrate(chat_id, &resp.docs).await
    }

    /// Parent and replies of the thread started at `thread_ts`, ascending.
    pub async fn thread(&self, chat_id: &str, thread_ts: &str) -> Result<Vec<MessageView>> {
        let resp = self
            .engine
            .query(
                &EngineQuery::new()
                    .filter(Filter::Chat(chat_id.to_string()))
                    .filter(Filter::ThreadTs(thread_ts.to_string()))
                    .fields(&["message_index_l", "file_path_s"])
                    .sort(Sort::TsAsc)
                    .page(0, self.config.max_thread_messages as u64),
            )
            .await
            .with_context(|| format!("Failed to fetch thread {} of chat {}", thread_ts, chat_id))?;

        if resp.num_found > resp.docs.len() as u64 {
            tracing::warn!(
                chat_id,
                thread_ts,
                total = resp.num_found,
                returned = resp.docs.len(),
                "thread truncated"
            );
        }
        self.hydrate(chat_id, &resp.docs).await
    }

    async fn all(&self, chat_id: &str) -> Result<Vec<MessageView>> {
        let files = self.archive.list_message_files(chat_id, FileMode::All).await?;
        let loaded = self.archive.load_messages(chat_id, &files).await?;
        Ok(loaded
            .iter()
            .map(|m| MessageView {
                position: None,
                message: m.message.clone(),
            })
            .collect())
    }

    /// Number of top-level messages in the chat.
    pub async fn count(&self, chat_id: &str) -> Result<u64> {
        let resp = self
            .engine
            .query(&EngineQuery::top_level(chat_id).page(0, 0))
            .await
            .with_context(|| format!("Failed to count messages of chat {}", chat_id))?;
        Ok(resp.num_found)
    }

    pub async fn search(&self, query: &str, limit: Option<usize>) -> Result<Vec<SearchHit>> {
        let limit = limit.unwrap_or(self.config.default_search_limit);
        search_messages(self.engine.as_ref(), query, limit).await
    }

    /// Replace engine documents by the export messages they were built from,
    /// keeping the engine's order.
    async fn hydrate(&self, chat_id: &str, docs: &[IndexedDocument]) -> Result<Vec<MessageView>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let mut files: Vec<String> = docs.iter().map(|d| d.file_path.clone()).collect();
        files.sort();
        files.dedup();
        let loaded = self.archive.load_messages(chat_id, &files).await?;

        let by_ts: HashMap<&str, &Message> = loaded
            .iter()
            .map(|m| (m.message.ts.as_str(), &m.message))
            .collect();

        let mut views = Vec::with_capacity(docs.len());
        for doc in docs {
            match by_ts.get(doc.ts.as_str()) {
                Some(message) => views.push(MessageView {
                    position: doc.has_position().then_some(doc.position),
                    message: (*message).clone(),
                }),
                None => {
                    tracing::warn!(chat_id, id = %doc.id, file = %doc.file_path, "indexed message missing from export");
                }
            }
        }
        Ok(views)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_offset_is_last_page() {
        assert_eq!(initial_offset(120, 50), 70);
        assert_eq!(initial_offset(20, 50), 0);
        assert_eq!(initial_offset(0, 50), 0);
    }
}
