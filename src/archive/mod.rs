//! Read access to a Slack export on disk.
//!
//! Layout of an export:
//!
//! ```text
//! <base>/
//! ├── users.json
//! ├── channels.json   groups.json   dms.json   mpims.json
//! ├── general/
//! │   ├── 2024-01-01.json
//! │   └── 2024-01-02.json
//! └── D0123ABCD/
//!     └── 2024-01-01.json
//! ```
//!
//! Each chat subdirectory holds JSON files that are arrays of message
//! objects. The directory may be named after the chat's display name, its
//! technical name, or its id; [`ArchiveStore::resolve_chat_directory`] tries
//! them in that order.
//!
//! File paths handed out by this module are relative to the base directory
//! with `/` separators. They double as ledger keys and as the `file_path_s`
//! provenance stored with each document.

pub mod cache;
pub mod chats;

pub use cache::{ChatListCache, MessageCache};
pub use chats::{ExportMetadata, UserDirectory};

use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt};
use globset::{Glob, GlobMatcher};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use walkdir::WalkDir;

use crate::config::ArchiveConfig;
use crate::error::ArchiveError;
use crate::ledger::Ledger;
use crate::models::{ChatRecord, ExportConversation, ExportUser, LoadedMessage, Message};

/// Which message files of a chat to list.
#[derive(Clone, Copy)]
pub enum FileMode<'a> {
    All,
    /// Only files the ledger has not recorded yet.
    Unprocessed(&'a Ledger),
}

pub struct ArchiveStore {
    base: PathBuf,
    read_concurrency: usize,
    json_files: GlobMatcher,
    messages: MessageCache,
    chats: ChatListCache,
}

impl ArchiveStore {
    pub fn new(config: &ArchiveConfig) -> Result<Self> {
        let json_files = Glob::new("*.json")
            .context("Invalid message file pattern")?
            .compile_matcher();
        Ok(Self {
            base: config.path.clone(),
            read_concurrency: config.read_concurrency.max(1),
            json_files,
            messages: MessageCache::new(config.message_cache_size),
            chats: ChatListCache::new(Duration::from_secs(config.chat_list_ttl_secs)),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    pub fn message_cache(&self) -> &MessageCache {
        &self.messages
    }

    /// Read and parse a JSON file below the base directory.
    ///
    /// A file with no content (`[]`, `{}`, blank) is `None`.
    async fn read_json<T: DeserializeOwned>(&self, relative: &str) -> Result<Option<T>, ArchiveError> {
        let full = self.base.join(relative);
        let content = match tokio::fs::read_to_string(&full).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArchiveError::NotFound(relative.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if content.trim().len() <= 2 {
            return Ok(None);
        }
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| ArchiveError::malformed(relative, e))
    }

    /// A metadata list; exports omit the files for conversation kinds they
    /// do not contain.
    async fn metadata_list<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>> {
        match self.read_json(file).await {
            Ok(list) => Ok(list.unwrap_or_default()),
            Err(ArchiveError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to load {}", file)),
        }
    }

    async fn conversations(&self, file: &str) -> Result<Vec<ExportConversation>> {
        self.metadata_list(file).await
    }

    /// Entries of `users.json`; empty when the file is absent.
    pub async fn users(&self) -> Result<Vec<ExportUser>> {
        self.metadata_list("users.json").await
    }

    /// Nickname resolver built from `users.json`.
    pub async fn user_directory(&self) -> Result<UserDirectory> {
        Ok(UserDirectory::new(&self.users().await?))
    }

    pub async fn metadata(&self) -> Result<ExportMetadata> {
        let (channels, groups, dms, mpims) = tokio::try_join!(
            self.conversations("channels.json"),
            self.conversations("groups.json"),
            self.conversations("dms.json"),
            self.conversations("mpims.json"),
        )?;
        Ok(ExportMetadata {
            channels,
            groups,
            dms,
            mpims,
        })
    }

    /// Every chat of the export, named and sorted. Cached for the configured TTL.
    pub async fn chats(&self) -> Result<Arc<Vec<ChatRecord>>> {
        if let Some(cached) = self.chats.get() {
            return Ok(cached);
        }

        let (meta, users) = tokio::try_join!(self.metadata(), self.user_directory())?;
        let chats = Arc::new(chats::build_chat_list(&meta, &users));
        tracing::debug!(count = chats.len(), "chat list loaded");
        self.chats.store(chats.clone());
        Ok(chats)
    }

    pub async fn chat(&self, chat_id: &str) -> Result<Option<ChatRecord>> {
        let chats = self.chats().await?;
        Ok(chats.iter().find(|c| c.id == chat_id).cloned())
    }

    /// Directory holding the chat's message files, if any.
    ///
    /// Candidates are the display name, the technical name, and the id. An
    /// unknown chat or one without a directory yields `None`.
    pub async fn resolve_chat_directory(&self, chat_id: &str) -> Result<Option<PathBuf>> {
        let Some(chat) = self.chat(chat_id).await? else {
            tracing::warn!(chat_id, "chat not found in export metadata");
            return Ok(None);
        };

        let mut candidates: Vec<&str> = vec![chat.name.as_str()];
        if let Some(technical) = chat.technical_name.as_deref() {
            candidates.push(technical);
        }
        candidates.push(chat.id.as_str());
        candidates.dedup();

        for candidate in candidates {
            if !is_plain_dir_name(candidate) {
                continue;
            }
            let path = self.base.join(candidate);
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_dir() => return Ok(Some(path)),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::error!(chat_id, path = %path.display(), error = %e, "cannot access chat directory");
                }
            }
        }

        tracing::debug!(chat_id, "no message directory for chat");
        Ok(None)
    }

    /// Message files of a chat, relative to the base directory, sorted.
    pub async fn list_message_files(&self, chat_id: &str, mode: FileMode<'_>) -> Result<Vec<String>> {
        let Some(dir) = self.resolve_chat_directory(chat_id).await? else {
            return Ok(Vec::new());
        };

        let base = self.base.clone();
        let matcher = self.json_files.clone();
        let mut files = tokio::task::spawn_blocking(move || scan_message_files(&base, &dir, &matcher))
            .await
            .context("Message file scan panicked")??;
        files.sort();

        if let FileMode::Unprocessed(ledger) = mode {
            let mut unprocessed = Vec::with_capacity(files.len());
            for file in files {
                if !ledger.is_processed(&file).await? {
                    unprocessed.push(file);
                }
            }
            files = unprocessed;
        }
        Ok(files)
    }

    /// Load, merge, and ts-sort the messages of `files`.
    ///
    /// Files are read concurrently. A file that cannot be read or parsed is
    /// logged and skipped; messages without a valid `ts` are dropped. Equal
    /// timestamps keep file order.
    pub async fn load_messages(&self, chat_id: &str, files: &[String]) -> Result<Arc<Vec<LoadedMessage>>> {
        if files.is_empty() {
            return Ok(Arc::new(Vec::new()));
        }

        let key = (chat_id.to_string(), files.to_vec());
        if let Some(hit) = self.messages.get(&key) {
            return Ok(hit);
        }

        let results: Vec<_> = stream::iter(files)
            .map(|file| async move { (file, self.read_message_file(file).await) })
            .buffered(self.read_concurrency)
            .collect()
            .await;

        let mut loaded = Vec::new();
        for (file, result) in results {
            match result {
                Ok(messages) => loaded.extend(messages),
                Err(e) if e.is_tolerated() => {
                    tracing::warn!(chat_id, file = %file, error = %e, "skipping message file");
                }
                Err(e) => {
                    tracing::error!(chat_id, file = %file, error = %e, "skipping unreadable message file");
                }
            }
        }
        loaded.sort_by(|a, b| a.message.ts.cmp(&b.message.ts));

        let loaded = Arc::new(loaded);
        self.messages.insert(key, loaded.clone());
        Ok(loaded)
    }

    async fn read_message_file(&self, file: &str) -> Result<Vec<LoadedMessage>, ArchiveError> {
        let Some(value) = self.read_json::<Value>(file).await? else {
            return Ok(Vec::new());
        };
        let Value::Array(items) = value else {
            return Err(ArchiveError::malformed(file, "expected a JSON array of messages"));
        };

        let total = items.len();
        let messages: Vec<LoadedMessage> = items
            .into_iter()
            .filter_map(|item| serde_json::from_value::<Message>(item).ok())
            .map(|message| LoadedMessage {
                message,
                file_path: file.to_string(),
            })
            .collect();

        if messages.len() < total {
            tracing::debug!(file, dropped = total - messages.len(), "dropped messages without a valid ts");
        }
        Ok(messages)
    }
}

/// A directory name that cannot escape the base directory.
fn is_plain_dir_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

fn scan_message_files(base: &Path, dir: &Path, matcher: &GlobMatcher) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("Failed to scan {}", dir.display()))?;
        if !entry.file_type().is_file() || !matcher.is_match(entry.file_name()) {
            continue;
        }
        let relative = entry.path().strip_prefix(base).unwrap_or(entry.path());
        files.push(relative.to_string_lossy().replace('\\', "/"));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write(dir: &Path, relative: &str, value: Value) {
        let path = dir.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_string(&value).unwrap()).unwrap();
    }

    fn store(tmp: &TempDir) -> ArchiveStore {
        ArchiveStore::new(&ArchiveConfig::new(tmp.path())).unwrap()
    }

    fn export(tmp: &TempDir) {
        write(
            tmp.path(),
            "channels.json",
            json!([{"id": "C1", "name": "general"}, {"id": "C2", "name": "empty"}]),
        );
        write(tmp.path(), "users.json", json!([{"id": "U1", "name": "ann"}]));
    }

    #[tokio::test]
    async fn missing_metadata_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        assert!(store.chats().await.unwrap().is_empty());
        assert!(store.users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolves_directory_by_name_then_id() {
        let tmp = TempDir::new().unwrap();
        export(&tmp);
        std::fs::create_dir_all(tmp.path().join("general")).unwrap();
        std::fs::create_dir_all(tmp.path().join("C2")).unwrap();
        let store = store(&tmp);

        let dir = store.resolve_chat_directory("C1").await.unwrap().unwrap();
        assert!(dir.ends_with("general"));
        let dir = store.resolve_chat_directory("C2").await.unwrap().unwrap();
        assert!(dir.ends_with("C2"));
        assert!(store.resolve_chat_directory("C404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lists_only_json_files_sorted() {
        let tmp = TempDir::new().unwrap();
        export(&tmp);
        write(tmp.path(), "general/2024-01-02.json", json!([]));
        write(tmp.path(), "general/2024-01-01.json", json!([]));
        std::fs::write(tmp.path().join("general/notes.txt"), "x").unwrap();
        write(tmp.path(), "general/nested/2024-01-03.json", json!([]));
        let store = store(&tmp);

        let files = store.list_message_files("C1", FileMode::All).await.unwrap();
        assert_eq!(files, vec!["general/2024-01-01.json", "general/2024-01-02.json"]);
    }

    #[tokio::test]
    async fn unprocessed_mode_consults_ledger() {
        let tmp = TempDir::new().unwrap();
        export(&tmp);
        write(tmp.path(), "general/2024-01-01.json", json!([]));
        write(tmp.path(), "general/2024-01-02.json", json!([]));
        let store = store(&tmp);
        let ledger = Ledger::open(&tmp.path().join("ledger.db")).await.unwrap();
        ledger
            .mark_processed(&["general/2024-01-01.json".to_string()])
            .await
            .unwrap();

        let files = store
            .list_message_files("C1", FileMode::Unprocessed(&ledger))
            .await
            .unwrap();
        assert_eq!(files, vec!["general/2024-01-02.json"]);
    }

    #[tokio::test]
    async fn load_merges_sorts_and_skips_bad_input() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "general/b.json",
            json!([{"ts": "3.0", "text": "three"}, {"text": "no ts"}, {"ts": 4}]),
        );
        write(
            tmp.path(),
            "general/a.json",
            json!([{"ts": "1.0", "text": "one"}, {"ts": "2.5", "text": "two"}]),
        );
        std::fs::write(tmp.path().join("general/broken.json"), "[{\"ts\":").unwrap();
        write(tmp.path(), "general/object.json", json!({"ts": "9.0", "x": 1}));
        std::fs::write(tmp.path().join("general/empty.json"), " [] \n").unwrap();
        let store = store(&tmp);

        let files: Vec<String> = ["b", "a", "broken", "object", "empty", "missing"]
            .iter()
            .map(|f| format!("general/{}.json", f))
            .collect();
        let loaded = store.load_messages("C1", &files).await.unwrap();

        let ts: Vec<&str> = loaded.iter().map(|m| m.message.ts.as_str()).collect();
        assert_eq!(ts, vec!["1.0", "2.5", "3.0"]);
        assert_eq!(loaded[2].file_path, "general/b.json");
    }

    #[tokio::test]
    async fn odd_secondary_fields_keep_the_message() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "general/2024-01-01.json",
            json!([
                {"ts": "1.0"},
                {"ts": "2.0", "reactions": [{"count": 1, "users": ["U1"]}]},
                {"ts": "3.0", "replies": [{"user": "U1"}]},
                {"ts": "4.0", "reply_count": -1}
            ]),
        );
        let store = store(&tmp);

        let loaded = store
            .load_messages("C1", &["general/2024-01-01.json".to_string()])
            .await
            .unwrap();
        let ts: Vec<&str> = loaded.iter().map(|m| m.message.ts.as_str()).collect();
        assert_eq!(ts, vec!["1.0", "2.0", "3.0", "4.0"]);
        assert_eq!(loaded[3].message.extra["reply_count"], json!(-1));
    }

    #[tokio::test]
    async fn load_is_cached_per_file_list() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "general/a.json", json!([{"ts": "1.0"}]));
        let store = store(&tmp);
        let files = vec!["general/a.json".to_string()];

        let first = store.load_messages("C1", &files).await.unwrap();
        std::fs::remove_file(tmp.path().join("general/a.json")).unwrap();
        let second = store.load_messages("C1", &files).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.message_cache().len(), 1);
    }

    #[test]
    fn rejects_path_like_names() {
        assert!(is_plain_dir_name("general"));
        assert!(is_plain_dir_name("Alice & Bob"));
        assert!(!is_plain_dir_name(".."));
        assert!(!is_plain_dir_name("a/b"));
        assert!(!is_plain_dir_name(""));
    }
}
