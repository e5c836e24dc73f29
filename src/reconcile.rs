//! Dense per-chat message positions.
//!
//! Every top-level message of a chat carries a position in
//! `message_index_l`: the integers `0..n` assigned in ascending `ts` order.
//! A position is what a client scrolls to, so it must be stable and dense.
//! The positions live in the engine itself; there is no side table.
//!
//! After new files of a chat are indexed and committed, [`Reconciler::reconcile`]
//! restores that invariant:
//!
//! 1. Find the document holding the highest position.
//! 2. Fetch the document at that rank of the ts-ordered top-level sequence.
//!    When both have the same `ts` and no position below it is missing,
//!    every position up to it is trusted.
//! 3. Trusted and nothing new: done. Trusted and new messages all newer
//!    than the last good one: append positions after it (fast path).
//! 4. Otherwise reload every indexed file of the chat and renumber from zero
//!    (slow path). Indexed means recorded in the ledger or passed in as this
//!    run's new files; a file that appeared on disk since discovery has no
//!    documents yet and is left for the next run.
//!
//! The rank check in step 2 cannot see two messages with identical `ts`
//! swapping places below the maximum. Such a chat keeps its old order until
//! a later slow path.
//!
//! Position writes are committed once per run. Any failure rolls the engine
//! back, so a run either writes all of its positions or none.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use crate::archive::{ArchiveStore, FileMode};
use crate::engine::{EngineQuery, Filter, PositionUpdate, SearchEngine, Sort};
use crate::error::ArchiveError;
use crate::ledger::Ledger;
use crate::models::{document_id, LoadedMessage};

static FILE_DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9]{4}-[0-9]{2}-[0-9]{2}").expect("valid file date pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePath {
    NoOp,
    FastPath,
    SlowPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub path: ReconcilePath,
    /// Top-level messages loaded from disk.
    pub scanned: usize,
    /// Positions written.
    pub assigned: usize,
}

impl ReconcileOutcome {
    fn noop() -> Self {
        Self {
            path: ReconcilePath::NoOp,
            scanned: 0,
            assigned: 0,
        }
    }
}

/// Highest trusted position of a chat and the timestamp stored there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastGood {
    pub position: i64,
    pub ts_micros: i64,
}

pub struct Reconciler {
    engine: Arc<dyn SearchEngine>,
    archive: Arc<ArchiveStore>,
    ledger: Arc<Ledger>,
    write_batch: usize,
}

impl Reconciler {
    pub fn new(
        engine: Arc<dyn SearchEngine>,
        archive: Arc<ArchiveStore>,
        ledger: Arc<Ledger>,
        write_batch: usize,
    ) -> Self {
        Self {
            engine,
            archive,
            ledger,
            write_batch: write_batch.max(1),
        }
    }

    /// Bring the positions of `chat_id` up to date after `new_files` were
    /// indexed and committed.
    pub async fn reconcile(&self, chat_id: &str, new_files: &[String]) -> Result<ReconcileOutcome> {
        let last_good = self.last_known_good(chat_id).await?;
        let total = self.top_level_count(chat_id).await?;
        let next = last_good.map_or(0, |g| g.position + 1);

        if total as i64 == next {
            tracing::debug!(chat_id, total, "positions up to date");
            return Ok(ReconcileOutcome::noop());
        }

        let (path, messages, scanned) = match last_good {
            Some(good) => {
                let newer = self.newer_messages(chat_id, new_files, good).await?;
                if next + newer.len() as i64 == total as i64 {
                    let scanned = newer.len();
                    (ReconcilePath::FastPath, newer, scanned)
                } else {
                    tracing::warn!(
                        chat_id,
                        last_good = good.position,
                        new = newer.len(),
                        total,
                        "new messages do not extend the sequence; rebuilding positions"
                    );
                    self.all_messages(chat_id, new_files).await?
                }
            }
            None => self.all_messages(chat_id, new_files).await?,
        };

        let start = if path == ReconcilePath::FastPath { next } else { 0 };
        let updates: Vec<PositionUpdate> = messages
            .iter()
            .enumerate()
            .map(|(i, m)| PositionUpdate {
                id: document_id(chat_id, m.message.ts.as_str()),
                position: start + i as i64,
            })
            .collect();

        self.write(chat_id, &updates).await?;
        tracing::info!(chat_id, ?path, scanned, assigned = updates.len(), "positions reconciled");

        Ok(ReconcileOutcome {
            path,
            scanned,
            assigned: updates.len(),
        })
    }

    /// Steps 1 and 2: the highest position, if the document at that rank
    /// agrees with it.
    pub async fn last_known_good(&self, chat_id: &str) -> Result<Option<LastGood>> {
        let max = self
            .engine
            .query(
                &EngineQuery::top_level(chat_id)
                    .fields(&["message_index_l", "ts_us_l"])
                    .sort(Sort::PositionDesc)
                    .page(0, 1),
            )
            .await
            .context("Failed to query highest position")?;

        let Some(max_doc) = max.docs.into_iter().next().filter(|d| d.has_position()) else {
            return Ok(None);
        };

        let at_rank = self
            .engine
            .query(
                &EngineQuery::top_level(chat_id)
                    .fields(&["ts_us_l"])
                    .sort(Sort::TsAsc)
                    .page(max_doc.position as u64, 1),
            )
            .await
            .context("Failed to query document at highest position")?;

        match at_rank.docs.first() {
            Some(doc) if doc.ts == max_doc.ts => {}
            other => {
                let err = ArchiveError::Integrity {
                    chat_id: chat_id.to_string(),
                    detail: format!(
                        "position {} holds ts {} but rank {} is {}",
                        max_doc.position,
                        max_doc.ts,
                        max_doc.position,
                        other.map(|d| d.ts.as_str()).unwrap_or("empty")
                    ),
                };
                tracing::warn!(chat_id, error = %err, "untrusted positions");
                return Ok(None);
            }
        }

        // Re-indexed documents come back unassigned and leave holes below the
        // maximum that the rank check cannot see.
        let expected = max_doc.position + 1;
        let positioned = self
            .engine
            .query(
                &EngineQuery::top_level(chat_id)
                    .filter(Filter::PositionRange {
                        from: 0,
                        to: expected,
                    })
                    .page(0, 0),
            )
            .await
            .context("Failed to count positioned messages")?
            .num_found;
        if positioned as i64 != expected {
            let err = ArchiveError::Integrity {
                chat_id: chat_id.to_string(),
                detail: format!("{} of positions 0..{} assigned", positioned, expected),
            };
            tracing::warn!(chat_id, error = %err, "untrusted positions");
            return Ok(None);
        }

        Ok(Some(LastGood {
            position: max_doc.position,
            ts_micros: max_doc.ts_micros,
        }))
    }

    pub async fn top_level_count(&self, chat_id: &str) -> Result<u64> {
        let resp = self
            .engine
            .query(&EngineQuery::top_level(chat_id).page(0, 0))
            .await
            .context("Failed to count top-level messages")?;
        Ok(resp.num_found)
    }

    /// Top-level messages of `new_files` strictly newer than `good`.
    async fn newer_messages(
        &self,
        chat_id: &str,
        new_files: &[String],
        good: LastGood,
    ) -> Result<Vec<LoadedMessage>> {
        let files: Vec<String> = new_files
            .iter()
            .filter(|f| file_may_follow(f, good.ts_micros))
            .cloned()
            .collect();
        let loaded = self.archive.load_messages(chat_id, &files).await?;
        Ok(top_level(&loaded)
            .filter(|m| m.message.ts.as_micros() > good.ts_micros)
            .collect())
    }

    async fn all_messages(
        &self,
        chat_id: &str,
        new_files: &[String],
    ) -> Result<(ReconcilePath, Vec<LoadedMessage>, usize)> {
        let mut files = Vec::new();
        for file in self.archive.list_message_files(chat_id, FileMode::All).await? {
            if new_files.contains(&file) || self.ledger.is_processed(&file).await? {
                files.push(file);
            } else {
                tracing::debug!(chat_id, file = %file, "skipping file not indexed yet");
            }
        }
        let loaded = self.archive.load_messages(chat_id, &files).await?;
        let messages: Vec<LoadedMessage> = top_level(&loaded).collect();
        let scanned = messages.len();
        Ok((ReconcilePath::SlowPath, messages, scanned))
    }

    async fn write(&self, chat_id: &str, updates: &[PositionUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut result = Ok(());
        for chunk in updates.chunks(self.write_batch) {
            result = self.engine.set_positions(chunk).await;
            if result.is_err() {
                break;
            }
        }
        if result.is_ok() {
            result = self.engine.commit().await;
        }

        if let Err(e) = result {
            tracing::error!(chat_id, error = %e, "position update failed; rolling back");
            if let Err(rollback_err) = self.engine.rollback().await {
                tracing::error!(chat_id, error = %rollback_err, "engine rollback failed");
            }
            return Err(ArchiveError::Engine(e))
                .with_context(|| format!("Failed to write positions for chat {}", chat_id));
        }
        Ok(())
    }
}

/// Top-level messages, one per `ts`.
fn top_level(loaded: &[LoadedMessage]) -> impl Iterator<Item = LoadedMessage> + '_ {
    let mut seen = HashSet::new();
    loaded
        .iter()
        .filter(|m| m.message.is_top_level())
        .filter(move |m| seen.insert(m.message.ts.as_str()))
        .cloned()
}

/// Date embedded in a file name, e.g. `general/2024-01-31.json`.
pub fn file_date(file: &str) -> Option<NaiveDate> {
    let stem = Path::new(file).file_stem()?.to_str()?;
    let found = FILE_DATE_RE.find(stem)?;
    NaiveDate::parse_from_str(found.as_str(), "%Y-%m-%d").ok()
}

/// Whether `file` can hold messages newer than `after_micros`. A dated file
/// covers its whole UTC day; undated files always qualify.
pub fn file_may_follow(file: &str, after_micros: i64) -> bool {
    let Some(day) = file_date(file) else {
        return true;
    };
    let Some(next_midnight) = day.succ_opt().and_then(|d| d.and_hms_opt(0, 0, 0)) else {
        return true;
    };
    let end_of_day = next_midnight.and_utc().timestamp_micros() - 1;
    end_of_day > after_micros
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_dates() {
        assert_eq!(
            file_date("general/2024-01-31.json"),
            NaiveDate::from_ymd_opt(2024, 1, 31)
        );
        assert_eq!(
            file_date("general/export-2024-02-01-part2.json"),
            NaiveDate::from_ymd_opt(2024, 2, 1)
        );
        assert_eq!(file_date("general/messages.json"), None);
        assert_eq!(file_date("general/2024-13-40.json"), None);
        // Only the file name counts, not the directory.
        assert_eq!(file_date("2024-01-01/messages.json"), None);
    }

    #[test]
    fn dated_file_covers_whole_day() {
        // 2024-01-31T12:00:00Z
        let noon = 1_706_702_400_000_000;
        assert!(file_may_follow("c/2024-01-31.json", noon));
        assert!(file_may_follow("c/2024-02-01.json", noon));
        assert!(!file_may_follow("c/2024-01-30.json", noon));
        assert!(file_may_follow("c/undated.json", noon));

        // Last microsecond of the day.
        let end = 1_706_745_599_999_999;
        assert!(!file_may_follow("c/2024-01-31.json", end));
    }

    #[test]
    fn top_level_drops_replies_and_duplicates() {
        let msg = |ts: &str, thread: Option<&str>| LoadedMessage {
            message: serde_json::from_value(serde_json::json!({
                "ts": ts,
                "thread_ts": thread,
            }))
            .unwrap(),
            file_path: "f.json".into(),
        };
        let loaded = vec![
            msg("1.0", None),
            msg("2.0", Some("2.0")),
            msg("2.0", Some("2.0")),
            msg("3.0", Some("2.0")),
        ];
        let ts: Vec<String> = top_level(&loaded)
            .map(|m| m.message.ts.as_str().to_string())
            .collect();
        assert_eq!(ts, vec!["1.0", "2.0"]);
    }
}
