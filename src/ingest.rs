//! Indexing pipeline orchestration.
//!
//! One pass walks every chat of the export in order:
//!
//! 1. List the chat's files the ledger has not recorded ([`Pipeline::discover_work`]).
//! 2. Load them, project each message into a document, and submit the
//!    documents in batches.
//! 3. Commit the engine.
//! 4. Reconcile the chat's positions.
//! 5. Hand the files to the ledger queue.
//!
//! A chat only reaches the ledger after steps 2 to 4 all succeeded. Any
//! failure before that leaves its files unrecorded, so the next pass picks
//! them up again; upserts by id make the repeat harmless. A failed chat marks
//! the run degraded but the pass continues with the next chat. Ledger
//! failures are the exception: they abort the pass, and so does a failure to
//! list the export up front.
//!
//! The ledger queue is ticked before each chat and after each hand-off, so a
//! batch never waits much longer than the idle timeout behind slow chats.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::archive::{ArchiveStore, FileMode, UserDirectory};
use crate::config::Config;
use crate::engine::SearchEngine;
use crate::extract::extract_document;
use crate::ledger::{Ledger, LedgerQueue};
use crate::models::{ChatRecord, IndexedDocument};
use crate::reconcile::{ReconcileOutcome, ReconcilePath, Reconciler};

/// Unprocessed files of one chat.
#[derive(Debug, Clone)]
pub struct ChatWork {
    pub chat: ChatRecord,
    pub files: Vec<String>,
}

/// Summary of one indexing pass.
#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    pub chats_seen: usize,
    pub chats_indexed: usize,
    pub chats_failed: usize,
    pub documents_submitted: usize,
    pub documents_failed: usize,
    pub files_marked: usize,
    /// Ledger commits during the pass, the final shutdown flush included.
    pub ledger_flushes: usize,
    pub fast_paths: usize,
    pub slow_paths: usize,
    pub degraded: bool,
    pub errors: Vec<String>,
    pub duration: Duration,
}

impl IndexReport {
    fn chat_failed(&mut self, chat_id: &str, err: &anyhow::Error) {
        tracing::error!(chat_id, error = %format!("{:#}", err), "chat indexing failed");
        self.chats_failed += 1;
        self.degraded = true;
        self.errors.push(format!("{}: {:#}", chat_id, err));
    }

    fn flushed(&mut self, marked: Option<usize>) {
        if let Some(marked) = marked {
            self.files_marked += marked;
            self.ledger_flushes += 1;
        }
    }

    fn record(&mut self, outcome: &ReconcileOutcome) {
        match outcome.path {
            ReconcilePath::FastPath => self.fast_paths += 1,
            ReconcilePath::SlowPath => self.slow_paths += 1,
            ReconcilePath::NoOp => {}
        }
    }
}

pub struct Pipeline {
    archive: Arc<ArchiveStore>,
    engine: Arc<dyn SearchEngine>,
    ledger: Arc<Ledger>,
    reconciler: Reconciler,
    batch_size: usize,
    ledger_batch_size: usize,
    idle_flush: Duration,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        archive: Arc<ArchiveStore>,
        engine: Arc<dyn SearchEngine>,
        ledger: Arc<Ledger>,
    ) -> Self {
        let reconciler = Reconciler::new(
            engine.clone(),
            archive.clone(),
            ledger.clone(),
            config.indexing.batch_size,
        );
        Self {
            archive,
            engine,
            ledger,
            reconciler,
            batch_size: config.indexing.batch_size.max(1),
            ledger_batch_size: config.ledger.batch_size,
            idle_flush: Duration::from_secs(config.ledger.idle_flush_secs),
        }
    }

    /// Chats with at least one file the ledger has not recorded.
    pub async fn discover_work(&self) -> Result<Vec<ChatWork>> {
        let chats = self.archive.chats().await?;
        let mut work = Vec::new();
        for chat in chats.iter() {
            let files = self
                .archive
                .list_message_files(&chat.id, FileMode::Unprocessed(&self.ledger))
                .await
                .with_context(|| format!("Failed to list files for chat {}", chat.id))?;
            if !files.is_empty() {
                work.push(ChatWork {
                    chat: chat.clone(),
                    files,
                });
            }
        }
        Ok(work)
    }

    /// Run one indexing pass over the whole export.
    pub async fn run(&self) -> Result<IndexReport> {
        let started = Instant::now();
        let mut report = IndexReport::default();
        let mut queue = LedgerQueue::new(self.ledger.clone(), self.ledger_batch_size, self.idle_flush);

        let users = self.archive.user_directory().await?;
        report.chats_seen = self.archive.chats().await?.len();
        let work = self.discover_work().await?;
        tracing::info!(chats = report.chats_seen, pending = work.len(), "indexing pass started");

        for ChatWork { chat, files } in &work {
            // The previous chat may have taken long enough for the batch to age out.
            report.flushed(queue.tick().await?);
            tracing::info!(chat_id = %chat.id, chat = %chat.name, files = files.len(), "indexing chat");

            if let Err(e) = self.index_chat(chat, files, &users, &mut report).await {
                report.chat_failed(&chat.id, &e);
                continue;
            }

            match self.reconciler.reconcile(&chat.id, files).await {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    report.chat_failed(&chat.id, &e);
                    continue;
                }
            }

            report.flushed(queue.enqueue(files.iter().cloned()).await?);
            report.flushed(queue.tick().await?);
            report.chats_indexed += 1;
        }

        if let Err(e) = self.engine.commit().await {
            tracing::error!(error = %e, "final engine commit failed");
            report.degraded = true;
            report.errors.push(format!("final commit: {}", e));
        }
        let marked = queue.shutdown().await?;
        report.flushed((marked > 0).then_some(marked));
        report.duration = started.elapsed();

        tracing::info!(
            chats_indexed = report.chats_indexed,
            chats_failed = report.chats_failed,
            documents = report.documents_submitted,
            documents_failed = report.documents_failed,
            files_marked = report.files_marked,
            degraded = report.degraded,
            elapsed_ms = report.duration.as_millis() as u64,
            "indexing pass finished"
        );
        Ok(report)
    }

    /// Submit and commit the documents of `files`. All batches must land;
    /// otherwise uncommitted work is rolled back and an error returned.
    async fn index_chat(
        &self,
        chat: &ChatRecord,
        files: &[String],
        users: &UserDirectory,
        report: &mut IndexReport,
    ) -> Result<()> {
        let loaded = self.archive.load_messages(&chat.id, files).await?;
        let docs: Vec<IndexedDocument> = loaded
            .iter()
            .map(|m| extract_document(m, chat, users))
            .collect();

        let mut failed_batches = 0;
        for batch in docs.chunks(self.batch_size) {
            match self.engine.add(batch).await {
                Ok(()) => report.documents_submitted += batch.len(),
                Err(e) => {
                    tracing::error!(chat_id = %chat.id, size = batch.len(), error = %e, "batch submit failed");
                    report.documents_failed += batch.len();
                    failed_batches += 1;
                }
            }
        }

        if failed_batches > 0 {
            if let Err(e) = self.engine.rollback().await {
                tracing::error!(chat_id = %chat.id, error = %e, "engine rollback failed");
            }
            bail!("{} batch(es) failed to submit", failed_batches);
        }

        self.engine
            .commit()
            .await
            .with_context(|| format!("Failed to commit chat {}", chat.id))?;
        tracing::debug!(chat_id = %chat.id, documents = docs.len(), "chat committed");
        Ok(())
    }
}
