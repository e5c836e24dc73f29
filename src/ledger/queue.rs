//! Batching front end for the ledger.
//!
//! Paths are collected until one of three triggers fires: the batch reaches
//! its size threshold, the oldest pending path has waited for the idle
//! timeout, or the owner shuts the queue down. Measuring from the oldest path
//! bounds how long an indexed file can stay unrecorded, however steadily new
//! paths keep arriving. The queue then moves to `Flushing`, commits the
//! batch, and returns to `Collecting`. There are no background timers; the
//! owner drives idle flushes by calling [`LedgerQueue::tick`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::Ledger;
use crate::error::ArchiveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Collecting,
    Flushing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Idle,
    Shutdown,
}

pub struct LedgerQueue {
    ledger: Arc<Ledger>,
    pending: Vec<String>,
    state: QueueState,
    batch_size: usize,
    idle_timeout: Duration,
    pending_since: Option<Instant>,
}

impl LedgerQueue {
    pub fn new(ledger: Arc<Ledger>, batch_size: usize, idle_timeout: Duration) -> Self {
        Self {
            ledger,
            pending: Vec::new(),
            state: QueueState::Collecting,
            batch_size: batch_size.max(1),
            idle_timeout,
            pending_since: None,
        }
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Add paths to the current batch. Flushes when the size threshold is
    /// reached and returns the number of paths committed, if any.
    pub async fn enqueue<I>(&mut self, paths: I) -> Result<Option<usize>, ArchiveError>
    where
        I: IntoIterator<Item = String>,
    {
        self.pending.extend(paths);
        if self.pending_since.is_none() && !self.pending.is_empty() {
            self.pending_since = Some(Instant::now());
        }

        if self.pending.len() >= self.batch_size {
            return self.flush(FlushTrigger::Size).await.map(Some);
        }
        Ok(None)
    }

    /// Flush if the oldest pending path has waited at least the idle timeout.
    pub async fn tick(&mut self) -> Result<Option<usize>, ArchiveError> {
        let idle = self
            .pending_since
            .map(|at| at.elapsed() >= self.idle_timeout)
            .unwrap_or(false);
        if idle && !self.pending.is_empty() {
            return self.flush(FlushTrigger::Idle).await.map(Some);
        }
        Ok(None)
    }

    /// Commit whatever is pending.
    pub async fn shutdown(&mut self) -> Result<usize, ArchiveError> {
        self.flush(FlushTrigger::Shutdown).await
    }

    async fn flush(&mut self, trigger: FlushTrigger) -> Result<usize, ArchiveError> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        self.state = QueueState::Flushing;
        let batch = std::mem::take(&mut self.pending);
        tracing::debug!(?trigger, count = batch.len(), "flushing ledger batch");

        let result = self.ledger.mark_processed(&batch).await;
        self.state = QueueState::Collecting;

        match result {
            Ok(()) => {
                self.pending_since = None;
                Ok(batch.len())
            }
            Err(e) => {
                // Keep the failed batch ahead of anything enqueued since.
                let newer = std::mem::replace(&mut self.pending, batch);
                self.pending.extend(newer);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn queue(batch_size: usize, idle: Duration) -> (TempDir, Arc<Ledger>, LedgerQueue) {
        let tmp = TempDir::new().unwrap();
        let ledger = Arc::new(Ledger::open(&tmp.path().join("p.db")).await.unwrap());
        let queue = LedgerQueue::new(ledger.clone(), batch_size, idle);
        (tmp, ledger, queue)
    }

    #[tokio::test]
    async fn flushes_at_size_threshold() {
        let (_tmp, ledger, mut queue) = queue(3, Duration::from_secs(60)).await;

        let flushed = queue
            .enqueue(vec!["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(flushed, None);
        assert!(!ledger.is_processed("a").await.unwrap());

        let flushed = queue.enqueue(vec!["c".to_string()]).await.unwrap();
        assert_eq!(flushed, Some(3));
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.state(), QueueState::Collecting);
        assert!(ledger.is_processed("a").await.unwrap());
        assert!(ledger.is_processed("c").await.unwrap());
    }

    #[tokio::test]
    async fn tick_flushes_after_idle_timeout() {
        let (_tmp, ledger, mut queue) = queue(100, Duration::from_millis(40)).await;

        queue.enqueue(vec!["a".to_string()]).await.unwrap();
        assert_eq!(queue.tick().await.unwrap(), None);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(queue.tick().await.unwrap(), Some(1));
        assert!(ledger.is_processed("a").await.unwrap());

        // Nothing pending: further ticks are no-ops.
        assert_eq!(queue.tick().await.unwrap(), None);
    }

    #[tokio::test]
    async fn steady_enqueues_do_not_postpone_idle_flush() {
        let (_tmp, ledger, mut queue) = queue(100, Duration::from_millis(50)).await;

        queue.enqueue(vec!["c1/a.json".to_string()]).await.unwrap();
        assert_eq!(queue.tick().await.unwrap(), None);

        tokio::time::sleep(Duration::from_millis(120)).await;
        queue.enqueue(vec!["c2/a.json".to_string()]).await.unwrap();
        assert_eq!(queue.tick().await.unwrap(), Some(2));
        assert!(ledger.is_processed("c1/a.json").await.unwrap());
        assert!(ledger.is_processed("c2/a.json").await.unwrap());
    }

    #[tokio::test]
    async fn shutdown_flushes_remainder() {
        let (_tmp, ledger, mut queue) = queue(100, Duration::from_secs(60)).await;

        queue.enqueue(vec!["a".to_string()]).await.unwrap();
        assert_eq!(queue.shutdown().await.unwrap(), 1);
        assert!(ledger.is_processed("a").await.unwrap());
        assert_eq!(queue.shutdown().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_flush_keeps_paths_pending() {
        let (_tmp, ledger, mut queue) = queue(2, Duration::from_secs(60)).await;
        sqlx::query(
            "CREATE TRIGGER reject_b BEFORE INSERT ON processed_files WHEN NEW.path = 'b' \
             BEGIN SELECT RAISE(ABORT, 'nope'); END",
        )
        .execute(ledger.pool())
        .await
        .unwrap();

        let result = queue.enqueue(vec!["a".to_string(), "b".to_string()]).await;
        assert!(result.is_err());
        assert_eq!(queue.pending(), 2);
        assert_eq!(queue.state(), QueueState::Collecting);
        assert!(!ledger.is_processed("a").await.unwrap());
    }
}
