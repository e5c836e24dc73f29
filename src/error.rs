//! Error taxonomy shared by the archive, ledger, reconciler, and pipeline.
//!
//! Most functions return `anyhow::Result` and attach context as they go.
//! [`ArchiveError`] is the typed layer underneath for the cases where a caller
//! has to branch on the category: a missing chat directory is an empty
//! result, a malformed file is skipped, and a ledger failure must stop the
//! run from claiming files it never recorded.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Absent chat, directory, or file. Callers treat this as an empty result.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unparseable file or message. Skipped and logged, never fatal.
    #[error("malformed {}: {}", path.display(), reason)]
    Malformed { path: PathBuf, reason: String },

    /// Filesystem or network failure worth retrying on the next run.
    #[error("transient I/O error: {0}")]
    Transient(#[from] std::io::Error),

    /// Position sequence does not match the engine contents.
    #[error("position integrity check failed for chat {chat_id}: {detail}")]
    Integrity { chat_id: String, detail: String },

    /// Ledger initialization or commit failure.
    #[error("ledger error: {0}")]
    Ledger(#[from] sqlx::Error),

    #[error("search engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ArchiveError {
    pub fn malformed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        ArchiveError::Malformed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// NotFound and Malformed never abort a batch.
    pub fn is_tolerated(&self) -> bool {
        matches!(
            self,
            ArchiveError::NotFound(_) | ArchiveError::Malformed { .. }
        )
    }
}

/// Failures talking to the search engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// 4xx other than 429. Retrying the same request will not help.
    #[error("engine rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// 429 or 5xx.
    #[error("engine server error ({status}): {body}")]
    Server { status: u16, body: String },

    #[error("engine request timed out")]
    Timeout,

    #[error("engine unavailable")]
    Unavailable,

    #[error("engine request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected engine response: {0}")]
    Decode(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Server { .. } | EngineError::Timeout | EngineError::Unavailable
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ArchiveError::NotFound("chat C1".to_string());
        assert_eq!(err.to_string(), "not found: chat C1");

        let err = ArchiveError::malformed("general/2024-01-01.json", "expected array");
        assert_eq!(
            err.to_string(),
            "malformed general/2024-01-01.json: expected array"
        );
    }

    #[test]
    fn tolerated_categories() {
        assert!(ArchiveError::NotFound("x".into()).is_tolerated());
        assert!(ArchiveError::malformed("f", "bad").is_tolerated());
        assert!(!ArchiveError::Config("x".into()).is_tolerated());
    }

    #[test]
    fn io_error_is_transient() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: ArchiveError = io_err.into();
        assert!(matches!(err, ArchiveError::Transient(_)));
    }

    #[test]
    fn retryable_engine_errors() {
        assert!(EngineError::Timeout.is_retryable());
        assert!(EngineError::Server {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!EngineError::Rejected {
            status: 400,
            body: String::new()
        }
        .is_retryable());
    }
}
