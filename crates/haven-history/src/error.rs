use thiserror::Error;

use crate::store::IndexPath;

/// Failure of one paginated fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("history fetch failed: {0}")]
    Failed(String),
    /// Superseded by a newer fetch or scenario. Never shown to the user.
    #[error("history fetch cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Failed(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum HistoryError {
    /// A row referenced by a deferred operation is gone. Logged, never fatal.
    #[error("no row at {0}")]
    Inconsistent(IndexPath),
    #[error("anchor storage: {0}")]
    Storage(#[from] anyhow::Error),
    /// The history actor has shut down.
    #[error("history actor closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, HistoryError>;
