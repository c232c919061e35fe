use shared::StoreError;
use thiserror::Error;

/// Errors surfaced by the synchronization layer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    #[error("display name must not be empty")]
    EmptyDisplayName,
    #[error("chat message must not be empty")]
    EmptyMessage,
    #[error("not joined to a game")]
    NotJoined,
    #[error("already joined as {0}")]
    AlreadyJoined(String),
    #[error("store rejected the operation: {0}")]
    Store(String),
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend connection closed")]
    Closed,
    #[error("could not join game: {0}")]
    JoinFailed(Box<SyncError>),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

impl From<bincode::Error> for SyncError {
    fn from(e: bincode::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

impl SyncError {
    /// Validation failures are raised before any network call is made.
    pub fn is_validation(&self) -> bool {
        matches!(self, SyncError::EmptyDisplayName | SyncError::EmptyMessage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors() {
        assert!(SyncError::EmptyDisplayName.is_validation());
        assert!(SyncError::EmptyMessage.is_validation());
        assert!(!SyncError::Timeout.is_validation());
    }

    #[test]
    fn test_join_failure_keeps_cause() {
        let error = SyncError::JoinFailed(Box::new(SyncError::Timeout));
        assert_eq!(error.to_string(), "could not join game: request timed out");
    }
}
