use crate::model::{Id, InstanceStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Coarse classification handed to the transport layer for status mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidType,
    InvalidProperty,
    VersionConflict,
    DuplicateKey,
    SynchronizationConflict,
    InvalidState,
    StatusNotSupported,
    Propagation,
    Storage,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{what} '{id}' not found")]
    NotFound { what: &'static str, id: String },

    #[error("unknown or unusable type '{type_name}': {reason}")]
    InvalidType { type_name: String, reason: String },

    #[error("invalid properties for type '{type_name}': {}", problems.join("; "))]
    InvalidProperty {
        type_name: String,
        problems: Vec<String>,
    },

    #[error("version conflict on {guid}: expected {expected}, stored {actual}")]
    VersionConflict { guid: Id, expected: u64, actual: u64 },

    #[error("external identifier '{external_identifier}' in system '{external_system_id}' is already correlated with {existing_guid}")]
    DuplicateKey {
        external_system_id: String,
        external_identifier: String,
        existing_guid: Id,
    },

    #[error("change to {guid} still conflicted after {attempts} attempts")]
    SynchronizationConflict { guid: Id, attempts: u32 },

    #[error("invalid state for {guid}: {reason}")]
    InvalidState { guid: Id, reason: String },

    #[error("status {status:?} is not supported by type '{type_name}'")]
    StatusNotSupported {
        type_name: String,
        status: InstanceStatus,
    },

    #[error("propagation of {external_identifier} to '{external_system_id}' failed: {message}")]
    Propagation {
        external_system_id: String,
        external_identifier: String,
        message: String,
    },

    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        SyncError::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn invalid_state(guid: &Id, reason: impl Into<String>) -> Self {
        SyncError::InvalidState {
            guid: guid.clone(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotFound { .. } => ErrorKind::NotFound,
            SyncError::InvalidType { .. } => ErrorKind::InvalidType,
            SyncError::InvalidProperty { .. } => ErrorKind::InvalidProperty,
            SyncError::VersionConflict { .. } => ErrorKind::VersionConflict,
            SyncError::DuplicateKey { .. } => ErrorKind::DuplicateKey,
            SyncError::SynchronizationConflict { .. } => ErrorKind::SynchronizationConflict,
            SyncError::InvalidState { .. } => ErrorKind::InvalidState,
            SyncError::StatusNotSupported { .. } => ErrorKind::StatusNotSupported,
            SyncError::Propagation { .. } => ErrorKind::Propagation,
            SyncError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether repeating the same call may succeed without caller changes
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::VersionConflict | ErrorKind::Propagation | ErrorKind::Storage
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_and_retryability() {
        let conflict = SyncError::VersionConflict {
            guid: "g-1".to_string(),
            expected: 1,
            actual: 2,
        };
        assert_eq!(conflict.kind(), ErrorKind::VersionConflict);
        assert!(conflict.is_retryable());

        let missing = SyncError::not_found("instance", "g-2");
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert!(!missing.is_retryable());
        assert_eq!(missing.to_string(), "instance 'g-2' not found");

        let storage: SyncError = anyhow::anyhow!("connection reset").into();
        assert_eq!(storage.kind(), ErrorKind::Storage);
        assert!(storage.is_retryable());
    }

    #[test]
    fn test_invalid_property_message_lists_problems() {
        let err = SyncError::InvalidProperty {
            type_name: "Glossary".to_string(),
            problems: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "invalid properties for type 'Glossary': a; b"
        );
    }
}
