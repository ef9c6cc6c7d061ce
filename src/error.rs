use std::{fmt, io};

use regex::Error as RegexError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::GraphEvent;

/// Coarse classification of a [GraphError], used by callers to decide between reporting the
/// fault, treating it as a defect, asking the participant to retry, or silently unwinding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultClass {
    /// The requested operation violated an invariant. Only that operation is aborted.
    Validation,
    /// A programming defect, such as re-entering the resolution gate.
    Internal,
    /// Missing, unreadable, locked or externally modified documents.
    Io,
    /// Normal early exit of a cancellable task.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum GraphError {
    #[error("Duplicate record: {0}")]
    DuplicateRecord(String),
    #[error("Relation cycle: {0}")]
    RelationCycle(String),
    #[error("Relation rejected: {0}")]
    RelationRejected(String),
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),
    #[error("Search key '{key}' is too short (minimum {min} characters)")]
    SearchKeyTooShort { key: String, min: usize },
    #[error("Search key '{key}' is already used by {owner}")]
    SearchKeyDuplicate { key: String, owner: String },
    #[error("Invalid tag: {0}")]
    InvalidTag(String),
    #[error("Invalid item in {record}: unrecognized element '{element}'")]
    InvalidItem { record: String, element: String },
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("Protected record: {0}")]
    Protected(String),
    #[error("Internal invariant violated: {0}")]
    Internal(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Document format error: {0}")]
    Format(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("Document was modified outside of this application: {0}")]
    ChecksumMismatch(String),
    #[error("Database is locked by another instance: {0}")]
    Locked(String),
    #[error("Operation cancelled")]
    OperationCancelled,
}

impl GraphError {
    pub fn fault_class(&self) -> FaultClass {
        match self {
            GraphError::DuplicateRecord(_) => FaultClass::Validation,
            GraphError::RelationCycle(_) => FaultClass::Validation,
            GraphError::RelationRejected(_) => FaultClass::Validation,
            GraphError::TypeMismatch(_) => FaultClass::Validation,
            GraphError::SearchKeyTooShort { .. } => FaultClass::Validation,
            GraphError::SearchKeyDuplicate { .. } => FaultClass::Validation,
            GraphError::InvalidTag(_) => FaultClass::Validation,
            GraphError::InvalidItem { .. } => FaultClass::Validation,
            GraphError::NotFound(_) => FaultClass::Validation,
            GraphError::Protected(_) => FaultClass::Validation,
            GraphError::Internal(_) => FaultClass::Internal,
            GraphError::Io(_) => FaultClass::Io,
            GraphError::Format(_) => FaultClass::Io,
            GraphError::Serialization(_) => FaultClass::Io,
            GraphError::ChecksumMismatch(_) => FaultClass::Io,
            GraphError::Locked(_) => FaultClass::Io,
            GraphError::OperationCancelled => FaultClass::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.fault_class() == FaultClass::Cancelled
    }
}

impl From<toml::de::Error> for GraphError {
    fn from(src: toml::de::Error) -> GraphError {
        GraphError::Format(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for GraphError {
    fn from(src: toml::ser::Error) -> GraphError {
        GraphError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<toml_edit::TomlError> for GraphError {
    fn from(src: toml_edit::TomlError) -> GraphError {
        GraphError::Format(format!("Toml parse error: {src}"))
    }
}

impl From<base64::DecodeError> for GraphError {
    fn from(src: base64::DecodeError) -> GraphError {
        GraphError::Serialization(format!("Base64 decoding failed: {src}"))
    }
}

impl From<argon2::Error> for GraphError {
    fn from(src: argon2::Error) -> GraphError {
        GraphError::Serialization(format!("Key derivation failed: {src}"))
    }
}

impl From<getrandom::Error> for GraphError {
    fn from(src: getrandom::Error) -> GraphError {
        GraphError::Internal(format!("Random source unavailable: {src}"))
    }
}

impl From<io::Error> for GraphError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => GraphError::Io(format!("Not found: {x}")),
            io::ErrorKind::PermissionDenied => GraphError::Io(format!("Permission denied: {x}")),
            _ => GraphError::Io(format!("IOError: {}", x.kind())),
        }
    }
}

impl From<fmt::Error> for GraphError {
    fn from(x: fmt::Error) -> Self {
        GraphError::Serialization(format!("{x}"))
    }
}

impl From<RegexError> for GraphError {
    fn from(x: RegexError) -> Self {
        GraphError::Internal(format!("Regex construction failed: {x}"))
    }
}

impl From<tokio::sync::mpsc::error::SendError<GraphEvent>> for GraphError {
    fn from(x: tokio::sync::mpsc::error::SendError<GraphEvent>) -> Self {
        GraphError::Io(format!(
            "Channel update send Error, could not transmit graph event {:?}",
            x.0
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_fault_classes() {
        assert_eq!(
            GraphError::SearchKeyTooShort {
                key: "ab".to_string(),
                min: 3
            }
            .fault_class(),
            FaultClass::Validation
        );
        assert_eq!(
            GraphError::Internal("nested resolve".to_string()).fault_class(),
            FaultClass::Internal
        );
        assert_eq!(
            GraphError::ChecksumMismatch("people.toml".to_string()).fault_class(),
            FaultClass::Io
        );
        assert!(GraphError::OperationCancelled.is_cancelled());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: GraphError = io::Error::new(io::ErrorKind::NotFound, "people.toml").into();
        assert!(matches!(err, GraphError::Io(_)));
        assert!(err.to_string().contains("people.toml"));
    }
}
