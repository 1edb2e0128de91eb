//! Recording error types
//!
//! One error enum covers every failure a control surface can observe. Lower
//! layers produce the variants and the controller routes them unchanged, so a
//! CLI exit code or an HTTP envelope can be derived from [`RecordError::kind`]
//! alone.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure kinds surfaced by the recording core
///
/// - Structured variants for each failure mode of the session lifecycle
/// - Serde support so remote clients receive a tagged error
/// - Automatic conversion from common error types
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "message")]
pub enum RecordError {
    /// A session identifier is empty or unsafe for path construction
    #[error("Invalid identifier '{field}': {reason}")]
    InvalidIdentifier { field: String, reason: String },

    /// The board name is not in the board catalogue
    #[error("Boardname {0} is unknown")]
    UnknownBoard(String),

    /// The board already has an active recording
    #[error("{0} is already recording")]
    AlreadyRecording(String),

    /// The board has no active recording
    #[error("{0} had no active sessions to stop")]
    NotRecording(String),

    /// The board session was asked for a transition its state does not allow
    #[error("Cannot {action} {board} while {state}")]
    InvalidTransition {
        board: String,
        action: String,
        state: String,
    },

    /// Transport or driver failure while talking to the board
    #[error("Failed to connect to {board}: {message}")]
    ConnectionError { board: String, message: String },

    /// The data file already exists and overwriting was not requested
    #[error("A file already exists at {0}. Delete it or enter different session information")]
    PathConflict(String),

    /// Filesystem failure while writing a recording
    #[error("IO error: {0}")]
    IoError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Metadata serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl RecordError {
    /// Stable snake_case tag for the failure kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidIdentifier { .. } => "invalid_identifier",
            Self::UnknownBoard(_) => "unknown_board",
            Self::AlreadyRecording(_) => "already_recording",
            Self::NotRecording(_) => "not_recording",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::ConnectionError { .. } => "connection_error",
            Self::PathConflict(_) => "path_conflict",
            Self::IoError(_) => "io_error",
            Self::ConfigError(_) => "config_error",
            Self::SerializationError(_) => "serialization_error",
        }
    }

    pub(crate) fn invalid_identifier(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn connection(board: &str, message: impl std::fmt::Display) -> Self {
        Self::ConnectionError {
            board: board.to_string(),
            message: message.to_string(),
        }
    }
}

/// Convert RecordError to String for surfaces that only carry text
impl From<RecordError> for String {
    fn from(error: RecordError) -> String {
        error.to_string()
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, RecordError>;

// Automatic conversions from common error types
impl From<std::io::Error> for RecordError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for RecordError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for RecordError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::ConfigError(err.to_string())
    }
}

impl From<csv::Error> for RecordError {
    fn from(err: csv::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(
            RecordError::invalid_identifier("sub", "empty").kind(),
            "invalid_identifier"
        );
        assert_eq!(
            RecordError::AlreadyRecording("SYNTHETIC_BOARD".into()).kind(),
            "already_recording"
        );
        assert_eq!(RecordError::PathConflict("x".into()).kind(), "path_conflict");
    }

    #[test]
    fn test_messages_match_operator_wording() {
        assert_eq!(
            RecordError::UnknownBoard("FOO".into()).to_string(),
            "Boardname FOO is unknown"
        );
        assert_eq!(
            RecordError::NotRecording("SYNTHETIC_BOARD".into()).to_string(),
            "SYNTHETIC_BOARD had no active sessions to stop"
        );
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(RecordError::NotRecording("B".into())).unwrap();
        assert_eq!(json["type"], "NotRecording");
        assert_eq!(json["message"], "B");
    }

    #[test]
    fn test_io_conversion() {
        let err: RecordError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert_eq!(err.kind(), "io_error");
        assert!(err.to_string().contains("disk full"));
    }
}
