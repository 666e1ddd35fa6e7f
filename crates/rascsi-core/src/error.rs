//! Error types for the RaSCSI control plane.
//!
//! Every failure maps onto a stable [`ErrorKind`] so that the presentation
//! layer can pick a localized message without parsing strings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error taxonomy shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    TransportUnavailable,
    PeerClosed,
    MalformedFrame,
    EngineRejected,
    TypeMismatch,
    InvalidArgument,
    InvalidPath,
    #[serde(rename = "IOFailure")]
    IoFailure,
    CommandFailure,
    Timeout,
    NoFilesSpecified,
    NoFilesExtracted,
    ArchiveCommandFailure,
    ArchiveOutputUnparseable,
    InvalidConfigFormat,
}

impl ErrorKind {
    /// Returns the stable identifier used in envelopes and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransportUnavailable => "TransportUnavailable",
            ErrorKind::PeerClosed => "PeerClosed",
            ErrorKind::MalformedFrame => "MalformedFrame",
            ErrorKind::EngineRejected => "EngineRejected",
            ErrorKind::TypeMismatch => "TypeMismatch",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::InvalidPath => "InvalidPath",
            ErrorKind::IoFailure => "IOFailure",
            ErrorKind::CommandFailure => "CommandFailure",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::NoFilesSpecified => "NoFilesSpecified",
            ErrorKind::NoFilesExtracted => "NoFilesExtracted",
            ErrorKind::ArchiveCommandFailure => "ArchiveCommandFailure",
            ErrorKind::ArchiveOutputUnparseable => "ArchiveOutputUnparseable",
            ErrorKind::InvalidConfigFormat => "InvalidConfigFormat",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for control plane operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Every connect attempt to the engine failed.
    #[error("engine at {endpoint} unavailable after {attempts} attempts: {message}")]
    TransportUnavailable {
        endpoint: String,
        attempts: u32,
        message: String,
    },

    /// The peer closed the connection in the middle of a payload.
    #[error("connection closed after {received} of {expected} payload bytes")]
    PeerClosed { received: usize, expected: usize },

    /// The response did not start with a complete length header.
    #[error("malformed frame: {message}")]
    MalformedFrame { message: String },

    /// Declared frame length exceeds the allocation budget.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Protobuf encode/decode failure.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// The engine answered with `status = false`.
    #[error("{message}")]
    EngineRejected { message: String },

    /// Attempt to insert media of one removable type into a device of another.
    #[error("cannot insert an image for {requested} into a {current} device")]
    TypeMismatch { requested: String, current: String },

    /// A caller-supplied argument is out of range or malformed.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A caller-supplied path is absolute or escapes its root.
    #[error("invalid path: {}", path.display())]
    InvalidPath { path: PathBuf },

    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP download failure.
    #[error("HTTP error: {message}")]
    Http { message: String },

    /// External program exited unsuccessfully.
    #[error("{program} failed: {stderr}")]
    CommandFailure { program: String, stderr: String },

    /// External program exceeded its time budget and was killed.
    #[error("{operation} timed out: {stderr}")]
    Timeout { operation: String, stderr: String },

    #[error("no files specified for extraction")]
    NoFilesSpecified,

    #[error("no files were extracted")]
    NoFilesExtracted,

    /// The archiver exited unsuccessfully.
    #[error("archive command failed: {message}")]
    ArchiveCommandFailure { message: String },

    /// The archiver produced output that could not be interpreted.
    #[error("unexpected archive tool output: {message}")]
    ArchiveOutputUnparseable { message: String },

    /// Configuration snapshot is neither the current nor the legacy shape.
    #[error("invalid configuration file format: {message}")]
    InvalidConfigFormat { message: String },

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Map this error onto the stable taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TransportUnavailable { .. } => ErrorKind::TransportUnavailable,
            Error::PeerClosed { .. } => ErrorKind::PeerClosed,
            Error::MalformedFrame { .. } | Error::FrameTooLarge { .. } | Error::Codec { .. } => {
                ErrorKind::MalformedFrame
            }
            Error::EngineRejected { .. } => ErrorKind::EngineRejected,
            Error::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            Error::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Error::InvalidPath { .. } => ErrorKind::InvalidPath,
            Error::Io(_) | Error::Http { .. } | Error::Json(_) => ErrorKind::IoFailure,
            Error::CommandFailure { .. } => ErrorKind::CommandFailure,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::NoFilesSpecified => ErrorKind::NoFilesSpecified,
            Error::NoFilesExtracted => ErrorKind::NoFilesExtracted,
            Error::ArchiveCommandFailure { .. } => ErrorKind::ArchiveCommandFailure,
            Error::ArchiveOutputUnparseable { .. } => ErrorKind::ArchiveOutputUnparseable,
            Error::InvalidConfigFormat { .. } => ErrorKind::InvalidConfigFormat,
        }
    }

    /// Returns true if retrying the whole request may help.
    ///
    /// Only connect failures qualify: once bytes are on the wire the engine
    /// may have acted on the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransportUnavailable { .. })
    }

    /// Shorthand for [`Error::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::EngineRejected`].
    pub fn rejected(message: impl Into<String>) -> Self {
        Error::EngineRejected {
            message: message.into(),
        }
    }
}

/// Convenience result type for control plane operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_engine_rejected_is_verbatim() {
        let err = Error::rejected("Device ID 1 is already in use");
        assert_eq!(err.to_string(), "Device ID 1 is already in use");
    }

    #[test]
    fn error_display_type_mismatch() {
        let err = Error::TypeMismatch {
            requested: "SCMO".into(),
            current: "SCCD".into(),
        };
        assert_eq!(
            err.to_string(),
            "cannot insert an image for SCMO into a SCCD device"
        );
    }

    #[test]
    fn frame_errors_share_a_kind() {
        assert_eq!(
            Error::FrameTooLarge { size: 10, max: 1 }.kind(),
            ErrorKind::MalformedFrame
        );
        assert_eq!(
            Error::Codec {
                message: "bad".into()
            }
            .kind(),
            ErrorKind::MalformedFrame
        );
        assert_eq!(
            Error::PeerClosed {
                received: 0,
                expected: 4
            }
            .kind(),
            ErrorKind::PeerClosed
        );
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.kind(), ErrorKind::IoFailure);
    }

    #[test]
    fn only_connect_failures_are_transient() {
        assert!(
            Error::TransportUnavailable {
                endpoint: "localhost:6868".into(),
                attempts: 20,
                message: "refused".into()
            }
            .is_transient()
        );
        assert!(
            !Error::PeerClosed {
                received: 1,
                expected: 2
            }
            .is_transient()
        );
        assert!(
            !Error::MalformedFrame {
                message: "short".into()
            }
            .is_transient()
        );
        assert!(!Error::rejected("no").is_transient());
    }

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(ErrorKind::IoFailure.to_string(), "IOFailure");
        assert_eq!(ErrorKind::InvalidPath.as_str(), "InvalidPath");
    }
}
