#![forbid(unsafe_code)]

//! Failure classification shared by every layer.
//!
//! Each module keeps its own `thiserror` enum with the context it needs, but
//! they all collapse into one [`ErrorKind`] so callers (the HTTP layer, the
//! CLI) can branch on the class of failure without matching on every variant.

use serde::Serialize;

/// Why the external extraction tool failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailureKind {
    /// Private, removed, region-locked or otherwise unreachable video.
    SourceUnavailable,
    /// DNS, TLS, connection resets and upstream 5xx responses.
    Network,
    /// The binary vanished between construction and spawn.
    BinaryMissing,
    /// Rejected by the `--max-filesize` cap.
    FileTooLarge,
    Generic,
}

impl ToolFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SourceUnavailable => "source_unavailable",
            Self::Network => "network",
            Self::BinaryMissing => "binary_missing",
            Self::FileTooLarge => "file_too_large",
            Self::Generic => "generic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    DuplicateTitle,
    Timeout,
    ExternalToolFailure(ToolFailureKind),
    ToolNotInstalled,
    EmptyOutput,
    UploadFailure,
    PersistenceFailure,
    Unauthorized,
    Conflict,
    Internal,
}

impl ErrorKind {
    /// Stable machine-readable label used in API responses and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::DuplicateTitle => "duplicate_title",
            Self::Timeout => "timeout",
            Self::ExternalToolFailure(_) => "external_tool_failure",
            Self::ToolNotInstalled => "tool_not_installed",
            Self::EmptyOutput => "empty_output",
            Self::UploadFailure => "upload_failure",
            Self::PersistenceFailure => "persistence_failure",
            Self::Unauthorized => "unauthorized",
            Self::Conflict => "conflict",
            Self::Internal => "internal",
        }
    }
}
