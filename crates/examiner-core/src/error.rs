//! Error types for the examiner client
//!
//! Provides the error taxonomy shared by every component:
//! - Missing document roles (validation)
//! - Exhausted allowance (gating)
//! - Unreachable or failing remote calls
//! - Unreadable documents and malformed payloads
//! - Local storage and configuration failures

use crate::document::DocumentRole;

/// Convenience result alias
pub type Result<T, E = ExaminerError> = std::result::Result<T, E>;

/// Main examiner error type
#[derive(Debug, thiserror::Error)]
pub enum ExaminerError {
    /// A required document role is not populated
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The entitlement gate denied the submission
    #[error("gate denied: {0}")]
    Gate(#[from] GateError),

    /// Usage, marking or link call unreachable or non-success
    #[error("network error: {0}")]
    Network(String),

    /// Document unreadable or payload malformed
    #[error("decode error: {0}")]
    Decode(String),

    /// Local store read or write failed
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Cooperative cancellation observed
    #[error("operation cancelled")]
    Cancelled,

    /// Anything uncategorized
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl ExaminerError {
    /// Classify the error
    #[inline]
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Gate(_) => ErrorKind::Gate,
            Self::Network(_) => ErrorKind::Network,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Config(_) => ErrorKind::Config,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Check if re-invoking the operation may succeed without user input
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Unknown(_))
    }

    /// Check if the error should be reported to the user
    ///
    /// Cancellation only happens when something newer superseded the work.
    #[inline]
    #[must_use]
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    /// Notice to show the user, `None` if the error is not user-visible
    ///
    /// Validation and gate errors carry their own explanation. Everything
    /// else collapses into the generic marking failure text.
    #[must_use]
    pub fn notice(&self) -> Option<Notice> {
        let notice = match self {
            Self::Validation(ValidationError::MissingDocument(role)) => Notice::warning(
                "Missing document",
                format!("Upload a {} before marking.", role.label()),
            ),
            Self::Gate(GateError::AllowanceExhausted { allowance_max }) => Notice::warning(
                "Allowance used up",
                format!("All {allowance_max} free markings have been used."),
            ),
            Self::Cancelled => return None,
            _ => Notice::error("Error", "Something went wrong while marking the paper."),
        };
        Some(notice)
    }

    /// Create a network error from any displayable cause
    #[inline]
    pub fn network(cause: impl std::fmt::Display) -> Self {
        Self::Network(cause.to_string())
    }

    /// Create a decode error from any displayable cause
    #[inline]
    pub fn decode(cause: impl std::fmt::Display) -> Self {
        Self::Decode(cause.to_string())
    }
}

impl From<reqwest::Error> for ExaminerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExaminerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Submission validation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Document role not selected
    #[error("missing {} document", .0.label())]
    MissingDocument(DocumentRole),
}

/// Entitlement gate errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    /// No remaining allowance
    #[error("allowance exhausted (max: {allowance_max})")]
    AllowanceExhausted { allowance_max: u32 },
}

/// Error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing document role
    Validation,
    /// Allowance exhausted
    Gate,
    /// Remote call failed
    Network,
    /// Unreadable document or malformed payload
    Decode,
    /// Local store failure
    Storage,
    /// Invalid configuration
    Config,
    /// Superseded or shut down
    Cancelled,
    /// Uncategorized
    Unknown,
}

/// Severity of a user-visible notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeLevel {
    /// Informational
    Info,
    /// Recoverable by correcting input or waiting
    Warning,
    /// Operation failed
    Error,
}

/// User-visible notice raised by the submission flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// Severity
    pub level: NoticeLevel,
    /// Short title
    pub title: String,
    /// Human-readable description
    pub description: String,
}

impl Notice {
    /// Create a warning notice
    #[inline]
    pub fn warning(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            title: title.into(),
            description: description.into(),
        }
    }

    /// Create an error notice
    #[inline]
    pub fn error(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            title: title.into(),
            description: description.into(),
        }
    }

    /// Create an informational notice
    #[inline]
    pub fn info(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            title: title.into(),
            description: description.into(),
        }
    }
}
