//! Error types for intent classification, persistence and resolution.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for intent engine operations
pub type Result<T> = std::result::Result<T, IntentError>;

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR TAXONOMY
// ═══════════════════════════════════════════════════════════════════════════════

/// Classification of every failure an intent can end in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No parser pattern matched the trigger.
    InvalidFormat,
    /// The user must log in first. The intent is queued, not failed.
    NotAuthenticated,
    /// The backend does not know the id.
    NotFound,
    /// The request or token is past its validity window.
    Expired,
    /// The request or token was already used.
    AlreadyProcessed,
    /// The backend could not be reached.
    Network,
    /// The backend did not answer within the resolution timeout.
    Timeout,
    /// Anything the backend reported that has no dedicated kind.
    Unknown,
}

impl ErrorKind {
    /// Backend-confirmed (or parser-confirmed) outcomes that will not change on retry.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::InvalidFormat | Self::NotFound | Self::Expired | Self::AlreadyProcessed
        )
    }

    /// Failures caused by connectivity rather than by the intent itself.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Network | Self::Timeout)
    }

    /// Whether a failure of this kind removes the durable pending entry.
    pub fn clears_pending(self) -> bool {
        self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidFormat => "invalid_format",
            Self::NotAuthenticated => "not_authenticated",
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::AlreadyProcessed => "already_processed",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }

    /// Fixed text shown to the user for this kind.
    ///
    /// Transient kinds share one generic message and never expose technical detail.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::InvalidFormat => "This code or link isn't a recognized payment or transfer.",
            Self::NotAuthenticated => "Sign in to continue.",
            Self::NotFound => "This payment request or transfer could not be found.",
            Self::Expired => "This payment request or transfer has expired.",
            Self::AlreadyProcessed => "This payment request or transfer has already been completed.",
            Self::Network | Self::Timeout | Self::Unknown => {
                "Something went wrong. Please try again."
            }
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BACKEND BOUNDARY
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors reported by the backend collaborator.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("expired")]
    Expired,

    #[error("already processed")]
    AlreadyProcessed,

    #[error("not found")]
    NotFound,

    #[error("network unreachable: {0}")]
    Network(String),

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Map an upstream response onto the taxonomy.
    ///
    /// Error codes take precedence over the HTTP status; unrecognized
    /// combinations fall through to [`BackendError::Other`].
    pub fn from_upstream(status: Option<u16>, code: Option<&str>, message: &str) -> Self {
        if let Some(code) = code {
            match code.to_ascii_uppercase().as_str() {
                "EXPIRED" | "TOKEN_EXPIRED" | "REQUEST_EXPIRED" => return Self::Expired,
                "ALREADY_PROCESSED" | "ALREADY_USED" | "ALREADY_COMPLETED" | "TOKEN_USED" => {
                    return Self::AlreadyProcessed
                }
                "NOT_FOUND" | "TOKEN_NOT_FOUND" | "REQUEST_NOT_FOUND" => return Self::NotFound,
                _ => {}
            }
        }

        match status {
            Some(404) => Self::NotFound,
            Some(409) => Self::AlreadyProcessed,
            Some(410) => Self::Expired,
            Some(408) | Some(502) | Some(503) | Some(504) => Self::Network(message.to_string()),
            _ => Self::Other(message.to_string()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Expired => ErrorKind::Expired,
            Self::AlreadyProcessed => ErrorKind::AlreadyProcessed,
            Self::NotFound => ErrorKind::NotFound,
            Self::Network(_) => ErrorKind::Network,
            Self::Other(_) => ErrorKind::Unknown,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENGINE ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors surfaced by the intent engine and its components.
#[derive(Debug, Error)]
pub enum IntentError {
    #[error("unrecognized trigger: {0}")]
    InvalidFormat(String),

    #[error("resolution failed ({kind}): {detail}")]
    Resolution { kind: ErrorKind, detail: String },

    #[error("pending-intent store error: {0}")]
    Storage(String),

    #[error("illegal transition: {0}")]
    IllegalTransition(&'static str),

    #[error("card {0} is not eligible for this payment")]
    UnknownCard(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IntentError {
    /// The taxonomy kind for errors that have one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::InvalidFormat(_) => Some(ErrorKind::InvalidFormat),
            Self::Resolution { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<sled::Error> for IntentError {
    fn from(err: sled::Error) -> Self {
        IntentError::Storage(err.to_string())
    }
}

impl From<BackendError> for IntentError {
    fn from(err: BackendError) -> Self {
        IntentError::Resolution {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}
