use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Flat classification of a stage failure, as recorded on a file's outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or unreadable file, permission failure
    Io,
    /// Separation or ASR failure (including model timeouts)
    Model,
    /// Network, timeout or rate-limit failure from an LLM/search/translation API
    Api,
    /// Identification or verification confidence below threshold
    ConfidenceRejected,
    /// Malformed LRC/JSON/transcript content
    Format,
    /// The lyrics searcher found nothing for the resolved title/artist
    NotFound,
    /// The batch was interrupted before the file finished
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Io => "io",
            Self::Model => "model",
            Self::Api => "api",
            Self::ConfidenceRejected => "confidence_rejected",
            Self::Format => "format",
            Self::NotFound => "not_found",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error produced by a stage runner or one of its collaborators
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("model error: {0}")]
    Model(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("confidence {score:.2} rejected: {reason}")]
    ConfidenceRejected { score: f64, reason: String },

    #[error("format error: {0}")]
    Format(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cancelled before completion")]
    Cancelled,
}

impl StageError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::Model(_) => ErrorKind::Model,
            Self::Api(_) => ErrorKind::Api,
            Self::ConfidenceRejected { .. } => ErrorKind::ConfidenceRejected,
            Self::Format(_) => ErrorKind::Format,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<std::io::Error> for StageError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            context: "I/O failure".to_string(),
            source,
        }
    }
}

impl From<serde_json::Error> for StageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Format(err.to_string())
    }
}

impl From<reqwest::Error> for StageError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Api(format!("request timed out: {err}"))
        } else {
            Self::Api(err.to_string())
        }
    }
}
