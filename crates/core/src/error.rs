//! Error taxonomy shared by the splitter, the retry engine and the queue.

use std::fmt;
use thiserror::Error;

/// Which validation pass produced a structural mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchScope {
    /// A single chunk, checked for exact cue-count equality.
    Chunk,
    /// The assembled document, checked against the tolerance band.
    Document,
}

impl fmt::Display for MismatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MismatchScope::Chunk => write!(f, "chunk"),
            MismatchScope::Document => write!(f, "document"),
        }
    }
}

/// Category of a failed remote call, derived from its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    InvalidCredential,
    RateLimit,
    SafetyBlock,
    Other,
}

const CREDENTIAL_HINTS: &[&str] = &[
    "api key not valid",
    "invalid api key",
    "incorrect api key",
    "unauthorized",
    "401",
];
const RATE_LIMIT_HINTS: &[&str] = &[
    "429",
    "rate limit",
    "quota",
    "resource_exhausted",
    "too many requests",
];
const SAFETY_HINTS: &[&str] = &["safety", "blocked", "content_filter"];

impl TransportKind {
    /// Classify a raw error message with case-insensitive substring checks.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        let hit = |hints: &[&str]| hints.iter().any(|h| lower.contains(h));
        if hit(CREDENTIAL_HINTS) {
            TransportKind::InvalidCredential
        } else if hit(RATE_LIMIT_HINTS) {
            TransportKind::RateLimit
        } else if hit(SAFETY_HINTS) {
            TransportKind::SafetyBlock
        } else {
            TransportKind::Other
        }
    }

    /// Message shown to the user for this category. `Other` passes the raw
    /// message through.
    pub fn user_message(&self, raw: &str) -> String {
        match self {
            TransportKind::InvalidCredential => {
                "The API key was rejected. Check the stored key and try again.".to_string()
            }
            TransportKind::RateLimit => {
                "Rate limit or quota reached.".to_string()
            }
            TransportKind::SafetyBlock => {
                "The translation was blocked by the provider's content safety filter.".to_string()
            }
            TransportKind::Other => raw.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("source document is empty")]
    EmptyInput,

    #[error("{}", transport_message(.kind, .message))]
    Transport { kind: TransportKind, message: String },

    #[error("{scope} cue count mismatch: expected {expected}, got {actual}")]
    StructuralMismatch {
        scope: MismatchScope,
        expected: usize,
        actual: usize,
    },

    #[error("chunk {chunk} failed after {attempts} attempts: {last}")]
    ChunkExhausted {
        chunk: usize,
        attempts: u32,
        last: Box<TranslateError>,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TranslateError {
    /// Build a transport error, classifying the message on the way in.
    pub fn transport(message: impl Into<String>) -> Self {
        let message = message.into();
        TranslateError::Transport {
            kind: TransportKind::classify(&message),
            message,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            TranslateError::Transport {
                kind: TransportKind::RateLimit,
                ..
            }
        )
    }
}

impl From<reqwest::Error> for TranslateError {
    fn from(err: reqwest::Error) -> Self {
        TranslateError::transport(err.to_string())
    }
}

fn transport_message(kind: &TransportKind, message: &str) -> String {
    kind.user_message(message)
}

pub type Result<T> = std::result::Result<T, TranslateError>;
