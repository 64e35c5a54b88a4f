//! Error types for the card request worker.

use std::fmt;

/// Top-level error type for the worker process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised by the message broker adapter.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Failed to connect to broker at {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Broker session is not connected")]
    NotConnected,

    #[error("Failed to consume from queue {queue}: {reason}")]
    Consume { queue: String, reason: String },

    #[error("Delivery stream failed: {0}")]
    Delivery(String),

    #[error("Failed to acknowledge delivery {delivery_tag}: {reason}")]
    Ack { delivery_tag: u64, reason: String },
}

/// Approval notification could not be put on the bus.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Failed to serialize approval notification: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Publish to exchange {exchange} failed: {reason}")]
    Send { exchange: String, reason: String },

    #[error("Broker refused approval on exchange {exchange}")]
    Nacked { exchange: String },
}

/// Transport-level failure of the card-generation call.
///
/// HTTP error statuses are not represented here; only failures to complete
/// the exchange or to read a JSON body are.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("Request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("Malformed response from {url} (status {status}): {reason}")]
    InvalidBody {
        url: String,
        status: u16,
        reason: String,
    },
}

/// Envelope body is not parseable JSON.
#[derive(Debug, thiserror::Error)]
#[error("Message body is not valid JSON: {0}")]
pub struct DecodeError(#[from] pub serde_json::Error);

/// Why a single field failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldProblem {
    Missing,
    WrongType { expected: &'static str },
}

/// One offending field of a card request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub field: &'static str,
    pub problem: FieldProblem,
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.problem {
            FieldProblem::Missing => write!(f, "{}: field required", self.field),
            FieldProblem::WrongType { expected } => {
                write!(f, "{}: expected {expected}", self.field)
            }
        }
    }
}

/// Body is structurally parseable but does not match the card request schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Request body must be a JSON object")]
    NotAnObject,

    #[error("Invalid card request: {}", join_issues(.0))]
    Fields(Vec<FieldIssue>),
}

impl ValidationError {
    /// Offending fields, empty when the body was not an object at all.
    pub fn issues(&self) -> &[FieldIssue] {
        match self {
            Self::NotAnObject => &[],
            Self::Fields(issues) => issues,
        }
    }
}

fn join_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;
