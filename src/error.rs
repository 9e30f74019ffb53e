use thiserror::Error;

use crate::node::NodeTree;

/// Main library error type that encompasses all recoverable failure modes
#[derive(Error, Debug)]
pub enum SoapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Loading failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("Malformed XML document at byte {position}: {message}")]
    MalformedDocument {
        position: u64,
        message: String,
        /// Whatever part of the tree had been built when decoding stopped
        partial: Box<NodeTree>,
    },

    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Node tree is not convertible to a dictionary: repeated sibling '{name}'")]
    NotProjectable { name: String },

    #[error("Invalid SOAP envelope: {details}")]
    InvalidEnvelope { details: String },

    #[error("Invalid request: {details}")]
    InvalidRequest { details: String },

    #[error("A load is already in flight on this engine")]
    RunInProgress,

    #[error("Unit extraction worker failed: {details}")]
    Worker { details: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SoapError {
    /// Partial tree carried by a malformed-document failure
    pub fn partial_tree(&self) -> Option<&NodeTree> {
        match self {
            SoapError::MalformedDocument { partial, .. } => Some(partial),
            _ => None,
        }
    }

    /// Number of connection attempts attached to a terminal loading failure
    pub fn attempts(&self) -> Option<u32> {
        match self {
            SoapError::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

/// Connection-level error types
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request timeout: {url} after {timeout_seconds} seconds")]
    Timeout { url: String, timeout_seconds: u64 },

    #[error("Connection error: {url} - {details}")]
    Connection { url: String, details: String },

    #[error("Authentication challenge received (realm: {realm:?})")]
    AuthenticationChallenge { realm: Option<String> },

    #[error("Response stream error: {details}")]
    Stream { details: String },

    #[error("Request could not be issued: {details}")]
    InvalidRequest { details: String },
}

impl TransportError {
    /// Check if a failed exchange may be attempted again
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Http(reqwest_error) => {
                // Retry on network errors and timeouts, but not on invalid URLs or builder errors
                reqwest_error.is_timeout()
                    || reqwest_error.is_connect()
                    || reqwest_error.is_request()
                    || reqwest_error.is_body()
                    || reqwest_error.is_decode()
            }
            TransportError::Timeout { .. } => true,
            TransportError::Connection { .. } => true,
            TransportError::Stream { .. } => true,
            TransportError::AuthenticationChallenge { .. } => false,
            TransportError::InvalidRequest { .. } => false,
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, SoapError>;

/// Transport result type alias
pub type TransportResult<T> = std::result::Result<T, TransportError>;
