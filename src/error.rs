use http::StatusCode;
use thiserror::Error;

/// Upstream explicitly refused a CONNECT request.
///
/// Only produced when the upstream answered with a non-200 status; network
/// failures never take this shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Upstream rejected tunnel with status {status_code}: {reason}")]
pub struct TransportError {
    pub status_code: u16,
    pub reason: String,
}

impl TransportError {
    pub fn new(status_code: u16, reason: impl Into<String>) -> Self {
        Self {
            status_code,
            reason: reason.into(),
        }
    }
}

/// Unified error type for the transport layer
#[derive(Error, Debug)]
pub enum RotaError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    // Upstream rejections
    #[error(transparent)]
    Transport(#[from] TransportError),

    // Local / network errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Malformed CONNECT response: {0}")]
    MalformedResponse(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Tunnel attempt cancelled")]
    Cancelled,

    // Request errors
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("HTTP error: {0}")]
    Http(String),

    // Registry errors
    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("Transport already registered: {0}")]
    DuplicateTransport(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, RotaError>;

impl RotaError {
    /// Status a routing layer should answer the client with
    pub fn status_code(&self) -> StatusCode {
        match self {
            // Keep whatever the upstream said
            RotaError::Transport(e) => {
                StatusCode::from_u16(e.status_code).unwrap_or(StatusCode::BAD_GATEWAY)
            }

            // 504 Gateway Timeout
            RotaError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 502 Bad Gateway
            RotaError::Io(_)
            | RotaError::Tls(_)
            | RotaError::MalformedResponse(_)
            | RotaError::Http(_)
            | RotaError::Cancelled => StatusCode::BAD_GATEWAY,

            // 400 Bad Request
            RotaError::InvalidUrl(_) | RotaError::InvalidHeader(_) => StatusCode::BAD_REQUEST,

            // 500 Internal Server Error
            RotaError::InvalidConfig(_)
            | RotaError::UnsupportedProtocol(_)
            | RotaError::TransportNotFound(_)
            | RotaError::DuplicateTransport(_)
            | RotaError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Fatal errors detectable before any I/O happens
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            RotaError::InvalidConfig(_) | RotaError::UnsupportedProtocol(_)
        )
    }

    /// The upstream was reachable but refused the tunnel
    pub fn is_upstream_rejection(&self) -> bool {
        matches!(self, RotaError::Transport(_))
    }

    /// The upstream could not be reached or the connection broke locally
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            RotaError::Io(_)
                | RotaError::Tls(_)
                | RotaError::MalformedResponse(_)
                | RotaError::Timeout
                | RotaError::Cancelled
        )
    }

    /// Upstream rejection details, if this is one
    pub fn as_transport_error(&self) -> Option<&TransportError> {
        match self {
            RotaError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

// Convert from hyper errors
impl From<hyper::Error> for RotaError {
    fn from(err: hyper::Error) -> Self {
        RotaError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for RotaError {
    fn from(err: url::ParseError) -> Self {
        RotaError::InvalidUrl(err.to_string())
    }
}
