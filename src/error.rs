//! Error types for the Trusted Agent Protocol gateway and authority

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway and authority errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (including a corrupted CA store)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A CSR's self-signature does not verify against its own public key
    #[error("CSR signature verification failed: {0}")]
    CsrSignatureInvalid(String),

    /// Certificate generation, parsing or encoding failed
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// A peer or embedded certificate does not chain to the trust root
    #[error("Certificate chain invalid: {0}")]
    CertificateChainInvalid(String),

    /// A detached HTTP message signature failed verification
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// The Registry has no (usable) key for this key id
    #[error("Public Key {0} not found")]
    KeyNotFound(String),

    /// The Registry has no agent with this identity
    #[error("Agent {0} not found")]
    AgentNotFound(String),

    /// Malformed request line or headers on the inbound socket
    #[error("Framing error: {0}")]
    Framing(String),

    /// The request body is larger than the gateway accepts
    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    /// Relay to the upstream service failed
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The Registry answered with something other than 200/404
    #[error("Registry error: {0}")]
    Registry(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status surfaced to a client for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::CertificateChainInvalid(_)
            | Self::SignatureInvalid(_)
            | Self::KeyNotFound(_)
            | Self::AgentNotFound(_) => StatusCode::FORBIDDEN,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Upstream(_) | Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
