//! Trusted Agent Protocol
//!
//! Autonomous agents authenticate to a backend through a trust gateway,
//! using mutual TLS client certificates or HTTP message signatures, both
//! rooted in a certificate authority and an external agent Registry.
//!
//! # Components
//!
//! - **Certificate authority** ([`authority`]): root key lifecycle, CSR
//!   signing, `/authority/cert` and `/authority/sign` endpoints
//! - **Trust gateway** ([`gateway`]): raw-socket HTTP/1.1 framing, two-path
//!   authorization, streaming relay to the upstream service
//! - **Message signatures** ([`signature`]): RFC 9421 verification
//! - **Key material** ([`keys`]): RSA, P-256 and Ed25519 keys as PEM and JWK
//! - **mTLS plumbing** ([`mtls`]): rustls server config, chain verification

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authority;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod keys;
pub mod mtls;
pub mod signature;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` overrides `level` when set.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
