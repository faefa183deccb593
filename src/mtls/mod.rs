//! Mutual TLS plumbing for the trust gateway.
//!
//! # Architecture
//!
//! ```text
//! TCP connection
//!   → TLS handshake  (rustls requests a client cert, checks possession only)
//!   → peer certificate handed to the authorization engine
//!   → CertIdentity extracted (CN = agent id)
//!   → RootCertificate::verify, or Registry fallback by agent id
//! ```
//!
//! # Modules
//!
//! - [`cert_manager`]: rustls config building, PEM loading, PEM output
//! - [`identity`]: X.509 identity field extraction (`CertIdentity`)
//! - [`chain`]: trust-root certificate and chain verification

pub mod cert_manager;
pub mod chain;
pub mod identity;

pub use cert_manager::{GeneratedCert, build_tls_config, load_certs, load_private_key};
pub use chain::{RootCertificate, VerifiedCertificate};
pub use identity::CertIdentity;
