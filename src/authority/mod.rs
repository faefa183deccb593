//! Certificate authority.
//!
//! Owns the root key pair and the self-signed root certificate, signs agent
//! CSRs into client certificates, and serves both over a small HTTP surface.
//! The root is generated once and, when a data directory is configured,
//! persisted as `ca-key.pem` / `ca-cert.pem` and reloaded verbatim.

pub mod ca;
pub mod server;
pub mod store;

pub use ca::{CertificateAuthority, csr_common_name};
pub use server::{SignRequest, create_router, serve};
pub use store::{CaStore, StoredRoot};
