//! Key material shared by the authority and the gateway.
//!
//! Agents may hold RSA, EC P-256 or Ed25519 keys. Whatever the curve, the
//! rest of the crate only sees two types:
//!
//! - [`PublicKeyMaterial`]: a verification key built from a certificate's
//!   `SubjectPublicKeyInfo` or from a JSON Web Key, exposing
//!   `public_key_pem()`, `to_jwk()` and `verify()`.
//! - [`SigningKeyMaterial`]: a private key (the CA root, or an agent key in
//!   tests and tooling) exposing `to_pem()`, `public_key_pem()` and
//!   `to_jwk()`.
//!
//! This keeps the key-resolution step of the authorization engine
//! algorithm-agnostic.

pub mod jwk;
pub mod material;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use jwk::Jwk;
pub use material::{PublicKeyMaterial, SigningKeyMaterial};

/// Key material errors.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Key type / curve not supported.
    #[error("unsupported key: {0}")]
    Unsupported(String),

    /// Key bytes or JWK members are malformed.
    #[error("malformed key: {0}")]
    Malformed(String),

    /// Declared signature algorithm does not fit the key.
    #[error("algorithm {alg} cannot be used with a {key_type} key")]
    AlgorithmMismatch {
        /// Requested algorithm name.
        alg: String,
        /// Key type of the resolved key.
        key_type: &'static str,
    },

    /// Cryptographic verification failed.
    #[error("signature verification failed")]
    BadSignature,

    /// Key generation or serialisation failed.
    #[error("key generation failed: {0}")]
    Generation(String),
}

/// Key generation algorithm for authority-owned keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    /// 2048-bit RSA with SHA-256 signatures.
    #[default]
    Rsa2048,
    /// ECDSA over P-256 with SHA-256.
    EcdsaP256,
    /// Ed25519.
    Ed25519,
}

impl KeyAlgorithm {
    /// The `rcgen` signature algorithm used for generation and signing.
    #[must_use]
    pub fn rcgen_algorithm(self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            Self::Rsa2048 => &rcgen::PKCS_RSA_SHA256,
            Self::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Self::Ed25519 => &rcgen::PKCS_ED25519,
        }
    }
}

/// RFC 9421 signature algorithms accepted by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    /// `ed25519`
    Ed25519,
    /// `ecdsa-p256-sha256` (fixed-width `r || s`)
    EcdsaP256Sha256,
    /// `rsa-v1_5-sha256`
    RsaV15Sha256,
    /// `rsa-pss-sha512`
    RsaPssSha512,
}

impl SignatureAlgorithm {
    /// Parse an RFC 9421 `alg` parameter value.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ed25519" => Some(Self::Ed25519),
            "ecdsa-p256-sha256" => Some(Self::EcdsaP256Sha256),
            "rsa-v1_5-sha256" => Some(Self::RsaV15Sha256),
            "rsa-pss-sha512" => Some(Self::RsaPssSha512),
            _ => None,
        }
    }

    /// The RFC 9421 registry name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
            Self::EcdsaP256Sha256 => "ecdsa-p256-sha256",
            Self::RsaV15Sha256 => "rsa-v1_5-sha256",
            Self::RsaPssSha512 => "rsa-pss-sha512",
        }
    }
}
