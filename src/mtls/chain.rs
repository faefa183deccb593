//! Trust-root certificate and single-level chain verification.
//!
//! The hierarchy is flat: every agent certificate is signed directly by the
//! root, so a chain check is one signature check plus issuer and validity
//! checks.

use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use rustls::pki_types::pem::PemObject;
use tracing::trace;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::keys::PublicKeyMaterial;
use crate::mtls::identity::CertIdentity;
use crate::{Error, Result};

/// A parsed CA root certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootCertificate {
    pem: String,
    der: Vec<u8>,
    identity: CertIdentity,
}

/// A leaf that chains to the root.
#[derive(Debug, Clone)]
pub struct VerifiedCertificate {
    /// Identity fields of the leaf.
    pub identity: CertIdentity,
    /// The leaf's public key.
    pub public_key: PublicKeyMaterial,
}

impl RootCertificate {
    /// Parse a PEM root certificate.
    ///
    /// # Errors
    ///
    /// `Error::Certificate` if the text holds no certificate, or the
    /// certificate is not a CA.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let der = CertificateDer::from_pem_slice(pem.as_bytes())
            .map_err(|e| Error::Certificate(format!("Root certificate PEM: {e}")))?;
        let (_, cert) = X509Certificate::from_der(der.as_ref())
            .map_err(|e| Error::Certificate(format!("Root certificate DER: {e}")))?;
        if !cert.is_ca() {
            return Err(Error::Certificate(
                "Root certificate lacks basicConstraints cA=true".into(),
            ));
        }
        let identity = CertIdentity::from_certificate(&cert);

        Ok(Self {
            pem: pem.to_owned(),
            der: der.as_ref().to_vec(),
            identity,
        })
    }

    /// PEM text as received.
    #[must_use]
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// DER encoding.
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// SHA-256 over the DER encoding, lowercase hex.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.der).as_slice())
    }

    /// Subject fields of the root.
    #[must_use]
    pub fn identity(&self) -> &CertIdentity {
        &self.identity
    }

    /// Verify that `leaf_der` was issued by this root and is currently valid.
    ///
    /// # Errors
    ///
    /// `Error::CertificateChainInvalid` on issuer mismatch, bad signature or
    /// an expired / not-yet-valid leaf; `Error::Certificate` if either
    /// certificate does not parse.
    pub fn verify(&self, leaf_der: &[u8]) -> Result<VerifiedCertificate> {
        let (_, root) = X509Certificate::from_der(&self.der)
            .map_err(|e| Error::Certificate(format!("Root certificate DER: {e}")))?;
        let (_, leaf) = X509Certificate::from_der(leaf_der)
            .map_err(|e| Error::Certificate(format!("Client certificate DER: {e}")))?;

        if leaf.issuer().as_raw() != root.subject().as_raw() {
            return Err(Error::CertificateChainInvalid(format!(
                "issuer '{}' is not the trust root",
                leaf.issuer()
            )));
        }

        leaf.verify_signature(Some(root.public_key()))
            .map_err(|e| Error::CertificateChainInvalid(format!("signature: {e}")))?;

        if !leaf.validity().is_valid() {
            return Err(Error::CertificateChainInvalid(
                "certificate expired or not yet valid".into(),
            ));
        }

        let identity = CertIdentity::from_certificate(&leaf);
        let public_key = PublicKeyMaterial::from_spki(leaf.public_key())
            .map_err(|e| Error::Certificate(format!("Client certificate key: {e}")))?;

        trace!(subject = %identity.display_name, "certificate chains to trust root");
        Ok(VerifiedCertificate {
            identity,
            public_key,
        })
    }
}
