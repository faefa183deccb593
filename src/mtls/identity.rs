//! Certificate identity extraction.
//!
//! An agent's identity is the subject Common Name of the certificate it
//! presents: CA-issued certificates carry the agent id there, and
//! self-signed certificates vouched for by the Registry are looked up by it.

use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;
use x509_parser::x509::AttributeTypeAndValue;

use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Certificate identity
// ─────────────────────────────────────────────────────────────────────────────

/// Identity fields read from a client certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertIdentity {
    /// Subject Common Name (the agent id).
    pub common_name: Option<String>,

    /// Subject Organisation.
    pub organization: Option<String>,

    /// Issuer Common Name.
    pub issuer_common_name: Option<String>,

    /// Subject Alternative Name DNS entries.
    pub san_dns_names: Vec<String>,

    /// Label for logs.
    pub display_name: String,
}

impl CertIdentity {
    /// Parse a DER-encoded certificate and extract its identity fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::Certificate` if the bytes are not an X.509 certificate.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Certificate(format!("Failed to parse client certificate: {e}")))?;
        Ok(Self::from_certificate(&cert))
    }

    /// Extract identity fields from an already parsed certificate.
    #[must_use]
    pub fn from_certificate(cert: &X509Certificate<'_>) -> Self {
        let common_name = first_attr(cert.subject().iter_common_name());
        let organization = first_attr(cert.subject().iter_organization());
        let issuer_common_name = first_attr(cert.issuer().iter_common_name());
        let san_dns_names = extract_dns_sans(cert);
        let display_name = common_name
            .clone()
            .or_else(|| san_dns_names.first().cloned())
            .unwrap_or_else(|| "<unknown>".to_owned());

        Self {
            common_name,
            organization,
            issuer_common_name,
            san_dns_names,
            display_name,
        }
    }

    /// The agent id carried by this certificate, if any.
    ///
    /// Blank Common Names count as absent.
    #[must_use]
    pub fn agent_id(&self) -> Option<&str> {
        self.common_name
            .as_deref()
            .map(str::trim)
            .filter(|cn| !cn.is_empty())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Extraction helpers
// ─────────────────────────────────────────────────────────────────────────────

fn first_attr<'a, 'b: 'a>(
    mut attrs: impl Iterator<Item = &'a AttributeTypeAndValue<'b>>,
) -> Option<String> {
    attrs
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

fn extract_dns_sans(cert: &X509Certificate<'_>) -> Vec<String> {
    let Ok(Some(san_ext)) = cert.subject_alternative_name() else {
        return Vec::new();
    };
    san_ext
        .value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some((*dns).to_owned()),
            _ => None,
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
