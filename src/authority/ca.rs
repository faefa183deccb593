//! Root lifecycle and CSR-to-certificate issuance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::CertificateDer;
use rustls::pki_types::pem::PemObject;
use time::OffsetDateTime;
use tracing::{debug, info};
use x509_parser::certificate::X509Certificate;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::FromDer;

use super::store::{CaStore, StoredRoot};
use crate::config::AuthorityConfig;
use crate::keys::{KeyAlgorithm, SigningKeyMaterial};
use crate::mtls::GeneratedCert;
use crate::{Error, Result};

/// The certificate authority: root key, root certificate, issuance.
#[derive(Debug)]
pub struct CertificateAuthority {
    key: SigningKeyMaterial,
    cert_pem: String,
    validity_days: u32,
    last_serial: AtomicU64,
}

impl CertificateAuthority {
    /// Load the root from the configured store, or generate (and persist) one.
    ///
    /// Without a `data_dir` the root lives in memory only.
    ///
    /// # Errors
    ///
    /// Store errors (including a half-present store), unusable stored
    /// material, or key generation failures.
    pub fn initialize(config: &AuthorityConfig) -> Result<Self> {
        let Some(dir) = config.data_dir.as_deref() else {
            info!("No CA data directory configured; generating an ephemeral root");
            return Self::generate(config);
        };

        let store = CaStore::new(dir);
        if let Some(stored) = store.load()? {
            info!(dir, "Loading existing root CA");
            return Self::from_stored(&stored, config.validity_days);
        }

        info!(dir, "No root CA found, generating one");
        let ca = Self::generate(config)?;
        store.save(&ca.to_stored())?;
        Ok(ca)
    }

    /// Generate a fresh self-signed root.
    ///
    /// # Errors
    ///
    /// Key generation or certificate encoding failures.
    pub fn generate(config: &AuthorityConfig) -> Result<Self> {
        debug!(algorithm = ?config.key_algorithm, "Generating root CA key pair");
        let key = SigningKeyMaterial::generate(config.key_algorithm)
            .map_err(|e| Error::Certificate(format!("Failed to generate CA key: {e}")))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, config.common_name.as_str());
        dn.push(DnType::OrganizationName, config.organization.as_str());
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(SerialNumber::from(1u64));
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(i64::from(config.root_validity_days));

        let cert = params
            .self_signed(key.key_pair())
            .map_err(|e| Error::Certificate(format!("CA cert generation failed: {e}")))?;

        Ok(Self::assemble(key, cert.pem(), config.validity_days))
    }

    /// Use existing root material verbatim.
    ///
    /// # Errors
    ///
    /// `Error::Config` if the key does not parse, the certificate is not a
    /// CA, or the two do not belong together.
    pub fn from_stored(stored: &StoredRoot, validity_days: u32) -> Result<Self> {
        let key = SigningKeyMaterial::from_pem(&stored.key_pem)
            .map_err(|e| Error::Config(format!("Stored CA key is unusable: {e}")))?;

        let der = CertificateDer::from_pem_slice(stored.cert_pem.as_bytes())
            .map_err(|e| Error::Config(format!("Stored CA certificate is unusable: {e}")))?;
        let (_, cert) = X509Certificate::from_der(der.as_ref())
            .map_err(|e| Error::Config(format!("Stored CA certificate is unusable: {e}")))?;
        if !cert.is_ca() {
            return Err(Error::Config("Stored CA certificate is not a CA".into()));
        }
        let key_spki = key
            .public_key_der()
            .map_err(|e| Error::Config(format!("Stored CA key is unusable: {e}")))?;
        if cert.public_key().raw != key_spki.as_slice() {
            return Err(Error::Config(
                "Stored CA certificate does not match the stored CA key".into(),
            ));
        }

        Ok(Self::assemble(key, stored.cert_pem.clone(), validity_days))
    }

    fn assemble(key: SigningKeyMaterial, cert_pem: String, validity_days: u32) -> Self {
        Self {
            key,
            cert_pem,
            validity_days,
            last_serial: AtomicU64::new(0),
        }
    }

    fn to_stored(&self) -> StoredRoot {
        StoredRoot {
            key_pem: self.key.to_pem(),
            cert_pem: self.cert_pem.clone(),
        }
    }

    /// The root certificate, PEM.
    #[must_use]
    pub fn ca_certificate_pem(&self) -> &str {
        &self.cert_pem
    }

    /// The root signing key.
    #[must_use]
    pub fn signing_key(&self) -> &SigningKeyMaterial {
        &self.key
    }

    /// Issue a client certificate for `subject_identity` from a CSR.
    ///
    /// The CSR's public key is copied verbatim; its subject and extensions
    /// are replaced. The CA does not check that `subject_identity` matches
    /// anything inside the CSR.
    ///
    /// # Errors
    ///
    /// `Error::CsrSignatureInvalid` if the CSR is not signed by its own key,
    /// `Error::Certificate` if it cannot be parsed or signing fails.
    pub fn sign_csr(&self, csr_pem: &str, subject_identity: &str) -> Result<String> {
        let csr_der = csr_der(csr_pem)?;
        let (_, request) = X509CertificationRequest::from_der(&csr_der)
            .map_err(|e| Error::Certificate(format!("Failed to parse CSR: {e}")))?;
        request
            .verify_signature()
            .map_err(|e| Error::CsrSignatureInvalid(e.to_string()))?;

        let mut csr = CertificateSigningRequestParams::from_der(&csr_der.into())
            .map_err(|e| Error::Certificate(format!("Failed to read CSR: {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, subject_identity);
        let serial = self.next_serial();
        let now = OffsetDateTime::now_utc();

        let params = &mut csr.params;
        params.distinguished_name = dn;
        params.subject_alt_names = Vec::new();
        params.serial_number = Some(SerialNumber::from(serial));
        params.not_before = now;
        params.not_after = now + time::Duration::days(i64::from(self.validity_days));
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.use_authority_key_identifier_extension = true;

        let cert = csr
            .signed_by(&self.issuer()?)
            .map_err(|e| Error::Certificate(format!("Failed to sign CSR: {e}")))?;

        info!(subject = subject_identity, serial, "Issued client certificate");
        Ok(cert.pem())
    }

    /// Issue a TLS server certificate (with a fresh key) for `hosts`.
    ///
    /// The first host becomes the Common Name; all hosts become SANs.
    ///
    /// # Errors
    ///
    /// `Error::Config` for no hosts or an invalid host name,
    /// `Error::Certificate` on generation failures.
    pub fn issue_server_certificate(&self, hosts: &[String]) -> Result<GeneratedCert> {
        let Some(first) = hosts.first() else {
            return Err(Error::Config("At least one host is required".into()));
        };

        let key = SigningKeyMaterial::generate(KeyAlgorithm::EcdsaP256)
            .map_err(|e| Error::Certificate(format!("Failed to generate server key: {e}")))?;

        let mut params = CertificateParams::new(hosts.to_vec())
            .map_err(|e| Error::Config(format!("Invalid server host name: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, first.as_str());
        params.distinguished_name = dn;
        params.serial_number = Some(SerialNumber::from(self.next_serial()));
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(i64::from(self.validity_days));
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        let cert = params
            .signed_by(key.key_pair(), &self.issuer()?)
            .map_err(|e| Error::Certificate(format!("Server cert signing failed: {e}")))?;

        info!(hosts = ?hosts, "Issued server certificate");
        Ok(GeneratedCert {
            cert_pem: cert.pem(),
            key_pem: key.to_pem(),
        })
    }

    fn issuer(&self) -> Result<Issuer<'static, KeyPair>> {
        let key = self
            .key
            .to_key_pair()
            .map_err(|e| Error::Certificate(format!("CA key: {e}")))?;
        Issuer::from_ca_cert_pem(&self.cert_pem, key)
            .map_err(|e| Error::Certificate(format!("CA certificate: {e}")))
    }

    /// Strictly increasing serials derived from the clock.
    fn next_serial(&self) -> u64 {
        let now = unix_micros();
        let prev = self
            .last_serial
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or_else(|prev| prev);
        now.max(prev + 1)
    }
}

/// The Common Name a CSR asks for, if any.
///
/// # Errors
///
/// `Error::Certificate` if the PEM is not a CSR.
pub fn csr_common_name(csr_pem: &str) -> Result<Option<String>> {
    let der = csr_der(csr_pem)?;
    let (_, request) = X509CertificationRequest::from_der(&der)
        .map_err(|e| Error::Certificate(format!("Failed to parse CSR: {e}")))?;
    Ok(request
        .certification_request_info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::trim)
        .filter(|cn| !cn.is_empty())
        .map(str::to_owned))
}

fn csr_der(csr_pem: &str) -> Result<Vec<u8>> {
    let parsed = pem::parse(csr_pem)
        .map_err(|e| Error::Certificate(format!("CSR is not PEM: {e}")))?;
    match parsed.tag() {
        "CERTIFICATE REQUEST" | "NEW CERTIFICATE REQUEST" => Ok(parsed.into_contents()),
        other => Err(Error::Certificate(format!(
            "Expected a CERTIFICATE REQUEST, got {other}"
        ))),
    }
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
}
