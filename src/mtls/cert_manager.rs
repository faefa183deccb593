//! Certificate management: PEM loading, rustls config building, file output.
//!
//! Provides:
//! - [`build_tls_config`]: build the gateway's `rustls::ServerConfig`
//! - [`load_certs`] / [`load_private_key`]: PEM file loading
//! - [`GeneratedCert`]: a PEM certificate/key pair with [`GeneratedCert::write_to_dir`]
//!
//! # Client certificates
//!
//! The gateway *requests* a client certificate but never rejects a
//! handshake over it. Whether a presented certificate means anything is
//! decided per request by the authorization engine, which accepts both
//! CA-issued certificates and self-signed ones the Registry vouches for.
//! The handshake still proves possession: the client's `CertificateVerify`
//! signature is checked against the presented certificate.
//!
//! # File format
//!
//! All certificate and key files are **PEM**.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use tracing::debug;

use crate::config::GatewayTlsConfig;
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Public: build TLS server config
// ─────────────────────────────────────────────────────────────────────────────

/// Build the gateway's TLS 1.3 `rustls::ServerConfig`.
///
/// When `config.request_client_cert` is `true` the server sends a
/// `CertificateRequest`; clients may answer with any certificate or none.
///
/// # Errors
///
/// Returns an error if the certificate or key file cannot be read or parsed,
/// or the key does not match the certificate.
pub fn build_tls_config(config: &GatewayTlsConfig) -> Result<ServerConfig> {
    let server_certs = load_certs(&config.server_cert)?;
    let server_key = load_private_key(&config.server_key)?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::Config(format!("TLS protocol setup failed: {e}")))?;

    let builder = if config.request_client_cert {
        builder.with_client_cert_verifier(Arc::new(RequestClientCert {
            algorithms: provider.signature_verification_algorithms,
        }))
    } else {
        builder.with_no_client_auth()
    };

    let mut tls_cfg = builder
        .with_single_cert(server_certs, server_key)
        .map_err(|e| Error::Config(format!("TLS config error (cert/key mismatch?): {e}")))?;

    // One request per connection over HTTP/1.1
    tls_cfg.alpn_protocols = vec![b"http/1.1".to_vec()];

    debug!(
        server_cert = %config.server_cert,
        request_client_cert = config.request_client_cert,
        "TLS config built"
    );

    Ok(tls_cfg)
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: PEM loading
// ─────────────────────────────────────────────────────────────────────────────

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    let certs = CertificateDer::pem_slice_iter(&pem_data)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse certs from '{path}': {e}")))?;

    if certs.is_empty() {
        return Err(Error::Config(format!("No certificates found in '{path}'")));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file.
///
/// Supports PKCS#1 RSA, PKCS#8 and SEC1 EC keys.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no private key.
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let pem_data = read_file(path)?;
    PrivateKeyDer::from_pem_slice(&pem_data)
        .map_err(|e| Error::Config(format!("No usable private key in '{path}': {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: generated material
// ─────────────────────────────────────────────────────────────────────────────

/// A certificate and its private key in PEM format.
#[derive(Debug, Clone)]
pub struct GeneratedCert {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

impl GeneratedCert {
    /// Write `<stem>.crt` and `<stem>.key` under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the files
    /// cannot be written.
    pub fn write_to_dir(&self, dir: &Path, stem: &str) -> Result<()> {
        fs::create_dir_all(dir)
            .map_err(|e| Error::Config(format!("Cannot create dir '{}': {e}", dir.display())))?;

        fs::write(dir.join(format!("{stem}.crt")), &self.cert_pem)
            .map_err(|e| Error::Config(format!("Cannot write cert: {e}")))?;

        fs::write(dir.join(format!("{stem}.key")), &self.key_pem)
            .map_err(|e| Error::Config(format!("Cannot write key: {e}")))?;

        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client certificate verifier
// ─────────────────────────────────────────────────────────────────────────────

/// Requests, but never requires or chain-checks, a client certificate.
#[derive(Debug)]
struct RequestClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for RequestClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

fn read_file(path: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Config(format!("Cannot read '{path}': {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};

    fn self_signed(host: &str) -> GeneratedCert {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec![host.to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        GeneratedCert {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }

    fn tls_config(dir: &Path, request_client_cert: bool) -> GatewayTlsConfig {
        GatewayTlsConfig {
            enabled: true,
            server_cert: dir.join("server.crt").to_string_lossy().into_owned(),
            server_key: dir.join("server.key").to_string_lossy().into_owned(),
            request_client_cert,
        }
    }

    #[test]
    fn write_to_dir_creates_crt_and_key_files() {
        let dir = tempfile::tempdir().unwrap();
        self_signed("localhost")
            .write_to_dir(dir.path(), "server")
            .unwrap();

        let contents = fs::read_to_string(dir.path().join("server.crt")).unwrap();
        assert!(contents.contains("BEGIN CERTIFICATE"));
        assert!(dir.path().join("server.key").exists());
    }

    #[test]
    fn build_tls_config_requests_client_certs_when_enabled() {
        // GIVEN: a server cert on disk
        let dir = tempfile::tempdir().unwrap();
        self_signed("localhost")
            .write_to_dir(dir.path(), "server")
            .unwrap();

        // WHEN: building with client cert requests enabled
        let cfg = build_tls_config(&tls_config(dir.path(), true)).unwrap();

        // THEN: HTTP/1.1 only
        assert_eq!(cfg.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn build_tls_config_without_client_cert_request() {
        let dir = tempfile::tempdir().unwrap();
        self_signed("localhost")
            .write_to_dir(dir.path(), "server")
            .unwrap();
        assert!(build_tls_config(&tls_config(dir.path(), false)).is_ok());
    }

    #[test]
    fn build_tls_config_rejects_mismatched_key() {
        // GIVEN: a cert and a key from different pairs
        let dir = tempfile::tempdir().unwrap();
        let a = self_signed("localhost");
        let b = self_signed("localhost");
        GeneratedCert {
            cert_pem: a.cert_pem,
            key_pem: b.key_pem,
        }
        .write_to_dir(dir.path(), "server")
        .unwrap();

        // THEN: the config is refused
        let err = build_tls_config(&tls_config(dir.path(), true)).unwrap_err();
        assert!(err.to_string().contains("TLS config error"));
    }

    #[test]
    fn load_certs_returns_error_for_missing_file() {
        let msg = load_certs("/nonexistent/path/ca.crt")
            .unwrap_err()
            .to_string();
        assert!(msg.contains("Cannot read"));
    }

    #[test]
    fn load_certs_returns_error_for_empty_pem_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.crt");
        fs::write(&path, b"").unwrap();
        assert!(load_certs(path.to_str().unwrap()).is_err());
    }

    #[test]
    fn load_private_key_returns_error_when_no_key_in_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert_only.pem");
        fs::write(&path, self_signed("localhost").cert_pem).unwrap();
        assert!(load_private_key(path.to_str().unwrap()).is_err());
    }
}
