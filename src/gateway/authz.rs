//! Per-request authorization.
//!
//! Two paths can authorize a request:
//!
//! - **Certificate**: the TLS peer certificate chains to the CA root, or
//!   failing that, its Common Name is an agent the Registry reports active.
//! - **Signature**: a detached RFC 9421 signature verifies against a key
//!   taken from a CA-signed `Client-Cert` header or looked up in the
//!   Registry by `keyid`.
//!
//! The signature path also runs for certificate-authorized callers that
//! send a `Signature` header, and a failure there denies the request.
//! Registry and chain failures only ever withdraw a path's vote.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

use super::framer::RequestHead;
use super::registry::Registry;
use super::trust_root::TrustRoot;
use crate::keys::PublicKeyMaterial;
use crate::mtls::CertIdentity;
use crate::signature::{SignedRequest, VerificationPolicy, select_signature, verify_signature};
use crate::{Error, Result};

/// Reason given when neither path applies.
pub const MISSING_CREDENTIALS: &str = "Missing signature headers and no valid mTLS";
/// Reason given when the signature carries no key id.
pub const MISSING_KEYID: &str = "KeyID not found in Signature-Input";

/// Outcome of authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Diagnostic path, no checks performed.
    Bypass,
    /// Authorized by the peer certificate.
    AuthorizedByCertificate,
    /// Authorized by a message signature.
    AuthorizedBySignature,
    /// Not authorized, with the reason shown to the caller.
    Denied(String),
}

/// The decision for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationDecision {
    /// Agent identity, when one was established.
    pub identity: Option<String>,
    /// What was decided.
    pub verdict: Verdict,
}

impl AuthorizationDecision {
    /// Whether the request may be relayed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        !matches!(self.verdict, Verdict::Denied(_))
    }

    /// Denial reason, if denied.
    #[must_use]
    pub fn denial_reason(&self) -> Option<&str> {
        match &self.verdict {
            Verdict::Denied(reason) => Some(reason),
            _ => None,
        }
    }

    fn denied(identity: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            identity,
            verdict: Verdict::Denied(reason.into()),
        }
    }
}

/// A framed request plus what the transport knows about it.
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    /// Parsed request head.
    pub head: &'a RequestHead,
    /// Request body.
    pub body: &'a [u8],
    /// `https` over TLS, `http` otherwise.
    pub scheme: &'a str,
    /// Authority the client addressed (Host header or configured fallback).
    pub authority: &'a str,
    /// DER of the TLS peer certificate, when one was presented.
    pub peer_certificate: Option<&'a [u8]>,
}

/// Where a signature verification key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeySource {
    ClientCertHeader,
    Registry,
}

struct ResolvedKey {
    material: PublicKeyMaterial,
    jwk_alg: Option<String>,
    owner: Option<String>,
    source: KeySource,
}

/// The authorization engine.
pub struct Authorizer {
    registry: Arc<dyn Registry>,
    trust_root: Arc<TrustRoot>,
    policy: VerificationPolicy,
    diagnostic_path: String,
}

impl std::fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorizer")
            .field("policy", &self.policy)
            .field("diagnostic_path", &self.diagnostic_path)
            .finish_non_exhaustive()
    }
}

impl Authorizer {
    /// Create an engine.
    pub fn new(
        registry: Arc<dyn Registry>,
        trust_root: Arc<TrustRoot>,
        policy: VerificationPolicy,
        diagnostic_path: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            trust_root,
            policy,
            diagnostic_path: diagnostic_path.into(),
        }
    }

    /// Whether `head` targets the diagnostic path.
    #[must_use]
    pub fn is_diagnostic(&self, head: &RequestHead) -> bool {
        head.path() == self.diagnostic_path
    }

    /// Decide whether `request` may be relayed.
    pub async fn authorize(&self, request: &InboundRequest<'_>) -> AuthorizationDecision {
        if self.is_diagnostic(request.head) {
            return AuthorizationDecision {
                identity: None,
                verdict: Verdict::Bypass,
            };
        }

        let cert_identity = match request.peer_certificate {
            Some(der) => self.certificate_path(der).await,
            None => None,
        };
        let authorized_by_cert = cert_identity.is_some();

        let headers = &request.head.headers;
        if authorized_by_cert && !headers.contains("signature") {
            return AuthorizationDecision {
                identity: cert_identity,
                verdict: Verdict::AuthorizedByCertificate,
            };
        }

        if !headers.contains("signature-input") {
            return if authorized_by_cert {
                AuthorizationDecision {
                    identity: cert_identity,
                    verdict: Verdict::AuthorizedByCertificate,
                }
            } else {
                AuthorizationDecision::denied(None, MISSING_CREDENTIALS)
            };
        }

        match self.signature_path(request).await {
            Ok(owner) => AuthorizationDecision {
                identity: cert_identity.or(owner),
                verdict: Verdict::AuthorizedBySignature,
            },
            Err(reason) => AuthorizationDecision::denied(cert_identity, reason),
        }
    }

    /// Identity authorized by the peer certificate, if any.
    async fn certificate_path(&self, der: &[u8]) -> Option<String> {
        let identity = match CertIdentity::from_der(der) {
            Ok(identity) => identity,
            Err(e) => {
                debug!(error = %e, "Unreadable peer certificate");
                return None;
            }
        };
        let agent_id = identity.agent_id()?.to_string();
        debug!(agent_id = %agent_id, "mTLS peer certificate presented");

        if let Some(root) = self.trust_root.current() {
            match root.verify(der) {
                Ok(_) => {
                    debug!(agent_id = %agent_id, "Authorized via CA-signed certificate");
                    return Some(agent_id);
                }
                Err(e) => debug!(agent_id = %agent_id, error = %e, "Peer certificate does not chain to CA root"),
            }
        }

        match self.registry.agent(&agent_id).await {
            Ok(agent) if agent.is_active() => {
                debug!(agent_id = %agent_id, "Authorized via Registry lookup");
                Some(agent_id)
            }
            Ok(agent) => {
                debug!(agent_id = %agent_id, status = ?agent.status, "Registry agent is not active");
                None
            }
            Err(e) => {
                debug!(agent_id = %agent_id, error = %e, "Registry agent lookup failed");
                None
            }
        }
    }

    /// Verify the request signature; returns the key owner on success.
    async fn signature_path(
        &self,
        request: &InboundRequest<'_>,
    ) -> std::result::Result<Option<String>, String> {
        let headers = &request.head.headers;
        let selected =
            select_signature(headers).map_err(|e| format!("signature invalid: {e}"))?;
        let keyid = selected.keyid().ok_or(MISSING_KEYID)?.to_string();

        let key = self
            .resolve_key(&keyid, request)
            .await
            .map_err(|e| format!("signature invalid: {e}"))?;

        let signed = SignedRequest {
            method: &request.head.method,
            scheme: request.scheme,
            authority: request.authority,
            target: &request.head.target,
            headers,
            body: Some(request.body),
        };

        let alg = verify_signature(
            &signed,
            &selected,
            &key.material,
            key.jwk_alg.as_deref(),
            &self.policy,
        )
        .map_err(|e| format!("signature invalid: {e}"))?;

        debug!(keyid = %keyid, alg = alg.name(), source = ?key.source, "Authorized via message signature");
        Ok(key.owner)
    }

    async fn resolve_key(&self, keyid: &str, request: &InboundRequest<'_>) -> Result<ResolvedKey> {
        if let Some(value) = request.head.headers.get("client-cert") {
            match self.key_from_client_cert(value) {
                Ok(Some(key)) => return Ok(key),
                Ok(None) => debug!("Client-Cert present but no CA root loaded"),
                Err(e) => debug!(error = %e, "Client-Cert header not usable"),
            }
        }

        let record = self.registry.key(keyid).await.map_err(|e| match e {
            Error::KeyNotFound(_) => e,
            other => {
                debug!(keyid, error = %other, "Registry key lookup failed");
                Error::KeyNotFound(keyid.to_string())
            }
        })?;
        let material = PublicKeyMaterial::from_jwk(&record.jwk)
            .map_err(|e| Error::SignatureInvalid(format!("unusable key {keyid}: {e}")))?;

        Ok(ResolvedKey {
            material,
            jwk_alg: record.jwk.alg,
            owner: record.agent_id,
            source: KeySource::Registry,
        })
    }

    fn key_from_client_cert(&self, value: &str) -> Result<Option<ResolvedKey>> {
        let Some(root) = self.trust_root.current() else {
            return Ok(None);
        };
        let der = decode_client_cert(value)?;
        let verified = root.verify(&der)?;
        Ok(Some(ResolvedKey {
            material: verified.public_key,
            jwk_alg: None,
            owner: verified.identity.agent_id().map(str::to_owned),
            source: KeySource::ClientCertHeader,
        }))
    }
}

/// Decode a `Client-Cert` header: `:base64:` (RFC 9440), bare base64 DER,
/// or a PEM block.
fn decode_client_cert(value: &str) -> Result<Vec<u8>> {
    let value = value.trim();
    if value.starts_with("-----BEGIN") {
        return pem::parse(value)
            .map(pem::Pem::into_contents)
            .map_err(|e| Error::CertificateChainInvalid(format!("Client-Cert PEM: {e}")));
    }
    let encoded = value
        .strip_prefix(':')
        .and_then(|v| v.strip_suffix(':'))
        .unwrap_or(value);
    let compact: String = encoded.split_whitespace().collect();
    STANDARD
        .decode(compact)
        .map_err(|e| Error::CertificateChainInvalid(format!("Client-Cert base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::CertificateAuthority;
    use crate::config::AuthorityConfig;
    use crate::gateway::framer::Framer;
    use crate::gateway::registry::{AgentRecord, AgentStatus, KeyRecord};
    use crate::keys::{KeyAlgorithm, SigningKeyMaterial};
    use crate::mtls::RootCertificate;
    use crate::signature::{parse_signature_input, signature_base};
    use async_trait::async_trait;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
    use std::collections::HashMap;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[derive(Default)]
    struct StubRegistry {
        agents: HashMap<String, AgentStatus>,
        keys: HashMap<String, KeyRecord>,
        offline: bool,
    }

    #[async_trait]
    impl Registry for StubRegistry {
        async fn agent(&self, id: &str) -> Result<AgentRecord> {
            if self.offline {
                return Err(Error::Registry("connection refused".into()));
            }
            self.agents
                .get(id)
                .map(|status| AgentRecord {
                    id: Some(id.to_string()),
                    name: None,
                    domain: None,
                    status: *status,
                })
                .ok_or_else(|| Error::AgentNotFound(id.to_string()))
        }

        async fn key(&self, kid: &str) -> Result<KeyRecord> {
            if self.offline {
                return Err(Error::Registry("connection refused".into()));
            }
            self.keys
                .get(kid)
                .cloned()
                .ok_or_else(|| Error::KeyNotFound(kid.to_string()))
        }
    }

    struct Fixture {
        ca: CertificateAuthority,
        agent_key: SigningKeyMaterial,
    }

    impl Fixture {
        fn new() -> Self {
            let config = AuthorityConfig {
                key_algorithm: KeyAlgorithm::EcdsaP256,
                ..AuthorityConfig::default()
            };
            Self {
                ca: CertificateAuthority::generate(&config).unwrap(),
                agent_key: SigningKeyMaterial::generate(KeyAlgorithm::Ed25519).unwrap(),
            }
        }

        fn root(&self) -> Arc<TrustRoot> {
            let root = RootCertificate::from_pem(self.ca.ca_certificate_pem()).unwrap();
            Arc::new(TrustRoot::pinned(root).unwrap())
        }

        fn no_root() -> Arc<TrustRoot> {
            Arc::new(TrustRoot::new("http://127.0.0.1:9", std::time::Duration::from_secs(1)).unwrap())
        }

        fn ca_issued_cert(&self, agent_id: &str) -> Vec<u8> {
            let key = self.agent_key.to_key_pair().unwrap();
            let csr = csr(agent_id, &key);
            let pem = self.ca.sign_csr(&csr, agent_id).unwrap();
            pem::parse(pem).unwrap().into_contents()
        }

        fn registry_with_key(&self, kid: &str) -> StubRegistry {
            let mut registry = StubRegistry::default();
            registry.keys.insert(
                kid.to_string(),
                KeyRecord {
                    jwk: self.agent_key.to_jwk(Some(kid)).unwrap(),
                    agent_id: Some("agent-42".into()),
                    status: None,
                    created_at: None,
                },
            );
            registry
        }
    }

    fn csr(cn: &str, key: &KeyPair) -> String {
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.serialize_request(key).unwrap().pem().unwrap()
    }

    fn self_signed(cn: &str) -> Vec<u8> {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.self_signed(&key).unwrap().der().to_vec()
    }

    fn now() -> i64 {
        i64::try_from(SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()).unwrap()
    }

    fn head(raw: &str) -> RequestHead {
        let mut framer = Framer::new(64 * 1024);
        framer.push(raw.as_bytes()).unwrap().unwrap().clone()
    }

    /// A GET to `/product/1` signed over method and target URI.
    fn signed_head(key: &SigningKeyMaterial, keyid: Option<&str>, extra: &str) -> RequestHead {
        let keyid_param = keyid.map(|k| format!(";keyid=\"{k}\"")).unwrap_or_default();
        let input_value =
            format!("sig1=(\"@method\" \"@target-uri\");created={}{keyid_param}", now());
        let unsigned = head(&format!(
            "GET /product/1 HTTP/1.1\r\nHost: localhost:3001\r\nSignature-Input: {input_value}\r\n{extra}\r\n"
        ));
        let input = parse_signature_input(&input_value).unwrap().remove(0);
        let request = SignedRequest {
            method: "GET",
            scheme: "https",
            authority: "localhost:3001",
            target: "/product/1",
            headers: &unsigned.headers,
            body: None,
        };
        let base = signature_base(&request, &input).unwrap();
        let signature = STANDARD.encode(key.sign(base.as_bytes()).unwrap());
        head(&format!(
            "GET /product/1 HTTP/1.1\r\nHost: localhost:3001\r\nSignature-Input: {input_value}\r\nSignature: sig1=:{signature}:\r\n{extra}\r\n"
        ))
    }

    fn inbound<'a>(head: &'a RequestHead, peer: Option<&'a [u8]>) -> InboundRequest<'a> {
        InboundRequest {
            head,
            body: &[],
            scheme: "https",
            authority: "localhost:3001",
            peer_certificate: peer,
        }
    }

    fn authorizer(registry: StubRegistry, trust: Arc<TrustRoot>) -> Authorizer {
        Authorizer::new(
            Arc::new(registry),
            trust,
            VerificationPolicy::default(),
            "/test-proxy",
        )
    }

    #[tokio::test]
    async fn diagnostic_path_bypasses_everything() {
        let engine = authorizer(StubRegistry::default(), Fixture::no_root());
        let head = head("GET /test-proxy HTTP/1.1\r\n\r\n");

        let decision = engine.authorize(&inbound(&head, None)).await;

        assert_eq!(decision.verdict, Verdict::Bypass);
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn ca_issued_certificate_authorizes() {
        // GIVEN: a CA-issued client certificate and an empty registry
        let fx = Fixture::new();
        let cert = fx.ca_issued_cert("agent-7");
        let engine = authorizer(StubRegistry::default(), fx.root());
        let head = head("GET /product/1 HTTP/1.1\r\n\r\n");

        // WHEN: authorizing with no signature headers
        let decision = engine.authorize(&inbound(&head, Some(&cert))).await;

        // THEN: the certificate alone suffices
        assert_eq!(decision.verdict, Verdict::AuthorizedByCertificate);
        assert_eq!(decision.identity.as_deref(), Some("agent-7"));
    }

    #[tokio::test]
    async fn self_signed_certificate_with_active_agent_authorizes() {
        // GIVEN: a self-signed cert for agent-42, which the registry reports active
        let fx = Fixture::new();
        let mut registry = StubRegistry::default();
        registry.agents.insert("agent-42".into(), AgentStatus::Active);
        let engine = authorizer(registry, fx.root());
        let cert = self_signed("agent-42");
        let head = head("GET /product/1 HTTP/1.1\r\n\r\n");

        // WHEN: authorizing
        let decision = engine.authorize(&inbound(&head, Some(&cert))).await;

        // THEN: the registry fallback authorizes it
        assert_eq!(decision.verdict, Verdict::AuthorizedByCertificate);
        assert_eq!(decision.identity.as_deref(), Some("agent-42"));
    }

    #[tokio::test]
    async fn self_signed_certificate_with_inactive_agent_is_denied() {
        let fx = Fixture::new();
        let mut registry = StubRegistry::default();
        registry.agents.insert("agent-42".into(), AgentStatus::Inactive);
        let engine = authorizer(registry, fx.root());
        let cert = self_signed("agent-42");
        let head = head("GET /product/1 HTTP/1.1\r\n\r\n");

        let decision = engine.authorize(&inbound(&head, Some(&cert))).await;

        assert_eq!(decision.denial_reason(), Some(MISSING_CREDENTIALS));
    }

    #[tokio::test]
    async fn registry_outage_degrades_to_deny() {
        let mut registry = StubRegistry::default();
        registry.offline = true;
        let engine = authorizer(registry, Fixture::no_root());
        let cert = self_signed("agent-42");
        let head = head("GET /product/1 HTTP/1.1\r\n\r\n");

        let decision = engine.authorize(&inbound(&head, Some(&cert))).await;

        assert!(!decision.is_allowed());
    }

    #[tokio::test]
    async fn no_credentials_is_denied_with_reason() {
        let engine = authorizer(StubRegistry::default(), Fixture::no_root());
        let head = head("GET /product/1 HTTP/1.1\r\n\r\n");

        let decision = engine.authorize(&inbound(&head, None)).await;

        let reason = decision.denial_reason().unwrap();
        assert!(reason.contains("signature"));
        assert!(reason.contains("mTLS"));
    }

    #[tokio::test]
    async fn signature_with_registry_key_authorizes() {
        // GIVEN: a registry that knows key k1
        let fx = Fixture::new();
        let engine = authorizer(fx.registry_with_key("k1"), Fixture::no_root());
        let head = signed_head(&fx.agent_key, Some("k1"), "");

        // WHEN: authorizing with no peer certificate
        let decision = engine.authorize(&inbound(&head, None)).await;

        // THEN: the signature authorizes and names the key owner
        assert_eq!(decision.verdict, Verdict::AuthorizedBySignature);
        assert_eq!(decision.identity.as_deref(), Some("agent-42"));
    }

    #[tokio::test]
    async fn signature_with_client_cert_header_authorizes_without_registry() {
        // GIVEN: the CA-issued cert embedded as a header and an offline registry
        let fx = Fixture::new();
        let cert = fx.ca_issued_cert("agent-9");
        let mut registry = StubRegistry::default();
        registry.offline = true;
        let engine = authorizer(registry, fx.root());
        let extra = format!("Client-Cert: :{}:\r\n", STANDARD.encode(&cert));
        let head = signed_head(&fx.agent_key, Some("whatever"), &extra);

        // WHEN: authorizing
        let decision = engine.authorize(&inbound(&head, None)).await;

        // THEN: the embedded certificate supplied the key
        assert_eq!(decision.verdict, Verdict::AuthorizedBySignature);
        assert_eq!(decision.identity.as_deref(), Some("agent-9"));
    }

    #[tokio::test]
    async fn client_cert_header_not_from_ca_falls_back_to_registry() {
        let fx = Fixture::new();
        let engine = authorizer(fx.registry_with_key("k1"), fx.root());
        let extra = format!("Client-Cert: {}\r\n", STANDARD.encode(self_signed("mallory")));
        let head = signed_head(&fx.agent_key, Some("k1"), &extra);

        let decision = engine.authorize(&inbound(&head, None)).await;

        assert_eq!(decision.verdict, Verdict::AuthorizedBySignature);
    }

    #[tokio::test]
    async fn missing_keyid_is_denied() {
        let fx = Fixture::new();
        let engine = authorizer(fx.registry_with_key("k1"), Fixture::no_root());
        let head = signed_head(&fx.agent_key, None, "");

        let decision = engine.authorize(&inbound(&head, None)).await;

        assert_eq!(decision.denial_reason(), Some(MISSING_KEYID));
    }

    #[tokio::test]
    async fn unknown_key_is_denied() {
        let fx = Fixture::new();
        let engine = authorizer(StubRegistry::default(), Fixture::no_root());
        let head = signed_head(&fx.agent_key, Some("k404"), "");

        let decision = engine.authorize(&inbound(&head, None)).await;

        assert_eq!(
            decision.denial_reason(),
            Some("signature invalid: Public Key k404 not found")
        );
    }

    #[tokio::test]
    async fn signature_by_other_key_is_denied() {
        let fx = Fixture::new();
        let engine = authorizer(fx.registry_with_key("k1"), Fixture::no_root());
        let imposter = SigningKeyMaterial::generate(KeyAlgorithm::Ed25519).unwrap();
        let head = signed_head(&imposter, Some("k1"), "");

        let decision = engine.authorize(&inbound(&head, None)).await;

        assert!(decision.denial_reason().unwrap().starts_with("signature invalid:"));
    }

    #[tokio::test]
    async fn certificate_caller_with_bad_signature_is_denied() {
        // GIVEN: a valid CA-issued peer cert, plus a signature by an unknown key
        let fx = Fixture::new();
        let cert = fx.ca_issued_cert("agent-7");
        let engine = authorizer(StubRegistry::default(), fx.root());
        let head = signed_head(&fx.agent_key, Some("k404"), "");

        // WHEN: authorizing
        let decision = engine.authorize(&inbound(&head, Some(&cert))).await;

        // THEN: the supplementary signature check still applies
        assert!(!decision.is_allowed());
        assert_eq!(decision.identity.as_deref(), Some("agent-7"));
    }

    #[tokio::test]
    async fn certificate_caller_with_good_signature_is_authorized() {
        let fx = Fixture::new();
        let cert = fx.ca_issued_cert("agent-7");
        let engine = authorizer(fx.registry_with_key("k1"), fx.root());
        let head = signed_head(&fx.agent_key, Some("k1"), "");

        let decision = engine.authorize(&inbound(&head, Some(&cert))).await;

        assert_eq!(decision.verdict, Verdict::AuthorizedBySignature);
        assert_eq!(decision.identity.as_deref(), Some("agent-7"));
    }

    #[test]
    fn client_cert_header_forms() {
        let der = vec![0x30, 0x03, 0x02, 0x01, 0x01];
        let b64 = STANDARD.encode(&der);
        assert_eq!(decode_client_cert(&format!(":{b64}:")).unwrap(), der);
        assert_eq!(decode_client_cert(&b64).unwrap(), der);
        let pem = pem::encode(&pem::Pem::new("CERTIFICATE", der.clone()));
        assert_eq!(decode_client_cert(&pem).unwrap(), der);
        assert!(decode_client_cert("!!!").is_err());
    }
}
