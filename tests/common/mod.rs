//! Shared fixtures: a test PKI, stub Registry and upstream, a running
//! gateway, and raw HTTP/1.1 clients.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use serde_json::{Value, json};
use tap_gateway::authority::CertificateAuthority;
use tap_gateway::config::{AuthorityConfig, GatewayConfig, GatewayTlsConfig};
use tap_gateway::gateway::Gateway;
use tap_gateway::keys::{KeyAlgorithm, SigningKeyMaterial};
use tap_gateway::signature::{SignedRequest, parse_signature_input, signature_base};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsConnector;

// ─────────────────────────────────────────────────────────────────────────────
// PKI
// ─────────────────────────────────────────────────────────────────────────────

/// A CA plus a gateway server certificate on disk.
pub struct Pki {
    pub ca: Arc<CertificateAuthority>,
    pub dir: TempDir,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
}

/// A TLS client identity.
pub struct ClientIdentity {
    pub cert_der: Vec<u8>,
    pub key_pem: String,
}

impl ClientIdentity {
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::from_pem_slice(self.key_pem.as_bytes()).unwrap()
    }

    /// `Client-Cert` header value (RFC 9440 byte sequence).
    pub fn header_value(&self) -> String {
        format!(":{}:", STANDARD.encode(&self.cert_der))
    }
}

impl Pki {
    pub fn new() -> Self {
        let config = AuthorityConfig {
            key_algorithm: KeyAlgorithm::EcdsaP256,
            ..AuthorityConfig::default()
        };
        Self::with_ca(Arc::new(CertificateAuthority::generate(&config).unwrap()))
    }

    /// Server certificate for `localhost` issued by `ca`.
    pub fn with_ca(ca: Arc<CertificateAuthority>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        ca.issue_server_certificate(&["localhost".to_string()])
            .unwrap()
            .write_to_dir(dir.path(), "server")
            .unwrap();
        Self {
            server_cert: dir.path().join("server.crt"),
            server_key: dir.path().join("server.key"),
            ca,
            dir,
        }
    }

    pub fn ca_pem(&self) -> String {
        self.ca.ca_certificate_pem().to_string()
    }

    /// A client certificate for `agent_id` issued by the CA over `key`.
    pub fn issue_client(&self, agent_id: &str, key: &SigningKeyMaterial) -> ClientIdentity {
        let key_pair = KeyPair::from_pem(&key.to_pem()).unwrap();
        let csr = csr(agent_id, &key_pair);
        let pem = self.ca.sign_csr(&csr, agent_id).unwrap();
        ClientIdentity {
            cert_der: pem::parse(pem).unwrap().into_contents(),
            key_pem: key.to_pem(),
        }
    }

    pub fn tls_config(&self) -> GatewayTlsConfig {
        GatewayTlsConfig {
            enabled: true,
            server_cert: self.server_cert.to_string_lossy().into_owned(),
            server_key: self.server_key.to_string_lossy().into_owned(),
            request_client_cert: true,
        }
    }
}

pub fn csr(cn: &str, key: &KeyPair) -> String {
    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, cn);
    params.serialize_request(key).unwrap().pem().unwrap()
}

/// A self-signed client certificate (not from the CA).
pub fn self_signed_client(cn: &str) -> ClientIdentity {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, cn);
    let cert = params.self_signed(&key).unwrap();
    ClientIdentity {
        cert_der: cert.der().to_vec(),
        key_pem: key.serialize_pem(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stub services
// ─────────────────────────────────────────────────────────────────────────────

/// What the stub Registry knows.
#[derive(Clone, Default)]
pub struct RegistryState {
    pub ca_pem: Option<String>,
    pub agents: HashMap<String, String>,
    pub keys: HashMap<String, Value>,
}

impl RegistryState {
    pub fn with_agent(mut self, id: &str, status: &str) -> Self {
        self.agents.insert(id.to_string(), status.to_string());
        self
    }

    pub fn with_key(mut self, kid: &str, agent_id: &str, key: &SigningKeyMaterial) -> Self {
        let mut record = serde_json::to_value(key.to_jwk(Some(kid)).unwrap()).unwrap();
        record["agent_id"] = json!(agent_id);
        record["status"] = json!("active");
        record["created_at"] = json!(1_700_000_000_000_u64);
        self.keys.insert(kid.to_string(), record);
        self
    }
}

/// Serve a stub Registry (agents, keys, and the CA certificate).
pub async fn spawn_registry(state: RegistryState) -> String {
    async fn cert(State(state): State<Arc<RegistryState>>) -> impl IntoResponse {
        match &state.ca_pem {
            Some(pem) => (StatusCode::OK, pem.clone()),
            None => (StatusCode::NOT_FOUND, "no CA".to_string()),
        }
    }
    async fn agent(
        State(state): State<Arc<RegistryState>>,
        Path(id): Path<String>,
    ) -> impl IntoResponse {
        match state.agents.get(&id) {
            Some(status) => Json(json!({ "id": id, "name": id, "status": status })).into_response(),
            None => (StatusCode::NOT_FOUND, "Agent not found").into_response(),
        }
    }
    async fn key(
        State(state): State<Arc<RegistryState>>,
        Path(kid): Path<String>,
    ) -> impl IntoResponse {
        match state.keys.get(&kid) {
            Some(record) => Json(record.clone()).into_response(),
            None => (StatusCode::NOT_FOUND, "Key not found").into_response(),
        }
    }

    let app = Router::new()
        .route("/authority/cert", get(cert))
        .route("/agents/{id}", get(agent))
        .route("/keys/{kid}", get(key))
        .with_state(Arc::new(state));
    serve(app).await
}

/// Serve a stub merchant: `/api/products/{id}` plus an echo fallback that
/// reports method, URI and any body.
pub async fn spawn_upstream() -> String {
    async fn product(Path(id): Path<String>) -> impl IntoResponse {
        Json(json!({ "id": id, "name": format!("Product {id}") }))
    }
    async fn echo(request: axum::extract::Request) -> String {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        if body.is_empty() {
            format!("{} {}", parts.method, parts.uri)
        } else {
            format!("{} {} body={}", parts.method, parts.uri, String::from_utf8_lossy(&body))
        }
    }

    let app = Router::new()
        .route("/api/products/{id}", get(product))
        .fallback(echo);
    serve(app).await
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// A base URL nothing listens on.
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

// ─────────────────────────────────────────────────────────────────────────────
// Gateway
// ─────────────────────────────────────────────────────────────────────────────

/// A gateway running on an ephemeral port.
pub struct RunningGateway {
    pub addr: SocketAddr,
    _shutdown: broadcast::Sender<()>,
}

impl RunningGateway {
    pub fn authority(&self) -> String {
        format!("localhost:{}", self.addr.port())
    }
}

pub fn gateway_config(upstream: &str, registry: &str, tls: GatewayTlsConfig) -> GatewayConfig {
    GatewayConfig {
        upstream_url: upstream.to_string(),
        registry_url: registry.to_string(),
        tls,
        header_timeout: Duration::from_secs(5),
        upstream_timeout: Duration::from_secs(5),
        ..GatewayConfig::default()
    }
}

pub fn plaintext() -> GatewayTlsConfig {
    GatewayTlsConfig {
        enabled: false,
        ..GatewayTlsConfig::default()
    }
}

pub async fn spawn_gateway(config: GatewayConfig) -> RunningGateway {
    let gateway = Gateway::from_config(config).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = broadcast::channel(1);
    tokio::spawn(gateway.run(listener, rx));
    RunningGateway {
        addr,
        _shutdown: tx,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Clients
// ─────────────────────────────────────────────────────────────────────────────

/// A parsed gateway response.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub head: String,
    pub body: String,
}

impl RawResponse {
    fn parse(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes).into_owned();
        let (head, body) = text.split_once("\r\n\r\n").unwrap_or((&text, ""));
        let status = head
            .split(' ')
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        Self {
            status,
            head: head.to_string(),
            body: body.to_string(),
        }
    }
}

/// Send raw request bytes over TLS, optionally presenting a client certificate.
pub async fn https_request(
    addr: SocketAddr,
    ca_pem: &str,
    client: Option<&ClientIdentity>,
    raw: &str,
) -> RawResponse {
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(CertificateDer::from_pem_slice(ca_pem.as_bytes()).unwrap())
        .unwrap();
    let builder = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])
    .unwrap()
    .with_root_certificates(roots);
    let config = match client {
        Some(identity) => builder
            .with_client_auth_cert(
                vec![CertificateDer::from(identity.cert_der.clone())],
                identity.private_key(),
            )
            .unwrap(),
        None => builder.with_no_client_auth(),
    };

    let connector = TlsConnector::from(Arc::new(config));
    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut stream = connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();

    let mut buf = Vec::new();
    match stream.read_to_end(&mut buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {}
        Err(e) => panic!("read failed: {e}"),
    }
    RawResponse::parse(&buf)
}

/// Send raw request bytes over plain TCP.
pub async fn plain_request(addr: SocketAddr, raw: &[u8]) -> RawResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    RawResponse::parse(&buf)
}

// ─────────────────────────────────────────────────────────────────────────────
// Signing
// ─────────────────────────────────────────────────────────────────────────────

/// `Signature-Input` and `Signature` headers for a bodiless request,
/// covering `@method` and `@target-uri`.
pub fn sign(
    key: &SigningKeyMaterial,
    keyid: &str,
    scheme: &str,
    method: &str,
    authority: &str,
    target: &str,
) -> String {
    let created = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let input_value =
        format!("sig1=(\"@method\" \"@target-uri\");created={created};keyid=\"{keyid}\"");
    let input = parse_signature_input(&input_value).unwrap().remove(0);
    let headers = BTreeMap::from([("host".to_string(), authority.to_string())]);
    let request = SignedRequest {
        method,
        scheme,
        authority,
        target,
        headers: &headers,
        body: None,
    };
    let base = signature_base(&request, &input).unwrap();
    let signature = STANDARD.encode(key.sign(base.as_bytes()).unwrap());
    format!("Signature-Input: {input_value}\r\nSignature: sig1=:{signature}:\r\n")
}
