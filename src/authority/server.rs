//! Authority HTTP surface

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::ca::{CertificateAuthority, csr_common_name};
use crate::{Error, Result};

const PEM_CONTENT_TYPE: &str = "application/x-pem-file";

/// Request body of `POST /authority/sign`.
#[derive(Debug, Default, Deserialize)]
pub struct SignRequest {
    /// PEM-encoded CSR.
    #[serde(default)]
    pub csr: Option<String>,
    /// Identity to bind; falls back to the CSR's CN.
    #[serde(default, alias = "agent_id", rename = "agentId")]
    pub agent_id: Option<String>,
}

/// Create the authority router
pub fn create_router(ca: Arc<CertificateAuthority>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/authority/cert", get(cert_handler))
        .route("/authority/sign", post(sign_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(ca)
}

/// Serve the authority until `shutdown` resolves.
///
/// # Errors
///
/// Bind failures or server errors.
pub async fn serve(
    ca: Arc<CertificateAuthority>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Certificate authority listening");
    info!("  GET  http://{addr}/authority/cert");
    info!("  POST http://{addr}/authority/sign");

    axum::serve(listener, create_router(ca))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Internal(e.to_string()))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "healthy", "version": env!("CARGO_PKG_VERSION") }))
}

async fn cert_handler(
    State(ca): State<Arc<CertificateAuthority>>,
    headers: HeaderMap,
) -> Response {
    let wants_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"));

    if wants_json {
        Json(json!({ "certificate": ca.ca_certificate_pem() })).into_response()
    } else {
        (
            [(header::CONTENT_TYPE, PEM_CONTENT_TYPE)],
            ca.ca_certificate_pem().to_string(),
        )
            .into_response()
    }
}

async fn sign_handler(
    State(ca): State<Arc<CertificateAuthority>>,
    Json(request): Json<SignRequest>,
) -> Response {
    let Some(csr) = request.csr.filter(|c| !c.trim().is_empty()) else {
        return (StatusCode::BAD_REQUEST, "CSR is required").into_response();
    };

    let subject = match request.agent_id.filter(|id| !id.trim().is_empty()) {
        Some(id) => id,
        None => match csr_common_name(&csr) {
            Ok(Some(cn)) => cn,
            Ok(None) => {
                return (
                    StatusCode::BAD_REQUEST,
                    "agentId is required when the CSR has no common name",
                )
                    .into_response();
            }
            Err(e) => return signing_failed(&e),
        },
    };

    // Blocking crypto; RSA signing is the slow part.
    let result = tokio::task::spawn_blocking(move || ca.sign_csr(&csr, &subject))
        .await
        .map_err(|e| Error::Internal(e.to_string()))
        .and_then(|r| r);

    match result {
        Ok(pem) => ([(header::CONTENT_TYPE, PEM_CONTENT_TYPE)], pem).into_response(),
        Err(e) => signing_failed(&e),
    }
}

fn signing_failed(e: &Error) -> Response {
    warn!(error = %e, "CSR signing failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Failed to sign CSR: {e}"),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthorityConfig;
    use crate::keys::KeyAlgorithm;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
    use tower::ServiceExt;

    fn authority() -> Arc<CertificateAuthority> {
        let config = AuthorityConfig {
            key_algorithm: KeyAlgorithm::EcdsaP256,
            ..AuthorityConfig::default()
        };
        Arc::new(CertificateAuthority::generate(&config).unwrap())
    }

    fn csr(cn: Option<&str>) -> String {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        if let Some(cn) = cn {
            params.distinguished_name.push(DnType::CommonName, cn);
        }
        params.serialize_request(&key).unwrap().pem().unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, String) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn sign(body: &serde_json::Value) -> Request<Body> {
        Request::post("/authority/sign")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn cert_endpoint_serves_pem() {
        let ca = authority();
        let (status, body) = send(
            create_router(Arc::clone(&ca)),
            Request::get("/authority/cert").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, ca.ca_certificate_pem());
    }

    #[tokio::test]
    async fn cert_endpoint_wraps_json_on_request() {
        let ca = authority();
        let (status, body) = send(
            create_router(Arc::clone(&ca)),
            Request::get("/authority/cert")
                .header(header::ACCEPT, "application/json")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["certificate"], ca.ca_certificate_pem());
    }

    #[tokio::test]
    async fn sign_without_csr_is_bad_request() {
        let (status, _) = send(
            create_router(authority()),
            sign(&json!({ "agentId": "agent-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sign_binds_agent_id_over_csr_subject() {
        // GIVEN: a CSR naming someone else
        let ca = authority();
        let body = json!({ "csr": csr(Some("other")), "agentId": "agent-7" });

        // WHEN: signing
        let (status, pem) = send(create_router(Arc::clone(&ca)), sign(&body)).await;

        // THEN: the certificate names agent-7 and chains to the root
        assert_eq!(status, StatusCode::OK);
        let root = crate::mtls::RootCertificate::from_pem(ca.ca_certificate_pem()).unwrap();
        let der = pem::parse(&pem).unwrap().into_contents();
        assert_eq!(
            root.verify(&der).unwrap().identity.agent_id(),
            Some("agent-7")
        );
    }

    #[tokio::test]
    async fn sign_falls_back_to_csr_common_name() {
        let (status, pem) = send(
            create_router(authority()),
            sign(&json!({ "csr": csr(Some("agent-cn")) })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let der = pem::parse(&pem).unwrap().into_contents();
        let identity = crate::mtls::CertIdentity::from_der(&der).unwrap();
        assert_eq!(identity.agent_id(), Some("agent-cn"));
    }

    #[tokio::test]
    async fn sign_without_any_identity_is_bad_request() {
        let (status, _) = send(
            create_router(authority()),
            sign(&json!({ "csr": csr(None) })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn garbage_csr_is_server_error() {
        let (status, body) = send(
            create_router(authority()),
            sign(&json!({ "csr": "not a csr", "agentId": "a" })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("Failed to sign CSR"));
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let (status, body) = send(
            create_router(authority()),
            Request::get("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("healthy"));
    }
}
