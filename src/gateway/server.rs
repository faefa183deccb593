//! Trust gateway server
//!
//! A raw TCP (optionally TLS) listener: the peer certificate must be in hand
//! before any HTTP is parsed, so requests are framed by hand rather than by
//! an HTTP server library. One task per connection, one request per
//! connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use super::authz::{Authorizer, InboundRequest, Verdict};
use super::framer::{BodyLength, Framer, RequestHead, decode_chunked};
use super::registry::HttpRegistry;
use super::relay::Relay;
use super::response;
use super::trust_root::TrustRoot;
use crate::config::GatewayConfig;
use crate::mtls::build_tls_config;
use crate::signature::VerificationPolicy;
use crate::{Error, Result};

const READ_CHUNK: usize = 8 * 1024;

/// How reading a request ended.
enum ReadOutcome {
    Request(RequestHead, Vec<u8>),
    Closed,
    TimedOut,
}

/// The trust gateway.
pub struct Gateway {
    config: GatewayConfig,
    authorizer: Authorizer,
    relay: Relay,
    trust_root: Arc<TrustRoot>,
    tls: Option<TlsAcceptor>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Assemble a gateway from its parts.
    pub fn new(
        config: GatewayConfig,
        authorizer: Authorizer,
        relay: Relay,
        trust_root: Arc<TrustRoot>,
        tls: Option<TlsAcceptor>,
    ) -> Self {
        Self {
            config,
            authorizer,
            relay,
            trust_root,
            tls,
        }
    }

    /// Build a gateway from configuration and load the CA root.
    ///
    /// An unreachable authority is not fatal: certificate chain checks stay
    /// off until the root loads (see `root_refresh_interval`).
    ///
    /// # Errors
    ///
    /// Invalid URLs, unreadable TLS material.
    pub async fn from_config(config: GatewayConfig) -> Result<Self> {
        let registry = Arc::new(HttpRegistry::new(
            &config.registry_url,
            config.upstream_timeout,
        )?);
        let trust_root = Arc::new(TrustRoot::new(
            config.authority_base_url(),
            config.upstream_timeout,
        )?);
        trust_root.bootstrap().await;

        let policy = VerificationPolicy {
            max_age: config.max_signature_age,
            ..VerificationPolicy::default()
        };
        let authorizer = Authorizer::new(
            registry,
            Arc::clone(&trust_root),
            policy,
            config.diagnostic_path.clone(),
        );
        let relay = Relay::new(
            &config.upstream_url,
            config.path_rewrites.clone(),
            config.upstream_timeout,
        )?;

        let tls = if config.tls.enabled {
            Some(TlsAcceptor::from(Arc::new(build_tls_config(&config.tls)?)))
        } else {
            warn!("TLS disabled - only message signatures can authorize requests");
            None
        };

        Ok(Self::new(config, authorizer, relay, trust_root, tls))
    }

    /// Bind the configured address and serve until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Invalid host or bind failure.
    pub async fn serve(self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.port,
        );
        let listener = TcpListener::bind(addr).await?;
        self.run(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` fires.
    ///
    /// Connections already accepted run to completion.
    ///
    /// # Errors
    ///
    /// Listener failures.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let local = listener.local_addr()?;
        info!("============================================================");
        info!("TRUST GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(address = %local, tls = self.tls.is_some(), "Listening");
        info!(upstream = %self.config.upstream_url, "Relaying to");
        info!(registry = %self.config.registry_url, "Registry");
        info!(path = %self.config.diagnostic_path, "Diagnostic path");
        info!("============================================================");

        if let Some(interval) = self.config.root_refresh_interval {
            self.trust_root.spawn_refresh(interval, shutdown.resubscribe());
        }

        let gateway = Arc::new(self);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let gateway = Arc::clone(&gateway);
                            let span = info_span!("connection", id = %Uuid::new_v4(), %peer);
                            tokio::spawn(gateway.accept(stream).instrument(span));
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Gateway shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn accept(self: Arc<Self>, stream: TcpStream) {
        let Some(acceptor) = self.tls.clone() else {
            self.handle_connection(stream, None, "http").await;
            return;
        };

        let handshake =
            tokio::time::timeout(self.config.header_timeout, acceptor.accept(stream)).await;
        let tls_stream = match handshake {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                debug!(error = %e, "TLS handshake failed");
                return;
            }
            Err(_) => {
                debug!("TLS handshake timed out");
                return;
            }
        };

        let peer_certificate = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(|cert| cert.as_ref().to_vec());

        self.handle_connection(tls_stream, peer_certificate, "https")
            .await;
    }

    /// Serve the single request on `stream`.
    async fn handle_connection<S>(&self, mut stream: S, peer_certificate: Option<Vec<u8>>, scheme: &str)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (head, body) = match self.read_request(&mut stream).await {
            Ok(ReadOutcome::Request(head, body)) => (head, body),
            Ok(ReadOutcome::Closed) => {
                debug!("Client closed before sending a request");
                return;
            }
            Ok(ReadOutcome::TimedOut) => {
                debug!("Client did not complete its request in time");
                self.reply(&mut stream, &response::request_timeout()).await;
                return;
            }
            Err(Error::Io(e)) => {
                debug!(error = %e, "Socket error while reading request");
                return;
            }
            Err(e) => {
                debug!(error = %e, "Rejecting unparseable request");
                self.reply(&mut stream, &response::for_error(&e)).await;
                return;
            }
        };
        debug!(method = %head.method, target = %head.target, "Request");

        let authority = head
            .headers
            .get("host")
            .map_or_else(|| self.fallback_authority(), str::to_string);
        let inbound = InboundRequest {
            head: &head,
            body: &body,
            scheme,
            authority: &authority,
            peer_certificate: peer_certificate.as_deref(),
        };

        let decision = self.authorizer.authorize(&inbound).await;
        match &decision.verdict {
            Verdict::Bypass => {
                self.reply(&mut stream, &response::diagnostic(&self.config.diagnostic_body))
                    .await;
                return;
            }
            Verdict::Denied(reason) => {
                if self.config.verbose_denials {
                    info!(reason = %reason, identity = ?decision.identity, "Denied");
                } else {
                    debug!(reason = %reason, identity = ?decision.identity, "Denied");
                }
                self.reply(&mut stream, &response::forbidden(reason)).await;
                return;
            }
            verdict => {
                debug!(?verdict, identity = ?decision.identity, "Authorized");
            }
        }

        let upstream = match self.relay.send(&head, body).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(error = %e, "Upstream error");
                self.reply(&mut stream, &response::for_error(&e)).await;
                return;
            }
        };
        let status = upstream.status();
        match Relay::write_response(upstream, &mut stream).await {
            Ok(bytes) => debug!(status = status.as_u16(), bytes, "Relayed"),
            Err(e) => warn!(error = %e, "Relay aborted mid-response"),
        }
        if let Err(e) = tokio::io::AsyncWriteExt::shutdown(&mut stream).await {
            debug!(error = %e, "Failed to close client connection");
        }
    }

    /// Read the head and `Content-Length` body, bounded by `header_timeout`.
    async fn read_request<S>(&self, stream: &mut S) -> Result<ReadOutcome>
    where
        S: AsyncRead + Unpin,
    {
        match tokio::time::timeout(self.config.header_timeout, self.read_framed(stream)).await {
            Ok(outcome) => outcome,
            Err(_) => Ok(ReadOutcome::TimedOut),
        }
    }

    async fn read_framed<S>(&self, stream: &mut S) -> Result<ReadOutcome>
    where
        S: AsyncRead + Unpin,
    {
        let mut framer = Framer::new(self.config.max_header_bytes);
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(ReadOutcome::Closed);
            }
            if framer.push(&chunk[..n])?.is_some() {
                break;
            }
        }

        let length = match framer.head() {
            Some(head) => head.body_length()?,
            None => return Err(Error::Internal("framer lost the request head".into())),
        };
        let limit = self.config.max_body_bytes;
        let body = match length {
            BodyLength::Empty => Vec::new(),
            BodyLength::Fixed(wanted) => {
                if wanted > limit {
                    return Err(Error::PayloadTooLarge(limit));
                }
                while framer.body().len() < wanted {
                    let n = stream.read(&mut chunk).await?;
                    if n == 0 {
                        return Err(Error::Framing(format!(
                            "body ended after {} of {wanted} bytes",
                            framer.body().len()
                        )));
                    }
                    framer.push(&chunk[..n])?;
                }
                // Anything past Content-Length would be a pipelined request.
                framer.body()[..wanted].to_vec()
            }
            BodyLength::Chunked => loop {
                if let Some(body) = decode_chunked(framer.body(), limit)? {
                    break body;
                }
                // Chunk metadata may use up to the head allowance on top.
                if framer.body().len() > limit.saturating_add(self.config.max_header_bytes) {
                    return Err(Error::PayloadTooLarge(limit));
                }
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(Error::Framing("chunked body ended before the last chunk".into()));
                }
                framer.push(&chunk[..n])?;
            },
        };

        let Some((head, _)) = framer.into_parts() else {
            return Err(Error::Internal("framer lost the request head".into()));
        };
        Ok(ReadOutcome::Request(head, body))
    }

    fn fallback_authority(&self) -> String {
        self.config
            .public_authority
            .clone()
            .unwrap_or_else(|| format!("localhost:{}", self.config.port))
    }

    async fn reply<W>(&self, stream: &mut W, bytes: &[u8])
    where
        W: AsyncWrite + Unpin,
    {
        if let Err(e) = response::send(stream, bytes).await {
            debug!(error = %e, "Failed to write response");
        }
    }
}
