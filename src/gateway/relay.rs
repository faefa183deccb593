//! Upstream relay
//!
//! One upstream attempt per client request, no retries. The upstream status
//! line and headers are copied back verbatim and the body is streamed chunk
//! by chunk; the client connection is always closed afterwards.

use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Client, Method, Response, redirect};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::framer::RequestHead;
use crate::config::PathRewrite;
use crate::{Error, Result};

/// Request headers that describe the client hop, not the request.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Forwards authorized requests to the upstream service.
#[derive(Debug, Clone)]
pub struct Relay {
    client: Client,
    upstream_url: String,
    rewrites: Vec<PathRewrite>,
    timeout: Duration,
}

impl Relay {
    /// A relay to `upstream_url`.
    ///
    /// `timeout` bounds the wait for the upstream response head; the body
    /// stream is not time-limited.
    ///
    /// # Errors
    ///
    /// HTTP client construction failures.
    pub fn new(upstream_url: &str, rewrites: Vec<PathRewrite>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            upstream_url: upstream_url.trim_end_matches('/').to_string(),
            rewrites,
            timeout,
        })
    }

    /// Upstream URL for a client request target.
    #[must_use]
    pub fn upstream_url(&self, target: &str) -> String {
        format!(
            "{}{}",
            self.upstream_url,
            PathRewrite::apply(&self.rewrites, target)
        )
    }

    /// Send the request upstream and wait for its response head.
    ///
    /// # Errors
    ///
    /// `Error::Upstream` when the upstream cannot be reached, does not
    /// answer in time, or the method is unusable.
    pub async fn send(&self, head: &RequestHead, body: Vec<u8>) -> Result<Response> {
        let method = Method::from_bytes(head.method.as_bytes())
            .map_err(|e| Error::Upstream(format!("invalid method: {e}")))?;
        let url = self.upstream_url(&head.target);
        debug!(%method, %url, "Relaying to upstream");

        let mut request = self.client.request(method.clone(), &url);
        for (name, value) in head.headers.iter() {
            if HOP_BY_HOP.contains(&name) {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => request = request.header(name, value),
                _ => debug!(header = name, "Dropping header that cannot be forwarded"),
            }
        }
        if method != Method::GET && method != Method::HEAD {
            request = request.body(body);
        }

        tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| Error::Upstream(format!("no response from {url} within {:?}", self.timeout)))?
            .map_err(|e| Error::Upstream(e.to_string()))
    }

    /// Write the upstream response to the client and stream its body.
    ///
    /// Returns the number of body bytes written.
    ///
    /// # Errors
    ///
    /// `Error::Io` when the client goes away, `Error::Upstream` when the
    /// upstream body stream fails part way.
    pub async fn write_response<W>(response: Response, out: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        out.write_all(&response_head(&response)).await?;

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Upstream(e.to_string()))?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;
        Ok(written)
    }
}

fn response_head(response: &Response) -> Vec<u8> {
    let status = response.status();
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes();
    for (name, value) in response.headers() {
        // The body is written raw and delimited by connection close.
        if name == "transfer-encoding" || name == "connection" || name == "keep-alive" {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"connection: close\r\n\r\n");
    head
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::framer::Framer;
    use axum::Router;
    use axum::extract::Request;
    use pretty_assertions::assert_eq;

    fn relay(upstream: &str) -> Relay {
        Relay::new(
            upstream,
            vec![PathRewrite {
                from: "/product/".into(),
                to: "/api/products/".into(),
            }],
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn head(raw: &str) -> RequestHead {
        Framer::new(4096)
            .push(raw.as_bytes())
            .unwrap()
            .unwrap()
            .clone()
    }

    async fn echo_upstream() -> String {
        async fn echo(request: Request) -> String {
            let (parts, body) = request.into_parts();
            let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
            format!(
                "{} {} x-agent={} body={}",
                parts.method,
                parts.uri,
                parts
                    .headers
                    .get("x-agent")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-"),
                String::from_utf8_lossy(&body)
            )
        }
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().fallback(echo))
                .await
                .unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn rewrites_public_prefix() {
        let relay = relay("http://merchant:3000/");
        assert_eq!(
            relay.upstream_url("/product/1?currency=EUR"),
            "http://merchant:3000/api/products/1?currency=EUR"
        );
        assert_eq!(relay.upstream_url("/cart"), "http://merchant:3000/cart");
    }

    #[tokio::test]
    async fn relays_method_headers_body_and_streams_back() {
        // GIVEN: an echoing upstream
        let upstream = echo_upstream().await;
        let relay = relay(&upstream);
        let head = head("POST /product/1 HTTP/1.1\r\nHost: gw\r\nX-Agent: a42\r\nContent-Length: 5\r\n\r\n");

        // WHEN: relaying and writing the response
        let response = relay.send(&head, b"hello".to_vec()).await.unwrap();
        let mut out = Vec::new();
        Relay::write_response(response, &mut out).await.unwrap();

        // THEN: status line, close, and the echoed request
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(text.contains("connection: close\r\n"));
        assert!(text.ends_with("POST /api/products/1 x-agent=a42 body=hello"), "{text}");
    }

    #[tokio::test]
    async fn get_body_is_not_forwarded() {
        let upstream = echo_upstream().await;
        let relay = relay(&upstream);
        let head = head("GET /cart HTTP/1.1\r\n\r\n");

        let response = relay.send(&head, b"ignored".to_vec()).await.unwrap();
        let mut out = Vec::new();
        Relay::write_response(response, &mut out).await.unwrap();

        assert!(String::from_utf8(out).unwrap().ends_with("GET /cart x-agent=- body="));
    }

    #[tokio::test]
    async fn unreachable_upstream_is_an_upstream_error() {
        let relay = relay("http://127.0.0.1:9");
        let head = head("GET /product/1 HTTP/1.1\r\n\r\n");

        let err = relay.send(&head, Vec::new()).await.unwrap_err();

        assert!(matches!(err, Error::Upstream(_)));
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_GATEWAY);
    }
}
