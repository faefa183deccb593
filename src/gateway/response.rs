//! Locally generated responses.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::Error;

/// Render a complete plain-text response that closes the connection.
#[must_use]
pub fn plain_text(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         content-type: text/plain; charset=utf-8\r\n\
         content-length: {}\r\n\
         connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
    .into_bytes()
}

/// 403 with `Forbidden: <reason>`.
#[must_use]
pub fn forbidden(reason: &str) -> Vec<u8> {
    plain_text(403, "Forbidden", &format!("Forbidden: {reason}"))
}

/// Terminal failure (framing, upstream) rendered with its mapped status.
///
/// The body is the status reason only; details stay in the log.
#[must_use]
pub fn for_error(error: &Error) -> Vec<u8> {
    let status = error.status_code();
    let reason = status.canonical_reason().unwrap_or("Error");
    plain_text(status.as_u16(), reason, reason)
}

/// 408 when the client stalls before completing its request.
#[must_use]
pub fn request_timeout() -> Vec<u8> {
    plain_text(408, "Request Timeout", "Request Timeout")
}

/// 200 for the diagnostic path.
#[must_use]
pub fn diagnostic(body: &str) -> Vec<u8> {
    plain_text(200, "OK", body)
}

/// Write `response` and shut the write side down.
///
/// # Errors
///
/// IO errors from the client socket.
pub async fn send<W>(out: &mut W, response: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(response).await?;
    out.flush().await?;
    out.shutdown().await
}
