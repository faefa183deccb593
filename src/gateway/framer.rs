//! Incremental HTTP/1.1 request framing.
//!
//! Exactly one request is framed per connection. Bytes are buffered until the
//! blank line ending the head arrives (possibly split across reads); only
//! then are the request line and header fields parsed. The body is
//! delimited by `Content-Length` or decoded from `Transfer-Encoding: chunked`.

use crate::signature::HeaderLookup;
use crate::{Error, Result};

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Header fields in arrival order.
///
/// Names are lower-cased; a repeated name keeps its first position and its
/// last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    /// Set `name` to `value`, replacing an earlier value.
    pub fn insert(&mut self, name: &str, value: &str) {
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim().to_string();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Value of `name` (case-insensitive).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether `name` is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Fields in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of distinct fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when no fields were sent.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Declared `Content-Length`, if parseable.
    #[must_use]
    pub fn content_length(&self) -> Option<usize> {
        self.get("content-length").and_then(|v| v.parse().ok())
    }
}

impl HeaderLookup for Headers {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name)
    }
}

/// A parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// Request method, as sent.
    pub method: String,
    /// Request target, as sent (origin form).
    pub target: String,
    /// Protocol version token.
    pub version: String,
    /// Header fields.
    pub headers: Headers,
}

/// How the request body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// No body.
    Empty,
    /// Exactly this many bytes follow the head.
    Fixed(usize),
    /// `Transfer-Encoding: chunked`.
    Chunked,
}

impl RequestHead {
    /// Body delimitation declared by the head.
    ///
    /// # Errors
    ///
    /// `Error::Framing` when both `Transfer-Encoding` and `Content-Length`
    /// are sent, the transfer coding is not plain `chunked`, or the length
    /// is not a decimal number.
    pub fn body_length(&self) -> Result<BodyLength> {
        let transfer_encoding = self.headers.get("transfer-encoding");
        let content_length = self.headers.get("content-length");
        match (transfer_encoding, content_length) {
            (Some(_), Some(_)) => Err(Error::Framing(
                "both Transfer-Encoding and Content-Length sent".into(),
            )),
            (Some(coding), None) if coding.eq_ignore_ascii_case("chunked") => {
                Ok(BodyLength::Chunked)
            }
            (Some(coding), None) => Err(Error::Framing(format!(
                "unsupported transfer coding: {coding:?}"
            ))),
            (None, Some(length)) => {
                if length.is_empty() || !length.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(Error::Framing(format!("invalid Content-Length: {length:?}")));
                }
                length
                    .parse()
                    .map(BodyLength::Fixed)
                    .map_err(|_| Error::Framing(format!("invalid Content-Length: {length:?}")))
            }
            (None, None) => Ok(BodyLength::Empty),
        }
    }

    /// Path portion of the target.
    #[must_use]
    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }
}

/// Parse phase of a connection.
#[derive(Debug)]
enum Phase {
    AwaitingHeaders,
    HeadersParsed { head: RequestHead, body_offset: usize },
}

/// Per-connection request assembler.
#[derive(Debug)]
pub struct Framer {
    buffer: Vec<u8>,
    scanned: usize,
    max_header_bytes: usize,
    phase: Phase,
}

impl Framer {
    /// A framer that refuses heads larger than `max_header_bytes`.
    #[must_use]
    pub fn new(max_header_bytes: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            scanned: 0,
            max_header_bytes,
            phase: Phase::AwaitingHeaders,
        }
    }

    /// Feed the next chunk.
    ///
    /// Returns the head once it is complete. After that, further chunks are
    /// appended to the body and the same head is returned.
    ///
    /// # Errors
    ///
    /// `Error::Framing` for an oversized or malformed head.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<&RequestHead>> {
        self.buffer.extend_from_slice(chunk);

        if matches!(self.phase, Phase::AwaitingHeaders) {
            // The terminator may straddle the previous chunk boundary.
            let from = self.scanned.saturating_sub(HEAD_TERMINATOR.len() - 1);
            match find(&self.buffer[from..], HEAD_TERMINATOR) {
                Some(pos) => {
                    let head_end = from + pos;
                    if head_end > self.max_header_bytes {
                        return Err(oversized(self.max_header_bytes));
                    }
                    let head = parse_head(&self.buffer[..head_end])?;
                    self.phase = Phase::HeadersParsed {
                        head,
                        body_offset: head_end + HEAD_TERMINATOR.len(),
                    };
                }
                None => {
                    self.scanned = self.buffer.len();
                    if self.buffer.len() > self.max_header_bytes {
                        return Err(oversized(self.max_header_bytes));
                    }
                    return Ok(None);
                }
            }
        }

        Ok(self.head())
    }

    /// The parsed head, once available.
    #[must_use]
    pub fn head(&self) -> Option<&RequestHead> {
        match &self.phase {
            Phase::AwaitingHeaders => None,
            Phase::HeadersParsed { head, .. } => Some(head),
        }
    }

    /// Body bytes received so far.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        match &self.phase {
            Phase::AwaitingHeaders => &[],
            Phase::HeadersParsed { body_offset, .. } => &self.buffer[*body_offset..],
        }
    }

    /// Split into head and body, if the head is complete.
    #[must_use]
    pub fn into_parts(self) -> Option<(RequestHead, Vec<u8>)> {
        match self.phase {
            Phase::AwaitingHeaders => None,
            Phase::HeadersParsed { head, body_offset } => {
                let mut buffer = self.buffer;
                Some((head, buffer.split_off(body_offset)))
            }
        }
    }
}

/// Decode a chunked body.
///
/// Returns `None` until the last chunk and its trailer section have
/// arrived. Chunk extensions and trailer fields are discarded.
///
/// # Errors
///
/// `Error::Framing` for a malformed chunk, `Error::PayloadTooLarge` once the
/// decoded size passes `max_body_bytes`.
pub fn decode_chunked(raw: &[u8], max_body_bytes: usize) -> Result<Option<Vec<u8>>> {
    let mut body = Vec::new();
    let mut pos = 0;
    loop {
        let Some(line_len) = find(&raw[pos..], b"\r\n") else {
            return Ok(None);
        };
        let line = std::str::from_utf8(&raw[pos..pos + line_len])
            .map_err(|_| Error::Framing("chunk size line is not valid UTF-8".into()))?;
        let size_field = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| Error::Framing(format!("invalid chunk size: {size_field:?}")))?;
        pos += line_len + 2;

        if size == 0 {
            // Trailer section ends with an empty line.
            loop {
                let Some(end) = find(&raw[pos..], b"\r\n") else {
                    return Ok(None);
                };
                pos += end + 2;
                if end == 0 {
                    return Ok(Some(body));
                }
            }
        }

        if body.len().saturating_add(size) > max_body_bytes {
            return Err(Error::PayloadTooLarge(max_body_bytes));
        }
        let data_end = pos.saturating_add(size);
        if raw.len() < data_end.saturating_add(2) {
            return Ok(None);
        }
        if &raw[data_end..data_end + 2] != b"\r\n" {
            return Err(Error::Framing("chunk data not followed by CRLF".into()));
        }
        body.extend_from_slice(&raw[pos..data_end]);
        pos = data_end + 2;
    }
}

fn oversized(limit: usize) -> Error {
    Error::Framing(format!("request head exceeds {limit} bytes"))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_head(raw: &[u8]) -> Result<RequestHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::Framing("request head is not valid UTF-8".into()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ').filter(|p| !p.is_empty());
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::Framing(format!(
            "malformed request line: {request_line:?}"
        )));
    };

    if !method.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(Error::Framing(format!("invalid method: {method:?}")));
    }
    if !version.starts_with("HTTP/1.") {
        return Err(Error::Framing(format!("unsupported version: {version:?}")));
    }

    let mut headers = Headers::default();
    for line in lines {
        // Lines without a colon carry nothing we can use.
        if let Some((name, value)) = line.split_once(':') {
            if !name.trim().is_empty() {
                headers.insert(name, value);
            }
        }
    }

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
    })
}
