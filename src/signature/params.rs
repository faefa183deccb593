//! `Signature-Input` / `Signature` header parsing.
//!
//! Both headers are RFC 8941 dictionaries keyed by signature label. Only the
//! subset RFC 9421 uses is accepted: inner lists of quoted component
//! identifiers with integer / string / token parameters, and byte sequences.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use super::SignatureError;

/// One labelled entry of `Signature-Input`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureInput {
    /// Dictionary key (`sig1`).
    pub label: String,
    /// Covered component identifiers, in order, without quotes.
    pub components: Vec<String>,
    /// Signature parameters.
    pub params: SignatureParams,
    /// The member value exactly as sent; used verbatim as `@signature-params`.
    pub raw: String,
}

/// Signature metadata parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureParams {
    /// `keyid`
    pub keyid: Option<String>,
    /// `alg`
    pub alg: Option<String>,
    /// `created` (unix seconds)
    pub created: Option<i64>,
    /// `expires` (unix seconds)
    pub expires: Option<i64>,
    /// `nonce`
    pub nonce: Option<String>,
    /// `tag`
    pub tag: Option<String>,
}

impl SignatureInput {
    /// Whether `component` is covered by the signature.
    #[must_use]
    pub fn covers(&self, component: &str) -> bool {
        self.components.iter().any(|c| c == component)
    }
}

/// Parse a `Signature-Input` header.
///
/// # Errors
///
/// [`SignatureError::Malformed`] on syntax the parser does not accept.
pub fn parse_signature_input(header: &str) -> Result<Vec<SignatureInput>, SignatureError> {
    split_top_level(header, ',')
        .into_iter()
        .filter(|member| !member.trim().is_empty())
        .map(|member| {
            let (label, value) = split_member(member)?;
            parse_inner_list(label, value)
        })
        .collect()
}

/// Parse a `Signature` header into `(label, signature bytes)` pairs.
///
/// # Errors
///
/// [`SignatureError::Malformed`] if a member is not a byte sequence.
pub fn parse_signatures(header: &str) -> Result<Vec<(String, Vec<u8>)>, SignatureError> {
    split_top_level(header, ',')
        .into_iter()
        .filter(|member| !member.trim().is_empty())
        .map(|member| {
            let (label, value) = split_member(member)?;
            Ok((label.to_string(), decode_byte_sequence(value)?))
        })
        .collect()
}

/// Decode an RFC 8941 byte sequence (`:base64:`).
///
/// # Errors
///
/// [`SignatureError::Malformed`] if the value is not delimited by colons or
/// is not base64.
pub fn decode_byte_sequence(value: &str) -> Result<Vec<u8>, SignatureError> {
    let inner = value
        .trim()
        .strip_prefix(':')
        .and_then(|v| v.strip_suffix(':'))
        .ok_or_else(|| SignatureError::Malformed(format!("expected byte sequence, got '{value}'")))?;
    STANDARD
        .decode(inner)
        .map_err(|e| SignatureError::Malformed(format!("byte sequence: {e}")))
}

/// Split on `sep` outside quoted strings and parentheses.
pub(crate) fn split_top_level(input: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in input.char_indices() {
        if in_quotes {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_quotes = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if c == sep && depth == 0 => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn split_member(member: &str) -> Result<(&str, &str), SignatureError> {
    let member = member.trim();
    let (label, value) = member
        .split_once('=')
        .ok_or_else(|| SignatureError::Malformed(format!("dictionary member '{member}'")))?;
    let label = label.trim();
    if label.is_empty()
        || !label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.' | '*'))
    {
        return Err(SignatureError::Malformed(format!("label '{label}'")));
    }
    Ok((label, value.trim()))
}

fn parse_inner_list(label: &str, value: &str) -> Result<SignatureInput, SignatureError> {
    let body = value
        .strip_prefix('(')
        .ok_or_else(|| SignatureError::Malformed(format!("'{label}' is not an inner list")))?;
    let close = find_unquoted(body, ')')
        .ok_or_else(|| SignatureError::Malformed(format!("'{label}' has no closing ')'")))?;
    let (items, params) = (&body[..close], &body[close + 1..]);

    let mut components = Vec::new();
    for item in split_top_level(items, ' ') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        if find_unquoted(item, ';').is_some() {
            return Err(SignatureError::UnsupportedComponent(item.to_string()));
        }
        components.push(unquote(item)?);
    }

    let mut parsed = SignatureParams::default();
    for param in split_top_level(params, ';') {
        let param = param.trim();
        if param.is_empty() {
            continue;
        }
        let (name, raw_value) = param.split_once('=').unwrap_or((param, "?1"));
        match name.trim() {
            "keyid" => parsed.keyid = Some(unquote(raw_value)?),
            "alg" => parsed.alg = Some(unquote(raw_value)?),
            "nonce" => parsed.nonce = Some(unquote(raw_value)?),
            "tag" => parsed.tag = Some(unquote(raw_value)?),
            "created" => parsed.created = Some(parse_integer(raw_value)?),
            "expires" => parsed.expires = Some(parse_integer(raw_value)?),
            // Unknown parameters are covered by @signature-params but otherwise ignored
            _ => {}
        }
    }

    Ok(SignatureInput {
        label: label.to_string(),
        components,
        params: parsed,
        raw: value.to_string(),
    })
}

fn find_unquoted(input: &str, target: char) -> Option<usize> {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        if in_quotes {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_quotes = false,
                _ => {}
            }
        } else if c == '"' {
            in_quotes = true;
        } else if c == target {
            return Some(i);
        }
    }
    None
}

fn unquote(value: &str) -> Result<String, SignatureError> {
    let value = value.trim();
    let Some(inner) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) else {
        // Tokens are accepted bare
        return Ok(value.to_string());
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(escaped @ ('"' | '\\')) => out.push(escaped),
                _ => return Err(SignatureError::Malformed(format!("bad escape in {value}"))),
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

fn parse_integer(value: &str) -> Result<i64, SignatureError> {
    value
        .trim()
        .parse()
        .map_err(|_| SignatureError::Malformed(format!("expected integer, got '{value}'")))
}
