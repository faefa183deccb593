//! Detached signature verification.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256, Sha512};
use tracing::trace;

use super::SignatureError;
use super::base::{HeaderLookup, SignedRequest, signature_base};
use super::params::{
    SignatureInput, decode_byte_sequence, parse_signature_input, parse_signatures,
    split_top_level,
};
use crate::keys::{PublicKeyMaterial, SignatureAlgorithm};

/// Freshness limits applied to `created` / `expires`.
#[derive(Debug, Clone, Copy)]
pub struct VerificationPolicy {
    /// Reject signatures created longer ago than this.
    pub max_age: Option<Duration>,
    /// Tolerated clock difference for `created` in the future.
    pub clock_skew: Duration,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self {
            max_age: Some(Duration::from_secs(300)),
            clock_skew: Duration::from_secs(60),
        }
    }
}

/// The signature selected from a request's headers.
#[derive(Debug, Clone)]
pub struct SelectedSignature {
    /// Parsed `Signature-Input` member.
    pub input: SignatureInput,
    /// Raw signature bytes.
    pub signature: Vec<u8>,
}

impl SelectedSignature {
    /// The `keyid` parameter.
    #[must_use]
    pub fn keyid(&self) -> Option<&str> {
        self.input.params.keyid.as_deref()
    }
}

/// Pick the first `Signature-Input` member that has a matching `Signature`.
///
/// # Errors
///
/// [`SignatureError::MissingHeader`] if either header is absent,
/// [`SignatureError::NoMatchingSignature`] if no label appears in both.
pub fn select_signature(headers: &dyn HeaderLookup) -> Result<SelectedSignature, SignatureError> {
    let input_header = headers
        .header("signature-input")
        .ok_or(SignatureError::MissingHeader("Signature-Input"))?;
    let signature_header = headers
        .header("signature")
        .ok_or(SignatureError::MissingHeader("Signature"))?;

    let inputs = parse_signature_input(input_header)?;
    let mut signatures = parse_signatures(signature_header)?;

    for input in inputs {
        if let Some(pos) = signatures.iter().position(|(label, _)| *label == input.label) {
            let (_, signature) = signatures.swap_remove(pos);
            return Ok(SelectedSignature { input, signature });
        }
    }
    Err(SignatureError::NoMatchingSignature)
}

/// Verify `selected` over `request` with `key`.
///
/// The algorithm is the `alg` parameter when present, otherwise inferred from
/// the key (and the JWK `alg` hint for RSA).
///
/// # Errors
///
/// Any [`SignatureError`]; each one means the request is not authorized by
/// this signature.
pub fn verify_signature(
    request: &SignedRequest<'_>,
    selected: &SelectedSignature,
    key: &PublicKeyMaterial,
    jwk_alg: Option<&str>,
    policy: &VerificationPolicy,
) -> Result<SignatureAlgorithm, SignatureError> {
    let input = &selected.input;
    check_freshness(input, policy, unix_now())?;

    let alg = match input.params.alg.as_deref() {
        Some(name) => SignatureAlgorithm::from_name(name)
            .ok_or_else(|| SignatureError::UnsupportedAlgorithm(name.to_string()))?,
        None => key.default_algorithm(jwk_alg),
    };

    if input.covers("content-digest") {
        check_content_digest(request)?;
    }

    let base = signature_base(request, input)?;
    trace!(label = %input.label, alg = alg.name(), "verifying signature base");
    key.verify(alg, base.as_bytes(), &selected.signature)?;
    Ok(alg)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

fn check_freshness(
    input: &SignatureInput,
    policy: &VerificationPolicy,
    now: i64,
) -> Result<(), SignatureError> {
    let skew = i64::try_from(policy.clock_skew.as_secs()).unwrap_or(i64::MAX);

    if let Some(expires) = input.params.expires {
        if now > expires {
            return Err(SignatureError::Expired);
        }
    }
    if let Some(created) = input.params.created {
        if created > now.saturating_add(skew) {
            return Err(SignatureError::CreatedInFuture);
        }
        if let Some(max_age) = policy.max_age {
            let max_age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
            if now.saturating_sub(created) > max_age {
                return Err(SignatureError::TooOld);
            }
        }
    }
    Ok(())
}

/// Check `Content-Digest` against the body (RFC 9530).
fn check_content_digest(request: &SignedRequest<'_>) -> Result<(), SignatureError> {
    let header = request
        .headers
        .header("content-digest")
        .ok_or_else(|| SignatureError::MissingComponent("content-digest".into()))?;
    let body = request.body.unwrap_or_default();

    let mut supported = false;
    for member in split_top_level(header, ',') {
        let Some((alg, value)) = member.trim().split_once('=') else {
            continue;
        };
        let computed = match alg.trim() {
            "sha-256" => Sha256::digest(body).to_vec(),
            "sha-512" => Sha512::digest(body).to_vec(),
            _ => continue,
        };
        supported = true;
        if decode_byte_sequence(value)? != computed {
            trace!(
                alg,
                expected = %STANDARD.encode(&computed),
                "content digest mismatch"
            );
            return Err(SignatureError::ContentDigestMismatch);
        }
    }

    if supported {
        Ok(())
    } else {
        Err(SignatureError::UnsupportedAlgorithm(format!(
            "content-digest '{header}'"
        )))
    }
}
