//! HTTP message signatures (RFC 9421), verification side.
//!
//! The gateway only ever verifies: it selects the first labelled signature
//! that has both a `Signature-Input` and a `Signature` member, rebuilds the
//! signature base from the raw request, and checks it with whatever key the
//! authorization engine resolved for the `keyid`.

pub mod base;
pub mod params;
pub mod verify;

use thiserror::Error;

use crate::keys::KeyError;

pub use base::{HeaderLookup, SignedRequest, signature_base};
pub use params::{SignatureInput, SignatureParams, parse_signature_input, parse_signatures};
pub use verify::{SelectedSignature, VerificationPolicy, select_signature, verify_signature};

/// Reasons a detached signature does not verify.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// A required signature header is absent.
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    /// Header syntax not understood.
    #[error("malformed signature header: {0}")]
    Malformed(String),

    /// No label is present in both `Signature-Input` and `Signature`.
    #[error("no Signature member matches Signature-Input")]
    NoMatchingSignature,

    /// `alg` names an algorithm this gateway does not verify.
    #[error("unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),

    /// A covered component is not present in the request.
    #[error("covered component {0} is missing")]
    MissingComponent(String),

    /// A covered component cannot be derived.
    #[error("unsupported component {0}")]
    UnsupportedComponent(String),

    /// `expires` is in the past.
    #[error("signature expired")]
    Expired,

    /// `created` is older than the allowed age.
    #[error("signature too old")]
    TooOld,

    /// `created` is in the future.
    #[error("signature created in the future")]
    CreatedInFuture,

    /// `Content-Digest` does not match the body.
    #[error("content digest mismatch")]
    ContentDigestMismatch,

    /// Key or cryptographic failure.
    #[error(transparent)]
    Key(#[from] KeyError),
}
