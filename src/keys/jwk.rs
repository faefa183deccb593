//! JSON Web Key (RFC 7517) representation of agent public keys.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use super::KeyError;

/// A public JSON Web Key as published by the Registry.
///
/// Only the members needed for RSA, EC and OKP public keys are modelled;
/// unknown members are ignored on input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type: `RSA`, `EC` or `OKP`.
    pub kty: String,

    /// Key id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    /// JOSE algorithm hint (`RS256`, `PS512`, `ES256`, `EdDSA`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,

    /// Intended use (`sig`).
    #[serde(default, rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,

    /// Curve for `EC` / `OKP` keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,

    /// EC x coordinate or OKP public key (base64url).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,

    /// EC y coordinate (base64url).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,

    /// RSA modulus (base64url).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,

    /// RSA public exponent (base64url).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

impl Jwk {
    /// Decode a required base64url member.
    pub(crate) fn member(&self, name: &'static str) -> Result<Vec<u8>, KeyError> {
        let value = match name {
            "x" => self.x.as_deref(),
            "y" => self.y.as_deref(),
            "n" => self.n.as_deref(),
            "e" => self.e.as_deref(),
            _ => None,
        }
        .ok_or_else(|| KeyError::Malformed(format!("JWK is missing member '{name}'")))?;

        URL_SAFE_NO_PAD
            .decode(value.trim_end_matches('='))
            .map_err(|e| KeyError::Malformed(format!("JWK member '{name}': {e}")))
    }
}

/// Base64url-encode without padding, as JWK members require.
pub(crate) fn encode_member(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}
