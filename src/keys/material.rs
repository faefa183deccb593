//! Algorithm-agnostic public and private key material.

use aws_lc_rs::signature::{
    ECDSA_P256_SHA256_FIXED, ED25519, RSA_PKCS1_2048_8192_SHA256, RSA_PSS_2048_8192_SHA512,
    RsaPublicKeyComponents, UnparsedPublicKey,
};
use rcgen::{KeyPair, PublicKeyData, SigningKey};
use x509_parser::oid_registry::asn1_rs::oid;
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;
use x509_parser::x509::SubjectPublicKeyInfo;

use super::jwk::{Jwk, encode_member};
use super::{KeyAlgorithm, KeyError, SignatureAlgorithm};

const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];
const P256_SPKI_PREFIX: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08,
    0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];
/// `AlgorithmIdentifier { rsaEncryption, NULL }`
const RSA_ALGORITHM_ID: [u8; 15] = [
    0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01, 0x05, 0x00,
];

// ─────────────────────────────────────────────────────────────────────────────
// Public keys
// ─────────────────────────────────────────────────────────────────────────────

/// A verification key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKeyMaterial {
    /// RSA modulus and exponent, big-endian without leading zeros.
    Rsa {
        /// Modulus.
        n: Vec<u8>,
        /// Public exponent.
        e: Vec<u8>,
    },
    /// Uncompressed P-256 point coordinates.
    EcP256 {
        /// x coordinate (32 bytes).
        x: Vec<u8>,
        /// y coordinate (32 bytes).
        y: Vec<u8>,
    },
    /// Raw Ed25519 public key (32 bytes).
    Ed25519 {
        /// Public key bytes.
        x: Vec<u8>,
    },
}

impl PublicKeyMaterial {
    /// Build from a DER `SubjectPublicKeyInfo`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Unsupported`] for key types other than RSA,
    /// EC P-256 and Ed25519.
    pub fn from_spki_der(der: &[u8]) -> Result<Self, KeyError> {
        let (_, spki) = SubjectPublicKeyInfo::from_der(der)
            .map_err(|e| KeyError::Malformed(format!("SubjectPublicKeyInfo: {e}")))?;
        Self::from_spki(&spki)
    }

    /// Build from an already parsed `SubjectPublicKeyInfo`.
    ///
    /// # Errors
    ///
    /// See [`Self::from_spki_der`].
    pub fn from_spki(spki: &SubjectPublicKeyInfo<'_>) -> Result<Self, KeyError> {
        let rsa_oid = oid!(1.2.840 .113549 .1 .1 .1);
        let ec_oid = oid!(1.2.840 .10045 .2 .1);
        let p256_oid = oid!(1.2.840 .10045 .3 .1 .7);
        let ed25519_oid = oid!(1.3.101 .112);

        let algorithm = &spki.algorithm.algorithm;
        let key_data = &*spki.subject_public_key.data;

        if *algorithm == ed25519_oid {
            if key_data.len() != 32 {
                return Err(KeyError::Malformed(format!(
                    "Ed25519 key must be 32 bytes, got {}",
                    key_data.len()
                )));
            }
            return Ok(Self::Ed25519 {
                x: key_data.to_vec(),
            });
        }

        if *algorithm == ec_oid {
            let curve = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|p| p.as_oid().ok())
                .ok_or_else(|| KeyError::Malformed("EC key missing curve parameters".into()))?;
            if curve != p256_oid {
                return Err(KeyError::Unsupported(format!("EC curve {curve}")));
            }
            return Self::from_ec_point(key_data);
        }

        if *algorithm == rsa_oid {
            return match spki.parsed() {
                Ok(PublicKey::RSA(rsa)) => Ok(Self::Rsa {
                    n: strip_leading_zeros(rsa.modulus).to_vec(),
                    e: strip_leading_zeros(rsa.exponent).to_vec(),
                }),
                Ok(_) => Err(KeyError::Malformed("RSA key body".into())),
                Err(e) => Err(KeyError::Malformed(format!("RSA key body: {e}"))),
            };
        }

        Err(KeyError::Unsupported(format!("key algorithm {algorithm}")))
    }

    /// Build from a JSON Web Key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Unsupported`] for unknown `kty`/`crv` and
    /// [`KeyError::Malformed`] for missing or mis-sized members.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, KeyError> {
        match (jwk.kty.as_str(), jwk.crv.as_deref()) {
            ("OKP", Some("Ed25519")) => {
                let x = jwk.member("x")?;
                if x.len() != 32 {
                    return Err(KeyError::Malformed("Ed25519 'x' must be 32 bytes".into()));
                }
                Ok(Self::Ed25519 { x })
            }
            ("EC", Some("P-256")) => {
                let x = jwk.member("x")?;
                let y = jwk.member("y")?;
                if x.len() != 32 || y.len() != 32 {
                    return Err(KeyError::Malformed("P-256 coordinates must be 32 bytes".into()));
                }
                Ok(Self::EcP256 { x, y })
            }
            ("RSA", _) => Ok(Self::Rsa {
                n: strip_leading_zeros(&jwk.member("n")?).to_vec(),
                e: strip_leading_zeros(&jwk.member("e")?).to_vec(),
            }),
            (kty, crv) => Err(KeyError::Unsupported(format!(
                "JWK kty={kty} crv={}",
                crv.unwrap_or("-")
            ))),
        }
    }

    fn from_ec_point(point: &[u8]) -> Result<Self, KeyError> {
        if point.len() != 65 || point[0] != 0x04 {
            return Err(KeyError::Malformed(format!(
                "expected uncompressed EC point (65 bytes), got {} bytes",
                point.len()
            )));
        }
        Ok(Self::EcP256 {
            x: point[1..33].to_vec(),
            y: point[33..65].to_vec(),
        })
    }

    /// Short key-type label used in logs and errors.
    #[must_use]
    pub fn key_type(&self) -> &'static str {
        match self {
            Self::Rsa { .. } => "RSA",
            Self::EcP256 { .. } => "EC P-256",
            Self::Ed25519 { .. } => "Ed25519",
        }
    }

    /// The algorithm used when a signature does not declare `alg`.
    ///
    /// RSA keys default to PKCS#1 v1.5 unless the JWK hint says `PS512`.
    #[must_use]
    pub fn default_algorithm(&self, jwk_alg: Option<&str>) -> SignatureAlgorithm {
        match self {
            Self::Ed25519 { .. } => SignatureAlgorithm::Ed25519,
            Self::EcP256 { .. } => SignatureAlgorithm::EcdsaP256Sha256,
            Self::Rsa { .. } if jwk_alg == Some("PS512") => SignatureAlgorithm::RsaPssSha512,
            Self::Rsa { .. } => SignatureAlgorithm::RsaV15Sha256,
        }
    }

    /// DER `SubjectPublicKeyInfo` encoding.
    #[must_use]
    pub fn to_spki_der(&self) -> Vec<u8> {
        match self {
            Self::Ed25519 { x } => [&ED25519_SPKI_PREFIX[..], x.as_slice()].concat(),
            Self::EcP256 { x, y } => [&P256_SPKI_PREFIX[..], &[0x04][..], x.as_slice(), y.as_slice()].concat(),
            Self::Rsa { n, e } => {
                let rsa_key = der_tlv(0x30, &[der_uint(n), der_uint(e)].concat());
                let bit_string = der_tlv(0x03, &[&[0x00][..], &rsa_key[..]].concat());
                der_tlv(0x30, &[&RSA_ALGORITHM_ID[..], &bit_string[..]].concat())
            }
        }
    }

    /// PEM `PUBLIC KEY` encoding.
    #[must_use]
    pub fn public_key_pem(&self) -> String {
        pem::encode(&pem::Pem::new("PUBLIC KEY", self.to_spki_der()))
    }

    /// JSON Web Key encoding with the given key id.
    #[must_use]
    pub fn to_jwk(&self, kid: Option<&str>) -> Jwk {
        let mut jwk = Jwk {
            kid: kid.map(str::to_string),
            key_use: Some("sig".to_string()),
            ..Jwk::default()
        };
        match self {
            Self::Ed25519 { x } => {
                jwk.kty = "OKP".into();
                jwk.crv = Some("Ed25519".into());
                jwk.alg = Some("EdDSA".into());
                jwk.x = Some(encode_member(x));
            }
            Self::EcP256 { x, y } => {
                jwk.kty = "EC".into();
                jwk.crv = Some("P-256".into());
                jwk.alg = Some("ES256".into());
                jwk.x = Some(encode_member(x));
                jwk.y = Some(encode_member(y));
            }
            Self::Rsa { n, e } => {
                jwk.kty = "RSA".into();
                jwk.alg = Some("RS256".into());
                jwk.n = Some(encode_member(n));
                jwk.e = Some(encode_member(e));
            }
        }
        jwk
    }

    /// Verify `signature` over `message` with `alg`.
    ///
    /// # Errors
    ///
    /// [`KeyError::AlgorithmMismatch`] when `alg` does not fit the key type,
    /// [`KeyError::BadSignature`] when the signature does not verify.
    pub fn verify(
        &self,
        alg: SignatureAlgorithm,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), KeyError> {
        let outcome = match (self, alg) {
            (Self::Ed25519 { x }, SignatureAlgorithm::Ed25519) => {
                UnparsedPublicKey::new(&ED25519, x).verify(message, signature)
            }
            (Self::EcP256 { x, y }, SignatureAlgorithm::EcdsaP256Sha256) => {
                let point = [&[0x04][..], x.as_slice(), y.as_slice()].concat();
                UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, point).verify(message, signature)
            }
            (Self::Rsa { n, e }, SignatureAlgorithm::RsaV15Sha256) => {
                RsaPublicKeyComponents { n: &n[..], e: &e[..] }.verify(
                    &RSA_PKCS1_2048_8192_SHA256,
                    message,
                    signature,
                )
            }
            (Self::Rsa { n, e }, SignatureAlgorithm::RsaPssSha512) => {
                RsaPublicKeyComponents { n: &n[..], e: &e[..] }.verify(
                    &RSA_PSS_2048_8192_SHA512,
                    message,
                    signature,
                )
            }
            _ => {
                return Err(KeyError::AlgorithmMismatch {
                    alg: alg.name().to_string(),
                    key_type: self.key_type(),
                });
            }
        };
        outcome.map_err(|_| KeyError::BadSignature)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Private keys
// ─────────────────────────────────────────────────────────────────────────────

/// A private signing key.
pub struct SigningKeyMaterial {
    key_pair: KeyPair,
}

impl std::fmt::Debug for SigningKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyMaterial")
            .field("algorithm", PublicKeyData::algorithm(&self.key_pair))
            .finish_non_exhaustive()
    }
}

impl SigningKeyMaterial {
    /// Generate a fresh key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Generation`] if the crypto provider fails.
    pub fn generate(algorithm: KeyAlgorithm) -> Result<Self, KeyError> {
        KeyPair::generate_for(algorithm.rcgen_algorithm())
            .map(|key_pair| Self { key_pair })
            .map_err(|e| KeyError::Generation(e.to_string()))
    }

    /// Load a PKCS#8 PEM private key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Malformed`] if the PEM is not a usable key.
    pub fn from_pem(pem: &str) -> Result<Self, KeyError> {
        KeyPair::from_pem(pem)
            .map(|key_pair| Self { key_pair })
            .map_err(|e| KeyError::Malformed(format!("private key PEM: {e}")))
    }

    /// PKCS#8 PEM encoding of the private key.
    #[must_use]
    pub fn to_pem(&self) -> String {
        self.key_pair.serialize_pem()
    }

    /// PEM `PUBLIC KEY` encoding of the public half.
    #[must_use]
    pub fn public_key_pem(&self) -> String {
        self.key_pair.public_key_pem()
    }

    /// The public half as verification material.
    ///
    /// # Errors
    ///
    /// Propagates [`PublicKeyMaterial::from_spki_der`] failures.
    pub fn public_key(&self) -> Result<PublicKeyMaterial, KeyError> {
        PublicKeyMaterial::from_spki_der(&self.public_key_der()?)
    }

    /// DER `SubjectPublicKeyInfo` of the public half.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Malformed`] if the key cannot be encoded.
    pub fn public_key_der(&self) -> Result<Vec<u8>, KeyError> {
        pem::parse(self.key_pair.public_key_pem())
            .map(pem::Pem::into_contents)
            .map_err(|e| KeyError::Malformed(format!("public key PEM: {e}")))
    }

    /// JWK of the public half.
    ///
    /// # Errors
    ///
    /// See [`Self::public_key`].
    pub fn to_jwk(&self, kid: Option<&str>) -> Result<Jwk, KeyError> {
        Ok(self.public_key()?.to_jwk(kid))
    }

    /// Sign `message`.
    ///
    /// ECDSA signatures are returned fixed-width (`r || s`) so they verify
    /// as `ecdsa-p256-sha256`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Generation`] if signing fails.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        let signature = self
            .key_pair
            .sign(message)
            .map_err(|e| KeyError::Generation(format!("signing failed: {e}")))?;
        if PublicKeyData::algorithm(&self.key_pair) == &rcgen::PKCS_ECDSA_P256_SHA256 {
            return ecdsa_der_to_fixed(&signature);
        }
        Ok(signature)
    }

    /// An owned `rcgen` key pair for the same key, for APIs that consume one.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Malformed`] if the key does not re-load.
    pub(crate) fn to_key_pair(&self) -> Result<KeyPair, KeyError> {
        KeyPair::from_pem(&self.key_pair.serialize_pem())
            .map_err(|e| KeyError::Malformed(format!("private key PEM: {e}")))
    }

    pub(crate) fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DER helpers
// ─────────────────────────────────────────────────────────────────────────────

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

fn der_len(len: usize) -> Vec<u8> {
    if len < 0x80 {
        #[allow(clippy::cast_possible_truncation)]
        return vec![len as u8];
    }
    let bytes: Vec<u8> = len
        .to_be_bytes()
        .into_iter()
        .skip_while(|b| *b == 0)
        .collect();
    #[allow(clippy::cast_possible_truncation)]
    let mut out = vec![0x80 | bytes.len() as u8];
    out.extend(bytes);
    out
}

fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend(der_len(content.len()));
    out.extend_from_slice(content);
    out
}

fn der_uint(bytes: &[u8]) -> Vec<u8> {
    let trimmed = strip_leading_zeros(bytes);
    let mut content = Vec::with_capacity(trimmed.len() + 1);
    if trimmed.first().is_none_or(|b| b & 0x80 != 0) {
        content.push(0x00);
    }
    content.extend_from_slice(trimmed);
    der_tlv(0x02, &content)
}

/// `SEQUENCE { INTEGER r, INTEGER s }` to 64-byte `r || s`.
fn ecdsa_der_to_fixed(der: &[u8]) -> Result<Vec<u8>, KeyError> {
    let malformed = || KeyError::Malformed("ECDSA signature encoding".into());

    let (tag, body, _) = read_tlv(der).ok_or_else(malformed)?;
    if tag != 0x30 {
        return Err(malformed());
    }
    let (r_tag, r, rest) = read_tlv(body).ok_or_else(malformed)?;
    let (s_tag, s, _) = read_tlv(rest).ok_or_else(malformed)?;
    if r_tag != 0x02 || s_tag != 0x02 {
        return Err(malformed());
    }

    let mut out = vec![0u8; 64];
    for (value, offset) in [(r, 0usize), (s, 32usize)] {
        let value = strip_leading_zeros(value);
        if value.len() > 32 {
            return Err(malformed());
        }
        let start = offset + 32 - value.len();
        out[start..offset + 32].copy_from_slice(value);
    }
    Ok(out)
}

/// Short-form-or-one-byte-long-form TLV reader.
fn read_tlv(input: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, rest) = input.split_first()?;
    let (&first, rest) = rest.split_first()?;
    let (len, rest) = match first {
        0x81 => {
            let (&len, rest) = rest.split_first()?;
            (usize::from(len), rest)
        }
        len if len < 0x80 => (usize::from(len), rest),
        _ => return None,
    };
    (rest.len() >= len).then(|| (tag, &rest[..len], &rest[len..]))
}
