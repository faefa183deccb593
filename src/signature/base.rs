//! Signature base construction (RFC 9421 §2.5).

use super::SignatureError;
use super::params::SignatureInput;

/// Header access for signature base construction.
///
/// Names are looked up lower-cased.
pub trait HeaderLookup {
    /// The (combined) value of header `name`.
    fn header(&self, name: &str) -> Option<&str>;
}

impl HeaderLookup for std::collections::BTreeMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

/// The request as seen by the signer.
#[derive(Clone, Copy)]
pub struct SignedRequest<'a> {
    /// Request method.
    pub method: &'a str,
    /// `https` or `http`.
    pub scheme: &'a str,
    /// Host and optional port.
    pub authority: &'a str,
    /// Request target in origin form (`/path?query`).
    pub target: &'a str,
    /// Request headers.
    pub headers: &'a dyn HeaderLookup,
    /// Request body, when known.
    pub body: Option<&'a [u8]>,
}

impl std::fmt::Debug for SignedRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedRequest")
            .field("method", &self.method)
            .field("scheme", &self.scheme)
            .field("authority", &self.authority)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl SignedRequest<'_> {
    fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target, |(path, _)| path)
    }

    fn query(&self) -> &str {
        self.target.split_once('?').map_or("", |(_, query)| query)
    }

    /// `@target-uri`
    #[must_use]
    pub fn target_uri(&self) -> String {
        format!(
            "{}://{}{}",
            self.scheme.to_ascii_lowercase(),
            self.authority.to_ascii_lowercase(),
            self.target
        )
    }

    /// Resolve one component identifier to its canonical value.
    ///
    /// # Errors
    ///
    /// [`SignatureError::MissingComponent`] for an absent header,
    /// [`SignatureError::UnsupportedComponent`] for unknown derived components.
    pub fn component_value(&self, component: &str) -> Result<String, SignatureError> {
        let value = match component {
            "@method" => self.method.to_ascii_uppercase(),
            "@target-uri" => self.target_uri(),
            "@authority" => self.authority.to_ascii_lowercase(),
            "@scheme" => self.scheme.to_ascii_lowercase(),
            "@path" => self.path().to_string(),
            "@query" => format!("?{}", self.query()),
            "@request-target" => self.target.to_string(),
            derived if derived.starts_with('@') => {
                return Err(SignatureError::UnsupportedComponent(derived.to_string()));
            }
            header => self
                .headers
                .header(&header.to_ascii_lowercase())
                .map(|v| v.trim().to_string())
                .ok_or_else(|| SignatureError::MissingComponent(header.to_string()))?,
        };
        Ok(value)
    }
}

/// Build the signature base for `input` over `request`.
///
/// # Errors
///
/// Propagates [`SignedRequest::component_value`] failures, and rejects
/// components covered twice.
pub fn signature_base(
    request: &SignedRequest<'_>,
    input: &SignatureInput,
) -> Result<String, SignatureError> {
    let mut lines = Vec::with_capacity(input.components.len() + 1);
    for (i, component) in input.components.iter().enumerate() {
        if input.components[..i].contains(component) {
            return Err(SignatureError::Malformed(format!(
                "component '{component}' covered twice"
            )));
        }
        let value = request.component_value(component)?;
        lines.push(format!("\"{component}\": {value}"));
    }
    lines.push(format!("\"@signature-params\": {}", input.raw));
    Ok(lines.join("\n"))
}
