//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::keys::KeyAlgorithm;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before `${VAR}` expansion.
    /// Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Trust gateway configuration
    pub gateway: GatewayConfig,
    /// Certificate authority configuration
    pub authority: AuthorityConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // TAP_GATEWAY__PORT=8443 sets gateway.port
        figment = figment.merge(Env::prefixed("TAP_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let path = Path::new(path_str);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {path_str}"),
                    Err(e) => tracing::warn!("Failed to load env file {path_str}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {path_str}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in URLs and paths
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(format!("env pattern: {e}")))?;

        let gateway = &mut self.gateway;
        for value in [
            &mut gateway.upstream_url,
            &mut gateway.registry_url,
            &mut gateway.tls.server_cert,
            &mut gateway.tls.server_key,
        ] {
            *value = Self::expand_string(&re, value);
        }
        if let Some(url) = gateway.authority_url.as_mut() {
            *url = Self::expand_string(&re, url);
        }
        if let Some(dir) = self.authority.data_dir.as_mut() {
            *dir = Self::expand_string(&re, dir);
        }
        Ok(())
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Gateway
// ─────────────────────────────────────────────────────────────────────────────

/// Trust gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// TLS termination
    pub tls: GatewayTlsConfig,
    /// Upstream (backend) base URL requests are relayed to
    pub upstream_url: String,
    /// Registry base URL for agent and key lookups
    pub registry_url: String,
    /// Base URL serving `/authority/cert`; defaults to `registry_url`
    pub authority_url: Option<String>,
    /// Liveness path answered without authorization
    pub diagnostic_path: String,
    /// Body returned on the diagnostic path
    pub diagnostic_body: String,
    /// Public path prefixes remapped before relay, first match wins
    pub path_rewrites: Vec<PathRewrite>,
    /// Time allowed for a client to send its request head (and body)
    #[serde(with = "humantime_serde")]
    pub header_timeout: Duration,
    /// Time allowed for the upstream to answer with a status line
    #[serde(with = "humantime_serde")]
    pub upstream_timeout: Duration,
    /// Largest accepted request head
    pub max_header_bytes: usize,
    /// Largest accepted request body, after chunked decoding
    pub max_body_bytes: usize,
    /// Re-fetch the CA root at this interval
    #[serde(with = "humantime_serde")]
    pub root_refresh_interval: Option<Duration>,
    /// Reject signatures whose `created` is older than this
    #[serde(with = "humantime_serde")]
    pub max_signature_age: Option<Duration>,
    /// Log denial reasons at info level
    pub verbose_denials: bool,
    /// `@authority` used for signature bases when the request has no `Host`
    pub public_authority: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            tls: GatewayTlsConfig::default(),
            upstream_url: "http://localhost:3000".to_string(),
            registry_url: "http://localhost:9002".to_string(),
            authority_url: None,
            diagnostic_path: "/test-proxy".to_string(),
            diagnostic_body: "Proxy Active".to_string(),
            path_rewrites: vec![PathRewrite {
                from: "/product/".to_string(),
                to: "/api/products/".to_string(),
            }],
            header_timeout: Duration::from_secs(10),
            upstream_timeout: Duration::from_secs(30),
            max_header_bytes: 64 * 1024,
            max_body_bytes: 10 * 1024 * 1024,
            root_refresh_interval: None,
            max_signature_age: Some(Duration::from_secs(300)),
            verbose_denials: false,
            public_authority: None,
        }
    }
}

impl GatewayConfig {
    /// Base URL the CA root is fetched from.
    #[must_use]
    pub fn authority_base_url(&self) -> &str {
        self.authority_url.as_deref().unwrap_or(&self.registry_url)
    }

    /// Apply the first matching path rewrite.
    #[must_use]
    pub fn rewrite_path(&self, path: &str) -> String {
        PathRewrite::apply(&self.path_rewrites, path)
    }
}

/// TLS termination settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayTlsConfig {
    /// Terminate TLS (plain TCP when false)
    pub enabled: bool,
    /// PEM server certificate chain
    pub server_cert: String,
    /// PEM server private key
    pub server_key: String,
    /// Ask clients for a certificate during the handshake
    pub request_client_cert: bool,
}

impl Default for GatewayTlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server_cert: "tls/server.crt".to_string(),
            server_key: "tls/server.key".to_string(),
            request_client_cert: true,
        }
    }
}

/// A public-to-upstream path prefix mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRewrite {
    /// Public prefix
    pub from: String,
    /// Upstream prefix
    pub to: String,
}

impl PathRewrite {
    /// Rewrite `path` with the first rule whose prefix matches.
    #[must_use]
    pub fn apply(rules: &[Self], path: &str) -> String {
        rules
            .iter()
            .find_map(|rule| {
                path.strip_prefix(rule.from.as_str())
                    .map(|rest| format!("{}{rest}", rule.to))
            })
            .unwrap_or_else(|| path.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Authority
// ─────────────────────────────────────────────────────────────────────────────

/// Certificate authority configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Directory holding `ca-key.pem` / `ca-cert.pem`; in-memory when unset
    pub data_dir: Option<String>,
    /// Root certificate Common Name
    pub common_name: String,
    /// Root certificate Organisation
    pub organization: String,
    /// Root key algorithm
    pub key_algorithm: KeyAlgorithm,
    /// Root certificate lifetime
    pub root_validity_days: u32,
    /// Issued certificate lifetime
    pub validity_days: u32,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9003,
            data_dir: None,
            common_name: "Trusted Agent Protocol Root CA".to_string(),
            organization: "TAP Registry".to_string(),
            key_algorithm: KeyAlgorithm::default(),
            root_validity_days: 3650,
            validity_days: 365,
        }
    }
}
