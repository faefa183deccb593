//! Cached CA trust root.
//!
//! Fetched from the authority once at startup, optionally refreshed on an
//! interval. Readers take a cheap `Arc` clone and never wait on a fetch.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::Client;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::mtls::RootCertificate;
use crate::{Error, Result};

/// The CA root the gateway verifies certificates against.
#[derive(Debug)]
pub struct TrustRoot {
    cert_url: String,
    client: Client,
    current: RwLock<Option<Arc<RootCertificate>>>,
}

impl TrustRoot {
    /// A trust root fetched from `{authority_base_url}/authority/cert`.
    ///
    /// # Errors
    ///
    /// HTTP client construction failures.
    pub fn new(authority_base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            cert_url: format!("{}/authority/cert", authority_base_url.trim_end_matches('/')),
            client: Client::builder().timeout(timeout).build()?,
            current: RwLock::new(None),
        })
    }

    /// A trust root pinned to `root` (no fetch needed).
    ///
    /// # Errors
    ///
    /// HTTP client construction failures.
    pub fn pinned(root: RootCertificate) -> Result<Self> {
        let trust = Self::new("http://localhost", Duration::from_secs(10))?;
        trust.set(root);
        Ok(trust)
    }

    /// The current root, if one has been loaded.
    #[must_use]
    pub fn current(&self) -> Option<Arc<RootCertificate>> {
        self.current.read().clone()
    }

    /// Replace the root.
    pub fn set(&self, root: RootCertificate) {
        *self.current.write() = Some(Arc::new(root));
    }

    /// Fetch the root from the authority and install it.
    ///
    /// On failure the previous root (if any) stays in place.
    ///
    /// # Errors
    ///
    /// Transport errors, non-success status, or a response that is not a CA
    /// certificate.
    pub async fn refresh(&self) -> Result<()> {
        debug!(url = %self.cert_url, "Fetching CA root");
        let response = self.client.get(&self.cert_url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Registry(format!(
                "CA root fetch returned {}",
                response.status()
            )));
        }
        let pem = response.text().await?;
        let root = RootCertificate::from_pem(&pem)?;

        let changed = self
            .current()
            .is_none_or(|existing| existing.der() != root.der());
        if changed {
            info!(
                subject = root.identity().common_name.as_deref().unwrap_or("<none>"),
                fingerprint = %root.fingerprint(),
                "CA root certificate loaded"
            );
        }
        self.set(root);
        Ok(())
    }

    /// Initial load; failures are logged and leave the root unavailable.
    pub async fn bootstrap(&self) {
        if let Err(e) = self.refresh().await {
            warn!(
                url = %self.cert_url,
                error = %e,
                "Could not fetch CA root; certificate chain checks disabled until it loads"
            );
        }
    }

    /// Refresh every `interval` until `shutdown` fires.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let trust = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately; bootstrap already ran.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = trust.refresh().await {
                            warn!(error = %e, "CA root refresh failed, keeping previous root");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}
