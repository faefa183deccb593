//! Registry client
//!
//! The Registry is an external directory of agents and their signing keys.
//! Every lookup is a fresh round trip; nothing is cached here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::keys::Jwk;
use crate::{Error, Result};

/// Agent lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// May authenticate.
    Active,
    /// Deactivated.
    Inactive,
    /// Any status this gateway does not know.
    #[serde(other)]
    Unknown,
}

/// `GET /agents/{id}` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Agent identity.
    #[serde(default)]
    pub id: Option<String>,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Agent's domain.
    #[serde(default)]
    pub domain: Option<String>,
    /// Lifecycle state.
    pub status: AgentStatus,
}

impl AgentRecord {
    /// Whether the agent may authenticate.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }
}

/// Key lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// Usable.
    Active,
    /// Withdrawn by its owner.
    Revoked,
}

/// `GET /keys/{kid}` response: a JWK plus registry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Public key.
    #[serde(flatten)]
    pub jwk: Jwk,
    /// Owning agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Lifecycle state; absent means active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<KeyStatus>,
    /// Registration time, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
}

impl KeyRecord {
    /// Whether the key has been revoked.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.status == Some(KeyStatus::Revoked)
    }
}

/// Agent and key directory.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Look up an agent by identity.
    ///
    /// # Errors
    ///
    /// `Error::AgentNotFound` for unknown agents; transport or protocol
    /// errors otherwise.
    async fn agent(&self, id: &str) -> Result<AgentRecord>;

    /// Look up a usable signing key by key id.
    ///
    /// # Errors
    ///
    /// `Error::KeyNotFound` for unknown or revoked keys; transport or
    /// protocol errors otherwise.
    async fn key(&self, kid: &str) -> Result<KeyRecord>;
}

/// [`Registry`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    base: Url,
    client: Client,
}

impl HttpRegistry {
    /// A client for the Registry at `base_url`.
    ///
    /// # Errors
    ///
    /// `Error::Config` for an unusable URL.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("Invalid registry URL '{base_url}': {e}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "Invalid registry URL '{base_url}': not a base URL"
            )));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { base, client })
    }

    fn url(&self, collection: &str, id: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(collection).push(id);
        }
        url
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        url: Url,
        not_found: impl FnOnce() -> Error,
    ) -> Result<T> {
        debug!(%url, "Registry lookup");
        let response = self.client.get(url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(not_found()),
            status if status.is_success() => Ok(response.json().await?),
            status => Err(Error::Registry(format!("unexpected status {status}"))),
        }
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn agent(&self, id: &str) -> Result<AgentRecord> {
        self.get(self.url("agents", id), || Error::AgentNotFound(id.to_string()))
            .await
    }

    async fn key(&self, kid: &str) -> Result<KeyRecord> {
        let record: KeyRecord = self
            .get(self.url("keys", kid), || Error::KeyNotFound(kid.to_string()))
            .await?;
        if record.is_revoked() {
            debug!(kid, "Registry key is revoked");
            return Err(Error::KeyNotFound(kid.to_string()));
        }
        Ok(record)
    }
}
