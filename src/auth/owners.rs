//! Workload-owner allowlist.
//!
//! On a small-stack hypervisor a VM can learn who owns it from the link-local
//! metadata service. When enabled, callers whose username or group appears in
//! that ownership record are treated as holding every method power.
//!
//! This trusts anything reachable at the metadata address, with no mutual
//! authentication, so it is off unless explicitly switched on.

use super::AuthInformation;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Path below the metadata URL answering `true` on a small-stack host.
pub const SMALL_STACK_DATASOURCE_PATH: &str = "/datasource/SmallStack";

/// Path below the metadata URL serving the VM identity document.
pub const IDENTITY_DOCUMENT_PATH: &str = "/latest/dynamic/instance-identity/document";

/// Path below the metadata URL serving the VM's identity certificate (PEM).
pub const IDENTITY_CERT_PATH: &str = "/latest/dynamic/instance-identity/X.509-certificate";

/// Path below the metadata URL serving the key for [`IDENTITY_CERT_PATH`].
pub const IDENTITY_KEY_PATH: &str = "/latest/dynamic/instance-identity/X.509-key";

/// Owners recorded for the workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OwnerSet {
    #[serde(rename = "OwnerUsers", default)]
    pub users: BTreeSet<String>,
    #[serde(rename = "OwnerGroups", default)]
    pub groups: BTreeSet<String>,
}

impl OwnerSet {
    pub fn admits(&self, auth: &AuthInformation) -> bool {
        if auth.username.is_empty() {
            return false;
        }
        self.users.contains(&auth.username)
            || self.groups.iter().any(|g| auth.group_list.contains(g))
    }
}

/// Shared, refreshable view of the workload owners.
#[derive(Debug, Clone, Default)]
pub struct OwnerAllowlist {
    owners: Arc<RwLock<Option<OwnerSet>>>,
}

impl OwnerAllowlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, owners: Option<OwnerSet>) {
        *self.owners.write() = owners;
    }

    pub fn current(&self) -> Option<OwnerSet> {
        self.owners.read().clone()
    }

    /// Anonymous callers are never admitted.
    pub fn admits(&self, auth: &AuthInformation) -> bool {
        self.owners
            .read()
            .as_ref()
            .is_some_and(|owners| owners.admits(auth))
    }

    /// Start refreshing from `source` every `interval`.
    ///
    /// The task ends immediately if the source reports that this host is not
    /// a small-stack VM.
    pub fn spawn_refresher(
        &self,
        source: Arc<dyn OwnerSource>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let allowlist = self.clone();
        tokio::spawn(async move {
            if !source.is_small_stack().await {
                debug!("not running on a small stack, owner allowlist stays empty");
                return;
            }
            info!("running on a small stack: granting method access to VM owners");
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match source.fetch_owners().await {
                    Ok(owners) => {
                        debug!(users = ?owners.users, groups = ?owners.groups, "refreshed VM owners");
                        allowlist.set(Some(owners));
                    }
                    Err(e) => warn!("failed to refresh VM owners: {}", e),
                }
            }
        })
    }
}

/// Where ownership information comes from.
#[async_trait]
pub trait OwnerSource: Send + Sync {
    async fn is_small_stack(&self) -> bool;
    async fn fetch_owners(&self) -> Result<OwnerSet>;
}

/// Reads ownership from an HTTP metadata service.
pub struct MetadataService {
    client: reqwest::Client,
    base_url: String,
}

impl MetadataService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("metadata client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the body of `path` below the metadata URL.
    pub async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::Http(format!("{url}: {}", resp.status())));
        }
        let body = resp.bytes().await.map_err(|e| Error::Http(e.to_string()))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl OwnerSource for MetadataService {
    async fn is_small_stack(&self) -> bool {
        let url = format!("{}{}", self.base_url, SMALL_STACK_DATASOURCE_PATH);
        let Ok(resp) = self.client.get(&url).send().await else {
            return false;
        };
        if !resp.status().is_success() {
            return false;
        }
        resp.text()
            .await
            .map(|body| body.starts_with("true"))
            .unwrap_or(false)
    }

    async fn fetch_owners(&self) -> Result<OwnerSet> {
        let body = self.fetch(IDENTITY_DOCUMENT_PATH).await?;
        serde_json::from_slice(&body).map_err(|e| Error::Decode(e.to_string()))
    }
}
