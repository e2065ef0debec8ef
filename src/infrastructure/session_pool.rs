//! Pool of independently authenticated portal sessions
//!
//! Builds N worker sessions, each with its own fingerprint, cookie jar and
//! assigned credential. Logins run sequentially with a short delay between
//! them; a simultaneous login burst is exactly what the portal's rate
//! limiter looks for. A session that keeps failing is hot-rotated onto a
//! fresh identity without halting the batch.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::entities::Credential;
use crate::infrastructure::config::{DownloaderConfig, PortalConfig};
use crate::infrastructure::fingerprint::{BrowserFingerprint, FingerprintPool};
use crate::infrastructure::http_client::PortalClient;

/// One worker's session state. Owned exclusively by its worker during a
/// batch; never shared across concurrent requests.
pub struct SessionSlot {
    pub index: usize,
    pub client: PortalClient,
    pub credential: Credential,
    pub error_count: u32,
    pub total_downloads: u64,
}

pub struct SessionPool {
    fingerprints: FingerprintPool,
    portal: Arc<PortalConfig>,
    inter_login_delay: Duration,
    slots: Vec<Arc<Mutex<SessionSlot>>>,
}

impl SessionPool {
    pub fn new(
        fingerprints: FingerprintPool,
        portal: Arc<PortalConfig>,
        downloader: &DownloaderConfig,
    ) -> Self {
        Self {
            fingerprints,
            portal,
            inter_login_delay: Duration::from_millis(downloader.inter_login_delay_ms),
            slots: Vec::new(),
        }
    }

    /// Plan (fingerprint, credential) pairs for `worker_count` sessions.
    ///
    /// Fingerprints are shuffled and wrap when there are fewer identities
    /// than workers; credentials are assigned round-robin over the enabled
    /// list, supporting both more and fewer workers than credentials.
    pub fn plan_assignments(
        fingerprints: &FingerprintPool,
        worker_count: usize,
        credentials: &[Credential],
    ) -> Result<Vec<(BrowserFingerprint, Credential)>> {
        let enabled: Vec<&Credential> = credentials.iter().filter(|c| c.enabled).collect();
        if enabled.is_empty() {
            anyhow::bail!("No enabled credentials available");
        }

        let shuffled = fingerprints.shuffled();
        let assignments = (0..worker_count)
            .map(|i| {
                (
                    shuffled[i % shuffled.len()].clone(),
                    enabled[i % enabled.len()].clone(),
                )
            })
            .collect();
        Ok(assignments)
    }

    /// Build and log in `worker_count` sessions. Returns the healthy count;
    /// the caller must treat zero as fatal to the batch.
    pub async fn initialize(
        &mut self,
        worker_count: usize,
        credentials: &[Credential],
    ) -> Result<usize> {
        let assignments =
            Self::plan_assignments(&self.fingerprints, worker_count, credentials)?;

        self.slots.clear();
        for (index, (fingerprint, credential)) in assignments.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.inter_login_delay).await;
            }

            let fingerprint_name = fingerprint.name.clone();
            let client = match PortalClient::new(fingerprint, Arc::clone(&self.portal)) {
                Ok(client) => client,
                Err(err) => {
                    warn!("Failed to build client for worker {}: {}", index, err);
                    continue;
                }
            };

            match client.login(&credential).await {
                Ok(()) => {
                    info!(
                        "Worker {} logged in as '{}' ({})",
                        index, credential.label, fingerprint_name
                    );
                    self.slots.push(Arc::new(Mutex::new(SessionSlot {
                        index,
                        client,
                        credential,
                        error_count: 0,
                        total_downloads: 0,
                    })));
                }
                Err(err) => {
                    warn!(
                        "Worker {} login failed for '{}' ({}): {}",
                        index, credential.label, fingerprint_name, err
                    );
                }
            }
        }

        info!(
            "Session pool ready: {}/{} sessions healthy",
            self.slots.len(),
            worker_count
        );
        Ok(self.slots.len())
    }

    /// Replace a flagged session with a fresh identity and re-login using
    /// the same credential. Resets the error counter; `total_downloads`
    /// keeps counting across rotations.
    pub async fn rotate(&self, slot: &mut SessionSlot) -> Result<()> {
        let fresh = self
            .fingerprints
            .pick_excluding(&slot.client.fingerprint().name);
        let fresh_name = fresh.name.clone();

        let client = PortalClient::new(fresh, Arc::clone(&self.portal))
            .context("Failed to build rotated client")?;
        client
            .login(&slot.credential)
            .await
            .context("Re-login failed during session rotation")?;

        info!(
            "Rotated worker {} onto fingerprint {} (kept credential '{}')",
            slot.index, fresh_name, slot.credential.label
        );
        slot.client = client;
        slot.error_count = 0;
        Ok(())
    }

    /// Healthy session slots, one per worker.
    pub fn slots(&self) -> Vec<Arc<Mutex<SessionSlot>>> {
        self.slots.clone()
    }

    /// The first healthy session, used for the single discovery request.
    pub fn primary(&self) -> Option<Arc<Mutex<SessionSlot>>> {
        self.slots.first().cloned()
    }

    pub fn healthy_count(&self) -> usize {
        self.slots.len()
    }

    /// Inject a pre-built slot. Test seam: lets the fetch engine run against
    /// sessions that never went through a live login.
    #[cfg(test)]
    pub fn push_slot_for_test(&mut self, slot: SessionSlot) {
        self.slots.push(Arc::new(Mutex::new(slot)));
    }
}
