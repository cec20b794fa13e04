//! Short-lived OAuth handshake state.
//!
//! Holds CSRF state tokens between the authorization redirect and the
//! provider callback, and pending account-link confirmations between the
//! callback and the user's confirmation. Both are single-use: the normal
//! access path removes the entry as it reads it. Entries that are never
//! consumed are removed by a periodic sweep once they exceed the TTL.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// Default lifetime of state and pending-link entries.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(10 * 60);

/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Random bytes in an OAuth state token.
const STATE_TOKEN_BYTES: usize = 16;

/// Random bytes in a pending-link token.
const LINK_TOKEN_BYTES: usize = 24;

/// What the user started the OAuth flow for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthAction {
    /// Sign in (or sign up) with the external account.
    Login,
    /// Attach the external account to an already signed-in user.
    Link,
}

/// Context saved alongside an OAuth state token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthState {
    /// Flow type.
    pub action: OAuthAction,
    /// Signed-in user for [`OAuthAction::Link`] flows.
    pub subject_user_id: Option<i64>,
}

impl OAuthState {
    /// State for a login flow.
    #[must_use]
    pub fn login() -> Self {
        Self {
            action: OAuthAction::Login,
            subject_user_id: None,
        }
    }

    /// State for linking an external account to `user_id`.
    #[must_use]
    pub fn link(user_id: i64) -> Self {
        Self {
            action: OAuthAction::Link,
            subject_user_id: Some(user_id),
        }
    }
}

/// An external account waiting for the owner of an existing account to
/// confirm the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLink {
    /// Existing local user the account would be linked to.
    pub existing_user_id: i64,
    /// Provider-side account ID.
    pub external_provider_id: String,
    /// Provider-side display name.
    pub display_name: String,
    /// Provider-side avatar URL.
    pub avatar_url: String,
    /// Email reported by the provider.
    pub email: String,
}

/// Generates a 128-bit OAuth state token as 32 hex characters.
#[must_use]
pub fn generate_state_token() -> String {
    let bytes: [u8; STATE_TOKEN_BYTES] = rand::rng().random();
    hex::encode(bytes)
}

/// Generates a 192-bit pending-link token as 48 hex characters.
#[must_use]
pub fn generate_link_token() -> String {
    let bytes: [u8; LINK_TOKEN_BYTES] = rand::rng().random();
    hex::encode(bytes)
}

#[derive(Debug)]
struct Timed<V> {
    value: V,
    created_at: Instant,
}

/// A string-keyed map whose entries expire `ttl` after creation.
struct ExpiringMap<V> {
    entries: Mutex<HashMap<String, Timed<V>>>,
    ttl: Duration,
}

impl<V: Clone> ExpiringMap<V> {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    async fn save(&self, token: &str, value: V) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            token.to_owned(),
            Timed {
                value,
                created_at: Instant::now(),
            },
        );
    }

    async fn get(&self, token: &str) -> Option<V> {
        let mut entries = self.entries.lock().await;
        let expired = entries.get(token)?.created_at.elapsed() >= self.ttl;
        if expired {
            entries.remove(token);
            return None;
        }
        entries.get(token).map(|entry| entry.value.clone())
    }

    async fn take(&self, token: &str) -> Option<V> {
        let entry = self.entries.lock().await.remove(token)?;
        if entry.created_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.value)
    }

    async fn remove(&self, token: &str) -> bool {
        self.entries.lock().await.remove(token).is_some()
    }

    async fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.created_at.elapsed() < ttl);
        before - entries.len()
    }

    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Counts of entries removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Expired OAuth states removed.
    pub states: usize,
    /// Expired pending links removed.
    pub links: usize,
}

/// Store for OAuth state tokens and pending account links.
///
/// Each map has its own lock. Tokens must come from
/// [`generate_state_token`] / [`generate_link_token`] or another source
/// with at least 128 bits of entropy; saving under an existing token
/// overwrites it.
pub struct StateStore {
    states: ExpiringMap<OAuthState>,
    links: ExpiringMap<PendingLink>,
    ttl: Duration,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    metrics: Option<Metrics>,
}

impl StateStore {
    /// Creates a store without a background sweeper.
    pub fn new(ttl: Duration) -> Result<Self> {
        if ttl.is_zero() {
            return Err(Error::InvalidConfig(
                "state store ttl must be positive".to_string(),
            ));
        }
        Ok(Self {
            states: ExpiringMap::new(ttl),
            links: ExpiringMap::new(ttl),
            ttl,
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
            metrics: None,
        })
    }

    /// Attaches metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Creates a store and starts sweeping it every `sweep_interval`.
    ///
    /// Must be called inside a Tokio runtime. Stop the sweeper with
    /// [`close`](Self::close).
    pub fn spawn(
        ttl: Duration,
        sweep_interval: Duration,
        metrics: Option<Metrics>,
    ) -> Result<Arc<Self>> {
        if sweep_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "state store sweep interval must be positive".to_string(),
            ));
        }

        let mut store = Self::new(ttl)?;
        store.metrics = metrics;
        let store = Arc::new(store);

        let handle = tokio::spawn(run_sweeper(
            Arc::downgrade(&store),
            store.shutdown.clone(),
            sweep_interval,
        ));
        // The lock is uncontended: nothing else can see the store yet.
        if let Ok(mut sweeper) = store.sweeper.try_lock() {
            *sweeper = Some(handle);
        }

        info!(
            ttl_secs = ttl.as_secs(),
            sweep_interval_secs = sweep_interval.as_secs(),
            "State store sweeper started"
        );
        Ok(store)
    }

    /// Entry lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Saves OAuth state under `token`.
    pub async fn save_state(&self, token: &str, state: OAuthState) {
        self.states.save(token, state).await;
        self.update_gauges().await;
    }

    /// Reads OAuth state without consuming it.
    pub async fn get_state(&self, token: &str) -> Option<OAuthState> {
        self.states.get(token).await
    }

    /// Reads and removes OAuth state. A token can be consumed at most once.
    pub async fn take_state(&self, token: &str) -> Option<OAuthState> {
        let state = self.states.take(token).await;
        if state.is_none() {
            debug!("OAuth state not found or expired");
        }
        state
    }

    /// Saves a pending link under `token`.
    pub async fn save_pending_link(&self, token: &str, link: PendingLink) {
        self.links.save(token, link).await;
        self.update_gauges().await;
    }

    /// Reads a pending link without consuming it.
    pub async fn get_pending_link(&self, token: &str) -> Option<PendingLink> {
        self.links.get(token).await
    }

    /// Reads and removes a pending link. A token can be consumed at most once.
    pub async fn take_pending_link(&self, token: &str) -> Option<PendingLink> {
        let link = self.links.take(token).await;
        if link.is_none() {
            debug!("Pending link not found or expired");
        }
        link
    }

    /// Discards OAuth state without reading it. Returns whether anything
    /// was stored under `token`.
    pub async fn remove_state(&self, token: &str) -> bool {
        let removed = self.states.remove(token).await;
        if removed {
            self.update_gauges().await;
        }
        removed
    }

    /// Discards a pending link without reading it.
    pub async fn remove_pending_link(&self, token: &str) -> bool {
        let removed = self.links.remove(token).await;
        if removed {
            self.update_gauges().await;
        }
        removed
    }

    /// Number of stored OAuth states, including expired ones not yet swept.
    pub async fn state_count(&self) -> usize {
        self.states.len().await
    }

    /// Number of stored pending links, including expired ones not yet swept.
    pub async fn pending_link_count(&self) -> usize {
        self.links.len().await
    }

    /// Removes expired entries from both maps.
    pub async fn sweep(&self) -> SweepStats {
        let stats = SweepStats {
            states: self.states.sweep().await,
            links: self.links.sweep().await,
        };

        if stats.states > 0 || stats.links > 0 {
            debug!(
                states = stats.states,
                links = stats.links,
                "State store sweep completed"
            );
        }
        if let Some(ref m) = self.metrics {
            m.record_state_sweep("oauth_state", stats.states);
            m.record_state_sweep("pending_link", stats.links);
        }
        self.update_gauges().await;
        stats
    }

    /// Stops the background sweeper and waits for it to exit.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self.sweeper.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
            info!("State store sweeper stopped");
        }
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn update_gauges(&self) {
        if let Some(ref m) = self.metrics {
            m.set_state_store_size("oauth_state", self.states.len().await);
            m.set_state_store_size("pending_link", self.links.len().await);
        }
    }
}

async fn run_sweeper(store: Weak<StateStore>, shutdown: CancellationToken, every: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + every, every);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.sweep().await;
            }
        }
    }
}
