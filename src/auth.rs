//! Credential lifecycle: expiry tracking, single-flight refresh, proactive
//! refresh scheduling, and the logout broadcast every other component
//! observes.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::models::{Credential, EXPIRY_BUFFER};
use crate::storage::CredentialStore;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Refresh this far into the token lifetime, whichever is later.
const REFRESH_FRACTION: f64 = 0.8;
const EARLY_REFRESH_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Below this delay the proactive refresh fires immediately instead of
/// being scheduled.
const MIN_TIMER_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    Refreshed,
    LoggedOut,
}

/// Network seam for the credential-refresh endpoint.
#[async_trait]
pub trait RefreshTransport: Send + Sync {
    /// Exchange the current (possibly stale) token for a fresh one.
    async fn refresh(&self, token: &str) -> Result<String>;
}

pub struct HttpRefresh {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRefresh {
    pub fn new(config: &ClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            http,
            base_url: config.http_url(),
        }
    }
}

#[async_trait]
impl RefreshTransport for HttpRefresh {
    async fn refresh(&self, token: &str) -> Result<String> {
        let resp = self
            .http
            .post(format!("{}/api/v1/auth/refresh", self.base_url))
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::SessionExpired);
        }

        let data: serde_json::Value = resp.json().await?;
        data["token"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Http("refresh response missing token".to_string()))
    }
}

/// Exclusive owner of the process-wide credential. Everything else reads a
/// cached copy through [`CredentialGuard::watch`] and reacts to
/// [`AuthEvent`]s.
pub struct CredentialGuard {
    transport: Arc<dyn RefreshTransport>,
    store: Arc<CredentialStore>,
    current: watch::Sender<Option<Credential>>,
    /// Serializes refreshes; waiters piggyback on the holder's result.
    refresh_gate: tokio::sync::Mutex<()>,
    /// Bumped on every credential change so gate waiters can tell whether
    /// the refresh they queued up behind already happened.
    generation: AtomicU64,
    auth_events: broadcast::Sender<AuthEvent>,
    refresh_timer: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl CredentialGuard {
    /// Must be called from within a Tokio runtime; the proactive refresh
    /// timer is spawned onto it.
    pub fn new(transport: Arc<dyn RefreshTransport>, store: Arc<CredentialStore>) -> Arc<Self> {
        let initial = store.load_token().and_then(|t| Credential::from_token(&t));
        let (current, _) = watch::channel(initial);
        let (auth_events, _) = broadcast::channel(16);

        let guard = Arc::new(Self {
            transport,
            store,
            current,
            refresh_gate: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            auth_events,
            refresh_timer: parking_lot::Mutex::new(None),
        });
        if guard.current().is_some() {
            guard.arm_refresh_timer();
        }
        guard
    }

    pub fn current(&self) -> Option<Credential> {
        self.current.borrow().clone()
    }

    pub fn token(&self) -> Option<String> {
        self.current.borrow().as_ref().map(|c| c.token.clone())
    }

    /// Observers cache the bearer value through this watch.
    pub fn watch(&self) -> watch::Receiver<Option<Credential>> {
        self.current.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_events.subscribe()
    }

    /// True when there is no credential, the token is undecodable, or less
    /// than the safety buffer of lifetime remains.
    pub fn is_expired(&self) -> bool {
        match self.current() {
            Some(cred) => cred.expires_within(EXPIRY_BUFFER),
            None => true,
        }
    }

    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.current().map(|c| c.time_until_expiry())
    }

    /// Store a credential obtained out of band (login/registration).
    pub fn install(self: &Arc<Self>, credential: Credential) {
        if let Err(e) = self.store.save_token(&credential.token) {
            warn!("Failed to persist credential: {e}");
        }
        self.current.send_replace(Some(credential));
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.arm_refresh_timer();
        let _ = self.auth_events.send(AuthEvent::Refreshed);
    }

    /// Current token if still valid, otherwise the result of a refresh.
    pub async fn valid_token(self: &Arc<Self>) -> Option<String> {
        if let Some(cred) = self.current() {
            if !cred.is_expired() {
                return Some(cred.token);
            }
        }
        self.refresh().await.map(|c| c.token)
    }

    /// Single-flight refresh. Concurrent callers collapse into one network
    /// call and all observe its outcome. On failure the credential is
    /// cleared and a logout is broadcast; the caller branches on `None`.
    pub async fn refresh(self: &Arc<Self>) -> Option<Credential> {
        let observed = self.generation.load(Ordering::SeqCst);
        let _flight = self.refresh_gate.lock().await;

        // A refresh completed while we waited on the gate; share its result.
        if self.generation.load(Ordering::SeqCst) != observed {
            return self.current();
        }

        let token = match self.token() {
            Some(token) => token,
            None => {
                debug!("Refresh requested without a credential");
                return None;
            }
        };

        match self.transport.refresh(&token).await {
            Ok(new_token) => match Credential::from_token(&new_token) {
                Some(credential) => {
                    debug!(
                        "Credential refreshed, expires in {:?}",
                        credential.time_until_expiry()
                    );
                    if let Err(e) = self.store.save_token(&credential.token) {
                        warn!("Failed to persist refreshed credential: {e}");
                    }
                    self.current.send_replace(Some(credential.clone()));
                    self.generation.fetch_add(1, Ordering::SeqCst);
                    let _ = self.auth_events.send(AuthEvent::Refreshed);
                    self.arm_refresh_timer();
                    Some(credential)
                }
                None => {
                    warn!("Refresh returned an undecodable token, logging out");
                    self.logout();
                    None
                }
            },
            Err(e) => {
                // A second attempt while unauthenticated would be
                // meaningless; surface as logout instead of retrying.
                warn!("Credential refresh failed: {e}");
                self.logout();
                None
            }
        }
    }

    /// Clears the stored credential and broadcasts the logout every
    /// component reacts to. Idempotent.
    pub fn logout(&self) {
        self.cancel_refresh_timer();
        if let Err(e) = self.store.clear_token() {
            warn!("Failed to clear stored credential: {e}");
        }
        let had_credential = self.current.borrow().is_some();
        self.current.send_replace(None);
        self.generation.fetch_add(1, Ordering::SeqCst);
        if had_credential {
            info!("Logged out");
        }
        let _ = self.auth_events.send(AuthEvent::LoggedOut);
    }

    fn arm_refresh_timer(self: &Arc<Self>) {
        self.cancel_refresh_timer();
        let Some(credential) = self.current() else {
            return;
        };

        let remaining = credential.time_until_expiry();
        let delay = proactive_delay(remaining);
        debug!("Proactive refresh in {delay:?} ({remaining:?} of lifetime left)");

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            if delay >= MIN_TIMER_DELAY {
                tokio::time::sleep(delay).await;
            }
            if let Some(guard) = weak.upgrade() {
                debug!("Proactive credential refresh firing");
                guard.refresh().await;
            }
        });
        *self.refresh_timer.lock() = Some(handle);
    }

    fn cancel_refresh_timer(&self) {
        if let Some(timer) = self.refresh_timer.lock().take() {
            timer.abort();
        }
    }
}

impl Drop for CredentialGuard {
    fn drop(&mut self) {
        self.cancel_refresh_timer();
    }
}

fn proactive_delay(remaining: Duration) -> Duration {
    let fraction = remaining.mul_f64(REFRESH_FRACTION);
    let early = remaining.saturating_sub(EARLY_REFRESH_WINDOW);
    fraction.max(early)
}
