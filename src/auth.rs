//! Credential management for the lane-link client.
//!
//! Handles:
//!
//! - The immutable [`Credential`] value object (access token, refresh
//!   token, expiry) and its structural well-formedness check
//! - The [`AuthApi`] collaborator contract (`login`, `refresh`) with the
//!   production [`HttpAuthApi`] implementation
//! - The [`RefreshCoordinator`]: single-flight renewal of expiring
//!   credentials with backoff retries, proactive scheduling ahead of
//!   expiry, and the terminal forced-logout signal
//!
//! Only the coordinator ever writes the credential. Every other component
//! calls [`get_valid_credential`](RefreshCoordinator::get_valid_credential)
//! per operation instead of caching the value.

use crate::backoff::BackoffPolicy;
use crate::error::{LaneLinkError, Result};
use crate::models::envelope::now_ms;
use crate::models::{LoginRequest, RefreshRequest, TokenResponse};
use crate::store::KeyValueStore;
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;

/// Store key under which the session credential is persisted.
pub const SESSION_STORE_KEY: &str = "session";

/// Capacity of the session-event broadcast channel.
const SESSION_CHANNEL_CAPACITY: usize = 16;

// ── Credential ──────────────────────────────────────────────────────────────

/// An access/refresh token pair with its expiry.
///
/// Immutable value object: renewal replaces the whole credential, never
/// mutates it in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    /// Short-lived JWT access token presented to the server.
    pub access_token: String,
    /// Long-lived refresh token used to obtain a new pair.
    pub refresh_token: String,
    /// Access token expiry in millis since Unix epoch.
    pub expires_at_ms: u64,
}

impl Credential {
    /// Whether the access token expires within `threshold` from now.
    pub fn expires_within(&self, threshold: Duration) -> bool {
        self.expires_at_ms <= now_ms().saturating_add(threshold.as_millis() as u64)
    }

    /// Pure structural check on a JWT: three base64url segments where the
    /// payload decodes to a JSON object. No signature verification and no
    /// I/O. Applied to any stored token before it is trusted.
    pub fn is_well_formed(token: &str) -> bool {
        let mut segments = token.split('.');
        let (Some(header), Some(payload), Some(signature)) =
            (segments.next(), segments.next(), segments.next())
        else {
            return false;
        };
        if segments.next().is_some() {
            return false;
        }
        if header.is_empty() || payload.is_empty() || signature.is_empty() {
            return false;
        }
        let Ok(decoded) = URL_SAFE_NO_PAD.decode(payload) else {
            return false;
        };
        matches!(
            serde_json::from_slice::<serde_json::Value>(&decoded),
            Ok(serde_json::Value::Object(_))
        )
    }
}

impl From<TokenResponse> for Credential {
    fn from(token: TokenResponse) -> Self {
        Self {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at_ms: token.expires_at,
        }
    }
}

// ── Collaborator contract ───────────────────────────────────────────────────

/// The credential endpoint contract consumed by the core.
///
/// The production implementation is [`HttpAuthApi`]; tests inject doubles.
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Exchange username/password for a token pair.
    async fn login(&self, username: &str, password: &str) -> Result<Credential>;

    /// Exchange a refresh token for a new token pair.
    async fn refresh(&self, refresh_token: &str) -> Result<Credential>;
}

/// HTTP implementation of [`AuthApi`] against the Lane server.
///
/// Distinguishes 401/403 (terminal [`LaneLinkError::Auth`]) from transport
/// failures (transient [`LaneLinkError::Connection`]).
pub struct HttpAuthApi {
    base_url: String,
    http: reqwest::Client,
}

impl HttpAuthApi {
    /// Create an auth API client against `base_url`.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LaneLinkError::Configuration(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }

    async fn post_for_tokens<B: Serialize>(&self, path: &str, body: &B) -> Result<Credential> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.post(&url).json(body).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            let text = response.text().await.unwrap_or_default();
            return Err(LaneLinkError::Auth(format!(
                "Credential rejected ({}): {}",
                status, text
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LaneLinkError::Connection(format!(
                "Credential endpoint error ({}): {}",
                status, text
            )));
        }

        let token = response.json::<TokenResponse>().await?;
        Ok(Credential::from(token))
    }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    async fn login(&self, username: &str, password: &str) -> Result<Credential> {
        log::debug!("[lane-link] Logging in user '{}'", username);
        self.post_for_tokens(
            "/v1/auth/login",
            &LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            },
        )
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Credential> {
        log::debug!("[lane-link] Refreshing credential");
        self.post_for_tokens(
            "/v1/auth/refresh",
            &RefreshRequest {
                refresh_token: refresh_token.to_string(),
            },
        )
        .await
    }
}

// ── Session events ──────────────────────────────────────────────────────────

/// Session-level events emitted by the refresh coordinator.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The credential was replaced by a successful renewal or an external
    /// adoption.
    CredentialRenewed,
    /// Renewal was exhausted or the server rejected the credential
    /// outright. The stored credential has been cleared; the session is
    /// over. Terminal, not retried.
    ForcedLogout {
        /// Why the session ended.
        reason: String,
    },
}

// ── Refresh coordinator ─────────────────────────────────────────────────────

struct RefreshState {
    credential: Option<Credential>,
    /// Whether a renewal cycle is currently in flight. At most one per
    /// credential pair; concurrent callers queue as waiters.
    in_flight: bool,
    waiters: Vec<oneshot::Sender<Result<Credential>>>,
}

struct RefreshInner {
    api: Arc<dyn AuthApi>,
    store: KeyValueStore,
    backoff: BackoffPolicy,
    refresh_threshold: Duration,
    state: TokioMutex<RefreshState>,
    session_tx: broadcast::Sender<SessionEvent>,
    proactive: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for RefreshInner {
    fn drop(&mut self) {
        if let Ok(mut proactive) = self.proactive.lock() {
            if let Some(handle) = proactive.take() {
                handle.abort();
            }
        }
    }
}

/// Single-flight credential renewal coordinator.
///
/// Cloning is cheap and shares the same state.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<RefreshInner>,
}

impl RefreshCoordinator {
    /// Create a coordinator over `api`, persisting credentials to `store`.
    ///
    /// Restores a previously-persisted credential from the store if one
    /// exists and its access token is structurally well-formed.
    pub fn new(
        api: Arc<dyn AuthApi>,
        store: KeyValueStore,
        backoff: BackoffPolicy,
        refresh_threshold: Duration,
    ) -> Self {
        let restored = store
            .get(SESSION_STORE_KEY)
            .and_then(|v| serde_json::from_value::<Credential>(v).ok())
            .filter(|c| Credential::is_well_formed(&c.access_token));
        if restored.is_some() {
            log::info!("[lane-link] Restored persisted session credential");
        }

        let (session_tx, _) = broadcast::channel(SESSION_CHANNEL_CAPACITY);
        let coordinator = Self {
            inner: Arc::new(RefreshInner {
                api,
                store,
                backoff,
                refresh_threshold,
                state: TokioMutex::new(RefreshState {
                    credential: restored.clone(),
                    in_flight: false,
                    waiters: Vec::new(),
                }),
                session_tx,
                proactive: StdMutex::new(None),
            }),
        };
        if let Some(credential) = restored {
            coordinator.schedule_proactive(&credential);
        }
        coordinator
    }

    /// Subscribe to session events (renewals and forced logout).
    pub fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.session_tx.subscribe()
    }

    /// Authenticate with username/password and install the resulting
    /// credential.
    pub async fn login(&self, username: &str, password: &str) -> Result<Credential> {
        let credential = self.inner.api.login(username, password).await?;
        self.install(credential.clone()).await?;
        Ok(credential)
    }

    /// Install a credential obtained out of band (login, tests).
    ///
    /// Persists it to the store and schedules proactive renewal.
    pub async fn install(&self, credential: Credential) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            state.credential = Some(credential.clone());
        }
        self.persist(&credential).await;
        self.schedule_proactive(&credential);
        Ok(())
    }

    /// The current credential without triggering renewal, if any.
    pub async fn current(&self) -> Option<Credential> {
        self.inner.state.lock().await.credential.clone()
    }

    /// Return a credential valid beyond the safety threshold, renewing
    /// first when necessary.
    ///
    /// Single-flight: if a renewal is already in progress the caller is
    /// queued and resolved with that renewal's single outcome; no
    /// duplicate refresh requests are issued. Intermediate retry failures
    /// are invisible to waiters; only final exhaustion (or an outright
    /// credential rejection) is surfaced, after which the credential has
    /// been cleared and a forced-logout signal emitted.
    pub async fn get_valid_credential(&self) -> Result<Credential> {
        let rx = {
            let mut state = self.inner.state.lock().await;
            if let Some(credential) = &state.credential {
                if !credential.expires_within(self.inner.refresh_threshold) {
                    return Ok(credential.clone());
                }
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            if !state.in_flight {
                state.in_flight = true;
                // The cycle runs on a detached task; the initiating caller
                // is just another waiter. Cancelling any caller (a replaced
                // proactive timer, a timed-out request) must not strand the
                // in-flight flag with waiters parked behind it.
                let runner = self.clone();
                tokio::spawn(async move { runner.run_renewal().await });
            }
            rx
        };

        rx.await
            .map_err(|_| LaneLinkError::Internal("Renewal cycle dropped".to_string()))?
    }

    /// Mark the current credential as expired so the next
    /// [`get_valid_credential`](Self::get_valid_credential) renews it.
    ///
    /// Called by the connection manager when the server rejects the
    /// credential at the transport level; the rejection itself is never
    /// retried by the connection manager.
    pub async fn invalidate(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(credential) = &mut state.credential {
            credential.expires_at_ms = 0;
        }
    }

    /// End the session: clear the credential, reject outstanding waiters,
    /// emit the forced-logout signal.
    pub async fn logout(&self, reason: impl Into<String>) {
        self.force_logout(reason.into()).await;
    }

    /// Adopt a credential change observed in the shared store (another
    /// context wrote or removed the session entry).
    ///
    /// A removal ends this context's session too; a well-formed new value
    /// replaces the in-memory credential without re-persisting it.
    pub async fn adopt_external(&self, value: Option<serde_json::Value>) {
        match value {
            None => {
                let had_credential = { self.inner.state.lock().await.credential.is_some() };
                if had_credential {
                    log::info!("[lane-link] Session ended in another context");
                    self.force_logout("Session ended in another context".to_string()).await;
                }
            },
            Some(raw) => {
                let Some(credential) = serde_json::from_value::<Credential>(raw)
                    .ok()
                    .filter(|c| Credential::is_well_formed(&c.access_token))
                else {
                    log::warn!("[lane-link] Ignoring malformed external credential");
                    return;
                };
                {
                    let mut state = self.inner.state.lock().await;
                    state.credential = Some(credential.clone());
                }
                self.schedule_proactive(&credential);
                let _ = self.inner.session_tx.send(SessionEvent::CredentialRenewed);
            },
        }
    }

    /// Abort the proactive-renewal timer. Called on client teardown.
    pub fn shutdown(&self) {
        if let Ok(mut proactive) = self.inner.proactive.lock() {
            if let Some(handle) = proactive.take() {
                handle.abort();
            }
        }
    }

    // ── Renewal cycle ───────────────────────────────────────────────────

    /// Run one renewal cycle on its own task. Exactly one runner exists at
    /// a time; every caller is parked in `waiters` and settled with the
    /// cycle's single outcome.
    async fn run_renewal(&self) {
        let refresh_token = {
            let state = self.inner.state.lock().await;
            state.credential.as_ref().map(|c| c.refresh_token.clone())
        };
        let Some(refresh_token) = refresh_token else {
            self.settle_failure("No credential to renew; login required".to_string(), false)
                .await;
            return;
        };

        let mut attempt: u32 = 0;
        loop {
            match self.inner.api.refresh(&refresh_token).await {
                Ok(credential) => {
                    self.settle_success(credential).await;
                    return;
                },
                Err(e @ LaneLinkError::Auth(_)) => {
                    // Outright rejection bypasses retry entirely.
                    self.settle_failure(format!("Credential rejected during renewal: {}", e), true)
                        .await;
                    return;
                },
                Err(e) => {
                    attempt += 1;
                    if self.inner.backoff.is_exhausted(attempt) {
                        self.settle_failure(
                            format!("Credential renewal exhausted after {} attempts: {}", attempt, e),
                            true,
                        )
                        .await;
                        return;
                    }
                    let delay = self.inner.backoff.delay(attempt - 1);
                    log::warn!(
                        "[lane-link] Credential renewal attempt {} failed ({}), retrying in {:?}",
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                },
            }
        }
    }

    async fn settle_success(&self, credential: Credential) {
        let waiters = {
            let mut state = self.inner.state.lock().await;
            state.credential = Some(credential.clone());
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Ok(credential.clone()));
        }
        self.persist(&credential).await;
        self.schedule_proactive(&credential);
        log::info!("[lane-link] Credential renewed");
        let _ = self.inner.session_tx.send(SessionEvent::CredentialRenewed);
    }

    /// Terminal failure: reject all waiters, clear the persisted
    /// credential, emit forced logout.
    async fn settle_failure(&self, reason: String, emit_logout: bool) {
        let waiters = {
            let mut state = self.inner.state.lock().await;
            state.credential = None;
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(LaneLinkError::Auth(reason.clone())));
        }
        if let Err(e) = self.inner.store.remove(SESSION_STORE_KEY).await {
            log::warn!("[lane-link] Failed to clear persisted credential: {}", e);
        }
        self.shutdown();
        if emit_logout {
            log::warn!("[lane-link] Forced logout: {}", reason);
            let _ = self
                .inner
                .session_tx
                .send(SessionEvent::ForcedLogout { reason });
        }
    }

    async fn force_logout(&self, reason: String) {
        self.settle_failure(reason, true).await;
    }

    async fn persist(&self, credential: &Credential) {
        match serde_json::to_value(credential) {
            Ok(value) => {
                if let Err(e) = self.inner.store.set(SESSION_STORE_KEY, value, "session").await {
                    log::warn!("[lane-link] Failed to persist credential: {}", e);
                }
            },
            Err(e) => log::warn!("[lane-link] Failed to serialize credential: {}", e),
        }
    }

    /// Schedule a background renewal shortly before expiry so the hot path
    /// rarely blocks on the network. Replaces any previous schedule.
    fn schedule_proactive(&self, credential: &Credential) {
        let lead_ms = credential
            .expires_at_ms
            .saturating_sub(self.inner.refresh_threshold.as_millis() as u64)
            .saturating_sub(now_ms());
        let weak: Weak<RefreshInner> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(lead_ms)).await;
            if let Some(inner) = weak.upgrade() {
                let coordinator = RefreshCoordinator { inner };
                log::debug!("[lane-link] Proactive credential renewal firing");
                if let Err(e) = coordinator.get_valid_credential().await {
                    log::warn!("[lane-link] Proactive renewal failed: {}", e);
                }
            }
        });

        if let Ok(mut proactive) = self.inner.proactive.lock() {
            if let Some(old) = proactive.replace(handle) {
                old.abort();
            }
        }
    }
}
