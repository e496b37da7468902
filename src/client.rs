//! The `LaneLinkClient`: the single entry point tying the sync layer
//! together.
//!
//! The client wires the credential coordinator, the persistent key-value
//! store, the connection manager, the channel registry, and the optimistic
//! mutation coordinator, and bridges their event streams:
//!
//! - mutation verdicts from the connection flow into the optimistic
//!   coordinator,
//! - session-entry changes observed in the shared store flow into the
//!   credential coordinator (cross-context logout/renewal),
//! - forced-logout signals flow out to the registered event handlers and
//!   drop the connection.
//!
//! # Example
//!
//! ```rust,no_run
//! use lane_link::{LaneLinkClient, EventHandlers};
//! use serde_json::json;
//!
//! # async fn run() -> lane_link::Result<()> {
//! let client = LaneLinkClient::builder("https://lane.example.com")
//!     .event_handlers(EventHandlers::new().on_connect(|| println!("up")))
//!     .build()?;
//!
//! client.login("alice", "secret").await?;
//! client.connect().await?;
//!
//! client.subscribe("tasks", |event| {
//!     println!("task event: {}", event.payload);
//! }).await;
//! let ticket = client.create_entity(json!({"title": "Ship it"})).await?;
//! let confirmed = ticket.resolved().await?;
//! println!("created {} at version {}", confirmed.entity_id, confirmed.version);
//! # Ok(())
//! # }
//! ```

use crate::auth::{AuthApi, Credential, HttpAuthApi, RefreshCoordinator, SessionEvent, SESSION_STORE_KEY};
use crate::backoff::BackoffPolicy;
use crate::channels::{ChannelEvent, ChannelRegistry, HandlerId};
use crate::connection::{ConnectionConfig, ConnectionManager, ConnectionState};
use crate::error::{LaneLinkError, Result};
use crate::event_handlers::EventHandlers;
use crate::models::{ConnectionOptions, Envelope};
use crate::optimistic::{MutationTicket, OptimisticCoordinator, RecoveryPolicy};
use crate::store::{
    FileBackend, KeyValueStore, MemoryBackend, StorageBackend, DEFAULT_DEBOUNCE_WINDOW,
    DEFAULT_QUOTA_BYTES,
};
use crate::timeouts::LaneLinkTimeouts;
use crate::transport::{Transport, WsTransport};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Interval at which the store polls its backend for writes made by other
/// contexts sharing the same file.
const EXTERNAL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default store namespace prefix.
const DEFAULT_STORE_PREFIX: &str = "lane";

// ── Builder ─────────────────────────────────────────────────────────────────

/// Builder for [`LaneLinkClient`].
pub struct LaneLinkClientBuilder {
    base_url: String,
    options: ConnectionOptions,
    timeouts: LaneLinkTimeouts,
    handlers: EventHandlers,
    recovery_policy: RecoveryPolicy,
    refresh_threshold: Duration,
    refresh_backoff: BackoffPolicy,
    store_prefix: String,
    storage_path: Option<PathBuf>,
    quota_bytes: usize,
    debounce_window: Duration,
    auth_api: Option<Arc<dyn AuthApi>>,
    transport: Option<Arc<dyn Transport>>,
    backend: Option<Arc<dyn StorageBackend>>,
}

impl LaneLinkClientBuilder {
    fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            options: ConnectionOptions::default(),
            timeouts: LaneLinkTimeouts::default(),
            handlers: EventHandlers::new(),
            recovery_policy: RecoveryPolicy::default(),
            refresh_threshold: Duration::from_secs(30),
            refresh_backoff: BackoffPolicy::default(),
            store_prefix: DEFAULT_STORE_PREFIX.to_string(),
            storage_path: None,
            quota_bytes: DEFAULT_QUOTA_BYTES,
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
            auth_api: None,
            transport: None,
            backend: None,
        }
    }

    /// Set connection options (reconnect behavior, queue capacity).
    pub fn connection_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Set operation timeouts and the heartbeat interval.
    pub fn timeouts(mut self, timeouts: LaneLinkTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Register lifecycle event handlers.
    pub fn event_handlers(mut self, handlers: EventHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Set the recovery policy for mutations left pending by a previous
    /// run. Default: [`RecoveryPolicy::Resubmit`].
    pub fn recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery_policy = policy;
        self
    }

    /// Set the safety threshold: a credential expiring within this window
    /// is renewed before use. Default: 30 seconds.
    pub fn refresh_threshold(mut self, threshold: Duration) -> Self {
        self.refresh_threshold = threshold;
        self
    }

    /// Set the backoff policy for credential renewal retries.
    pub fn refresh_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.refresh_backoff = backoff;
        self
    }

    /// Set the key namespace prefix for the persistent store.
    pub fn store_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.store_prefix = prefix.into();
        self
    }

    /// Persist the store to a JSON document at `path`. Without this (or an
    /// explicit backend) the store is memory-only.
    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    /// Set the store quota in bytes. Default: 5 MiB.
    pub fn quota_bytes(mut self, quota: usize) -> Self {
        self.quota_bytes = quota;
        self
    }

    /// Set the debounce window coalescing physical store writes.
    pub fn debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    /// Inject a custom credential endpoint implementation (tests).
    pub fn auth_api(mut self, api: Arc<dyn AuthApi>) -> Self {
        self.auth_api = Some(api);
        self
    }

    /// Inject a custom transport (tests).
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Inject a custom storage backend. Overrides `storage_path`.
    pub fn storage_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Assemble the client and start its background tasks.
    pub fn build(self) -> Result<LaneLinkClient> {
        if self.base_url.is_empty() {
            return Err(LaneLinkError::Configuration(
                "base_url must not be empty".to_string(),
            ));
        }

        let backend: Arc<dyn StorageBackend> = match (self.backend, &self.storage_path) {
            (Some(backend), _) => backend,
            (None, Some(path)) => Arc::new(FileBackend::new(path.clone())),
            (None, None) => Arc::new(MemoryBackend::new()),
        };
        let store = KeyValueStore::new(
            backend,
            self.store_prefix,
            self.quota_bytes,
            self.debounce_window,
        )?;
        if self.storage_path.is_some() {
            store.spawn_poller(EXTERNAL_POLL_INTERVAL);
        }

        let auth_api: Arc<dyn AuthApi> = match self.auth_api {
            Some(api) => api,
            None => Arc::new(HttpAuthApi::new(
                self.base_url.clone(),
                self.timeouts.request_timeout,
            )?),
        };
        let auth = RefreshCoordinator::new(
            auth_api,
            store.clone(),
            self.refresh_backoff,
            self.refresh_threshold,
        );

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(WsTransport::new(self.timeouts.connection_timeout)),
        };

        let registry = Arc::new(ChannelRegistry::new());
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::spawn(ConnectionConfig {
            endpoint: self.base_url,
            transport,
            auth: auth.clone(),
            registry: registry.clone(),
            options: self.options,
            timeouts: self.timeouts,
            handlers: self.handlers.clone(),
            outcome_tx,
        });

        let optimistic = OptimisticCoordinator::new(
            manager.clone(),
            store.clone(),
            self.recovery_policy,
        );

        let bridges = spawn_bridges(
            outcome_rx,
            optimistic.clone(),
            store.clone(),
            auth.clone(),
            manager.clone(),
            self.handlers,
        );

        Ok(LaneLinkClient {
            auth,
            store,
            registry,
            manager,
            optimistic,
            bridges: Arc::new(StdMutex::new(bridges)),
        })
    }
}

/// Wire the inter-component event streams together.
fn spawn_bridges(
    mut outcome_rx: mpsc::UnboundedReceiver<crate::connection::MutationOutcome>,
    optimistic: OptimisticCoordinator,
    store: KeyValueStore,
    auth: RefreshCoordinator,
    manager: ConnectionManager,
    handlers: EventHandlers,
) -> Vec<JoinHandle<()>> {
    let mut bridges = Vec::with_capacity(3);

    // Mutation verdicts -> optimistic coordinator.
    bridges.push(tokio::spawn(async move {
        while let Some(outcome) = outcome_rx.recv().await {
            optimistic.apply_outcome(outcome).await;
        }
    }));

    // External session-entry changes -> credential coordinator.
    let bridge_auth = auth.clone();
    let mut external_rx = store.subscribe_external();
    bridges.push(tokio::spawn(async move {
        loop {
            match external_rx.recv().await {
                Ok(change) if change.key == SESSION_STORE_KEY => {
                    bridge_auth.adopt_external(change.value).await;
                },
                Ok(_) => {},
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("[lane-link] Missed {} external store change(s)", skipped);
                },
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }));

    // Forced logout -> event handlers, and drop the connection.
    let mut session_rx = auth.subscribe_session();
    bridges.push(tokio::spawn(async move {
        loop {
            match session_rx.recv().await {
                Ok(SessionEvent::ForcedLogout { reason }) => {
                    let _ = manager.disconnect().await;
                    handlers.emit_forced_logout(reason);
                },
                Ok(SessionEvent::CredentialRenewed) => {},
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {},
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }));

    bridges
}

// ── Client ──────────────────────────────────────────────────────────────────

/// Client for the Lane collaborative task service.
///
/// Cloning is cheap; all clones share the same session, connection, and
/// local state.
#[derive(Clone)]
pub struct LaneLinkClient {
    auth: RefreshCoordinator,
    store: KeyValueStore,
    registry: Arc<ChannelRegistry>,
    manager: ConnectionManager,
    optimistic: OptimisticCoordinator,
    bridges: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for LaneLinkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaneLinkClient").finish_non_exhaustive()
    }
}

impl LaneLinkClient {
    /// Start building a client against `base_url`.
    pub fn builder(base_url: impl Into<String>) -> LaneLinkClientBuilder {
        LaneLinkClientBuilder::new(base_url)
    }

    // ── Session ─────────────────────────────────────────────────────────

    /// Authenticate with username/password and persist the session.
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        self.auth.login(username, password).await?;
        Ok(())
    }

    /// End the session locally: clear and un-persist the credential.
    pub async fn logout(&self) {
        self.auth.logout("User logout").await;
        let _ = self.manager.disconnect().await;
    }

    /// The current credential, if a session exists. Does not renew.
    pub async fn current_credential(&self) -> Option<Credential> {
        self.auth.current().await
    }

    /// A credential valid beyond the safety threshold, renewing first when
    /// necessary.
    pub async fn get_valid_credential(&self) -> Result<Credential> {
        self.auth.get_valid_credential().await
    }

    // ── Connection ──────────────────────────────────────────────────────

    /// Establish the sync connection. Requires a session (from
    /// [`login`](Self::login) or restored from the store).
    pub async fn connect(&self) -> Result<()> {
        self.manager.connect().await
    }

    /// Close the sync connection. Queued messages survive and flush on the
    /// next [`connect`](Self::connect).
    pub async fn disconnect(&self) -> Result<()> {
        self.manager.disconnect().await
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Watch connection state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.watch_state()
    }

    // ── Channels ────────────────────────────────────────────────────────

    /// Register `handler` for events on `channel`.
    ///
    /// The first handler on a channel announces the subscription to the
    /// server (immediately when connected, on the next connect otherwise).
    pub async fn subscribe(
        &self,
        channel: &str,
        handler: impl Fn(ChannelEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        let first = self.registry.handler_count(channel) == 0;
        let id = self.registry.subscribe(channel, Arc::new(handler));
        if first {
            let _ = self.manager.channel_subscribed(channel).await;
        }
        id
    }

    /// Remove a previously registered handler. Withdraws the server-side
    /// subscription when the last handler goes.
    pub async fn unsubscribe(&self, channel: &str, id: HandlerId) -> bool {
        let removed = self.registry.unsubscribe(channel, id);
        if removed && self.registry.handler_count(channel) == 0 {
            let _ = self.manager.channel_unsubscribed(channel).await;
        }
        removed
    }

    /// Publish `payload` on `channel`. While disconnected the message is
    /// queued (bounded, drop-oldest) and flushed in order on reconnect.
    pub async fn send(&self, channel: &str, payload: JsonValue) -> Result<()> {
        self.manager.send(Envelope::publish(channel, payload)).await
    }

    /// Number of messages waiting in the disconnected-send queue.
    pub async fn queued_messages(&self) -> Result<usize> {
        self.manager.queued_len().await
    }

    // ── Optimistic mutations ────────────────────────────────────────────

    /// Create an entity optimistically. See
    /// [`OptimisticCoordinator::create`].
    pub async fn create_entity(&self, entity: JsonValue) -> Result<MutationTicket> {
        self.optimistic.create(entity).await
    }

    /// Replace an entity optimistically.
    pub async fn update_entity(
        &self,
        entity_id: &str,
        entity: JsonValue,
    ) -> Result<MutationTicket> {
        self.optimistic.update(entity_id, entity).await
    }

    /// Delete an entity optimistically.
    pub async fn delete_entity(&self, entity_id: &str) -> Result<MutationTicket> {
        self.optimistic.delete(entity_id).await
    }

    /// Seed the local cache with a server-provided entity.
    pub fn adopt_entity(&self, entity_id: impl Into<String>, entity: JsonValue, version: u64) {
        self.optimistic.adopt_entity(entity_id, entity, version)
    }

    /// Local view of one entity (optimistic edits included).
    pub fn entity(&self, entity_id: &str) -> Option<JsonValue> {
        self.optimistic.entity(entity_id)
    }

    /// Snapshot of the local entity cache.
    pub fn entities(&self) -> HashMap<String, JsonValue> {
        self.optimistic.entities()
    }

    /// Number of mutations awaiting a server verdict.
    pub fn pending_mutations(&self) -> usize {
        self.optimistic.pending_len()
    }

    /// Recover mutations left pending by a previous run, per the
    /// configured [`RecoveryPolicy`].
    pub async fn recover_pending(&self) -> Result<usize> {
        self.optimistic.recover().await
    }

    // ── Store ───────────────────────────────────────────────────────────

    /// The client's persistent key-value store.
    pub fn store(&self) -> &KeyValueStore {
        &self.store
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Stop all background tasks and flush the store. The client is
    /// unusable afterwards.
    pub async fn close(&self) {
        self.manager.shutdown().await;
        self.auth.shutdown();
        if let Err(e) = self.store.close().await {
            log::warn!("[lane-link] Store close failed: {}", e);
        }
        let handles = {
            let mut bridges = self.bridges.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *bridges)
        };
        for handle in handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;

    #[tokio::test]
    async fn test_builder_rejects_empty_base_url() {
        let err = LaneLinkClient::builder("").build().unwrap_err();
        assert!(matches!(err, LaneLinkError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_builder_defaults_produce_working_client() {
        let client = LaneLinkClient::builder("https://lane.example.com")
            .storage_backend(Arc::new(MemoryBackend::new()))
            .debounce_window(Duration::ZERO)
            .build()
            .unwrap();

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.pending_mutations(), 0);
        assert!(client.current_credential().await.is_none());
        client.close().await;
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe_lifecycle() {
        let client = LaneLinkClient::builder("https://lane.example.com")
            .storage_backend(Arc::new(MemoryBackend::new()))
            .debounce_window(Duration::ZERO)
            .build()
            .unwrap();

        let id = client.subscribe("tasks", |_event| {}).await;
        assert_eq!(client.registry.handler_count("tasks"), 1);
        assert!(client.unsubscribe("tasks", id).await);
        assert_eq!(client.registry.handler_count("tasks"), 0);
        assert!(!client.unsubscribe("tasks", id).await);
        client.close().await;
    }

    #[tokio::test]
    async fn test_sends_queue_while_disconnected() {
        let client = LaneLinkClient::builder("https://lane.example.com")
            .storage_backend(Arc::new(MemoryBackend::new()))
            .debounce_window(Duration::ZERO)
            .build()
            .unwrap();

        client.send("tasks", serde_json::json!({"n": 1})).await.unwrap();
        client.send("tasks", serde_json::json!({"n": 2})).await.unwrap();
        assert_eq!(client.queued_messages().await.unwrap(), 2);
        client.close().await;
    }
}
