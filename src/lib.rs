//! # lane-link
//!
//! Rust client SDK for the Lane collaborative task service: connection
//! lifecycle, channel subscriptions, single-flight credential renewal,
//! optimistic mutations with rollback, and a quota-aware persistent
//! key-value store.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use lane_link::LaneLinkClient;
//! use serde_json::json;
//!
//! # async fn run() -> lane_link::Result<()> {
//! let client = LaneLinkClient::builder("https://lane.example.com")
//!     .storage_path("/tmp/lane-session.json")
//!     .build()?;
//!
//! client.login("alice", "secret").await?;
//! client.connect().await?;
//!
//! client.subscribe("tasks", |event| {
//!     println!("event on {}: {}", event.channel, event.payload);
//! }).await;
//!
//! let ticket = client.create_entity(json!({"title": "Ship v1"})).await?;
//! let confirmed = ticket.resolved().await?;
//! println!("created {}", confirmed.entity_id);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! A background task owns the WebSocket and all connection state; the
//! [`LaneLinkClient`] handle talks to it over a command channel. Messages
//! sent while disconnected queue in a bounded FIFO and flush in order on
//! reconnect. Credentials renew single-flight behind a safety threshold,
//! and mutations apply optimistically with a persisted rollback ledger.

pub mod auth;
pub mod backoff;
pub mod channels;
pub mod client;
pub mod connection;
pub mod error;
pub mod event_handlers;
pub mod models;
pub mod optimistic;
pub mod store;
pub mod timeouts;
pub mod transport;

pub use auth::{AuthApi, Credential, HttpAuthApi, RefreshCoordinator, SessionEvent, SESSION_STORE_KEY};
pub use backoff::BackoffPolicy;
pub use channels::{ChannelEvent, ChannelHandler, ChannelRegistry, HandlerId, MessageQueue, PendingMessage};
pub use client::{LaneLinkClient, LaneLinkClientBuilder};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{LaneLinkError, Result};
pub use event_handlers::{ConnectionFault, DisconnectReason, EventHandlers};
pub use models::{
    ConnectionOptions, Envelope, EnvelopeKind, MutationConfirmed, MutationPayload,
    MutationRejected, OperationKind,
};
pub use optimistic::{MutationTicket, OptimisticCoordinator, RecoveryPolicy, LEDGER_STORE_KEY, MUTATIONS_CHANNEL};
pub use store::{
    ExternalChange, FileBackend, KeyValueStore, MemoryBackend, StorageBackend, StoredEntry,
    DEFAULT_DEBOUNCE_WINDOW, DEFAULT_QUOTA_BYTES,
};
pub use timeouts::{LaneLinkTimeouts, LaneLinkTimeoutsBuilder};
pub use transport::{Transport, TransportConnection, TransportFrame, WsTransport};
