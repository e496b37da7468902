//! Optimistic mutation dispatch with rollback.
//!
//! Mutations apply to the local entity cache immediately and are submitted
//! to the server in the background. Each in-flight mutation carries a
//! rollback snapshot in a persisted ledger:
//!
//! - A `mutation_confirmed` verdict adopts the authoritative entity and
//!   version (remapping temporary create identifiers) and drops the ledger
//!   entry.
//! - A `mutation_rejected` verdict restores the snapshot exactly and
//!   surfaces a conflict error to the caller's [`MutationTicket`].
//!
//! The ledger is checkpointed to the key-value store after every change, so
//! a restarted client can recover mutations that never got a verdict.
//! Conflict resolution is whole-entity: the server's document wins
//! wholesale, field-level merging is out of scope.

use crate::connection::{ConnectionManager, MutationOutcome};
use crate::error::{LaneLinkError, Result};
use crate::models::envelope::now_ms;
use crate::models::{Envelope, EnvelopeKind, MutationConfirmed, MutationPayload, MutationRejected, OperationKind};
use crate::store::KeyValueStore;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::oneshot;

/// Store key under which the pending-mutation ledger is checkpointed.
pub const LEDGER_STORE_KEY: &str = "ledger";

/// Channel carrying `mutate` envelopes to the server.
pub const MUTATIONS_CHANNEL: &str = "mutations";

/// What to do with ledger entries found on startup that never received a
/// verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    /// Re-apply the optimistic state and resubmit the mutations under
    /// their original `client_ref`, making the recovery idempotent on the
    /// server side.
    #[default]
    Resubmit,
    /// Roll the mutations back and drop them.
    Discard,
}

/// Awaitable handle for one dispatched mutation.
///
/// Dropping the ticket abandons the wait, not the mutation.
#[derive(Debug)]
pub struct MutationTicket {
    client_ref: String,
    rx: oneshot::Receiver<Result<MutationConfirmed>>,
}

impl MutationTicket {
    /// The client-generated reference identifying this mutation.
    pub fn client_ref(&self) -> &str {
        &self.client_ref
    }

    /// Wait for the server's verdict. A rejection surfaces as
    /// [`LaneLinkError::Conflict`].
    pub async fn resolved(self) -> Result<MutationConfirmed> {
        self.rx
            .await
            .map_err(|_| LaneLinkError::Internal("Mutation coordinator dropped".to_string()))?
    }
}

/// One in-flight mutation with its rollback snapshot. Persisted verbatim
/// in the ledger checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerEntry {
    client_ref: String,
    entity_id: String,
    op: OperationKind,
    /// Entity document after the optimistic apply. Absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entity: Option<JsonValue>,
    /// Entity document before the optimistic apply. Absent for creates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    previous: Option<JsonValue>,
    submitted_at_ms: u64,
}

impl LedgerEntry {
    fn to_payload(&self) -> MutationPayload {
        MutationPayload {
            client_ref: self.client_ref.clone(),
            entity_id: self.entity_id.clone(),
            op: self.op,
            entity: self.entity.clone(),
        }
    }
}

#[derive(Default)]
struct OptimisticState {
    /// Local entity cache keyed by entity id (temporary ids included).
    entities: HashMap<String, JsonValue>,
    /// In-flight mutations in dispatch order.
    ledger: Vec<LedgerEntry>,
    /// Waiters keyed by `client_ref`.
    tickets: HashMap<String, oneshot::Sender<Result<MutationConfirmed>>>,
    /// Highest confirmed version per entity; lower-versioned confirmations
    /// are stale and discarded.
    confirmed_versions: HashMap<String, u64>,
    next_seq: u64,
}

struct OptimisticInner {
    manager: ConnectionManager,
    store: KeyValueStore,
    policy: RecoveryPolicy,
    state: StdMutex<OptimisticState>,
}

/// Coordinator for optimistic entity mutations.
///
/// Cloning is cheap and shares the same state.
#[derive(Clone)]
pub struct OptimisticCoordinator {
    inner: Arc<OptimisticInner>,
}

impl OptimisticCoordinator {
    pub(crate) fn new(
        manager: ConnectionManager,
        store: KeyValueStore,
        policy: RecoveryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(OptimisticInner {
                manager,
                store,
                policy,
                state: StdMutex::new(OptimisticState::default()),
            }),
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    /// Create an entity optimistically under a temporary identifier.
    ///
    /// The confirmation carries the permanent identifier; the local cache
    /// is remapped when it arrives.
    pub async fn create(&self, entity: JsonValue) -> Result<MutationTicket> {
        require_object(&entity)?;
        let (entry, ticket) = {
            let mut state = self.lock_state();
            let seq = state.next_seq;
            state.next_seq += 1;
            let entity_id = format!("tmp_{}_{}", now_ms(), seq);
            let entry = LedgerEntry {
                client_ref: format!("m_{}_{}", now_ms(), seq),
                entity_id: entity_id.clone(),
                op: OperationKind::Create,
                entity: Some(entity.clone()),
                previous: None,
                submitted_at_ms: now_ms(),
            };
            state.entities.insert(entity_id, entity);
            self.record(&mut state, entry.clone())
        };
        self.submit(entry).await?;
        Ok(ticket)
    }

    /// Replace an existing entity wholesale.
    pub async fn update(&self, entity_id: &str, entity: JsonValue) -> Result<MutationTicket> {
        require_object(&entity)?;
        let (entry, ticket) = {
            let mut state = self.lock_state();
            let Some(previous) = state.entities.get(entity_id).cloned() else {
                return Err(LaneLinkError::Validation(format!(
                    "Unknown entity '{}'",
                    entity_id
                )));
            };
            let seq = state.next_seq;
            state.next_seq += 1;
            let entry = LedgerEntry {
                client_ref: format!("m_{}_{}", now_ms(), seq),
                entity_id: entity_id.to_string(),
                op: OperationKind::Update,
                entity: Some(entity.clone()),
                previous: Some(previous),
                submitted_at_ms: now_ms(),
            };
            state.entities.insert(entity_id.to_string(), entity);
            self.record(&mut state, entry.clone())
        };
        self.submit(entry).await?;
        Ok(ticket)
    }

    /// Delete an existing entity.
    pub async fn delete(&self, entity_id: &str) -> Result<MutationTicket> {
        let (entry, ticket) = {
            let mut state = self.lock_state();
            let Some(previous) = state.entities.remove(entity_id) else {
                return Err(LaneLinkError::Validation(format!(
                    "Unknown entity '{}'",
                    entity_id
                )));
            };
            let seq = state.next_seq;
            state.next_seq += 1;
            let entry = LedgerEntry {
                client_ref: format!("m_{}_{}", now_ms(), seq),
                entity_id: entity_id.to_string(),
                op: OperationKind::Delete,
                entity: None,
                previous: Some(previous),
                submitted_at_ms: now_ms(),
            };
            self.record(&mut state, entry.clone())
        };
        self.submit(entry).await?;
        Ok(ticket)
    }

    /// Seed the local cache with a server-provided entity (initial load or
    /// channel event), without going through the mutation path.
    pub fn adopt_entity(&self, entity_id: impl Into<String>, entity: JsonValue, version: u64) {
        let mut state = self.lock_state();
        let entity_id = entity_id.into();
        let known = state.confirmed_versions.get(&entity_id).copied().unwrap_or(0);
        if version < known {
            return;
        }
        state.confirmed_versions.insert(entity_id.clone(), version);
        state.entities.insert(entity_id, entity);
    }

    // ── Verdicts ────────────────────────────────────────────────────────

    pub(crate) async fn apply_outcome(&self, outcome: MutationOutcome) {
        match outcome {
            MutationOutcome::Confirmed(confirmed) => self.confirm(confirmed).await,
            MutationOutcome::Rejected(rejected) => self.reject(rejected).await,
        }
    }

    /// Adopt a server confirmation: authoritative entity and version win
    /// wholesale, temporary create identifiers are remapped.
    pub(crate) async fn confirm(&self, confirmed: MutationConfirmed) {
        {
            let mut state = self.lock_state();
            let Some(position) = state
                .ledger
                .iter()
                .position(|entry| entry.client_ref == confirmed.client_ref)
            else {
                log::debug!(
                    "[lane-link] Confirmation for unknown mutation '{}'",
                    confirmed.client_ref
                );
                return;
            };

            let known = state
                .confirmed_versions
                .get(&confirmed.entity_id)
                .copied()
                .unwrap_or(0);
            if confirmed.version < known {
                log::debug!(
                    "[lane-link] Discarding stale confirmation for '{}' (version {} < {})",
                    confirmed.entity_id,
                    confirmed.version,
                    known
                );
                return;
            }

            let entry = state.ledger.remove(position);

            // Remap the temporary identifier assigned at create time.
            if entry.entity_id != confirmed.entity_id {
                if let Some(local) = state.entities.remove(&entry.entity_id) {
                    state.entities.insert(confirmed.entity_id.clone(), local);
                }
            }
            match (entry.op, &confirmed.entity) {
                (OperationKind::Delete, _) => {
                    state.entities.remove(&confirmed.entity_id);
                },
                (_, Some(authoritative)) => {
                    state
                        .entities
                        .insert(confirmed.entity_id.clone(), authoritative.clone());
                },
                (_, None) => {},
            }
            state
                .confirmed_versions
                .insert(confirmed.entity_id.clone(), confirmed.version);

            if let Some(ticket) = state.tickets.remove(&confirmed.client_ref) {
                let _ = ticket.send(Ok(confirmed));
            }
        }
        self.checkpoint().await;
    }

    /// Roll back a rejected mutation to its snapshot, exactly.
    pub(crate) async fn reject(&self, rejected: MutationRejected) {
        {
            let mut state = self.lock_state();
            let Some(position) = state
                .ledger
                .iter()
                .position(|entry| entry.client_ref == rejected.client_ref)
            else {
                log::debug!(
                    "[lane-link] Rejection for unknown mutation '{}'",
                    rejected.client_ref
                );
                return;
            };
            let entry = state.ledger.remove(position);

            match entry.previous {
                Some(previous) => {
                    state.entities.insert(entry.entity_id.clone(), previous);
                },
                None => {
                    state.entities.remove(&entry.entity_id);
                },
            }

            log::warn!(
                "[lane-link] Mutation '{}' rejected ({}): {}",
                rejected.client_ref,
                rejected.code,
                rejected.message
            );
            if let Some(ticket) = state.tickets.remove(&rejected.client_ref) {
                let _ = ticket.send(Err(LaneLinkError::Conflict {
                    code: rejected.code,
                    message: rejected.message,
                }));
            }
        }
        self.checkpoint().await;
    }

    // ── Recovery ────────────────────────────────────────────────────────

    /// Process ledger entries checkpointed by a previous run.
    ///
    /// Under [`RecoveryPolicy::Resubmit`] the optimistic state is
    /// re-applied and each mutation is resubmitted under its original
    /// `client_ref`; under [`RecoveryPolicy::Discard`] the entries are
    /// rolled back and dropped. Returns the number of recovered entries.
    pub async fn recover(&self) -> Result<usize> {
        let recovered: Vec<LedgerEntry> = match self.inner.store.get(LEDGER_STORE_KEY) {
            Some(value) => serde_json::from_value(value)?,
            None => return Ok(0),
        };
        if recovered.is_empty() {
            return Ok(0);
        }

        let count = recovered.len();
        match self.inner.policy {
            RecoveryPolicy::Resubmit => {
                log::info!("[lane-link] Resubmitting {} recovered mutation(s)", count);
                {
                    let mut state = self.lock_state();
                    for entry in &recovered {
                        match (&entry.entity, entry.op) {
                            (_, OperationKind::Delete) => {
                                state.entities.remove(&entry.entity_id);
                            },
                            (Some(entity), _) => {
                                state.entities.insert(entry.entity_id.clone(), entity.clone());
                            },
                            (None, _) => {},
                        }
                    }
                    state.ledger.extend(recovered.iter().cloned());
                }
                self.checkpoint().await;
                for entry in recovered {
                    self.submit(entry).await?;
                }
            },
            RecoveryPolicy::Discard => {
                log::info!("[lane-link] Discarding {} recovered mutation(s)", count);
                {
                    let mut state = self.lock_state();
                    for entry in recovered.iter().rev() {
                        match &entry.previous {
                            Some(previous) => {
                                state.entities.insert(entry.entity_id.clone(), previous.clone());
                            },
                            None => {
                                state.entities.remove(&entry.entity_id);
                            },
                        }
                    }
                }
                self.checkpoint().await;
            },
        }
        Ok(count)
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Current local view of one entity.
    pub fn entity(&self, entity_id: &str) -> Option<JsonValue> {
        self.lock_state().entities.get(entity_id).cloned()
    }

    /// Snapshot of the whole local entity cache.
    pub fn entities(&self) -> HashMap<String, JsonValue> {
        self.lock_state().entities.clone()
    }

    /// Number of mutations awaiting a server verdict.
    pub fn pending_len(&self) -> usize {
        self.lock_state().ledger.len()
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn lock_state(&self) -> std::sync::MutexGuard<'_, OptimisticState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a ledger entry and register its ticket. Caller holds the
    /// state lock.
    fn record(
        &self,
        state: &mut OptimisticState,
        entry: LedgerEntry,
    ) -> (LedgerEntry, MutationTicket) {
        let (tx, rx) = oneshot::channel();
        state.tickets.insert(entry.client_ref.clone(), tx);
        state.ledger.push(entry.clone());
        let ticket = MutationTicket {
            client_ref: entry.client_ref.clone(),
            rx,
        };
        (entry, ticket)
    }

    /// Checkpoint the ledger, then hand the envelope to the connection
    /// manager (which queues it while disconnected).
    async fn submit(&self, entry: LedgerEntry) -> Result<()> {
        self.checkpoint().await;
        let payload = serde_json::to_value(entry.to_payload())?;
        let envelope = Envelope::new(MUTATIONS_CHANNEL, EnvelopeKind::Mutate, payload);
        self.inner.manager.send(envelope).await
    }

    async fn checkpoint(&self) {
        let ledger = {
            let state = self.lock_state();
            match serde_json::to_value(&state.ledger) {
                Ok(value) => value,
                Err(e) => {
                    log::warn!("[lane-link] Failed to serialize mutation ledger: {}", e);
                    return;
                },
            }
        };
        if let Err(e) = self.inner.store.set(LEDGER_STORE_KEY, ledger, "ledger").await {
            log::warn!("[lane-link] Failed to checkpoint mutation ledger: {}", e);
        }
    }
}

fn require_object(entity: &JsonValue) -> Result<()> {
    if entity.is_object() {
        Ok(())
    } else {
        Err(LaneLinkError::Validation(
            "Entity must be a JSON object".to_string(),
        ))
    }
}
