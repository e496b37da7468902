use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Kind of mutating operation applied to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Create a new entity. The client assigns a temporary identifier
    /// until the server confirms with a permanent one.
    Create,
    /// Replace an existing entity wholesale.
    Update,
    /// Remove an existing entity.
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

/// Payload of an outbound `mutate` envelope.
///
/// `client_ref` is a stable client-generated identifier for the mutation
/// itself; the server echoes it back in the confirmation or rejection, and
/// it makes re-submission after a restart idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationPayload {
    /// Stable client-generated reference for this mutation.
    pub client_ref: String,
    /// Entity identifier (temporary for creates).
    pub entity_id: String,
    /// Operation kind.
    pub op: OperationKind,
    /// Entity document after the mutation. Absent for deletes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<JsonValue>,
}

/// Payload of an inbound `mutation_confirmed` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationConfirmed {
    /// Echo of the client-generated mutation reference.
    pub client_ref: String,
    /// Permanent entity identifier assigned by the server.
    pub entity_id: String,
    /// Authoritative entity document. Absent when a delete was confirmed.
    #[serde(default)]
    pub entity: Option<JsonValue>,
    /// Server-assigned entity version. Monotonically non-decreasing per
    /// entity; confirmations with a lower version are discarded.
    pub version: u64,
}

/// Payload of an inbound `mutation_rejected` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRejected {
    /// Echo of the client-generated mutation reference.
    pub client_ref: String,
    /// Entity identifier the rejection applies to.
    pub entity_id: String,
    /// Machine-readable rejection code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}
