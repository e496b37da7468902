//! Data models for the lane-link client library.
//!
//! Defines the wire envelope carried over the WebSocket transport, the
//! mutation payloads exchanged with the server, the credential endpoint
//! request/response bodies, and connection-level options.

pub mod connection_options;
pub mod envelope;
pub mod login_request;
pub mod mutation;
pub mod refresh_request;
pub mod token_response;


pub use connection_options::ConnectionOptions;
pub use envelope::{Envelope, EnvelopeKind};
pub use login_request::LoginRequest;
pub use mutation::{MutationConfirmed, MutationPayload, MutationRejected, OperationKind};
pub use refresh_request::RefreshRequest;
pub use token_response::TokenResponse;
