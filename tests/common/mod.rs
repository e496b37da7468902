//! Shared fixtures for the integration tests: an in-process WebSocket
//! server speaking the Lane sync protocol, plus a stub credential endpoint.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use lane_link::{
    AuthApi, Credential, Envelope, EnvelopeKind, LaneLinkError, MutationConfirmed,
    MutationPayload, MutationRejected, Result,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;

/// Wire the `log` output of the crate into the test harness. Safe to call
/// from every test; only the first call installs the logger.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(true)
        .try_init();
}

/// A structurally valid unsigned JWT for tests.
pub fn fake_jwt(subject: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD
        .encode(serde_json::to_vec(&json!({"sub": subject, "exp": 4102444800u64})).unwrap());
    format!("{}.{}.sig", header, payload)
}

pub fn long_lived_credential() -> Credential {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    Credential {
        access_token: fake_jwt("tester"),
        refresh_token: "refresh_token_1".to_string(),
        expires_at_ms: now + 3_600_000,
    }
}

/// Credential endpoint double that always succeeds with a long-lived
/// credential.
pub struct StubAuthApi;

#[async_trait]
impl AuthApi for StubAuthApi {
    async fn login(&self, _username: &str, _password: &str) -> Result<Credential> {
        Ok(long_lived_credential())
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<Credential> {
        Ok(long_lived_credential())
    }
}

/// Credential endpoint double that rejects everything.
pub struct RejectingAuthApi;

#[async_trait]
impl AuthApi for RejectingAuthApi {
    async fn login(&self, _username: &str, _password: &str) -> Result<Credential> {
        Err(LaneLinkError::Auth("bad credentials".to_string()))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<Credential> {
        Err(LaneLinkError::Auth("refresh token revoked".to_string()))
    }
}

/// In-process WebSocket server speaking the Lane sync protocol.
///
/// Behavior per inbound envelope:
/// - `heartbeat`: replies with `heartbeat_ack`
/// - `publish`: echoes the payload back as an `event` on the same channel
/// - `mutate`: confirms with an incrementing version (assigning a
///   permanent id for `tmp_*` creates), or rejects when the entity carries
///   a `"reject"` field naming the rejection code
pub struct FixtureServer {
    /// `ws://` base URL (bare authority; the client appends the path).
    pub url: String,
    received: Arc<Mutex<Vec<Envelope>>>,
    connections: Arc<AtomicUsize>,
    kill_tx: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl FixtureServer {
    pub async fn start() -> Self {
        init_logging();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let (kill_tx, _) = broadcast::channel(4);
        let versions: Arc<Mutex<HashMap<String, u64>>> = Arc::new(Mutex::new(HashMap::new()));
        let assigned_ids = Arc::new(AtomicUsize::new(0));

        let accept_received = received.clone();
        let accept_connections = connections.clone();
        let accept_kill = kill_tx.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _addr)) = listener.accept().await else {
                    break;
                };
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                accept_connections.fetch_add(1, Ordering::SeqCst);
                let received = accept_received.clone();
                let mut kill_rx = accept_kill.subscribe();
                let versions = versions.clone();
                let assigned_ids = assigned_ids.clone();

                tokio::spawn(async move {
                    let (mut ws_tx, mut ws_rx) = ws.split();
                    loop {
                        tokio::select! {
                            _ = kill_rx.recv() => {
                                let _ = ws_tx.close().await;
                                break;
                            },
                            msg = ws_rx.next() => {
                                let Some(Ok(Message::Text(text))) = msg else { break };
                                let Ok(envelope) = Envelope::from_text(&text) else { continue };
                                received.lock().unwrap().push(envelope.clone());

                                let reply = match envelope.kind {
                                    EnvelopeKind::Heartbeat => Some(Envelope::new(
                                        "system",
                                        EnvelopeKind::HeartbeatAck,
                                        serde_json::Value::Null,
                                    )),
                                    EnvelopeKind::Publish => Some(Envelope::new(
                                        envelope.channel.clone(),
                                        EnvelopeKind::Event,
                                        envelope.payload.clone(),
                                    )),
                                    EnvelopeKind::Mutate => {
                                        mutation_verdict(&envelope, &versions, &assigned_ids)
                                    },
                                    _ => None,
                                };
                                if let Some(reply) = reply {
                                    let text = reply.to_text().unwrap();
                                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                        break;
                                    }
                                }
                            },
                        }
                    }
                });
            }
        });

        Self {
            url: format!("ws://127.0.0.1:{}", port),
            received,
            connections,
            kill_tx,
            accept_task,
        }
    }

    /// Every envelope received so far, in arrival order.
    pub fn received(&self) -> Vec<Envelope> {
        self.received.lock().unwrap().clone()
    }

    /// Envelopes of one kind, in arrival order.
    pub fn received_of(&self, kind: EnvelopeKind) -> Vec<Envelope> {
        self.received()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }

    /// Number of WebSocket connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Close every open connection (simulated network drop).
    pub fn drop_connections(&self) {
        let _ = self.kill_tx.send(());
    }

    /// Poll until `pred` holds over the received envelopes, panicking
    /// after two seconds.
    pub async fn wait_until(&self, what: &str, pred: impl Fn(&[Envelope]) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if pred(&self.received()) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {}; received: {:?}", what, self.received());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for FixtureServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

fn mutation_verdict(
    envelope: &Envelope,
    versions: &Mutex<HashMap<String, u64>>,
    assigned_ids: &AtomicUsize,
) -> Option<Envelope> {
    let payload: MutationPayload = serde_json::from_value(envelope.payload.clone()).ok()?;

    if let Some(code) = payload
        .entity
        .as_ref()
        .and_then(|e| e.get("reject"))
        .and_then(|v| v.as_str())
    {
        let rejected = MutationRejected {
            client_ref: payload.client_ref,
            entity_id: payload.entity_id,
            code: code.to_string(),
            message: "rejected by fixture".to_string(),
        };
        return Some(Envelope::new(
            "mutations",
            EnvelopeKind::MutationRejected,
            serde_json::to_value(rejected).unwrap(),
        ));
    }

    let entity_id = if payload.entity_id.starts_with("tmp_") {
        format!("S{}", assigned_ids.fetch_add(1, Ordering::SeqCst) + 1)
    } else {
        payload.entity_id.clone()
    };
    let version = {
        let mut versions = versions.lock().unwrap();
        let slot = versions.entry(entity_id.clone()).or_insert(0);
        *slot += 1;
        *slot
    };
    let confirmed = MutationConfirmed {
        client_ref: payload.client_ref,
        entity_id,
        entity: payload.entity,
        version,
    };
    Some(Envelope::new(
        "mutations",
        EnvelopeKind::MutationConfirmed,
        serde_json::to_value(confirmed).unwrap(),
    ))
}
