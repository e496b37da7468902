//! Credential endpoint tests against a mock HTTP server.

mod common;

use common::fake_jwt;
use lane_link::{
    BackoffPolicy, Credential, HttpAuthApi, KeyValueStore, LaneLinkClient, LaneLinkError,
    MemoryBackend, RefreshCoordinator, SessionEvent, SESSION_STORE_KEY,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

fn token_body(subject: &str, expires_in: Duration) -> serde_json::Value {
    json!({
        "access_token": fake_jwt(subject),
        "refresh_token": format!("refresh_{}", subject),
        "expires_at": now_ms() + expires_in.as_millis() as u64,
    })
}

fn test_store() -> KeyValueStore {
    KeyValueStore::new(
        Arc::new(MemoryBackend::new()),
        "lane",
        lane_link::DEFAULT_QUOTA_BYTES,
        Duration::ZERO,
    )
    .unwrap()
}

#[tokio::test]
async fn test_login_persists_session_to_store() {
    common::init_logging();
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/login"))
        .and(body_partial_json(json!({"username": "alice"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("alice", Duration::from_secs(3600))))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = LaneLinkClient::builder(mock_server.uri())
        .storage_backend(Arc::new(MemoryBackend::new()))
        .debounce_window(Duration::ZERO)
        .build()
        .unwrap();

    client.login("alice", "secret").await.unwrap();

    let credential = client.current_credential().await.expect("session installed");
    assert!(Credential::is_well_formed(&credential.access_token));
    assert!(client.store().get(SESSION_STORE_KEY).is_some(), "session persisted");

    client.close().await;
}

#[tokio::test]
async fn test_login_rejection_is_an_auth_error() {
    common::init_logging();
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
        .mount(&mock_server)
        .await;

    let client = LaneLinkClient::builder(mock_server.uri())
        .storage_backend(Arc::new(MemoryBackend::new()))
        .debounce_window(Duration::ZERO)
        .build()
        .unwrap();

    let err = client.login("alice", "wrong").await.unwrap_err();
    assert!(matches!(err, LaneLinkError::Auth(_)));
    assert!(client.current_credential().await.is_none());

    client.close().await;
}

#[tokio::test]
async fn test_concurrent_renewals_hit_the_endpoint_once() {
    common::init_logging();
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body("alice", Duration::from_secs(3600)))
                .set_delay(Duration::from_millis(50)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let api = HttpAuthApi::new(mock_server.uri(), Duration::from_secs(5)).unwrap();
    let coordinator = RefreshCoordinator::new(
        Arc::new(api),
        test_store(),
        BackoffPolicy::default(),
        Duration::from_secs(30),
    );
    coordinator
        .install(Credential {
            access_token: fake_jwt("alice"),
            refresh_token: "refresh_alice".to_string(),
            // Inside the 30 s threshold: every caller wants a renewal.
            expires_at_ms: now_ms() + 1_000,
        })
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let c = coordinator.clone();
        tasks.push(tokio::spawn(async move { c.get_valid_credential().await }));
    }
    let mut tokens = Vec::new();
    for task in tasks {
        tokens.push(task.await.unwrap().unwrap().access_token);
    }
    assert!(tokens.windows(2).all(|w| w[0] == w[1]), "one shared outcome");
    // The expect(1) on the mock verifies single-flight on drop.
}

#[tokio::test]
async fn test_renewal_rejection_forces_logout_and_clears_store() {
    common::init_logging();
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/refresh"))
        .respond_with(ResponseTemplate::new(401).set_body_string("revoked"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let store = test_store();
    let api = HttpAuthApi::new(mock_server.uri(), Duration::from_secs(5)).unwrap();
    let coordinator = RefreshCoordinator::new(
        Arc::new(api),
        store.clone(),
        BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(4), 3),
        Duration::from_secs(30),
    );
    coordinator
        .install(Credential {
            access_token: fake_jwt("alice"),
            refresh_token: "refresh_alice".to_string(),
            expires_at_ms: now_ms() + 1_000,
        })
        .await
        .unwrap();
    assert!(store.get(SESSION_STORE_KEY).is_some());

    let mut session = coordinator.subscribe_session();
    let err = coordinator.get_valid_credential().await.unwrap_err();
    assert!(matches!(err, LaneLinkError::Auth(_)));
    assert!(store.get(SESSION_STORE_KEY).is_none(), "persisted session cleared");
    assert!(matches!(
        session.recv().await.unwrap(),
        SessionEvent::ForcedLogout { .. }
    ));
}

#[tokio::test]
async fn test_transient_endpoint_failures_retry_transparently() {
    common::init_logging();
    let mock_server = MockServer::start().await;
    // Two failures, then success.
    Mock::given(method("POST"))
        .and(path("/v1/auth/refresh"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("alice", Duration::from_secs(3600))))
        .mount(&mock_server)
        .await;

    let api = HttpAuthApi::new(mock_server.uri(), Duration::from_secs(5)).unwrap();
    let coordinator = RefreshCoordinator::new(
        Arc::new(api),
        test_store(),
        BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(4), 5),
        Duration::from_secs(30),
    );
    coordinator
        .install(Credential {
            access_token: fake_jwt("alice"),
            refresh_token: "refresh_alice".to_string(),
            expires_at_ms: now_ms() + 1_000,
        })
        .await
        .unwrap();

    let credential = coordinator.get_valid_credential().await.unwrap();
    assert!(!credential.expires_within(Duration::from_secs(30)));
}

#[tokio::test]
async fn test_session_restores_across_client_instances() {
    common::init_logging();
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("alice", Duration::from_secs(3600))))
        .mount(&mock_server)
        .await;

    let backend = Arc::new(MemoryBackend::new());
    {
        let client = LaneLinkClient::builder(mock_server.uri())
            .storage_backend(backend.clone())
            .debounce_window(Duration::ZERO)
            .build()
            .unwrap();
        client.login("alice", "secret").await.unwrap();
        client.close().await;
    }

    // A second client over the same backend picks the session up without
    // logging in again.
    let client = LaneLinkClient::builder(mock_server.uri())
        .storage_backend(backend)
        .debounce_window(Duration::ZERO)
        .build()
        .unwrap();
    assert!(client.current_credential().await.is_some());
    client.close().await;
}
