use super::*;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use tokio::net::TcpListener;
use uuid::Uuid;

use shared::protocol::{RefreshRequest, RefreshResponse};

#[derive(Clone)]
struct AuthServerState {
    refresh_calls: Arc<AtomicU32>,
    reject_refresh: bool,
}

async fn handle_refresh(
    State(state): State<AuthServerState>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, StatusCode> {
    let call = state.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if state.reject_refresh {
        return Err(StatusCode::UNAUTHORIZED);
    }
    assert!(!request.refresh_token.is_empty());
    Ok(Json(RefreshResponse {
        access_token: format!("at-{call}"),
        refresh_token: format!("rt-{call}"),
    }))
}

async fn spawn_auth_server(reject_refresh: bool) -> (String, Arc<AtomicU32>) {
    let refresh_calls = Arc::new(AtomicU32::new(0));
    let state = AuthServerState {
        refresh_calls: Arc::clone(&refresh_calls),
        reject_refresh,
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/v1/auth/refresh", post(handle_refresh))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), refresh_calls)
}

fn persisted(refresh_token: &str) -> PersistedSession {
    PersistedSession {
        refresh_token: refresh_token.to_owned(),
        user_id: UserId(Uuid::from_u128(1)),
        device_id: Some(DeviceId(Uuid::from_u128(2))),
    }
}

fn store_with(
    base_url: &str,
    persistence: Arc<InMemorySessionPersistence>,
) -> SessionStore {
    SessionStore::new(reqwest::Client::new(), base_url, persistence)
}

#[tokio::test]
async fn bootstrap_without_persisted_session_reports_logged_out() {
    let (base_url, refresh_calls) = spawn_auth_server(false).await;
    let store = store_with(&base_url, Arc::new(InMemorySessionPersistence::default()));

    assert!(!store.bootstrap().await);
    assert_eq!(refresh_calls.load(Ordering::SeqCst), 0);
    assert!(!store.snapshot().await.is_authenticated());
}

#[tokio::test]
async fn bootstrap_exchanges_persisted_refresh_token() {
    let (base_url, refresh_calls) = spawn_auth_server(false).await;
    let persistence = Arc::new(InMemorySessionPersistence::default());
    persistence.store(&persisted("rt-0")).await.expect("seed");
    let store = store_with(&base_url, Arc::clone(&persistence));

    assert!(store.bootstrap().await);
    assert_eq!(refresh_calls.load(Ordering::SeqCst), 1);

    let session = store.snapshot().await;
    assert_eq!(session.access_token.as_deref(), Some("at-1"));
    assert_eq!(session.refresh_token.as_deref(), Some("rt-1"));
    assert_eq!(session.user_id, Some(UserId(Uuid::from_u128(1))));

    // The rotated token is what survives a restart.
    let stored = persistence.load().await.expect("load").expect("present");
    assert_eq!(stored.refresh_token, "rt-1");
}

#[tokio::test]
async fn rejected_refresh_clears_session_everywhere() {
    let (base_url, _) = spawn_auth_server(true).await;
    let persistence = Arc::new(InMemorySessionPersistence::default());
    persistence.store(&persisted("rt-0")).await.expect("seed");
    let store = store_with(&base_url, Arc::clone(&persistence));

    assert!(!store.bootstrap().await);
    assert_eq!(store.snapshot().await, Session::default());
    assert!(persistence.load().await.expect("load").is_none());
}

#[tokio::test]
async fn unreachable_auth_service_clears_session() {
    let persistence = Arc::new(InMemorySessionPersistence::default());
    persistence.store(&persisted("rt-0")).await.expect("seed");
    // Nothing listens on this port.
    let store = store_with("http://127.0.0.1:1", Arc::clone(&persistence));

    assert!(!store.bootstrap().await);
    assert!(persistence.load().await.expect("load").is_none());
}

#[tokio::test]
async fn refresh_without_any_token_fails_and_stays_cleared() {
    let (base_url, refresh_calls) = spawn_auth_server(false).await;
    let store = store_with(&base_url, Arc::new(InMemorySessionPersistence::default()));

    assert!(!store.refresh().await);
    assert_eq!(refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn login_result_installs_and_persists_session() {
    let persistence = Arc::new(InMemorySessionPersistence::default());
    let store = store_with("http://127.0.0.1:1", Arc::clone(&persistence));

    store
        .apply_login_result(shared::protocol::AuthTokens {
            access_token: "at".to_owned(),
            refresh_token: "rt".to_owned(),
            user_id: UserId(Uuid::from_u128(9)),
            device_id: None,
        })
        .await;

    assert!(store.snapshot().await.is_authenticated());
    let stored = persistence.load().await.expect("load").expect("present");
    assert_eq!(stored.refresh_token, "rt");
    assert_eq!(stored.user_id, UserId(Uuid::from_u128(9)));

    store.clear().await;
    store.clear().await;
    assert!(persistence.load().await.expect("load").is_none());
    assert!(!store.snapshot().await.is_authenticated());
}
