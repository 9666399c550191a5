use super::*;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use tokio::{net::TcpListener, sync::Mutex};
use uuid::Uuid;

use shared::{domain::MessageId, protocol::AuthTokens};

use crate::session::{InMemorySessionPersistence, SessionStore};

#[derive(Clone)]
struct ReceiptServerState {
    calls: Arc<Mutex<Vec<String>>>,
    fail_delivered_for: Option<i64>,
}

async fn handle_delivered(
    State(state): State<ReceiptServerState>,
    Path((_dialog_id, message_id)): Path<(Uuid, i64)>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    state.calls.lock().await.push(format!("delivered:{message_id}"));
    if state.fail_delivered_for == Some(message_id) {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn handle_read(
    State(state): State<ReceiptServerState>,
    Path((_dialog_id, message_id)): Path<(Uuid, i64)>,
) -> Json<serde_json::Value> {
    state.calls.lock().await.push(format!("read:{message_id}"));
    Json(serde_json::json!({"status": "ok"}))
}

async fn spawn_receipt_server(fail_delivered_for: Option<i64>) -> (String, Arc<Mutex<Vec<String>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let state = ReceiptServerState {
        calls: Arc::clone(&calls),
        fail_delivered_for,
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route(
            "/v1/dialogs/:id/messages/:mid/delivered",
            post(handle_delivered),
        )
        .route("/v1/dialogs/:id/messages/:mid/read", post(handle_read))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), calls)
}

fn me() -> UserId {
    UserId(Uuid::from_u128(0x3e))
}

fn peer() -> UserId {
    UserId(Uuid::from_u128(0x9ee7))
}

fn dialog() -> DialogId {
    DialogId(Uuid::from_u128(0xd1a7))
}

fn confirmed_entry(id: i64, sender: UserId) -> TimelineEntry {
    TimelineEntry {
        id: MessageId::Confirmed(ServerMessageId(id)),
        dialog_id: dialog(),
        sender_id: sender,
        text: "hi".to_owned(),
        created_at: Utc::now(),
    }
}

fn provisional_entry(token: u64) -> TimelineEntry {
    TimelineEntry {
        id: MessageId::Provisional(shared::domain::ProvisionalId(token)),
        dialog_id: dialog(),
        sender_id: me(),
        text: "pending".to_owned(),
        created_at: Utc::now(),
    }
}

async fn tracker_for(base_url: &str) -> ReceiptTracker {
    let session = Arc::new(SessionStore::new(
        reqwest::Client::new(),
        base_url,
        Arc::new(InMemorySessionPersistence::default()),
    ));
    session
        .apply_login_result(AuthTokens {
            access_token: "at".to_owned(),
            refresh_token: "rt".to_owned(),
            user_id: me(),
            device_id: None,
        })
        .await;
    ReceiptTracker::new(Arc::new(ApiClient::new(
        reqwest::Client::new(),
        base_url,
        session,
    )))
}

#[tokio::test]
async fn acknowledges_peer_messages_delivered_before_read() {
    let (base_url, calls) = spawn_receipt_server(None).await;
    let tracker = tracker_for(&base_url).await;
    let timeline = vec![
        confirmed_entry(1, peer()),
        confirmed_entry(2, me()),
        confirmed_entry(3, peer()),
        provisional_entry(1),
    ];

    let mut acknowledged = tracker.acknowledge(dialog(), &timeline, me()).await;
    acknowledged.sort();
    assert_eq!(acknowledged, vec![ServerMessageId(1), ServerMessageId(3)]);

    let calls = calls.lock().await;
    // Own and still-provisional messages are never acknowledged.
    assert_eq!(calls.len(), 4);
    assert!(calls.iter().all(|call| !call.ends_with(":2")));
    // Every delivered call settles before the first read call goes out.
    let first_read = calls.iter().position(|c| c.starts_with("read:")).unwrap();
    let last_delivered = calls
        .iter()
        .rposition(|c| c.starts_with("delivered:"))
        .unwrap();
    assert!(last_delivered < first_read, "calls out of order: {calls:?}");
}

#[tokio::test]
async fn empty_timeline_sends_nothing() {
    let (base_url, calls) = spawn_receipt_server(None).await;
    let tracker = tracker_for(&base_url).await;

    let acknowledged = tracker.acknowledge(dialog(), &[], me()).await;
    assert!(acknowledged.is_empty());
    assert!(calls.lock().await.is_empty());
}

#[tokio::test]
async fn partial_failure_still_reads_and_reports_the_rest() {
    let (base_url, calls) = spawn_receipt_server(Some(1)).await;
    let tracker = tracker_for(&base_url).await;
    let timeline = vec![confirmed_entry(1, peer()), confirmed_entry(2, peer())];

    let acknowledged = tracker.acknowledge(dialog(), &timeline, me()).await;
    // Message 1's delivered call failed, so only message 2 counts as fully
    // acknowledged; the read pass still ran for both.
    assert_eq!(acknowledged, vec![ServerMessageId(2)]);
    let calls = calls.lock().await;
    assert_eq!(
        calls.iter().filter(|c| c.starts_with("read:")).count(),
        2
    );
}
