use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{anyhow, Result as AnyResult};
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use shared::{
    domain::{DialogId, MessageId, ProvisionalId, ServerMessageId},
    protocol::{DialogSummary, LoginRequest, MessageRecord, PushEvent, VerifyRequest},
};

pub mod api;
pub mod channel;
pub mod conversations;
pub mod error;
pub mod receipts;
pub mod session;

use api::ApiClient;
use channel::{Backoff, ChannelEvent, ConnectionState, PushTransport, RealtimeChannel, WebSocketTransport};
use conversations::{ConversationStore, MessageMeta, ReceiptKind, TimelineEntry};
use error::{ClientError, Result};
use receipts::ReceiptTracker;
use session::{Session, SessionPersistence, SessionStore};

/// Receives state-change notifications. Implemented by the UI layer; every
/// callback fires synchronously after the mutation it describes.
pub trait RenderSink: Send + Sync {
    fn on_session_changed(&self, session: Option<&Session>);
    fn on_conversation_list_changed(&self, dialogs: &[DialogSummary]);
    fn on_timeline_changed(&self, dialog_id: DialogId);
    fn on_connection_state_changed(&self, state: ConnectionState);
}

/// Sink that discards every notification.
pub struct NullRenderSink;

impl RenderSink for NullRenderSink {
    fn on_session_changed(&self, _session: Option<&Session>) {}
    fn on_conversation_list_changed(&self, _dialogs: &[DialogSummary]) {}
    fn on_timeline_changed(&self, _dialog_id: DialogId) {}
    fn on_connection_state_changed(&self, _state: ConnectionState) {}
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub server_url: String,
    pub history_page_size: u32,
    pub backoff: Backoff,
}

impl EngineConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            history_page_size: 50,
            backoff: Backoff::default(),
        }
    }
}

/// Derive the push endpoint from the REST base url.
fn push_endpoint_url(server_url: &str) -> AnyResult<String> {
    let ws_base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(anyhow!("server_url must start with http:// or https://"));
    };
    Ok(format!("{}/v1/ws", ws_base.trim_end_matches('/')))
}

/// Orchestrates session, REST, push channel, conversation state and receipt
/// acknowledgment behind one context object. No ambient singletons; every
/// collaborator hangs off this instance.
pub struct SyncEngine {
    api: Arc<ApiClient>,
    session: Arc<SessionStore>,
    channel: Arc<RealtimeChannel>,
    receipts: ReceiptTracker,
    store: Mutex<ConversationStore>,
    open_dialog: Mutex<Option<DialogId>>,
    history_page_size: u32,
    sink: Arc<dyn RenderSink>,
    pump_started: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        persistence: Arc<dyn SessionPersistence>,
        sink: Arc<dyn RenderSink>,
    ) -> AnyResult<Arc<Self>> {
        Self::with_transport(config, persistence, Arc::new(WebSocketTransport), sink)
    }

    /// Build the engine with an injected push transport; the production
    /// transport is websocket, tests substitute a scripted one.
    pub fn with_transport(
        config: EngineConfig,
        persistence: Arc<dyn SessionPersistence>,
        transport: Arc<dyn PushTransport>,
        sink: Arc<dyn RenderSink>,
    ) -> AnyResult<Arc<Self>> {
        let base_url = config.server_url.trim_end_matches('/').to_owned();
        let ws_url = push_endpoint_url(&base_url)?;

        let http = reqwest::Client::new();
        let session = Arc::new(SessionStore::new(http.clone(), base_url.clone(), persistence));
        let api = Arc::new(ApiClient::new(http, base_url, Arc::clone(&session)));
        let channel = RealtimeChannel::with_backoff(
            ws_url,
            Arc::clone(&session),
            transport,
            config.backoff,
        );

        Ok(Arc::new(Self {
            receipts: ReceiptTracker::new(Arc::clone(&api)),
            api,
            session,
            channel,
            store: Mutex::new(ConversationStore::default()),
            open_dialog: Mutex::new(None),
            history_page_size: config.history_page_size.max(1),
            sink,
            pump_started: AtomicBool::new(false),
        }))
    }

    /// Try to resume from the persisted refresh token. On success the engine
    /// is fully started: list loaded, channel connecting, events flowing.
    pub async fn bootstrap(self: &Arc<Self>) -> bool {
        if !self.session.bootstrap().await {
            return false;
        }
        self.start_session().await;
        true
    }

    pub async fn register(&self, email: &str, password: &str) -> Result<()> {
        self.api.register(email, password).await
    }

    pub async fn verify(
        self: &Arc<Self>,
        email: &str,
        code: &str,
        device_name: &str,
        platform: &str,
    ) -> Result<()> {
        let tokens = self
            .api
            .verify(&VerifyRequest {
                email: email.to_owned(),
                code: code.to_owned(),
                device_name: device_name.to_owned(),
                platform: platform.to_owned(),
            })
            .await?;
        self.session.apply_login_result(tokens).await;
        self.start_session().await;
        Ok(())
    }

    pub async fn login(
        self: &Arc<Self>,
        email: &str,
        password: &str,
        device_name: &str,
        platform: &str,
    ) -> Result<()> {
        let tokens = self
            .api
            .login(&LoginRequest {
                email: email.to_owned(),
                password: password.to_owned(),
                device_name: device_name.to_owned(),
                platform: platform.to_owned(),
            })
            .await?;
        self.session.apply_login_result(tokens).await;
        self.start_session().await;
        Ok(())
    }

    /// Revoke the refresh token best-effort, then wipe everything local.
    pub async fn logout(&self) {
        self.session.logout_best_effort().await;
        self.channel.disconnect().await;
        self.session.clear().await;
        {
            *self.store.lock().await = ConversationStore::default();
        }
        *self.open_dialog.lock().await = None;
        self.sink.on_session_changed(None);
    }

    pub async fn load_dialogs(&self) -> Result<()> {
        let dialogs = self.guard(self.api.list_dialogs().await)?;
        let snapshot = {
            let mut store = self.store.lock().await;
            store.replace_dialogs(dialogs);
            store.dialogs().to_vec()
        };
        self.sink.on_conversation_list_changed(&snapshot);
        Ok(())
    }

    pub async fn create_dialog(&self, email: &str) -> Result<DialogId> {
        let created = self.guard(self.api.create_dialog(email).await)?;
        if let Err(err) = self.load_dialogs().await {
            warn!(error = %err, "dialog list refresh after create failed");
        }
        Ok(created.dialog_id)
    }

    /// Load the dialog's history page, make it the open conversation, and
    /// kick off receipt acknowledgment in the background.
    pub async fn open_conversation(self: &Arc<Self>, dialog_id: DialogId) -> Result<()> {
        let page = self.guard(
            self.api
                .fetch_messages(dialog_id, self.history_page_size)
                .await,
        )?;
        {
            let mut store = self.store.lock().await;
            store.load_history(dialog_id, page);
        }
        *self.open_dialog.lock().await = Some(dialog_id);
        self.sink.on_timeline_changed(dialog_id);
        self.spawn_acknowledge(dialog_id);
        Ok(())
    }

    /// Optimistically append, then issue the create call. On failure the
    /// entry is marked failed and kept for [`SyncEngine::retry`]; automatic
    /// retry is deliberately absent to avoid duplicate sends when the
    /// response was lost.
    pub async fn send(self: &Arc<Self>, dialog_id: DialogId, text: &str) -> Result<MessageId> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let Some(sender_id) = self.session.user_id().await else {
            return Err(ClientError::Auth);
        };

        let token = {
            let mut store = self.store.lock().await;
            store.insert_optimistic(dialog_id, sender_id, text)
        };
        self.sink.on_timeline_changed(dialog_id);

        self.dispatch_send(dialog_id, token, text.to_owned()).await
    }

    /// Re-issue the create call for a failed send, reusing its provisional
    /// id and text.
    pub async fn retry(&self, dialog_id: DialogId, token: ProvisionalId) -> Result<MessageId> {
        let text = {
            let store = self.store.lock().await;
            store
                .entry(dialog_id, MessageId::Provisional(token))
                .map(|entry| entry.text.clone())
        };
        let Some(text) = text else {
            return Err(ClientError::UnknownProvisional(token));
        };

        self.dispatch_send(dialog_id, token, text).await
    }

    async fn dispatch_send(
        &self,
        dialog_id: DialogId,
        token: ProvisionalId,
        text: String,
    ) -> Result<MessageId> {
        match self.api.create_message(dialog_id, &text).await {
            Ok(record) => {
                let confirmed = MessageId::Confirmed(record.id);
                {
                    let mut store = self.store.lock().await;
                    store.confirm_send(dialog_id, token, record);
                }
                self.sink.on_timeline_changed(dialog_id);
                Ok(confirmed)
            }
            Err(err) => {
                {
                    let mut store = self.store.lock().await;
                    store.mark_send_failed(dialog_id, token);
                }
                self.sink.on_timeline_changed(dialog_id);
                if err.is_auth() {
                    self.sink.on_session_changed(None);
                }
                Err(ClientError::SendFailed {
                    source: Box::new(err),
                })
            }
        }
    }

    /// Route one push event into the stores. Public so callers without a
    /// live channel (tests, replays) can feed events directly.
    pub async fn handle_push_event(self: &Arc<Self>, event: PushEvent) {
        match event {
            PushEvent::MessageNew {
                dialog_id,
                message_id,
                sender_id,
                text,
                created_at,
            } => {
                let appended = {
                    let mut store = self.store.lock().await;
                    store.append_from_push(
                        dialog_id,
                        MessageRecord {
                            id: message_id,
                            sender_id,
                            dialog_id,
                            text,
                            created_at,
                            delivered_to_me: false,
                            read_by_me: false,
                            delivered_by_peer: false,
                            read_by_peer: false,
                        },
                    )
                };
                if appended {
                    self.sink.on_timeline_changed(dialog_id);
                    let open = { *self.open_dialog.lock().await };
                    if open == Some(dialog_id) {
                        self.spawn_acknowledge(dialog_id);
                    }
                }
                // Previews and unread counts come from the backend list.
                if let Err(err) = self.load_dialogs().await {
                    warn!(error = %err, "dialog list refresh after push failed");
                }
            }
            PushEvent::MessageDelivered {
                dialog_id,
                message_id,
            } => {
                self.apply_receipt(dialog_id, message_id, ReceiptKind::Delivered)
                    .await;
            }
            PushEvent::MessageRead {
                dialog_id,
                message_id,
            } => {
                self.apply_receipt(dialog_id, message_id, ReceiptKind::Read)
                    .await;
            }
        }
    }

    async fn apply_receipt(
        &self,
        dialog_id: DialogId,
        message_id: ServerMessageId,
        kind: ReceiptKind,
    ) {
        let changed = {
            let mut store = self.store.lock().await;
            store.apply_receipt(dialog_id, message_id, kind)
        };
        if changed {
            self.sink.on_timeline_changed(dialog_id);
        }
    }

    fn spawn_acknowledge(self: &Arc<Self>, dialog_id: DialogId) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.acknowledge_received(dialog_id).await;
        });
    }

    /// Fire-and-forget receipt pass; completion only updates meta.
    async fn acknowledge_received(&self, dialog_id: DialogId) {
        let Some(local_user) = self.session.user_id().await else {
            return;
        };
        let timeline = { self.store.lock().await.timeline_snapshot(dialog_id) };
        let acknowledged = self
            .receipts
            .acknowledge(dialog_id, &timeline, local_user)
            .await;
        if acknowledged.is_empty() {
            return;
        }
        let changed = {
            let mut store = self.store.lock().await;
            store.mark_acknowledged(dialog_id, &acknowledged)
        };
        if changed {
            self.sink.on_timeline_changed(dialog_id);
        }
    }

    async fn start_session(self: &Arc<Self>) {
        let session = self.session.snapshot().await;
        self.sink.on_session_changed(Some(&session));
        if let Err(err) = self.load_dialogs().await {
            warn!(error = %err, "initial dialog list load failed");
        }
        self.ensure_event_pump();
        self.channel.connect();
    }

    fn ensure_event_pump(self: &Arc<Self>) {
        if self.pump_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = Arc::clone(self);
        let mut events = self.channel.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChannelEvent::StateChanged(state)) => {
                        engine.sink.on_connection_state_changed(state);
                    }
                    Ok(ChannelEvent::Push(event)) => {
                        engine.handle_push_event(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "push event pump lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// Report a forced logout to the sink when an API call burned through
    /// its refresh attempt.
    fn guard<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_auth() {
                self.sink.on_session_changed(None);
            }
        }
        result
    }

    pub async fn session_snapshot(&self) -> Session {
        self.session.snapshot().await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.channel.state().await
    }

    pub async fn dialogs(&self) -> Vec<DialogSummary> {
        self.store.lock().await.dialogs().to_vec()
    }

    pub async fn open_dialog(&self) -> Option<DialogId> {
        *self.open_dialog.lock().await
    }

    /// Timeline entries with their meta, oldest first.
    pub async fn timeline(&self, dialog_id: DialogId) -> Vec<(TimelineEntry, MessageMeta)> {
        let store = self.store.lock().await;
        store
            .timeline(dialog_id)
            .iter()
            .map(|entry| {
                let meta = store.meta(entry.id).copied().unwrap_or_default();
                (entry.clone(), meta)
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
