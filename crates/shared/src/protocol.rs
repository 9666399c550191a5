use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{DeviceId, DialogId, ServerMessageId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub email: String,
    pub code: String,
    pub device_name: String,
    pub platform: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub device_name: String,
    pub platform: String,
}

/// Token set issued by login and verify.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// The refresh token rotates on every exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDialogRequest {
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDialogResponse {
    pub dialog_id: DialogId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
}

/// Message as the backend reports it, with receipt flags relative to the
/// requesting user (`*_to_me`/`*_by_me`) and to the peer (`*_by_peer`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: ServerMessageId,
    pub sender_id: UserId,
    pub dialog_id: DialogId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delivered_to_me: bool,
    #[serde(default)]
    pub read_by_me: bool,
    #[serde(default)]
    pub delivered_by_peer: bool,
    #[serde(default)]
    pub read_by_peer: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogSummary {
    pub id: DialogId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessageRecord>,
    #[serde(default)]
    pub unread_count: i64,
}

/// Events pushed over the persistent connection. The wire layout is flat:
/// a `type` discriminator next to the payload fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PushEvent {
    #[serde(rename = "message.new")]
    MessageNew {
        dialog_id: DialogId,
        message_id: ServerMessageId,
        sender_id: UserId,
        text: String,
        created_at: DateTime<Utc>,
    },
    #[serde(rename = "message.delivered")]
    MessageDelivered {
        dialog_id: DialogId,
        message_id: ServerMessageId,
    },
    #[serde(rename = "message.read")]
    MessageRead {
        dialog_id: DialogId,
        message_id: ServerMessageId,
    },
}

impl PushEvent {
    pub fn dialog_id(&self) -> DialogId {
        match self {
            PushEvent::MessageNew { dialog_id, .. }
            | PushEvent::MessageDelivered { dialog_id, .. }
            | PushEvent::MessageRead { dialog_id, .. } => *dialog_id,
        }
    }
}
