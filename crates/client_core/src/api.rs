use std::sync::Arc;

use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::error;

use shared::{
    domain::{DialogId, ServerMessageId},
    protocol::{
        AuthTokens, CreateDialogRequest, CreateDialogResponse, DialogSummary, LoginRequest,
        MessageRecord, RegisterRequest, SendMessageRequest, VerifyRequest,
    },
};

use crate::{
    error::{ClientError, Result},
    session::SessionStore,
};

/// Authenticated REST client. Every call attaches the current access token
/// and, on a 401, performs exactly one refresh-then-retry before giving up
/// with [`ClientError::Auth`].
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    session: Arc<SessionStore>,
}

impl ApiClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        session: Arc<SessionStore>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            session,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn register(&self, email: &str, password: &str) -> Result<()> {
        self.post_ack_json(
            "/v1/auth/register",
            &RegisterRequest {
                email: email.to_owned(),
                password: password.to_owned(),
            },
        )
        .await
    }

    pub async fn verify(&self, request: &VerifyRequest) -> Result<AuthTokens> {
        self.post_json("/v1/auth/verify", request).await
    }

    pub async fn login(&self, request: &LoginRequest) -> Result<AuthTokens> {
        self.post_json("/v1/auth/login", request).await
    }

    pub async fn list_dialogs(&self) -> Result<Vec<DialogSummary>> {
        self.get_json("/v1/dialogs").await
    }

    pub async fn create_dialog(&self, email: &str) -> Result<CreateDialogResponse> {
        self.post_json(
            "/v1/dialogs",
            &CreateDialogRequest {
                email: email.to_owned(),
            },
        )
        .await
    }

    /// History page, newest-first as the backend reports it.
    pub async fn fetch_messages(
        &self,
        dialog_id: DialogId,
        limit: u32,
    ) -> Result<Vec<MessageRecord>> {
        self.get_json(&format!("/v1/dialogs/{dialog_id}/messages?limit={limit}"))
            .await
    }

    pub async fn create_message(&self, dialog_id: DialogId, text: &str) -> Result<MessageRecord> {
        self.post_json(
            &format!("/v1/dialogs/{dialog_id}/messages"),
            &SendMessageRequest {
                text: text.to_owned(),
            },
        )
        .await
    }

    pub async fn mark_delivered(
        &self,
        dialog_id: DialogId,
        message_id: ServerMessageId,
    ) -> Result<()> {
        self.post_ack(&format!(
            "/v1/dialogs/{dialog_id}/messages/{message_id}/delivered"
        ))
        .await
    }

    pub async fn mark_read(&self, dialog_id: DialogId, message_id: ServerMessageId) -> Result<()> {
        self.post_ack(&format!(
            "/v1/dialogs/{dialog_id}/messages/{message_id}/read"
        ))
        .await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body = self.request(Method::GET, path, None).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let payload = serde_json::to_value(body)?;
        let text = self.request(Method::POST, path, Some(payload)).await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// POST to an ack-shaped endpoint: any 2xx counts and the body, if any,
    /// is ignored.
    async fn post_ack(&self, path: &str) -> Result<()> {
        self.request(Method::POST, path, None).await.map(|_| ())
    }

    async fn post_ack_json<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let payload = serde_json::to_value(body)?;
        self.request(Method::POST, path, Some(payload))
            .await
            .map(|_| ())
    }

    /// Issue one request, resolving a 401 with at most one refresh-then-retry
    /// per call chain.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<String> {
        let mut allow_retry = true;
        loop {
            let mut builder = self
                .http
                .request(method.clone(), format!("{}{path}", self.base_url));
            if let Some(token) = self.session.access_token().await {
                builder = builder.bearer_auth(token);
            }
            if let Some(body) = &body {
                builder = builder.json(body);
            }

            let response = builder.send().await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED {
                if allow_retry
                    && self.session.refresh_token().await.is_some()
                    && self.session.refresh().await
                {
                    allow_retry = false;
                    continue;
                }
                return Err(ClientError::Auth);
            }

            if status == StatusCode::NOT_FOUND {
                error!(path, "route returned 404; check gateway routing");
                return Err(ClientError::NotFound {
                    path: path.to_owned(),
                });
            }

            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(ClientError::Request {
                    status: status.as_u16(),
                    message,
                });
            }

            if status == StatusCode::NO_CONTENT {
                return Ok(String::new());
            }

            return Ok(response.text().await?);
        }
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
