use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use shared::{
    domain::{DeviceId, UserId},
    protocol::{AuthTokens, LogoutRequest, RefreshRequest, RefreshResponse},
};
use storage::{PersistedSession, SessionDb};

/// In-memory session state. Only the refresh token, user id and device id
/// survive restarts; the access token is always re-derived.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user_id: Option<UserId>,
    pub device_id: Option<DeviceId>,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }
}

/// Durable backend for the persisted session subset.
#[async_trait]
pub trait SessionPersistence: Send + Sync {
    async fn load(&self) -> anyhow::Result<Option<PersistedSession>>;
    async fn store(&self, session: &PersistedSession) -> anyhow::Result<()>;
    async fn clear(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl SessionPersistence for SessionDb {
    async fn load(&self) -> anyhow::Result<Option<PersistedSession>> {
        self.load_session().await
    }

    async fn store(&self, session: &PersistedSession) -> anyhow::Result<()> {
        self.store_session(session).await
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.clear_session().await
    }
}

/// Keeps the persisted subset in process memory only; used by tests and by
/// callers that opt out of durable storage.
#[derive(Default)]
pub struct InMemorySessionPersistence {
    inner: Mutex<Option<PersistedSession>>,
}

#[async_trait]
impl SessionPersistence for InMemorySessionPersistence {
    async fn load(&self) -> anyhow::Result<Option<PersistedSession>> {
        Ok(self.inner.lock().await.clone())
    }

    async fn store(&self, session: &PersistedSession) -> anyhow::Result<()> {
        *self.inner.lock().await = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        *self.inner.lock().await = None;
        Ok(())
    }
}

/// Owns the token lifecycle: bootstrap from the persisted refresh token,
/// rotation on refresh, and the terminal clear when refresh fails.
pub struct SessionStore {
    http: reqwest::Client,
    base_url: String,
    persistence: Arc<dyn SessionPersistence>,
    session: Mutex<Session>,
}

impl SessionStore {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        persistence: Arc<dyn SessionPersistence>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            persistence,
            session: Mutex::new(Session::default()),
        }
    }

    pub async fn snapshot(&self) -> Session {
        self.session.lock().await.clone()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.session.lock().await.access_token.clone()
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.session.lock().await.refresh_token.clone()
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.session.lock().await.user_id
    }

    /// Restore a session from persistence, returning whether a usable one
    /// resulted. A persisted refresh token is only trusted after a
    /// successful exchange.
    pub async fn bootstrap(&self) -> bool {
        let persisted = match self.persistence.load().await {
            Ok(Some(persisted)) => persisted,
            Ok(None) => return false,
            Err(err) => {
                warn!(error = %err, "failed to load persisted session");
                return false;
            }
        };

        {
            let mut session = self.session.lock().await;
            session.refresh_token = Some(persisted.refresh_token);
            session.user_id = Some(persisted.user_id);
            session.device_id = persisted.device_id;
        }

        self.refresh().await
    }

    /// Exchange the refresh token for a new (access, refresh) pair.
    ///
    /// Any failure is terminal: the session is wiped, in memory and on disk,
    /// and the caller must re-authenticate. Returns whether the exchange
    /// succeeded.
    pub async fn refresh(&self) -> bool {
        let Some(refresh_token) = self.refresh_token().await else {
            self.clear().await;
            return false;
        };

        let response = self
            .http
            .post(format!("{}/v1/auth/refresh", self.base_url))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await;

        let tokens: RefreshResponse = match response {
            Ok(res) if res.status().is_success() => match res.json().await {
                Ok(tokens) => tokens,
                Err(err) => {
                    warn!(error = %err, "token refresh returned malformed body");
                    self.clear().await;
                    return false;
                }
            },
            Ok(res) => {
                warn!(status = res.status().as_u16(), "token refresh rejected");
                self.clear().await;
                return false;
            }
            Err(err) => {
                warn!(error = %err, "token refresh failed");
                self.clear().await;
                return false;
            }
        };

        let persisted = {
            let mut session = self.session.lock().await;
            session.access_token = Some(tokens.access_token);
            session.refresh_token = Some(tokens.refresh_token.clone());
            session.user_id.map(|user_id| PersistedSession {
                refresh_token: tokens.refresh_token,
                user_id,
                device_id: session.device_id,
            })
        };

        if let Some(persisted) = persisted {
            if let Err(err) = self.persistence.store(&persisted).await {
                warn!(error = %err, "failed to persist rotated refresh token");
            }
        }

        true
    }

    /// Install a fresh session after login or verify.
    pub async fn apply_login_result(&self, tokens: AuthTokens) {
        let persisted = PersistedSession {
            refresh_token: tokens.refresh_token.clone(),
            user_id: tokens.user_id,
            device_id: tokens.device_id,
        };

        {
            let mut session = self.session.lock().await;
            *session = Session {
                access_token: Some(tokens.access_token),
                refresh_token: Some(tokens.refresh_token),
                user_id: Some(tokens.user_id),
                device_id: tokens.device_id,
            };
        }

        if let Err(err) = self.persistence.store(&persisted).await {
            warn!(error = %err, "failed to persist session");
        }
    }

    /// Revoke the refresh token server-side. Errors are ignored; local state
    /// is untouched so the caller can still `clear()` afterwards.
    pub async fn logout_best_effort(&self) {
        let Some(refresh_token) = self.refresh_token().await else {
            return;
        };

        let result = self
            .http
            .post(format!("{}/v1/auth/logout", self.base_url))
            .json(&LogoutRequest { refresh_token })
            .send()
            .await;

        if let Err(err) = result {
            warn!(error = %err, "logout request failed");
        }
    }

    /// Wipe in-memory and persisted session state. Idempotent.
    pub async fn clear(&self) {
        {
            *self.session.lock().await = Session::default();
        }

        if let Err(err) = self.persistence.clear().await {
            warn!(error = %err, "failed to clear persisted session");
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
