use thiserror::Error;

use shared::domain::ProvisionalId;

/// Client-side failure taxonomy.
///
/// `Auth` means the refresh path could not recover and the session has been
/// cleared; `NotFound` flags a gateway/routing defect; `SendFailed` is the
/// only recoverable variant, resolved by an explicit retry.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Unauthorized, and no refresh token existed or the refresh was
    /// rejected.
    #[error("not authorized")]
    Auth,

    /// 404 on a known route. On an auth-prefixed path this means the gateway
    /// is misrouting, not that the user asked for something missing.
    #[error("route not found: {path}")]
    NotFound { path: String },

    /// Non-2xx response; the message is the response body text.
    #[error("request failed with status {status}: {message}")]
    Request { status: u16, message: String },

    /// The request never produced an HTTP status.
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response body did not match the declared shape.
    #[error("malformed response body: {0}")]
    Decode(#[from] serde_json::Error),

    /// Message text was empty or whitespace-only.
    #[error("message text must not be empty")]
    EmptyMessage,

    /// Retry referenced a provisional id that is no longer in the timeline.
    #[error("unknown provisional message {0}")]
    UnknownProvisional(ProvisionalId),

    /// Message creation failed. The timeline entry is marked failed and kept
    /// under its provisional id so a retry can reuse it.
    #[error("message send failed: {source}")]
    SendFailed {
        #[source]
        source: Box<ClientError>,
    },
}

impl ClientError {
    /// Whether this failure (or the failure it wraps) cleared the session.
    pub fn is_auth(&self) -> bool {
        match self {
            ClientError::Auth => true,
            ClientError::SendFailed { source } => source.is_auth(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
