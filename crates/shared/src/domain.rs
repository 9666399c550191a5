use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_newtype!(UserId);
uuid_newtype!(DeviceId);
uuid_newtype!(DialogId);

/// Backend-assigned message id, globally unique per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerMessageId(pub i64);

impl fmt::Display for ServerMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Client-assigned placeholder id for an optimistic send, unique for the
/// lifetime of the client process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProvisionalId(pub u64);

impl fmt::Display for ProvisionalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Current identity of a timeline entry. Provisional and confirmed ids live
/// in separate namespaces by construction; a pending send is rekeyed from
/// `Provisional` to `Confirmed` exactly once, when the create call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageId {
    Provisional(ProvisionalId),
    Confirmed(ServerMessageId),
}

impl MessageId {
    pub fn confirmed(&self) -> Option<ServerMessageId> {
        match self {
            MessageId::Confirmed(id) => Some(*id),
            MessageId::Provisional(_) => None,
        }
    }

    pub fn provisional(&self) -> Option<ProvisionalId> {
        match self {
            MessageId::Provisional(token) => Some(*token),
            MessageId::Confirmed(_) => None,
        }
    }
}

impl From<ServerMessageId> for MessageId {
    fn from(id: ServerMessageId) -> Self {
        MessageId::Confirmed(id)
    }
}

impl From<ProvisionalId> for MessageId {
    fn from(token: ProvisionalId) -> Self {
        MessageId::Provisional(token)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Provisional(token) => write!(f, "local:{token}"),
            MessageId::Confirmed(id) => write!(f, "{id}"),
        }
    }
}
