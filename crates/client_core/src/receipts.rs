use std::sync::Arc;

use futures::future::join_all;
use tracing::warn;

use shared::domain::{DialogId, ServerMessageId, UserId};

use crate::{api::ApiClient, conversations::TimelineEntry};

/// Marks peer-authored messages delivered, then read. Both endpoints are
/// idempotent server-side; failures are logged and never surface to the
/// caller or roll back local state.
pub struct ReceiptTracker {
    api: Arc<ApiClient>,
}

impl ReceiptTracker {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }

    /// Acknowledge every confirmed message in `timeline` authored by someone
    /// other than `local_user`. Returns the ids acknowledged end to end.
    ///
    /// Two full passes by contract: every delivered call settles before the
    /// first read call goes out.
    pub async fn acknowledge(
        &self,
        dialog_id: DialogId,
        timeline: &[TimelineEntry],
        local_user: UserId,
    ) -> Vec<ServerMessageId> {
        let targets: Vec<ServerMessageId> = timeline
            .iter()
            .filter(|entry| entry.sender_id != local_user)
            .filter_map(|entry| entry.id.confirmed())
            .collect();
        if targets.is_empty() {
            return Vec::new();
        }

        let delivered = join_all(
            targets
                .iter()
                .map(|id| self.api.mark_delivered(dialog_id, *id)),
        )
        .await;
        for (id, result) in targets.iter().zip(&delivered) {
            if let Err(err) = result {
                warn!(dialog_id = %dialog_id, message_id = %id, error = %err, "mark-delivered failed");
            }
        }

        let read = join_all(targets.iter().map(|id| self.api.mark_read(dialog_id, *id))).await;

        let mut acknowledged = Vec::new();
        for ((id, delivered), read) in targets.iter().zip(&delivered).zip(&read) {
            match read {
                Ok(()) if delivered.is_ok() => acknowledged.push(*id),
                Ok(()) => {}
                Err(err) => {
                    warn!(dialog_id = %dialog_id, message_id = %id, error = %err, "mark-read failed");
                }
            }
        }
        acknowledged
    }
}

#[cfg(test)]
#[path = "tests/receipts_tests.rs"]
mod tests;
