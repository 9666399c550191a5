use std::collections::HashMap;

use chrono::{DateTime, Utc};

use shared::{
    domain::{DialogId, MessageId, ProvisionalId, ServerMessageId, UserId},
    protocol::{DialogSummary, MessageRecord},
};

/// Receipt direction applied to a message's meta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptKind {
    Delivered,
    Read,
}

/// Per-message receipt and send-state flags, keyed by the message's current
/// id. At most one of `pending`/`failed` is set at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageMeta {
    pub pending: bool,
    pub failed: bool,
    pub delivered_by_peer: bool,
    pub read_by_peer: bool,
    pub delivered_to_me: bool,
    pub read_by_me: bool,
}

/// One timeline entry. The id is provisional until the send confirms.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub id: MessageId,
    pub dialog_id: DialogId,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Per-dialog ordered timelines plus receipt meta, merged idempotently from
/// history loads, push events and optimistic local sends.
#[derive(Default)]
pub struct ConversationStore {
    dialogs: Vec<DialogSummary>,
    timelines: HashMap<DialogId, Vec<TimelineEntry>>,
    meta: HashMap<MessageId, MessageMeta>,
    next_provisional: u64,
}

impl ConversationStore {
    /// The dialog list is a cache, replaced wholesale on every refresh.
    pub fn replace_dialogs(&mut self, dialogs: Vec<DialogSummary>) {
        self.dialogs = dialogs;
    }

    pub fn dialogs(&self) -> &[DialogSummary] {
        &self.dialogs
    }

    /// Replace a dialog's timeline with a history page. The page arrives
    /// newest-first and is stored oldest-first; meta is seeded from the
    /// receipt flags the backend reports.
    pub fn load_history(&mut self, dialog_id: DialogId, page: Vec<MessageRecord>) {
        if let Some(previous) = self.timelines.get(&dialog_id) {
            for entry in previous {
                self.meta.remove(&entry.id);
            }
        }

        let mut entries = Vec::with_capacity(page.len());
        for record in page.into_iter().rev() {
            let id = MessageId::Confirmed(record.id);
            self.meta.insert(
                id,
                MessageMeta {
                    delivered_by_peer: record.delivered_by_peer,
                    read_by_peer: record.read_by_peer,
                    delivered_to_me: record.delivered_to_me,
                    read_by_me: record.read_by_me,
                    ..MessageMeta::default()
                },
            );
            entries.push(TimelineEntry {
                id,
                dialog_id,
                sender_id: record.sender_id,
                text: record.text,
                created_at: record.created_at,
            });
        }
        self.timelines.insert(dialog_id, entries);
    }

    /// Append a push-delivered message. Idempotent: an id already present in
    /// the timeline leaves it unchanged. Returns whether anything changed.
    pub fn append_from_push(&mut self, dialog_id: DialogId, record: MessageRecord) -> bool {
        let id = MessageId::Confirmed(record.id);
        let timeline = self.timelines.entry(dialog_id).or_default();
        if timeline.iter().any(|entry| entry.id == id) {
            return false;
        }

        timeline.push(TimelineEntry {
            id,
            dialog_id,
            sender_id: record.sender_id,
            text: record.text,
            created_at: record.created_at,
        });
        self.meta.insert(id, MessageMeta::default());
        true
    }

    /// Append an optimistic local send at the tail, marked pending.
    pub fn insert_optimistic(
        &mut self,
        dialog_id: DialogId,
        sender_id: UserId,
        text: &str,
    ) -> ProvisionalId {
        self.next_provisional += 1;
        let token = ProvisionalId(self.next_provisional);
        let id = MessageId::Provisional(token);

        self.timelines
            .entry(dialog_id)
            .or_default()
            .push(TimelineEntry {
                id,
                dialog_id,
                sender_id,
                text: text.to_owned(),
                created_at: Utc::now(),
            });
        self.meta.insert(
            id,
            MessageMeta {
                pending: true,
                ..MessageMeta::default()
            },
        );
        token
    }

    /// Swap a pending entry for the server's message in place, rekeying its
    /// meta from the provisional id to the server id.
    ///
    /// If the push stream already delivered the confirmed message, the
    /// provisional entry is dropped instead, keeping server ids unique in
    /// the timeline.
    pub fn confirm_send(
        &mut self,
        dialog_id: DialogId,
        token: ProvisionalId,
        record: MessageRecord,
    ) -> bool {
        let provisional = MessageId::Provisional(token);
        let confirmed = MessageId::Confirmed(record.id);

        let Some(timeline) = self.timelines.get_mut(&dialog_id) else {
            return false;
        };
        let Some(position) = timeline.iter().position(|entry| entry.id == provisional) else {
            return false;
        };

        if timeline.iter().any(|entry| entry.id == confirmed) {
            timeline.remove(position);
            self.meta.remove(&provisional);
            return true;
        }

        timeline[position] = TimelineEntry {
            id: confirmed,
            dialog_id,
            sender_id: record.sender_id,
            text: record.text,
            created_at: record.created_at,
        };
        self.meta.remove(&provisional);
        self.meta.insert(
            confirmed,
            MessageMeta {
                delivered_by_peer: record.delivered_by_peer,
                read_by_peer: record.read_by_peer,
                ..MessageMeta::default()
            },
        );
        true
    }

    /// Record a failed send. The entry and its provisional id stay in place
    /// so a retry can reuse them.
    pub fn mark_send_failed(&mut self, dialog_id: DialogId, token: ProvisionalId) -> bool {
        let id = MessageId::Provisional(token);
        let present = self
            .timelines
            .get(&dialog_id)
            .is_some_and(|timeline| timeline.iter().any(|entry| entry.id == id));
        if !present {
            return false;
        }

        let meta = self.meta.entry(id).or_default();
        meta.failed = true;
        meta.pending = false;
        true
    }

    /// Apply a peer receipt. Read implies delivered. A receipt for a message
    /// not yet observed in this dialog is dropped; the race is acceptable
    /// and the eventual history load carries the authoritative flags.
    pub fn apply_receipt(
        &mut self,
        dialog_id: DialogId,
        message_id: ServerMessageId,
        kind: ReceiptKind,
    ) -> bool {
        let id = MessageId::Confirmed(message_id);
        let known = self
            .timelines
            .get(&dialog_id)
            .is_some_and(|timeline| timeline.iter().any(|entry| entry.id == id));
        if !known {
            return false;
        }

        let meta = self.meta.entry(id).or_default();
        let changed = match kind {
            ReceiptKind::Delivered => !meta.delivered_by_peer,
            ReceiptKind::Read => !meta.delivered_by_peer || !meta.read_by_peer,
        };
        meta.delivered_by_peer = true;
        if kind == ReceiptKind::Read {
            meta.read_by_peer = true;
        }
        changed
    }

    /// Record that this client acknowledged the given messages (delivered
    /// and read). Returns whether any meta changed.
    pub fn mark_acknowledged(&mut self, dialog_id: DialogId, ids: &[ServerMessageId]) -> bool {
        let mut changed = false;
        for message_id in ids {
            let id = MessageId::Confirmed(*message_id);
            let known = self
                .timelines
                .get(&dialog_id)
                .is_some_and(|timeline| timeline.iter().any(|entry| entry.id == id));
            if !known {
                continue;
            }
            let meta = self.meta.entry(id).or_default();
            if !meta.delivered_to_me || !meta.read_by_me {
                meta.delivered_to_me = true;
                meta.read_by_me = true;
                changed = true;
            }
        }
        changed
    }

    pub fn timeline(&self, dialog_id: DialogId) -> &[TimelineEntry] {
        self.timelines
            .get(&dialog_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn timeline_snapshot(&self, dialog_id: DialogId) -> Vec<TimelineEntry> {
        self.timeline(dialog_id).to_vec()
    }

    pub fn entry(&self, dialog_id: DialogId, id: MessageId) -> Option<&TimelineEntry> {
        self.timelines
            .get(&dialog_id)?
            .iter()
            .find(|entry| entry.id == id)
    }

    pub fn meta(&self, id: MessageId) -> Option<&MessageMeta> {
        self.meta.get(&id)
    }
}

#[cfg(test)]
#[path = "tests/conversations_tests.rs"]
mod tests;
