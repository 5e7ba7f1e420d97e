//! Durable outbox rows.
//!
//! Every outbound message is persisted before it is enqueued, and every
//! status transition is one `put` against the key-value contract. After a
//! crash, rows that never reached a terminal state re-enter the queue.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::PeerId;
use crate::storage::{KeyValueStore, OUTBOX_PREFIX};
use crate::time::now_millis;

/// Send priority, highest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

/// Lifecycle of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    /// Waiting for a send attempt
    Pending,
    /// Handed to a transport, awaiting acknowledgement
    Sent,
    /// `DELIVERY_ACK` received
    Delivered,
    /// `READ_RECEIPT` received
    Read,
    /// Permanent failure (blocked peer, attempt cap)
    Failed,
    /// TTL passed before transmission
    Expired,
}

impl OutboxStatus {
    /// Storage string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    /// Whether a restart should put the row back in the queue.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Delivered | Self::Read | Self::Expired)
    }
}

/// One persisted outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub message_id: String,
    pub sender: PeerId,
    /// `None` is a broadcast
    pub recipient: Option<PeerId>,
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub status: OutboxStatus,
    pub attempts: u32,
    /// Unix millis before which no attempt is made
    pub next_attempt_at: u64,
    /// Unix millis after which the message is never transmitted
    pub expires_at: u64,
    pub created_at: u64,
}

impl OutboxEntry {
    /// Fresh Pending row.
    pub fn new(
        message_id: String,
        sender: PeerId,
        recipient: Option<PeerId>,
        payload: Vec<u8>,
        priority: Priority,
        ttl_ms: u64,
    ) -> Self {
        let now = now_millis();
        Self {
            message_id,
            sender,
            recipient,
            payload,
            priority,
            status: OutboxStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            expires_at: now + ttl_ms,
            created_at: now,
        }
    }

    /// Whether the TTL has passed.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// The persistent tier of the message manager.
pub struct Outbox {
    store: Arc<dyn KeyValueStore>,
}

impl Outbox {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key_for(message_id: &str) -> String {
        format!("{}{}", OUTBOX_PREFIX, message_id)
    }

    /// Persist a row (insert or full update).
    pub fn put(&self, entry: &OutboxEntry) -> Result<()> {
        self.store
            .put(&Self::key_for(&entry.message_id), &bincode::serialize(entry)?)
    }

    /// Load one row.
    pub fn get(&self, message_id: &str) -> Result<Option<OutboxEntry>> {
        match self.store.get(&Self::key_for(message_id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Transition a row's status. Returns the updated row, or `None` when
    /// it does not exist.
    pub fn set_status(&self, message_id: &str, status: OutboxStatus) -> Result<Option<OutboxEntry>> {
        match self.get(message_id)? {
            Some(mut entry) => {
                entry.status = status;
                self.put(&entry)?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Remove a row.
    pub fn delete(&self, message_id: &str) -> Result<()> {
        self.store.delete(&Self::key_for(message_id))
    }

    /// All rows that should be in the queue after a restart.
    pub fn load_active(&self) -> Result<Vec<OutboxEntry>> {
        let mut entries = Vec::new();
        for (key, bytes) in self.store.scan_prefix(OUTBOX_PREFIX)? {
            match bincode::deserialize::<OutboxEntry>(&bytes) {
                Ok(entry) if entry.status.is_active() => entries.push(entry),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(key = key.as_str(), error = %e, "Skipping corrupt outbox row");
                }
            }
        }
        entries.sort_by_key(|entry| entry.created_at);
        Ok(entries)
    }

    /// All rows, any status.
    pub fn load_all(&self) -> Result<Vec<OutboxEntry>> {
        let mut entries = Vec::new();
        for (_, bytes) in self.store.scan_prefix(OUTBOX_PREFIX)? {
            if let Ok(entry) = bincode::deserialize::<OutboxEntry>(&bytes) {
                entries.push(entry);
            }
        }
        entries.sort_by_key(|entry| entry.created_at);
        Ok(entries)
    }
}

// ============================================================================
// TESTS
// ============================================================================
