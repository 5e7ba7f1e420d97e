//! # Message Manager
//!
//! Two storage tiers: a durable outbox (persist-first) and an in-memory
//! priority queue a single worker drains. The worker hands messages to the
//! multiplexer and reacts to the outcome:
//!
//! - success → `Sent`, awaiting `DELIVERY_ACK` / `READ_RECEIPT`
//! - transient failure → retry with exponential backoff and jitter
//! - permanent failure (blocked peer, attempt cap, TTL) → `Failed` /
//!   `Expired`
//!
//! When a peer's session completes, every queued message for it becomes
//! immediately eligible, which drains the offline backlog in FIFO order
//! within priority.

pub mod outbox;

pub use outbox::{Outbox, OutboxEntry, OutboxStatus, Priority};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::events::{AckKind, CoreEvent, EventBus};
use crate::protocol::PeerId;
use crate::time::now_millis;
use crate::transport::Multiplexer;

/// Retry and expiry policy.
#[derive(Debug, Clone)]
pub struct MessageConfig {
    /// First retry delay
    pub base_backoff: Duration,
    /// Retry delay ceiling
    pub max_backoff: Duration,
    /// Attempts before a message is marked Failed
    pub max_attempts: u32,
    /// Outbox TTL for new messages
    pub message_ttl: Duration,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5 * 60),
            max_attempts: 10,
            message_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Queue entry: everything needed to order work without re-reading rows.
#[derive(Debug, Clone)]
struct QueuedMessage {
    message_id: String,
    recipient: Option<PeerId>,
    priority: Priority,
    created_at: u64,
    not_before: u64,
}

/// Durable, prioritized, retrying send queue.
pub struct MessageManager {
    local_id: PeerId,
    outbox: Outbox,
    queue: Mutex<Vec<QueuedMessage>>,
    notify: Notify,
    mux: Arc<Multiplexer>,
    events: EventBus,
    config: MessageConfig,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MessageManager {
    pub fn new(
        local_id: PeerId,
        outbox: Outbox,
        mux: Arc<Multiplexer>,
        events: EventBus,
        config: MessageConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            outbox,
            queue: Mutex::new(Vec::new()),
            notify: Notify::new(),
            mux,
            events,
            config,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Reload unfinished rows and start the worker and event listener.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let recovered = self.outbox.load_active()?;
        if !recovered.is_empty() {
            tracing::info!(count = recovered.len(), "Recovered outbox rows");
            let mut queue = self.queue.lock();
            for entry in recovered {
                queue.push(QueuedMessage {
                    message_id: entry.message_id.clone(),
                    recipient: entry.recipient,
                    priority: entry.priority,
                    created_at: entry.created_at,
                    not_before: entry.next_attempt_at,
                });
            }
        }

        let manager = Arc::clone(self);
        let worker = tokio::spawn(async move {
            manager.worker_loop().await;
        });

        let manager = Arc::clone(self);
        let mut bus = self.events.subscribe();
        let listener = tokio::spawn(async move {
            loop {
                match bus.recv().await {
                    Ok(event) => manager.handle_event(event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Message manager lagged on events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.push(worker);
        tasks.push(listener);
        self.notify.notify_one();
        Ok(())
    }

    /// Stop background work.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Enqueue a message. Persists first, then queues; returns the id.
    ///
    /// Priority is derived: direct messages above broadcast chatter. The
    /// caller can only raise it (e.g. `Urgent` for emergency traffic).
    pub fn send(
        &self,
        recipient: Option<PeerId>,
        content: &[u8],
        priority_override: Option<Priority>,
    ) -> Result<String> {
        let derived = if recipient.is_some() {
            Priority::High
        } else {
            Priority::Normal
        };
        let priority = priority_override.unwrap_or(derived);

        let entry = OutboxEntry::new(
            uuid::Uuid::new_v4().to_string(),
            self.local_id,
            recipient,
            content.to_vec(),
            priority,
            self.config.message_ttl.as_millis() as u64,
        );
        self.outbox.put(&entry)?;

        self.queue.lock().push(QueuedMessage {
            message_id: entry.message_id.clone(),
            recipient,
            priority,
            created_at: entry.created_at,
            not_before: entry.created_at,
        });
        self.notify.notify_one();

        tracing::debug!(id = entry.message_id.as_str(), "Message enqueued");
        self.events.emit(CoreEvent::MessageStatusChanged {
            message_id: entry.message_id.clone(),
            status: OutboxStatus::Pending,
        });
        Ok(entry.message_id)
    }

    /// Send a read receipt for a message we received (fire and forget).
    pub async fn mark_read(&self, peer: PeerId, message_id: &str) -> Result<()> {
        self.mux.send_ack(peer, message_id, AckKind::Read).await
    }

    /// Probe a recipient for the delivery status of a Sent message.
    pub async fn request_status(&self, message_id: &str) -> Result<()> {
        let entry = self
            .outbox
            .get(message_id)?
            .ok_or_else(|| Error::StorageError(format!("unknown message {}", message_id)))?;
        let recipient = entry
            .recipient
            .ok_or_else(|| Error::StorageError("broadcasts have no status".to_string()))?;
        self.mux.send_status_request(recipient, message_id).await
    }

    /// Current status of a message.
    pub fn status_of(&self, message_id: &str) -> Result<Option<OutboxStatus>> {
        Ok(self.outbox.get(message_id)?.map(|entry| entry.status))
    }

    /// All rows, newest last.
    pub fn history(&self) -> Result<Vec<OutboxEntry>> {
        self.outbox.load_all()
    }

    // ========================================================================
    // WORKER
    // ========================================================================

    async fn worker_loop(self: Arc<Self>) {
        loop {
            let (ready, next_wake) = self.pick_ready();
            match ready {
                Some(message) => {
                    self.attempt(message).await;
                }
                None => {
                    let now = now_millis();
                    let sleep_ms = next_wake
                        .map(|at| at.saturating_sub(now))
                        .unwrap_or(60_000)
                        .clamp(10, 60_000);
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                    }
                }
            }
        }
    }

    /// Highest-priority entry whose time has come; FIFO within priority.
    /// Also reports the earliest future wake-up among the rest.
    fn pick_ready(&self) -> (Option<QueuedMessage>, Option<u64>) {
        let now = now_millis();
        let mut queue = self.queue.lock();

        let mut best: Option<usize> = None;
        let mut next_wake: Option<u64> = None;
        for (index, message) in queue.iter().enumerate() {
            if message.not_before > now {
                next_wake = Some(match next_wake {
                    Some(at) => at.min(message.not_before),
                    None => message.not_before,
                });
                continue;
            }
            let better = match best {
                None => true,
                Some(current) => {
                    let current = &queue[current];
                    message.priority > current.priority
                        || (message.priority == current.priority
                            && message.created_at < current.created_at)
                }
            };
            if better {
                best = Some(index);
            }
        }

        (best.map(|index| queue.swap_remove(index)), next_wake)
    }

    async fn attempt(&self, message: QueuedMessage) {
        let entry = match self.outbox.get(&message.message_id) {
            Ok(Some(entry)) => entry,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "Outbox read failed");
                return;
            }
        };
        if !entry.status.is_active() {
            return;
        }

        let now = now_millis();
        if entry.is_expired(now) {
            tracing::info!(id = entry.message_id.as_str(), "Message expired before transmission");
            self.transition(&entry.message_id, OutboxStatus::Expired);
            return;
        }

        match self
            .mux
            .send_chat(&entry.message_id, entry.recipient, &entry.payload)
            .await
        {
            Ok(()) => {
                tracing::debug!(id = entry.message_id.as_str(), "Message sent");
                self.transition(&entry.message_id, OutboxStatus::Sent);
            }
            Err(e) if e.is_recoverable() => {
                self.schedule_retry(entry, &e);
            }
            Err(e) => {
                tracing::warn!(id = entry.message_id.as_str(), error = %e, "Message failed permanently");
                self.transition(&entry.message_id, OutboxStatus::Failed);
            }
        }
    }

    fn schedule_retry(&self, mut entry: OutboxEntry, cause: &Error) {
        entry.attempts += 1;
        if entry.attempts >= self.config.max_attempts {
            tracing::warn!(
                id = entry.message_id.as_str(),
                attempts = entry.attempts,
                "Attempt cap reached"
            );
            self.transition(&entry.message_id, OutboxStatus::Failed);
            return;
        }

        let exp = self
            .config
            .base_backoff
            .as_millis()
            .saturating_mul(1u128 << entry.attempts.min(20))
            .min(self.config.max_backoff.as_millis()) as u64;
        let jitter = rand::thread_rng().gen_range(0..=exp / 2);
        let backoff = exp + jitter;
        entry.next_attempt_at = now_millis() + backoff;

        tracing::debug!(
            id = entry.message_id.as_str(),
            attempts = entry.attempts,
            backoff_ms = backoff,
            cause = %cause,
            "Retry scheduled"
        );
        if let Err(e) = self.outbox.put(&entry) {
            tracing::error!(error = %e, "Failed to persist retry state");
        }

        self.queue.lock().push(QueuedMessage {
            message_id: entry.message_id.clone(),
            recipient: entry.recipient,
            priority: entry.priority,
            created_at: entry.created_at,
            not_before: entry.next_attempt_at,
        });
    }

    fn transition(&self, message_id: &str, status: OutboxStatus) {
        match self.outbox.set_status(message_id, status) {
            Ok(Some(_)) => {
                self.events.emit(CoreEvent::MessageStatusChanged {
                    message_id: message_id.to_string(),
                    status,
                });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(id = message_id, error = %e, "Status transition failed");
            }
        }
    }

    // ========================================================================
    // EVENT REACTIONS
    // ========================================================================

    fn handle_event(&self, event: CoreEvent) {
        match event {
            CoreEvent::AckReceived {
                message_id, kind, ..
            } => {
                let status = match kind {
                    AckKind::Delivered => OutboxStatus::Delivered,
                    AckKind::Read => OutboxStatus::Read,
                };
                // Read receipts supersede delivery acks, never the reverse
                if let Ok(Some(entry)) = self.outbox.get(&message_id) {
                    if entry.status == OutboxStatus::Read && status == OutboxStatus::Delivered {
                        return;
                    }
                    self.transition(&message_id, status);
                    // Acked rows no longer need the queue
                    self.queue
                        .lock()
                        .retain(|message| message.message_id != message_id);
                }
            }
            CoreEvent::SessionEstablished { peer, .. } | CoreEvent::PeerConnected { peer } => {
                // Drain the offline backlog for this peer
                let mut queue = self.queue.lock();
                let now = now_millis();
                let mut woke = 0usize;
                for message in queue.iter_mut() {
                    if message.recipient == Some(peer) && message.not_before > now {
                        message.not_before = now;
                        woke += 1;
                    }
                }
                drop(queue);
                if woke > 0 {
                    tracing::info!(peer = %peer, count = woke, "Draining outbox for reconnected peer");
                }
                self.notify.notify_one();
            }
            _ => {}
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
