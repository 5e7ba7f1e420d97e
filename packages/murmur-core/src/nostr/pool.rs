//! Nostr relay pool.
//!
//! One persistent WebSocket connection per relay, each running in its own
//! background task with exponential backoff and jitter on reconnect.
//! Subscriptions are replayed after every reconnect; publishes fan out to
//! all connected relays and count as accepted once any relay sends a
//! positive `OK`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventBus};
use crate::nostr::event::NostrEvent;

/// How long a publish waits for the first relay acknowledgement.
pub const PUBLISH_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection state of one relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Connecting,
    Connected,
    Disconnected,
    /// Gave up after the reconnect attempt cap
    Error,
}

/// Reconnect policy.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// First reconnect delay
    pub initial_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Consecutive failed attempts before giving up
    pub max_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_attempts: 12,
        }
    }
}

/// Traffic the pool hands to the multiplexer.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// An event matched one of our subscriptions
    InboundEvent {
        relay: String,
        sub_id: String,
        event: NostrEvent,
    },
    /// End of stored events for a subscription
    Eose { relay: String, sub_id: String },
}

// ============================================================================
// WIRE FRAMES
// ============================================================================

/// `["EVENT", ev]`
pub fn event_frame(event: &NostrEvent) -> Result<String> {
    Ok(serde_json::json!(["EVENT", event]).to_string())
}

/// `["REQ", sub_id, filter...]`
pub fn req_frame(sub_id: &str, filters: &[serde_json::Value]) -> String {
    let mut frame = vec![
        serde_json::json!("REQ"),
        serde_json::json!(sub_id),
    ];
    frame.extend(filters.iter().cloned());
    serde_json::Value::Array(frame).to_string()
}

/// `["CLOSE", sub_id]`
pub fn close_frame(sub_id: &str) -> String {
    serde_json::json!(["CLOSE", sub_id]).to_string()
}

/// A parsed server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    /// `["EVENT", sub_id, ev]`
    Event { sub_id: String, event: NostrEvent },
    /// `["EOSE", sub_id]`
    Eose { sub_id: String },
    /// `["OK", event_id, accepted, message]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// `["NOTICE", message]`
    Notice { message: String },
}

/// Parse a server frame; unknown shapes yield `None`.
pub fn parse_relay_frame(text: &str) -> Option<RelayFrame> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let array = value.as_array()?;
    match array.first()?.as_str()? {
        "EVENT" => Some(RelayFrame::Event {
            sub_id: array.get(1)?.as_str()?.to_string(),
            event: serde_json::from_value(array.get(2)?.clone()).ok()?,
        }),
        "EOSE" => Some(RelayFrame::Eose {
            sub_id: array.get(1)?.as_str()?.to_string(),
        }),
        "OK" => Some(RelayFrame::Ok {
            event_id: array.get(1)?.as_str()?.to_string(),
            accepted: array.get(2)?.as_bool()?,
            message: array
                .get(3)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        }),
        "NOTICE" => Some(RelayFrame::Notice {
            message: array.get(1)?.as_str().unwrap_or_default().to_string(),
        }),
        _ => None,
    }
}

// ============================================================================
// RELAY HANDLE
// ============================================================================

struct RelayHandle {
    url: String,
    sender: RwLock<Option<mpsc::UnboundedSender<String>>>,
    status: RwLock<RelayStatus>,
    /// Subscription ids currently outstanding on this relay
    subscriptions: Mutex<HashSet<String>>,
    attempts: AtomicU32,
    closed: AtomicBool,
}

impl RelayHandle {
    fn new(url: String) -> Self {
        Self {
            url,
            sender: RwLock::new(None),
            status: RwLock::new(RelayStatus::Connecting),
            subscriptions: Mutex::new(HashSet::new()),
            attempts: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn status(&self) -> RelayStatus {
        *self.status.read()
    }

    fn send(&self, frame: String) -> bool {
        match self.sender.read().as_ref() {
            Some(sender) => sender.send(frame).is_ok(),
            None => false,
        }
    }
}

// ============================================================================
// POOL
// ============================================================================

/// Manages the configured relay set.
pub struct RelayPool {
    relays: DashMap<String, Arc<RelayHandle>>,
    /// Active filters by subscription id, replayed on reconnect
    filters: DashMap<String, serde_json::Value>,
    /// Publishes awaiting their first OK
    pending_acks: DashMap<String, oneshot::Sender<bool>>,
    inbound: mpsc::UnboundedSender<PoolEvent>,
    events: EventBus,
    config: PoolConfig,
}

impl RelayPool {
    /// Create a pool that forwards inbound traffic to `inbound`.
    pub fn new(
        config: PoolConfig,
        inbound: mpsc::UnboundedSender<PoolEvent>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            relays: DashMap::new(),
            filters: DashMap::new(),
            pending_acks: DashMap::new(),
            inbound,
            events,
            config,
        })
    }

    /// Add a relay and start its connection task.
    pub fn add_relay(self: &Arc<Self>, url: &str) -> Result<()> {
        if self.relays.contains_key(url) {
            return Err(Error::RelayError(format!("relay already added: {}", url)));
        }
        let handle = Arc::new(RelayHandle::new(url.to_string()));
        self.relays.insert(url.to_string(), Arc::clone(&handle));

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.connection_loop(handle).await;
        });
        Ok(())
    }

    /// Remove a relay, tearing down its connection.
    pub fn remove_relay(&self, url: &str) -> bool {
        if let Some((_, handle)) = self.relays.remove(url) {
            handle.closed.store(true, Ordering::SeqCst);
            *handle.sender.write() = None;
            true
        } else {
            false
        }
    }

    /// Restart a relay that previously gave up or was disconnected.
    pub fn connect_relay(self: &Arc<Self>, url: &str) -> Result<()> {
        if let Some(handle) = self.relays.get(url).map(|h| Arc::clone(h.value())) {
            if handle.status() == RelayStatus::Error || handle.closed.load(Ordering::SeqCst) {
                handle.closed.store(false, Ordering::SeqCst);
                handle.attempts.store(0, Ordering::SeqCst);
                let pool = Arc::clone(self);
                tokio::spawn(async move {
                    pool.connection_loop(handle).await;
                });
            }
            Ok(())
        } else {
            self.add_relay(url)
        }
    }

    /// Stop a relay's connection without forgetting it.
    pub fn disconnect_relay(&self, url: &str) -> bool {
        if let Some(handle) = self.relays.get(url) {
            handle.closed.store(true, Ordering::SeqCst);
            *handle.sender.write() = None;
            true
        } else {
            false
        }
    }

    /// Publish to all connected relays; resolves once any relay accepts.
    pub async fn publish(&self, event: &NostrEvent) -> Result<()> {
        let frame = event_frame(event)?;
        let (tx, rx) = oneshot::channel();
        self.pending_acks.insert(event.id.clone(), tx);

        let mut sent = 0usize;
        for entry in self.relays.iter() {
            if entry.status() == RelayStatus::Connected && entry.send(frame.clone()) {
                sent += 1;
            }
        }
        if sent == 0 {
            self.pending_acks.remove(&event.id);
            return Err(Error::RelayError("no connected relays".to_string()));
        }
        tracing::debug!(event_id = %event.id, relays = sent, "Published event");

        match tokio::time::timeout(PUBLISH_ACK_TIMEOUT, rx).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(Error::RelayError("event rejected by relay".to_string())),
            _ => {
                self.pending_acks.remove(&event.id);
                Err(Error::RelayError("publish not acknowledged".to_string()))
            }
        }
    }

    /// Open a subscription on every connected relay.
    pub fn subscribe(&self, sub_id: &str, filter: serde_json::Value) {
        let frame = req_frame(sub_id, std::slice::from_ref(&filter));
        self.filters.insert(sub_id.to_string(), filter);
        for entry in self.relays.iter() {
            if entry.status() == RelayStatus::Connected && entry.send(frame.clone()) {
                entry.subscriptions.lock().insert(sub_id.to_string());
            }
        }
    }

    /// Close a subscription everywhere.
    pub fn unsubscribe(&self, sub_id: &str) {
        self.filters.remove(sub_id);
        let frame = close_frame(sub_id);
        for entry in self.relays.iter() {
            if entry.subscriptions.lock().remove(sub_id) {
                entry.send(frame.clone());
            }
        }
    }

    /// Status of every configured relay.
    pub fn statuses(&self) -> Vec<(String, RelayStatus)> {
        self.relays
            .iter()
            .map(|entry| (entry.url.clone(), entry.status()))
            .collect()
    }

    /// Number of relays currently connected.
    pub fn connected_count(&self) -> usize {
        self.relays
            .iter()
            .filter(|entry| entry.status() == RelayStatus::Connected)
            .count()
    }

    /// Outstanding subscription ids on one relay.
    pub fn subscriptions_on(&self, url: &str) -> Vec<String> {
        self.relays
            .get(url)
            .map(|handle| handle.subscriptions.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    fn set_status(&self, handle: &RelayHandle, status: RelayStatus) {
        *handle.status.write() = status;
        self.events.emit(CoreEvent::RelayStatusChanged {
            url: handle.url.clone(),
            status,
        });
        // Nostr is "available" while any relay is connected
        self.events.emit(CoreEvent::TransportStatus {
            kind: crate::transport::TransportKind::Nostr,
            available: self.connected_count() > 0,
        });
    }

    // ── Connection task ──────────────────────────────────────────────────────

    /// Persistent connection loop for one relay, reconnecting with
    /// exponential backoff plus jitter until the attempt cap.
    async fn connection_loop(self: Arc<Self>, handle: Arc<RelayHandle>) {
        let mut backoff = self.config.initial_backoff;

        loop {
            if handle.closed.load(Ordering::SeqCst) {
                self.set_status(&handle, RelayStatus::Disconnected);
                return;
            }

            self.set_status(&handle, RelayStatus::Connecting);
            tracing::info!(relay = handle.url.as_str(), "Connecting to relay...");

            match self.run_connection(&handle).await {
                Ok(()) => {
                    tracing::info!(relay = handle.url.as_str(), "Relay connection closed");
                    handle.attempts.store(0, Ordering::SeqCst);
                    backoff = self.config.initial_backoff;
                }
                Err(e) => {
                    let attempts = handle.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::warn!(
                        relay = handle.url.as_str(),
                        error = %e,
                        attempts,
                        "Relay connection failed"
                    );
                    if attempts >= self.config.max_attempts {
                        tracing::error!(
                            relay = handle.url.as_str(),
                            "Giving up on relay after attempt cap"
                        );
                        self.set_status(&handle, RelayStatus::Error);
                        return;
                    }
                }
            }

            self.set_status(&handle, RelayStatus::Disconnected);
            if handle.closed.load(Ordering::SeqCst) {
                return;
            }

            let jitter = Duration::from_millis(
                rand::thread_rng().gen_range(0..=backoff.as_millis().max(1) as u64 / 2),
            );
            tokio::time::sleep(backoff + jitter).await;
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    /// One connection: send loop + receive loop until either side closes.
    async fn run_connection(
        &self,
        handle: &Arc<RelayHandle>,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (ws_stream, _) = connect_async(&handle.url).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *handle.sender.write() = Some(tx);
        self.set_status(handle, RelayStatus::Connected);

        // Replay active subscriptions
        {
            let mut subs = handle.subscriptions.lock();
            subs.clear();
            for entry in self.filters.iter() {
                let frame = req_frame(entry.key(), std::slice::from_ref(entry.value()));
                if let Some(sender) = handle.sender.read().as_ref() {
                    if sender.send(frame).is_ok() {
                        subs.insert(entry.key().clone());
                    }
                }
            }
        }

        let sender_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if ws_sender.send(WsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(WsMessage::Text(text)) => self.handle_frame(handle, &text),
                Ok(WsMessage::Ping(_)) => {
                    // tungstenite answers pings automatically
                }
                Ok(WsMessage::Close(_)) => {
                    tracing::debug!(relay = handle.url.as_str(), "Relay sent close frame");
                    break;
                }
                Err(e) => {
                    tracing::warn!(relay = handle.url.as_str(), error = %e, "Relay socket error");
                    break;
                }
                _ => {}
            }
            if handle.closed.load(Ordering::SeqCst) {
                break;
            }
        }

        *handle.sender.write() = None;
        sender_task.abort();
        Ok(())
    }

    fn handle_frame(&self, handle: &Arc<RelayHandle>, text: &str) {
        match parse_relay_frame(text) {
            Some(RelayFrame::Event { sub_id, event }) => {
                let _ = self.inbound.send(PoolEvent::InboundEvent {
                    relay: handle.url.clone(),
                    sub_id,
                    event,
                });
            }
            Some(RelayFrame::Eose { sub_id }) => {
                let _ = self.inbound.send(PoolEvent::Eose {
                    relay: handle.url.clone(),
                    sub_id,
                });
            }
            Some(RelayFrame::Ok {
                event_id,
                accepted,
                message,
            }) => {
                if !accepted {
                    tracing::warn!(
                        relay = handle.url.as_str(),
                        event_id = event_id.as_str(),
                        message = message.as_str(),
                        "Relay rejected event"
                    );
                }
                if let Some((_, waiter)) = self.pending_acks.remove(&event_id) {
                    let _ = waiter.send(accepted);
                }
            }
            Some(RelayFrame::Notice { message }) => {
                tracing::info!(relay = handle.url.as_str(), message = message.as_str(), "Relay notice");
            }
            None => {
                tracing::debug!(relay = handle.url.as_str(), "Unparseable relay frame");
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningKeyPair;

    fn sample_event() -> NostrEvent {
        NostrEvent::build(
            &SigningKeyPair::generate(),
            1,
            vec![],
            "hello".to_string(),
            1_733_251_200,
        )
        .unwrap()
    }

    #[test]
    fn test_client_frames() {
        let event = sample_event();
        let frame = event_frame(&event).unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value[0], "EVENT");
        assert_eq!(value[1]["id"], serde_json::json!(event.id));

        let req = req_frame("sub-1", &[serde_json::json!({"kinds": [1059]})]);
        let value: serde_json::Value = serde_json::from_str(&req).unwrap();
        assert_eq!(value[0], "REQ");
        assert_eq!(value[1], "sub-1");
        assert_eq!(value[2]["kinds"][0], 1059);

        let close = close_frame("sub-1");
        assert_eq!(close, r#"["CLOSE","sub-1"]"#);
    }

    #[test]
    fn test_parse_server_frames() {
        let event = sample_event();
        let text = serde_json::json!(["EVENT", "sub-1", event]).to_string();
        match parse_relay_frame(&text).unwrap() {
            RelayFrame::Event { sub_id, event: got } => {
                assert_eq!(sub_id, "sub-1");
                assert_eq!(got, event);
            }
            other => panic!("unexpected frame {:?}", other),
        }

        assert_eq!(
            parse_relay_frame(r#"["EOSE","sub-1"]"#).unwrap(),
            RelayFrame::Eose {
                sub_id: "sub-1".to_string()
            }
        );

        assert_eq!(
            parse_relay_frame(r#"["OK","abcd",true,""]"#).unwrap(),
            RelayFrame::Ok {
                event_id: "abcd".to_string(),
                accepted: true,
                message: String::new()
            }
        );

        assert!(parse_relay_frame("not json").is_none());
        assert!(parse_relay_frame(r#"["AUTH","challenge"]"#).is_none());
    }

    #[tokio::test]
    async fn test_publish_without_relays_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = RelayPool::new(PoolConfig::default(), tx, EventBus::new(16));
        let result = pool.publish(&sample_event()).await;
        assert!(matches!(result, Err(Error::RelayError(_))));
        assert!(pool.pending_acks.is_empty());
    }

    #[tokio::test]
    async fn test_relay_bookkeeping() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = RelayPool::new(PoolConfig::default(), tx, EventBus::new(16));

        pool.add_relay("wss://relay.example/one").unwrap();
        assert!(pool.add_relay("wss://relay.example/one").is_err());
        assert_eq!(pool.statuses().len(), 1);
        assert_eq!(pool.connected_count(), 0);

        assert!(pool.remove_relay("wss://relay.example/one"));
        assert!(!pool.remove_relay("wss://relay.example/one"));
        assert!(pool.statuses().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_accounting() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = RelayPool::new(PoolConfig::default(), tx, EventBus::new(16));

        pool.subscribe("inbox", serde_json::json!({"kinds": [1059]}));
        assert!(pool.filters.contains_key("inbox"));
        pool.unsubscribe("inbox");
        assert!(!pool.filters.contains_key("inbox"));
    }

    #[test]
    fn test_ok_frame_resolves_pending_publish() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = RelayPool::new(PoolConfig::default(), tx, EventBus::new(16));
        let handle = Arc::new(RelayHandle::new("wss://relay.example".to_string()));

        let (ack_tx, mut ack_rx) = oneshot::channel();
        pool.pending_acks.insert("abcd".to_string(), ack_tx);
        pool.handle_frame(&handle, r#"["OK","abcd",true,""]"#);

        assert_eq!(ack_rx.try_recv().unwrap(), true);
        assert!(pool.pending_acks.is_empty());
    }

    #[test]
    fn test_inbound_event_forwarded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = RelayPool::new(PoolConfig::default(), tx, EventBus::new(16));
        let handle = Arc::new(RelayHandle::new("wss://relay.example".to_string()));

        let event = sample_event();
        let text = serde_json::json!(["EVENT", "inbox", event]).to_string();
        pool.handle_frame(&handle, &text);

        match rx.try_recv().unwrap() {
            PoolEvent::InboundEvent { sub_id, event: got, .. } => {
                assert_eq!(sub_id, "inbox");
                assert_eq!(got, event);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
