//! # Boundary Adapter
//!
//! The narrow façade the UI/IPC collaborator talks to. Everything here
//! delegates to the owning managers; the core never calls back into the
//! collaborator - observation happens exclusively through the event bus.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventBus};
use crate::favorites::{FavoriteEntry, Favorites};
use crate::mesh::{PeerRecord, PeerRegistry, TrustLevel};
use crate::message::{MessageManager, OutboxEntry, OutboxStatus, Priority};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::nostr::{RelayPool, RelayStatus};
use crate::protocol::PeerId;
use crate::session::{SessionManager, SessionState};
use crate::transport::Multiplexer;

/// Handle handed to the UI collaborator.
#[derive(Clone)]
pub struct CoreHandle {
    pub(crate) local_id: PeerId,
    pub(crate) fingerprint: String,
    pub(crate) nickname: String,
    pub(crate) events: EventBus,
    pub(crate) registry: Arc<PeerRegistry>,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) favorites: Arc<Favorites>,
    pub(crate) manager: Arc<MessageManager>,
    pub(crate) mux: Arc<Multiplexer>,
    pub(crate) pool: Arc<RelayPool>,
    pub(crate) metrics: Arc<Metrics>,
}

impl CoreHandle {
    // ── Identity ─────────────────────────────────────────────────────────────

    /// Our fingerprint for out-of-band comparison.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Our short wire id.
    pub fn peer_id(&self) -> PeerId {
        self.local_id
    }

    /// Our nickname.
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    // ── Peers & sessions ─────────────────────────────────────────────────────

    /// Every known peer.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.registry.all()
    }

    /// Session state for a peer.
    pub fn session_state(&self, peer: PeerId) -> SessionState {
        self.sessions.state(peer)
    }

    /// Fingerprint of an established peer.
    pub fn peer_fingerprint(&self, peer: PeerId) -> Option<String> {
        self.sessions.fingerprint_of(peer)
    }

    /// Close a peer's session.
    pub fn close_session(&self, peer: PeerId) {
        self.sessions.close(peer);
    }

    /// Assign a trust level to a peer.
    pub fn set_trust(&self, peer: PeerId, trust: TrustLevel) {
        self.registry.set_trust(peer, trust);
    }

    /// Block a peer: traffic refused, never relayed.
    pub fn block(&self, peer: PeerId) {
        self.registry.set_trust(peer, TrustLevel::Blocked);
    }

    /// Unblock a peer.
    pub fn unblock(&self, peer: PeerId) {
        self.registry.set_trust(peer, TrustLevel::Untrusted);
    }

    // ── Messaging ────────────────────────────────────────────────────────────

    /// Enqueue a message; `None` recipient broadcasts. Returns the id the
    /// status events will reference.
    pub fn send_message(
        &self,
        content: &[u8],
        recipient: Option<PeerId>,
        priority: Option<Priority>,
    ) -> Result<String> {
        self.manager.send(recipient, content, priority)
    }

    /// Send a read receipt for a received message.
    pub async fn mark_read(&self, peer: PeerId, message_id: &str) -> Result<()> {
        self.manager.mark_read(peer, message_id).await
    }

    /// Probe the recipient for a message's delivery status.
    pub async fn request_status(&self, message_id: &str) -> Result<()> {
        self.manager.request_status(message_id).await
    }

    /// Current outbox status of a message.
    pub fn message_status(&self, message_id: &str) -> Result<Option<OutboxStatus>> {
        self.manager.status_of(message_id)
    }

    /// All outbox rows.
    pub fn outbox(&self) -> Result<Vec<OutboxEntry>> {
        self.manager.history()
    }

    // ── Favorites ────────────────────────────────────────────────────────────

    /// Favorite a peer and notify it. Requires the peer to have announced.
    pub async fn add_favorite(&self, peer: PeerId) -> Result<()> {
        let record = self
            .registry
            .get(peer)
            .ok_or_else(|| Error::PeerUnreachable(peer.to_hex()))?;
        self.favorites.add(
            peer,
            &record.nickname,
            record.static_public,
            record.nostr_public,
        )?;
        // Best effort: the notice rides whatever path is open
        if let Err(e) = self.mux.send_favorite_notice(peer, true).await {
            tracing::debug!(peer = %peer, error = %e, "Favorite notice not delivered");
        }
        Ok(())
    }

    /// Unfavorite a peer and notify it.
    pub async fn remove_favorite(&self, peer: PeerId) -> Result<()> {
        self.favorites.remove(peer)?;
        if let Err(e) = self.mux.send_favorite_notice(peer, false).await {
            tracing::debug!(peer = %peer, error = %e, "Unfavorite notice not delivered");
        }
        Ok(())
    }

    /// The favorites map.
    pub fn favorites(&self) -> Vec<FavoriteEntry> {
        self.favorites.all()
    }

    // ── Relays ───────────────────────────────────────────────────────────────

    /// Add a relay by URL and start connecting.
    pub fn add_relay(&self, url: &str) -> Result<()> {
        self.pool.add_relay(url)
    }

    /// Remove a relay.
    pub fn remove_relay(&self, url: &str) -> bool {
        self.pool.remove_relay(url)
    }

    /// Reconnect a relay that gave up or was disconnected.
    pub fn connect_relay(&self, url: &str) -> Result<()> {
        self.pool.connect_relay(url)
    }

    /// Disconnect a relay without forgetting it.
    pub fn disconnect_relay(&self, url: &str) -> bool {
        self.pool.disconnect_relay(url)
    }

    /// Status of every configured relay.
    pub fn relay_statuses(&self) -> Vec<(String, RelayStatus)> {
        self.pool.statuses()
    }

    // ── Observation ──────────────────────────────────────────────────────────

    /// Subscribe to all core events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Packet-path counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
