//! # Core Events
//!
//! Typed events emitted by the core for the boundary collaborator. The
//! core never calls into the UI; everything observable flows through one
//! broadcast channel that any number of consumers may subscribe to.

use tokio::sync::broadcast;

use crate::crypto::Role;
use crate::message::outbox::OutboxStatus;
use crate::nostr::pool::RelayStatus;
use crate::protocol::{MessageType, PeerId};
use crate::transport::TransportKind;

/// What kind of acknowledgement a peer sent for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// `DELIVERY_ACK`: the message reached the peer's device
    Delivered,
    /// `READ_RECEIPT`: the peer read the message
    Read,
}

/// Why a pending handshake was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailureReason {
    /// The 30-second deadline passed
    Timeout,
    /// An AEAD or DH operation failed
    Crypto,
    /// A message arrived out of turn
    Protocol,
}

/// Events emitted by the core.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// Handshake bytes that must be transmitted to a peer
    HandshakeMessage {
        /// Destination peer
        peer: PeerId,
        /// Wire type the bytes should be carried under
        kind: MessageType,
        /// Raw handshake message
        bytes: Vec<u8>,
    },

    /// A Noise session reached the Completed state
    SessionEstablished {
        /// The authenticated peer
        peer: PeerId,
        /// Fingerprint of the peer's static key
        fingerprint: String,
        /// Which side we played
        role: Role,
    },

    /// A session was closed (idle expiry, failure, or request)
    SessionClosed {
        /// The peer whose session ended
        peer: PeerId,
    },

    /// A pending handshake was abandoned
    HandshakeFailed {
        /// The peer the handshake was with
        peer: PeerId,
        /// Why it failed
        reason: HandshakeFailureReason,
    },

    /// A peer became reachable on BLE
    PeerConnected {
        /// The peer
        peer: PeerId,
    },

    /// A peer stopped being reachable on BLE
    PeerDisconnected {
        /// The peer
        peer: PeerId,
    },

    /// An application message was received and decrypted
    MessageReceived {
        /// Originating peer
        peer: PeerId,
        /// Sender-assigned message id
        message_id: String,
        /// Decrypted content bytes
        content: Vec<u8>,
        /// Whether this was addressed to us or broadcast
        broadcast: bool,
    },

    /// A peer acknowledged one of our messages
    AckReceived {
        /// The acknowledging peer
        peer: PeerId,
        /// The message being acknowledged
        message_id: String,
        /// Delivery or read
        kind: AckKind,
    },

    /// An outbox entry changed status
    MessageStatusChanged {
        /// The message id
        message_id: String,
        /// The new status
        status: OutboxStatus,
    },

    /// A transport became available or unavailable
    TransportStatus {
        /// Which transport
        kind: TransportKind,
        /// Whether it can currently carry traffic
        available: bool,
    },

    /// A relay connection changed state
    RelayStatusChanged {
        /// Relay WebSocket URL
        url: String,
        /// New status
        status: RelayStatus,
    },

    /// A peer favorited or unfavorited us
    FavoriteChanged {
        /// The peer
        peer: PeerId,
        /// Whether they now favorite us
        favorited_us: bool,
    },
}

impl CoreEvent {
    /// The peer this event concerns, if any.
    pub fn peer(&self) -> Option<PeerId> {
        match self {
            Self::HandshakeMessage { peer, .. }
            | Self::SessionEstablished { peer, .. }
            | Self::SessionClosed { peer }
            | Self::HandshakeFailed { peer, .. }
            | Self::PeerConnected { peer }
            | Self::PeerDisconnected { peer }
            | Self::MessageReceived { peer, .. }
            | Self::AckReceived { peer, .. }
            | Self::FavoriteChanged { peer, .. } => Some(*peer),
            _ => None,
        }
    }
}

/// Broadcast bus the core publishes on.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Create a bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Events with no subscribers are dropped silently.
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let peer = PeerId::new([1; 8]);
        bus.emit(CoreEvent::PeerConnected { peer });

        match rx.try_recv().unwrap() {
            CoreEvent::PeerConnected { peer: got } => assert_eq!(got, peer),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.emit(CoreEvent::SessionClosed {
            peer: PeerId::new([2; 8]),
        });
    }

    #[test]
    fn test_peer_accessor() {
        let peer = PeerId::new([3; 8]);
        let event = CoreEvent::SessionClosed { peer };
        assert_eq!(event.peer(), Some(peer));

        let event = CoreEvent::TransportStatus {
            kind: TransportKind::Ble,
            available: true,
        };
        assert_eq!(event.peer(), None);
    }
}
