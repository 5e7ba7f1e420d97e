//! # Transports
//!
//! The capability surface every transport exposes, plus the concrete BLE
//! implementation and the multiplexer that routes between BLE and Nostr.
//!
//! Transports move opaque frames; all protocol knowledge (codec, router,
//! sessions) lives in the [`multiplexer`].

pub mod ble;
pub mod multiplexer;

pub use ble::{BleLink, BleLinkEvent, BleTransport};
pub use multiplexer::{ChatPayload, Multiplexer, MultiplexerConfig};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::protocol::PeerId;

/// Which transport a frame travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Ble,
    Nostr,
}

/// Traffic and link-state notifications from a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peer link came up
    PeerConnected(PeerId),
    /// A peer link went down
    PeerDisconnected(PeerId),
    /// An inbound frame
    Frame {
        /// The immediate neighbor the frame arrived from
        peer: PeerId,
        /// Raw frame bytes
        bytes: Vec<u8>,
    },
}

/// The capability set shared by all transports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which transport this is.
    fn kind(&self) -> TransportKind;

    /// Bring the transport up.
    async fn start(&self) -> Result<()>;

    /// Tear the transport down.
    async fn stop(&self) -> Result<()>;

    /// Send one frame to a directly reachable peer.
    async fn send(&self, peer: PeerId, frame: Vec<u8>) -> Result<()>;

    /// Close the link to one peer.
    async fn close(&self, peer: PeerId) -> Result<()>;

    /// Subscribe to traffic and link-state events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
