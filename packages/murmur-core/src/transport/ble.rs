//! BLE transport.
//!
//! The operating-system adapter is an injected [`BleLink`] capability; the
//! core neither scans nor advertises itself. This module owns the GATT
//! profile constants and the translation between link events and the
//! transport surface the multiplexer consumes.
//!
//! GATT profile: one service with a write characteristic (write,
//! write-without-response) carrying inbound frames and a notify
//! characteristic (notify, indicate) carrying outbound frames to
//! subscribed centrals. Writes with a non-zero offset are rejected.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::protocol::packet::{HEADER_LEN, PEER_ID_LEN, SIGNATURE_LEN};
use crate::protocol::{PeerId, BLE_MTU};
use crate::transport::{Transport, TransportEvent, TransportKind};

/// GATT service UUID.
pub const SERVICE_UUID: &str = "12345678-1234-5678-1234-56789ABCDEF0";

/// Write characteristic UUID (write, write-without-response).
pub const WRITE_CHARACTERISTIC_UUID: &str = "12345678-1234-5678-1234-56789ABCDEF1";

/// Notify characteristic UUID (notify, indicate).
pub const NOTIFY_CHARACTERISTIC_UUID: &str = "12345678-1234-5678-1234-56789ABCDEF2";

/// Largest frame the transport accepts: a full MTU of fragment data plus
/// the packet framing around it.
pub const MAX_LINK_FRAME: usize = BLE_MTU + HEADER_LEN + 2 * PEER_ID_LEN + SIGNATURE_LEN;

/// Events surfaced by the platform BLE adapter.
#[derive(Debug, Clone)]
pub enum BleLinkEvent {
    /// A peer subscribed to the notify characteristic
    Connected(PeerId),
    /// A peer link dropped
    Disconnected(PeerId),
    /// A GATT write arrived
    Data {
        peer: PeerId,
        bytes: Vec<u8>,
        /// GATT write offset; non-zero writes are rejected
        offset: usize,
    },
}

/// The platform adapter capability the collaborator injects.
#[async_trait]
pub trait BleLink: Send + Sync {
    /// Start advertising and scanning.
    async fn start(&self) -> Result<()>;

    /// Stop the adapter.
    async fn stop(&self) -> Result<()>;

    /// Write a frame to a connected peer's notify characteristic.
    async fn write(&self, peer: PeerId, bytes: &[u8]) -> Result<()>;

    /// Drop the link to a peer.
    async fn disconnect(&self, peer: PeerId) -> Result<()>;

    /// Subscribe to adapter events.
    fn subscribe(&self) -> broadcast::Receiver<BleLinkEvent>;
}

/// [`Transport`] implementation over an injected [`BleLink`].
pub struct BleTransport {
    link: Arc<dyn BleLink>,
    events: broadcast::Sender<TransportEvent>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BleTransport {
    /// Wrap a platform link.
    pub fn new(link: Arc<dyn BleLink>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            link,
            events,
            pump: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    async fn start(&self) -> Result<()> {
        self.link.start().await?;

        let mut link_events = self.link.subscribe();
        let events = self.events.clone();
        let pump = tokio::spawn(async move {
            loop {
                match link_events.recv().await {
                    Ok(BleLinkEvent::Connected(peer)) => {
                        let _ = events.send(TransportEvent::PeerConnected(peer));
                    }
                    Ok(BleLinkEvent::Disconnected(peer)) => {
                        let _ = events.send(TransportEvent::PeerDisconnected(peer));
                    }
                    Ok(BleLinkEvent::Data { peer, bytes, offset }) => {
                        if offset != 0 {
                            tracing::warn!(peer = %peer, offset, "Rejecting offset GATT write");
                            continue;
                        }
                        let _ = events.send(TransportEvent::Frame { peer, bytes });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "BLE event pump lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.pump.lock() = Some(pump);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.link.stop().await
    }

    async fn send(&self, peer: PeerId, frame: Vec<u8>) -> Result<()> {
        if frame.len() > MAX_LINK_FRAME {
            return Err(Error::PayloadTooLarge {
                size: frame.len(),
                max: MAX_LINK_FRAME,
            });
        }
        self.link.write(peer, &frame).await
    }

    async fn close(&self, peer: PeerId) -> Result<()> {
        self.link.disconnect(peer).await
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// LOOPBACK LINK (tests)
// ============================================================================

/// In-process link pair standing in for the platform adapter in tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::RwLock;

    pub struct LoopbackLink {
        local: PeerId,
        events: broadcast::Sender<BleLinkEvent>,
        remote: RwLock<Option<(PeerId, broadcast::Sender<BleLinkEvent>)>>,
    }

    impl LoopbackLink {
        /// Two links wired back to back.
        pub fn pair(a_id: PeerId, b_id: PeerId) -> (Arc<LoopbackLink>, Arc<LoopbackLink>) {
            let (a_events, _) = broadcast::channel(256);
            let (b_events, _) = broadcast::channel(256);
            let a = Arc::new(LoopbackLink {
                local: a_id,
                events: a_events.clone(),
                remote: RwLock::new(Some((b_id, b_events.clone()))),
            });
            let b = Arc::new(LoopbackLink {
                local: b_id,
                events: b_events,
                remote: RwLock::new(Some((a_id, a_events))),
            });
            (a, b)
        }

        /// Announce the link as up on both sides.
        pub fn establish(a: &LoopbackLink, b: &LoopbackLink) {
            let a_remote = a.remote.read().as_ref().map(|(id, _)| *id).unwrap();
            let b_remote = b.remote.read().as_ref().map(|(id, _)| *id).unwrap();
            let _ = a.events.send(BleLinkEvent::Connected(a_remote));
            let _ = b.events.send(BleLinkEvent::Connected(b_remote));
        }

        /// Simulate the remote side going away.
        pub fn drop_remote(&self) {
            if let Some((peer, _)) = self.remote.write().take() {
                let _ = self.events.send(BleLinkEvent::Disconnected(peer));
            }
        }
    }

    #[async_trait]
    impl BleLink for LoopbackLink {
        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }

        async fn write(&self, peer: PeerId, bytes: &[u8]) -> Result<()> {
            let remote = self.remote.read();
            match remote.as_ref() {
                Some((remote_id, remote_events)) if *remote_id == peer => {
                    let _ = remote_events.send(BleLinkEvent::Data {
                        peer: self.local,
                        bytes: bytes.to_vec(),
                        offset: 0,
                    });
                    Ok(())
                }
                _ => Err(Error::PeerUnreachable(peer.to_hex())),
            }
        }

        async fn disconnect(&self, _peer: PeerId) -> Result<()> {
            self.drop_remote();
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<BleLinkEvent> {
            self.events.subscribe()
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::testing::LoopbackLink;
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_the_pair() {
        let a_id = PeerId::new([1; 8]);
        let b_id = PeerId::new([2; 8]);
        let (a_link, b_link) = LoopbackLink::pair(a_id, b_id);

        let a = BleTransport::new(a_link);
        let b = BleTransport::new(b_link);
        a.start().await.unwrap();
        b.start().await.unwrap();

        let mut b_events = b.subscribe();
        a.send(b_id, vec![1, 2, 3]).await.unwrap();

        match b_events.recv().await.unwrap() {
            TransportEvent::Frame { peer, bytes } => {
                assert_eq!(peer, a_id);
                assert_eq!(bytes, vec![1, 2, 3]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (a_link, _b_link) = LoopbackLink::pair(PeerId::new([1; 8]), PeerId::new([2; 8]));
        let a = BleTransport::new(a_link);
        let result = a.send(PeerId::new([2; 8]), vec![0u8; MAX_LINK_FRAME + 1]).await;
        assert!(matches!(result, Err(Error::PayloadTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_connect_disconnect_events() {
        let a_id = PeerId::new([1; 8]);
        let b_id = PeerId::new([2; 8]);
        let (a_link, b_link) = LoopbackLink::pair(a_id, b_id);

        let a = BleTransport::new(Arc::clone(&a_link) as Arc<dyn BleLink>);
        a.start().await.unwrap();
        let mut a_events = a.subscribe();

        LoopbackLink::establish(&a_link, &b_link);
        match a_events.recv().await.unwrap() {
            TransportEvent::PeerConnected(peer) => assert_eq!(peer, b_id),
            other => panic!("unexpected {:?}", other),
        }

        a_link.drop_remote();
        match a_events.recv().await.unwrap() {
            TransportEvent::PeerDisconnected(peer) => assert_eq!(peer, b_id),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_gatt_uuids() {
        assert!(SERVICE_UUID.ends_with("ABCDEF0"));
        assert!(WRITE_CHARACTERISTIC_UUID.ends_with("ABCDEF1"));
        assert!(NOTIFY_CHARACTERISTIC_UUID.ends_with("ABCDEF2"));
    }
}
