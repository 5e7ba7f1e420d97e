//! Peer registry.
//!
//! Tracks every peer seen on the mesh: identity announcement contents,
//! last-seen time, trust level, and which transports it is reachable on.
//! The registry is capped; when full, the least-recently-seen peer is
//! evicted to make room.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::crypto::{fingerprint, NostrPublicKey};
use crate::error::{Error, Result};
use crate::protocol::PeerId;
use crate::time::now_millis;

/// Default registry capacity.
pub const DEFAULT_PEER_CAP: usize = 100;

/// How long a silent peer stays in the registry (10 minutes).
pub const PEER_IDLE_TIMEOUT_MS: u64 = 10 * 60 * 1000;

/// Trust state assigned by the user through the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustLevel {
    /// Default for newly seen peers
    Untrusted,
    /// Fingerprint compared out of band
    Verified,
    /// Explicitly trusted
    Trusted,
    /// Traffic refused and never relayed
    Blocked,
}

/// Which transports a peer has been seen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTransport {
    Ble,
    Nostr,
    Both,
}

impl PeerTransport {
    fn merged_with(self, other: PeerTransport) -> PeerTransport {
        if self == other {
            self
        } else {
            PeerTransport::Both
        }
    }
}

/// Everything known about a peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Short wire id
    pub peer_id: PeerId,
    /// Announced nickname
    pub nickname: String,
    /// Noise static public key from the announcement
    pub static_public: [u8; 32],
    /// Ed25519 signing key from the announcement
    pub signing_public: [u8; 32],
    /// Fingerprint of the static key
    pub fingerprint: String,
    /// Announced Nostr public keys, if present
    pub nostr_public: Option<NostrPublicKey>,
    /// User-assigned trust
    pub trust: TrustLevel,
    /// Transports the peer was seen on
    pub transport: PeerTransport,
    /// Unix millis of the last packet from this peer
    pub last_seen: u64,
    /// Whether a BLE link to the peer is currently up
    pub connected: bool,
}

// ============================================================================
// ANNOUNCE PAYLOAD
// ============================================================================

/// Body of an `ANNOUNCE` packet.
///
/// Fixed layout: static key (32) | signing key (32) | Nostr signing key
/// (32) | Nostr encryption key (32) | nickname (UTF-8, rest). The packet
/// carrying it is signed by the signing key, which binds nickname and
/// derived keys to the announced identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncePayload {
    pub static_public: [u8; 32],
    pub signing_public: [u8; 32],
    pub nostr_public: NostrPublicKey,
    pub nickname: String,
}

impl AnnouncePayload {
    const FIXED_LEN: usize = 128;

    /// Encode to the wire layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::FIXED_LEN + self.nickname.len());
        out.extend_from_slice(&self.static_public);
        out.extend_from_slice(&self.signing_public);
        out.extend_from_slice(&self.nostr_public.signing);
        out.extend_from_slice(&self.nostr_public.encryption);
        out.extend_from_slice(self.nickname.as_bytes());
        out
    }

    /// Decode from the wire layout.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::FIXED_LEN {
            return Err(Error::InvalidPacket(format!(
                "announce payload too short: {} bytes",
                bytes.len()
            )));
        }
        let nickname = String::from_utf8(bytes[Self::FIXED_LEN..].to_vec())
            .map_err(|_| Error::InvalidPacket("announce nickname is not UTF-8".to_string()))?;
        Ok(Self {
            static_public: bytes[..32].try_into().expect("32 bytes"),
            signing_public: bytes[32..64].try_into().expect("32 bytes"),
            nostr_public: NostrPublicKey {
                signing: bytes[64..96].try_into().expect("32 bytes"),
                encryption: bytes[96..128].try_into().expect("32 bytes"),
            },
            nickname,
        })
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Capped registry of known peers.
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
    capacity: usize,
}

impl PeerRegistry {
    /// Create a registry with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Insert or refresh a peer from its announcement.
    ///
    /// Trust and connectivity survive re-announcements; when the registry
    /// is full the least-recently-seen peer is evicted first.
    pub fn announce(
        &self,
        peer_id: PeerId,
        announce: &AnnouncePayload,
        transport: PeerTransport,
    ) {
        let mut peers = self.peers.write();
        let now = now_millis();

        if let Some(existing) = peers.get_mut(&peer_id) {
            existing.nickname = announce.nickname.clone();
            existing.static_public = announce.static_public;
            existing.signing_public = announce.signing_public;
            existing.fingerprint = fingerprint(&announce.static_public);
            existing.nostr_public = Some(announce.nostr_public);
            existing.transport = existing.transport.merged_with(transport);
            existing.last_seen = now;
            return;
        }

        if peers.len() >= self.capacity {
            if let Some(oldest) = peers
                .iter()
                .filter(|(_, record)| !record.connected)
                .min_by_key(|(_, record)| record.last_seen)
                .map(|(id, _)| *id)
            {
                tracing::debug!(peer = %oldest, "Evicting least-recently-seen peer");
                peers.remove(&oldest);
            }
        }

        peers.insert(
            peer_id,
            PeerRecord {
                peer_id,
                nickname: announce.nickname.clone(),
                static_public: announce.static_public,
                signing_public: announce.signing_public,
                fingerprint: fingerprint(&announce.static_public),
                nostr_public: Some(announce.nostr_public),
                trust: TrustLevel::Untrusted,
                transport,
                last_seen: now,
                connected: false,
            },
        );
    }

    /// Remove a peer that sent `LEAVE`.
    pub fn leave(&self, peer_id: PeerId) -> bool {
        self.peers.write().remove(&peer_id).is_some()
    }

    /// Refresh last-seen from any inbound packet.
    pub fn touch(&self, peer_id: PeerId) {
        if let Some(record) = self.peers.write().get_mut(&peer_id) {
            record.last_seen = now_millis();
        }
    }

    /// Mark the BLE link state of a peer.
    ///
    /// A link can come up before the peer's first announcement; a
    /// placeholder record is created then and filled in by the announce.
    pub fn set_connected(&self, peer_id: PeerId, connected: bool) {
        let mut peers = self.peers.write();
        match peers.get_mut(&peer_id) {
            Some(record) => {
                record.connected = connected;
                if connected {
                    record.last_seen = now_millis();
                }
            }
            None if connected => {
                peers.insert(
                    peer_id,
                    PeerRecord {
                        peer_id,
                        nickname: peer_id.to_hex(),
                        static_public: [0u8; 32],
                        signing_public: [0u8; 32],
                        fingerprint: String::new(),
                        nostr_public: None,
                        trust: TrustLevel::Untrusted,
                        transport: PeerTransport::Ble,
                        last_seen: now_millis(),
                        connected: true,
                    },
                );
            }
            None => {}
        }
    }

    /// Whether a BLE link to the peer is currently up.
    pub fn is_connected(&self, peer_id: PeerId) -> bool {
        self.peers
            .read()
            .get(&peer_id)
            .map(|record| record.connected)
            .unwrap_or(false)
    }

    /// Assign a trust level.
    pub fn set_trust(&self, peer_id: PeerId, trust: TrustLevel) {
        if let Some(record) = self.peers.write().get_mut(&peer_id) {
            record.trust = trust;
        }
    }

    /// Whether the peer is blocked.
    pub fn is_blocked(&self, peer_id: PeerId) -> bool {
        self.peers
            .read()
            .get(&peer_id)
            .map(|record| record.trust == TrustLevel::Blocked)
            .unwrap_or(false)
    }

    /// Look up one peer.
    pub fn get(&self, peer_id: PeerId) -> Option<PeerRecord> {
        self.peers.read().get(&peer_id).cloned()
    }

    /// Snapshot of all peers.
    pub fn all(&self) -> Vec<PeerRecord> {
        self.peers.read().values().cloned().collect()
    }

    /// Peers with an active BLE link.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .values()
            .filter(|record| record.connected)
            .map(|record| record.peer_id)
            .collect()
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether no peers are known.
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Drop disconnected peers idle longer than the timeout.
    /// Returns the removed ids.
    pub fn sweep_idle(&self, idle_timeout_ms: u64) -> Vec<PeerId> {
        let now = now_millis();
        let mut peers = self.peers.write();
        let stale: Vec<PeerId> = peers
            .values()
            .filter(|record| {
                !record.connected && now.saturating_sub(record.last_seen) >= idle_timeout_ms
            })
            .map(|record| record.peer_id)
            .collect();
        for id in &stale {
            peers.remove(id);
        }
        stale
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn announce_for(n: u8) -> AnnouncePayload {
        AnnouncePayload {
            static_public: [n; 32],
            signing_public: [n.wrapping_add(3); 32],
            nostr_public: NostrPublicKey {
                signing: [n.wrapping_add(1); 32],
                encryption: [n.wrapping_add(2); 32],
            },
            nickname: format!("peer-{}", n),
        }
    }

    #[test]
    fn test_announce_payload_round_trip() {
        let payload = announce_for(9);
        let bytes = payload.to_bytes();
        assert_eq!(AnnouncePayload::from_bytes(&bytes).unwrap(), payload);

        assert!(AnnouncePayload::from_bytes(&bytes[..50]).is_err());
    }

    #[test]
    fn test_announce_inserts_and_refreshes() {
        let registry = PeerRegistry::new(10);
        let peer = PeerId::new([1; 8]);

        registry.announce(peer, &announce_for(1), PeerTransport::Ble);
        let record = registry.get(peer).unwrap();
        assert_eq!(record.nickname, "peer-1");
        assert_eq!(record.trust, TrustLevel::Untrusted);

        // Trust survives a re-announce with a new nickname
        registry.set_trust(peer, TrustLevel::Verified);
        let mut updated = announce_for(1);
        updated.nickname = "renamed".to_string();
        registry.announce(peer, &updated, PeerTransport::Nostr);

        let record = registry.get(peer).unwrap();
        assert_eq!(record.nickname, "renamed");
        assert_eq!(record.trust, TrustLevel::Verified);
        assert_eq!(record.transport, PeerTransport::Both);
    }

    #[test]
    fn test_leave_removes() {
        let registry = PeerRegistry::new(10);
        let peer = PeerId::new([2; 8]);
        registry.announce(peer, &announce_for(2), PeerTransport::Ble);
        assert!(registry.leave(peer));
        assert!(registry.get(peer).is_none());
        assert!(!registry.leave(peer));
    }

    #[test]
    fn test_capacity_evicts_least_recently_seen() {
        let registry = PeerRegistry::new(3);
        for n in 0..3u8 {
            registry.announce(PeerId::new([n; 8]), &announce_for(n), PeerTransport::Ble);
        }
        // Refresh peer 0 so peer 1 becomes the oldest
        registry.touch(PeerId::new([0; 8]));

        registry.announce(PeerId::new([9; 8]), &announce_for(9), PeerTransport::Ble);
        assert_eq!(registry.len(), 3);
        assert!(registry.get(PeerId::new([9; 8])).is_some());
    }

    #[test]
    fn test_blocked_lookup() {
        let registry = PeerRegistry::new(10);
        let peer = PeerId::new([3; 8]);
        registry.announce(peer, &announce_for(3), PeerTransport::Ble);

        assert!(!registry.is_blocked(peer));
        registry.set_trust(peer, TrustLevel::Blocked);
        assert!(registry.is_blocked(peer));
        // Unknown peers are not blocked
        assert!(!registry.is_blocked(PeerId::new([99; 8])));
    }

    #[test]
    fn test_connected_tracking() {
        let registry = PeerRegistry::new(10);
        let peer = PeerId::new([4; 8]);
        registry.announce(peer, &announce_for(4), PeerTransport::Ble);

        assert!(!registry.is_connected(peer));
        registry.set_connected(peer, true);
        assert!(registry.is_connected(peer));
        assert_eq!(registry.connected_peers(), vec![peer]);

        registry.set_connected(peer, false);
        assert!(registry.connected_peers().is_empty());
    }

    #[test]
    fn test_sweep_idle_keeps_connected() {
        let registry = PeerRegistry::new(10);
        let idle = PeerId::new([5; 8]);
        let connected = PeerId::new([6; 8]);
        registry.announce(idle, &announce_for(5), PeerTransport::Ble);
        registry.announce(connected, &announce_for(6), PeerTransport::Ble);
        registry.set_connected(connected, true);

        // Zero timeout expires everything not connected
        let removed = registry.sweep_idle(0);
        assert_eq!(removed, vec![idle]);
        assert!(registry.get(connected).is_some());
    }
}
