//! Mesh router: duplicate suppression, TTL policing, relay decisions, and
//! the learned routing table.
//!
//! Every inbound packet passes through [`MeshRouter::process`], which
//! returns a verdict the multiplexer acts on. The router never touches a
//! transport itself.
//!
//! Relay rules: a packet is relayed iff it is valid, not addressed solely
//! to this node, its sender is not blocked, its TTL is still positive
//! after the decrement, and it has not been seen before. Packets whose
//! timestamp is more than five minutes away from local time are dropped
//! outright.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};

use crate::mesh::bloom::BloomFilter;
use crate::mesh::peers::PeerRegistry;
use crate::metrics::{bump, Metrics};
use crate::protocol::{Packet, PeerId, MAX_CLOCK_SKEW_MS};
use crate::time::now_millis;

/// Bloom filter capacity: observed packet ids at nominal load.
pub const DEDUP_CAPACITY: usize = 10_000;

/// Bloom filter target false-positive rate.
pub const DEDUP_FPR: f64 = 0.01;

/// How long a learned route stays valid without refresh (10 minutes).
pub const ROUTE_IDLE_MS: u64 = 10 * 60 * 1000;

/// Why the router refused a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Already observed inside the dedup window
    Duplicate,
    /// Timestamp too far from local time
    StaleTimestamp,
    /// Sender is blocked
    Blocked,
    /// Not addressed here and TTL exhausted
    TtlExhausted,
}

/// The router's decision for one inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Addressed to this node: process locally, do not relay
    Deliver,
    /// Broadcast with TTL remaining: process locally and relay the copy
    DeliverAndRelay(Packet),
    /// Addressed to another node with TTL remaining: relay only
    Relay(Packet),
    /// Refused
    Drop(DropReason),
}

/// One learned route.
#[derive(Debug, Clone, Copy)]
pub struct RouteEntry {
    /// Neighbor the destination was last heard through
    pub next_hop: PeerId,
    /// Hop distance estimate
    pub hop_count: u8,
    /// Unix millis of the last refresh
    pub last_used: u64,
}

/// Mesh routing state.
pub struct MeshRouter {
    local: PeerId,
    seen: Mutex<BloomFilter>,
    routes: RwLock<HashMap<PeerId, RouteEntry>>,
    registry: Arc<PeerRegistry>,
    metrics: Arc<Metrics>,
}

/// Packet id for duplicate suppression:
/// `sha256(sender_id || timestamp_be || payload)`.
///
/// Hashing only a payload prefix would collapse the fragments of one
/// message into a single id (they all begin with the shared message id),
/// so the full payload participates.
pub fn packet_id(packet: &Packet) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(packet.sender.as_bytes());
    hasher.update(packet.timestamp.to_be_bytes());
    hasher.update(&packet.payload);
    hasher.finalize().into()
}

impl MeshRouter {
    /// Create a router for the given local id.
    pub fn new(local: PeerId, registry: Arc<PeerRegistry>, metrics: Arc<Metrics>) -> Self {
        Self {
            local,
            seen: Mutex::new(BloomFilter::with_capacity(DEDUP_CAPACITY, DEDUP_FPR)),
            routes: RwLock::new(HashMap::new()),
            registry,
            metrics,
        }
    }

    /// Decide what to do with an inbound packet.
    ///
    /// `from` is the immediate neighbor the packet arrived through (absent
    /// for Nostr and loopback arrivals) and feeds the routing table.
    pub fn process(&self, packet: &Packet, from: Option<PeerId>) -> Verdict {
        // Clock skew window
        let now = now_millis();
        if packet.timestamp.abs_diff(now) > MAX_CLOCK_SKEW_MS {
            bump(&self.metrics.dropped_stale_timestamp);
            tracing::debug!(
                sender = %packet.sender,
                timestamp = packet.timestamp,
                "Dropping packet outside the clock-skew window"
            );
            return Verdict::Drop(DropReason::StaleTimestamp);
        }

        // Blocked senders are dropped before anything else is considered
        if self.registry.is_blocked(packet.sender) {
            return Verdict::Drop(DropReason::Blocked);
        }

        // Duplicate suppression
        if self.seen.lock().check_and_insert(&packet_id(packet)) {
            bump(&self.metrics.dropped_duplicate);
            return Verdict::Drop(DropReason::Duplicate);
        }

        self.registry.touch(packet.sender);
        if let Some(via) = from {
            self.learn_route(packet.sender, via, packet.ttl);
        }

        let addressed_to_us = packet.recipient == Some(self.local);
        let broadcast = packet.is_broadcast();

        // TTL: a packet arriving at 0 is never relayed; relayed copies are
        // decremented by exactly one.
        let relay_ttl = packet.ttl.checked_sub(1).filter(|ttl| *ttl > 0);

        if addressed_to_us {
            return Verdict::Deliver;
        }

        let relay_copy = relay_ttl.map(|ttl| {
            let mut copy = packet.clone();
            copy.ttl = ttl;
            copy
        });

        if broadcast {
            match relay_copy {
                Some(copy) => {
                    bump(&self.metrics.relayed);
                    Verdict::DeliverAndRelay(copy)
                }
                None => {
                    bump(&self.metrics.dropped_expired_ttl);
                    Verdict::Deliver
                }
            }
        } else {
            match relay_copy {
                Some(copy) => {
                    bump(&self.metrics.relayed);
                    Verdict::Relay(copy)
                }
                None => {
                    bump(&self.metrics.dropped_expired_ttl);
                    Verdict::Drop(DropReason::TtlExhausted)
                }
            }
        }
    }

    /// Record that `destination` was heard through `via`.
    ///
    /// The hop estimate assumes origins send at the maximum TTL; a shorter
    /// path replaces a longer one, and any refresh updates the timestamp.
    pub fn learn_route(&self, destination: PeerId, via: PeerId, packet_ttl: u8) {
        if destination == self.local {
            return;
        }
        let hop_count = crate::protocol::MAX_TTL.saturating_sub(packet_ttl);
        let mut routes = self.routes.write();
        let entry = routes.entry(destination).or_insert(RouteEntry {
            next_hop: via,
            hop_count,
            last_used: now_millis(),
        });
        if hop_count <= entry.hop_count {
            entry.next_hop = via;
            entry.hop_count = hop_count;
        }
        entry.last_used = now_millis();
    }

    /// Neighbor to forward through for a destination, if known.
    pub fn next_hop(&self, destination: PeerId) -> Option<PeerId> {
        self.routes
            .read()
            .get(&destination)
            .map(|entry| entry.next_hop)
    }

    /// Number of learned routes.
    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    /// Drop routes idle past the expiry window. Returns how many expired.
    pub fn sweep_routes(&self, idle_ms: u64) -> usize {
        let now = now_millis();
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|_, entry| now.saturating_sub(entry.last_used) < idle_ms);
        before - routes.len()
    }

    /// Serialized dedup filter for peer exchange.
    pub fn seen_filter_bytes(&self) -> Vec<u8> {
        bincode::serialize(&*self.seen.lock()).unwrap_or_default()
    }

    /// Merge a peer's dedup filter into ours.
    pub fn merge_seen_filter(&self, bytes: &[u8]) -> bool {
        match bincode::deserialize::<BloomFilter>(bytes) {
            Ok(theirs) => self.seen.lock().merge(&theirs),
            Err(_) => false,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
