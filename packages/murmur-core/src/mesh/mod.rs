//! # Mesh Layer
//!
//! TTL flood routing over the BLE broadcast mesh:
//!
//! - [`bloom`] - probabilistic duplicate suppression
//! - [`peers`] - the capped peer registry with trust levels
//! - [`router`] - relay decisions, TTL policing, learned routes
//!
//! The router owns policy only; the transport multiplexer executes its
//! verdicts.

pub mod bloom;
pub mod peers;
pub mod router;

pub use bloom::BloomFilter;
pub use peers::{AnnouncePayload, PeerRecord, PeerRegistry, PeerTransport, TrustLevel};
pub use router::{packet_id, DropReason, MeshRouter, RouteEntry, Verdict};
