//! # Wire Protocol
//!
//! Binary packet codec, fragmentation, and padding for the mesh wire format.
//!
//! ## Packet Layout
//!
//! ```text
//! ┌─────────┬──────┬─────┬────────────┬───────┬─────────────┐
//! │ version │ type │ ttl │ timestamp  │ flags │ payload-len │   13-byte header
//! │   u8    │  u8  │ u8  │   u64 BE   │  u8   │   u16 BE    │
//! ├─────────┴──────┴─────┴────────────┴───────┴─────────────┤
//! │ sender-id (8 bytes)                                      │
//! │ recipient-id (8 bytes, iff HAS_RECIPIENT)                │
//! │ payload (payload-len bytes)                              │
//! │ signature (64 bytes, iff HAS_SIGNATURE)                  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! All multi-byte integers are big-endian. Packets larger than the BLE MTU
//! are split by [`fragment`] and padded to standard block sizes by
//! [`padding`] before encryption.

pub mod fragment;
pub mod packet;
pub mod padding;

pub use fragment::{fragment_packets, Reassembler, FRAGMENT_HEADER_LEN};
pub use packet::{Packet, HEADER_LEN, SIGNATURE_LEN};
pub use padding::{pad, unpad, BLOCK_SIZES};

use serde::{Deserialize, Serialize};

// ============================================================================
// PROTOCOL CONSTANTS
// ============================================================================

/// Wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum time-to-live for mesh relay
pub const MAX_TTL: u8 = 7;

/// BLE link-layer maximum transmission unit
pub const BLE_MTU: usize = 512;

/// Maximum application payload size (u16 length field)
pub const MESSAGE_MAX_SIZE: usize = 65535;

/// Maximum tolerated clock skew for inbound packets (5 minutes)
pub const MAX_CLOCK_SKEW_MS: u64 = 5 * 60 * 1000;

// ── Flag bits ────────────────────────────────────────────────────────────────

/// Packet carries an explicit recipient id
pub const FLAG_HAS_RECIPIENT: u8 = 0x01;
/// Packet carries an Ed25519 signature
pub const FLAG_HAS_SIGNATURE: u8 = 0x02;
/// Payload is Deflate-compressed
pub const FLAG_IS_COMPRESSED: u8 = 0x04;
/// All bits outside the defined flags are reserved and must be zero
pub const RESERVED_FLAG_MASK: u8 = !(FLAG_HAS_RECIPIENT | FLAG_HAS_SIGNATURE | FLAG_IS_COMPRESSED);

// ============================================================================
// PEER ID
// ============================================================================

/// Short 8-byte peer identifier used on the wire.
///
/// The static public key is the authoritative identity; the short id is
/// derived from its SHA-256 and only disambiguates packets in flight.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 8]);

impl PeerId {
    /// The broadcast address: eight 0xFF bytes.
    pub const BROADCAST: PeerId = PeerId([0xFF; 8]);

    /// Construct from raw bytes.
    pub fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Parse from a 16-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 8] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Hex rendering (lowercase, 16 chars).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Whether this is the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

// ============================================================================
// MESSAGE TYPES
// ============================================================================

/// Wire message type constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Peer identity announcement
    Announce = 0x01,
    /// Peer is leaving the mesh
    Leave = 0x03,
    /// Chat message (single-chunk)
    Message = 0x04,
    /// First fragment of a multi-chunk message
    FragmentStart = 0x05,
    /// Intermediate fragment
    FragmentContinue = 0x06,
    /// Final fragment
    FragmentEnd = 0x07,
    /// Delivery acknowledgement
    DeliveryAck = 0x0A,
    /// Query for the delivery status of a message
    DeliveryStatusRequest = 0x0B,
    /// Read receipt
    ReadReceipt = 0x0C,
    /// Noise XX handshake message 1
    NoiseHandshakeInit = 0x10,
    /// Noise XX handshake messages 2 and 3
    NoiseHandshakeResp = 0x11,
    /// Session-encrypted payload
    NoiseEncrypted = 0x12,
    /// Signed identity announcement bound to the Noise static key
    NoiseIdentityAnnounce = 0x13,
    /// Version negotiation hello
    VersionHello = 0x20,
    /// Version negotiation acknowledgement
    VersionAck = 0x21,
    /// Protocol-level positive acknowledgement
    ProtocolAck = 0x22,
    /// Protocol-level negative acknowledgement
    ProtocolNack = 0x23,
    /// Reserved handshake request marker, carried opaquely
    HandshakeRequest = 0x25,
    /// Reserved mesh relay wrapper, carried opaquely
    MeshRelay = 0x26,
    /// Peer marked us as a favorite
    Favorited = 0x30,
    /// Peer removed us as a favorite
    Unfavorited = 0x31,
}

impl MessageType {
    /// Numeric wire value.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse from the wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Announce),
            0x03 => Some(Self::Leave),
            0x04 => Some(Self::Message),
            0x05 => Some(Self::FragmentStart),
            0x06 => Some(Self::FragmentContinue),
            0x07 => Some(Self::FragmentEnd),
            0x0A => Some(Self::DeliveryAck),
            0x0B => Some(Self::DeliveryStatusRequest),
            0x0C => Some(Self::ReadReceipt),
            0x10 => Some(Self::NoiseHandshakeInit),
            0x11 => Some(Self::NoiseHandshakeResp),
            0x12 => Some(Self::NoiseEncrypted),
            0x13 => Some(Self::NoiseIdentityAnnounce),
            0x20 => Some(Self::VersionHello),
            0x21 => Some(Self::VersionAck),
            0x22 => Some(Self::ProtocolAck),
            0x23 => Some(Self::ProtocolNack),
            0x25 => Some(Self::HandshakeRequest),
            0x26 => Some(Self::MeshRelay),
            0x30 => Some(Self::Favorited),
            0x31 => Some(Self::Unfavorited),
            _ => None,
        }
    }

    /// Whether this type is part of the Noise handshake exchange.
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::NoiseHandshakeInit | Self::NoiseHandshakeResp)
    }

    /// Whether this type is a fragment carrier.
    pub fn is_fragment(self) -> bool {
        matches!(
            self,
            Self::FragmentStart | Self::FragmentContinue | Self::FragmentEnd
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_hex_round_trip() {
        let id = PeerId::new([0x12, 0x34, 0x56, 0x78, 0x90, 0xAB, 0xCD, 0xEF]);
        assert_eq!(id.to_hex(), "1234567890abcdef");
        assert_eq!(PeerId::from_hex("1234567890abcdef"), Some(id));
        assert_eq!(PeerId::from_hex("123456"), None);
    }

    #[test]
    fn test_broadcast_id() {
        assert!(PeerId::BROADCAST.is_broadcast());
        assert!(!PeerId::new([0; 8]).is_broadcast());
        assert_eq!(PeerId::BROADCAST.as_bytes(), &[0xFF; 8]);
    }

    #[test]
    fn test_message_type_round_trip() {
        for value in 0u8..=0xFF {
            if let Some(ty) = MessageType::from_u8(value) {
                assert_eq!(ty.as_u8(), value);
            }
        }
        assert_eq!(MessageType::from_u8(0x04), Some(MessageType::Message));
        assert_eq!(MessageType::from_u8(0x02), None);
        assert_eq!(MessageType::from_u8(0xFE), None);
    }

    #[test]
    fn test_type_predicates() {
        assert!(MessageType::NoiseHandshakeInit.is_handshake());
        assert!(MessageType::NoiseHandshakeResp.is_handshake());
        assert!(!MessageType::NoiseEncrypted.is_handshake());
        assert!(MessageType::FragmentContinue.is_fragment());
        assert!(!MessageType::Message.is_fragment());
    }

    #[test]
    fn test_reserved_flag_mask() {
        assert_eq!(RESERVED_FLAG_MASK & FLAG_HAS_RECIPIENT, 0);
        assert_eq!(RESERVED_FLAG_MASK & FLAG_HAS_SIGNATURE, 0);
        assert_eq!(RESERVED_FLAG_MASK & FLAG_IS_COMPRESSED, 0);
        assert_eq!(RESERVED_FLAG_MASK | 0x07, 0xFF);
    }
}
