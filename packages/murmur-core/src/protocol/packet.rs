//! Packet encoding and decoding.
//!
//! The layout is fixed and big-endian throughout; see the module docs of
//! [`crate::protocol`]. The decoder is strict: unknown versions, unknown
//! message types, out-of-range TTLs, and non-zero reserved flag bits are all
//! rejected rather than passed through.

use std::io::Read;

use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;

use crate::error::{Error, Result};
use crate::protocol::{
    MessageType, PeerId, FLAG_HAS_RECIPIENT, FLAG_HAS_SIGNATURE, FLAG_IS_COMPRESSED, MAX_TTL,
    MESSAGE_MAX_SIZE, PROTOCOL_VERSION, RESERVED_FLAG_MASK,
};

/// Fixed header length: version, type, ttl, timestamp (8), flags, payload-length (2).
pub const HEADER_LEN: usize = 14;

/// Sender/recipient id length.
pub const PEER_ID_LEN: usize = 8;

/// Ed25519 signature length.
pub const SIGNATURE_LEN: usize = 64;

/// A wire packet.
///
/// Created on send and destroyed once dispatched or relayed; packets are
/// not retained. The `flags` byte is derived from the optional fields at
/// encode time rather than stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version (currently always 1)
    pub version: u8,
    /// Message type
    pub packet_type: MessageType,
    /// Hops remaining for mesh relay, 0..=7
    pub ttl: u8,
    /// Unix milliseconds at creation
    pub timestamp: u64,
    /// Sender short id
    pub sender: PeerId,
    /// Recipient short id; `None` encodes a broadcast
    pub recipient: Option<PeerId>,
    /// Application payload (opaque at this layer)
    pub payload: Vec<u8>,
    /// Whether the payload is Deflate-compressed
    pub compressed: bool,
    /// Detached Ed25519 signature over [`Packet::signing_bytes`]
    pub signature: Option<[u8; 64]>,
}

impl Packet {
    /// Construct a packet with the current defaults (version 1, max TTL).
    pub fn new(
        packet_type: MessageType,
        sender: PeerId,
        recipient: Option<PeerId>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            ttl: MAX_TTL,
            timestamp: crate::time::now_millis(),
            sender,
            recipient,
            payload,
            compressed: false,
            signature: None,
        }
    }

    /// Whether the packet is addressed to everyone.
    pub fn is_broadcast(&self) -> bool {
        match self.recipient {
            None => true,
            Some(id) => id.is_broadcast(),
        }
    }

    /// The flags byte this packet encodes with.
    pub fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.recipient.is_some() {
            flags |= FLAG_HAS_RECIPIENT;
        }
        if self.signature.is_some() {
            flags |= FLAG_HAS_SIGNATURE;
        }
        if self.compressed {
            flags |= FLAG_IS_COMPRESSED;
        }
        flags
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + PEER_ID_LEN
            + if self.recipient.is_some() { PEER_ID_LEN } else { 0 }
            + self.payload.len()
            + if self.signature.is_some() { SIGNATURE_LEN } else { 0 }
    }

    /// Encode to the wire format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.encode_inner(true)
    }

    /// The byte string an Ed25519 signature covers: the packet encoded
    /// without its signature (and without `HAS_SIGNATURE` set).
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        self.encode_inner(false)
    }

    fn encode_inner(&self, with_signature: bool) -> Result<Vec<u8>> {
        if self.payload.len() > MESSAGE_MAX_SIZE {
            return Err(Error::PayloadTooLarge {
                size: self.payload.len(),
                max: MESSAGE_MAX_SIZE,
            });
        }

        let signature = if with_signature { self.signature } else { None };
        let mut flags = self.flags();
        if !with_signature {
            flags &= !FLAG_HAS_SIGNATURE;
        }

        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.version);
        out.push(self.packet_type.as_u8());
        out.push(self.ttl);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.push(flags);
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(self.sender.as_bytes());
        if let Some(recipient) = self.recipient {
            out.extend_from_slice(recipient.as_bytes());
        }
        out.extend_from_slice(&self.payload);
        if let Some(sig) = signature {
            out.extend_from_slice(&sig);
        }
        Ok(out)
    }

    /// Decode from the wire format.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::TruncatedHeader(buf.len()));
        }

        let version = buf[0];
        if version != PROTOCOL_VERSION {
            return Err(Error::UnknownVersion(version));
        }

        let packet_type =
            MessageType::from_u8(buf[1]).ok_or(Error::UnknownMessageType(buf[1]))?;

        let ttl = buf[2];
        if ttl > MAX_TTL {
            return Err(Error::InvalidTtl(ttl));
        }

        let timestamp = u64::from_be_bytes(buf[3..11].try_into().expect("8-byte slice"));

        let flags = buf[11];
        if flags & RESERVED_FLAG_MASK != 0 {
            return Err(Error::InvalidPacket(format!(
                "reserved flag bits set: 0x{:02X}",
                flags
            )));
        }

        let payload_len =
            u16::from_be_bytes(buf[12..14].try_into().expect("2-byte slice")) as usize;

        let mut needed = PEER_ID_LEN + payload_len;
        if flags & FLAG_HAS_RECIPIENT != 0 {
            needed += PEER_ID_LEN;
        }
        if flags & FLAG_HAS_SIGNATURE != 0 {
            needed += SIGNATURE_LEN;
        }
        let available = buf.len() - HEADER_LEN;
        if available < needed {
            return Err(Error::TruncatedBody {
                expected: needed,
                available,
            });
        }

        let mut offset = HEADER_LEN;
        let sender = PeerId::new(buf[offset..offset + PEER_ID_LEN].try_into().expect("8 bytes"));
        offset += PEER_ID_LEN;

        let recipient = if flags & FLAG_HAS_RECIPIENT != 0 {
            let id = PeerId::new(buf[offset..offset + PEER_ID_LEN].try_into().expect("8 bytes"));
            offset += PEER_ID_LEN;
            Some(id)
        } else {
            None
        };

        let payload = buf[offset..offset + payload_len].to_vec();
        offset += payload_len;

        let signature = if flags & FLAG_HAS_SIGNATURE != 0 {
            let sig: [u8; 64] = buf[offset..offset + SIGNATURE_LEN]
                .try_into()
                .expect("64 bytes");
            Some(sig)
        } else {
            None
        };

        Ok(Self {
            version,
            packet_type,
            ttl,
            timestamp,
            sender,
            recipient,
            payload,
            compressed: flags & FLAG_IS_COMPRESSED != 0,
            signature,
        })
    }
}

// ============================================================================
// PAYLOAD COMPRESSION
// ============================================================================

/// Deflate-compress a payload, returning `None` when compression does not
/// actually shrink it (random or already-compressed data).
pub fn compress_payload(data: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(data, Compression::default());
    let mut out = Vec::new();
    if encoder.read_to_end(&mut out).is_err() {
        return None;
    }
    if out.len() < data.len() {
        Some(out)
    } else {
        None
    }
}

/// Inverse of [`compress_payload`].
pub fn decompress_payload(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::InvalidPacket(format!("decompression failed: {}", e)))?;
    if out.len() > MESSAGE_MAX_SIZE {
        return Err(Error::PayloadTooLarge {
            size: out.len(),
            max: MESSAGE_MAX_SIZE,
        });
    }
    Ok(out)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Packet {
        Packet {
            version: 1,
            packet_type: MessageType::Message,
            ttl: 7,
            timestamp: 1_733_251_200_000,
            sender: PeerId::new([0x12, 0x34, 0x56, 0x78, 0x90, 0xAB, 0xCD, 0xEF]),
            recipient: None,
            payload: b"Hello, BitChat!".to_vec(),
            compressed: false,
            signature: None,
        }
    }

    #[test]
    fn test_reference_vector() {
        let encoded = sample_packet().encode().unwrap();

        // Header: version, type, ttl, timestamp BE, flags, payload length
        assert_eq!(
            &encoded[..HEADER_LEN],
            &[0x01, 0x04, 0x07, 0x00, 0x00, 0x01, 0x92, 0x7C, 0x78, 0x38, 0x00, 0x00, 0x00, 0x0F]
        );
        // Sender id
        assert_eq!(
            &encoded[HEADER_LEN..HEADER_LEN + 8],
            &[0x12, 0x34, 0x56, 0x78, 0x90, 0xAB, 0xCD, 0xEF]
        );
        // ASCII payload
        assert_eq!(&encoded[HEADER_LEN + 8..], b"Hello, BitChat!");

        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded, sample_packet());
    }

    #[test]
    fn test_round_trip_with_recipient_and_signature() {
        let mut packet = sample_packet();
        packet.recipient = Some(PeerId::new([1, 2, 3, 4, 5, 6, 7, 8]));
        packet.signature = Some([0x5A; 64]);

        let encoded = packet.encode().unwrap();
        assert_eq!(encoded.len(), HEADER_LEN + 8 + 8 + 15 + 64);
        assert_eq!(Packet::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_signing_bytes_exclude_signature() {
        let mut packet = sample_packet();
        packet.signature = Some([0x5A; 64]);

        let signing = packet.signing_bytes().unwrap();
        let unsigned = {
            let mut p = packet.clone();
            p.signature = None;
            p.encode().unwrap()
        };
        assert_eq!(signing, unsigned);
    }

    #[test]
    fn test_truncated_header() {
        match Packet::decode(&[1, 4, 7]) {
            Err(Error::TruncatedHeader(3)) => {}
            other => panic!("expected TruncatedHeader, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_body() {
        let mut encoded = sample_packet().encode().unwrap();
        encoded.truncate(encoded.len() - 4);
        assert!(matches!(
            Packet::decode(&encoded),
            Err(Error::TruncatedBody { .. })
        ));
    }

    #[test]
    fn test_unknown_version() {
        let mut encoded = sample_packet().encode().unwrap();
        encoded[0] = 2;
        assert!(matches!(
            Packet::decode(&encoded),
            Err(Error::UnknownVersion(2))
        ));
    }

    #[test]
    fn test_invalid_ttl() {
        let mut encoded = sample_packet().encode().unwrap();
        encoded[2] = 8;
        assert!(matches!(Packet::decode(&encoded), Err(Error::InvalidTtl(8))));
    }

    #[test]
    fn test_unknown_message_type() {
        let mut encoded = sample_packet().encode().unwrap();
        encoded[1] = 0xEE;
        assert!(matches!(
            Packet::decode(&encoded),
            Err(Error::UnknownMessageType(0xEE))
        ));
    }

    #[test]
    fn test_reserved_flags_rejected() {
        let mut encoded = sample_packet().encode().unwrap();
        encoded[11] |= 0x80;
        assert!(matches!(
            Packet::decode(&encoded),
            Err(Error::InvalidPacket(_))
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut packet = sample_packet();
        packet.payload = vec![0u8; MESSAGE_MAX_SIZE + 1];
        assert!(matches!(
            packet.encode(),
            Err(Error::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_empty_payload() {
        let mut packet = sample_packet();
        packet.payload.clear();
        let encoded = packet.encode().unwrap();
        assert_eq!(encoded.len(), HEADER_LEN + 8);
        assert_eq!(Packet::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_compression_round_trip() {
        let data = vec![b'a'; 4096];
        let compressed = compress_payload(&data).expect("repetitive data compresses");
        assert!(compressed.len() < data.len());
        assert_eq!(decompress_payload(&compressed).unwrap(), data);
    }

    #[test]
    fn test_compression_skipped_when_not_smaller() {
        // 16 bytes of already-high-entropy data will not shrink
        let data: Vec<u8> = (0..16).map(|i| i * 37 + 11).collect();
        assert!(compress_payload(&data).is_none());
    }
}
