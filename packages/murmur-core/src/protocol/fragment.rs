//! Fragmentation and reassembly for payloads that exceed the BLE MTU.
//!
//! Fragment payload layout: `[message_id(8) | index(2 BE) | total(2 BE) | data]`.
//! The first fragment carries `FRAGMENT_START`, the last `FRAGMENT_END`, and
//! everything between `FRAGMENT_CONTINUE`. A message that fits in one MTU is
//! never fragmented.
//!
//! Reassembly accepts fragments in any order and discards a slot once it has
//! made no progress for the reassembly window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::RngCore;

use crate::error::{Error, Result};
use crate::protocol::packet::Packet;
use crate::protocol::{MessageType, BLE_MTU, MESSAGE_MAX_SIZE};

/// Fragment payload overhead: message id (8) + index (2) + total (2).
pub const FRAGMENT_HEADER_LEN: usize = 12;

/// Data bytes carried per fragment.
pub const FRAGMENT_DATA_LEN: usize = BLE_MTU - FRAGMENT_HEADER_LEN;

/// How long a partial message is retained without progress.
pub const REASSEMBLY_WINDOW: Duration = Duration::from_secs(30);

/// Split `data` into fragment payloads under `message_id`.
///
/// Returns one `(type, payload)` pair per fragment in index order.
pub fn fragment_data(
    message_id: [u8; 8],
    data: &[u8],
) -> Result<Vec<(MessageType, Vec<u8>)>> {
    if data.is_empty() {
        return Err(Error::InvalidPacket("cannot fragment empty data".to_string()));
    }
    if data.len() > MESSAGE_MAX_SIZE {
        return Err(Error::PayloadTooLarge {
            size: data.len(),
            max: MESSAGE_MAX_SIZE,
        });
    }

    let total = data.len().div_ceil(FRAGMENT_DATA_LEN);
    let mut fragments = Vec::with_capacity(total);
    for (index, chunk) in data.chunks(FRAGMENT_DATA_LEN).enumerate() {
        let packet_type = if index == 0 {
            MessageType::FragmentStart
        } else if index == total - 1 {
            MessageType::FragmentEnd
        } else {
            MessageType::FragmentContinue
        };

        let mut payload = Vec::with_capacity(FRAGMENT_HEADER_LEN + chunk.len());
        payload.extend_from_slice(&message_id);
        payload.extend_from_slice(&(index as u16).to_be_bytes());
        payload.extend_from_slice(&(total as u16).to_be_bytes());
        payload.extend_from_slice(chunk);
        fragments.push((packet_type, payload));
    }
    Ok(fragments)
}

/// Split a packet into fragment packets when its encoding exceeds the MTU.
///
/// The fragments carry the complete encoded original packet as their data,
/// so reassembly followed by decode restores the packet exactly. A packet
/// that already fits returns unchanged as a single element.
pub fn fragment_packets(packet: &Packet) -> Result<Vec<Packet>> {
    let encoded = packet.encode()?;
    if encoded.len() <= BLE_MTU {
        return Ok(vec![packet.clone()]);
    }

    let mut message_id = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut message_id);

    let fragments = fragment_data(message_id, &encoded)?;
    Ok(fragments
        .into_iter()
        .map(|(packet_type, payload)| Packet {
            version: packet.version,
            packet_type,
            ttl: packet.ttl,
            timestamp: packet.timestamp,
            sender: packet.sender,
            recipient: packet.recipient,
            payload,
            compressed: false,
            signature: None,
        })
        .collect())
}

// ============================================================================
// REASSEMBLY
// ============================================================================

/// One partially reassembled message.
struct Slot {
    total: u16,
    chunks: HashMap<u16, Vec<u8>>,
    last_progress: Instant,
}

/// Buffers fragments per message id until all indices are present.
pub struct Reassembler {
    slots: HashMap<[u8; 8], Slot>,
    window: Duration,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(REASSEMBLY_WINDOW)
    }
}

impl Reassembler {
    /// Create a reassembler with a custom expiry window.
    pub fn new(window: Duration) -> Self {
        Self {
            slots: HashMap::new(),
            window,
        }
    }

    /// Feed one fragment payload. Returns the reassembled data once every
    /// index of the message has arrived.
    pub fn accept(&mut self, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        if payload.len() <= FRAGMENT_HEADER_LEN {
            return Err(Error::InvalidPacket("fragment too short".to_string()));
        }

        let message_id: [u8; 8] = payload[..8].try_into().expect("8 bytes");
        let index = u16::from_be_bytes([payload[8], payload[9]]);
        let total = u16::from_be_bytes([payload[10], payload[11]]);

        if total == 0 || index >= total {
            return Err(Error::InvalidPacket(format!(
                "fragment index {} out of range (total {})",
                index, total
            )));
        }

        let slot = self.slots.entry(message_id).or_insert_with(|| Slot {
            total,
            chunks: HashMap::new(),
            last_progress: Instant::now(),
        });

        if slot.total != total {
            // Conflicting totals for one id: drop the whole slot
            self.slots.remove(&message_id);
            return Err(Error::InvalidPacket(
                "fragment total mismatch".to_string(),
            ));
        }

        slot.chunks
            .insert(index, payload[FRAGMENT_HEADER_LEN..].to_vec());
        slot.last_progress = Instant::now();

        if slot.chunks.len() == slot.total as usize {
            let slot = self.slots.remove(&message_id).expect("slot present");
            let mut data = Vec::new();
            for i in 0..slot.total {
                data.extend_from_slice(&slot.chunks[&i]);
            }
            return Ok(Some(data));
        }
        Ok(None)
    }

    /// Drop slots that have seen no progress inside the window.
    /// Returns how many were discarded.
    pub fn sweep(&mut self) -> usize {
        let window = self.window;
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| slot.last_progress.elapsed() < window);
        let expired = before - self.slots.len();
        if expired > 0 {
            tracing::debug!(expired, "Discarded stale reassembly slots");
        }
        expired
    }

    /// Number of in-flight partial messages.
    pub fn pending(&self) -> usize {
        self.slots.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PeerId;

    const MESSAGE_ID: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF];

    #[test]
    fn test_1200_bytes_make_three_fragments() {
        let data: Vec<u8> = (0..1200u32).map(|i| (i % 256) as u8).collect();
        let fragments = fragment_data(MESSAGE_ID, &data).unwrap();

        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].0, MessageType::FragmentStart);
        assert_eq!(fragments[1].0, MessageType::FragmentContinue);
        assert_eq!(fragments[2].0, MessageType::FragmentEnd);

        for (i, (_, payload)) in fragments.iter().enumerate() {
            assert_eq!(&payload[..8], &MESSAGE_ID);
            assert_eq!(u16::from_be_bytes([payload[8], payload[9]]), i as u16);
            assert_eq!(u16::from_be_bytes([payload[10], payload[11]]), 3);
        }
        assert_eq!(fragments[0].1.len() - FRAGMENT_HEADER_LEN, 500);
        assert_eq!(fragments[2].1.len() - FRAGMENT_HEADER_LEN, 200);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let data: Vec<u8> = (0..1200u32).map(|i| (i % 256) as u8).collect();
        let fragments = fragment_data(MESSAGE_ID, &data).unwrap();

        let mut reassembler = Reassembler::default();
        for index in [2usize, 0, 1] {
            let result = reassembler.accept(&fragments[index].1).unwrap();
            if index == 1 {
                assert_eq!(result.unwrap(), data);
            } else {
                assert!(result.is_none());
            }
        }
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_any_permutation_reassembles() {
        let data: Vec<u8> = (0..1100u32).map(|i| (i % 251) as u8).collect();
        let fragments = fragment_data(MESSAGE_ID, &data).unwrap();
        assert_eq!(fragments.len(), 3);

        let permutations: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in permutations {
            let mut reassembler = Reassembler::default();
            let mut out = None;
            for &i in order.iter() {
                out = reassembler.accept(&fragments[i].1).unwrap();
            }
            assert_eq!(out.unwrap(), data, "order {:?}", order);
        }
    }

    #[test]
    fn test_single_chunk_message_is_not_fragmented() {
        let packet = Packet::new(
            MessageType::Message,
            PeerId::new([1; 8]),
            None,
            vec![7u8; 100],
        );
        let fragments = fragment_packets(&packet).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0], packet);
    }

    #[test]
    fn test_oversized_packet_fragments_and_restores() {
        let packet = Packet::new(
            MessageType::Message,
            PeerId::new([1; 8]),
            Some(PeerId::new([2; 8])),
            (0..2000u32).map(|i| (i % 256) as u8).collect(),
        );
        let fragments = fragment_packets(&packet).unwrap();
        assert!(fragments.len() > 1);
        for fragment in &fragments {
            assert!(fragment.encode().unwrap().len() <= BLE_MTU + FRAGMENT_HEADER_LEN + 64);
            assert!(fragment.packet_type.is_fragment());
            assert_eq!(fragment.sender, packet.sender);
        }

        let mut reassembler = Reassembler::default();
        let mut restored = None;
        for fragment in &fragments {
            restored = reassembler.accept(&fragment.payload).unwrap();
        }
        let decoded = Packet::decode(&restored.unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_slot_expiry() {
        let data = vec![1u8; 1200];
        let fragments = fragment_data(MESSAGE_ID, &data).unwrap();

        let mut reassembler = Reassembler::new(Duration::ZERO);
        reassembler.accept(&fragments[0].1).unwrap();
        assert_eq!(reassembler.pending(), 1);
        assert_eq!(reassembler.sweep(), 1);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_bad_fragments_rejected() {
        let mut reassembler = Reassembler::default();
        assert!(reassembler.accept(&[0u8; 12]).is_err());

        // index >= total
        let mut payload = Vec::new();
        payload.extend_from_slice(&MESSAGE_ID);
        payload.extend_from_slice(&5u16.to_be_bytes());
        payload.extend_from_slice(&3u16.to_be_bytes());
        payload.extend_from_slice(b"data");
        assert!(reassembler.accept(&payload).is_err());
    }
}
