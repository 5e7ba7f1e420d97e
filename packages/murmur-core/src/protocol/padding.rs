//! Traffic-analysis-resistant padding.
//!
//! Application payloads are padded to a small set of standard block sizes
//! before encryption so the relay and any on-path observer see only a few
//! ciphertext lengths.
//!
//! Format: `[u16 BE true_length | payload | random padding]`. Random fill,
//! not zeros, so compressed transports cannot collapse the padding.

use rand::RngCore;

use crate::error::{Error, Result};
use crate::protocol::MESSAGE_MAX_SIZE;

/// Standard block sizes, smallest first.
pub const BLOCK_SIZES: [usize; 4] = [256, 512, 1024, 2048];

/// Length-prefix overhead inside the padded buffer.
const PREFIX_LEN: usize = 2;

/// Pad a payload to the smallest standard block that fits it.
///
/// Payloads larger than the largest standard block are rounded up to the
/// next 256-byte multiple instead.
pub fn pad(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MESSAGE_MAX_SIZE {
        return Err(Error::PayloadTooLarge {
            size: payload.len(),
            max: MESSAGE_MAX_SIZE,
        });
    }

    let target = target_size(payload.len());
    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);

    let fill = target - out.len();
    if fill > 0 {
        let mut padding = vec![0u8; fill];
        rand::rngs::OsRng.fill_bytes(&mut padding);
        out.extend_from_slice(&padding);
    }
    Ok(out)
}

/// Remove padding, returning the original payload.
pub fn unpad(padded: &[u8]) -> Result<Vec<u8>> {
    if padded.len() < PREFIX_LEN {
        return Err(Error::InvalidPadding(
            "too short for length prefix".to_string(),
        ));
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if PREFIX_LEN + len > padded.len() {
        return Err(Error::InvalidPadding(format!(
            "length prefix {} exceeds padded size {}",
            len,
            padded.len()
        )));
    }
    Ok(padded[PREFIX_LEN..PREFIX_LEN + len].to_vec())
}

/// The padded size a payload of `len` bytes maps to.
pub fn target_size(len: usize) -> usize {
    let needed = len + PREFIX_LEN;
    for &block in BLOCK_SIZES.iter() {
        if needed <= block {
            return block;
        }
    }
    // Round up to the next 256-byte multiple
    needed.div_ceil(256) * 256
}

// ============================================================================
// TESTS
// ============================================================================
