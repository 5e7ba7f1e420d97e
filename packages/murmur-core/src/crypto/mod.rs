//! # Cryptography
//!
//! Key material, AEAD cipher states, and the Noise XX handshake.
//!
//! ## Layers
//!
//! - [`keys`] - Curve25519 static pairs, Ed25519 signing, fingerprints,
//!   and the derived Nostr identity
//! - [`cipher`] - ChaCha20-Poly1305 cipher state with counter nonces and
//!   the symmetric (transcript) state
//! - [`noise`] - the three-message XX handshake producing a pair of
//!   transport ciphers
//!
//! All private key material lives in zeroizing containers; nothing in this
//! module performs I/O or suspends.

pub mod cipher;
pub mod keys;
pub mod noise;

pub use cipher::{CipherState, SymmetricState};
pub use keys::{
    fingerprint, peer_id_from_public, verify_signature, Identity, NoiseKeyPair, NostrKeyPair,
    NostrPublicKey, SigningKeyPair,
};
pub use noise::{HandshakeState, Role, TransportState, PROTOCOL_NAME};
