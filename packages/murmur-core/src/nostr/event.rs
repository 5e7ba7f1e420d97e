//! Nostr event model and gift-wrapped direct messages.
//!
//! Events follow the NIP-01 shape: the id is the SHA-256 of the canonical
//! JSON serialization `[0, pubkey, created_at, kind, tags, content]`.
//! Signatures here are Ed25519 over the 32-byte id, using the Nostr
//! identity derived from the static key.
//!
//! Direct messages ride a two-layer wrap in the NIP-17 style:
//!
//! ```text
//! outer (kind 1059) - signed by a fresh ephemeral key per message,
//!                     addressed via a "p" tag, content encrypted to the
//!                     recipient with an ephemeral X25519 key
//!   └─ seal (kind 13) - signed by the sender's Nostr key, content
//!                       encrypted sender→recipient
//!        └─ payload bytes
//! ```
//!
//! A relay observing the outer event learns the recipient tag and nothing
//! else: the sender only appears inside the encrypted seal.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::crypto::{verify_signature, NoiseKeyPair, NostrKeyPair, NostrPublicKey, SigningKeyPair};
use crate::error::{Error, Result};

/// Kind of the inner signed seal.
pub const KIND_SEAL: u32 = 13;

/// Kind of the outer gift wrap.
pub const KIND_GIFT_WRAP: u32 = 1059;

/// Domain string for the seal encryption key.
const SEAL_DOMAIN: &[u8] = b"murmur-seal-v1";

/// Domain string for the wrap encryption key.
const WRAP_DOMAIN: &[u8] = b"murmur-gift-wrap-v1";

/// A Nostr event as carried on relay WebSockets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NostrEvent {
    /// Hex of the SHA-256 of the canonical serialization
    pub id: String,
    /// Author public key (hex)
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Kind number
    pub kind: u32,
    /// Arbitrary tags
    pub tags: Vec<Vec<String>>,
    /// Content body
    pub content: String,
    /// Signature over the id (hex)
    pub sig: String,
}

impl NostrEvent {
    /// Canonical id: SHA-256 of `[0, pubkey, created_at, kind, tags, content]`.
    pub fn compute_id(&self) -> String {
        let canonical = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content,
        ]);
        let serialized = canonical.to_string();
        hex::encode(Sha256::digest(serialized.as_bytes()))
    }

    /// Build and sign an event with the given key.
    pub fn build(
        signing: &SigningKeyPair,
        kind: u32,
        tags: Vec<Vec<String>>,
        content: String,
        created_at: u64,
    ) -> Result<Self> {
        let mut event = Self {
            id: String::new(),
            pubkey: hex::encode(signing.public_bytes()),
            created_at,
            kind,
            tags,
            content,
            sig: String::new(),
        };
        event.id = event.compute_id();
        let id_bytes = hex::decode(&event.id).expect("id is hex");
        event.sig = hex::encode(signing.sign(&id_bytes));
        Ok(event)
    }

    /// Verify the id and signature.
    pub fn verify(&self) -> Result<()> {
        if self.compute_id() != self.id {
            return Err(Error::CryptoFailure("event id mismatch".to_string()));
        }
        let pubkey: [u8; 32] = hex::decode(&self.pubkey)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::CryptoFailure("malformed event pubkey".to_string()))?;
        let sig: [u8; 64] = hex::decode(&self.sig)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::CryptoFailure("malformed event signature".to_string()))?;
        let id_bytes = hex::decode(&self.id)
            .map_err(|_| Error::CryptoFailure("malformed event id".to_string()))?;
        verify_signature(&pubkey, &id_bytes, &sig)
    }

    /// First value of a tag, e.g. `tag_value("p")`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }
}

// ============================================================================
// ONE-SHOT AEAD (random nonce, prepended)
// ============================================================================

fn derive_wrap_key(local: &NoiseKeyPair, remote_public: &[u8; 32], domain: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let shared = Zeroizing::new(local.diffie_hellman(remote_public));
    let hk = Hkdf::<Sha256>::new(None, shared.as_ref());
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(domain, key.as_mut())
        .map_err(|_| Error::CryptoFailure("wrap key derivation failed".to_string()))?;
    Ok(key)
}

fn aead_seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &[],
            },
        )
        .map_err(|_| Error::CryptoFailure("wrap encryption failed".to_string()))?;
    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn aead_open(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 12 {
        return Err(Error::CryptoFailure("wrapped data too short".to_string()));
    }
    let (nonce, ciphertext) = data.split_at(12);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &[],
            },
        )
        .map_err(|_| Error::CryptoFailure("wrap authentication failed".to_string()))
}

// ============================================================================
// GIFT WRAP
// ============================================================================

/// Wrap a payload for a recipient.
///
/// The outer event is signed by a per-message ephemeral key; the inner
/// seal authenticates the sender.
pub fn gift_wrap(
    sender: &NostrKeyPair,
    recipient: &NostrPublicKey,
    payload: &[u8],
    created_at: u64,
) -> Result<NostrEvent> {
    // Seal: sender → recipient
    let seal_key = derive_wrap_key(sender.encryption(), &recipient.encryption, SEAL_DOMAIN)?;
    let sealed_payload = aead_seal(&seal_key, payload)?;
    let seal = NostrEvent::build(
        sender.signing(),
        KIND_SEAL,
        vec![vec![
            "enc".to_string(),
            hex::encode(sender.encryption().public_bytes()),
        ]],
        hex::encode(sealed_payload),
        created_at,
    )?;

    // Wrap: ephemeral → recipient
    let ephemeral_signing = SigningKeyPair::generate();
    let ephemeral_encryption = NoiseKeyPair::generate();
    let wrap_key = derive_wrap_key(&ephemeral_encryption, &recipient.encryption, WRAP_DOMAIN)?;
    let seal_json = serde_json::to_vec(&seal)?;
    let wrapped = aead_seal(&wrap_key, &seal_json)?;

    let mut content = Vec::with_capacity(32 + wrapped.len());
    content.extend_from_slice(&ephemeral_encryption.public_bytes());
    content.extend_from_slice(&wrapped);

    NostrEvent::build(
        &ephemeral_signing,
        KIND_GIFT_WRAP,
        vec![vec!["p".to_string(), hex::encode(recipient.signing)]],
        hex::encode(content),
        created_at,
    )
}

/// Open a gift wrap addressed to us.
///
/// Returns the sender's Nostr public keys and the payload.
pub fn gift_unwrap(
    recipient: &NostrKeyPair,
    event: &NostrEvent,
) -> Result<(NostrPublicKey, Vec<u8>)> {
    if event.kind != KIND_GIFT_WRAP {
        return Err(Error::CryptoFailure(format!(
            "not a gift wrap: kind {}",
            event.kind
        )));
    }
    event.verify()?;

    let our_tag = hex::encode(recipient.public().signing);
    if event.tag_value("p") != Some(our_tag.as_str()) {
        return Err(Error::CryptoFailure("gift wrap not addressed to us".to_string()));
    }

    let content = hex::decode(&event.content)
        .map_err(|_| Error::CryptoFailure("malformed wrap content".to_string()))?;
    if content.len() < 32 {
        return Err(Error::CryptoFailure("wrap content too short".to_string()));
    }
    let ephemeral_public: [u8; 32] = content[..32].try_into().expect("32 bytes");
    let wrap_key = derive_wrap_key(recipient.encryption(), &ephemeral_public, WRAP_DOMAIN)?;
    let seal_json = aead_open(&wrap_key, &content[32..])?;
    let seal: NostrEvent = serde_json::from_slice(&seal_json)?;

    if seal.kind != KIND_SEAL {
        return Err(Error::CryptoFailure(format!(
            "not a seal: kind {}",
            seal.kind
        )));
    }
    seal.verify()?;

    let sender_signing: [u8; 32] = hex::decode(&seal.pubkey)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::CryptoFailure("malformed seal pubkey".to_string()))?;
    let sender_encryption: [u8; 32] = seal
        .tag_value("enc")
        .and_then(|v| hex::decode(v).ok())
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::CryptoFailure("seal missing encryption key".to_string()))?;

    let seal_key = derive_wrap_key(recipient.encryption(), &sender_encryption, SEAL_DOMAIN)?;
    let sealed_payload = hex::decode(&seal.content)
        .map_err(|_| Error::CryptoFailure("malformed seal content".to_string()))?;
    let payload = aead_open(&seal_key, &sealed_payload)?;

    Ok((
        NostrPublicKey {
            signing: sender_signing,
            encryption: sender_encryption,
        },
        payload,
    ))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn nostr_pair() -> NostrKeyPair {
        let noise = NoiseKeyPair::generate();
        NostrKeyPair::derive(&noise.secret_bytes()).unwrap()
    }

    #[test]
    fn test_event_build_and_verify() {
        let signing = SigningKeyPair::generate();
        let event = NostrEvent::build(
            &signing,
            1,
            vec![vec!["t".to_string(), "mesh".to_string()]],
            "hello".to_string(),
            1_733_251_200,
        )
        .unwrap();

        assert_eq!(event.id.len(), 64);
        event.verify().unwrap();
        assert_eq!(event.tag_value("t"), Some("mesh"));
        assert_eq!(event.tag_value("missing"), None);
    }

    #[test]
    fn test_tampered_event_fails_verification() {
        let signing = SigningKeyPair::generate();
        let mut event =
            NostrEvent::build(&signing, 1, vec![], "original".to_string(), 1000).unwrap();

        event.content = "tampered".to_string();
        assert!(event.verify().is_err());

        // Re-fixing the id alone is not enough: the signature no longer matches
        event.id = event.compute_id();
        assert!(event.verify().is_err());
    }

    #[test]
    fn test_gift_wrap_round_trip() {
        let alice = nostr_pair();
        let bob = nostr_pair();

        let wrapped = gift_wrap(&alice, &bob.public(), b"meet at dawn", 1_733_251_200).unwrap();
        assert_eq!(wrapped.kind, KIND_GIFT_WRAP);
        // The outer event is not signed by Alice's Nostr key
        assert_ne!(wrapped.pubkey, hex::encode(alice.public().signing));

        let (sender, payload) = gift_unwrap(&bob, &wrapped).unwrap();
        assert_eq!(payload, b"meet at dawn");
        assert_eq!(sender, alice.public());
    }

    #[test]
    fn test_gift_wrap_is_recipient_bound() {
        let alice = nostr_pair();
        let bob = nostr_pair();
        let carol = nostr_pair();

        let wrapped = gift_wrap(&alice, &bob.public(), b"for bob only", 1000).unwrap();
        assert!(gift_unwrap(&carol, &wrapped).is_err());
    }

    #[test]
    fn test_gift_wrap_fresh_ephemeral_per_message() {
        let alice = nostr_pair();
        let bob = nostr_pair();

        let a = gift_wrap(&alice, &bob.public(), b"one", 1000).unwrap();
        let b = gift_wrap(&alice, &bob.public(), b"one", 1000).unwrap();
        assert_ne!(a.pubkey, b.pubkey);
        assert_ne!(a.content, b.content);
    }

    #[test]
    fn test_tampered_wrap_rejected() {
        let alice = nostr_pair();
        let bob = nostr_pair();

        let mut wrapped = gift_wrap(&alice, &bob.public(), b"payload", 1000).unwrap();
        // Corrupt one hex digit of the content, then re-id and re-check
        let mut content = wrapped.content.clone().into_bytes();
        let last = content.len() - 1;
        content[last] = if content[last] == b'0' { b'1' } else { b'0' };
        wrapped.content = String::from_utf8(content).unwrap();

        assert!(gift_unwrap(&bob, &wrapped).is_err());
    }
}
