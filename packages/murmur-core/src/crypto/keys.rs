//! # Key Material
//!
//! Identity key pairs and derived material:
//!
//! - **Noise static key** (Curve25519) - all handshake scalar-mults
//! - **Signing key** (Ed25519) - packet signatures
//! - **Nostr key pair** - derived deterministically from the Noise static
//!   secret, so the same identity always maps to the same Nostr identity
//!
//! The fingerprint is SHA-256 of the Noise static public key, rendered as
//! uppercase hex with bytes separated by `:`. The 8-byte short peer id is
//! the head of the same hash.
//!
//! Private keys never leave the process; every secret-bearing type is
//! zeroized on drop.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::protocol::PeerId;

/// Domain separation strings for key derivation
pub mod domain {
    /// Seed hash input for the Nostr identity
    pub const NOSTR_SEED: &[u8] = b"nostr-key-derivation";
    /// Nostr signing key expansion
    pub const NOSTR_SIGNING: &[u8] = b"murmur-nostr-signing-v1";
    /// Nostr encryption key expansion
    pub const NOSTR_ENCRYPTION: &[u8] = b"murmur-nostr-encryption-v1";
}

// ============================================================================
// NOISE STATIC KEY PAIR (Curve25519)
// ============================================================================

/// Curve25519 key pair used as the Noise static identity.
#[derive(ZeroizeOnDrop)]
pub struct NoiseKeyPair {
    #[zeroize(skip)] // StaticSecret zeroizes itself on drop
    secret: StaticSecret,
    #[zeroize(skip)]
    public: X25519PublicKey,
}

impl NoiseKeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore from raw secret bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let secret = StaticSecret::from(*bytes);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Secret scalar bytes, for the collaborator's secure store only.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Public key bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// X25519 scalar multiplication with a remote public key.
    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let their_public = X25519PublicKey::from(*their_public);
        self.secret.diffie_hellman(&their_public).to_bytes()
    }
}

// ============================================================================
// SIGNING KEY PAIR (Ed25519)
// ============================================================================

/// Ed25519 signing key pair.
#[derive(ZeroizeOnDrop)]
pub struct SigningKeyPair {
    #[zeroize(skip)] // SigningKey zeroizes itself on drop
    secret: SigningKey,
}

impl SigningKeyPair {
    /// Generate a fresh random signing pair.
    pub fn generate() -> Self {
        Self {
            secret: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore from raw secret bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            secret: SigningKey::from_bytes(bytes),
        }
    }

    /// Secret key bytes, for the collaborator's secure store only.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Public key bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.secret.verifying_key().to_bytes()
    }

    /// Sign a byte string, producing a 64-byte detached signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.secret.sign(message).to_bytes()
    }
}

/// Verify a detached Ed25519 signature.
pub fn verify_signature(public: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> Result<()> {
    let key = VerifyingKey::from_bytes(public)
        .map_err(|e| Error::CryptoFailure(format!("invalid verifying key: {}", e)))?;
    let signature = Signature::from_bytes(signature);
    key.verify(message, &signature)
        .map_err(|_| Error::CryptoFailure("signature verification failed".to_string()))
}

// ============================================================================
// FINGERPRINTS & SHORT IDS
// ============================================================================

/// Fingerprint of a Noise static public key: uppercase hex of its SHA-256,
/// bytes joined with `:`.
pub fn fingerprint(public: &[u8; 32]) -> String {
    let digest = Sha256::digest(public);
    digest
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Short 8-byte peer id: the head of SHA-256 of the static public key.
pub fn peer_id_from_public(public: &[u8; 32]) -> PeerId {
    let digest = Sha256::digest(public);
    PeerId::new(digest[..8].try_into().expect("8 bytes"))
}

// ============================================================================
// NOSTR KEY PAIR
// ============================================================================

/// Public half of a Nostr identity, shareable via favorites exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NostrPublicKey {
    /// Ed25519 key that signs seals
    pub signing: [u8; 32],
    /// X25519 key that gift wraps encrypt to
    pub encryption: [u8; 32],
}

/// Nostr identity derived from the Noise static secret.
///
/// Derivation is pure: `seed = SHA-256(static_secret || "nostr-key-derivation")`,
/// then HKDF expansion under distinct domain strings for the signing and
/// encryption halves. The same static identity always yields the same Nostr
/// identity.
#[derive(ZeroizeOnDrop)]
pub struct NostrKeyPair {
    #[zeroize(skip)]
    signing: SigningKeyPair,
    #[zeroize(skip)]
    encryption: NoiseKeyPair,
}

impl NostrKeyPair {
    /// Derive from the Noise static secret.
    pub fn derive(static_secret: &[u8; 32]) -> Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update(static_secret);
        hasher.update(domain::NOSTR_SEED);
        let mut seed: [u8; 32] = hasher.finalize().into();

        let hkdf = Hkdf::<Sha256>::new(None, &seed);
        let mut signing = [0u8; 32];
        hkdf.expand(domain::NOSTR_SIGNING, &mut signing)
            .map_err(|_| Error::CryptoFailure("nostr signing derivation failed".to_string()))?;
        let mut encryption = [0u8; 32];
        hkdf.expand(domain::NOSTR_ENCRYPTION, &mut encryption)
            .map_err(|_| Error::CryptoFailure("nostr encryption derivation failed".to_string()))?;

        let pair = Self {
            signing: SigningKeyPair::from_bytes(&signing),
            encryption: NoiseKeyPair::from_bytes(&encryption),
        };
        seed.zeroize();
        signing.zeroize();
        encryption.zeroize();
        Ok(pair)
    }

    /// The signing half.
    pub fn signing(&self) -> &SigningKeyPair {
        &self.signing
    }

    /// The encryption half.
    pub fn encryption(&self) -> &NoiseKeyPair {
        &self.encryption
    }

    /// The shareable public keys.
    pub fn public(&self) -> NostrPublicKey {
        NostrPublicKey {
            signing: self.signing.public_bytes(),
            encryption: self.encryption.public_bytes(),
        }
    }
}

// ============================================================================
// IDENTITY
// ============================================================================

/// Opaque persisted form of an identity.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct IdentityRecord {
    noise_secret: [u8; 32],
    signing_secret: [u8; 32],
    #[zeroize(skip)]
    nickname: String,
}

/// A complete local identity: Noise static pair, signing pair, derived
/// Nostr pair, and a nickname.
pub struct Identity {
    noise: NoiseKeyPair,
    signing: SigningKeyPair,
    nostr: NostrKeyPair,
    nickname: String,
}

impl Identity {
    /// Generate a fresh identity.
    pub fn generate(nickname: impl Into<String>) -> Result<Self> {
        let noise = NoiseKeyPair::generate();
        let nostr = NostrKeyPair::derive(&noise.secret_bytes())?;
        Ok(Self {
            noise,
            signing: SigningKeyPair::generate(),
            nostr,
            nickname: nickname.into(),
        })
    }

    /// Serialize to an opaque blob for the collaborator's secure store.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let record = IdentityRecord {
            noise_secret: self.noise.secret_bytes(),
            signing_secret: self.signing.secret_bytes(),
            nickname: self.nickname.clone(),
        };
        Ok(bincode::serialize(&record)?)
    }

    /// Restore from the opaque blob.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let record: IdentityRecord = bincode::deserialize(bytes)?;
        let noise = NoiseKeyPair::from_bytes(&record.noise_secret);
        let nostr = NostrKeyPair::derive(&record.noise_secret)?;
        Ok(Self {
            noise,
            signing: SigningKeyPair::from_bytes(&record.signing_secret),
            nostr,
            nickname: record.nickname.clone(),
        })
    }

    /// The Noise static key pair.
    pub fn noise(&self) -> &NoiseKeyPair {
        &self.noise
    }

    /// The Ed25519 signing pair.
    pub fn signing(&self) -> &SigningKeyPair {
        &self.signing
    }

    /// The derived Nostr identity.
    pub fn nostr(&self) -> &NostrKeyPair {
        &self.nostr
    }

    /// Display nickname.
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Fingerprint of the static public key.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.noise.public_bytes())
    }

    /// Short wire id.
    pub fn peer_id(&self) -> PeerId {
        peer_id_from_public(&self.noise.public_bytes())
    }
}

// ============================================================================
// TESTS
// ============================================================================
