//! Cipher state and symmetric state for the Noise protocol.
//!
//! [`CipherState`] is one direction of an established channel: a 32-byte
//! ChaCha20-Poly1305 key plus a monotonically increasing 64-bit counter
//! encoded into the 96-bit AEAD nonce (low 64 bits little-endian, high 32
//! bits zero). The counter resets to 0 whenever a key is installed and
//! increases by exactly one per successful encryption or decryption; an
//! authentication failure leaves it unchanged.
//!
//! [`SymmetricState`] layers the handshake transcript on top: the chaining
//! key `ck`, the handshake hash `h`, and an inner cipher for the encrypted
//! handshake tokens. HKDF is HMAC-SHA-256 extract-then-expand producing two
//! or three 32-byte outputs.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// AEAD key length.
pub const KEY_LEN: usize = 32;

/// AEAD nonce length (96 bits).
pub const NONCE_LEN: usize = 12;

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

// ============================================================================
// CIPHER STATE
// ============================================================================

/// One directional AEAD cipher with a counter nonce.
pub struct CipherState {
    key: Option<Zeroizing<[u8; KEY_LEN]>>,
    nonce: u64,
}

impl CipherState {
    /// An empty cipher state with no key installed.
    pub fn new() -> Self {
        Self { key: None, nonce: 0 }
    }

    /// Install a key and reset the counter to zero.
    pub fn initialize_key(&mut self, key: [u8; KEY_LEN]) {
        self.key = Some(Zeroizing::new(key));
        self.nonce = 0;
    }

    /// Whether a key has been installed.
    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Current nonce counter value.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    fn nonce_bytes(&self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[4..].copy_from_slice(&self.nonce.to_le_bytes());
        nonce
    }

    /// Encrypt `plaintext` under the current nonce with `ad` authenticated.
    /// Returns ciphertext || tag and advances the counter.
    pub fn encrypt(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| Error::CryptoFailure("encrypt without key".to_string()))?;
        if self.nonce == u64::MAX {
            return Err(Error::CryptoFailure("nonce space exhausted".to_string()));
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
        let nonce_bytes = self.nonce_bytes();
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: ad,
                },
            )
            .map_err(|_| Error::CryptoFailure("AEAD encryption failed".to_string()))?;
        self.nonce += 1;
        Ok(ciphertext)
    }

    /// Decrypt `ciphertext` under the current nonce. The counter only
    /// advances on success; an authentication failure leaves it unchanged.
    pub fn decrypt(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| Error::CryptoFailure("decrypt without key".to_string()))?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
        let nonce_bytes = self.nonce_bytes();
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: ad,
                },
            )
            .map_err(|_| Error::CryptoFailure("AEAD authentication failed".to_string()))?;
        self.nonce += 1;
        Ok(plaintext)
    }
}

impl Default for CipherState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// NOISE HKDF
// ============================================================================

/// HKDF with two 32-byte outputs: `HMAC(ck, ikm)` extract, counter expand.
pub fn hkdf2(chaining_key: &[u8; 32], ikm: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    let hk = Hkdf::<Sha256>::new(Some(chaining_key), ikm);
    let mut okm = Zeroizing::new([0u8; 64]);
    hk.expand(&[], okm.as_mut())
        .map_err(|_| Error::CryptoFailure("HKDF expansion failed".to_string()))?;
    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    a.copy_from_slice(&okm[..32]);
    b.copy_from_slice(&okm[32..]);
    Ok((a, b))
}

/// HKDF with three 32-byte outputs.
pub fn hkdf3(chaining_key: &[u8; 32], ikm: &[u8]) -> Result<([u8; 32], [u8; 32], [u8; 32])> {
    let hk = Hkdf::<Sha256>::new(Some(chaining_key), ikm);
    let mut okm = Zeroizing::new([0u8; 96]);
    hk.expand(&[], okm.as_mut())
        .map_err(|_| Error::CryptoFailure("HKDF expansion failed".to_string()))?;
    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    let mut c = [0u8; 32];
    a.copy_from_slice(&okm[..32]);
    b.copy_from_slice(&okm[32..64]);
    c.copy_from_slice(&okm[64..]);
    Ok((a, b, c))
}

// ============================================================================
// SYMMETRIC STATE
// ============================================================================

/// Handshake transcript state: chaining key, handshake hash, inner cipher.
pub struct SymmetricState {
    chaining_key: Zeroizing<[u8; 32]>,
    hash: [u8; 32],
    cipher: CipherState,
}

impl SymmetricState {
    /// Initialize from a protocol name. Names up to 32 bytes are
    /// zero-padded into `h` directly; longer names are hashed.
    pub fn new(protocol_name: &[u8]) -> Self {
        let hash: [u8; 32] = if protocol_name.len() <= 32 {
            let mut h = [0u8; 32];
            h[..protocol_name.len()].copy_from_slice(protocol_name);
            h
        } else {
            Sha256::digest(protocol_name).into()
        };
        Self {
            chaining_key: Zeroizing::new(hash),
            hash,
            cipher: CipherState::new(),
        }
    }

    /// The running handshake hash.
    pub fn handshake_hash(&self) -> [u8; 32] {
        self.hash
    }

    /// Whether the inner cipher has a key (tokens are encrypted from here on).
    pub fn has_key(&self) -> bool {
        self.cipher.has_key()
    }

    /// `h = SHA-256(h || data)`
    pub fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.hash);
        hasher.update(data);
        self.hash = hasher.finalize().into();
    }

    /// `(ck, temp_k) = HKDF(ck, ikm)`; install `temp_k`.
    pub fn mix_key(&mut self, ikm: &[u8]) -> Result<()> {
        let (chaining_key, temp_key) = hkdf2(&self.chaining_key, ikm)?;
        *self.chaining_key = chaining_key;
        self.cipher.initialize_key(temp_key);
        Ok(())
    }

    /// `(ck, temp_h, temp_k) = HKDF(ck, ikm)`; mix `temp_h` into the hash
    /// and install `temp_k`.
    pub fn mix_key_and_hash(&mut self, ikm: &[u8]) -> Result<()> {
        let (chaining_key, temp_hash, temp_key) = hkdf3(&self.chaining_key, ikm)?;
        *self.chaining_key = chaining_key;
        self.mix_hash(&temp_hash);
        self.cipher.initialize_key(temp_key);
        Ok(())
    }

    /// Encrypt with the handshake hash as AD, then mix the ciphertext into
    /// the hash. Before any key is installed this passes plaintext through.
    pub fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let out = if self.cipher.has_key() {
            self.cipher.encrypt(&self.hash, plaintext)?
        } else {
            plaintext.to_vec()
        };
        self.mix_hash(&out);
        Ok(out)
    }

    /// Inverse of [`SymmetricState::encrypt_and_hash`].
    pub fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let out = if self.cipher.has_key() {
            self.cipher.decrypt(&self.hash, ciphertext)?
        } else {
            ciphertext.to_vec()
        };
        self.mix_hash(ciphertext);
        Ok(out)
    }

    /// Derive the two transport ciphers from the final chaining key.
    pub fn split(&self) -> Result<(CipherState, CipherState)> {
        let (k1, k2) = hkdf2(&self.chaining_key, &[])?;
        let mut c1 = CipherState::new();
        c1.initialize_key(k1);
        let mut c2 = CipherState::new();
        c2.initialize_key(k2);
        Ok((c1, c2))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed_cipher(key_byte: u8) -> CipherState {
        let mut cipher = CipherState::new();
        cipher.initialize_key([key_byte; 32]);
        cipher
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let mut tx = keyed_cipher(7);
        let mut rx = keyed_cipher(7);

        for i in 0..5u8 {
            let plaintext = vec![i; 20];
            let ciphertext = tx.encrypt(b"ad", &plaintext).unwrap();
            assert_eq!(ciphertext.len(), plaintext.len() + TAG_LEN);
            assert_eq!(rx.decrypt(b"ad", &ciphertext).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_nonce_is_monotonic_from_zero() {
        let mut cipher = keyed_cipher(1);
        assert_eq!(cipher.nonce(), 0);
        cipher.encrypt(&[], b"a").unwrap();
        assert_eq!(cipher.nonce(), 1);
        cipher.encrypt(&[], b"b").unwrap();
        assert_eq!(cipher.nonce(), 2);

        // Key install resets the counter
        cipher.initialize_key([2u8; 32]);
        assert_eq!(cipher.nonce(), 0);
    }

    #[test]
    fn test_tampered_ciphertext_fails_without_advancing() {
        let mut tx = keyed_cipher(3);
        let mut rx = keyed_cipher(3);

        let mut ciphertext = tx.encrypt(&[], b"payload").unwrap();
        ciphertext[0] ^= 0xFF;
        assert!(matches!(
            rx.decrypt(&[], &ciphertext),
            Err(Error::CryptoFailure(_))
        ));
        assert_eq!(rx.nonce(), 0);

        // Untampered retry still succeeds at nonce 0
        let good = {
            let mut tx2 = keyed_cipher(3);
            tx2.encrypt(&[], b"payload").unwrap()
        };
        assert_eq!(rx.decrypt(&[], &good).unwrap(), b"payload");
        assert_eq!(rx.nonce(), 1);
    }

    #[test]
    fn test_wrong_ad_fails() {
        let mut tx = keyed_cipher(4);
        let mut rx = keyed_cipher(4);
        let ciphertext = tx.encrypt(b"right", b"msg").unwrap();
        assert!(rx.decrypt(b"wrong", &ciphertext).is_err());
    }

    #[test]
    fn test_encrypt_without_key_fails() {
        let mut cipher = CipherState::new();
        assert!(cipher.encrypt(&[], b"x").is_err());
        assert!(cipher.decrypt(&[], b"x").is_err());
    }

    #[test]
    fn test_protocol_name_padding() {
        // The full protocol name fills h exactly, no hashing
        let name = b"Noise_XX_25519_ChaChaPoly_SHA256";
        assert_eq!(name.len(), 32);
        let state = SymmetricState::new(name);
        assert_eq!(&state.handshake_hash()[..32], &name[..]);

        let short = SymmetricState::new(b"short");
        assert_eq!(&short.handshake_hash()[..5], b"short");
        assert_eq!(&short.handshake_hash()[5..], &[0u8; 27][..]);

        let long = SymmetricState::new(&[b'x'; 40]);
        let expected: [u8; 32] = Sha256::digest([b'x'; 40]).into();
        assert_eq!(long.handshake_hash(), expected);
    }

    #[test]
    fn test_symmetric_states_stay_in_step() {
        let mut alice = SymmetricState::new(b"test-protocol");
        let mut bob = SymmetricState::new(b"test-protocol");

        alice.mix_hash(b"e.pub");
        bob.mix_hash(b"e.pub");
        alice.mix_key(b"dh-output").unwrap();
        bob.mix_key(b"dh-output").unwrap();

        let ciphertext = alice.encrypt_and_hash(b"static key").unwrap();
        let plaintext = bob.decrypt_and_hash(&ciphertext).unwrap();
        assert_eq!(plaintext, b"static key");
        assert_eq!(alice.handshake_hash(), bob.handshake_hash());
    }

    #[test]
    fn test_passthrough_before_key() {
        let mut state = SymmetricState::new(b"test-protocol");
        assert!(!state.has_key());
        let out = state.encrypt_and_hash(b"clear").unwrap();
        assert_eq!(out, b"clear");
    }

    #[test]
    fn test_split_produces_distinct_keyed_ciphers() {
        let mut state = SymmetricState::new(b"test-protocol");
        state.mix_key(b"ikm").unwrap();
        let (mut c1, mut c2) = state.split().unwrap();
        assert!(c1.has_key() && c2.has_key());
        assert_eq!(c1.nonce(), 0);
        assert_eq!(c2.nonce(), 0);

        // Distinct keys: c2 cannot decrypt what c1 encrypted
        let ciphertext = c1.encrypt(&[], b"hello").unwrap();
        assert!(c2.decrypt(&[], &ciphertext).is_err());
    }

    #[test]
    fn test_mix_key_and_hash_changes_both() {
        let mut a = SymmetricState::new(b"p");
        let mut b = SymmetricState::new(b"p");
        let before = a.handshake_hash();
        a.mix_key_and_hash(b"psk").unwrap();
        b.mix_key_and_hash(b"psk").unwrap();
        assert_ne!(a.handshake_hash(), before);
        assert_eq!(a.handshake_hash(), b.handshake_hash());
    }

    #[test]
    fn test_hkdf_outputs_differ() {
        let ck = [9u8; 32];
        let (a, b) = hkdf2(&ck, b"ikm").unwrap();
        assert_ne!(a, b);
        let (x, y, z) = hkdf3(&ck, b"ikm").unwrap();
        assert_eq!(x, a);
        assert_eq!(y, b);
        assert_ne!(z, x);
        assert_ne!(z, y);
    }
}
