//! Noise XX handshake state machine.
//!
//! Pattern `Noise_XX_25519_ChaChaPoly_SHA256`, three messages:
//!
//! ```text
//! -> e
//! <- e, ee, s, es
//! -> s, se
//! ```
//!
//! Both static keys are exchanged under encryption, giving mutual
//! authentication with identity hiding against passive observers. After
//! message 3 both sides call `split()`; the initiator sends on the first
//! cipher and receives on the second, the responder mirrors. The final
//! handshake hash is retained as channel-binding material.
//!
//! The state machine is rejective: reading or writing out of turn fails
//! with `UnexpectedHandshakeMessage`, and a completed or failed handshake
//! refuses all further operations.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, ReusableSecret};
use zeroize::Zeroizing;

use crate::crypto::cipher::{CipherState, SymmetricState, TAG_LEN};
use crate::crypto::keys::NoiseKeyPair;
use crate::error::{Error, Result};

/// The Noise protocol name, mixed into the initial handshake hash.
pub const PROTOCOL_NAME: &[u8] = b"Noise_XX_25519_ChaChaPoly_SHA256";

/// X25519 public key length.
const DH_LEN: usize = 32;

/// Handshake role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends message 1 and message 3
    Initiator,
    /// Sends message 2
    Responder,
}

/// Internal progress marker: which message is expected next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Message1,
    Message2,
    Message3,
    Complete,
    Failed,
}

/// Established channel state produced by a finished handshake.
pub struct TransportState {
    /// Cipher for outbound traffic
    pub send: CipherState,
    /// Cipher for inbound traffic
    pub recv: CipherState,
    /// Final handshake hash (channel binding)
    pub handshake_hash: [u8; 32],
    /// The remote peer's authenticated static public key
    pub remote_static: [u8; 32],
}

/// An in-flight Noise XX handshake.
pub struct HandshakeState {
    symmetric: SymmetricState,
    role: Role,
    phase: Phase,
    local_static_secret: Zeroizing<[u8; 32]>,
    local_static_public: [u8; 32],
    local_ephemeral: Option<ReusableSecret>,
    remote_static: Option<[u8; 32]>,
    remote_ephemeral: Option<[u8; 32]>,
}

impl HandshakeState {
    /// Begin as the initiator.
    pub fn new_initiator(local_static: &NoiseKeyPair) -> Self {
        Self::new(local_static, Role::Initiator)
    }

    /// Begin as the responder.
    pub fn new_responder(local_static: &NoiseKeyPair) -> Self {
        Self::new(local_static, Role::Responder)
    }

    fn new(local_static: &NoiseKeyPair, role: Role) -> Self {
        let mut symmetric = SymmetricState::new(PROTOCOL_NAME);
        // Empty prologue
        symmetric.mix_hash(&[]);
        Self {
            symmetric,
            role,
            phase: Phase::Message1,
            local_static_secret: Zeroizing::new(local_static.secret_bytes()),
            local_static_public: local_static.public_bytes(),
            local_ephemeral: None,
            remote_static: None,
            remote_ephemeral: None,
        }
    }

    /// This handshake's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether all three messages have been processed.
    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }

    /// The remote static key, available once it has been received.
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        self.remote_static
    }

    fn dh_static(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let secret = x25519_dalek::StaticSecret::from(*self.local_static_secret);
        secret
            .diffie_hellman(&X25519PublicKey::from(*their_public))
            .to_bytes()
    }

    fn dh_ephemeral(&self, their_public: &[u8; 32]) -> Result<[u8; 32]> {
        let ephemeral = self
            .local_ephemeral
            .as_ref()
            .ok_or_else(|| Error::CryptoFailure("ephemeral key missing".to_string()))?;
        Ok(ephemeral
            .diffie_hellman(&X25519PublicKey::from(*their_public))
            .to_bytes())
    }

    fn expect(&mut self, phase: Phase, writing: bool) -> Result<()> {
        let our_turn = match (self.role, phase) {
            (Role::Initiator, Phase::Message1) => writing,
            (Role::Initiator, Phase::Message2) => !writing,
            (Role::Initiator, Phase::Message3) => writing,
            (Role::Responder, Phase::Message1) => !writing,
            (Role::Responder, Phase::Message2) => writing,
            (Role::Responder, Phase::Message3) => !writing,
            _ => false,
        };
        if self.phase != phase || !our_turn {
            self.phase = Phase::Failed;
            return Err(Error::UnexpectedHandshakeMessage);
        }
        Ok(())
    }

    fn fail<T>(&mut self, err: Error) -> Result<T> {
        self.phase = Phase::Failed;
        Err(err)
    }

    // ── Message 1: -> e ──────────────────────────────────────────────────────

    /// Initiator writes message 1.
    pub fn write_message_1(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.expect(Phase::Message1, true)?;

        let ephemeral = ReusableSecret::random_from_rng(OsRng);
        let ephemeral_public = X25519PublicKey::from(&ephemeral).to_bytes();
        self.local_ephemeral = Some(ephemeral);
        self.symmetric.mix_hash(&ephemeral_public);

        let mut out = Vec::with_capacity(DH_LEN + payload.len());
        out.extend_from_slice(&ephemeral_public);
        let encrypted = self.symmetric.encrypt_and_hash(payload)?;
        out.extend_from_slice(&encrypted);

        self.phase = Phase::Message2;
        Ok(out)
    }

    /// Responder reads message 1.
    pub fn read_message_1(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        self.expect(Phase::Message1, false)?;

        if message.len() < DH_LEN {
            return self.fail(Error::CryptoFailure(
                "handshake message 1 too short".to_string(),
            ));
        }
        let remote_ephemeral: [u8; 32] = message[..DH_LEN].try_into().expect("32 bytes");
        self.remote_ephemeral = Some(remote_ephemeral);
        self.symmetric.mix_hash(&remote_ephemeral);

        let payload = self.symmetric.decrypt_and_hash(&message[DH_LEN..])?;

        self.phase = Phase::Message2;
        Ok(payload)
    }

    // ── Message 2: <- e, ee, s, es ───────────────────────────────────────────

    /// Responder writes message 2.
    pub fn write_message_2(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.expect(Phase::Message2, true)?;

        let remote_ephemeral = match self.remote_ephemeral {
            Some(key) => key,
            None => return self.fail(Error::UnexpectedHandshakeMessage),
        };

        // e
        let ephemeral = ReusableSecret::random_from_rng(OsRng);
        let ephemeral_public = X25519PublicKey::from(&ephemeral).to_bytes();
        self.local_ephemeral = Some(ephemeral);
        self.symmetric.mix_hash(&ephemeral_public);

        // ee
        let dh = self.dh_ephemeral(&remote_ephemeral)?;
        self.symmetric.mix_key(&dh)?;

        // s (encrypted under the current cipher)
        let local_static_public = self.local_static_public;
        let encrypted_static = match self.symmetric.encrypt_and_hash(&local_static_public) {
            Ok(ct) => ct,
            Err(e) => return self.fail(e),
        };

        // es: responder's static with initiator's ephemeral
        let dh = self.dh_static(&remote_ephemeral);
        self.symmetric.mix_key(&dh)?;

        let encrypted_payload = match self.symmetric.encrypt_and_hash(payload) {
            Ok(ct) => ct,
            Err(e) => return self.fail(e),
        };

        let mut out =
            Vec::with_capacity(DH_LEN + encrypted_static.len() + encrypted_payload.len());
        out.extend_from_slice(&ephemeral_public);
        out.extend_from_slice(&encrypted_static);
        out.extend_from_slice(&encrypted_payload);

        self.phase = Phase::Message3;
        Ok(out)
    }

    /// Initiator reads message 2.
    pub fn read_message_2(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        self.expect(Phase::Message2, false)?;

        if message.len() < DH_LEN + DH_LEN + TAG_LEN + TAG_LEN {
            return self.fail(Error::CryptoFailure(
                "handshake message 2 too short".to_string(),
            ));
        }

        // e
        let remote_ephemeral: [u8; 32] = message[..DH_LEN].try_into().expect("32 bytes");
        self.remote_ephemeral = Some(remote_ephemeral);
        self.symmetric.mix_hash(&remote_ephemeral);

        // ee
        let dh = self.dh_ephemeral(&remote_ephemeral)?;
        self.symmetric.mix_key(&dh)?;

        // s
        let encrypted_static = &message[DH_LEN..DH_LEN + DH_LEN + TAG_LEN];
        let remote_static_bytes = match self.symmetric.decrypt_and_hash(encrypted_static) {
            Ok(pt) => pt,
            Err(e) => return self.fail(e),
        };
        let remote_static: [u8; 32] = match remote_static_bytes.as_slice().try_into() {
            Ok(key) => key,
            Err(_) => {
                return self.fail(Error::CryptoFailure(
                    "remote static key has wrong length".to_string(),
                ))
            }
        };
        self.remote_static = Some(remote_static);

        // es: initiator's ephemeral with responder's static
        let dh = self.dh_ephemeral(&remote_static)?;
        self.symmetric.mix_key(&dh)?;

        let payload = match self
            .symmetric
            .decrypt_and_hash(&message[DH_LEN + DH_LEN + TAG_LEN..])
        {
            Ok(pt) => pt,
            Err(e) => return self.fail(e),
        };

        self.phase = Phase::Message3;
        Ok(payload)
    }

    // ── Message 3: -> s, se ──────────────────────────────────────────────────

    /// Initiator writes message 3. The handshake completes on success.
    pub fn write_message_3(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.expect(Phase::Message3, true)?;

        let remote_ephemeral = match self.remote_ephemeral {
            Some(key) => key,
            None => return self.fail(Error::UnexpectedHandshakeMessage),
        };

        // s
        let local_static_public = self.local_static_public;
        let encrypted_static = match self.symmetric.encrypt_and_hash(&local_static_public) {
            Ok(ct) => ct,
            Err(e) => return self.fail(e),
        };

        // se: initiator's static with responder's ephemeral
        let dh = self.dh_static(&remote_ephemeral);
        self.symmetric.mix_key(&dh)?;

        let encrypted_payload = match self.symmetric.encrypt_and_hash(payload) {
            Ok(ct) => ct,
            Err(e) => return self.fail(e),
        };

        let mut out = Vec::with_capacity(encrypted_static.len() + encrypted_payload.len());
        out.extend_from_slice(&encrypted_static);
        out.extend_from_slice(&encrypted_payload);

        self.phase = Phase::Complete;
        Ok(out)
    }

    /// Responder reads message 3. The handshake completes on success.
    pub fn read_message_3(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        self.expect(Phase::Message3, false)?;

        if message.len() < DH_LEN + TAG_LEN + TAG_LEN {
            return self.fail(Error::CryptoFailure(
                "handshake message 3 too short".to_string(),
            ));
        }

        // s
        let encrypted_static = &message[..DH_LEN + TAG_LEN];
        let remote_static_bytes = match self.symmetric.decrypt_and_hash(encrypted_static) {
            Ok(pt) => pt,
            Err(e) => return self.fail(e),
        };
        let remote_static: [u8; 32] = match remote_static_bytes.as_slice().try_into() {
            Ok(key) => key,
            Err(_) => {
                return self.fail(Error::CryptoFailure(
                    "remote static key has wrong length".to_string(),
                ))
            }
        };
        self.remote_static = Some(remote_static);

        // se: responder's ephemeral with initiator's static
        let dh = self.dh_ephemeral(&remote_static)?;
        self.symmetric.mix_key(&dh)?;

        let payload = match self.symmetric.decrypt_and_hash(&message[DH_LEN + TAG_LEN..]) {
            Ok(pt) => pt,
            Err(e) => return self.fail(e),
        };

        self.phase = Phase::Complete;
        Ok(payload)
    }

    /// Consume the finished handshake, producing the transport ciphers.
    ///
    /// The initiator takes the first split cipher for sending; the
    /// responder takes the mirror.
    pub fn into_transport(self) -> Result<TransportState> {
        if self.phase != Phase::Complete {
            return Err(Error::UnexpectedHandshakeMessage);
        }
        let remote_static = self
            .remote_static
            .ok_or_else(|| Error::CryptoFailure("remote static key missing".to_string()))?;

        let (c1, c2) = self.symmetric.split()?;
        let (send, recv) = match self.role {
            Role::Initiator => (c1, c2),
            Role::Responder => (c2, c1),
        };
        Ok(TransportState {
            send,
            recv,
            handshake_hash: self.symmetric.handshake_hash(),
            remote_static,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn run_handshake() -> (TransportState, TransportState) {
        let alice_static = NoiseKeyPair::generate();
        let bob_static = NoiseKeyPair::generate();

        let mut alice = HandshakeState::new_initiator(&alice_static);
        let mut bob = HandshakeState::new_responder(&bob_static);

        let msg1 = alice.write_message_1(&[]).unwrap();
        bob.read_message_1(&msg1).unwrap();

        let msg2 = bob.write_message_2(&[]).unwrap();
        alice.read_message_2(&msg2).unwrap();

        let msg3 = alice.write_message_3(&[]).unwrap();
        bob.read_message_3(&msg3).unwrap();

        assert!(alice.is_complete());
        assert!(bob.is_complete());
        assert_eq!(alice.remote_static(), Some(bob_static.public_bytes()));
        assert_eq!(bob.remote_static(), Some(alice_static.public_bytes()));

        (
            alice.into_transport().unwrap(),
            bob.into_transport().unwrap(),
        )
    }

    #[test]
    fn test_handshake_completes_in_three_messages() {
        let (alice, bob) = run_handshake();
        assert_eq!(alice.handshake_hash, bob.handshake_hash);
    }

    #[test]
    fn test_hello_echo() {
        let (mut alice, mut bob) = run_handshake();

        let ciphertext = alice.send.encrypt(&[], b"Hello, Bob!").unwrap();
        assert_eq!(bob.recv.decrypt(&[], &ciphertext).unwrap(), b"Hello, Bob!");

        let reply = bob.send.encrypt(&[], b"Hello, Alice!").unwrap();
        assert_eq!(alice.recv.decrypt(&[], &reply).unwrap(), b"Hello, Alice!");

        // One message each way: both counters at 1
        assert_eq!(alice.send.nonce(), 1);
        assert_eq!(bob.recv.nonce(), 1);
        assert_eq!(bob.send.nonce(), 1);
        assert_eq!(alice.recv.nonce(), 1);
    }

    #[test]
    fn test_handshake_payloads_survive() {
        let alice_static = NoiseKeyPair::generate();
        let bob_static = NoiseKeyPair::generate();

        let mut alice = HandshakeState::new_initiator(&alice_static);
        let mut bob = HandshakeState::new_responder(&bob_static);

        let msg1 = alice.write_message_1(b"hi from alice").unwrap();
        assert_eq!(bob.read_message_1(&msg1).unwrap(), b"hi from alice");

        let msg2 = bob.write_message_2(b"hi from bob").unwrap();
        assert_eq!(alice.read_message_2(&msg2).unwrap(), b"hi from bob");

        let msg3 = alice.write_message_3(b"done").unwrap();
        assert_eq!(bob.read_message_3(&msg3).unwrap(), b"done");
    }

    #[test]
    fn test_out_of_turn_write_rejected() {
        let static_key = NoiseKeyPair::generate();

        // Responder cannot write message 1
        let mut responder = HandshakeState::new_responder(&static_key);
        assert!(matches!(
            responder.write_message_1(&[]),
            Err(Error::UnexpectedHandshakeMessage)
        ));

        // Initiator cannot write message 2
        let mut initiator = HandshakeState::new_initiator(&static_key);
        initiator.write_message_1(&[]).unwrap();
        assert!(matches!(
            initiator.write_message_2(&[]),
            Err(Error::UnexpectedHandshakeMessage)
        ));
    }

    #[test]
    fn test_completed_state_is_terminal() {
        let alice_static = NoiseKeyPair::generate();
        let bob_static = NoiseKeyPair::generate();

        let mut alice = HandshakeState::new_initiator(&alice_static);
        let mut bob = HandshakeState::new_responder(&bob_static);

        let msg1 = alice.write_message_1(&[]).unwrap();
        bob.read_message_1(&msg1).unwrap();
        let msg2 = bob.write_message_2(&[]).unwrap();
        alice.read_message_2(&msg2).unwrap();
        let msg3 = alice.write_message_3(&[]).unwrap();
        bob.read_message_3(&msg3).unwrap();

        assert!(matches!(
            alice.write_message_1(&[]),
            Err(Error::UnexpectedHandshakeMessage)
        ));
        assert!(matches!(
            bob.read_message_3(&msg3),
            Err(Error::UnexpectedHandshakeMessage)
        ));
    }

    #[test]
    fn test_corrupted_message_2_fails() {
        let alice_static = NoiseKeyPair::generate();
        let bob_static = NoiseKeyPair::generate();

        let mut alice = HandshakeState::new_initiator(&alice_static);
        let mut bob = HandshakeState::new_responder(&bob_static);

        let msg1 = alice.write_message_1(&[]).unwrap();
        bob.read_message_1(&msg1).unwrap();

        let mut msg2 = bob.write_message_2(&[]).unwrap();
        // Flip a bit in the encrypted static key section
        msg2[40] ^= 0x01;
        assert!(matches!(
            alice.read_message_2(&msg2),
            Err(Error::CryptoFailure(_))
        ));

        // Failed handshake refuses further operations
        assert!(matches!(
            alice.write_message_3(&[]),
            Err(Error::UnexpectedHandshakeMessage)
        ));
    }

    #[test]
    fn test_corrupted_message_3_fails() {
        let alice_static = NoiseKeyPair::generate();
        let bob_static = NoiseKeyPair::generate();

        let mut alice = HandshakeState::new_initiator(&alice_static);
        let mut bob = HandshakeState::new_responder(&bob_static);

        let msg1 = alice.write_message_1(&[]).unwrap();
        bob.read_message_1(&msg1).unwrap();
        let msg2 = bob.write_message_2(&[]).unwrap();
        alice.read_message_2(&msg2).unwrap();

        let mut msg3 = alice.write_message_3(&[]).unwrap();
        msg3[10] ^= 0x01;
        assert!(matches!(
            bob.read_message_3(&msg3),
            Err(Error::CryptoFailure(_))
        ));
    }

    #[test]
    fn test_incomplete_handshake_cannot_split() {
        let static_key = NoiseKeyPair::generate();
        let mut alice = HandshakeState::new_initiator(&static_key);
        alice.write_message_1(&[]).unwrap();
        assert!(alice.into_transport().is_err());
    }
}
