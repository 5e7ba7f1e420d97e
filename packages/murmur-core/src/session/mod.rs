//! # Noise Session Manager
//!
//! Per-peer session lifecycle: pending handshakes with deadlines,
//! established transport ciphers with idle expiry, and fingerprint lookup.
//!
//! At most one pending handshake exists per peer. A completed session is
//! terminal until it is closed by idle expiry, a decrypt failure (possible
//! key desync), or an explicit request. Session records are inserted
//! atomically after the final handshake message is processed, so a
//! cancelled task can never leave a half-established session behind.
//!
//! Simultaneous opens are resolved by id order: when both sides initiate,
//! the side with the lower peer id keeps the initiator role and the other
//! side's attempt is abandoned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::crypto::{fingerprint, HandshakeState, NoiseKeyPair, Role, TransportState};
use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventBus, HandshakeFailureReason};
use crate::protocol::{MessageType, PeerId};
use crate::time::now_millis;

/// Deadline for a pending handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle lifetime of an established session.
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Interval of the background sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Externally visible session state for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session and no pending handshake
    None,
    /// A handshake is in flight
    Initiated,
    /// Transport ciphers are established
    Completed,
}

/// Timing knobs, overridable for tests.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            idle_timeout: SESSION_IDLE_TIMEOUT,
        }
    }
}

struct EstablishedSession {
    transport: TransportState,
    fingerprint: String,
    last_activity: u64,
}

struct PendingHandshake {
    state: HandshakeState,
    deadline: Instant,
}

/// Owns all Noise state for the local identity.
pub struct SessionManager {
    local_id: PeerId,
    static_key: NoiseKeyPair,
    sessions: Mutex<HashMap<PeerId, EstablishedSession>>,
    pending: Mutex<HashMap<PeerId, PendingHandshake>>,
    events: EventBus,
    config: SessionConfig,
}

impl SessionManager {
    /// Create a manager around the local static key.
    pub fn new(
        local_id: PeerId,
        static_key: NoiseKeyPair,
        events: EventBus,
        config: SessionConfig,
    ) -> Self {
        Self {
            local_id,
            static_key,
            sessions: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            events,
            config,
        }
    }

    /// Begin a handshake with a peer, returning the first message bytes.
    pub fn initiate(&self, peer: PeerId) -> Result<Vec<u8>> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&peer) {
            return Err(Error::HandshakeInProgress(peer.to_hex()));
        }

        let mut state = HandshakeState::new_initiator(&self.static_key);
        let bytes = state.write_message_1(&[])?;
        pending.insert(
            peer,
            PendingHandshake {
                state,
                deadline: Instant::now() + self.config.handshake_timeout,
            },
        );
        drop(pending);

        tracing::debug!(peer = %peer, "Initiating Noise handshake");
        self.events.emit(CoreEvent::HandshakeMessage {
            peer,
            kind: MessageType::NoiseHandshakeInit,
            bytes: bytes.clone(),
        });
        Ok(bytes)
    }

    /// Feed an inbound handshake message.
    ///
    /// Returns the reply to transmit, if the protocol calls for one.
    pub fn on_inbound(
        &self,
        peer: PeerId,
        kind: MessageType,
        bytes: &[u8],
    ) -> Result<Option<(MessageType, Vec<u8>)>> {
        let mut pending = self.pending.lock();

        match pending.remove(&peer) {
            None => {
                if kind != MessageType::NoiseHandshakeInit {
                    return Err(Error::UnexpectedHandshakeMessage);
                }
                self.respond_to_init(&mut pending, peer, bytes)
            }
            Some(mut entry) => {
                if kind == MessageType::NoiseHandshakeInit
                    && entry.state.role() == Role::Initiator
                {
                    // Simultaneous open: the lower id keeps initiating
                    if peer < self.local_id {
                        tracing::debug!(peer = %peer, "Yielding initiator role to lower peer id");
                        return self.respond_to_init(&mut pending, peer, bytes);
                    }
                    // Keep our attempt; the peer will answer message 1
                    pending.insert(peer, entry);
                    return Ok(None);
                }

                let result = self.advance(&mut entry.state, bytes);
                match result {
                    Ok(reply) => {
                        if entry.state.is_complete() {
                            drop(pending);
                            self.install(peer, entry.state)?;
                        } else {
                            pending.insert(peer, entry);
                        }
                        Ok(reply)
                    }
                    Err(err) => {
                        drop(pending);
                        self.fail_handshake(peer, &err);
                        Err(err)
                    }
                }
            }
        }
    }

    fn respond_to_init(
        &self,
        pending: &mut HashMap<PeerId, PendingHandshake>,
        peer: PeerId,
        bytes: &[u8],
    ) -> Result<Option<(MessageType, Vec<u8>)>> {
        let mut state = HandshakeState::new_responder(&self.static_key);
        state.read_message_1(bytes)?;
        let reply = state.write_message_2(&[])?;
        pending.insert(
            peer,
            PendingHandshake {
                state,
                deadline: Instant::now() + self.config.handshake_timeout,
            },
        );
        self.events.emit(CoreEvent::HandshakeMessage {
            peer,
            kind: MessageType::NoiseHandshakeResp,
            bytes: reply.clone(),
        });
        Ok(Some((MessageType::NoiseHandshakeResp, reply)))
    }

    fn advance(
        &self,
        state: &mut HandshakeState,
        bytes: &[u8],
    ) -> Result<Option<(MessageType, Vec<u8>)>> {
        match state.role() {
            Role::Initiator => {
                state.read_message_2(bytes)?;
                let reply = state.write_message_3(&[])?;
                Ok(Some((MessageType::NoiseHandshakeResp, reply)))
            }
            Role::Responder => {
                state.read_message_3(bytes)?;
                Ok(None)
            }
        }
    }

    /// Record a completed handshake. The session map insert is the commit
    /// point; everything before it can be abandoned safely.
    fn install(&self, peer: PeerId, state: HandshakeState) -> Result<()> {
        let role = state.role();
        let transport = state.into_transport()?;
        let fp = fingerprint(&transport.remote_static);

        self.sessions.lock().insert(
            peer,
            EstablishedSession {
                transport,
                fingerprint: fp.clone(),
                last_activity: now_millis(),
            },
        );

        tracing::info!(peer = %peer, role = ?role, "Session established");
        self.events.emit(CoreEvent::SessionEstablished {
            peer,
            fingerprint: fp,
            role,
        });
        Ok(())
    }

    fn fail_handshake(&self, peer: PeerId, err: &Error) {
        let reason = match err {
            Error::UnexpectedHandshakeMessage => HandshakeFailureReason::Protocol,
            _ => HandshakeFailureReason::Crypto,
        };
        tracing::warn!(peer = %peer, error = %err, "Handshake failed");
        self.events.emit(CoreEvent::HandshakeFailed { peer, reason });
    }

    /// Encrypt through the peer's established session.
    pub fn encrypt(&self, peer: PeerId, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&peer)
            .ok_or_else(|| Error::NoSession(peer.to_hex()))?;
        let ciphertext = session.transport.send.encrypt(&[], plaintext)?;
        session.last_activity = now_millis();
        Ok(ciphertext)
    }

    /// Decrypt through the peer's established session.
    ///
    /// An authentication failure closes the session: the cipher streams
    /// may have desynchronized and nothing after this point would decrypt.
    pub fn decrypt(&self, peer: PeerId, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&peer)
            .ok_or_else(|| Error::NoSession(peer.to_hex()))?;
        match session.transport.recv.decrypt(&[], ciphertext) {
            Ok(plaintext) => {
                session.last_activity = now_millis();
                Ok(plaintext)
            }
            Err(err) => {
                sessions.remove(&peer);
                drop(sessions);
                tracing::warn!(peer = %peer, "Decrypt failure, closing session");
                self.events.emit(CoreEvent::SessionClosed { peer });
                Err(err)
            }
        }
    }

    /// Close a session explicitly. Cipher keys are zeroized on drop.
    pub fn close(&self, peer: PeerId) {
        let removed = self.sessions.lock().remove(&peer).is_some();
        self.pending.lock().remove(&peer);
        if removed {
            tracing::debug!(peer = %peer, "Session closed");
            self.events.emit(CoreEvent::SessionClosed { peer });
        }
    }

    /// Current state for a peer.
    pub fn state(&self, peer: PeerId) -> SessionState {
        if self.sessions.lock().contains_key(&peer) {
            SessionState::Completed
        } else if self.pending.lock().contains_key(&peer) {
            SessionState::Initiated
        } else {
            SessionState::None
        }
    }

    /// Fingerprint of the peer's authenticated static key.
    pub fn fingerprint_of(&self, peer: PeerId) -> Option<String> {
        self.sessions
            .lock()
            .get(&peer)
            .map(|session| session.fingerprint.clone())
    }

    /// Channel-binding hash of the completed handshake.
    pub fn handshake_hash(&self, peer: PeerId) -> Option<[u8; 32]> {
        self.sessions
            .lock()
            .get(&peer)
            .map(|session| session.transport.handshake_hash)
    }

    /// Peers with a completed session.
    pub fn established_peers(&self) -> Vec<PeerId> {
        self.sessions.lock().keys().copied().collect()
    }

    /// Expire idle sessions and timed-out handshakes.
    pub fn sweep(&self) {
        let idle_cutoff_ms = self.config.idle_timeout.as_millis() as u64;
        let now = now_millis();

        let expired: Vec<PeerId> = {
            let sessions = self.sessions.lock();
            sessions
                .iter()
                .filter(|(_, session)| {
                    now.saturating_sub(session.last_activity) >= idle_cutoff_ms
                })
                .map(|(peer, _)| *peer)
                .collect()
        };
        for peer in expired {
            tracing::info!(peer = %peer, "Closing idle session");
            self.close(peer);
        }

        let timed_out: Vec<PeerId> = {
            let mut pending = self.pending.lock();
            let now = Instant::now();
            let expired: Vec<PeerId> = pending
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(peer, _)| *peer)
                .collect();
            for peer in &expired {
                pending.remove(peer);
            }
            expired
        };
        for peer in timed_out {
            tracing::warn!(peer = %peer, "Handshake timed out");
            self.events.emit(CoreEvent::HandshakeFailed {
                peer,
                reason: HandshakeFailureReason::Timeout,
            });
        }
    }

    /// Spawn the 60-second sweep loop.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                manager.sweep();
            }
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
