//! Transport multiplexer.
//!
//! Owns the send-path decision tree and the inbound pipeline:
//!
//! ```text
//! outbound: pad → encrypt (session) → encode → fragment (BLE) or
//!           gift wrap (Nostr) → transmit
//! inbound:  reassemble / unwrap → decode → router verdict → session
//!           handshake or decrypt → dispatch
//! ```
//!
//! Route selection per recipient: BLE when the peer is link-connected and
//! the session is Completed; otherwise Nostr when the peer is a mutual
//! favorite and Nostr is enabled; otherwise the send fails with
//! `PeerUnreachable` and the message manager retries later.
//!
//! Inbound processing is serialized per peer (one queue and task per
//! neighbor) and parallel across peers. Handshake steps and encryption for
//! a given peer always run on that peer's queue or under the session
//! manager's lock, so AEAD nonces stay in enqueue order.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::crypto::{peer_id_from_public, verify_signature, Identity};
use crate::error::{Error, Result};
use crate::events::{AckKind, CoreEvent, EventBus};
use crate::favorites::Favorites;
use crate::mesh::{AnnouncePayload, MeshRouter, PeerRegistry, PeerTransport, Verdict};
use crate::metrics::{bump, Metrics};
use crate::nostr::{gift_unwrap, gift_wrap, PoolEvent, RelayPool};
use crate::protocol::packet::{compress_payload, decompress_payload};
use crate::protocol::{
    fragment_packets, pad, unpad, MessageType, Packet, PeerId, Reassembler, BLE_MTU,
};
use crate::session::{SessionManager, SessionState};
use crate::time::now_secs;
use crate::transport::{Transport, TransportEvent};

/// Subscription id used for our gift-wrap inbox on every relay.
pub const NOSTR_INBOX_SUB: &str = "murmur-inbox";

/// How many recently received message ids are remembered for
/// `DELIVERY_STATUS_REQUEST` answers.
const RECENT_RECEIVED_CAP: usize = 4096;

/// Multiplexer policy knobs.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Whether the Nostr fallback may be used at all
    pub nostr_enabled: bool,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self { nostr_enabled: true }
    }
}

/// Application chat payload carried inside `MESSAGE` packets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    /// Sender-assigned message id, echoed in acknowledgements
    pub id: String,
    /// Content bytes (UTF-8 for plain chat)
    pub content: Vec<u8>,
}

/// Routes outbound messages and drives the inbound pipeline.
pub struct Multiplexer {
    identity: Arc<Identity>,
    local_id: PeerId,
    sessions: Arc<SessionManager>,
    router: Arc<MeshRouter>,
    registry: Arc<PeerRegistry>,
    favorites: Arc<Favorites>,
    ble: Arc<dyn Transport>,
    pool: Arc<RelayPool>,
    reassembler: Mutex<Reassembler>,
    recent_received: Mutex<HashSet<String>>,
    metrics: Arc<Metrics>,
    events: EventBus,
    config: MultiplexerConfig,
    peer_queues: DashMap<PeerId, mpsc::UnboundedSender<Vec<u8>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Multiplexer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<Identity>,
        sessions: Arc<SessionManager>,
        router: Arc<MeshRouter>,
        registry: Arc<PeerRegistry>,
        favorites: Arc<Favorites>,
        ble: Arc<dyn Transport>,
        pool: Arc<RelayPool>,
        metrics: Arc<Metrics>,
        events: EventBus,
        config: MultiplexerConfig,
    ) -> Arc<Self> {
        let local_id = identity.peer_id();
        Arc::new(Self {
            identity,
            local_id,
            sessions,
            router,
            registry,
            favorites,
            ble,
            pool,
            reassembler: Mutex::new(Reassembler::default()),
            recent_received: Mutex::new(HashSet::new()),
            metrics,
            events,
            config,
            peer_queues: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the transports and the inbound pumps.
    pub async fn start(
        self: &Arc<Self>,
        mut pool_events: mpsc::UnboundedReceiver<PoolEvent>,
    ) -> Result<()> {
        self.ble.start().await?;
        self.events.emit(CoreEvent::TransportStatus {
            kind: crate::transport::TransportKind::Ble,
            available: true,
        });

        if self.config.nostr_enabled {
            let our_inbox = hex::encode(self.identity.nostr().public().signing);
            self.pool.subscribe(
                NOSTR_INBOX_SUB,
                serde_json::json!({ "kinds": [crate::nostr::KIND_GIFT_WRAP], "#p": [our_inbox] }),
            );
        }

        // BLE pump: link events and frames
        let mux = Arc::clone(self);
        let mut ble_events = self.ble.subscribe();
        let ble_pump = tokio::spawn(async move {
            loop {
                match ble_events.recv().await {
                    Ok(event) => mux.handle_transport_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "BLE pump lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // Nostr pump: gift wraps from the relay pool
        let mux = Arc::clone(self);
        let nostr_pump = tokio::spawn(async move {
            while let Some(event) = pool_events.recv().await {
                if let PoolEvent::InboundEvent { event, .. } = event {
                    mux.handle_nostr_event(event).await;
                }
            }
        });

        // Reassembly sweeper
        let mux = Arc::clone(self);
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
            loop {
                interval.tick().await;
                let expired = mux.reassembler.lock().sweep();
                for _ in 0..expired {
                    bump(&mux.metrics.reassembly_timeouts);
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.push(ble_pump);
        tasks.push(nostr_pump);
        tasks.push(sweeper);
        Ok(())
    }

    /// Stop pumps and the BLE transport.
    pub async fn stop(&self) -> Result<()> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.peer_queues.clear();
        self.events.emit(CoreEvent::TransportStatus {
            kind: crate::transport::TransportKind::Ble,
            available: false,
        });
        self.ble.stop().await
    }

    // ========================================================================
    // OUTBOUND
    // ========================================================================

    /// Send a chat message, choosing the transport per the decision tree.
    pub async fn send_chat(
        &self,
        message_id: &str,
        recipient: Option<PeerId>,
        content: &[u8],
    ) -> Result<()> {
        let payload = ChatPayload {
            id: message_id.to_string(),
            content: content.to_vec(),
        };
        let encoded = bincode::serialize(&payload)?;
        let (body, compressed) = match compress_payload(&encoded) {
            Some(smaller) => (smaller, true),
            None => (encoded, false),
        };

        match recipient {
            None => {
                let mut packet =
                    Packet::new(MessageType::Message, self.local_id, None, body);
                packet.compressed = compressed;
                self.sign(&mut packet)?;
                self.broadcast_packet(&packet).await
            }
            Some(recipient) => {
                let mut inner = Packet::new(
                    MessageType::Message,
                    self.local_id,
                    Some(recipient),
                    body,
                );
                inner.compressed = compressed;
                self.sign(&mut inner)?;
                self.send_private(recipient, inner).await
            }
        }
    }

    /// Send a delivery/read acknowledgement for a message.
    pub async fn send_ack(
        &self,
        recipient: PeerId,
        message_id: &str,
        kind: AckKind,
    ) -> Result<()> {
        let packet_type = match kind {
            AckKind::Delivered => MessageType::DeliveryAck,
            AckKind::Read => MessageType::ReadReceipt,
        };
        let inner = Packet::new(
            packet_type,
            self.local_id,
            Some(recipient),
            message_id.as_bytes().to_vec(),
        );
        self.send_private(recipient, inner).await
    }

    /// Ask a peer whether it received a message.
    pub async fn send_status_request(&self, recipient: PeerId, message_id: &str) -> Result<()> {
        let inner = Packet::new(
            MessageType::DeliveryStatusRequest,
            self.local_id,
            Some(recipient),
            message_id.as_bytes().to_vec(),
        );
        self.send_private(recipient, inner).await
    }

    /// Broadcast our identity announcement over the mesh.
    pub async fn announce(&self) -> Result<()> {
        let payload = AnnouncePayload {
            static_public: self.identity.noise().public_bytes(),
            signing_public: self.identity.signing().public_bytes(),
            nostr_public: self.identity.nostr().public(),
            nickname: self.identity.nickname().to_string(),
        };
        let mut packet = Packet::new(
            MessageType::Announce,
            self.local_id,
            None,
            payload.to_bytes(),
        );
        self.sign(&mut packet)?;
        self.broadcast_packet(&packet).await
    }

    /// Broadcast a leave notice.
    pub async fn send_leave(&self) -> Result<()> {
        let mut packet = Packet::new(MessageType::Leave, self.local_id, None, Vec::new());
        self.sign(&mut packet)?;
        self.broadcast_packet(&packet).await
    }

    /// Tell a peer we favorited (or unfavorited) them.
    pub async fn send_favorite_notice(&self, recipient: PeerId, favorited: bool) -> Result<()> {
        let packet_type = if favorited {
            MessageType::Favorited
        } else {
            MessageType::Unfavorited
        };
        let inner = Packet::new(packet_type, self.local_id, Some(recipient), Vec::new());
        self.send_private(recipient, inner).await
    }

    fn sign(&self, packet: &mut Packet) -> Result<()> {
        let bytes = packet.signing_bytes()?;
        packet.signature = Some(self.identity.signing().sign(&bytes));
        Ok(())
    }

    /// The decision tree for anything addressed to a single peer.
    async fn send_private(&self, recipient: PeerId, inner: Packet) -> Result<()> {
        if self.registry.is_blocked(recipient) {
            return Err(Error::PeerBlocked(recipient.to_hex()));
        }

        if self.registry.is_connected(recipient) {
            match self.sessions.state(recipient) {
                SessionState::Completed => return self.send_encrypted_ble(recipient, inner).await,
                SessionState::None => {
                    // Kick a handshake; the caller retries once it completes
                    if let Ok(bytes) = self.sessions.initiate(recipient) {
                        let packet = Packet::new(
                            MessageType::NoiseHandshakeInit,
                            self.local_id,
                            Some(recipient),
                            bytes,
                        );
                        self.send_packet(&packet).await?;
                    }
                    return Err(Error::NoSession(recipient.to_hex()));
                }
                SessionState::Initiated => return Err(Error::NoSession(recipient.to_hex())),
            }
        }

        if self.config.nostr_enabled && self.favorites.is_mutual(recipient) {
            if let Some(nostr_key) = self.favorites.nostr_key_of(recipient) {
                let encoded = inner.encode()?;
                let wrapped =
                    gift_wrap(self.identity.nostr(), &nostr_key, &encoded, now_secs())?;
                return self.pool.publish(&wrapped).await;
            }
        }

        Err(Error::PeerUnreachable(recipient.to_hex()))
    }

    /// BLE path: pad, encrypt through the session, wrap, fragment, send.
    async fn send_encrypted_ble(&self, recipient: PeerId, inner: Packet) -> Result<()> {
        let encoded = inner.encode()?;
        let padded = pad(&encoded)?;
        let ciphertext = self.sessions.encrypt(recipient, &padded)?;

        let outer = Packet::new(
            MessageType::NoiseEncrypted,
            self.local_id,
            Some(recipient),
            ciphertext,
        );
        self.send_packet(&outer).await
    }

    /// Encode, fragment if needed, and transmit to the recipient (directly
    /// when link-connected, otherwise flooded for mesh relay).
    async fn send_packet(&self, packet: &Packet) -> Result<()> {
        let frames = self.frames_for(packet)?;
        let recipient = packet.recipient.expect("send_packet requires a recipient");

        if self.registry.is_connected(recipient) {
            for frame in frames {
                self.ble.send(recipient, frame).await?;
            }
            return Ok(());
        }

        let neighbors = self.registry.connected_peers();
        if neighbors.is_empty() {
            return Err(Error::PeerUnreachable(recipient.to_hex()));
        }
        for frame in frames {
            for neighbor in &neighbors {
                let _ = self.ble.send(*neighbor, frame.clone()).await;
            }
        }
        Ok(())
    }

    /// Send a broadcast packet to every connected neighbor.
    async fn broadcast_packet(&self, packet: &Packet) -> Result<()> {
        let frames = self.frames_for(packet)?;
        let neighbors = self.registry.connected_peers();
        if neighbors.is_empty() {
            return Err(Error::TransportUnavailable(
                "no connected BLE peers".to_string(),
            ));
        }
        for frame in frames {
            for neighbor in &neighbors {
                let _ = self.ble.send(*neighbor, frame.clone()).await;
            }
        }
        Ok(())
    }

    fn frames_for(&self, packet: &Packet) -> Result<Vec<Vec<u8>>> {
        let encoded = packet.encode()?;
        if encoded.len() <= BLE_MTU {
            return Ok(vec![encoded]);
        }
        fragment_packets(packet)?
            .iter()
            .map(|fragment| fragment.encode())
            .collect()
    }

    // ========================================================================
    // INBOUND
    // ========================================================================

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected(peer) => {
                self.registry.set_connected(peer, true);
                self.events.emit(CoreEvent::PeerConnected { peer });
                tracing::info!(peer = %peer, "BLE peer connected");

                let _ = self.announce_to(peer).await;

                // The lower id initiates; the other side responds
                if self.local_id < peer && self.sessions.state(peer) == SessionState::None {
                    if let Ok(bytes) = self.sessions.initiate(peer) {
                        let packet = Packet::new(
                            MessageType::NoiseHandshakeInit,
                            self.local_id,
                            Some(peer),
                            bytes,
                        );
                        let _ = self.send_packet(&packet).await;
                    }
                }
            }
            TransportEvent::PeerDisconnected(peer) => {
                self.registry.set_connected(peer, false);
                self.peer_queues.remove(&peer);
                self.events.emit(CoreEvent::PeerDisconnected { peer });
                tracing::info!(peer = %peer, "BLE peer disconnected");
            }
            TransportEvent::Frame { peer, bytes } => {
                self.enqueue_frame(peer, bytes);
            }
        }
    }

    /// Serialize frame processing per neighbor.
    fn enqueue_frame(self: &Arc<Self>, peer: PeerId, bytes: Vec<u8>) {
        let sender = self
            .peer_queues
            .entry(peer)
            .or_insert_with(|| {
                let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
                let mux = Arc::clone(self);
                tokio::spawn(async move {
                    while let Some(frame) = rx.recv().await {
                        mux.process_frame(&frame, Some(peer)).await;
                    }
                });
                tx
            })
            .clone();
        let _ = sender.send(bytes);
    }

    /// Directed announce to one peer, so new links learn who we are
    /// without waiting for the next broadcast.
    async fn announce_to(&self, peer: PeerId) -> Result<()> {
        let payload = AnnouncePayload {
            static_public: self.identity.noise().public_bytes(),
            signing_public: self.identity.signing().public_bytes(),
            nostr_public: self.identity.nostr().public(),
            nickname: self.identity.nickname().to_string(),
        };
        let mut packet = Packet::new(
            MessageType::Announce,
            self.local_id,
            None,
            payload.to_bytes(),
        );
        self.sign(&mut packet)?;
        for frame in self.frames_for(&packet)? {
            self.ble.send(peer, frame).await?;
        }
        Ok(())
    }

    async fn process_frame(self: &Arc<Self>, bytes: &[u8], from: Option<PeerId>) {
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                bump(&self.metrics.codec_failures);
                tracing::debug!(error = %e, "Dropping undecodable frame");
                return;
            }
        };
        self.process_packet(packet, from).await;
    }

    async fn process_packet(self: &Arc<Self>, packet: Packet, from: Option<PeerId>) {
        if packet.packet_type.is_fragment() {
            self.process_fragment(packet, from).await;
            return;
        }

        match self.router.process(&packet, from) {
            Verdict::Drop(reason) => {
                tracing::trace!(?reason, sender = %packet.sender, "Router dropped packet");
            }
            Verdict::Deliver => {
                self.dispatch_local(packet, from).await;
            }
            Verdict::DeliverAndRelay(copy) => {
                self.relay(&copy, from).await;
                self.dispatch_local(packet, from).await;
            }
            Verdict::Relay(copy) => {
                self.relay(&copy, from).await;
            }
        }
    }

    /// Fragments are relayed individually; only the addressed node (or a
    /// broadcast listener) reassembles.
    async fn process_fragment(self: &Arc<Self>, packet: Packet, from: Option<PeerId>) {
        let verdict = self.router.process(&packet, from);
        let reassemble = match &verdict {
            Verdict::Deliver | Verdict::DeliverAndRelay(_) => true,
            Verdict::Relay(_) | Verdict::Drop(_) => false,
        };
        if let Verdict::DeliverAndRelay(copy) | Verdict::Relay(copy) = verdict {
            self.relay(&copy, from).await;
        }
        if !reassemble {
            return;
        }

        let complete = match self.reassembler.lock().accept(&packet.payload) {
            Ok(data) => data,
            Err(e) => {
                bump(&self.metrics.codec_failures);
                tracing::debug!(error = %e, "Bad fragment");
                return;
            }
        };
        if let Some(data) = complete {
            match Packet::decode(&data) {
                // The reassembled packet was already relayed fragment by
                // fragment; dispatch locally only.
                Ok(inner) => self.dispatch_local(inner, from).await,
                Err(e) => {
                    bump(&self.metrics.codec_failures);
                    tracing::debug!(error = %e, "Reassembled data failed to decode");
                }
            }
        }
    }

    async fn relay(&self, packet: &Packet, from: Option<PeerId>) {
        let frames = match self.frames_for(packet) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::debug!(error = %e, "Cannot encode relay copy");
                return;
            }
        };
        for neighbor in self.registry.connected_peers() {
            if Some(neighbor) == from || neighbor == packet.sender {
                continue;
            }
            for frame in &frames {
                let _ = self.ble.send(neighbor, frame.clone()).await;
            }
        }
    }

    async fn dispatch_local(self: &Arc<Self>, packet: Packet, from: Option<PeerId>) {
        let sender = packet.sender;
        match packet.packet_type {
            MessageType::Announce | MessageType::NoiseIdentityAnnounce => {
                self.handle_announce(&packet, from);
            }
            MessageType::Leave => {
                if self.registry.leave(sender) {
                    self.events.emit(CoreEvent::PeerDisconnected { peer: sender });
                }
            }
            MessageType::NoiseHandshakeInit | MessageType::NoiseHandshakeResp => {
                match self
                    .sessions
                    .on_inbound(sender, packet.packet_type, &packet.payload)
                {
                    Ok(Some((kind, bytes))) => {
                        let reply = Packet::new(kind, self.local_id, Some(sender), bytes);
                        if let Err(e) = self.send_packet(&reply).await {
                            tracing::warn!(peer = %sender, error = %e, "Failed to send handshake reply");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!(peer = %sender, error = %e, "Handshake message rejected");
                    }
                }
            }
            MessageType::NoiseEncrypted => {
                let padded = match self.sessions.decrypt(sender, &packet.payload) {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        tracing::warn!(peer = %sender, error = %e, "Failed to decrypt");
                        return;
                    }
                };
                let encoded = match unpad(&padded) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        bump(&self.metrics.codec_failures);
                        tracing::debug!(peer = %sender, error = %e, "Bad padding");
                        return;
                    }
                };
                match Packet::decode(&encoded) {
                    Ok(inner) if inner.sender == sender => {
                        Box::pin(self.dispatch_local(inner, from)).await;
                    }
                    Ok(inner) => {
                        tracing::warn!(
                            outer = %sender,
                            inner = %inner.sender,
                            "Inner sender mismatch, dropping"
                        );
                    }
                    Err(e) => {
                        bump(&self.metrics.codec_failures);
                        tracing::debug!(peer = %sender, error = %e, "Inner decode failed");
                    }
                }
            }
            MessageType::Message => {
                self.handle_chat(packet).await;
            }
            MessageType::DeliveryAck | MessageType::ReadReceipt => {
                if let Ok(message_id) = String::from_utf8(packet.payload.clone()) {
                    let kind = if packet.packet_type == MessageType::DeliveryAck {
                        AckKind::Delivered
                    } else {
                        AckKind::Read
                    };
                    self.events.emit(CoreEvent::AckReceived {
                        peer: sender,
                        message_id,
                        kind,
                    });
                }
            }
            MessageType::DeliveryStatusRequest => {
                if let Ok(message_id) = String::from_utf8(packet.payload.clone()) {
                    let seen = self.recent_received.lock().contains(&message_id);
                    if seen {
                        let _ = self.send_ack(sender, &message_id, AckKind::Delivered).await;
                    }
                }
            }
            MessageType::VersionHello => {
                let reply = Packet::new(
                    MessageType::VersionAck,
                    self.local_id,
                    Some(sender),
                    vec![crate::protocol::PROTOCOL_VERSION],
                );
                let _ = self.send_packet(&reply).await;
            }
            MessageType::VersionAck => {
                tracing::debug!(peer = %sender, "Version acknowledged");
            }
            MessageType::Favorited | MessageType::Unfavorited => {
                let favorited = packet.packet_type == MessageType::Favorited;
                let record = self.registry.get(sender);
                let (nickname, noise_public, nostr_public) = match record {
                    Some(record) => (record.nickname, record.static_public, record.nostr_public),
                    None => (sender.to_hex(), [0u8; 32], None),
                };
                if let Err(e) = self.favorites.set_favorited_us(
                    sender,
                    &nickname,
                    noise_public,
                    nostr_public,
                    favorited,
                ) {
                    tracing::warn!(peer = %sender, error = %e, "Failed to record favorite notice");
                }
                self.events.emit(CoreEvent::FavoriteChanged {
                    peer: sender,
                    favorited_us: favorited,
                });
            }
            // Reserved types are carried through the router opaquely and
            // ignored locally until routing needs them
            MessageType::ProtocolAck
            | MessageType::ProtocolNack
            | MessageType::HandshakeRequest
            | MessageType::MeshRelay => {
                tracing::trace!(ty = ?packet.packet_type, peer = %sender, "Reserved packet type");
            }
            MessageType::FragmentStart
            | MessageType::FragmentContinue
            | MessageType::FragmentEnd => {
                // Handled in process_fragment
            }
        }
    }

    fn handle_announce(&self, packet: &Packet, from: Option<PeerId>) {
        let announce = match AnnouncePayload::from_bytes(&packet.payload) {
            Ok(announce) => announce,
            Err(e) => {
                bump(&self.metrics.codec_failures);
                tracing::debug!(error = %e, "Bad announce payload");
                return;
            }
        };

        // The short id must be derived from the announced static key
        if peer_id_from_public(&announce.static_public) != packet.sender {
            tracing::warn!(peer = %packet.sender, "Announce id does not match static key");
            return;
        }

        // Announces must be signed by the announced signing key
        let verified = packet
            .signature
            .as_ref()
            .and_then(|sig| {
                let bytes = packet.signing_bytes().ok()?;
                verify_signature(&announce.signing_public, &bytes, sig).ok()
            })
            .is_some();
        if !verified {
            tracing::warn!(peer = %packet.sender, "Unsigned or forged announce");
            return;
        }

        let transport = if from.is_some() {
            PeerTransport::Ble
        } else {
            PeerTransport::Nostr
        };
        self.registry.announce(packet.sender, &announce, transport);
        tracing::debug!(peer = %packet.sender, nickname = announce.nickname.as_str(), "Peer announced");
    }

    async fn handle_chat(self: &Arc<Self>, packet: Packet) {
        let body = if packet.compressed {
            match decompress_payload(&packet.payload) {
                Ok(body) => body,
                Err(e) => {
                    bump(&self.metrics.codec_failures);
                    tracing::debug!(error = %e, "Bad compressed payload");
                    return;
                }
            }
        } else {
            packet.payload.clone()
        };

        let chat: ChatPayload = match bincode::deserialize(&body) {
            Ok(chat) => chat,
            Err(e) => {
                bump(&self.metrics.codec_failures);
                tracing::debug!(error = %e, "Bad chat payload");
                return;
            }
        };

        // Verify signatures when the sender has announced its signing key
        if let (Some(signature), Some(record)) =
            (packet.signature.as_ref(), self.registry.get(packet.sender))
        {
            if !record.fingerprint.is_empty() {
                let authentic = packet
                    .signing_bytes()
                    .ok()
                    .map(|bytes| {
                        verify_signature(&record.signing_public, &bytes, signature).is_ok()
                    })
                    .unwrap_or(false);
                if !authentic {
                    tracing::warn!(peer = %packet.sender, "Dropping message with bad signature");
                    return;
                }
            }
        }

        {
            let mut recent = self.recent_received.lock();
            if recent.len() >= RECENT_RECEIVED_CAP {
                recent.clear();
            }
            recent.insert(chat.id.clone());
        }

        let broadcast = packet.is_broadcast();
        tracing::debug!(peer = %packet.sender, id = chat.id.as_str(), broadcast, "Message received");
        self.events.emit(CoreEvent::MessageReceived {
            peer: packet.sender,
            message_id: chat.id.clone(),
            content: chat.content,
            broadcast,
        });

        if !broadcast {
            if let Err(e) = self.send_ack(packet.sender, &chat.id, AckKind::Delivered).await {
                tracing::debug!(peer = %packet.sender, error = %e, "Could not send delivery ack");
            }
        }
    }

    /// Inbound gift wrap from the relay pool.
    async fn handle_nostr_event(self: &Arc<Self>, event: crate::nostr::NostrEvent) {
        let (sender_keys, encoded) = match gift_unwrap(self.identity.nostr(), &event) {
            Ok(opened) => opened,
            Err(e) => {
                tracing::debug!(error = %e, "Discarding unopenable gift wrap");
                return;
            }
        };
        let packet = match Packet::decode(&encoded) {
            Ok(packet) => packet,
            Err(e) => {
                bump(&self.metrics.codec_failures);
                tracing::debug!(error = %e, "Gift wrap carried undecodable packet");
                return;
            }
        };

        // When the sender is a known favorite, its Nostr identity must
        // match the claimed short id
        if let Some(known) = self.favorites.peer_by_nostr_signing(&sender_keys.signing) {
            if known != packet.sender {
                tracing::warn!(
                    claimed = %packet.sender,
                    known = %known,
                    "Gift wrap sender mismatch, dropping"
                );
                return;
            }
        }

        match self.router.process(&packet, None) {
            Verdict::Deliver | Verdict::DeliverAndRelay(_) => {
                // Nostr arrivals are never re-relayed onto the mesh
                self.dispatch_local(packet, None).await;
            }
            Verdict::Relay(_) | Verdict::Drop(_) => {}
        }
    }

    /// Metrics snapshot pass-through for the boundary.
    pub fn metrics(&self) -> crate::metrics::MetricsSnapshot {
        self.metrics.snapshot()
    }
}


// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NoiseKeyPair;
    use crate::nostr::PoolConfig;
    use crate::session::SessionConfig;
    use crate::storage::MemoryStore;
    use crate::transport::ble::testing::LoopbackLink;
    use crate::transport::ble::BleTransport;
    use crate::transport::BleLink;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Node {
        mux: Arc<Multiplexer>,
        events: EventBus,
        registry: Arc<PeerRegistry>,
        metrics: Arc<Metrics>,
        id: PeerId,
    }

    async fn make_node(identity: Arc<Identity>, link: Arc<dyn BleLink>) -> Node {
        let id = identity.peer_id();
        let events = EventBus::new(256);
        let registry = Arc::new(PeerRegistry::new(32));
        let metrics = Arc::new(Metrics::new());
        let sessions = Arc::new(SessionManager::new(
            id,
            NoiseKeyPair::from_bytes(&identity.noise().secret_bytes()),
            events.clone(),
            SessionConfig::default(),
        ));
        let router = Arc::new(MeshRouter::new(
            id,
            Arc::clone(&registry),
            Arc::clone(&metrics),
        ));
        let favorites = Arc::new(
            Favorites::load(Arc::new(MemoryStore::new()) as Arc<dyn crate::storage::KeyValueStore>)
                .unwrap(),
        );
        let (pool_tx, pool_rx) = mpsc::unbounded_channel();
        let pool = RelayPool::new(PoolConfig::default(), pool_tx, events.clone());
        let ble = BleTransport::new(link);

        let mux = Multiplexer::new(
            identity,
            sessions,
            router,
            Arc::clone(&registry),
            favorites,
            ble,
            pool,
            Arc::clone(&metrics),
            events.clone(),
            MultiplexerConfig {
                nostr_enabled: false,
            },
        );
        mux.start(pool_rx).await.unwrap();
        Node {
            mux,
            events,
            registry,
            metrics,
            id,
        }
    }

    async fn wait_for<F>(rx: &mut broadcast::Receiver<CoreEvent>, mut predicate: F) -> CoreEvent
    where
        F: FnMut(&CoreEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event bus closed");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Two nodes wired back to back, links up, sessions established.
    async fn linked_pair() -> (Node, Node) {
        let identity_a = Arc::new(Identity::generate("alice").unwrap());
        let identity_b = Arc::new(Identity::generate("bob").unwrap());
        let (link_a, link_b) = LoopbackLink::pair(identity_a.peer_id(), identity_b.peer_id());

        let a = make_node(identity_a, link_a.clone() as Arc<dyn BleLink>).await;
        let b = make_node(identity_b, link_b.clone() as Arc<dyn BleLink>).await;

        let mut events_a = a.events.subscribe();
        let mut events_b = b.events.subscribe();
        LoopbackLink::establish(&link_a, &link_b);

        wait_for(&mut events_a, |e| {
            matches!(e, CoreEvent::SessionEstablished { .. })
        })
        .await;
        wait_for(&mut events_b, |e| {
            matches!(e, CoreEvent::SessionEstablished { .. })
        })
        .await;
        (a, b)
    }

    #[tokio::test]
    async fn test_link_up_establishes_session_and_announces() {
        let (a, b) = linked_pair().await;

        // Announce exchange populated both registries
        let record = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(record) = a.registry.get(b.id) {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("announce never arrived");
        assert_eq!(record.nickname, "bob");
        assert!(b.registry.get(a.id).is_some());
    }

    #[tokio::test]
    async fn test_dm_over_ble_with_delivery_ack() {
        let (a, b) = linked_pair().await;
        let mut events_a = a.events.subscribe();
        let mut events_b = b.events.subscribe();

        a.mux
            .send_chat("msg-1", Some(b.id), b"Hello, Bob!")
            .await
            .unwrap();

        match wait_for(&mut events_b, |e| {
            matches!(e, CoreEvent::MessageReceived { .. })
        })
        .await
        {
            CoreEvent::MessageReceived {
                peer,
                message_id,
                content,
                broadcast,
            } => {
                assert_eq!(peer, a.id);
                assert_eq!(message_id, "msg-1");
                assert_eq!(content, b"Hello, Bob!");
                assert!(!broadcast);
            }
            _ => unreachable!(),
        }

        // The delivery ack flows back encrypted
        match wait_for(&mut events_a, |e| matches!(e, CoreEvent::AckReceived { .. })).await {
            CoreEvent::AckReceived {
                peer,
                message_id,
                kind,
            } => {
                assert_eq!(peer, b.id);
                assert_eq!(message_id, "msg-1");
                assert_eq!(kind, AckKind::Delivered);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_chat() {
        let (a, b) = linked_pair().await;
        let mut events_b = b.events.subscribe();

        a.mux.send_chat("msg-2", None, b"hello mesh").await.unwrap();

        match wait_for(&mut events_b, |e| {
            matches!(e, CoreEvent::MessageReceived { .. })
        })
        .await
        {
            CoreEvent::MessageReceived {
                peer,
                content,
                broadcast,
                ..
            } => {
                assert_eq!(peer, a.id);
                assert_eq!(content, b"hello mesh");
                assert!(broadcast);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_large_dm_fragments_and_reassembles() {
        let (a, b) = linked_pair().await;
        let mut events_b = b.events.subscribe();

        // Random-ish content stays incompressible and well above the MTU
        let content: Vec<u8> = (0..3000u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        a.mux
            .send_chat("msg-big", Some(b.id), &content)
            .await
            .unwrap();

        match wait_for(&mut events_b, |e| {
            matches!(e, CoreEvent::MessageReceived { .. })
        })
        .await
        {
            CoreEvent::MessageReceived {
                message_id,
                content: got,
                ..
            } => {
                assert_eq!(message_id, "msg-big");
                assert_eq!(got, content);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let (a, _b) = linked_pair().await;
        let stranger = PeerId::new([0x77; 8]);
        let result = a.mux.send_chat("msg-3", Some(stranger), b"anyone?").await;
        assert!(matches!(result, Err(Error::PeerUnreachable(_))));
    }

    #[tokio::test]
    async fn test_read_receipt_flows() {
        let (a, b) = linked_pair().await;
        let mut events_a = a.events.subscribe();

        b.mux.send_ack(a.id, "msg-9", AckKind::Read).await.unwrap();

        match wait_for(&mut events_a, |e| matches!(e, CoreEvent::AckReceived { .. })).await {
            CoreEvent::AckReceived { message_id, kind, .. } => {
                assert_eq!(message_id, "msg-9");
                assert_eq!(kind, AckKind::Read);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_undecodable_frame_bumps_codec_metric() {
        let (a, b) = linked_pair().await;
        // Raw garbage straight onto b's queue from a's direction
        b.mux.enqueue_frame(a.id, vec![0xFF; 40]);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if b.metrics.snapshot().codec_failures > 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("codec failure never counted");
    }

    #[tokio::test]
    async fn test_status_request_answered_for_seen_message() {
        let (a, b) = linked_pair().await;
        let mut events_b = b.events.subscribe();
        let mut events_a = a.events.subscribe();

        a.mux
            .send_chat("msg-seen", Some(b.id), b"remember me")
            .await
            .unwrap();
        wait_for(&mut events_b, |e| {
            matches!(e, CoreEvent::MessageReceived { .. })
        })
        .await;
        // Drain the first delivery ack
        wait_for(&mut events_a, |e| matches!(e, CoreEvent::AckReceived { .. })).await;

        // Ask again explicitly
        a.mux.send_status_request(b.id, "msg-seen").await.unwrap();
        match wait_for(&mut events_a, |e| matches!(e, CoreEvent::AckReceived { .. })).await {
            CoreEvent::AckReceived { message_id, kind, .. } => {
                assert_eq!(message_id, "msg-seen");
                assert_eq!(kind, AckKind::Delivered);
            }
            _ => unreachable!(),
        }
    }
}
