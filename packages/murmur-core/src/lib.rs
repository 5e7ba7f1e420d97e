//! # Murmur Core
//!
//! A decentralized peer-to-peer messaging core carrying authenticated,
//! end-to-end encrypted chat over two dissimilar transports: a Bluetooth
//! Low Energy broadcast mesh with TTL flood routing, and a Nostr relay
//! overlay used as an asynchronous fallback.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          MURMUR CORE MODULES                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────┐   ┌──────────────┐   ┌────────────────────────────┐   │
//! │  │  Message    │──►│  Transport   │──►│  BLE mesh   /  Nostr pool  │   │
//! │  │  Manager    │   │  Multiplexer │   │  (fragment)    (gift wrap) │   │
//! │  │ outbox+queue│   │ decision tree│   └────────────────────────────┘   │
//! │  └─────────────┘   └──────┬───────┘                                    │
//! │                           │                                            │
//! │  ┌─────────────┐   ┌──────▼───────┐   ┌────────────────────────────┐   │
//! │  │   Session   │◄──│     Mesh     │   │   Protocol                 │   │
//! │  │   Manager   │   │    Router    │   │   codec · padding ·        │   │
//! │  │  Noise XX   │   │ TTL + bloom  │   │   fragmentation            │   │
//! │  └──────┬──────┘   └──────────────┘   └────────────────────────────┘   │
//! │         │                                                              │
//! │  ┌──────▼──────────────────────────────────────────────────────────┐   │
//! │  │  Crypto: Curve25519 · Ed25519 · ChaCha20-Poly1305 · SHA-256    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## What the core owns
//!
//! - a length-prefixed binary framing with fragmentation and padded,
//!   traffic-analysis-resistant payloads
//! - a Noise XX handshake and per-peer transport cipher pair
//! - a session manager with handshake timeouts, idle expiry, and
//!   fingerprinting
//! - a mesh router with TTL-bounded relay, bloom-filter duplicate
//!   suppression, and a capped peer registry
//! - a transport multiplexer that selects, encrypts, fragments, transmits,
//!   reassembles, and decrypts
//! - a durable message manager with priority queueing, retry with backoff,
//!   and offline delivery
//!
//! The UI, IPC, window lifecycle, and settings persistence are external
//! collaborators: the core consumes an injected key-value store and an
//! injected BLE platform link, and publishes typed events on a broadcast
//! bus. There is no global state; a [`Core`] value owns its submanagers.

#![warn(missing_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod boundary;
pub mod crypto;
pub mod error;
pub mod events;
pub mod favorites;
pub mod mesh;
pub mod message;
pub mod metrics;
pub mod nostr;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod time;
pub mod transport;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use boundary::CoreHandle;
pub use crypto::Identity;
pub use error::{Error, Result};
pub use events::CoreEvent;
pub use protocol::PeerId;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::events::EventBus;
use crate::favorites::Favorites;
use crate::mesh::peers::PEER_IDLE_TIMEOUT_MS;
use crate::mesh::router::ROUTE_IDLE_MS;
use crate::mesh::{MeshRouter, PeerRegistry};
use crate::message::{MessageConfig, MessageManager, Outbox};
use crate::metrics::Metrics;
use crate::nostr::{PoolConfig, PoolEvent, RelayPool};
use crate::session::{SessionConfig, SessionManager};
use crate::storage::{KeyValueStore, IDENTITY_KEY};
use crate::transport::{BleLink, BleTransport, Multiplexer, MultiplexerConfig};

/// Default relay set; three relays is the recommended minimum.
pub const DEFAULT_RELAYS: [&str; 3] = [
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://offchain.pub",
];

/// Configuration for assembling a [`Core`].
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Display nickname announced to the mesh
    pub nickname: String,
    /// Relay URLs to connect on startup
    pub relay_urls: Vec<String>,
    /// Whether the Nostr fallback is enabled
    pub nostr_enabled: bool,
    /// Peer registry capacity
    pub max_peers: usize,
    /// Session timing
    pub session: SessionConfig,
    /// Outbox retry policy
    pub message: MessageConfig,
    /// Relay reconnect policy
    pub pool: PoolConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            nickname: "anonymous".to_string(),
            relay_urls: DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect(),
            nostr_enabled: true,
            max_peers: mesh::peers::DEFAULT_PEER_CAP,
            session: SessionConfig::default(),
            message: MessageConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

/// The assembled protocol core.
///
/// Construct with [`Core::new`], call [`Core::start`] once inside a tokio
/// runtime, and hand [`Core::handle`] to the boundary collaborator.
pub struct Core {
    identity: Arc<Identity>,
    config: CoreConfig,
    events: EventBus,
    registry: Arc<PeerRegistry>,
    sessions: Arc<SessionManager>,
    favorites: Arc<Favorites>,
    router: Arc<MeshRouter>,
    pool: Arc<RelayPool>,
    mux: Arc<Multiplexer>,
    manager: Arc<MessageManager>,
    metrics: Arc<Metrics>,
    pool_events: Mutex<Option<mpsc::UnboundedReceiver<PoolEvent>>>,
    sweepers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Core {
    /// Load the identity from the store, generating and persisting a fresh
    /// one on first launch.
    pub fn load_or_create_identity(
        store: &dyn KeyValueStore,
        nickname: &str,
    ) -> Result<Identity> {
        match store.get(IDENTITY_KEY)? {
            Some(blob) => {
                let identity = Identity::from_bytes(&blob)?;
                tracing::info!(fingerprint = identity.fingerprint().as_str(), "Identity loaded");
                Ok(identity)
            }
            None => {
                let identity = Identity::generate(nickname)?;
                store.put(IDENTITY_KEY, &identity.to_bytes()?)?;
                tracing::info!(
                    fingerprint = identity.fingerprint().as_str(),
                    "Fresh identity generated"
                );
                Ok(identity)
            }
        }
    }

    /// Assemble the core from injected capabilities.
    pub fn new(
        config: CoreConfig,
        store: Arc<dyn KeyValueStore>,
        ble_link: Arc<dyn BleLink>,
    ) -> Result<Self> {
        let identity = Arc::new(Self::load_or_create_identity(store.as_ref(), &config.nickname)?);
        let local_id = identity.peer_id();

        let events = EventBus::default();
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(PeerRegistry::new(config.max_peers));
        let sessions = Arc::new(SessionManager::new(
            local_id,
            crypto::NoiseKeyPair::from_bytes(&identity.noise().secret_bytes()),
            events.clone(),
            config.session.clone(),
        ));
        let router = Arc::new(MeshRouter::new(
            local_id,
            Arc::clone(&registry),
            Arc::clone(&metrics),
        ));
        let favorites = Arc::new(Favorites::load(Arc::clone(&store))?);

        let (pool_tx, pool_rx) = mpsc::unbounded_channel();
        let pool = RelayPool::new(config.pool.clone(), pool_tx, events.clone());

        let ble = BleTransport::new(ble_link);
        let mux = Multiplexer::new(
            Arc::clone(&identity),
            Arc::clone(&sessions),
            Arc::clone(&router),
            Arc::clone(&registry),
            Arc::clone(&favorites),
            ble,
            Arc::clone(&pool),
            Arc::clone(&metrics),
            events.clone(),
            MultiplexerConfig {
                nostr_enabled: config.nostr_enabled,
            },
        );

        let manager = MessageManager::new(
            local_id,
            Outbox::new(Arc::clone(&store)),
            Arc::clone(&mux),
            events.clone(),
            config.message.clone(),
        );

        Ok(Self {
            identity,
            config,
            events,
            registry,
            sessions,
            favorites,
            router,
            pool,
            mux,
            manager,
            metrics,
            pool_events: Mutex::new(Some(pool_rx)),
            sweepers: Mutex::new(Vec::new()),
        })
    }

    /// Start transports, workers, sweeps, and relay connections.
    pub async fn start(&self) -> Result<()> {
        let pool_rx = self
            .pool_events
            .lock()
            .take()
            .ok_or_else(|| Error::TransportUnavailable("core already started".to_string()))?;

        self.mux.start(pool_rx).await?;
        self.manager.start()?;
        let session_sweeper = self.sessions.spawn_sweeper();

        // Registry and routing-table sweep
        let registry = Arc::clone(&self.registry);
        let router = Arc::clone(&self.router);
        let mesh_sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                registry.sweep_idle(PEER_IDLE_TIMEOUT_MS);
                router.sweep_routes(ROUTE_IDLE_MS);
            }
        });

        if self.config.nostr_enabled {
            for url in &self.config.relay_urls {
                if let Err(e) = self.pool.add_relay(url) {
                    tracing::warn!(relay = url.as_str(), error = %e, "Skipping relay");
                }
            }
        }

        let mut sweepers = self.sweepers.lock();
        sweepers.push(session_sweeper);
        sweepers.push(mesh_sweeper);

        tracing::info!(
            peer_id = %self.identity.peer_id(),
            nickname = self.identity.nickname(),
            "Core started"
        );
        Ok(())
    }

    /// Announce departure and stop all background work.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.mux.send_leave().await;
        self.manager.stop();
        for task in self.sweepers.lock().drain(..) {
            task.abort();
        }
        for peer in self.sessions.established_peers() {
            self.sessions.close(peer);
        }
        self.mux.stop().await?;
        tracing::info!("Core shut down");
        Ok(())
    }

    /// The façade for the boundary collaborator.
    pub fn handle(&self) -> CoreHandle {
        CoreHandle {
            local_id: self.identity.peer_id(),
            fingerprint: self.identity.fingerprint(),
            nickname: self.identity.nickname().to_string(),
            events: self.events.clone(),
            registry: Arc::clone(&self.registry),
            sessions: Arc::clone(&self.sessions),
            favorites: Arc::clone(&self.favorites),
            manager: Arc::clone(&self.manager),
            mux: Arc::clone(&self.mux),
            pool: Arc::clone(&self.pool),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
