//! # Error Handling
//!
//! Error types for the whole protocol core, categorized by layer so that
//! callers can make retry/expire decisions without string matching.
//!
//! Error codes are grouped by domain:
//! - 100-199: Wire protocol (codec, fragmentation, padding)
//! - 200-299: Cryptography and handshake
//! - 300-399: Sessions
//! - 400-499: Mesh routing and peers
//! - 500-599: Transports and relays
//! - 600-699: Storage and outbox

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the protocol core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Wire Protocol Errors (100-199)
    // ========================================================================

    /// Buffer is too short to contain a packet header
    #[error("Truncated header: {0} bytes")]
    TruncatedHeader(usize),

    /// Announced payload length exceeds the remaining buffer
    #[error("Truncated body: expected {expected} more bytes, have {available}")]
    TruncatedBody {
        /// Bytes the header announced
        expected: usize,
        /// Bytes actually remaining
        available: usize,
    },

    /// Packet carries an unsupported protocol version
    #[error("Unknown protocol version: {0}")]
    UnknownVersion(u8),

    /// TTL field exceeds the protocol maximum
    #[error("Invalid TTL: {0} (max 7)")]
    InvalidTtl(u8),

    /// Message type byte is not a known constant
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// Malformed packet for reasons other than the above
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Payload exceeds the maximum encodable size
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Offending payload size
        size: usize,
        /// Protocol limit
        max: usize,
    },

    /// A fragmented message did not complete within the reassembly window
    #[error("Reassembly timed out for message {0}")]
    ReassemblyTimeout(String),

    /// Padded buffer fails the length-prefix check
    #[error("Invalid padding: {0}")]
    InvalidPadding(String),

    // ========================================================================
    // Crypto & Handshake Errors (200-299)
    // ========================================================================

    /// AEAD authentication failure, DH failure, or signature rejection
    #[error("Crypto failure: {0}")]
    CryptoFailure(String),

    /// A handshake message arrived out of turn for the current state
    #[error("Unexpected handshake message")]
    UnexpectedHandshakeMessage,

    /// The pending handshake passed its deadline
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// A handshake with this peer is already in flight
    #[error("Handshake already in progress with {0}")]
    HandshakeInProgress(String),

    // ========================================================================
    // Session Errors (300-399)
    // ========================================================================

    /// No completed session exists for the peer
    #[error("No session with peer {0}")]
    NoSession(String),

    // ========================================================================
    // Routing & Peer Errors (400-499)
    // ========================================================================

    /// The peer is blocked; traffic to/from it is refused
    #[error("Peer {0} is blocked")]
    PeerBlocked(String),

    /// No transport can currently reach the peer
    #[error("Peer {0} is unreachable")]
    PeerUnreachable(String),

    // ========================================================================
    // Transport & Relay Errors (500-599)
    // ========================================================================

    /// The selected transport cannot carry traffic right now
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A relay operation failed (connect, publish, subscribe)
    #[error("Relay error: {0}")]
    RelayError(String),

    // ========================================================================
    // Storage & Outbox Errors (600-699)
    // ========================================================================

    /// The persistence collaborator reported a failure
    #[error("Storage error: {0}")]
    StorageError(String),

    /// The outbox entry expired before it could be transmitted
    #[error("Outbox entry {0} expired")]
    OutboxExpired(String),

    /// Serialization of a persisted or wire record failed
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl Error {
    /// Numeric code for boundary consumers
    pub fn code(&self) -> i32 {
        match self {
            // Wire protocol (100-199)
            Error::TruncatedHeader(_) => 100,
            Error::TruncatedBody { .. } => 101,
            Error::UnknownVersion(_) => 102,
            Error::InvalidTtl(_) => 103,
            Error::UnknownMessageType(_) => 104,
            Error::InvalidPacket(_) => 105,
            Error::PayloadTooLarge { .. } => 106,
            Error::ReassemblyTimeout(_) => 107,
            Error::InvalidPadding(_) => 108,

            // Crypto & handshake (200-299)
            Error::CryptoFailure(_) => 200,
            Error::UnexpectedHandshakeMessage => 201,
            Error::HandshakeTimeout => 202,
            Error::HandshakeInProgress(_) => 203,

            // Sessions (300-399)
            Error::NoSession(_) => 300,

            // Routing & peers (400-499)
            Error::PeerBlocked(_) => 400,
            Error::PeerUnreachable(_) => 401,

            // Transports & relays (500-599)
            Error::TransportUnavailable(_) => 500,
            Error::RelayError(_) => 501,

            // Storage & outbox (600-699)
            Error::StorageError(_) => 600,
            Error::OutboxExpired(_) => 601,
            Error::SerializationError(_) => 602,
        }
    }

    /// Whether the message manager may retry the operation later.
    ///
    /// Transient transport conditions are retried with backoff; everything
    /// else is surfaced as a terminal failure for the affected operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::PeerUnreachable(_)
                | Error::TransportUnavailable(_)
                | Error::RelayError(_)
                | Error::NoSession(_)
                | Error::HandshakeInProgress(_)
                | Error::HandshakeTimeout
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StorageError(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================
