//! # Nostr Overlay
//!
//! Asynchronous fallback transport over Nostr relays:
//!
//! - [`event`] - the event model and NIP-17-style gift wrapping
//! - [`pool`] - relay connection lifecycle, publish/subscribe, backoff
//!
//! Direct messages are carried as gift-wrapped events addressed by
//! recipient tag; the relay never sees sender identity or plaintext.

pub mod event;
pub mod pool;

pub use event::{gift_unwrap, gift_wrap, NostrEvent, KIND_GIFT_WRAP, KIND_SEAL};
pub use pool::{PoolConfig, PoolEvent, RelayPool, RelayStatus};
