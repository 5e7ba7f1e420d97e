//! Favorites map.
//!
//! Favorites are the peers we keep Nostr reachability for. The Nostr path
//! only opens up when the relationship is mutual: we favorited them and a
//! `FAVORITED` packet told us they favorited us. Entries persist through
//! the key-value contract under `favorites/<peer_id>`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::crypto::NostrPublicKey;
use crate::error::Result;
use crate::protocol::PeerId;
use crate::storage::{KeyValueStore, FAVORITES_PREFIX};
use crate::time::now_millis;

/// One favorites row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FavoriteEntry {
    pub peer_id: PeerId,
    pub nickname: String,
    /// Noise static public key
    pub noise_public: [u8; 32],
    /// Nostr keys, when the peer announced them
    pub nostr_public: Option<NostrPublicKey>,
    pub added_at: u64,
    /// We marked them as a favorite
    pub we_favorited: bool,
    /// They told us they favorited us
    pub favorited_us: bool,
}

impl FavoriteEntry {
    /// Both directions confirmed.
    pub fn is_mutual(&self) -> bool {
        self.we_favorited && self.favorited_us
    }
}

/// Persisted favorites with an in-memory cache.
pub struct Favorites {
    store: Arc<dyn KeyValueStore>,
    cache: RwLock<HashMap<PeerId, FavoriteEntry>>,
}

impl Favorites {
    /// Load all rows from the store.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let mut cache = HashMap::new();
        for (key, value) in store.scan_prefix(FAVORITES_PREFIX)? {
            match bincode::deserialize::<FavoriteEntry>(&value) {
                Ok(entry) => {
                    cache.insert(entry.peer_id, entry);
                }
                Err(e) => {
                    tracing::warn!(key = key.as_str(), error = %e, "Skipping corrupt favorite row");
                }
            }
        }
        Ok(Self {
            store,
            cache: RwLock::new(cache),
        })
    }

    fn key_for(peer: PeerId) -> String {
        format!("{}{}", FAVORITES_PREFIX, peer.to_hex())
    }

    fn persist(&self, entry: &FavoriteEntry) -> Result<()> {
        self.store
            .put(&Self::key_for(entry.peer_id), &bincode::serialize(entry)?)
    }

    /// Mark a peer as our favorite, creating or updating its row.
    pub fn add(
        &self,
        peer: PeerId,
        nickname: &str,
        noise_public: [u8; 32],
        nostr_public: Option<NostrPublicKey>,
    ) -> Result<()> {
        let mut cache = self.cache.write();
        let entry = cache.entry(peer).or_insert_with(|| FavoriteEntry {
            peer_id: peer,
            nickname: nickname.to_string(),
            noise_public,
            nostr_public,
            added_at: now_millis(),
            we_favorited: false,
            favorited_us: false,
        });
        entry.we_favorited = true;
        entry.nickname = nickname.to_string();
        entry.noise_public = noise_public;
        if nostr_public.is_some() {
            entry.nostr_public = nostr_public;
        }
        self.persist(entry)
    }

    /// Unmark a peer. The row survives while they still favorite us.
    pub fn remove(&self, peer: PeerId) -> Result<bool> {
        let mut cache = self.cache.write();
        match cache.get_mut(&peer) {
            Some(entry) if entry.favorited_us => {
                entry.we_favorited = false;
                self.persist(entry)?;
                Ok(true)
            }
            Some(_) => {
                cache.remove(&peer);
                self.store.delete(&Self::key_for(peer))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Record a `FAVORITED` / `UNFAVORITED` notification from a peer.
    ///
    /// Creates a shadow row when we have not favorited them ourselves, so
    /// mutuality is detected as soon as we do.
    pub fn set_favorited_us(
        &self,
        peer: PeerId,
        nickname: &str,
        noise_public: [u8; 32],
        nostr_public: Option<NostrPublicKey>,
        favorited_us: bool,
    ) -> Result<()> {
        let mut cache = self.cache.write();
        match cache.get_mut(&peer) {
            Some(entry) => {
                entry.favorited_us = favorited_us;
                if nostr_public.is_some() {
                    entry.nostr_public = nostr_public;
                }
                if !entry.we_favorited && !entry.favorited_us {
                    cache.remove(&peer);
                    return self.store.delete(&Self::key_for(peer));
                }
                self.persist(entry)
            }
            None if favorited_us => {
                let entry = FavoriteEntry {
                    peer_id: peer,
                    nickname: nickname.to_string(),
                    noise_public,
                    nostr_public,
                    added_at: now_millis(),
                    we_favorited: false,
                    favorited_us: true,
                };
                self.persist(&entry)?;
                cache.insert(peer, entry);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Whether the Nostr path is open for this peer.
    pub fn is_mutual(&self, peer: PeerId) -> bool {
        self.cache
            .read()
            .get(&peer)
            .map(FavoriteEntry::is_mutual)
            .unwrap_or(false)
    }

    /// Nostr keys of a favorite.
    pub fn nostr_key_of(&self, peer: PeerId) -> Option<NostrPublicKey> {
        self.cache.read().get(&peer).and_then(|e| e.nostr_public)
    }

    /// Reverse lookup: which peer announced this Nostr signing key.
    pub fn peer_by_nostr_signing(&self, signing: &[u8; 32]) -> Option<PeerId> {
        self.cache
            .read()
            .values()
            .find(|entry| {
                entry
                    .nostr_public
                    .map(|keys| keys.signing == *signing)
                    .unwrap_or(false)
            })
            .map(|entry| entry.peer_id)
    }

    /// One row.
    pub fn get(&self, peer: PeerId) -> Option<FavoriteEntry> {
        self.cache.read().get(&peer).cloned()
    }

    /// All rows.
    pub fn all(&self) -> Vec<FavoriteEntry> {
        self.cache.read().values().cloned().collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn nostr_keys(n: u8) -> NostrPublicKey {
        NostrPublicKey {
            signing: [n; 32],
            encryption: [n.wrapping_add(1); 32],
        }
    }

    #[test]
    fn test_mutuality() {
        let favorites = Favorites::load(Arc::new(MemoryStore::new())).unwrap();
        let peer = PeerId::new([1; 8]);

        favorites
            .add(peer, "bob", [1; 32], Some(nostr_keys(7)))
            .unwrap();
        assert!(!favorites.is_mutual(peer));

        favorites
            .set_favorited_us(peer, "bob", [1; 32], None, true)
            .unwrap();
        assert!(favorites.is_mutual(peer));

        favorites
            .set_favorited_us(peer, "bob", [1; 32], None, false)
            .unwrap();
        assert!(!favorites.is_mutual(peer));
    }

    #[test]
    fn test_persistence_across_reload() {
        let store = Arc::new(MemoryStore::new());
        {
            let favorites = Favorites::load(Arc::clone(&store) as Arc<dyn KeyValueStore>).unwrap();
            favorites
                .add(PeerId::new([2; 8]), "carol", [2; 32], Some(nostr_keys(9)))
                .unwrap();
        }
        let favorites = Favorites::load(store).unwrap();
        let entry = favorites.get(PeerId::new([2; 8])).unwrap();
        assert_eq!(entry.nickname, "carol");
        assert!(entry.we_favorited);
        assert_eq!(entry.nostr_public, Some(nostr_keys(9)));
    }

    #[test]
    fn test_shadow_row_from_peer_side() {
        let favorites = Favorites::load(Arc::new(MemoryStore::new())).unwrap();
        let peer = PeerId::new([3; 8]);

        // They favorite us first
        favorites
            .set_favorited_us(peer, "dave", [3; 32], Some(nostr_keys(4)), true)
            .unwrap();
        assert!(!favorites.is_mutual(peer));

        // The moment we reciprocate, it is mutual
        favorites.add(peer, "dave", [3; 32], None).unwrap();
        assert!(favorites.is_mutual(peer));
        // The shadow row's Nostr keys were kept
        assert_eq!(favorites.nostr_key_of(peer), Some(nostr_keys(4)));
    }

    #[test]
    fn test_remove_keeps_their_side() {
        let favorites = Favorites::load(Arc::new(MemoryStore::new())).unwrap();
        let peer = PeerId::new([4; 8]);

        favorites.add(peer, "erin", [4; 32], None).unwrap();
        favorites
            .set_favorited_us(peer, "erin", [4; 32], None, true)
            .unwrap();

        favorites.remove(peer).unwrap();
        assert!(!favorites.is_mutual(peer));
        // Row survives because they still favorite us
        assert!(favorites.get(peer).is_some());

        favorites
            .set_favorited_us(peer, "erin", [4; 32], None, false)
            .unwrap();
        assert!(favorites.get(peer).is_none());
    }

    #[test]
    fn test_reverse_lookup() {
        let favorites = Favorites::load(Arc::new(MemoryStore::new())).unwrap();
        let peer = PeerId::new([5; 8]);
        favorites
            .add(peer, "frank", [5; 32], Some(nostr_keys(11)))
            .unwrap();

        assert_eq!(favorites.peer_by_nostr_signing(&[11; 32]), Some(peer));
        assert_eq!(favorites.peer_by_nostr_signing(&[99; 32]), None);
    }
}
