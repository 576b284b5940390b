//! Connector registration map.
//!
//! Keyed by access-code hash. At most one connector holds a hash at a time;
//! a new registration for a live hash preempts the previous holder, and the
//! caller is responsible for tearing the old connection down.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::protocol::Caps;
use crate::relay::peer::Peer;

/// One registered connector.
#[derive(Debug, Clone)]
pub struct AuthEntry {
    pub peer: Arc<Peer>,
    pub generation: u32,
    pub caps: Caps,
}

#[derive(Debug, Default)]
pub struct AuthMap {
    by_hash: RwLock<HashMap<String, AuthEntry>>,
}

impl AuthMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an entry, returning the previous holder when the hash was
    /// already registered.
    pub fn set(&self, access_code_hash: &str, entry: AuthEntry) -> Option<AuthEntry> {
        self.by_hash
            .write()
            .insert(access_code_hash.to_string(), entry)
    }

    pub fn get(&self, access_code_hash: &str) -> Option<AuthEntry> {
        self.by_hash.read().get(access_code_hash).cloned()
    }

    /// Remove every entry held by the given peer, returning the removed
    /// hashes. Linear in registered connectors, which stays small.
    pub fn delete_by_peer(&self, peer_id: &str) -> Vec<String> {
        let mut map = self.by_hash.write();
        let hashes: Vec<String> = map
            .iter()
            .filter(|(_, entry)| entry.peer.id() == peer_id)
            .map(|(hash, _)| hash.clone())
            .collect();
        for hash in &hashes {
            map.remove(hash);
        }
        hashes
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.by_hash.read().len()
    }
}
