//! Session store.
//!
//! A session pairs a client peer with a connector peer. The store keeps a
//! forward map by session id and a peer-indexed reverse table maintained in
//! lockstep, so a disconnecting peer's sessions are found without walking
//! peer-held pointers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::relay::peer::Peer;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub client: Arc<Peer>,
    pub connector: Arc<Peer>,
    pub e2ee: bool,
    pub created_at: SystemTime,
}

impl Session {
    /// The peer on the other side of the pairing, if the argument is a
    /// member of this session.
    pub fn opposite(&self, peer_id: &str) -> Option<&Arc<Peer>> {
        if self.client.id() == peer_id {
            Some(&self.connector)
        } else if self.connector.id() == peer_id {
            Some(&self.client)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    by_id: HashMap<String, Arc<Session>>,
    by_peer: HashMap<String, HashSet<String>>,
}

#[derive(Debug, Default)]
pub struct SessionStore {
    inner: RwLock<Inner>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, session: Arc<Session>) {
        let mut inner = self.inner.write();
        for peer_id in [session.client.id(), session.connector.id()] {
            inner
                .by_peer
                .entry(peer_id.to_string())
                .or_default()
                .insert(session.id.clone());
        }
        inner.by_id.insert(session.id.clone(), session);
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.read().by_id.get(session_id).cloned()
    }

    /// Remove a session, returning it if it existed. Once this returns, no
    /// subsequent `get` observes the session.
    pub fn delete(&self, session_id: &str) -> Option<Arc<Session>> {
        let mut inner = self.inner.write();
        let session = inner.by_id.remove(session_id)?;
        Self::unindex(&mut inner, &session);
        Some(session)
    }

    /// Atomically remove every session referencing the peer, returning them.
    pub fn delete_by_peer(&self, peer_id: &str) -> Vec<Arc<Session>> {
        let mut inner = self.inner.write();
        let Some(ids) = inner.by_peer.remove(peer_id) else {
            return Vec::new();
        };
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = inner.by_id.remove(&id) {
                Self::unindex(&mut inner, &session);
                removed.push(session);
            }
        }
        removed
    }

    /// Session ids currently indexed under a peer.
    pub fn sessions_for_peer(&self, peer_id: &str) -> Vec<String> {
        self.inner
            .read()
            .by_peer
            .get(peer_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of all live sessions.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.inner.read().by_id.values().cloned().collect()
    }

    fn unindex(inner: &mut Inner, session: &Session) {
        for peer_id in [session.client.id(), session.connector.id()] {
            if let Some(ids) = inner.by_peer.get_mut(peer_id) {
                ids.remove(&session.id);
                if ids.is_empty() {
                    inner.by_peer.remove(peer_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::peer::PeerRole;
    use tokio::sync::mpsc;

    fn test_peer(id: &str, role: PeerRole) -> Arc<Peer> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Peer::new(
            id.to_string(),
            role,
            tx,
            tokio_util::sync::CancellationToken::new(),
        ))
    }

    fn test_session(id: &str, client: &Arc<Peer>, connector: &Arc<Peer>) -> Arc<Session> {
        Arc::new(Session {
            id: id.to_string(),
            client: client.clone(),
            connector: connector.clone(),
            e2ee: false,
            created_at: SystemTime::now(),
        })
    }

    #[test]
    fn test_set_get_delete() {
        let store = SessionStore::new();
        let client = test_peer("u_1", PeerRole::Client);
        let connector = test_peer("c_1", PeerRole::Connector);
        store.set(test_session("s_1", &client, &connector));

        let session = store.get("s_1").unwrap();
        assert_eq!(session.client.id(), "u_1");
        assert_eq!(session.connector.id(), "c_1");

        let removed = store.delete("s_1").unwrap();
        assert_eq!(removed.id, "s_1");
        assert!(store.get("s_1").is_none());
        assert!(store.delete("s_1").is_none());
    }

    #[test]
    fn test_reverse_index_tracks_both_peers() {
        let store = SessionStore::new();
        let client = test_peer("u_1", PeerRole::Client);
        let connector = test_peer("c_1", PeerRole::Connector);
        store.set(test_session("s_1", &client, &connector));

        assert_eq!(store.sessions_for_peer("u_1"), vec!["s_1"]);
        assert_eq!(store.sessions_for_peer("c_1"), vec!["s_1"]);

        store.delete("s_1");
        assert!(store.sessions_for_peer("u_1").is_empty());
        assert!(store.sessions_for_peer("c_1").is_empty());
    }

    #[test]
    fn test_delete_by_peer_removes_all_references() {
        let store = SessionStore::new();
        let connector = test_peer("c_1", PeerRole::Connector);
        let a = test_peer("u_a", PeerRole::Client);
        let b = test_peer("u_b", PeerRole::Client);
        store.set(test_session("s_a", &a, &connector));
        store.set(test_session("s_b", &b, &connector));

        let mut removed: Vec<String> = store
            .delete_by_peer("c_1")
            .into_iter()
            .map(|s| s.id.clone())
            .collect();
        removed.sort();
        assert_eq!(removed, vec!["s_a", "s_b"]);

        // No subsequent get may succeed for a removed session.
        assert!(store.get("s_a").is_none());
        assert!(store.get("s_b").is_none());
        assert!(store.sessions_for_peer("u_a").is_empty());
        assert!(store.sessions_for_peer("u_b").is_empty());
        assert!(store.delete_by_peer("c_1").is_empty());
    }

    #[test]
    fn test_opposite() {
        let client = test_peer("u_1", PeerRole::Client);
        let connector = test_peer("c_1", PeerRole::Connector);
        let session = test_session("s_1", &client, &connector);

        assert_eq!(session.opposite("u_1").unwrap().id(), "c_1");
        assert_eq!(session.opposite("c_1").unwrap().id(), "u_1");
        assert!(session.opposite("u_other").is_none());
    }
}
