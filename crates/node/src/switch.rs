use std::sync::{Arc, PoisonError, RwLock};

use replica_common::p2p::{Peer, PeerId, Switch};

/// The peers the transport layer reported as connected.
#[derive(Default)]
pub struct PeerSet {
    peers: RwLock<Vec<Arc<dyn Peer>>>,
}

impl PeerSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replaces a peer already known under the same id.
    pub fn insert(&self, peer: Arc<dyn Peer>) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        peers.retain(|p| p.id() != peer.id());
        peers.push(peer);
    }

    pub fn remove(&self, id: &PeerId) -> Option<Arc<dyn Peer>> {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        let index = peers.iter().position(|p| p.id() == id)?;
        Some(peers.remove(index))
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Switch for PeerSet {
    fn peers(&self) -> Vec<Arc<dyn Peer>> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|p| p.is_running())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use replica_common::test_utils::RecordingPeer;

    use super::*;

    #[test]
    fn broadcast_skips_stopped_peers() {
        let set = PeerSet::new();
        let a = RecordingPeer::new("a");
        let b = RecordingPeer::new("b");
        set.insert(a.clone());
        set.insert(b.clone());
        b.disconnect();

        set.broadcast(0x30, b"tx");
        assert_eq!(a.sent(), vec![(0x30, b"tx".to_vec())]);
        assert!(b.sent().is_empty());
        assert_eq!(set.peers().len(), 1);
    }

    #[test]
    fn reinserting_replaces_the_peer() {
        let set = PeerSet::new();
        set.insert(RecordingPeer::new("a"));
        set.insert(RecordingPeer::new("a"));
        assert_eq!(set.len(), 1);

        assert!(set.remove(&PeerId::new("a")).is_some());
        assert!(set.remove(&PeerId::new("a")).is_none());
        assert!(set.is_empty());
    }
}
