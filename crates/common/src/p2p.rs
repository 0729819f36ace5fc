//! The peer transport boundary. Connection handling, handshakes and
//! encryption live behind [Peer] and [Switch].
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

pub type ChannelId = u8;

pub const CONSENSUS_STATE_CHANNEL: ChannelId = 0x20;
pub const CONSENSUS_DATA_CHANNEL: ChannelId = 0x21;
pub const CONSENSUS_VOTE_CHANNEL: ChannelId = 0x22;
pub const CONSENSUS_VOTE_SET_BITS_CHANNEL: ChannelId = 0x23;
pub const MEMPOOL_CHANNEL: ChannelId = 0x30;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A connected peer.
pub trait Peer: Send + Sync {
    fn id(&self) -> &PeerId;

    /// Queues `msg` on `channel`. Returns `false` if the peer could not take
    /// it, for instance because its send queue is full or it disconnected.
    fn send(&self, channel: ChannelId, msg: Vec<u8>) -> bool;

    fn is_running(&self) -> bool {
        true
    }
}

/// The set of connected peers.
pub trait Switch: Send + Sync {
    fn peers(&self) -> Vec<Arc<dyn Peer>>;

    fn peer(&self, id: &PeerId) -> Option<Arc<dyn Peer>> {
        self.peers().into_iter().find(|p| p.id() == id)
    }

    fn broadcast(&self, channel: ChannelId, msg: &[u8]) {
        for peer in self.peers() {
            if !peer.send(channel, msg.to_vec()) {
                tracing::debug!(peer = %peer.id(), channel, "Broadcast dropped by peer");
            }
        }
    }
}

/// The consensus height each peer last announced. The consensus reactor
/// records it and the mempool reactor holds back transactions a peer is too
/// far behind to check.
#[derive(Clone, Debug, Default)]
pub struct PeerHeights(Arc<RwLock<HashMap<PeerId, u64>>>);

impl PeerHeights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, peer: &PeerId, height: u64) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.clone(), height);
    }

    /// `None` until `peer` announced a height.
    pub fn get(&self, peer: &PeerId) -> Option<u64> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .copied()
    }

    pub fn remove(&self, peer: &PeerId) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
    }
}
