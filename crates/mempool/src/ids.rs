//! Compact per-peer ids recorded as the senders of pending transactions.
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use replica_common::p2p::PeerId;

use crate::MempoolError;

/// Sender id of transactions that did not come from a peer.
pub const UNKNOWN_PEER_ID: u16 = 0;

const MAX_ACTIVE_IDS: usize = u16::MAX as usize;

#[derive(Debug)]
pub struct MempoolIds {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    peers: HashMap<PeerId, u16>,
    active: HashSet<u16>,
    next_id: u16,
}

impl Default for MempoolIds {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                peers: HashMap::new(),
                active: HashSet::from([UNKNOWN_PEER_ID]),
                next_id: 1,
            }),
        }
    }
}

impl MempoolIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the lowest free id after the last one handed out. Reserving
    /// for a peer that already has an id returns that id.
    pub fn reserve_for_peer(&self, peer: &PeerId) -> Result<u16, MempoolError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = inner.peers.get(peer) {
            return Ok(*id);
        }
        if inner.active.len() >= MAX_ACTIVE_IDS {
            return Err(MempoolError::TooManyPeers(inner.active.len()));
        }
        let mut id = inner.next_id;
        while inner.active.contains(&id) {
            id = id.wrapping_add(1);
        }
        inner.next_id = id.wrapping_add(1);
        inner.active.insert(id);
        inner.peers.insert(peer.clone(), id);
        Ok(id)
    }

    pub fn reclaim(&self, peer: &PeerId) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = inner.peers.remove(peer) {
            inner.active.remove(&id);
        }
    }

    /// The id of `peer`, or [UNKNOWN_PEER_ID] if it has none.
    pub fn get_for_peer(&self, peer: &PeerId) -> u16 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .peers
            .get(peer)
            .copied()
            .unwrap_or(UNKNOWN_PEER_ID)
    }
}
