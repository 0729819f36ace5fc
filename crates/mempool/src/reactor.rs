//! Transaction gossip. Every connected peer gets one task streaming the pool
//! to it in arrival order.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use replica_common::codec::{self, CodecError};
use replica_common::p2p::{Peer, PeerHeights, PeerId, MEMPOOL_CHANNEL};
use replica_common::Tx;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::{Mempool, MempoolError, MempoolIds, TxInfo};

const TX_TAG: u8 = 0x01;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MempoolMessage {
    Tx(Tx),
}

impl MempoolMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Tx(tx) => codec::frame(TX_TAG, tx.as_bytes()),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        match codec::unframe(bytes)? {
            (TX_TAG, payload) => Ok(Self::Tx(Tx::from(payload))),
            (tag, _) => Err(CodecError::UnknownTag(tag)),
        }
    }
}

/// Running gossip tasks by peer. The generation tells a task replaced by a
/// newer one for the same peer apart from the current one.
type GossipTasks = Arc<Mutex<HashMap<PeerId, (u64, CancellationToken)>>>;

pub struct MempoolReactor {
    mempool: Arc<Mempool>,
    ids: MempoolIds,
    heights: PeerHeights,
    peers: GossipTasks,
    generation: AtomicU64,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl MempoolReactor {
    pub fn new(mempool: Arc<Mempool>) -> Self {
        Self {
            mempool,
            ids: MempoolIds::new(),
            heights: PeerHeights::new(),
            peers: GossipTasks::default(),
            generation: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Gossip holds a transaction back from a peer whose announced height is
    /// more than one block behind the height it was admitted at.
    pub fn with_peer_heights(mut self, heights: PeerHeights) -> Self {
        self.heights = heights;
        self
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    /// Whether a gossip task for `peer_id` is still running.
    pub fn is_gossiping(&self, peer_id: &PeerId) -> bool {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(peer_id)
    }

    /// Assigns `peer` a mempool id and, if broadcasting is enabled, starts
    /// gossiping to it. Must be called within a tokio runtime.
    pub fn add_peer(&self, peer: Arc<dyn Peer>) -> Result<(), MempoolError> {
        let peer_id = peer.id().clone();
        let sender_id = self.ids.reserve_for_peer(&peer_id)?;
        if !self.mempool.config().broadcast {
            return Ok(());
        }

        let cancel = self.cancel.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer_id.clone(), (generation, cancel.clone()));
        if let Some((_, previous)) = previous {
            previous.cancel();
        }

        let gossip = Gossip {
            mempool: self.mempool.clone(),
            heights: self.heights.clone(),
            peer,
            sender_id,
            catchup_sleep: self.mempool.config().peer_catchup_sleep,
        };
        let peers = self.peers.clone();
        tracing::debug!(peer = %peer_id, sender_id, "Starting transaction gossip");
        self.tasks.spawn(async move {
            gossip.run(cancel).await;
            let mut peers = peers.lock().unwrap_or_else(PoisonError::into_inner);
            if peers.get(&peer_id).is_some_and(|(g, _)| *g == generation) {
                peers.remove(&peer_id);
            }
        });
        Ok(())
    }

    pub fn remove_peer(&self, peer_id: &PeerId) {
        let cancel = self
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer_id);
        if let Some((_, cancel)) = cancel {
            cancel.cancel();
        }
        self.ids.reclaim(peer_id);
        tracing::debug!(peer = %peer_id, "Removed peer from transaction gossip");
    }

    /// Handles a message from `peer_id` on the mempool channel.
    pub async fn receive(&self, peer_id: &PeerId, msg: &[u8]) -> Result<(), CodecError> {
        let MempoolMessage::Tx(tx) = MempoolMessage::decode(msg)?;
        let info = TxInfo::from_peer(self.ids.get_for_peer(peer_id));
        let hash = tx.hash();
        let mempool = self.mempool.clone();

        match tokio::task::spawn_blocking(move || mempool.check_tx(tx, info)).await {
            Ok(Ok(_)) => {}
            Ok(Err(MempoolError::TxInCache)) => {
                tracing::trace!(peer = %peer_id, tx = %hash, "Transaction already seen");
            }
            Ok(Err(error)) => {
                tracing::debug!(peer = %peer_id, tx = %hash, %error, "Could not add transaction from peer");
            }
            Err(error) => {
                tracing::error!(%error, "Transaction check task failed");
            }
        }
        Ok(())
    }

    /// Stops every gossip task and waits for them to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

struct Gossip {
    mempool: Arc<Mempool>,
    heights: PeerHeights,
    peer: Arc<dyn Peer>,
    sender_id: u16,
    catchup_sleep: Duration,
}

impl Gossip {
    /// Streams the pool to the peer until cancelled or the peer goes away.
    async fn run(self, cancel: CancellationToken) {
        let mut new_txs = self.mempool.subscribe();
        let mut cursor = 0;

        loop {
            if cancel.is_cancelled() || !self.peer.is_running() {
                break;
            }
            // Mark the current head seen before looking, so an insert between
            // the lookup and the wait still wakes us.
            new_txs.borrow_and_update();

            let Some(next) = self.mempool.next_after(cursor) else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = new_txs.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            };

            if self.is_lagging(next.height) {
                tracing::trace!(peer = %self.peer.id(), tx_height = next.height, "Peer behind, holding transactions back");
                if !self.back_off(&cancel).await {
                    break;
                }
                continue;
            }

            if !next.senders.contains(&self.sender_id) {
                let msg = MempoolMessage::Tx(next.tx).encode();
                if !self.peer.send(MEMPOOL_CHANNEL, msg) {
                    if !self.back_off(&cancel).await {
                        break;
                    }
                    continue;
                }
            }
            cursor = next.seq;
        }
        tracing::debug!(peer = %self.peer.id(), "Transaction gossip stopped");
    }

    /// A peer that has not announced a height yet is not held back.
    fn is_lagging(&self, tx_height: u64) -> bool {
        self.heights
            .get(self.peer.id())
            .is_some_and(|height| height < tx_height.saturating_sub(1))
    }

    /// Sleeps before a retry. `false` if cancelled meanwhile.
    async fn back_off(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.catchup_sleep) => true,
        }
    }
}
