//! The peer side of consensus: decodes what peers send into
//! [ConsensusInput]s and delivers what the state machine queues for peers.
use std::sync::Arc;

use replica_common::p2p::{ChannelId, PeerHeights, PeerId, Switch};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::{ConsensusInput, ConsensusMessage, MessageError, MsgInfo, Outbound};

pub struct ConsensusReactor {
    switch: Arc<dyn Switch>,
    inputs: mpsc::Sender<ConsensusInput>,
    heights: PeerHeights,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ConsensusReactor {
    pub fn new(switch: Arc<dyn Switch>, inputs: mpsc::Sender<ConsensusInput>) -> Self {
        Self {
            switch,
            inputs,
            heights: PeerHeights::new(),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Records the height each peer announces into `heights`.
    pub fn with_peer_heights(mut self, heights: PeerHeights) -> Self {
        self.heights = heights;
        self
    }

    /// Starts delivering `outbound`. Must be called within a tokio runtime.
    pub fn start(&self, outbound: mpsc::UnboundedReceiver<Outbound>) {
        self.tasks.spawn(deliver(
            self.switch.clone(),
            outbound,
            self.cancel.child_token(),
        ));
    }

    pub async fn add_peer(&self, peer: PeerId) {
        tracing::debug!(%peer, "Consensus peer added");
        self.forward(ConsensusInput::PeerAdded(peer)).await;
    }

    /// Handles `bytes` from `peer` on one of the consensus channels.
    pub async fn receive(
        &self,
        peer: &PeerId,
        channel: ChannelId,
        bytes: &[u8],
    ) -> Result<(), MessageError> {
        let msg = ConsensusMessage::decode(channel, bytes)?;
        tracing::trace!(%peer, %msg, "Received consensus message");

        let input = match msg {
            ConsensusMessage::NewRoundStep(status) => {
                self.heights.set(peer, status.height);
                ConsensusInput::PeerStatus {
                    peer: peer.clone(),
                    status,
                }
            }
            ConsensusMessage::VoteSetMaj23(msg) => ConsensusInput::PeerMaj23 {
                peer: peer.clone(),
                msg,
            },
            // Hints for per-peer gossip bookkeeping, which answers peers from
            // their announced position instead.
            ConsensusMessage::HasVote(_)
            | ConsensusMessage::NewValidBlock(_)
            | ConsensusMessage::ProposalPol(_)
            | ConsensusMessage::VoteSetBits(_) => return Ok(()),
            msg => ConsensusInput::Message(MsgInfo::from_peer(msg, peer.clone())),
        };
        self.forward(input).await;
        Ok(())
    }

    /// Stops delivery and waits for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn forward(&self, input: ConsensusInput) {
        if self.inputs.send(input).await.is_err() {
            tracing::debug!("Consensus stopped, dropping peer input");
        }
    }
}

async fn deliver(
    switch: Arc<dyn Switch>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = outbound.recv() => next,
        };
        let Some(next) = next else {
            break;
        };
        let (target, msg) = match next {
            Outbound::Broadcast(msg) => (None, msg),
            Outbound::ToPeer(peer, msg) => (Some(peer), msg),
        };
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::error!(%error, %msg, "Failed encoding consensus message");
                continue;
            }
        };
        match target {
            None => switch.broadcast(msg.channel(), &bytes),
            Some(peer_id) => match switch.peer(&peer_id) {
                Some(peer) => {
                    if !peer.send(msg.channel(), bytes) {
                        tracing::debug!(peer = %peer_id, %msg, "Peer did not take consensus message");
                    }
                }
                None => tracing::trace!(peer = %peer_id, "Peer gone, dropping consensus message"),
            },
        }
    }
    tracing::debug!("Consensus message delivery stopped");
}
