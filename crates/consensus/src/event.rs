//! Notifications published by the state machine as it makes progress.
use replica_common::{Address, BlockId, PartSetHeader, Vote};
use tokio::sync::broadcast;

use crate::Hrs;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsensusEvent {
    NewRoundStep(Hrs),
    /// A block with a polka, or the committed block, is now known.
    NewValidBlock {
        hrs: Hrs,
        parts: PartSetHeader,
        is_commit: bool,
    },
    NewRound {
        hrs: Hrs,
        proposer: Address,
    },
    /// The proposal and all of its block parts arrived.
    CompleteProposal {
        hrs: Hrs,
        block_id: BlockId,
    },
    Polka(Hrs),
    Lock(Hrs),
    Unlock(Hrs),
    Relock(Hrs),
    TimeoutPropose(Hrs),
    TimeoutWait(Hrs),
    Vote(Vote),
    /// A block was committed and applied.
    NewBlock {
        height: u64,
        block_id: BlockId,
        num_txs: usize,
    },
}

impl ConsensusEvent {
    /// The position the machine was at when it published the event.
    pub fn hrs(&self) -> Option<Hrs> {
        match self {
            ConsensusEvent::NewRoundStep(hrs)
            | ConsensusEvent::Polka(hrs)
            | ConsensusEvent::Lock(hrs)
            | ConsensusEvent::Unlock(hrs)
            | ConsensusEvent::Relock(hrs)
            | ConsensusEvent::TimeoutPropose(hrs)
            | ConsensusEvent::TimeoutWait(hrs) => Some(*hrs),
            ConsensusEvent::NewValidBlock { hrs, .. }
            | ConsensusEvent::NewRound { hrs, .. }
            | ConsensusEvent::CompleteProposal { hrs, .. } => Some(*hrs),
            ConsensusEvent::Vote(_) | ConsensusEvent::NewBlock { .. } => None,
        }
    }
}

/// Fan-out of [ConsensusEvent]s. Slow subscribers lose the oldest events
/// rather than stalling the state machine.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<ConsensusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ConsensusEvent) {
        // Nobody listening is fine.
        let _ = self.sender.send(event);
    }
}
