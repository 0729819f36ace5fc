//! Tendermint-style BFT consensus.
//!
//! The core is [ConsensusState], a single-threaded round state machine that
//! moves through propose, prevote and precommit for each height and commits
//! a block once more than two thirds of the voting power precommitted it.
//! Every input is written to a write-ahead log before it is acted on and
//! the log is replayed on restart, so a crashed validator resumes exactly
//! where it stopped and never signs conflicting votes.
//!
//! [ConsensusService] runs the state machine on its own task and
//! [ConsensusReactor] connects it to peers. Blocks are built, checked and
//! applied to the application by the [BlockExecutor].
mod config;
mod error;
mod event;
mod execution;
mod height_vote_set;
pub mod message;
mod reactor;
mod round_state;
mod service;
mod state;
mod timeout;
mod vote_set;
mod wal;

pub use config::{Config, TimeoutValues};
pub use error::{ConsensusError, ErrorKind, MessageError, VoteError};
pub use event::{ConsensusEvent, EventBus};
pub use execution::{
    verify_commit,
    BlockExecutor,
    BlockParams,
    BlockStore,
    ChainState,
    EvidencePool,
    ExecutionError,
    Genesis,
    GenesisValidator,
    MemoryBlockStore,
};
pub use height_vote_set::HeightVoteSet;
pub use message::ConsensusMessage;
pub use reactor::ConsensusReactor;
pub use round_state::{Hrs, RoundState, RoundStateSummary, RoundVotesSummary, Step};
pub use service::{ConsensusHandle, ConsensusInput, ConsensusService};
pub use state::{ConsensusState, Outbound};
pub use timeout::{TimeoutInfo, TimeoutTicker};
pub use vote_set::{VoteBits, VoteSet};
pub use wal::{ConsensusWal, FileWal, MsgInfo, NopWal, WalMessage};
