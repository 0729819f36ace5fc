//! Data model shared by the replica consensus engine, mempool and WAL:
//! blocks and their parts, votes and proposals, validator sets, signing and
//! the application and peer boundaries.
pub mod app;
mod block;
pub mod codec;
mod evidence;
pub mod hash;
mod macros;
pub mod merkle;
pub mod p2p;
mod part_set;
mod proposal;
pub mod signer;
mod time;
mod validator;
mod vote;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use block::{Block, BlockError, BlockId, Commit, Header, PartSetHeader, Tx, BLOCK_PART_SIZE};
pub use evidence::{DuplicateVoteEvidence, EvidenceError};
pub use hash::Hash;
pub use macros::hex_bytes;
pub use part_set::{Part, PartSet, PartSetError};
pub use proposal::Proposal;
pub use signer::{LocalSigner, PrivValidator, SignerError};
pub use time::Timestamp;
pub use validator::{
    Address,
    PubKey,
    Signature,
    Validator,
    ValidatorSet,
    ValidatorSetError,
    MAX_TOTAL_VOTING_POWER,
};
pub use vote::{VerifyError, Vote, VoteType};
