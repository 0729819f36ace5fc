//! Error types for the consensus engine.

use std::fmt;

use replica_common::codec::CodecError;
use replica_common::{Address, DuplicateVoteEvidence, PartSetError, VerifyError, VoteType};

/// An error that occurred in the consensus engine.
///
/// This error type wraps internal errors and provides information about
/// whether the error is fatal. Fatal errors stop the engine: continuing after
/// an entry failed to reach the WAL could make the node sign conflicting
/// votes once it restarts.
#[derive(Debug)]
pub struct ConsensusError {
    inner: anyhow::Error,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An input could not be written to the WAL before acting on it.
    WalWrite,
    /// The WAL could not be replayed (e.g., corrupted entry).
    WalRecovery,
    /// A decided block could not be saved or applied.
    Execution,
    /// A message from a peer was malformed or did not verify.
    InvalidMessage,
}

impl ConsensusError {
    pub fn wal_write(error: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: error.into(),
            kind: ErrorKind::WalWrite,
        }
    }

    pub fn wal_recovery(error: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: error.into(),
            kind: ErrorKind::WalRecovery,
        }
    }

    pub fn execution(error: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: error.into(),
            kind: ErrorKind::Execution,
        }
    }

    pub fn invalid_message(error: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: error.into(),
            kind: ErrorKind::InvalidMessage,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Check if this error must stop the engine.
    pub fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }

    /// Check if this error is recoverable.
    ///
    /// Recoverable errors concern a single message; the engine logs them and
    /// carries on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind, ErrorKind::InvalidMessage)
    }
}

impl fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ConsensusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

/// Why a vote was not added to a vote set.
#[derive(Debug, thiserror::Error)]
pub enum VoteError {
    #[error("expected {expected_height}/{expected_round}/{expected_type}, got {height}/{round}/{vote_type}")]
    UnexpectedStep {
        expected_height: u64,
        expected_round: u32,
        expected_type: VoteType,
        height: u64,
        round: u32,
        vote_type: VoteType,
    },
    #[error("invalid validator index {0}")]
    InvalidValidatorIndex(u32),
    #[error("validator address {got} does not match index {index}")]
    InvalidValidatorAddress { index: u32, got: Address },
    #[error("invalid vote signature: {0}")]
    InvalidSignature(#[from] VerifyError),
    #[error("same vote with a different signature from validator {0}")]
    NonDeterministicSignature(u32),
    /// The vote conflicts with one already recorded from the same validator.
    /// The vote may still have been added, when a peer claimed a quorum for
    /// its block.
    #[error("conflicting votes from validator {}", .evidence.address())]
    Conflicting {
        evidence: Box<DuplicateVoteEvidence>,
        added: bool,
    },
    #[error("vote for round {round} which is neither current nor a catch-up round")]
    UnwantedRound { round: u32 },
    #[error("peer claims 2/3+ for two blocks in round {round}")]
    ConflictingPeerMaj23 { round: u32 },
}

/// A consensus wire message that could not be decoded or failed its basic
/// checks.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("message tag {tag:#04x} arrived on channel {channel:#04x}")]
    WrongChannel { tag: u8, channel: u8 },
    #[error("invalid block part: {0}")]
    Part(#[from] PartSetError),
    #[error("invalid {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rstest::rstest]
    #[case::wal_write(ConsensusError::wal_write(anyhow::anyhow!("disk full")), true)]
    #[case::wal_recovery(ConsensusError::wal_recovery(anyhow::anyhow!("bad frame")), true)]
    #[case::execution(ConsensusError::execution(anyhow::anyhow!("app crashed")), true)]
    #[case::invalid_message(ConsensusError::invalid_message(anyhow::anyhow!("bad sig")), false)]
    fn classification(#[case] error: ConsensusError, #[case] fatal: bool) {
        assert_eq!(error.is_fatal(), fatal);
        assert_eq!(error.is_recoverable(), !fatal);
    }
}
