use serde::{Deserialize, Serialize};

use crate::{Address, Hash, PubKey, Vote};

/// Two conflicting votes signed by the same validator for the same height,
/// round and vote type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateVoteEvidence {
    pub pub_key: PubKey,
    pub vote_a: Vote,
    pub vote_b: Vote,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvidenceError {
    #[error("votes are not for the same height, round and type")]
    MismatchedVotes,
    #[error("votes are from different validators")]
    DifferentValidators,
    #[error("votes are for the same block")]
    SameBlock,
    #[error("vote signature does not verify: {0}")]
    Signature(#[from] crate::vote::VerifyError),
}

impl DuplicateVoteEvidence {
    /// Orders the two votes by block id so equal evidence has equal hashes.
    pub fn new(pub_key: PubKey, vote_a: Vote, vote_b: Vote) -> Self {
        let (vote_a, vote_b) = if vote_a.block_id <= vote_b.block_id {
            (vote_a, vote_b)
        } else {
            (vote_b, vote_a)
        };
        Self {
            pub_key,
            vote_a,
            vote_b,
        }
    }

    pub fn height(&self) -> u64 {
        self.vote_a.height
    }

    pub fn address(&self) -> Address {
        self.vote_a.validator_address
    }

    pub fn hash(&self) -> Hash {
        Hash::digest_parts(&[
            self.pub_key.as_bytes(),
            self.vote_a.signature.as_bytes(),
            self.vote_b.signature.as_bytes(),
        ])
    }

    pub fn verify(&self, chain_id: &str) -> Result<(), EvidenceError> {
        let (a, b) = (&self.vote_a, &self.vote_b);
        if a.height != b.height || a.round != b.round || a.vote_type != b.vote_type {
            return Err(EvidenceError::MismatchedVotes);
        }
        if a.validator_address != b.validator_address || a.validator_index != b.validator_index {
            return Err(EvidenceError::DifferentValidators);
        }
        if a.block_id == b.block_id {
            return Err(EvidenceError::SameBlock);
        }
        a.verify(chain_id, &self.pub_key)?;
        b.verify(chain_id, &self.pub_key)?;
        Ok(())
    }
}
