//! Votes of one type for one height and round, with incremental quorum
//! tracking per block id.
use std::collections::HashMap;

use bitvec::prelude::*;
use replica_common::p2p::PeerId;
use replica_common::{BlockId, Commit, DuplicateVoteEvidence, ValidatorSet, Vote, VoteType};

use crate::VoteError;

/// One bit per validator, in validator set order.
pub type VoteBits = BitVec<u8, Lsb0>;

#[derive(Clone, Debug)]
pub struct VoteSet {
    chain_id: String,
    height: u64,
    round: u32,
    vote_type: VoteType,
    validators: ValidatorSet,
    votes_bit_array: VoteBits,
    /// The vote counted for each validator. Once a block reaches 2/3+ this
    /// holds the validator's vote for that block where there is one.
    votes: Vec<Option<Vote>>,
    sum: i64,
    maj23: Option<BlockId>,
    votes_by_block: HashMap<BlockId, BlockVotes>,
    peer_maj23s: HashMap<PeerId, BlockId>,
}

#[derive(Clone, Debug)]
struct BlockVotes {
    /// A peer claimed 2/3+ for this block, so conflicting votes for it are
    /// tracked too.
    peer_maj23: bool,
    bit_array: VoteBits,
    votes: Vec<Option<Vote>>,
    sum: i64,
}

impl BlockVotes {
    fn new(peer_maj23: bool, size: usize) -> Self {
        Self {
            peer_maj23,
            bit_array: bitvec![u8, Lsb0; 0; size],
            votes: vec![None; size],
            sum: 0,
        }
    }

    fn add_verified_vote(&mut self, vote: Vote, power: i64) {
        let index = vote.validator_index as usize;
        if self.votes[index].is_none() {
            self.bit_array.set(index, true);
            self.votes[index] = Some(vote);
            self.sum += power;
        }
    }
}

impl VoteSet {
    pub fn new(
        chain_id: impl Into<String>,
        height: u64,
        round: u32,
        vote_type: VoteType,
        validators: ValidatorSet,
    ) -> Self {
        let size = validators.len();
        Self {
            chain_id: chain_id.into(),
            height,
            round,
            vote_type,
            validators,
            votes_bit_array: bitvec![u8, Lsb0; 0; size],
            votes: vec![None; size],
            sum: 0,
            maj23: None,
            votes_by_block: HashMap::new(),
            peer_maj23s: HashMap::new(),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    /// Verifies and records `vote`. Returns `Ok(false)` for an exact
    /// duplicate.
    ///
    /// A second vote from the same validator for a different block is
    /// reported as [VoteError::Conflicting] with the evidence. It is still
    /// counted towards its block if a peer claimed 2/3+ for that block.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteError> {
        let index = vote.validator_index;
        if vote.height != self.height || vote.round != self.round || vote.vote_type != self.vote_type
        {
            return Err(VoteError::UnexpectedStep {
                expected_height: self.height,
                expected_round: self.round,
                expected_type: self.vote_type,
                height: vote.height,
                round: vote.round,
                vote_type: vote.vote_type,
            });
        }
        let Some(validator) = self.validators.get_by_index(index) else {
            return Err(VoteError::InvalidValidatorIndex(index));
        };
        if validator.address != vote.validator_address {
            return Err(VoteError::InvalidValidatorAddress {
                index,
                got: vote.validator_address,
            });
        }
        let (pub_key, power) = (validator.pub_key, validator.voting_power);

        if let Some(existing) = self.get_vote(index, &vote.block_id) {
            if existing.signature == vote.signature {
                return Ok(false);
            }
            return Err(VoteError::NonDeterministicSignature(index));
        }

        vote.verify(&self.chain_id, &pub_key)?;

        let (added, conflicting) = self.add_verified_vote(vote.clone(), power);
        match conflicting {
            Some(existing) => Err(VoteError::Conflicting {
                evidence: Box::new(DuplicateVoteEvidence::new(pub_key, existing, vote)),
                added,
            }),
            None => Ok(added),
        }
    }

    fn get_vote(&self, index: u32, block_id: &BlockId) -> Option<&Vote> {
        let index = index as usize;
        if let Some(vote) = self.votes[index].as_ref() {
            if &vote.block_id == block_id {
                return Some(vote);
            }
        }
        self.votes_by_block
            .get(block_id)
            .and_then(|votes| votes.votes[index].as_ref())
    }

    fn add_verified_vote(&mut self, vote: Vote, power: i64) -> (bool, Option<Vote>) {
        let index = vote.validator_index as usize;
        let block_id = vote.block_id;

        let conflicting = self.votes[index].clone();
        match conflicting {
            // Votes for the majority block replace whatever the validator
            // was counted for before.
            Some(_) if self.maj23 == Some(block_id) => {
                self.votes[index] = Some(vote.clone());
                self.votes_bit_array.set(index, true);
            }
            Some(_) => {}
            None => {
                self.votes[index] = Some(vote.clone());
                self.votes_bit_array.set(index, true);
                self.sum += power;
            }
        }

        match self.votes_by_block.get(&block_id) {
            Some(by_block) if conflicting.is_some() && !by_block.peer_maj23 => {
                return (false, conflicting);
            }
            None if conflicting.is_some() => return (false, conflicting),
            _ => {}
        }
        let size = self.size();
        let by_block = self
            .votes_by_block
            .entry(block_id)
            .or_insert_with(|| BlockVotes::new(false, size));

        let threshold = self.validators.two_thirds_threshold();
        let before = by_block.sum;
        by_block.add_verified_vote(vote, power);
        if before <= threshold && by_block.sum > threshold && self.maj23.is_none() {
            self.maj23 = Some(block_id);
            for (index, vote) in by_block.votes.iter().enumerate() {
                if let Some(vote) = vote {
                    self.votes[index] = Some(vote.clone());
                }
            }
        }
        (true, conflicting)
    }

    /// Records a peer's claim that `block_id` has 2/3+ in this set.
    pub fn set_peer_maj23(&mut self, peer: PeerId, block_id: BlockId) -> Result<(), VoteError> {
        if let Some(claimed) = self.peer_maj23s.get(&peer) {
            if claimed == &block_id {
                return Ok(());
            }
            return Err(VoteError::ConflictingPeerMaj23 { round: self.round });
        }
        self.peer_maj23s.insert(peer, block_id);

        let size = self.size();
        self.votes_by_block
            .entry(block_id)
            .or_insert_with(|| BlockVotes::new(true, size))
            .peer_maj23 = true;
        Ok(())
    }

    pub fn bit_array(&self) -> VoteBits {
        self.votes_bit_array.clone()
    }

    /// Validators that voted for `block_id`, if anyone did.
    pub fn bit_array_by_block_id(&self, block_id: &BlockId) -> Option<VoteBits> {
        self.votes_by_block
            .get(block_id)
            .map(|votes| votes.bit_array.clone())
    }

    pub fn get_by_index(&self, index: u32) -> Option<&Vote> {
        self.votes.get(index as usize).and_then(Option::as_ref)
    }

    pub fn votes(&self) -> impl Iterator<Item = &Vote> {
        self.votes.iter().flatten()
    }

    pub fn sum(&self) -> i64 {
        self.sum
    }

    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    /// The block (possibly nil) with 2/3+ of the voting power.
    pub fn two_thirds_majority(&self) -> Option<BlockId> {
        self.maj23
    }

    /// 2/3+ of the voting power voted, for whatever.
    pub fn has_two_thirds_any(&self) -> bool {
        self.sum > self.validators.two_thirds_threshold()
    }

    pub fn has_all(&self) -> bool {
        self.sum == self.validators.total_voting_power()
    }

    /// The commit formed by a precommit set with a non-nil majority.
    pub fn make_commit(&self) -> Option<Commit> {
        if self.vote_type != VoteType::Precommit {
            return None;
        }
        let block_id = self.maj23.filter(|id| !id.is_nil())?;
        let precommits = self
            .votes
            .iter()
            .map(|vote| {
                vote.as_ref()
                    .filter(|v| v.is_nil() || v.block_id == block_id)
                    .cloned()
            })
            .collect();
        Some(Commit::new(block_id, precommits))
    }

    /// Compact `x`/`_` rendering of who voted, for logs and summaries.
    pub fn bits_string(&self) -> String {
        self.votes_bit_array
            .iter()
            .map(|bit| if *bit { 'x' } else { '_' })
            .collect()
    }
}

impl std::fmt::Display for VoteSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "VoteSet{{{}/{}/{} {} {}/{}",
            self.height,
            self.round,
            self.vote_type,
            self.bits_string(),
            self.sum,
            self.validators.total_voting_power()
        )?;
        match self.maj23 {
            Some(block_id) => write!(f, " maj23={block_id}}}"),
            None => f.write_str("}"),
        }
    }
}
