//! Prevotes and precommits of every round of one height.
//!
//! Rounds up to the current one are always tracked. A peer may additionally
//! open at most two rounds beyond that, so that nodes that fell behind can
//! still catch up without letting a peer allocate vote sets for arbitrary
//! rounds.
use std::collections::{BTreeMap, HashMap};

use replica_common::p2p::PeerId;
use replica_common::{BlockId, ValidatorSet, Vote, VoteType};

use crate::{VoteError, VoteSet};

const MAX_PEER_CATCHUP_ROUNDS: usize = 2;

#[derive(Clone, Debug)]
struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

#[derive(Clone, Debug)]
pub struct HeightVoteSet {
    chain_id: String,
    height: u64,
    validators: ValidatorSet,
    round: u32,
    round_vote_sets: BTreeMap<u32, RoundVoteSet>,
    /// Rounds each sender opened ahead of ours. Our own votes are keyed by
    /// `None`.
    peer_catchup_rounds: HashMap<Option<PeerId>, Vec<u32>>,
}

impl HeightVoteSet {
    pub fn new(chain_id: impl Into<String>, height: u64, validators: ValidatorSet) -> Self {
        let mut set = Self {
            chain_id: chain_id.into(),
            height,
            validators,
            round: 0,
            round_vote_sets: BTreeMap::new(),
            peer_catchup_rounds: HashMap::new(),
        };
        set.add_round(0);
        set
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    /// Moves to `round`, creating vote sets for every round up to it.
    /// Going back more than one round is ignored.
    pub fn set_round(&mut self, round: u32) {
        let from = self.round.saturating_sub(1);
        if self.round != 0 && round < from {
            tracing::warn!(height = %self.height, current = %self.round, %round, "Refusing to move vote sets backwards");
            return;
        }
        for r in from..=round {
            if !self.round_vote_sets.contains_key(&r) {
                self.add_round(r);
            }
        }
        self.round = round;
    }

    fn add_round(&mut self, round: u32) {
        let prevotes = VoteSet::new(
            self.chain_id.clone(),
            self.height,
            round,
            VoteType::Prevote,
            self.validators.clone(),
        );
        let precommits = VoteSet::new(
            self.chain_id.clone(),
            self.height,
            round,
            VoteType::Precommit,
            self.validators.clone(),
        );
        self.round_vote_sets.insert(
            round,
            RoundVoteSet {
                prevotes,
                precommits,
            },
        );
    }

    /// Adds a vote received from `peer` (`None` for our own). Votes for
    /// rounds not yet tracked open that round, up to two per sender;
    /// beyond that they fail with [VoteError::UnwantedRound].
    pub fn add_vote(&mut self, vote: Vote, peer: Option<&PeerId>) -> Result<bool, VoteError> {
        let round = vote.round;
        if !self.round_vote_sets.contains_key(&round) {
            let rounds = self.peer_catchup_rounds.entry(peer.cloned()).or_default();
            if rounds.len() >= MAX_PEER_CATCHUP_ROUNDS {
                return Err(VoteError::UnwantedRound { round });
            }
            rounds.push(round);
            self.add_round(round);
        }
        self.vote_set_mut(round, vote.vote_type)
            .ok_or(VoteError::UnwantedRound { round })?
            .add_vote(vote)
    }

    fn vote_set_mut(&mut self, round: u32, vote_type: VoteType) -> Option<&mut VoteSet> {
        self.round_vote_sets.get_mut(&round).map(|set| match vote_type {
            VoteType::Prevote => &mut set.prevotes,
            VoteType::Precommit => &mut set.precommits,
        })
    }

    pub fn vote_set(&self, round: u32, vote_type: VoteType) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|set| match vote_type {
            VoteType::Prevote => &set.prevotes,
            VoteType::Precommit => &set.precommits,
        })
    }

    pub fn prevotes(&self, round: u32) -> Option<&VoteSet> {
        self.vote_set(round, VoteType::Prevote)
    }

    pub fn precommits(&self, round: u32) -> Option<&VoteSet> {
        self.vote_set(round, VoteType::Precommit)
    }

    /// The latest round, at or below the current one, with a prevote
    /// majority, and the block it prevoted.
    pub fn pol_info(&self) -> Option<(u32, BlockId)> {
        (0..=self.round).rev().find_map(|round| {
            self.prevotes(round)
                .and_then(VoteSet::two_thirds_majority)
                .map(|block_id| (round, block_id))
        })
    }

    /// Records a peer's claim of 2/3+ for `block_id`. Claims for rounds we
    /// do not track are ignored.
    pub fn set_peer_maj23(
        &mut self,
        round: u32,
        vote_type: VoteType,
        peer: PeerId,
        block_id: BlockId,
    ) -> Result<(), VoteError> {
        match self.vote_set_mut(round, vote_type) {
            Some(set) => set.set_peer_maj23(peer, block_id),
            None => Ok(()),
        }
    }

    pub fn rounds(&self) -> impl Iterator<Item = u32> + '_ {
        self.round_vote_sets.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use replica_common::test_utils::validators;
    use replica_common::{Hash, PartSetHeader, PrivValidator, Signature, Timestamp};

    use super::*;

    const CHAIN_ID: &str = "height-vote-set-test";

    fn vote(signer: &dyn PrivValidator, set: &ValidatorSet, round: u32, block_id: BlockId) -> Vote {
        let (index, _) = set.get_by_address(&signer.address()).unwrap();
        let mut vote = Vote {
            vote_type: VoteType::Prevote,
            height: 1,
            round,
            block_id,
            timestamp: Timestamp::now(),
            validator_address: signer.address(),
            validator_index: index,
            signature: Signature::ZERO,
        };
        signer.sign_vote(CHAIN_ID, &mut vote).unwrap();
        vote
    }

    fn block(tag: u8) -> BlockId {
        BlockId {
            hash: Hash::digest([tag]),
            parts: PartSetHeader {
                total: 1,
                hash: Hash::digest([tag]),
            },
        }
    }

    #[test]
    fn peers_may_open_two_catchup_rounds() {
        let (set, signers) = validators(4, 1);
        let mut votes = HeightVoteSet::new(CHAIN_ID, 1, set.clone());
        let peer = PeerId::new("ahead");

        for round in [5, 6] {
            assert!(votes
                .add_vote(vote(signers[0].as_ref(), &set, round, block(1)), Some(&peer))
                .unwrap());
        }
        assert_matches!(
            votes.add_vote(vote(signers[0].as_ref(), &set, 7, block(1)), Some(&peer)),
            Err(VoteError::UnwantedRound { round: 7 })
        );
        // Rounds opened by the peer are now tracked for everyone.
        assert!(votes
            .add_vote(
                vote(signers[1].as_ref(), &set, 6, block(1)),
                Some(&PeerId::new("other"))
            )
            .unwrap());
        // Another peer has its own allowance.
        assert!(votes
            .add_vote(
                vote(signers[1].as_ref(), &set, 7, block(1)),
                Some(&PeerId::new("other"))
            )
            .unwrap());
    }

    #[test]
    fn set_round_creates_intermediate_rounds() {
        let (set, _) = validators(1, 1);
        let mut votes = HeightVoteSet::new(CHAIN_ID, 1, set);
        votes.set_round(3);
        assert_eq!(votes.rounds().collect::<Vec<_>>(), [0, 1, 2, 3]);
        votes.set_round(1);
        assert_eq!(votes.round(), 3);
    }

    #[test]
    fn pol_info_finds_the_latest_polka() {
        let (set, signers) = validators(4, 1);
        let mut votes = HeightVoteSet::new(CHAIN_ID, 1, set.clone());
        votes.set_round(2);
        assert_eq!(votes.pol_info(), None);

        for signer in &signers[..3] {
            votes
                .add_vote(vote(signer.as_ref(), &set, 0, block(1)), None)
                .unwrap();
        }
        assert_eq!(votes.pol_info(), Some((0, block(1))));

        for signer in &signers[1..] {
            votes
                .add_vote(vote(signer.as_ref(), &set, 1, BlockId::nil()), None)
                .unwrap();
        }
        assert_eq!(votes.pol_info(), Some((1, BlockId::nil())));
    }

    #[test]
    fn maj23_claims_for_untracked_rounds_are_ignored() {
        let (set, _) = validators(2, 1);
        let mut votes = HeightVoteSet::new(CHAIN_ID, 1, set);
        votes
            .set_peer_maj23(9, VoteType::Prevote, PeerId::new("p"), block(1))
            .unwrap();
        assert!(votes.prevotes(9).is_none());
        votes
            .set_peer_maj23(0, VoteType::Prevote, PeerId::new("p"), block(1))
            .unwrap();
        assert_eq!(
            votes
                .prevotes(0)
                .unwrap()
                .bit_array_by_block_id(&block(1))
                .map(|bits| bits.count_ones()),
            Some(0)
        );
    }
}
