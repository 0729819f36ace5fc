use replica_common::{Block, BlockId, Hash, PartSet, Proposal, Timestamp, ValidatorSet};
use serde::{Deserialize, Serialize};

use crate::{HeightVoteSet, VoteSet};

/// Steps of a round, in the order they are entered.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Waiting out the commit timeout before round 0.
    #[default]
    NewHeight = 1,
    NewRound = 2,
    Propose = 3,
    Prevote = 4,
    /// 2/3+ prevotes for anything, waiting for more.
    PrevoteWait = 5,
    Precommit = 6,
    /// 2/3+ precommits for anything, waiting for more.
    PrecommitWait = 7,
    /// 2/3+ precommits for a block, waiting for the block itself.
    Commit = 8,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Step::NewHeight => "NewHeight",
            Step::NewRound => "NewRound",
            Step::Propose => "Propose",
            Step::Prevote => "Prevote",
            Step::PrevoteWait => "PrevoteWait",
            Step::Precommit => "Precommit",
            Step::PrecommitWait => "PrecommitWait",
            Step::Commit => "Commit",
        };
        f.write_str(name)
    }
}

/// The position of the state machine: height, round and step.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hrs {
    pub height: u64,
    pub round: u32,
    pub step: Step,
}

impl std::fmt::Display for Hrs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.height, self.round, self.step)
    }
}

/// Everything the state machine knows about the current height.
///
/// Locked and valid values are tracked separately: the locked block is the
/// one this node precommitted and may only leave through a later polka,
/// while the valid block is the latest block seen with a polka, which the
/// node re-proposes when it is the proposer.
#[derive(Clone, Debug)]
pub struct RoundState {
    pub height: u64,
    pub round: u32,
    pub step: Step,
    /// When round 0 of this height starts.
    pub start_time: Timestamp,
    /// When the previous height was committed.
    pub commit_time: Timestamp,
    pub validators: ValidatorSet,
    pub proposal: Option<Proposal>,
    pub proposal_block: Option<Block>,
    pub proposal_block_parts: Option<PartSet>,
    pub locked_round: Option<u32>,
    pub locked_block: Option<Block>,
    pub locked_block_parts: Option<PartSet>,
    pub valid_round: Option<u32>,
    pub valid_block: Option<Block>,
    pub valid_block_parts: Option<PartSet>,
    pub votes: HeightVoteSet,
    pub commit_round: Option<u32>,
    /// Precommits for the previous height.
    pub last_commit: Option<VoteSet>,
    pub last_validators: Option<ValidatorSet>,
    pub triggered_timeout_precommit: bool,
}

impl RoundState {
    pub fn hrs(&self) -> Hrs {
        Hrs {
            height: self.height,
            round: self.round,
            step: self.step,
        }
    }

    /// Compact, serializable view used for logging and for comparing states.
    pub fn summary(&self) -> RoundStateSummary {
        let block_hash = |block: &Option<Block>| block.as_ref().map(Block::hash);
        let votes = self
            .votes
            .rounds()
            .map(|round| RoundVotesSummary {
                round,
                prevotes: self
                    .votes
                    .prevotes(round)
                    .map(VoteSet::bits_string)
                    .unwrap_or_default(),
                prevote_maj23: self.votes.prevotes(round).and_then(VoteSet::two_thirds_majority),
                precommits: self
                    .votes
                    .precommits(round)
                    .map(VoteSet::bits_string)
                    .unwrap_or_default(),
                precommit_maj23: self
                    .votes
                    .precommits(round)
                    .and_then(VoteSet::two_thirds_majority),
            })
            .collect();
        RoundStateSummary {
            hrs: self.hrs(),
            proposal: self.proposal.as_ref().map(|p| p.block_id),
            proposal_block: block_hash(&self.proposal_block),
            locked_round: self.locked_round,
            locked_block: block_hash(&self.locked_block),
            valid_round: self.valid_round,
            valid_block: block_hash(&self.valid_block),
            commit_round: self.commit_round,
            votes,
            last_commit: self.last_commit.as_ref().map(VoteSet::bits_string),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStateSummary {
    pub hrs: Hrs,
    pub proposal: Option<BlockId>,
    pub proposal_block: Option<Hash>,
    pub locked_round: Option<u32>,
    pub locked_block: Option<Hash>,
    pub valid_round: Option<u32>,
    pub valid_block: Option<Hash>,
    pub commit_round: Option<u32>,
    pub votes: Vec<RoundVotesSummary>,
    pub last_commit: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundVotesSummary {
    pub round: u32,
    pub prevotes: String,
    pub prevote_maj23: Option<BlockId>,
    pub precommits: String,
    pub precommit_maj23: Option<BlockId>,
}
