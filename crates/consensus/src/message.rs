//! Consensus wire messages. Each message travels as a one byte tag and a
//! length-prefixed JSON payload on the channel for its kind.
use replica_common::codec::{self, CodecError};
use replica_common::p2p::{
    ChannelId,
    CONSENSUS_DATA_CHANNEL,
    CONSENSUS_STATE_CHANNEL,
    CONSENSUS_VOTE_CHANNEL,
    CONSENSUS_VOTE_SET_BITS_CHANNEL,
};
use replica_common::{BlockId, Part, PartSetHeader, Proposal, Vote, VoteType};
use serde::{Deserialize, Serialize};

use crate::{MessageError, Step, VoteBits};

/// A peer's current position, sent on every step change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRoundStepMessage {
    pub height: u64,
    pub round: u32,
    pub step: Step,
    pub seconds_since_start_time: u64,
    pub last_commit_round: Option<u32>,
}

/// The sender learned of a block with a polka, or of the committed block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewValidBlockMessage {
    pub height: u64,
    pub round: u32,
    pub block_parts_header: PartSetHeader,
    pub block_parts: VoteBits,
    pub is_commit: bool,
}

/// Prevotes the sender has for the proposal's POL round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalPolMessage {
    pub height: u64,
    pub proposal_pol_round: u32,
    pub proposal_pol: VoteBits,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPartMessage {
    pub height: u64,
    pub round: u32,
    pub part: Part,
}

/// The sender has the vote of validator `index`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HasVoteMessage {
    pub height: u64,
    pub round: u32,
    pub vote_type: VoteType,
    pub index: u32,
}

/// The sender saw 2/3+ for `block_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteSetMaj23Message {
    pub height: u64,
    pub round: u32,
    pub vote_type: VoteType,
    pub block_id: BlockId,
}

/// Answer to a [VoteSetMaj23Message]: the validators the sender has votes
/// for `block_id` from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteSetBitsMessage {
    pub height: u64,
    pub round: u32,
    pub vote_type: VoteType,
    pub block_id: BlockId,
    pub votes: VoteBits,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMessage {
    NewRoundStep(NewRoundStepMessage),
    NewValidBlock(NewValidBlockMessage),
    Proposal(Proposal),
    ProposalPol(ProposalPolMessage),
    BlockPart(BlockPartMessage),
    Vote(Vote),
    HasVote(HasVoteMessage),
    VoteSetMaj23(VoteSetMaj23Message),
    VoteSetBits(VoteSetBitsMessage),
}

const NEW_ROUND_STEP: u8 = 0x01;
const NEW_VALID_BLOCK: u8 = 0x02;
const PROPOSAL: u8 = 0x03;
const PROPOSAL_POL: u8 = 0x04;
const BLOCK_PART: u8 = 0x05;
const VOTE: u8 = 0x06;
const HAS_VOTE: u8 = 0x07;
const VOTE_SET_MAJ23: u8 = 0x08;
const VOTE_SET_BITS: u8 = 0x09;

impl ConsensusMessage {
    fn tag(&self) -> u8 {
        match self {
            Self::NewRoundStep(_) => NEW_ROUND_STEP,
            Self::NewValidBlock(_) => NEW_VALID_BLOCK,
            Self::Proposal(_) => PROPOSAL,
            Self::ProposalPol(_) => PROPOSAL_POL,
            Self::BlockPart(_) => BLOCK_PART,
            Self::Vote(_) => VOTE,
            Self::HasVote(_) => HAS_VOTE,
            Self::VoteSetMaj23(_) => VOTE_SET_MAJ23,
            Self::VoteSetBits(_) => VOTE_SET_BITS,
        }
    }

    /// The channel this kind of message travels on.
    pub fn channel(&self) -> ChannelId {
        channel_of(self.tag())
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let payload = match self {
            Self::NewRoundStep(m) => codec::encode(m)?,
            Self::NewValidBlock(m) => codec::encode(m)?,
            Self::Proposal(m) => codec::encode(m)?,
            Self::ProposalPol(m) => codec::encode(m)?,
            Self::BlockPart(m) => codec::encode(m)?,
            Self::Vote(m) => codec::encode(m)?,
            Self::HasVote(m) => codec::encode(m)?,
            Self::VoteSetMaj23(m) => codec::encode(m)?,
            Self::VoteSetBits(m) => codec::encode(m)?,
        };
        Ok(codec::frame(self.tag(), &payload))
    }

    /// Decodes a message received on `channel` and runs its basic checks.
    pub fn decode(channel: ChannelId, bytes: &[u8]) -> Result<Self, MessageError> {
        let (tag, payload) = codec::unframe(bytes)?;
        let message = match tag {
            NEW_ROUND_STEP => Self::NewRoundStep(codec::decode(payload)?),
            NEW_VALID_BLOCK => Self::NewValidBlock(codec::decode(payload)?),
            PROPOSAL => Self::Proposal(codec::decode(payload)?),
            PROPOSAL_POL => Self::ProposalPol(codec::decode(payload)?),
            BLOCK_PART => Self::BlockPart(codec::decode(payload)?),
            VOTE => Self::Vote(codec::decode(payload)?),
            HAS_VOTE => Self::HasVote(codec::decode(payload)?),
            VOTE_SET_MAJ23 => Self::VoteSetMaj23(codec::decode(payload)?),
            VOTE_SET_BITS => Self::VoteSetBits(codec::decode(payload)?),
            tag => return Err(CodecError::UnknownTag(tag).into()),
        };
        if channel_of(tag) != channel {
            return Err(MessageError::WrongChannel { tag, channel });
        }
        message.validate_basic()?;
        Ok(message)
    }

    /// Stateless checks. Signatures are verified by the state machine, which
    /// knows the validator set.
    pub fn validate_basic(&self) -> Result<(), MessageError> {
        match self {
            Self::NewRoundStep(m) => {
                if m.height == 0 {
                    return Err(MessageError::Invalid("new round step height"));
                }
            }
            Self::NewValidBlock(m) => {
                if m.block_parts.len() != m.block_parts_header.total as usize {
                    return Err(MessageError::Invalid("new valid block part bits"));
                }
            }
            Self::Proposal(p) => {
                if !p.validate_basic() {
                    return Err(MessageError::Invalid("proposal"));
                }
            }
            Self::BlockPart(m) => {
                if m.part.bytes.is_empty() {
                    return Err(MessageError::Invalid("empty block part"));
                }
            }
            Self::Vote(v) => {
                if v.height == 0 || v.validator_address.is_zero() {
                    return Err(MessageError::Invalid("vote"));
                }
            }
            Self::VoteSetMaj23(m) => {
                if m.height == 0 {
                    return Err(MessageError::Invalid("vote set maj23 height"));
                }
            }
            Self::ProposalPol(_) | Self::HasVote(_) | Self::VoteSetBits(_) => {}
        }
        Ok(())
    }

    /// Height the message is about.
    pub fn height(&self) -> u64 {
        match self {
            Self::NewRoundStep(m) => m.height,
            Self::NewValidBlock(m) => m.height,
            Self::Proposal(p) => p.height,
            Self::ProposalPol(m) => m.height,
            Self::BlockPart(m) => m.height,
            Self::Vote(v) => v.height,
            Self::HasVote(m) => m.height,
            Self::VoteSetMaj23(m) => m.height,
            Self::VoteSetBits(m) => m.height,
        }
    }
}

fn channel_of(tag: u8) -> ChannelId {
    match tag {
        PROPOSAL | PROPOSAL_POL | BLOCK_PART => CONSENSUS_DATA_CHANNEL,
        VOTE => CONSENSUS_VOTE_CHANNEL,
        VOTE_SET_BITS => CONSENSUS_VOTE_SET_BITS_CHANNEL,
        _ => CONSENSUS_STATE_CHANNEL,
    }
}

impl std::fmt::Display for ConsensusMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewRoundStep(m) => {
                write!(f, "NewRoundStep{{{}/{}/{}}}", m.height, m.round, m.step)
            }
            Self::NewValidBlock(m) => write!(
                f,
                "NewValidBlock{{{}/{} commit={}}}",
                m.height, m.round, m.is_commit
            ),
            Self::Proposal(p) => write!(f, "{p}"),
            Self::ProposalPol(m) => {
                write!(f, "ProposalPol{{{}/{}}}", m.height, m.proposal_pol_round)
            }
            Self::BlockPart(m) => write!(
                f,
                "BlockPart{{{}/{} #{}}}",
                m.height, m.round, m.part.index
            ),
            Self::Vote(v) => write!(f, "{v}"),
            Self::HasVote(m) => write!(
                f,
                "HasVote{{{}/{}/{} #{}}}",
                m.height, m.round, m.vote_type, m.index
            ),
            Self::VoteSetMaj23(m) => write!(
                f,
                "VoteSetMaj23{{{}/{}/{} {}}}",
                m.height, m.round, m.vote_type, m.block_id
            ),
            Self::VoteSetBits(m) => write!(
                f,
                "VoteSetBits{{{}/{}/{} {}}}",
                m.height, m.round, m.vote_type, m.block_id
            ),
        }
    }
}
