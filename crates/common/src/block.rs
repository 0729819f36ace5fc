use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::macros::hex_bytes;
use crate::part_set::PartSet;
use crate::{merkle, Address, DuplicateVoteEvidence, Hash, Timestamp, Vote, VoteType};

/// Size of a single block part on the wire.
pub const BLOCK_PART_SIZE: usize = 64 * 1024;

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tx(#[serde(with = "hex_bytes")] pub Vec<u8>);

impl Tx {
    pub fn hash(&self) -> Hash {
        Hash::digest(&self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Tx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tx({} bytes, {:?})", self.0.len(), self.hash())
    }
}

impl From<Vec<u8>> for Tx {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Tx {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl AsRef<[u8]> for Tx {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartSetHeader {
    pub total: u32,
    pub hash: Hash,
}

impl PartSetHeader {
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.hash.is_zero()
    }
}

/// Content address of a block: header hash plus the merkle header of its
/// parts. The default value is the nil block id.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId {
    pub hash: Hash,
    pub parts: PartSetHeader,
}

impl BlockId {
    pub fn nil() -> Self {
        Self::default()
    }

    pub fn is_nil(&self) -> bool {
        self.hash.is_zero() && self.parts.is_zero()
    }

    /// Both the block hash and the part set header are present.
    pub fn is_complete(&self) -> bool {
        !self.hash.is_zero() && self.parts.total > 0 && !self.parts.hash.is_zero()
    }

    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.hash.as_bytes());
        buf.extend_from_slice(&self.parts.total.to_be_bytes());
        buf.extend_from_slice(self.parts.hash.as_bytes());
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_nil() {
            return f.write_str("nil");
        }
        let hash = self.hash.to_string();
        let parts = self.parts.hash.to_string();
        write!(f, "{}:{}:{}", &hash[..12], self.parts.total, &parts[..12])
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub chain_id: String,
    pub height: u64,
    pub time: Timestamp,
    pub num_txs: u64,
    pub last_block_id: BlockId,
    pub last_commit_hash: Hash,
    pub data_hash: Hash,
    pub validators_hash: Hash,
    pub app_hash: Hash,
    pub evidence_hash: Hash,
    pub proposer_address: Address,
}

impl Header {
    pub fn hash(&self) -> Hash {
        let mut last_block_id = Vec::new();
        self.last_block_id.encode_into(&mut last_block_id);
        let fields: [&[u8]; 11] = [
            self.chain_id.as_bytes(),
            &self.height.to_be_bytes(),
            &self.time.0.to_be_bytes(),
            &self.num_txs.to_be_bytes(),
            &last_block_id,
            self.last_commit_hash.as_bytes(),
            self.data_hash.as_bytes(),
            self.validators_hash.as_bytes(),
            self.app_hash.as_bytes(),
            self.evidence_hash.as_bytes(),
            self.proposer_address.as_bytes(),
        ];
        merkle::root(&fields)
    }
}

/// The precommits that committed a block, indexed by validator index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub block_id: BlockId,
    pub precommits: Vec<Option<Vote>>,
}

impl Commit {
    pub fn new(block_id: BlockId, precommits: Vec<Option<Vote>>) -> Self {
        Self {
            block_id,
            precommits,
        }
    }

    fn first(&self) -> Option<&Vote> {
        self.precommits.iter().flatten().next()
    }

    pub fn height(&self) -> u64 {
        self.first().map(|v| v.height).unwrap_or_default()
    }

    pub fn round(&self) -> u32 {
        self.first().map(|v| v.round).unwrap_or_default()
    }

    pub fn size(&self) -> usize {
        self.precommits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first().is_none()
    }

    pub fn get_by_index(&self, index: u32) -> Option<&Vote> {
        self.precommits.get(index as usize).and_then(Option::as_ref)
    }

    pub fn hash(&self) -> Hash {
        let leaves: Vec<Vec<u8>> = self
            .precommits
            .iter()
            .map(|v| match v {
                Some(v) => {
                    let mut bytes = v.sign_bytes("");
                    bytes.extend_from_slice(v.signature.as_bytes());
                    bytes
                }
                None => Vec::new(),
            })
            .collect();
        merkle::root(&leaves)
    }

    /// Checks that every precommit belongs to this commit's height, round and
    /// type and is either for the committed block or nil.
    pub fn validate_basic(&self) -> Result<(), BlockError> {
        let (Some(height), round) = (self.first().map(|v| v.height), self.round()) else {
            return Ok(());
        };
        for vote in self.precommits.iter().flatten() {
            if vote.vote_type != VoteType::Precommit
                || vote.height != height
                || vote.round != round
                || (!vote.is_nil() && vote.block_id != self.block_id)
            {
                return Err(BlockError::InvalidCommit(vote.to_string()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("wrong data hash: expected {expected}, got {got}")]
    WrongDataHash { expected: Hash, got: Hash },
    #[error("wrong last commit hash: expected {expected}, got {got}")]
    WrongLastCommitHash { expected: Hash, got: Hash },
    #[error("wrong evidence hash: expected {expected}, got {got}")]
    WrongEvidenceHash { expected: Hash, got: Hash },
    #[error("wrong tx count: header says {header}, block has {actual}")]
    WrongNumTxs { header: u64, actual: u64 },
    #[error("invalid commit vote {0}")]
    InvalidCommit(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub txs: Vec<Tx>,
    pub evidence: Vec<DuplicateVoteEvidence>,
    pub last_commit: Commit,
}

impl Block {
    /// Creates a block and fills in the derived header fields.
    pub fn new(
        header: Header,
        txs: Vec<Tx>,
        evidence: Vec<DuplicateVoteEvidence>,
        last_commit: Commit,
    ) -> Self {
        let mut block = Self {
            header,
            txs,
            evidence,
            last_commit,
        };
        block.fill_header();
        block
    }

    pub fn fill_header(&mut self) {
        self.header.num_txs = self.txs.len() as u64;
        self.header.data_hash = merkle::root(&self.txs);
        self.header.last_commit_hash = self.last_commit.hash();
        self.header.evidence_hash = evidence_hash(&self.evidence);
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn validate_basic(&self) -> Result<(), BlockError> {
        let data_hash = merkle::root(&self.txs);
        if data_hash != self.header.data_hash {
            return Err(BlockError::WrongDataHash {
                expected: data_hash,
                got: self.header.data_hash,
            });
        }
        if self.header.num_txs != self.txs.len() as u64 {
            return Err(BlockError::WrongNumTxs {
                header: self.header.num_txs,
                actual: self.txs.len() as u64,
            });
        }
        let last_commit_hash = self.last_commit.hash();
        if last_commit_hash != self.header.last_commit_hash {
            return Err(BlockError::WrongLastCommitHash {
                expected: last_commit_hash,
                got: self.header.last_commit_hash,
            });
        }
        let evidence_hash = evidence_hash(&self.evidence);
        if evidence_hash != self.header.evidence_hash {
            return Err(BlockError::WrongEvidenceHash {
                expected: evidence_hash,
                got: self.header.evidence_hash,
            });
        }
        self.last_commit.validate_basic()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        codec::decode(bytes)
    }

    pub fn make_part_set(&self, part_size: usize) -> Result<PartSet, CodecError> {
        Ok(PartSet::from_data(&self.to_bytes()?, part_size))
    }

    /// Block id of this block when split into `part_size` parts.
    pub fn block_id(&self, part_size: usize) -> Result<(BlockId, PartSet), CodecError> {
        let parts = self.make_part_set(part_size)?;
        let id = BlockId {
            hash: self.hash(),
            parts: parts.header(),
        };
        Ok((id, parts))
    }

    pub fn hashes_to(&self, hash: &Hash) -> bool {
        &self.hash() == hash
    }
}

fn evidence_hash(evidence: &[DuplicateVoteEvidence]) -> Hash {
    let leaves: Vec<Vec<u8>> = evidence.iter().map(|e| e.hash().0.to_vec()).collect();
    merkle::root(&leaves)
}
