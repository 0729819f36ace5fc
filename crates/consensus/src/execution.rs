//! The boundary between the round machine and the application: genesis and
//! chain state, the block store, collected evidence and block execution.
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use replica_common::app::{AppConn, TxResponse};
use replica_common::{
    Address,
    Block,
    BlockError,
    BlockId,
    Commit,
    DuplicateVoteEvidence,
    EvidenceError,
    Hash,
    Header,
    PartSet,
    PubKey,
    Timestamp,
    Validator,
    ValidatorSet,
    ValidatorSetError,
    VoteType,
};
use replica_mempool::Mempool;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Validators(#[from] ValidatorSetError),
    #[error("invalid evidence: {0}")]
    Evidence(#[from] EvidenceError),
    #[error("wrong block height: expected {expected}, got {got}")]
    WrongHeight { expected: u64, got: u64 },
    #[error("wrong {field}: expected {expected}, got {got}")]
    WrongField {
        field: &'static str,
        expected: String,
        got: String,
    },
    #[error("invalid commit: {0}")]
    InvalidCommit(String),
    #[error("proposer {0} is not a validator")]
    UnknownProposer(Address),
    #[error("block time {got} precedes the previous block time {last}")]
    TimeRegression { got: u64, last: u64 },
    #[error("evidence from {0} is not from a known validator")]
    UnknownEvidenceValidator(Address),
    #[error("evidence {0} was already committed")]
    EvidenceCommitted(Hash),
    #[error("block store expected height {expected}, got {got}")]
    NonContiguousBlock { expected: u64, got: u64 },
}

impl ExecutionError {
    fn wrong(field: &'static str, expected: impl ToString, got: impl ToString) -> Self {
        Self::WrongField {
            field,
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }
}

/// Limits on what goes into a block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockParams {
    /// Budget for the transaction bytes of a block. `-1` is unbounded.
    pub max_bytes: i64,
    /// Budget for the declared gas of a block. `-1` is unbounded.
    pub max_gas: i64,
}

impl Default for BlockParams {
    fn default() -> Self {
        Self {
            max_bytes: 21 * 1024 * 1024,
            max_gas: -1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub pub_key: PubKey,
    pub power: i64,
    #[serde(default)]
    pub name: String,
}

/// How the chain starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genesis {
    pub chain_id: String,
    pub genesis_time: Timestamp,
    #[serde(default = "default_initial_height")]
    pub initial_height: u64,
    pub validators: Vec<GenesisValidator>,
    #[serde(default)]
    pub app_hash: Hash,
    #[serde(default)]
    pub block_params: BlockParams,
}

fn default_initial_height() -> u64 {
    1
}

impl Genesis {
    pub fn validator_set(&self) -> Result<ValidatorSet, ValidatorSetError> {
        ValidatorSet::new(
            self.validators
                .iter()
                .map(|v| Validator::new(v.pub_key, v.power))
                .collect(),
        )
    }
}

/// What the chain looks like after the last committed block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainState {
    pub chain_id: String,
    pub initial_height: u64,
    /// `initial_height - 1` before the first block.
    pub last_block_height: u64,
    pub last_block_id: BlockId,
    pub last_block_time: Timestamp,
    /// Validators of the next height, with the proposer of its round 0.
    pub validators: ValidatorSet,
    /// Validators that signed the last block.
    pub last_validators: Option<ValidatorSet>,
    pub app_hash: Hash,
    pub block_params: BlockParams,
}

impl ChainState {
    pub fn from_genesis(genesis: &Genesis) -> Result<Self, ExecutionError> {
        let initial_height = genesis.initial_height.max(1);
        Ok(Self {
            chain_id: genesis.chain_id.clone(),
            initial_height,
            last_block_height: initial_height - 1,
            last_block_id: BlockId::nil(),
            last_block_time: genesis.genesis_time,
            validators: genesis.validator_set()?,
            last_validators: None,
            app_hash: genesis.app_hash,
            block_params: genesis.block_params,
        })
    }

    pub fn next_height(&self) -> u64 {
        self.last_block_height + 1
    }

    pub fn is_first_height(&self) -> bool {
        self.next_height() == self.initial_height
    }
}

/// Committed blocks, their parts and the commits that decided them.
pub trait BlockStore: Send + Sync {
    /// The height of the latest block, zero when empty.
    fn height(&self) -> u64;

    fn load_block(&self, height: u64) -> Option<Block>;

    fn load_block_parts(&self, height: u64) -> Option<PartSet>;

    /// The commit for `height` as recorded in the block at `height + 1`.
    fn load_block_commit(&self, height: u64) -> Option<Commit>;

    /// The commit for `height` this node saw when it committed the block.
    fn load_seen_commit(&self, height: u64) -> Option<Commit>;

    fn save_block(
        &self,
        block: &Block,
        parts: &PartSet,
        seen_commit: Commit,
    ) -> Result<(), ExecutionError>;
}

#[derive(Debug)]
struct StoredBlock {
    block: Block,
    parts: PartSet,
    seen_commit: Commit,
}

/// Keeps every block in memory.
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<BTreeMap<u64, StoredBlock>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemoryBlockStore {
    fn height(&self) -> u64 {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        blocks.keys().next_back().copied().unwrap_or_default()
    }

    fn load_block(&self, height: u64) -> Option<Block> {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        blocks.get(&height).map(|b| b.block.clone())
    }

    fn load_block_parts(&self, height: u64) -> Option<PartSet> {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        blocks.get(&height).map(|b| b.parts.clone())
    }

    fn load_block_commit(&self, height: u64) -> Option<Commit> {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        blocks.get(&height.checked_add(1)?).map(|b| b.block.last_commit.clone())
    }

    fn load_seen_commit(&self, height: u64) -> Option<Commit> {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        blocks.get(&height).map(|b| b.seen_commit.clone())
    }

    fn save_block(
        &self,
        block: &Block,
        parts: &PartSet,
        seen_commit: Commit,
    ) -> Result<(), ExecutionError> {
        let mut blocks = self.blocks.write().unwrap_or_else(PoisonError::into_inner);
        let height = block.height();
        if let Some(last) = blocks.keys().next_back() {
            if height != last + 1 {
                return Err(ExecutionError::NonContiguousBlock {
                    expected: last + 1,
                    got: height,
                });
            }
        }
        if !parts.is_complete() {
            return Err(ExecutionError::wrong(
                "block parts",
                parts.total(),
                parts.count(),
            ));
        }
        blocks.insert(
            height,
            StoredBlock {
                block: block.clone(),
                parts: parts.clone(),
                seen_commit,
            },
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
struct EvidenceState {
    pending: Vec<DuplicateVoteEvidence>,
    committed: HashSet<Hash>,
}

/// Duplicate-vote evidence waiting to be included in a block.
#[derive(Debug)]
pub struct EvidencePool {
    chain_id: String,
    state: Mutex<EvidenceState>,
}

impl EvidencePool {
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            state: Mutex::default(),
        }
    }

    /// Returns `false` if the evidence is already known.
    pub fn add_evidence(&self, evidence: DuplicateVoteEvidence) -> Result<bool, ExecutionError> {
        evidence.verify(&self.chain_id)?;
        let hash = evidence.hash();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.committed.contains(&hash) || state.pending.iter().any(|e| e.hash() == hash) {
            return Ok(false);
        }
        tracing::info!(
            validator = %evidence.address(),
            height = evidence.height(),
            "Recorded duplicate vote evidence"
        );
        metrics::increment_counter!("consensus_byzantine_evidence");
        state.pending.push(evidence);
        Ok(true)
    }

    pub fn pending_evidence(&self) -> Vec<DuplicateVoteEvidence> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .clone()
    }

    pub fn is_committed(&self, evidence: &DuplicateVoteEvidence) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .committed
            .contains(&evidence.hash())
    }

    pub fn mark_committed(&self, evidence: &[DuplicateVoteEvidence]) {
        if evidence.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let hashes: Vec<Hash> = evidence.iter().map(DuplicateVoteEvidence::hash).collect();
        state.pending.retain(|e| !hashes.contains(&e.hash()));
        state.committed.extend(hashes);
    }
}

/// Checks that `commit` holds 2/3+ valid precommits of `validators` for
/// `block_id` at `height`.
pub fn verify_commit(
    chain_id: &str,
    validators: &ValidatorSet,
    block_id: &BlockId,
    height: u64,
    commit: &Commit,
) -> Result<(), ExecutionError> {
    if commit.size() != validators.len() {
        return Err(ExecutionError::InvalidCommit(format!(
            "{} precommits for {} validators",
            commit.size(),
            validators.len()
        )));
    }
    if commit.block_id != *block_id {
        return Err(ExecutionError::InvalidCommit(format!(
            "commit is for {}, expected {block_id}",
            commit.block_id
        )));
    }

    let mut tallied: i64 = 0;
    for (index, precommit) in commit.precommits.iter().enumerate() {
        let Some(precommit) = precommit else {
            continue;
        };
        if precommit.height != height || precommit.vote_type != VoteType::Precommit {
            return Err(ExecutionError::InvalidCommit(format!(
                "unexpected vote {precommit}"
            )));
        }
        let validator = validators
            .get_by_index(index as u32)
            .filter(|v| precommit.validator_index as usize == index)
            .ok_or_else(|| ExecutionError::InvalidCommit(format!("misplaced vote {precommit}")))?;
        precommit
            .verify(chain_id, &validator.pub_key)
            .map_err(|e| ExecutionError::InvalidCommit(format!("{precommit}: {e}")))?;
        if precommit.block_id == *block_id {
            tallied += validator.voting_power;
        }
    }

    if tallied <= validators.two_thirds_threshold() {
        return Err(ExecutionError::InvalidCommit(format!(
            "insufficient voting power: got {tallied}, needed more than {}",
            validators.two_thirds_threshold()
        )));
    }
    Ok(())
}

/// Builds, validates and applies blocks against the application.
pub struct BlockExecutor {
    conn: AppConn,
    mempool: Arc<Mempool>,
    evidence: Arc<EvidencePool>,
}

impl BlockExecutor {
    pub fn new(conn: AppConn, mempool: Arc<Mempool>, evidence: Arc<EvidencePool>) -> Self {
        Self {
            conn,
            mempool,
            evidence,
        }
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    pub fn evidence_pool(&self) -> &Arc<EvidencePool> {
        &self.evidence
    }

    /// A block for the next height holding as many pending transactions as
    /// the block budget allows, in mempool order.
    pub fn create_proposal_block(
        &self,
        state: &ChainState,
        last_commit: Commit,
        proposer: Address,
    ) -> Block {
        let params = state.block_params;
        let txs = self
            .mempool
            .reap_max_bytes_max_gas(params.max_bytes, params.max_gas);
        let evidence: Vec<_> = self
            .evidence
            .pending_evidence()
            .into_iter()
            .filter(|e| e.height() < state.next_height())
            .collect();
        let time = Timestamp::now().max(state.last_block_time);

        Block::new(
            Header {
                chain_id: state.chain_id.clone(),
                height: state.next_height(),
                time,
                last_block_id: state.last_block_id,
                validators_hash: state.validators.hash(),
                app_hash: state.app_hash,
                proposer_address: proposer,
                ..Default::default()
            },
            txs,
            evidence,
            last_commit,
        )
    }

    pub fn validate_block(&self, state: &ChainState, block: &Block) -> Result<(), ExecutionError> {
        block.validate_basic()?;

        let header = &block.header;
        if header.chain_id != state.chain_id {
            return Err(ExecutionError::wrong(
                "chain id",
                &state.chain_id,
                &header.chain_id,
            ));
        }
        if header.height != state.next_height() {
            return Err(ExecutionError::WrongHeight {
                expected: state.next_height(),
                got: header.height,
            });
        }
        if header.last_block_id != state.last_block_id {
            return Err(ExecutionError::wrong(
                "last block id",
                state.last_block_id,
                header.last_block_id,
            ));
        }
        if header.app_hash != state.app_hash {
            return Err(ExecutionError::wrong("app hash", state.app_hash, header.app_hash));
        }
        let validators_hash = state.validators.hash();
        if header.validators_hash != validators_hash {
            return Err(ExecutionError::wrong(
                "validators hash",
                validators_hash,
                header.validators_hash,
            ));
        }

        match &state.last_validators {
            _ if state.is_first_height() => {
                if !block.last_commit.is_empty() {
                    return Err(ExecutionError::InvalidCommit(
                        "first block must not carry a last commit".into(),
                    ));
                }
            }
            Some(last_validators) => verify_commit(
                &state.chain_id,
                last_validators,
                &state.last_block_id,
                state.last_block_height,
                &block.last_commit,
            )?,
            None => {
                return Err(ExecutionError::InvalidCommit(
                    "no validators for the last block".into(),
                ))
            }
        }

        if !state.validators.has_address(&header.proposer_address) {
            return Err(ExecutionError::UnknownProposer(header.proposer_address));
        }
        if !state.is_first_height() && header.time < state.last_block_time {
            return Err(ExecutionError::TimeRegression {
                got: header.time.millis(),
                last: state.last_block_time.millis(),
            });
        }

        for evidence in &block.evidence {
            evidence.verify(&state.chain_id)?;
            let known = state.validators.has_address(&evidence.address())
                || state
                    .last_validators
                    .as_ref()
                    .is_some_and(|v| v.has_address(&evidence.address()));
            if !known {
                return Err(ExecutionError::UnknownEvidenceValidator(evidence.address()));
            }
            if self.evidence.is_committed(evidence) {
                return Err(ExecutionError::EvidenceCommitted(evidence.hash()));
            }
        }
        Ok(())
    }

    /// Runs `block` through the application and returns the state after it.
    ///
    /// The mempool is locked from the first delivered transaction until it
    /// has been updated with the results, so no transaction is checked
    /// against a half-applied state.
    pub fn apply_block(
        &self,
        state: &ChainState,
        block_id: BlockId,
        block: &Block,
    ) -> Result<(ChainState, Vec<TxResponse>), ExecutionError> {
        self.validate_block(state, block)?;

        let height = block.height();
        let (results, app_hash) = {
            let _guard = self.mempool.commit_guard();
            self.conn.begin_block(&block.header, &block.evidence);
            let results: Vec<TxResponse> = block
                .txs
                .iter()
                .map(|tx| self.conn.deliver_tx(tx.as_bytes()))
                .collect();
            self.conn.end_block(height);
            let app_hash = self.conn.commit();
            self.mempool.update(height, &block.txs, &results);
            (results, app_hash)
        };
        self.evidence.mark_committed(&block.evidence);

        let failed = results.iter().filter(|r| r.is_err()).count();
        tracing::info!(
            height,
            num_txs = block.txs.len(),
            failed,
            app_hash = %app_hash,
            "Executed block"
        );
        metrics::counter!("consensus_committed_txs", block.txs.len() as u64);

        let next = ChainState {
            last_block_height: height,
            last_block_id: block_id,
            last_block_time: block.header.time,
            validators: state.validators.copy_increment_proposer_priority(1),
            last_validators: Some(state.validators.clone()),
            app_hash,
            ..state.clone()
        };
        Ok((next, results))
    }
}
