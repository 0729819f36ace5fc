//! Step transitions. Each `enter_*` is a no-op unless the machine is at the
//! given height and has not yet passed the step in the given round.
use replica_common::{Block, BlockId, Commit, PartSet, Proposal, Timestamp, VoteType};

use super::{hashes_to, ConsensusState};
use crate::{ConsensusError, ConsensusEvent, ConsensusMessage, Step, VoteSet};
use crate::message::BlockPartMessage;

impl ConsensusState {
    pub(super) fn enter_new_round(&mut self, height: u64, round: u32) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step != Step::NewHeight)
        {
            tracing::debug!(height, round, position = %self.rs.hrs(), "Skipping new round");
            return Ok(());
        }
        if self.rs.start_time > Timestamp::now() {
            tracing::debug!(height, round, start_time = %self.rs.start_time, "Entering new round before start time");
        }
        tracing::debug!(height, round, "Entering new round");

        if self.rs.round < round {
            self.rs.validators = self
                .rs
                .validators
                .copy_increment_proposer_priority(round - self.rs.round);
        }
        self.rs.round = round;
        self.rs.step = Step::NewRound;
        if round != 0 {
            // The round 0 proposal may have arrived while waiting out the
            // commit timeout. Later rounds start empty.
            self.rs.proposal = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = None;
        }
        self.rs.votes.set_round(round.saturating_add(1));
        self.rs.triggered_timeout_precommit = false;

        let proposer = self
            .rs
            .validators
            .proposer()
            .map(|v| v.address)
            .unwrap_or_default();
        self.events.publish(ConsensusEvent::NewRound {
            hrs: self.rs.hrs(),
            proposer,
        });
        self.new_step();

        let wait_for_txs = self.config.wait_for_txs() && round == 0 && !self.need_proof_block(height);
        if wait_for_txs {
            let interval = self.config.create_empty_blocks_interval;
            if !interval.is_zero() {
                self.schedule_timeout(interval, height, round, Step::NewRound);
            }
            Ok(())
        } else {
            self.enter_propose(height, round)
        }
    }

    pub(super) fn enter_propose(&mut self, height: u64, round: u32) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && Step::Propose <= self.rs.step)
        {
            tracing::debug!(height, round, position = %self.rs.hrs(), "Skipping propose");
            return Ok(());
        }
        tracing::debug!(height, round, "Entering propose");

        self.schedule_timeout(
            self.config.timeout_values.propose(round),
            height,
            round,
            Step::Propose,
        );
        self.rs.round = round;
        self.rs.step = Step::Propose;

        let is_validator = self
            .signer
            .as_ref()
            .is_some_and(|s| self.rs.validators.has_address(&s.address()));
        if !is_validator {
            tracing::debug!(height, round, "Not proposing, not a validator");
        } else if self.is_proposer() {
            tracing::debug!(height, round, "Our turn to propose");
            self.decide_proposal(height, round)?;
        } else {
            tracing::debug!(
                height,
                round,
                proposer = ?self.rs.validators.proposer().map(|v| v.address),
                "Not our turn to propose"
            );
        }

        self.new_step();
        if self.is_proposal_complete() {
            self.enter_prevote(height, round)?;
        }
        Ok(())
    }

    fn decide_proposal(&mut self, height: u64, round: u32) -> Result<(), ConsensusError> {
        let Some(signer) = self.signer.clone() else {
            return Ok(());
        };

        let (block, parts) = match (&self.rs.valid_block, &self.rs.valid_block_parts) {
            (Some(block), Some(parts)) => (block.clone(), parts.clone()),
            _ => {
                let Some(last_commit) = self.proposal_last_commit() else {
                    tracing::error!(height, round, "Cannot propose without a commit for the previous block");
                    return Ok(());
                };
                let block =
                    self.executor
                        .create_proposal_block(&self.chain, last_commit, signer.address());
                let parts = block
                    .make_part_set(self.config.block_part_size)
                    .map_err(|e| ConsensusError::execution(anyhow::Error::from(e).context("splitting proposal block")))?;
                (block, parts)
            }
        };

        // Everything we acted on so far must be durable before signing.
        self.wal.flush_and_sync().map_err(ConsensusError::wal_write)?;

        let block_id = BlockId {
            hash: block.hash(),
            parts: parts.header(),
        };
        let mut proposal = Proposal::new(height, round, self.rs.valid_round, block_id);
        match signer.sign_proposal(&self.chain.chain_id, &mut proposal) {
            Ok(()) => {
                tracing::info!(%proposal, num_txs = block.txs.len(), "Signed proposal");
                self.send_internal(ConsensusMessage::Proposal(proposal));
                for index in 0..parts.total() {
                    if let Some(part) = parts.get_part(index) {
                        self.send_internal(ConsensusMessage::BlockPart(BlockPartMessage {
                            height,
                            round,
                            part: part.clone(),
                        }));
                    }
                }
            }
            Err(error) => {
                if !self.replay_mode {
                    tracing::error!(height, round, %error, "Failed signing proposal");
                }
            }
        }
        Ok(())
    }

    /// The commit a new block carries: empty at the first height, otherwise
    /// the precommits collected for the previous block.
    fn proposal_last_commit(&self) -> Option<Commit> {
        if self.chain.is_first_height() {
            return Some(Commit::default());
        }
        self.rs.last_commit.as_ref().and_then(VoteSet::make_commit)
    }

    pub(super) fn enter_prevote(&mut self, height: u64, round: u32) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && Step::Prevote <= self.rs.step)
        {
            tracing::debug!(height, round, position = %self.rs.hrs(), "Skipping prevote");
            return Ok(());
        }
        tracing::debug!(height, round, "Entering prevote");

        if self.is_proposal_complete() {
            if let Some(proposal) = &self.rs.proposal {
                self.events.publish(ConsensusEvent::CompleteProposal {
                    hrs: self.rs.hrs(),
                    block_id: proposal.block_id,
                });
            }
        }

        self.rs.round = round;
        self.rs.step = Step::Prevote;
        self.do_prevote();
        self.new_step();
        Ok(())
    }

    fn do_prevote(&mut self) {
        if let Some(locked) = &self.rs.locked_block {
            tracing::debug!(position = %self.rs.hrs(), "Prevoting locked block");
            let block_id = block_id_of(locked, self.rs.locked_block_parts.as_ref());
            self.sign_add_vote(VoteType::Prevote, block_id);
            return;
        }

        let Some(block) = &self.rs.proposal_block else {
            tracing::debug!(position = %self.rs.hrs(), "Prevoting nil, no proposal block");
            self.sign_add_vote(VoteType::Prevote, BlockId::nil());
            return;
        };
        if let Err(error) = self.executor.validate_block(&self.chain, block) {
            tracing::warn!(position = %self.rs.hrs(), %error, "Prevoting nil, invalid proposal block");
            self.sign_add_vote(VoteType::Prevote, BlockId::nil());
            return;
        }
        let block_id = block_id_of(block, self.rs.proposal_block_parts.as_ref());
        let matches_proposal = self
            .rs
            .proposal
            .as_ref()
            .is_some_and(|p| p.block_id == block_id);
        if !matches_proposal {
            tracing::warn!(position = %self.rs.hrs(), %block_id, "Prevoting nil, block does not match the proposal");
            self.sign_add_vote(VoteType::Prevote, BlockId::nil());
            return;
        }
        self.sign_add_vote(VoteType::Prevote, block_id);
    }

    pub(super) fn enter_prevote_wait(&mut self, height: u64, round: u32) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && Step::PrevoteWait <= self.rs.step)
        {
            tracing::debug!(height, round, position = %self.rs.hrs(), "Skipping prevote wait");
            return Ok(());
        }
        if !self
            .rs
            .votes
            .prevotes(round)
            .is_some_and(VoteSet::has_two_thirds_any)
        {
            tracing::error!(height, round, "Entering prevote wait without 2/3+ prevotes");
            return Ok(());
        }
        tracing::debug!(height, round, "Entering prevote wait");

        self.rs.round = round;
        self.rs.step = Step::PrevoteWait;
        self.new_step();
        self.schedule_timeout(
            self.config.timeout_values.prevote(round),
            height,
            round,
            Step::PrevoteWait,
        );
        Ok(())
    }

    /// Precommits the block with a polka in `round`, locking on it, or nil.
    pub(super) fn enter_precommit(&mut self, height: u64, round: u32) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && Step::Precommit <= self.rs.step)
        {
            tracing::debug!(height, round, position = %self.rs.hrs(), "Skipping precommit");
            return Ok(());
        }
        tracing::debug!(height, round, "Entering precommit");

        self.rs.round = round;
        self.rs.step = Step::Precommit;
        let result = self.do_precommit(round);
        self.new_step();
        result
    }

    fn do_precommit(&mut self, round: u32) -> Result<(), ConsensusError> {
        let Some(block_id) = self
            .rs
            .votes
            .prevotes(round)
            .and_then(VoteSet::two_thirds_majority)
        else {
            if self.rs.locked_block.is_some() {
                tracing::debug!(round, "No polka, precommitting nil while locked");
            } else {
                tracing::debug!(round, "No polka, precommitting nil");
            }
            self.sign_add_vote(VoteType::Precommit, BlockId::nil());
            return Ok(());
        };

        self.events.publish(ConsensusEvent::Polka(self.rs.hrs()));

        if block_id.is_nil() {
            if self.rs.locked_block.is_some() {
                tracing::info!(round, "Polka for nil, unlocking");
                self.unlock();
            } else {
                tracing::debug!(round, "Polka for nil");
            }
            self.sign_add_vote(VoteType::Precommit, BlockId::nil());
            return Ok(());
        }

        if hashes_to(&self.rs.locked_block, &block_id.hash) {
            tracing::info!(round, %block_id, "Polka for the locked block, relocking");
            self.rs.locked_round = Some(round);
            self.events.publish(ConsensusEvent::Relock(self.rs.hrs()));
            self.sign_add_vote(VoteType::Precommit, block_id);
            return Ok(());
        }

        if let Some(block) = self
            .rs
            .proposal_block
            .as_ref()
            .filter(|b| b.hashes_to(&block_id.hash))
        {
            // Validators only prevote valid blocks, so this is a bug or
            // 2/3+ byzantine power.
            self.executor.validate_block(&self.chain, block).map_err(|e| {
                ConsensusError::execution(
                    anyhow::Error::from(e).context("2/3+ prevoted for an invalid block"),
                )
            })?;
            tracing::info!(round, %block_id, "Polka for the proposal block, locking");
            self.rs.locked_round = Some(round);
            self.rs.locked_block = self.rs.proposal_block.clone();
            self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
            self.events.publish(ConsensusEvent::Lock(self.rs.hrs()));
            self.sign_add_vote(VoteType::Precommit, block_id);
            return Ok(());
        }

        // A polka for a block we do not have. Fetch it, and precommit nil
        // meanwhile.
        tracing::info!(round, %block_id, "Polka for an unknown block, precommitting nil");
        self.unlock();
        if !self
            .rs
            .proposal_block_parts
            .as_ref()
            .is_some_and(|p| p.has_header(&block_id.parts))
        {
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = Some(PartSet::from_header(&block_id.parts));
        }
        self.sign_add_vote(VoteType::Precommit, BlockId::nil());
        Ok(())
    }

    fn unlock(&mut self) {
        self.rs.locked_round = None;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
        self.events.publish(ConsensusEvent::Unlock(self.rs.hrs()));
    }

    pub(super) fn enter_precommit_wait(&mut self, height: u64, round: u32) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.triggered_timeout_precommit)
        {
            tracing::debug!(height, round, position = %self.rs.hrs(), "Skipping precommit wait");
            return Ok(());
        }
        if !self
            .rs
            .votes
            .precommits(round)
            .is_some_and(VoteSet::has_two_thirds_any)
        {
            tracing::error!(height, round, "Entering precommit wait without 2/3+ precommits");
            return Ok(());
        }
        tracing::debug!(height, round, "Entering precommit wait");

        self.rs.round = round;
        self.rs.step = Step::PrecommitWait;
        self.rs.triggered_timeout_precommit = true;
        self.new_step();
        self.schedule_timeout(
            self.config.timeout_values.precommit(round),
            height,
            round,
            Step::PrecommitWait,
        );
        Ok(())
    }

    pub(super) fn enter_commit(&mut self, height: u64, commit_round: u32) -> Result<(), ConsensusError> {
        if self.rs.height != height || Step::Commit <= self.rs.step {
            tracing::debug!(height, commit_round, position = %self.rs.hrs(), "Skipping commit");
            return Ok(());
        }
        tracing::info!(height, commit_round, "Entering commit");

        let Some(block_id) = self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(VoteSet::two_thirds_majority)
        else {
            return Err(ConsensusError::execution(anyhow::anyhow!(
                "entering commit at {height}/{commit_round} without 2/3+ precommits"
            )));
        };

        if hashes_to(&self.rs.locked_block, &block_id.hash) {
            tracing::debug!(height, commit_round, "Commit is for the locked block");
            self.rs.proposal_block = self.rs.locked_block.clone();
            self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
        }
        if !hashes_to(&self.rs.proposal_block, &block_id.hash)
            && !self
                .rs
                .proposal_block_parts
                .as_ref()
                .is_some_and(|p| p.has_header(&block_id.parts))
        {
            tracing::info!(height, commit_round, %block_id, "Commit is for a block we do not have, fetching it");
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = Some(PartSet::from_header(&block_id.parts));
            self.announce_valid_block(true);
        }

        self.rs.step = Step::Commit;
        self.rs.commit_round = Some(commit_round);
        self.rs.commit_time = Timestamp::now();
        self.new_step();
        self.try_finalize_commit(height)
    }

    pub(super) fn try_finalize_commit(&mut self, height: u64) -> Result<(), ConsensusError> {
        if self.rs.height != height {
            return Ok(());
        }
        let Some(block_id) = self
            .rs
            .commit_round
            .and_then(|round| self.rs.votes.precommits(round))
            .and_then(VoteSet::two_thirds_majority)
        else {
            tracing::debug!(height, "Not finalizing, no 2/3+ precommits");
            return Ok(());
        };
        if block_id.is_nil() {
            return Ok(());
        }
        if !hashes_to(&self.rs.proposal_block, &block_id.hash) {
            tracing::debug!(height, %block_id, "Not finalizing, waiting for the block");
            return Ok(());
        }
        self.finalize_commit(height, block_id)
    }

    /// Saves, logs and applies the decided block, then moves to the next
    /// height.
    fn finalize_commit(&mut self, height: u64, block_id: BlockId) -> Result<(), ConsensusError> {
        if self.rs.step != Step::Commit {
            return Ok(());
        }
        let (Some(block), Some(parts)) = (
            self.rs.proposal_block.clone(),
            self.rs.proposal_block_parts.clone(),
        ) else {
            return Ok(());
        };
        let seen_commit = self
            .rs
            .commit_round
            .and_then(|round| self.rs.votes.precommits(round))
            .and_then(VoteSet::make_commit)
            .ok_or_else(|| ConsensusError::execution(anyhow::anyhow!("no commit for height {height}")))?;

        if self.block_store.height() < height {
            self.block_store
                .save_block(&block, &parts, seen_commit)
                .map_err(|e| ConsensusError::execution(anyhow::Error::from(e).context("saving block")))?;
        } else {
            tracing::debug!(height, "Block already saved");
        }

        // From here on a restart must not replay this height.
        self.wal
            .write_meta_sync(height + 1)
            .map_err(ConsensusError::wal_write)?;

        let (chain, _results) = self
            .executor
            .apply_block(&self.chain, block_id, &block)
            .map_err(|e| ConsensusError::execution(anyhow::Error::from(e).context("applying block")))?;

        let interval = block.header.time.since(self.chain.last_block_time);
        metrics::histogram!("consensus_block_interval_seconds", interval.as_secs_f64());
        metrics::gauge!("consensus_num_txs", block.txs.len() as f64);
        tracing::info!(
            height,
            hash = %block.hash(),
            num_txs = block.txs.len(),
            round = ?self.rs.commit_round,
            "Finalized block"
        );
        self.events.publish(ConsensusEvent::NewBlock {
            height,
            block_id,
            num_txs: block.txs.len(),
        });

        self.update_to_state(chain)?;
        self.new_step();
        self.schedule_round0();
        Ok(())
    }
}

fn block_id_of(block: &Block, parts: Option<&PartSet>) -> BlockId {
    BlockId {
        hash: block.hash(),
        parts: parts.map(PartSet::header).unwrap_or_default(),
    }
}
