//! The round state machine.
//!
//! [ConsensusState] is driven one input at a time: a message from a peer,
//! one of its own messages, or a fired timeout. Every input is written to
//! the WAL before it is acted on. The machine never blocks and never spawns;
//! what it wants sent to peers is queued as [Outbound] and the timeouts it
//! wants are held by its [TimeoutTicker], both for the service loop to pick
//! up.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use replica_common::p2p::PeerId;
use replica_common::{
    Block,
    BlockId,
    Hash,
    PartSet,
    PrivValidator,
    Proposal,
    Signature,
    Timestamp,
    Vote,
    VoteType,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::message::{
    BlockPartMessage,
    HasVoteMessage,
    NewRoundStepMessage,
    NewValidBlockMessage,
    ProposalPolMessage,
    VoteSetBitsMessage,
    VoteSetMaj23Message,
};
use crate::{
    BlockExecutor,
    BlockStore,
    ChainState,
    Config,
    ConsensusError,
    ConsensusEvent,
    ConsensusMessage,
    ConsensusWal,
    EventBus,
    HeightVoteSet,
    Hrs,
    MsgInfo,
    RoundState,
    RoundStateSummary,
    Step,
    TimeoutInfo,
    TimeoutTicker,
    VoteBits,
    VoteError,
    VoteSet,
    WalMessage,
};

mod replay;
mod steps;

/// A message the state machine wants delivered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Broadcast(ConsensusMessage),
    ToPeer(PeerId, ConsensusMessage),
}

pub struct ConsensusState {
    config: Config,
    chain: ChainState,
    rs: RoundState,
    executor: BlockExecutor,
    block_store: Arc<dyn BlockStore>,
    signer: Option<Arc<dyn PrivValidator>>,
    wal: Box<dyn ConsensusWal>,
    ticker: TimeoutTicker,
    events: EventBus,
    /// Own proposals, block parts and votes waiting to be handled.
    internal_queue: VecDeque<MsgInfo>,
    outbound: VecDeque<Outbound>,
    /// Set while re-feeding the WAL. Nothing is written to the WAL and
    /// signing failures are expected.
    replay_mode: bool,
}

impl ConsensusState {
    pub fn new(
        config: Config,
        chain: ChainState,
        executor: BlockExecutor,
        block_store: Arc<dyn BlockStore>,
        wal: Box<dyn ConsensusWal>,
        events: EventBus,
    ) -> Result<Self, ConsensusError> {
        let last_commit = reconstruct_last_commit(&chain, block_store.as_ref())?;
        let rs = new_round_state(&config, &chain, last_commit, Timestamp::default());
        Ok(Self {
            config,
            chain,
            rs,
            executor,
            block_store,
            signer: None,
            wal,
            ticker: TimeoutTicker::new(),
            events,
            internal_queue: VecDeque::new(),
            outbound: VecDeque::new(),
            replay_mode: false,
        })
    }

    /// Sign proposals and votes with `signer`.
    pub fn with_signer(mut self, signer: Arc<dyn PrivValidator>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn round_state(&self) -> &RoundState {
        &self.rs
    }

    pub fn chain_state(&self) -> &ChainState {
        &self.chain
    }

    pub fn summary(&self) -> RoundStateSummary {
        self.rs.summary()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn executor(&self) -> &BlockExecutor {
        &self.executor
    }

    /// Replays the WAL for the current height and schedules round 0.
    pub fn start(&mut self) -> Result<(), ConsensusError> {
        self.catchup_replay(self.rs.height)?;
        self.schedule_round0();
        Ok(())
    }

    /// Logs `msg` and acts on it. Own messages are synced to disk first.
    pub fn handle_msg(&mut self, mi: MsgInfo) -> Result<(), ConsensusError> {
        let entry = WalMessage::MsgInfo(mi.clone());
        let written = if mi.peer_id.is_none() {
            self.wal.write_sync(&entry)
        } else {
            self.wal.write(&entry)
        };
        written.map_err(ConsensusError::wal_write)?;
        self.process_msg(mi)
    }

    /// Logs the fired timeout and acts on it.
    pub fn handle_timeout(&mut self, ti: TimeoutInfo) -> Result<(), ConsensusError> {
        self.wal
            .write(&WalMessage::TimeoutInfo(ti))
            .map_err(ConsensusError::wal_write)?;
        self.process_timeout(ti)
    }

    /// Handles queued own messages until none are left. Errors about a
    /// single message are logged; fatal ones are returned.
    pub fn process_internal(&mut self) -> Result<(), ConsensusError> {
        while let Some(mi) = self.internal_queue.pop_front() {
            let result = self.handle_msg(mi);
            self.log_recoverable(result)?;
        }
        Ok(())
    }

    pub fn has_internal(&self) -> bool {
        !self.internal_queue.is_empty()
    }

    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        self.outbound.drain(..).collect()
    }

    pub fn next_timeout_due(&self) -> Option<Instant> {
        self.ticker.next_due()
    }

    pub fn pop_due_timeout(&mut self, now: Instant) -> Option<TimeoutInfo> {
        self.ticker.pop_due(now)
    }

    /// The pending timeout, whether it is due or not. Lets tests step
    /// through timeouts without waiting.
    pub fn pop_next_timeout(&mut self) -> Option<TimeoutInfo> {
        self.ticker.pop_next()
    }

    pub fn pending_timeout(&self) -> Option<TimeoutInfo> {
        self.ticker.pending()
    }

    pub fn stop_ticker(&mut self) {
        self.ticker.stop();
    }

    pub fn spawn_wal_flush(&self, cancel: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        self.wal.spawn_flush_task(cancel)
    }

    pub fn flush_wal(&self) -> Result<(), ConsensusError> {
        self.wal.flush_and_sync().map_err(ConsensusError::wal_write)
    }

    /// The mempool has transactions for round 0.
    pub fn handle_txs_available(&mut self) -> Result<(), ConsensusError> {
        if self.rs.round != 0 {
            return Ok(());
        }
        match self.rs.step {
            Step::NewHeight => {
                if self.need_proof_block(self.rs.height) {
                    return Ok(());
                }
                // Lands right after the commit timeout.
                let wait = self.rs.start_time.since(Timestamp::now()) + Duration::from_millis(1);
                self.schedule_timeout(wait, self.rs.height, 0, Step::NewRound);
                Ok(())
            }
            Step::NewRound => self.enter_propose(self.rs.height, 0),
            _ => Ok(()),
        }
    }

    /// Our position, as announced to peers.
    pub fn round_step_message(&self) -> NewRoundStepMessage {
        NewRoundStepMessage {
            height: self.rs.height,
            round: self.rs.round,
            step: self.rs.step,
            seconds_since_start_time: Timestamp::now().since(self.rs.start_time).as_secs(),
            last_commit_round: self.rs.last_commit.as_ref().map(VoteSet::round),
        }
    }

    /// A new peer learns where we are.
    pub fn peer_added(&mut self, peer: PeerId) {
        let status = ConsensusMessage::NewRoundStep(self.round_step_message());
        self.outbound.push_back(Outbound::ToPeer(peer, status));
    }

    /// Records a peer's 2/3+ claim and answers with the votes we have for
    /// that block.
    pub fn set_peer_maj23(
        &mut self,
        peer: PeerId,
        msg: VoteSetMaj23Message,
    ) -> Option<VoteSetBitsMessage> {
        if msg.height != self.rs.height {
            return None;
        }
        if let Err(error) =
            self.rs
                .votes
                .set_peer_maj23(msg.round, msg.vote_type, peer.clone(), msg.block_id)
        {
            tracing::warn!(%peer, %error, "Peer sent conflicting maj23 claims");
            return None;
        }
        let votes = self
            .rs
            .votes
            .vote_set(msg.round, msg.vote_type)
            .and_then(|set| set.bit_array_by_block_id(&msg.block_id))
            .unwrap_or_else(|| VoteBits::repeat(false, self.rs.validators.len()));
        let answer = VoteSetBitsMessage {
            height: msg.height,
            round: msg.round,
            vote_type: msg.vote_type,
            block_id: msg.block_id,
            votes,
        };
        self.outbound.push_back(Outbound::ToPeer(
            peer,
            ConsensusMessage::VoteSetBits(answer.clone()),
        ));
        Some(answer)
    }

    /// Sends a peer that announced `status` what it is missing: the
    /// proposal, block parts and votes of its round at our height, or the
    /// committed block and its commit when it is behind.
    pub fn peer_catchup(&mut self, peer: PeerId, status: NewRoundStepMessage) {
        let mut msgs = Vec::new();
        if status.height == self.rs.height {
            if status.round == self.rs.round {
                if let Some(proposal) = &self.rs.proposal {
                    msgs.push(ConsensusMessage::Proposal(proposal.clone()));
                    if let Some(pol_round) = proposal.pol_round {
                        if let Some(prevotes) = self.rs.votes.prevotes(pol_round) {
                            msgs.push(ConsensusMessage::ProposalPol(ProposalPolMessage {
                                height: self.rs.height,
                                proposal_pol_round: pol_round,
                                proposal_pol: prevotes.bit_array(),
                            }));
                        }
                    }
                }
            }
            if status.round == self.rs.round || self.rs.step == Step::Commit {
                if let Some(parts) = &self.rs.proposal_block_parts {
                    msgs.extend(block_part_messages(self.rs.height, self.rs.round, parts));
                }
            }
            let mut rounds = vec![status.round];
            if self.rs.round != status.round {
                rounds.push(self.rs.round);
            }
            for round in rounds {
                for vote_type in [VoteType::Prevote, VoteType::Precommit] {
                    if let Some(set) = self.rs.votes.vote_set(round, vote_type) {
                        msgs.extend(set.votes().cloned().map(ConsensusMessage::Vote));
                    }
                }
            }
        } else if status.height < self.rs.height {
            if let Some(commit) = self.block_store.load_seen_commit(status.height) {
                msgs.extend(commit.precommits.into_iter().flatten().map(ConsensusMessage::Vote));
            }
            if let Some(parts) = self.block_store.load_block_parts(status.height) {
                msgs.extend(block_part_messages(status.height, status.round, &parts));
            }
        }

        if !msgs.is_empty() {
            tracing::trace!(%peer, count = msgs.len(), "Sending catch-up messages");
        }
        self.outbound
            .extend(msgs.into_iter().map(|msg| Outbound::ToPeer(peer.clone(), msg)));
    }

    pub(crate) fn process_msg(&mut self, mi: MsgInfo) -> Result<(), ConsensusError> {
        let MsgInfo { msg, peer_id } = mi;
        if peer_id.is_none()
            && matches!(
                msg,
                ConsensusMessage::Proposal(_)
                    | ConsensusMessage::BlockPart(_)
                    | ConsensusMessage::Vote(_)
            )
        {
            self.outbound.push_back(Outbound::Broadcast(msg.clone()));
        }

        match msg {
            ConsensusMessage::Proposal(proposal) => self.set_proposal(proposal),
            ConsensusMessage::BlockPart(msg) => {
                let height = msg.height;
                if self.add_proposal_block_part(msg, peer_id.as_ref())? {
                    self.handle_complete_proposal(height)?;
                }
                Ok(())
            }
            ConsensusMessage::Vote(vote) => self.add_vote(vote, peer_id.as_ref()).map(|_| ()),
            other => {
                tracing::debug!(msg = %other, peer = ?peer_id, "Ignoring message the state machine does not handle");
                Ok(())
            }
        }
    }

    pub(crate) fn process_timeout(&mut self, ti: TimeoutInfo) -> Result<(), ConsensusError> {
        tracing::debug!(timeout = %ti, position = %self.rs.hrs(), "Timeout fired");

        if ti.height != self.rs.height
            || ti.round < self.rs.round
            || (ti.round == self.rs.round && ti.step < self.rs.step)
        {
            tracing::debug!(timeout = %ti, position = %self.rs.hrs(), "Ignoring timeout because we are ahead");
            return Ok(());
        }

        match ti.step {
            Step::NewHeight => self.enter_new_round(ti.height, 0),
            Step::NewRound => self.enter_propose(ti.height, 0),
            Step::Propose => {
                self.events.publish(ConsensusEvent::TimeoutPropose(self.rs.hrs()));
                self.enter_prevote(ti.height, ti.round)
            }
            Step::PrevoteWait => {
                self.events.publish(ConsensusEvent::TimeoutWait(self.rs.hrs()));
                self.enter_precommit(ti.height, ti.round)
            }
            Step::PrecommitWait => {
                self.events.publish(ConsensusEvent::TimeoutWait(self.rs.hrs()));
                self.enter_precommit(ti.height, ti.round)?;
                self.enter_new_round(ti.height, ti.round.saturating_add(1))
            }
            step => {
                tracing::error!(%step, "Timeout for a step without timeouts");
                Ok(())
            }
        }
    }

    fn log_recoverable(&self, result: Result<(), ConsensusError>) -> Result<(), ConsensusError> {
        match result {
            Err(error) if error.is_recoverable() => {
                tracing::debug!(position = %self.rs.hrs(), %error, "Dropped message");
                Ok(())
            }
            other => other,
        }
    }

    fn set_proposal(&mut self, proposal: Proposal) -> Result<(), ConsensusError> {
        if self.rs.proposal.is_some()
            || proposal.height != self.rs.height
            || proposal.round != self.rs.round
        {
            return Ok(());
        }
        if !proposal.validate_basic() || proposal.pol_round.is_some_and(|pol| pol >= proposal.round)
        {
            return Err(ConsensusError::invalid_message(anyhow::anyhow!(
                "invalid proposal {proposal}"
            )));
        }
        let Some(proposer) = self.rs.validators.proposer() else {
            return Ok(());
        };
        if !proposal.verify(&self.chain.chain_id, &proposer.pub_key) {
            return Err(ConsensusError::invalid_message(anyhow::anyhow!(
                "proposal {proposal} is not signed by proposer {}",
                proposer.address
            )));
        }

        tracing::info!(position = %self.rs.hrs(), block_id = %proposal.block_id, "Received proposal");
        // Parts may already be arriving for a block we learned about from
        // a polka or a commit.
        if self.rs.proposal_block_parts.is_none() {
            self.rs.proposal_block_parts = Some(PartSet::from_header(&proposal.block_id.parts));
        }
        self.rs.proposal = Some(proposal);
        Ok(())
    }

    /// Returns `true` once the part completed the proposal block.
    fn add_proposal_block_part(
        &mut self,
        msg: BlockPartMessage,
        peer: Option<&PeerId>,
    ) -> Result<bool, ConsensusError> {
        if msg.height != self.rs.height {
            tracing::debug!(height = msg.height, current = self.rs.height, "Received block part from wrong height");
            return Ok(false);
        }
        let Some(parts) = self.rs.proposal_block_parts.as_mut() else {
            // The proposal has not arrived yet.
            tracing::debug!(height = msg.height, round = msg.round, ?peer, "Received block part before the proposal");
            return Ok(false);
        };
        let added = parts
            .add_part(msg.part)
            .map_err(|e| ConsensusError::invalid_message(crate::MessageError::from(e)))?;
        if !added || !parts.is_complete() {
            return Ok(false);
        }
        let Some(bytes) = parts.assemble() else {
            return Ok(false);
        };
        let block = Block::from_bytes(&bytes).map_err(|e| {
            ConsensusError::invalid_message(anyhow::Error::from(e).context("decoding proposal block"))
        })?;
        tracing::info!(height = block.height(), hash = %block.hash(), "Received complete proposal block");
        self.rs.proposal_block = Some(block);
        Ok(true)
    }

    fn handle_complete_proposal(&mut self, height: u64) -> Result<(), ConsensusError> {
        let round = self.rs.round;
        let maj23 = self
            .rs
            .votes
            .prevotes(round)
            .and_then(VoteSet::two_thirds_majority);
        if let Some(block_id) = maj23 {
            if !block_id.is_nil()
                && self.rs.valid_round < Some(round)
                && hashes_to(&self.rs.proposal_block, &block_id.hash)
            {
                tracing::info!(height, round, "Updating valid block to the new proposal block");
                self.rs.valid_round = Some(round);
                self.rs.valid_block = self.rs.proposal_block.clone();
                self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
            }
        }

        if self.rs.step <= Step::Propose && self.is_proposal_complete() {
            self.enter_prevote(height, round)?;
            if maj23.is_some() {
                self.enter_precommit(height, round)?;
            }
        } else if self.rs.step == Step::Commit {
            self.try_finalize_commit(height)?;
        }
        Ok(())
    }

    fn add_vote(&mut self, vote: Vote, peer: Option<&PeerId>) -> Result<bool, ConsensusError> {
        tracing::trace!(%vote, ?peer, position = %self.rs.hrs(), "Adding vote");

        // A late precommit for the previous height.
        if vote.height.checked_add(1) == Some(self.rs.height) && vote.vote_type == VoteType::Precommit {
            if self.rs.step != Step::NewHeight {
                tracing::debug!(%vote, "Precommit for the last height arrived after the commit timeout");
                return Ok(false);
            }
            let Some(last_commit) = self.rs.last_commit.as_mut() else {
                return Ok(false);
            };
            let result = last_commit.add_vote(vote.clone());
            let added = self.check_vote_result(result)?;
            if !added {
                return Ok(false);
            }
            let has_all = self.rs.last_commit.as_ref().is_some_and(VoteSet::has_all);
            tracing::debug!(%vote, "Added to last precommits");
            self.events.publish(ConsensusEvent::Vote(vote));
            if self.config.skip_timeout_commit && has_all {
                self.enter_new_round(self.rs.height, 0)?;
            }
            return Ok(true);
        }

        if vote.height != self.rs.height {
            tracing::debug!(%vote, current = self.rs.height, "Vote for another height ignored");
            return Ok(false);
        }

        let height = self.rs.height;
        let result = self.rs.votes.add_vote(vote.clone(), peer);
        if !self.check_vote_result(result)? {
            return Ok(false);
        }

        self.events.publish(ConsensusEvent::Vote(vote.clone()));
        self.outbound
            .push_back(Outbound::Broadcast(ConsensusMessage::HasVote(HasVoteMessage {
                height: vote.height,
                round: vote.round,
                vote_type: vote.vote_type,
                index: vote.validator_index,
            })));

        match vote.vote_type {
            VoteType::Prevote => self.on_prevote_added(height, vote.round)?,
            VoteType::Precommit => self.on_precommit_added(height, vote.round)?,
        }
        Ok(true)
    }

    /// Turns a vote set result into whether the vote was added. Equivocation
    /// is recorded as evidence; other failures reject the message.
    fn check_vote_result(&mut self, result: Result<bool, VoteError>) -> Result<bool, ConsensusError> {
        match result {
            Ok(added) => Ok(added),
            Err(VoteError::Conflicting { evidence, added }) => {
                let ours = self
                    .signer
                    .as_ref()
                    .is_some_and(|s| s.address() == evidence.address());
                if ours {
                    tracing::error!(
                        height = evidence.height(),
                        "Found a conflicting vote from ourselves. Was the signer state reset?"
                    );
                    return Ok(added);
                }
                if let Err(error) = self.executor.evidence_pool().add_evidence(*evidence) {
                    tracing::warn!(%error, "Dropping invalid evidence");
                }
                Ok(added)
            }
            Err(error @ VoteError::NonDeterministicSignature(_)) => {
                tracing::debug!(%error, "Vote has a non-deterministic signature");
                Ok(false)
            }
            Err(error) => Err(ConsensusError::invalid_message(error)),
        }
    }

    fn on_prevote_added(&mut self, height: u64, round: u32) -> Result<(), ConsensusError> {
        let Some(prevotes) = self.rs.votes.prevotes(round) else {
            return Ok(());
        };
        let maj23 = prevotes.two_thirds_majority();
        let has_any = prevotes.has_two_thirds_any();
        tracing::debug!(height, round, prevotes = %prevotes, "Added prevote");

        if let Some(block_id) = maj23 {
            // A polka for something other than our locked block in a later
            // round releases the lock.
            if let Some(locked_round) = self.rs.locked_round {
                if locked_round < round
                    && round <= self.rs.round
                    && !hashes_to(&self.rs.locked_block, &block_id.hash)
                {
                    tracing::info!(height, round, locked_round, "Unlocking because of a later polka");
                    self.rs.locked_round = None;
                    self.rs.locked_block = None;
                    self.rs.locked_block_parts = None;
                    self.events.publish(ConsensusEvent::Unlock(self.rs.hrs()));
                }
            }

            if !block_id.is_nil() && self.rs.valid_round < Some(round) && round == self.rs.round {
                if hashes_to(&self.rs.proposal_block, &block_id.hash) {
                    tracing::info!(height, round, "Updating valid block because of a polka");
                    self.rs.valid_round = Some(round);
                    self.rs.valid_block = self.rs.proposal_block.clone();
                    self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
                } else {
                    tracing::info!(height, round, block_id = %block_id, "Polka for a block we do not have");
                    self.rs.proposal_block = None;
                }
                if !self
                    .rs
                    .proposal_block_parts
                    .as_ref()
                    .is_some_and(|p| p.has_header(&block_id.parts))
                {
                    self.rs.proposal_block_parts = Some(PartSet::from_header(&block_id.parts));
                }
                self.announce_valid_block(false);
            }
        }

        if self.rs.round < round && has_any {
            self.enter_new_round(height, round)?;
        } else if self.rs.round == round && self.rs.step >= Step::Prevote {
            match maj23 {
                Some(block_id) if self.is_proposal_complete() || block_id.is_nil() => {
                    self.enter_precommit(height, round)?;
                }
                _ if has_any => self.enter_prevote_wait(height, round)?,
                _ => {}
            }
        } else if self
            .rs
            .proposal
            .as_ref()
            .is_some_and(|p| p.pol_round == Some(round))
            && self.is_proposal_complete()
        {
            self.enter_prevote(height, self.rs.round)?;
        }
        Ok(())
    }

    fn on_precommit_added(&mut self, height: u64, round: u32) -> Result<(), ConsensusError> {
        let Some(precommits) = self.rs.votes.precommits(round) else {
            return Ok(());
        };
        let maj23 = precommits.two_thirds_majority();
        let has_any = precommits.has_two_thirds_any();
        let has_all = precommits.has_all();
        tracing::debug!(height, round, precommits = %precommits, "Added precommit");

        match maj23 {
            Some(block_id) => {
                // Catch up to the round of the majority first.
                self.enter_new_round(height, round)?;
                self.enter_precommit(height, round)?;
                if block_id.is_nil() {
                    self.enter_precommit_wait(height, round)?;
                } else {
                    self.enter_commit(height, round)?;
                    if self.config.skip_timeout_commit && has_all {
                        self.enter_new_round(self.rs.height, 0)?;
                    }
                }
            }
            None if self.rs.round <= round && has_any => {
                self.enter_new_round(height, round)?;
                self.enter_precommit_wait(height, round)?;
            }
            None => {}
        }
        Ok(())
    }

    fn is_proposal_complete(&self) -> bool {
        let Some(proposal) = &self.rs.proposal else {
            return false;
        };
        if self.rs.proposal_block.is_none() {
            return false;
        }
        match proposal.pol_round {
            None => true,
            Some(pol_round) => self
                .rs
                .votes
                .prevotes(pol_round)
                .is_some_and(VoteSet::has_two_thirds_majority),
        }
    }

    fn is_proposer(&self) -> bool {
        match (&self.signer, self.rs.validators.proposer()) {
            (Some(signer), Some(proposer)) => signer.address() == proposer.address,
            _ => false,
        }
    }

    /// Whether the block of `height` has to be made even without
    /// transactions: the first block, or one that proves a new app hash.
    fn need_proof_block(&self, height: u64) -> bool {
        if height == self.chain.initial_height {
            return true;
        }
        match self.block_store.load_block(height - 1) {
            Some(last) => last.header.app_hash != self.chain.app_hash,
            None => true,
        }
    }

    fn send_internal(&mut self, msg: ConsensusMessage) {
        self.internal_queue.push_back(MsgInfo::internal(msg));
    }

    fn schedule_timeout(&mut self, duration: Duration, height: u64, round: u32, step: Step) {
        self.ticker.schedule(TimeoutInfo {
            duration,
            height,
            round,
            step,
        });
    }

    /// Waits out the rest of the commit timeout before round 0.
    fn schedule_round0(&mut self) {
        let wait = self.rs.start_time.since(Timestamp::now());
        self.schedule_timeout(wait, self.rs.height, 0, Step::NewHeight);
    }

    /// Publishes the current position.
    fn new_step(&mut self) {
        let hrs = self.rs.hrs();
        if !self.replay_mode {
            if let Err(error) = self.wal.write(&WalMessage::NewRoundStep(hrs)) {
                tracing::error!(%error, position = %hrs, "Failed writing step marker to the WAL");
            }
        }
        metrics::gauge!("consensus_height", hrs.height as f64);
        metrics::gauge!("consensus_round", hrs.round as f64);
        metrics::increment_counter!("consensus_step_transitions");

        self.events.publish(ConsensusEvent::NewRoundStep(hrs));
        self.outbound.push_back(Outbound::Broadcast(ConsensusMessage::NewRoundStep(
            self.round_step_message(),
        )));
    }

    fn announce_valid_block(&mut self, is_commit: bool) {
        let Some(parts) = &self.rs.proposal_block_parts else {
            return;
        };
        let header = parts.header();
        let block_parts: VoteBits = parts.bit_array().into_iter().collect();
        self.events.publish(ConsensusEvent::NewValidBlock {
            hrs: self.rs.hrs(),
            parts: header,
            is_commit,
        });
        self.outbound.push_back(Outbound::Broadcast(ConsensusMessage::NewValidBlock(
            NewValidBlockMessage {
                height: self.rs.height,
                round: self.rs.round,
                block_parts_header: header,
                block_parts,
                is_commit,
            },
        )));
    }

    /// Signs a vote for the current position and queues it for ourselves.
    fn sign_add_vote(&mut self, vote_type: VoteType, block_id: BlockId) {
        let Some(signer) = self.signer.clone() else {
            return;
        };
        let address = signer.address();
        let Some((index, _)) = self.rs.validators.get_by_address(&address) else {
            return;
        };
        let mut vote = Vote {
            vote_type,
            height: self.rs.height,
            round: self.rs.round,
            block_id,
            timestamp: self.vote_time(),
            validator_address: address,
            validator_index: index,
            signature: Signature::ZERO,
        };
        match signer.sign_vote(&self.chain.chain_id, &mut vote) {
            Ok(()) => {
                tracing::debug!(%vote, "Signed vote");
                self.send_internal(ConsensusMessage::Vote(vote));
            }
            Err(error) => {
                if !self.replay_mode {
                    tracing::error!(%error, position = %self.rs.hrs(), %vote_type, "Failed signing vote");
                }
            }
        }
    }

    /// Vote timestamps never precede the block they are about.
    fn vote_time(&self) -> Timestamp {
        let now = Timestamp::now();
        let block_time = self
            .rs
            .locked_block
            .as_ref()
            .or(self.rs.proposal_block.as_ref())
            .map(|b| b.header.time.saturating_add(Duration::from_millis(1)));
        match block_time {
            Some(min) if min > now => min,
            _ => now,
        }
    }

    /// Moves to the height after `chain.last_block_height`.
    fn update_to_state(&mut self, chain: ChainState) -> Result<(), ConsensusError> {
        let last_commit = match self.rs.commit_round {
            Some(round) if self.rs.height == chain.last_block_height => {
                self.rs.votes.precommits(round).cloned()
            }
            _ => reconstruct_last_commit(&chain, self.block_store.as_ref())?,
        };
        self.rs = new_round_state(&self.config, &chain, last_commit, self.rs.commit_time);
        self.chain = chain;
        Ok(())
    }
}

fn new_round_state(
    config: &Config,
    chain: &ChainState,
    last_commit: Option<VoteSet>,
    commit_time: Timestamp,
) -> RoundState {
    let height = chain.next_height();
    let committed = if commit_time == Timestamp::default() {
        Timestamp::now()
    } else {
        commit_time
    };
    RoundState {
        height,
        round: 0,
        step: Step::NewHeight,
        start_time: committed.saturating_add(config.timeout_values.commit),
        commit_time,
        validators: chain.validators.clone(),
        proposal: None,
        proposal_block: None,
        proposal_block_parts: None,
        locked_round: None,
        locked_block: None,
        locked_block_parts: None,
        valid_round: None,
        valid_block: None,
        valid_block_parts: None,
        votes: HeightVoteSet::new(chain.chain_id.clone(), height, chain.validators.clone()),
        commit_round: None,
        last_commit,
        last_validators: chain.last_validators.clone(),
        triggered_timeout_precommit: false,
    }
}

/// Rebuilds the precommits for the last block from the commit stored with
/// it.
fn reconstruct_last_commit(
    chain: &ChainState,
    store: &dyn BlockStore,
) -> Result<Option<VoteSet>, ConsensusError> {
    if chain.is_first_height() {
        return Ok(None);
    }
    let height = chain.last_block_height;
    let seen = store.load_seen_commit(height).ok_or_else(|| {
        ConsensusError::execution(anyhow::anyhow!("no seen commit for height {height}"))
    })?;
    let validators = chain.last_validators.clone().ok_or_else(|| {
        ConsensusError::execution(anyhow::anyhow!("no validators for height {height}"))
    })?;
    let mut last_commit = VoteSet::new(
        chain.chain_id.clone(),
        height,
        seen.round(),
        VoteType::Precommit,
        validators,
    );
    for vote in seen.precommits.into_iter().flatten() {
        last_commit
            .add_vote(vote)
            .map_err(|e| ConsensusError::execution(anyhow::Error::from(e).context("rebuilding last commit")))?;
    }
    if !last_commit.has_two_thirds_majority() {
        return Err(ConsensusError::execution(anyhow::anyhow!(
            "seen commit for height {height} has no majority"
        )));
    }
    Ok(Some(last_commit))
}

fn hashes_to(block: &Option<Block>, hash: &Hash) -> bool {
    block.as_ref().is_some_and(|b| b.hashes_to(hash))
}

fn block_part_messages(height: u64, round: u32, parts: &PartSet) -> Vec<ConsensusMessage> {
    (0..parts.total())
        .filter_map(|index| parts.get_part(index))
        .map(|part| {
            ConsensusMessage::BlockPart(BlockPartMessage {
                height,
                round,
                part: part.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests;
