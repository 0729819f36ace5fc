use std::sync::Arc;

use assert_matches::assert_matches;
use replica_common::app::AppConns;
use replica_common::test_utils::{validators, KvStoreApp};
use replica_common::{Hash, LocalSigner, PartSetHeader, PrivValidator, ValidatorSet};
use replica_mempool::{Config as MempoolConfig, Mempool, TxInfo};

use super::*;
use crate::{
    BlockParams,
    EvidencePool,
    Genesis,
    GenesisValidator,
    MemoryBlockStore,
    NopWal,
    TimeoutValues,
};

const CHAIN_ID: &str = "state-test";

struct Node {
    state: ConsensusState,
    app: Arc<KvStoreApp>,
    store: Arc<MemoryBlockStore>,
    set: ValidatorSet,
    signers: Vec<Arc<LocalSigner>>,
}

/// A node of an `n` validator chain, signing as validator `me`.
fn node(n: usize, me: Option<usize>) -> Node {
    let (set, signers) = validators(n, 10);
    let genesis = Genesis {
        chain_id: CHAIN_ID.into(),
        genesis_time: Timestamp(1_000),
        initial_height: 1,
        validators: signers
            .iter()
            .map(|s| GenesisValidator {
                pub_key: s.pub_key(),
                power: 10,
                name: String::new(),
            })
            .collect(),
        app_hash: Hash::default(),
        block_params: BlockParams::default(),
    };
    let app = KvStoreApp::new();
    let conns = AppConns::new(app.clone());
    let mempool = Arc::new(Mempool::new(MempoolConfig::default(), conns.mempool, 0));
    let executor = BlockExecutor::new(
        conns.consensus,
        mempool,
        Arc::new(EvidencePool::new(CHAIN_ID)),
    );
    let store = Arc::new(MemoryBlockStore::new());
    let config = Config::default()
        .with_timeout_values(TimeoutValues::fast())
        .with_block_part_size(64);
    let mut state = ConsensusState::new(
        config,
        ChainState::from_genesis(&genesis).unwrap(),
        executor,
        store.clone(),
        Box::new(NopWal),
        EventBus::default(),
    )
    .unwrap();
    if let Some(me) = me {
        state = state.with_signer(signers[me].clone());
    }
    Node {
        state,
        app,
        store,
        set,
        signers,
    }
}

fn vote(signer: &LocalSigner, set: &ValidatorSet, vote_type: VoteType, height: u64, round: u32, block_id: BlockId) -> Vote {
    let (index, _) = set.get_by_address(&signer.address()).unwrap();
    let mut vote = Vote {
        vote_type,
        height,
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

fn some_block_id(tag: &[u8]) -> BlockId {
    BlockId {
        hash: Hash::digest(tag),
        parts: PartSetHeader {
            total: 1,
            hash: Hash::digest([tag, &b"parts"[..]].concat()),
        },
    }
}

/// A second signer with the same key, without the double-sign guard's
/// memory of the first.
fn twin(signer: &LocalSigner, n: usize) -> LocalSigner {
    (1..=n as u8)
        .map(|seed| LocalSigner::from_seed([seed; 32]))
        .find(|s| s.address() == signer.address())
        .unwrap()
}

fn from_peer(msg: ConsensusMessage) -> MsgInfo {
    MsgInfo::from_peer(msg, PeerId::new("peer"))
}

#[test_log::test]
fn single_validator_commits_blocks_on_its_own() {
    let Node {
        mut state,
        app,
        store,
        ..
    } = node(1, Some(0));
    state
        .executor()
        .mempool()
        .check_tx(&b"k=v"[..], TxInfo::local())
        .unwrap();
    let mut events = state.events().subscribe();

    state.start().unwrap();
    for height in 1..=3 {
        let timeout = state.pop_next_timeout().unwrap();
        assert_eq!((timeout.height, timeout.step), (height, Step::NewHeight));
        state.handle_timeout(timeout).unwrap();
        state.process_internal().unwrap();
        assert_eq!(state.round_state().height, height + 1);
    }

    assert_eq!(store.height(), 3);
    assert_eq!(app.height(), 3);
    assert_eq!(app.get(b"k").as_deref(), Some(&b"v"[..]));
    assert!(state.executor().mempool().is_empty());

    let rs = state.round_state();
    assert_eq!(rs.step, Step::NewHeight);
    assert_eq!(rs.locked_round, None);
    assert!(rs.last_commit.as_ref().unwrap().has_all());
    assert_eq!(state.chain_state().last_block_height, 3);

    let mut committed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ConsensusEvent::NewBlock { height, num_txs, .. } = event {
            committed.push((height, num_txs));
        }
    }
    assert_eq!(committed, vec![(1, 1), (2, 0), (3, 0)]);
}

#[test]
fn proposal_from_a_non_proposer_is_rejected() {
    let Node {
        mut state, signers, ..
    } = node(4, None);
    state.start().unwrap();
    let timeout = state.pop_next_timeout().unwrap();
    state.handle_timeout(timeout).unwrap();
    assert_eq!(state.round_state().step, Step::Propose);

    let proposer = state.round_state().validators.proposer().unwrap().address;
    let impostor = signers.iter().find(|s| s.address() != proposer).unwrap();
    let mut proposal = Proposal::new(1, 0, None, some_block_id(b"block"));
    impostor.sign_proposal(CHAIN_ID, &mut proposal).unwrap();

    let error = state
        .handle_msg(from_peer(ConsensusMessage::Proposal(proposal)))
        .unwrap_err();
    assert!(error.is_recoverable());
    assert!(state.round_state().proposal.is_none());
}

#[test]
fn proposal_with_pol_round_at_or_after_its_round_is_rejected() {
    let Node {
        mut state, signers, ..
    } = node(4, None);
    state.start().unwrap();
    let timeout = state.pop_next_timeout().unwrap();
    state.handle_timeout(timeout).unwrap();

    let proposer = state.round_state().validators.proposer().unwrap().address;
    let proposer = signers.iter().find(|s| s.address() == proposer).unwrap();
    let mut proposal = Proposal::new(1, 0, Some(0), some_block_id(b"block"));
    proposer.sign_proposal(CHAIN_ID, &mut proposal).unwrap();

    assert!(state
        .handle_msg(from_peer(ConsensusMessage::Proposal(proposal)))
        .is_err());
}

#[test]
fn stale_timeouts_are_ignored() {
    let Node { mut state, .. } = node(4, None);
    state.start().unwrap();
    let timeout = state.pop_next_timeout().unwrap();
    state.handle_timeout(timeout).unwrap();
    let before = state.summary();

    state
        .handle_timeout(TimeoutInfo {
            duration: Duration::ZERO,
            height: 1,
            round: 0,
            step: Step::NewHeight,
        })
        .unwrap();
    state
        .handle_timeout(TimeoutInfo {
            duration: Duration::ZERO,
            height: 0,
            round: 5,
            step: Step::PrecommitWait,
        })
        .unwrap();
    assert_eq!(state.summary(), before);
}

#[test]
fn propose_timeout_prevotes_nil() {
    let Node {
        state, set, signers, ..
    } = node(4, None);
    let proposer = set.proposer().unwrap().address;
    let me = signers.iter().find(|s| s.address() != proposer).unwrap();
    let mut state = state.with_signer(me.clone());
    state.start().unwrap();
    let timeout = state.pop_next_timeout().unwrap();
    state.handle_timeout(timeout).unwrap();
    assert!(!state.has_internal());

    let timeout = state.pop_next_timeout().unwrap();
    assert_eq!(timeout.step, Step::Propose);
    state.handle_timeout(timeout).unwrap();
    assert_eq!(state.round_state().step, Step::Prevote);

    state.process_internal().unwrap();
    let prevotes = state.round_state().votes.prevotes(0).unwrap();
    assert_eq!(prevotes.votes().count(), 1);
    assert!(prevotes.votes().all(Vote::is_nil));
}

#[test]
fn two_thirds_nil_precommits_move_to_the_next_round() {
    let Node {
        mut state,
        set,
        signers,
        ..
    } = node(4, None);
    state.start().unwrap();
    let timeout = state.pop_next_timeout().unwrap();
    state.handle_timeout(timeout).unwrap();
    let timeout = state.pop_next_timeout().unwrap();
    state.handle_timeout(timeout).unwrap();
    assert_eq!(state.round_state().step, Step::Prevote);

    for signer in &signers[..3] {
        let prevote = vote(signer, &set, VoteType::Prevote, 1, 0, BlockId::nil());
        state.handle_msg(from_peer(ConsensusMessage::Vote(prevote))).unwrap();
    }
    assert_eq!(state.round_state().step, Step::Precommit);

    for signer in &signers[..3] {
        let precommit = vote(signer, &set, VoteType::Precommit, 1, 0, BlockId::nil());
        state.handle_msg(from_peer(ConsensusMessage::Vote(precommit))).unwrap();
    }
    assert_eq!(state.round_state().step, Step::PrecommitWait);

    let timeout = state.pop_next_timeout().unwrap();
    assert_eq!(timeout.step, Step::PrecommitWait);
    state.handle_timeout(timeout).unwrap();
    assert_eq!(state.round_state().round, 1);
    assert_eq!(state.round_state().step, Step::Propose);
}

#[test]
fn split_prevotes_wait_instead_of_locking() {
    let Node {
        mut state,
        set,
        signers,
        ..
    } = node(4, None);
    state.start().unwrap();
    let timeout = state.pop_next_timeout().unwrap();
    state.handle_timeout(timeout).unwrap();
    let timeout = state.pop_next_timeout().unwrap();
    state.handle_timeout(timeout).unwrap();
    assert_eq!(state.round_state().step, Step::Prevote);

    let targets = [some_block_id(b"a"), some_block_id(b"b"), BlockId::nil()];
    for (signer, block_id) in signers.iter().zip(targets) {
        let prevote = vote(signer, &set, VoteType::Prevote, 1, 0, block_id);
        state.handle_msg(from_peer(ConsensusMessage::Vote(prevote))).unwrap();
    }

    let prevotes = state.round_state().votes.prevotes(0).unwrap();
    assert!(prevotes.has_two_thirds_any());
    assert_eq!(prevotes.two_thirds_majority(), None);

    let rs = state.round_state();
    assert_eq!(rs.step, Step::PrevoteWait);
    assert_eq!(rs.locked_round, None);
    assert!(rs.locked_block.is_none());
    let timeout = state.pending_timeout().unwrap();
    assert_eq!((timeout.round, timeout.step), (0, Step::PrevoteWait));
}

#[test]
fn votes_from_a_later_round_pull_the_machine_forward() {
    let Node {
        mut state,
        set,
        signers,
        ..
    } = node(4, None);
    state.start().unwrap();
    let timeout = state.pop_next_timeout().unwrap();
    state.handle_timeout(timeout).unwrap();

    for signer in &signers[..2] {
        let prevote = vote(signer, &set, VoteType::Prevote, 1, 3, BlockId::nil());
        state.handle_msg(from_peer(ConsensusMessage::Vote(prevote))).unwrap();
    }
    assert_eq!(state.round_state().round, 0);

    let prevote = vote(&signers[2], &set, VoteType::Prevote, 1, 3, BlockId::nil());
    state.handle_msg(from_peer(ConsensusMessage::Vote(prevote))).unwrap();
    assert_eq!(state.round_state().round, 3);
}

#[test]
fn equivocation_is_recorded_as_evidence() {
    let Node {
        mut state,
        set,
        signers,
        ..
    } = node(4, None);
    state.start().unwrap();
    let timeout = state.pop_next_timeout().unwrap();
    state.handle_timeout(timeout).unwrap();

    let first = vote(&signers[3], &set, VoteType::Prevote, 1, 0, some_block_id(b"a"));
    let second = vote(&twin(&signers[3], 4), &set, VoteType::Prevote, 1, 0, some_block_id(b"b"));
    state.handle_msg(from_peer(ConsensusMessage::Vote(first))).unwrap();
    state.handle_msg(from_peer(ConsensusMessage::Vote(second))).unwrap();

    let evidence = state.executor().evidence_pool().pending_evidence();
    assert_eq!(evidence.len(), 1);
    assert_eq!(evidence[0].address(), signers[3].address());
}

#[test]
fn votes_for_other_heights_are_ignored() {
    let Node {
        mut state,
        set,
        signers,
        ..
    } = node(4, None);
    state.start().unwrap();

    let prevote = vote(&signers[0], &set, VoteType::Prevote, 7, 0, BlockId::nil());
    state.handle_msg(from_peer(ConsensusMessage::Vote(prevote))).unwrap();
    assert_eq!(state.round_state().votes.prevotes(0).unwrap().sum(), 0);
}

#[test]
fn unsigned_vote_at_the_last_possible_height_is_dropped() {
    let Node {
        mut state, signers, ..
    } = node(4, None);
    state.start().unwrap();
    let timeout = state.pop_next_timeout().unwrap();
    state.handle_timeout(timeout).unwrap();
    let before = state.summary();

    let forged = Vote {
        vote_type: VoteType::Precommit,
        height: u64::MAX,
        round: 0,
        block_id: BlockId::nil(),
        timestamp: Timestamp::now(),
        validator_address: signers[0].address(),
        validator_index: 0,
        signature: Signature::ZERO,
    };
    let bytes = ConsensusMessage::Vote(forged).encode().unwrap();
    let msg = ConsensusMessage::decode(replica_common::p2p::CONSENSUS_VOTE_CHANNEL, &bytes).unwrap();

    state.handle_msg(from_peer(msg)).unwrap();
    assert_eq!(state.summary(), before);
    assert_eq!(state.round_state().votes.precommits(0).unwrap().sum(), 0);
}

#[test]
fn precommit_wait_timeout_in_the_last_round_does_not_overflow() {
    let Node { mut state, .. } = node(4, None);
    state.start().unwrap();
    let timeout = state.pop_next_timeout().unwrap();
    state.handle_timeout(timeout).unwrap();
    state.rs.round = u32::MAX;
    state.rs.step = Step::PrecommitWait;

    state
        .handle_timeout(TimeoutInfo {
            duration: Duration::ZERO,
            height: 1,
            round: u32::MAX,
            step: Step::PrecommitWait,
        })
        .unwrap();
    assert_eq!(state.round_state().round, u32::MAX);
    assert_eq!(state.round_state().step, Step::PrecommitWait);
}

#[test]
fn peers_receive_our_status_and_catch_up_data() {
    let Node {
        mut state, store, ..
    } = node(1, Some(0));
    state.start().unwrap();
    let timeout = state.pop_next_timeout().unwrap();
    state.handle_timeout(timeout).unwrap();
    state.process_internal().unwrap();
    assert_eq!(store.height(), 1);
    state.drain_outbound();

    let peer = PeerId::new("behind");
    state.peer_added(peer.clone());
    assert_matches!(
        state.drain_outbound().as_slice(),
        [Outbound::ToPeer(to, ConsensusMessage::NewRoundStep(status))]
            if to == &peer && status.height == 2
    );

    state.peer_catchup(
        peer.clone(),
        NewRoundStepMessage {
            height: 1,
            round: 0,
            step: Step::Propose,
            seconds_since_start_time: 0,
            last_commit_round: None,
        },
    );
    let sent = state.drain_outbound();
    let parts = store.load_block_parts(1).unwrap();
    let votes = sent
        .iter()
        .filter(|m| matches!(m, Outbound::ToPeer(_, ConsensusMessage::Vote(_))))
        .count();
    let block_parts = sent
        .iter()
        .filter(|m| matches!(m, Outbound::ToPeer(_, ConsensusMessage::BlockPart(_))))
        .count();
    assert_eq!(votes, 1);
    assert_eq!(block_parts, parts.total() as usize);
}

#[test]
fn maj23_claims_are_answered_with_our_votes() {
    let Node {
        mut state,
        set,
        signers,
        ..
    } = node(4, None);
    state.start().unwrap();
    let timeout = state.pop_next_timeout().unwrap();
    state.handle_timeout(timeout).unwrap();

    let block_id = some_block_id(b"claimed");
    let prevote = vote(&signers[2], &set, VoteType::Prevote, 1, 0, block_id);
    state.handle_msg(from_peer(ConsensusMessage::Vote(prevote))).unwrap();

    let answer = state
        .set_peer_maj23(
            PeerId::new("peer"),
            VoteSetMaj23Message {
                height: 1,
                round: 0,
                vote_type: VoteType::Prevote,
                block_id,
            },
        )
        .unwrap();
    assert_eq!(answer.votes.count_ones(), 1);
    assert!(answer.votes[2]);
}
