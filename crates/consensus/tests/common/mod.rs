use std::sync::Arc;

use replica_common::app::AppConns;
use replica_common::p2p::PeerId;
use replica_common::test_utils::{validators, KvStoreApp};
use replica_common::{Hash, LocalSigner, PrivValidator, Signature, Timestamp, ValidatorSet, Vote, VoteType, BlockId};
use replica_consensus::*;
use replica_mempool::{Config as MempoolConfig, Mempool, TxInfo};
use tracing_subscriber::EnvFilter;

pub const CHAIN_ID: &str = "replica-test";

/// Setup tracing for the tests.
/// This is just used for debugging purposes.
#[allow(dead_code)]
pub fn setup_tracing_full() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trace"));

    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_env_filter(filter)
        .with_target(true)
        .without_time()
        .try_init();
}

pub fn genesis(signers: &[Arc<LocalSigner>]) -> Genesis {
    Genesis {
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
    }
}

/// Fast timeouts and small block parts, so blocks span several parts.
pub fn config() -> Config {
    Config::default()
        .with_timeout_values(TimeoutValues::fast())
        .with_block_part_size(128)
}

pub struct TestNode {
    pub id: PeerId,
    pub state: ConsensusState,
    pub app: Arc<KvStoreApp>,
    pub store: Arc<MemoryBlockStore>,
    pub mempool: Arc<Mempool>,
}

impl TestNode {
    pub fn new(
        id: &str,
        genesis: &Genesis,
        signer: Option<Arc<LocalSigner>>,
        wal: Box<dyn ConsensusWal>,
    ) -> Self {
        let app = KvStoreApp::new();
        let conns = AppConns::new(app.clone());
        let mempool = Arc::new(Mempool::new(MempoolConfig::default(), conns.mempool, 0));
        let executor = BlockExecutor::new(
            conns.consensus,
            mempool.clone(),
            Arc::new(EvidencePool::new(CHAIN_ID)),
        );
        let store = Arc::new(MemoryBlockStore::new());
        let mut state = ConsensusState::new(
            config(),
            ChainState::from_genesis(genesis).unwrap(),
            executor,
            store.clone(),
            wal,
            EventBus::default(),
        )
        .unwrap();
        if let Some(signer) = signer {
            state = state.with_signer(signer);
        }
        Self {
            id: PeerId::new(id),
            state,
            app,
            store,
            mempool,
        }
    }

    pub fn height(&self) -> u64 {
        self.state.round_state().height
    }

    pub fn submit(&self, tx: &[u8]) {
        self.mempool.check_tx(tx, TxInfo::local()).unwrap();
    }

    /// Acts on a message from `from` the way the reactor and service would.
    pub fn receive(&mut self, from: &PeerId, msg: ConsensusMessage) {
        match msg {
            ConsensusMessage::NewRoundStep(status) => self.state.peer_catchup(from.clone(), status),
            ConsensusMessage::VoteSetMaj23(msg) => {
                self.state.set_peer_maj23(from.clone(), msg);
            }
            ConsensusMessage::HasVote(_)
            | ConsensusMessage::NewValidBlock(_)
            | ConsensusMessage::ProposalPol(_)
            | ConsensusMessage::VoteSetBits(_) => {}
            msg => match self.state.handle_msg(MsgInfo::from_peer(msg, from.clone())) {
                Err(error) if error.is_recoverable() => {}
                other => other.unwrap(),
            },
        }
    }
}

/// Validators wired together in-process. Messages are delivered
/// synchronously and timeouts fire in order of their deadlines, without
/// waiting for them.
pub struct Network {
    pub nodes: Vec<TestNode>,
    pub set: ValidatorSet,
    pub signers: Vec<Arc<LocalSigner>>,
    /// Nodes that neither send nor receive.
    pub offline: Vec<bool>,
}

impl Network {
    pub fn new(n: usize) -> Self {
        let (set, signers) = validators(n, 10);
        let genesis = genesis(&signers);
        let nodes = signers
            .iter()
            .enumerate()
            .map(|(i, signer)| {
                TestNode::new(
                    &format!("node-{i}"),
                    &genesis,
                    Some(signer.clone()),
                    Box::new(NopWal),
                )
            })
            .collect();
        Self {
            nodes,
            set,
            signers,
            offline: vec![false; n],
        }
    }

    pub fn start(&mut self) {
        for node in &mut self.nodes {
            node.state.start().unwrap();
        }
    }

    /// Every node receives `tx`, as mempool gossip would do.
    pub fn submit(&self, tx: &[u8]) {
        for node in &self.nodes {
            node.submit(tx);
        }
    }

    /// Delivers messages until no node has anything left to send.
    pub fn deliver(&mut self) {
        loop {
            let mut mail = Vec::new();
            for (i, node) in self.nodes.iter_mut().enumerate() {
                node.state.process_internal().unwrap();
                let out = node.state.drain_outbound();
                if !self.offline[i] {
                    mail.extend(out.into_iter().map(|o| (i, o)));
                }
            }
            if mail.is_empty() {
                return;
            }
            for (from, out) in mail {
                let from_id = self.nodes[from].id.clone();
                match out {
                    Outbound::Broadcast(msg) => {
                        for to in 0..self.nodes.len() {
                            if to != from && !self.offline[to] {
                                self.nodes[to].receive(&from_id, msg.clone());
                            }
                        }
                    }
                    Outbound::ToPeer(peer, msg) => {
                        if let Some(to) = self.nodes.iter().position(|n| n.id == peer) {
                            if !self.offline[to] {
                                self.nodes[to].receive(&from_id, msg);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Fires the timeout with the earliest deadline. Returns `false` if no
    /// online node waits for one.
    pub fn fire_next_timeout(&mut self) -> bool {
        let next = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.offline[*i])
            .filter_map(|(i, n)| n.state.next_timeout_due().map(|due| (due, i)))
            .min();
        let Some((_, i)) = next else {
            return false;
        };
        let timeout = self.nodes[i].state.pop_next_timeout().unwrap();
        self.nodes[i].state.handle_timeout(timeout).unwrap();
        true
    }

    /// Alternates delivery and timeouts until `done` holds. Returns `false`
    /// if it did not within `max_timeouts`.
    pub fn run_until(&mut self, max_timeouts: usize, done: impl Fn(&Network) -> bool) -> bool {
        for _ in 0..max_timeouts {
            self.deliver();
            if done(self) {
                return true;
            }
            if !self.fire_next_timeout() {
                return false;
            }
        }
        self.deliver();
        done(self)
    }

    pub fn online(&self) -> impl Iterator<Item = &TestNode> {
        self.nodes
            .iter()
            .zip(&self.offline)
            .filter(|(_, off)| !**off)
            .map(|(n, _)| n)
    }
}

/// A vote signed by `signer`, as validator of `set`.
#[allow(dead_code)]
pub fn signed_vote(
    signer: &LocalSigner,
    set: &ValidatorSet,
    vote_type: VoteType,
    height: u64,
    round: u32,
    block_id: BlockId,
) -> Vote {
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
