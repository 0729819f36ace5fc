use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use replica_common::app::{AppConns, Application};
use replica_common::p2p::{
    ChannelId,
    Peer,
    PeerHeights,
    PeerId,
    Switch,
    CONSENSUS_DATA_CHANNEL,
    CONSENSUS_STATE_CHANNEL,
    CONSENSUS_VOTE_CHANNEL,
    CONSENSUS_VOTE_SET_BITS_CHANNEL,
    MEMPOOL_CHANNEL,
};
use replica_common::PrivValidator;
use replica_consensus::{
    BlockExecutor,
    ChainState,
    ConsensusHandle,
    ConsensusReactor,
    ConsensusService,
    ConsensusState,
    ConsensusWal,
    EventBus,
    EvidencePool,
    FileWal,
    Genesis,
    MemoryBlockStore,
    NopWal,
    RoundStateSummary,
};
use replica_mempool::{Mempool, MempoolReactor};
use replica_wal::WalConfig;
use tokio::sync::{mpsc, watch};

use crate::NodeConfig;

/// A validator: every component of the node, built once and owned here.
pub struct Node {
    mempool: Arc<Mempool>,
    block_store: Arc<MemoryBlockStore>,
    evidence: Arc<EvidencePool>,
    events: EventBus,
    switch: Arc<dyn Switch>,
    peer_heights: PeerHeights,
    mempool_reactor: MempoolReactor,
    /// Until [Node::start] hands it to the consensus service.
    consensus: Mutex<Option<ConsensusState>>,
    running: Option<Running>,
}

struct Running {
    consensus: ConsensusHandle,
    reactor: ConsensusReactor,
}

impl Node {
    /// Builds the node for a chain starting at `genesis`. Without a `signer`
    /// the node follows consensus but never votes.
    pub fn new(
        config: &NodeConfig,
        app: Arc<dyn Application>,
        genesis: &Genesis,
        signer: Option<Arc<dyn PrivValidator>>,
        switch: Arc<dyn Switch>,
    ) -> anyhow::Result<Self> {
        let chain = ChainState::from_genesis(genesis).context("Loading genesis")?;

        let conns = AppConns::new(app);
        let info = conns.query.info();
        // Blocks live in memory only, so there is nothing to replay into an
        // application that is already past genesis.
        anyhow::ensure!(
            info.last_block_height <= chain.last_block_height,
            "Application is at height {} but the chain starts at {}",
            info.last_block_height,
            chain.initial_height
        );

        let mempool = Arc::new(Mempool::new(
            config.mempool.clone(),
            conns.mempool,
            chain.last_block_height,
        ));
        mempool.init_wal().context("Opening mempool WAL")?;

        let evidence = Arc::new(EvidencePool::new(chain.chain_id.clone()));
        let executor = BlockExecutor::new(conns.consensus, mempool.clone(), evidence.clone());
        let block_store = Arc::new(MemoryBlockStore::new());

        let wal: Box<dyn ConsensusWal> = match &config.consensus.wal_path {
            Some(path) => {
                let wal_config = WalConfig::default()
                    .with_max_msg_size(config.consensus.wal_max_msg_size)
                    .with_flush_interval(config.consensus.wal_flush_interval);
                Box::new(
                    FileWal::open(path, wal_config)
                        .with_context(|| format!("Opening consensus WAL at {}", path.display()))?,
                )
            }
            None => {
                tracing::warn!("Consensus WAL disabled, a restart may lose votes");
                Box::new(NopWal)
            }
        };

        let events = EventBus::default();
        let mut consensus = ConsensusState::new(
            config.consensus.clone(),
            chain,
            executor,
            block_store.clone(),
            wal,
            events.clone(),
        )
        .context("Creating consensus state")?;
        if let Some(signer) = signer {
            tracing::info!(address = %signer.address(), "Running as validator");
            consensus = consensus.with_signer(signer);
        }

        let peer_heights = PeerHeights::new();
        Ok(Self {
            mempool_reactor: MempoolReactor::new(mempool.clone()).with_peer_heights(peer_heights.clone()),
            peer_heights,
            mempool,
            block_store,
            evidence,
            events,
            switch,
            consensus: Mutex::new(Some(consensus)),
            running: None,
        })
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    pub fn block_store(&self) -> &Arc<MemoryBlockStore> {
        &self.block_store
    }

    pub fn evidence_pool(&self) -> &Arc<EvidencePool> {
        &self.evidence
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The consensus position, once started.
    pub fn summary(&self) -> Option<watch::Receiver<RoundStateSummary>> {
        self.running.as_ref().map(|r| r.consensus.summary())
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| !r.consensus.is_finished())
    }

    /// Replays the consensus WAL, starts the state machine and connects both
    /// reactors to the peers already in the switch.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let state = self
            .consensus
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .context("Node already started")?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let consensus = ConsensusService::spawn(state, outbound).context("Starting consensus")?;
        let reactor = ConsensusReactor::new(self.switch.clone(), consensus.inputs())
            .with_peer_heights(self.peer_heights.clone());
        reactor.start(outbound_rx);
        self.running = Some(Running { consensus, reactor });

        for peer in self.switch.peers() {
            self.add_peer(peer).await?;
        }
        tracing::info!("Node started");
        Ok(())
    }

    /// Starts gossip to a newly connected `peer`. The switch is expected to
    /// list it already.
    pub async fn add_peer(&self, peer: Arc<dyn Peer>) -> anyhow::Result<()> {
        let id = peer.id().clone();
        self.mempool_reactor
            .add_peer(peer)
            .with_context(|| format!("Adding mempool peer {id}"))?;
        if let Some(running) = &self.running {
            running.reactor.add_peer(id).await;
        }
        Ok(())
    }

    pub fn remove_peer(&self, id: &PeerId) {
        tracing::debug!(peer = %id, "Removing peer");
        self.mempool_reactor.remove_peer(id);
        self.peer_heights.remove(id);
    }

    /// Routes `bytes` received from `peer` on `channel` to its reactor.
    pub async fn receive(&self, peer: &PeerId, channel: ChannelId, bytes: &[u8]) -> anyhow::Result<()> {
        match channel {
            MEMPOOL_CHANNEL => self.mempool_reactor.receive(peer, bytes).await?,
            CONSENSUS_STATE_CHANNEL
            | CONSENSUS_DATA_CHANNEL
            | CONSENSUS_VOTE_CHANNEL
            | CONSENSUS_VOTE_SET_BITS_CHANNEL => {
                let running = self.running.as_ref().context("Node not started")?;
                running.reactor.receive(peer, channel, bytes).await?;
            }
            other => anyhow::bail!("Unknown channel {other:#04x}"),
        }
        Ok(())
    }

    /// Stops the reactors, then consensus, then closes the mempool WAL. The
    /// consensus WAL is flushed by the service on its way out.
    pub async fn stop(mut self) -> anyhow::Result<()> {
        self.mempool_reactor.stop().await;
        let result = match self.running.take() {
            Some(Running { consensus, reactor }) => {
                reactor.stop().await;
                consensus.stop().await.context("Stopping consensus")
            }
            None => Ok(()),
        };
        self.mempool.close_wal();
        tracing::info!("Node stopped");
        result
    }
}
