use std::path::Path;
use std::sync::Arc;

use replica_common::p2p::{ChannelId, Peer, PeerId};
use replica_common::{LocalSigner, PrivValidator, Timestamp};
use replica_consensus::{Genesis, GenesisValidator, TimeoutValues};
use replica_node::NodeConfig;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

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

pub fn config(home: &Path) -> NodeConfig {
    let mut config = NodeConfig::with_home(home);
    config.consensus = config
        .consensus
        .with_timeout_values(TimeoutValues::fast());
    config
}

pub fn genesis(signers: &[Arc<LocalSigner>]) -> Genesis {
    Genesis {
        chain_id: "replica-node-test".into(),
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
        app_hash: Default::default(),
        block_params: Default::default(),
    }
}

pub type Wire = mpsc::UnboundedSender<(PeerId, ChannelId, Vec<u8>)>;

/// Hands whatever is sent to it to the wire of the node it stands for.
pub struct LoopbackPeer {
    pub id: PeerId,
    pub from: PeerId,
    pub wire: Wire,
}

impl Peer for LoopbackPeer {
    fn id(&self) -> &PeerId {
        &self.id
    }

    fn send(&self, channel: ChannelId, msg: Vec<u8>) -> bool {
        self.wire.send((self.from.clone(), channel, msg)).is_ok()
    }
}
