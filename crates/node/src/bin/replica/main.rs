#![deny(rust_2018_idioms)]

use std::sync::Arc;

use anyhow::Context;
use replica_common::{LocalSigner, PrivValidator, Timestamp};
use replica_consensus::{ConsensusEvent, Genesis, GenesisValidator};
use replica_node::app::KvApp;
use replica_node::{LogFormat, Node, NodeConfig, PeerSet};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }

    let config = NodeConfig::parse_cmd_line();
    setup_tracing(config.log_format);

    if config.genesis.is_none() {
        // Blocks and application state are not persisted, so a generated
        // chain starts over on every run and its old logs would not replay.
        let data = config.home.join("data");
        if data.exists() {
            info!(path = %data.display(), "Clearing data of the previous local chain");
            std::fs::remove_dir_all(&data).context("Clearing data directory")?;
        }
    }
    std::fs::create_dir_all(config.home.join("data")).context("Creating data directory")?;

    let signer = LocalSigner::load_or_generate(&config.key_file())
        .context("Loading validator key")?
        .with_state_file(config.sign_state_file())
        .context("Loading last sign state")?;
    let signer = Arc::new(signer);
    let genesis = load_genesis(&config, signer.as_ref())?;
    info!(chain_id = %genesis.chain_id, validators = genesis.validators.len(), "Starting node");

    let app = Arc::new(KvApp::default());
    let signer: Arc<dyn PrivValidator> = signer;
    let mut node = Node::new(&config, app, &genesis, Some(signer), PeerSet::new())?;
    let mut events = node.events().subscribe();
    node.start().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(ConsensusEvent::NewBlock { height, block_id, num_txs }) => {
                    info!(height, hash = %block_id.hash, num_txs, "Committed block");
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
        if !node.is_running() {
            tracing::error!("Consensus halted");
            break;
        }
    }

    node.stop().await
}

fn load_genesis(config: &NodeConfig, signer: &LocalSigner) -> anyhow::Result<Genesis> {
    match &config.genesis {
        Some(path) => {
            let file = std::fs::read(path)
                .with_context(|| format!("Reading genesis from {}", path.display()))?;
            serde_json::from_slice(&file).context("Parsing genesis")
        }
        None => Ok(Genesis {
            chain_id: config.chain_id.clone(),
            genesis_time: Timestamp::now(),
            initial_height: 1,
            validators: vec![GenesisValidator {
                pub_key: signer.pub_key(),
                power: 10,
                name: "local".into(),
            }],
            app_hash: Default::default(),
            block_params: Default::default(),
        }),
    }
}

fn setup_tracing(format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false);
    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}
