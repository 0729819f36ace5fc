use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use replica_consensus::TimeoutValues;

#[derive(Parser)]
#[command(name = "replica")]
#[command(about = "A BFT replicated state machine validator with an in-process key/value application.")]
struct Cli {
    #[arg(
        long,
        value_name = "DIR",
        value_hint = clap::ValueHint::DirPath,
        long_help = "Directory where the node keeps its key, sign state and write-ahead logs",
        env = "REPLICA_HOME",
        default_value_os_t = (&std::path::Component::CurDir).into()
    )]
    home: PathBuf,

    #[arg(
        long,
        value_name = "FILE",
        value_hint = clap::ValueHint::FilePath,
        long_help = "Genesis document (JSON). Without one the node runs a single-validator chain \
                     with its own key as the only validator.",
        env = "REPLICA_GENESIS"
    )]
    genesis: Option<PathBuf>,

    #[arg(
        long = "chain-id",
        long_help = "Chain id of the generated single-validator genesis",
        default_value = "replica-local",
        env = "REPLICA_CHAIN_ID"
    )]
    chain_id: String,

    #[arg(
        long = "log.format",
        long_help = "Log output format",
        value_enum,
        default_value = "compact",
        env = "REPLICA_LOG_FORMAT"
    )]
    log_format: LogFormat,

    #[clap(flatten)]
    consensus: ConsensusCli,

    #[clap(flatten)]
    mempool: MempoolCli,
}

#[derive(clap::Args)]
struct ConsensusCli {
    #[arg(
        long = "consensus.timeout-propose",
        value_name = "MILLIS",
        long_help = "How long round 0 waits for a proposal",
        default_value = "3000",
        env = "REPLICA_CONSENSUS_TIMEOUT_PROPOSE"
    )]
    timeout_propose: u64,

    #[arg(
        long = "consensus.timeout-commit",
        value_name = "MILLIS",
        long_help = "Pause between committing a block and starting the next height",
        default_value = "1000",
        env = "REPLICA_CONSENSUS_TIMEOUT_COMMIT"
    )]
    timeout_commit: u64,

    #[arg(
        long = "consensus.skip-timeout-commit",
        long_help = "Start the next height as soon as all precommits are in",
        action = clap::ArgAction::Set,
        default_value = "false",
        env = "REPLICA_CONSENSUS_SKIP_TIMEOUT_COMMIT"
    )]
    skip_timeout_commit: bool,

    #[arg(
        long = "consensus.create-empty-blocks",
        long_help = "Propose blocks while the mempool is empty",
        action = clap::ArgAction::Set,
        default_value = "true",
        env = "REPLICA_CONSENSUS_CREATE_EMPTY_BLOCKS"
    )]
    create_empty_blocks: bool,

    #[arg(
        long = "consensus.create-empty-blocks-interval",
        value_name = "SECONDS",
        long_help = "With empty blocks disabled, propose one anyway after this long. 0 waits for transactions indefinitely.",
        default_value = "0",
        env = "REPLICA_CONSENSUS_CREATE_EMPTY_BLOCKS_INTERVAL"
    )]
    create_empty_blocks_interval: u64,
}

#[derive(clap::Args)]
struct MempoolCli {
    #[arg(
        long = "mempool.size",
        long_help = "Maximum number of pending transactions",
        default_value = "5000",
        env = "REPLICA_MEMPOOL_SIZE"
    )]
    size: usize,

    #[arg(
        long = "mempool.cache-size",
        long_help = "Capacity of the seen-transaction cache, 0 disables it",
        default_value = "10000",
        env = "REPLICA_MEMPOOL_CACHE_SIZE"
    )]
    cache_size: usize,

    #[arg(
        long = "mempool.max-tx-bytes",
        long_help = "Largest accepted transaction",
        default_value = "1048576",
        env = "REPLICA_MEMPOOL_MAX_TX_BYTES"
    )]
    max_tx_bytes: usize,

    #[arg(
        long = "mempool.recheck",
        long_help = "Re-validate pending transactions after every block",
        action = clap::ArgAction::Set,
        default_value = "true",
        env = "REPLICA_MEMPOOL_RECHECK"
    )]
    recheck: bool,

    #[arg(
        long = "mempool.wal",
        long_help = "Log every transaction accepted for checking under <home>/data/mempool.wal",
        action = clap::ArgAction::Set,
        default_value = "false",
        env = "REPLICA_MEMPOOL_WAL"
    )]
    wal: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Everything a [Node](crate::Node) and the `replica` binary are configured
/// with.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub home: PathBuf,
    pub genesis: Option<PathBuf>,
    pub chain_id: String,
    pub log_format: LogFormat,
    pub consensus: replica_consensus::Config,
    pub mempool: replica_mempool::Config,
}

impl NodeConfig {
    pub fn parse_cmd_line() -> Self {
        Self::from_cli(Cli::parse())
    }

    /// Parses `args`, the first being the binary name.
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Cli::try_parse_from(args).map(Self::from_cli)
    }

    /// Defaults rooted at `home`, for embedding a node without a command
    /// line.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            consensus: replica_consensus::Config::default()
                .with_wal_path(consensus_wal_path(&home)),
            mempool: replica_mempool::Config::default(),
            home,
            genesis: None,
            chain_id: "replica-local".into(),
            log_format: LogFormat::Compact,
        }
    }

    pub fn key_file(&self) -> PathBuf {
        self.home.join("config").join("priv_validator_key.json")
    }

    pub fn sign_state_file(&self) -> PathBuf {
        self.home.join("data").join("priv_validator_state.json")
    }

    fn from_cli(cli: Cli) -> Self {
        let consensus = replica_consensus::Config::default()
            .with_wal_path(consensus_wal_path(&cli.home))
            .with_timeout_values(TimeoutValues {
                propose: Duration::from_millis(cli.consensus.timeout_propose),
                commit: Duration::from_millis(cli.consensus.timeout_commit),
                ..Default::default()
            })
            .with_skip_timeout_commit(cli.consensus.skip_timeout_commit)
            .with_create_empty_blocks(
                cli.consensus.create_empty_blocks,
                Duration::from_secs(cli.consensus.create_empty_blocks_interval),
            );

        let mut mempool = replica_mempool::Config::default()
            .with_size(cli.mempool.size)
            .with_cache_size(cli.mempool.cache_size)
            .with_max_tx_bytes(cli.mempool.max_tx_bytes)
            .with_recheck(cli.mempool.recheck);
        if cli.mempool.wal {
            mempool = mempool.with_wal_dir(cli.home.join("data").join("mempool.wal"));
        }

        Self {
            home: cli.home,
            genesis: cli.genesis,
            chain_id: cli.chain_id,
            log_format: cli.log_format,
            consensus,
            mempool,
        }
    }
}

fn consensus_wal_path(home: &std::path::Path) -> PathBuf {
    home.join("data").join("cs.wal").join("wal")
}
