use std::path::PathBuf;
use std::time::Duration;

/// The configuration for the mempool and its gossip reactor.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of pending transactions.
    pub size: usize,
    /// Maximum total size of all pending transactions, in bytes.
    pub max_pending_txs_bytes: u64,
    /// Maximum size of a single transaction, in bytes.
    pub max_tx_bytes: usize,
    /// Capacity of the seen-transaction cache. Zero disables the cache.
    pub cache_size: usize,
    /// Re-validate remaining transactions after every committed block.
    pub recheck: bool,
    /// Gossip pending transactions to peers.
    pub broadcast: bool,
    /// Directory of the optional transaction log.
    pub wal_dir: Option<PathBuf>,
    /// Reject transactions declaring more gas than this. Negative means
    /// unbounded.
    pub max_gas: i64,
    /// How long a gossip task backs off before retrying a send the peer
    /// could not take.
    pub peer_catchup_sleep: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            size: 5000,
            max_pending_txs_bytes: 1024 * 1024 * 1024,
            max_tx_bytes: 1024 * 1024,
            cache_size: 10_000,
            recheck: true,
            broadcast: true,
            wal_dir: None,
            max_gas: -1,
            peer_catchup_sleep: Duration::from_millis(100),
        }
    }
}

impl Config {
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_max_pending_txs_bytes(mut self, bytes: u64) -> Self {
        self.max_pending_txs_bytes = bytes;
        self
    }

    pub fn with_max_tx_bytes(mut self, bytes: usize) -> Self {
        self.max_tx_bytes = bytes;
        self
    }

    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_recheck(mut self, recheck: bool) -> Self {
        self.recheck = recheck;
        self
    }

    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub fn with_wal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.wal_dir = Some(dir.into());
        self
    }

    pub fn with_max_gas(mut self, max_gas: i64) -> Self {
        self.max_gas = max_gas;
        self
    }

    pub fn with_peer_catchup_sleep(mut self, sleep: Duration) -> Self {
        self.peer_catchup_sleep = sleep;
        self
    }
}
