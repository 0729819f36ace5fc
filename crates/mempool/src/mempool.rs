use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard};

use replica_common::app::{AppConn, CheckTxKind, TxResponse};
use replica_common::{Hash, Tx};
use replica_wal::{Group, GroupConfig};
use tokio::sync::{mpsc, watch};

use crate::cache::{new_cache, TxCache};
use crate::ids::UNKNOWN_PEER_ID;
use crate::{Config, MempoolError};

/// Where a transaction came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxInfo {
    pub sender_id: u16,
}

impl TxInfo {
    pub fn local() -> Self {
        Self {
            sender_id: UNKNOWN_PEER_ID,
        }
    }

    pub fn from_peer(sender_id: u16) -> Self {
        Self { sender_id }
    }
}

/// A pending transaction.
#[derive(Clone, Debug)]
pub struct MempoolTx {
    /// Position in arrival order. Never reused.
    pub seq: u64,
    pub tx: Tx,
    /// Height of the last block when the tx was admitted.
    pub height: u64,
    pub gas_wanted: i64,
    /// Mempool ids of the peers known to have this tx.
    pub senders: BTreeSet<u16>,
}

type PreCheckFn = Box<dyn Fn(&Tx) -> Result<(), String> + Send + Sync>;

/// Ordered pool of validated transactions waiting for inclusion in a block.
///
/// All state sits behind one lock which is never held while the application
/// is called. Transactions keep their arrival order: reaping, gossip and
/// rechecking all walk the pool by sequence number.
pub struct Mempool {
    config: Config,
    conn: AppConn,
    pre_check: Option<PreCheckFn>,
    state: Mutex<State>,
    /// Held exclusively while a block is committed so no tx is checked
    /// against half-applied application state.
    commit_lock: RwLock<()>,
    new_tx: watch::Sender<u64>,
}

struct State {
    txs: BTreeMap<u64, MempoolTx>,
    by_hash: HashMap<Hash, u64>,
    next_seq: u64,
    txs_bytes: u64,
    height: u64,
    cache: Box<dyn TxCache>,
    txs_available: Option<mpsc::Sender<()>>,
    notified_txs_available: bool,
    wal: Option<Group>,
}

impl State {
    fn check_full(&self, tx_size: usize, config: &Config) -> Result<(), MempoolError> {
        let num_txs = self.txs.len();
        if num_txs >= config.size
            || self.txs_bytes + tx_size as u64 > config.max_pending_txs_bytes
        {
            return Err(MempoolError::MempoolIsFull {
                num_txs,
                max_txs: config.size,
                txs_bytes: self.txs_bytes,
                max_txs_bytes: config.max_pending_txs_bytes,
            });
        }
        Ok(())
    }

    fn remove_seq(&mut self, seq: u64) -> Option<MempoolTx> {
        let removed = self.txs.remove(&seq)?;
        self.by_hash.remove(&removed.tx.hash());
        self.txs_bytes -= removed.tx.len() as u64;
        Some(removed)
    }

    fn remove_hash(&mut self, hash: &Hash) -> Option<MempoolTx> {
        let seq = *self.by_hash.get(hash)?;
        self.remove_seq(seq)
    }

    fn notify_txs_available(&mut self) {
        if self.txs.is_empty() || self.notified_txs_available {
            return;
        }
        if let Some(sender) = &self.txs_available {
            self.notified_txs_available = true;
            // A full channel already holds a pending notification.
            let _ = sender.try_send(());
        }
    }

    fn record_metrics(&self) {
        metrics::gauge!("mempool_size", self.txs.len() as f64);
        metrics::gauge!("mempool_tx_bytes", self.txs_bytes as f64);
    }
}

impl Mempool {
    /// A pool for transactions arriving after block `height`.
    pub fn new(config: Config, conn: AppConn, height: u64) -> Self {
        let cache = new_cache(config.cache_size);
        let (new_tx, _) = watch::channel(0);
        Self {
            config,
            conn,
            pre_check: None,
            state: Mutex::new(State {
                txs: BTreeMap::new(),
                by_hash: HashMap::new(),
                next_seq: 1,
                txs_bytes: 0,
                height,
                cache,
                txs_available: None,
                notified_txs_available: false,
                wal: None,
            }),
            commit_lock: RwLock::new(()),
            new_tx,
        }
    }

    /// Installs a check run on every new tx before the application sees it.
    pub fn with_pre_check(
        mut self,
        pre_check: impl Fn(&Tx) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.pre_check = Some(Box::new(pre_check));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens the transaction log under the configured `wal_dir`. Does nothing
    /// without one.
    pub fn init_wal(&self) -> Result<(), MempoolError> {
        let Some(dir) = &self.config.wal_dir else {
            return Ok(());
        };
        let group = std::fs::create_dir_all(dir)
            .and_then(|_| Group::open(dir.join("wal"), GroupConfig::default()))
            .map_err(|e| MempoolError::Wal(format!("opening {}: {e}", dir.display())))?;
        self.state().wal = Some(group);
        Ok(())
    }

    pub fn close_wal(&self) {
        let Some(mut wal) = self.state().wal.take() else {
            return;
        };
        if let Err(error) = wal.flush_and_sync() {
            tracing::error!(%error, "Failed to flush mempool wal");
        }
    }

    /// Blocks [Mempool::check_tx] until the guard is dropped. Held by block
    /// execution from applying a block until [Mempool::update] returns.
    pub fn commit_guard(&self) -> RwLockWriteGuard<'_, ()> {
        self.commit_lock
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a receiver that is notified at most once per height, the
    /// first time the pool holds transactions. Replaces any earlier receiver.
    pub fn enable_txs_available(&self) -> mpsc::Receiver<()> {
        let (sender, receiver) = mpsc::channel(1);
        let mut state = self.state();
        state.txs_available = Some(sender);
        state.notified_txs_available = false;
        state.notify_txs_available();
        receiver
    }

    /// Validates `tx` and appends it to the pool.
    ///
    /// The application is called without holding the pool lock. A tx seen
    /// before is rejected even if it was already reaped into a block.
    pub fn check_tx(&self, tx: impl Into<Tx>, info: TxInfo) -> Result<TxResponse, MempoolError> {
        let tx = tx.into();
        let _commit = self
            .commit_lock
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let size = tx.len();

        {
            let mut state = self.state();
            state.check_full(size, &self.config)?;
            if size > self.config.max_tx_bytes {
                return Err(MempoolError::TxTooLarge {
                    max: self.config.max_tx_bytes,
                    got: size,
                });
            }
            if let Some(pre_check) = &self.pre_check {
                pre_check(&tx).map_err(MempoolError::PreCheck)?;
            }
            if let Some(wal) = state.wal.as_mut() {
                let line = base64::encode(tx.as_bytes());
                wal.write_line(line.as_bytes())
                    .map_err(|e| MempoolError::Wal(e.to_string()))?;
            }
            if !state.cache.push(&tx) {
                // Remember the new sender so gossip skips it.
                if info.sender_id != UNKNOWN_PEER_ID {
                    if let Some(seq) = state.by_hash.get(&tx.hash()).copied() {
                        if let Some(pending) = state.txs.get_mut(&seq) {
                            pending.senders.insert(info.sender_id);
                        }
                    }
                }
                return Err(MempoolError::TxInCache);
            }
        }

        metrics::histogram!("mempool_tx_size_bytes", size as f64);
        let response = self.conn.check_tx(tx.as_bytes(), CheckTxKind::New);
        self.admit(tx, info, response)
    }

    fn admit(
        &self,
        tx: Tx,
        info: TxInfo,
        response: TxResponse,
    ) -> Result<TxResponse, MempoolError> {
        let mut state = self.state();
        let hash = tx.hash();

        let rejection = if response.is_err() {
            Some(MempoolError::AppRejected {
                code: response.code,
                log: response.log.clone(),
            })
        } else if self.config.max_gas >= 0 && response.gas_wanted > self.config.max_gas {
            Some(MempoolError::PostCheck {
                gas_wanted: response.gas_wanted,
                max_gas: self.config.max_gas,
            })
        } else {
            state.check_full(tx.len(), &self.config).err()
        };
        if let Some(error) = rejection {
            // Let the tx be resubmitted later.
            state.cache.remove(&tx);
            metrics::increment_counter!("mempool_failed_txs");
            tracing::debug!(tx = %hash, %error, "Rejected transaction");
            return Err(error);
        }

        if let Some(seq) = state.by_hash.get(&hash).copied() {
            // Re-admitted by a concurrent caller after a flush.
            if let Some(pending) = state.txs.get_mut(&seq) {
                if info.sender_id != UNKNOWN_PEER_ID {
                    pending.senders.insert(info.sender_id);
                }
            }
            return Ok(response);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let mut senders = BTreeSet::new();
        if info.sender_id != UNKNOWN_PEER_ID {
            senders.insert(info.sender_id);
        }
        state.txs_bytes += tx.len() as u64;
        state.by_hash.insert(hash, seq);
        let height = state.height;
        state.txs.insert(
            seq,
            MempoolTx {
                seq,
                tx,
                height,
                gas_wanted: response.gas_wanted,
                senders,
            },
        );
        tracing::debug!(tx = %hash, height, total = state.txs.len(), "Added transaction");
        state.record_metrics();
        state.notify_txs_available();
        drop(state);

        self.new_tx.send_replace(seq);
        Ok(response)
    }

    /// Longest prefix of the pool whose total size and total declared gas
    /// stay within `max_bytes` and `max_gas`. A negative bound is unbounded.
    pub fn reap_max_bytes_max_gas(&self, max_bytes: i64, max_gas: i64) -> Vec<Tx> {
        let state = self.state();
        let mut total_bytes = 0i64;
        let mut total_gas = 0i64;
        let mut txs = Vec::new();
        for pending in state.txs.values() {
            let bytes = total_bytes + pending.tx.len() as i64;
            if max_bytes >= 0 && bytes > max_bytes {
                break;
            }
            let gas = total_gas + pending.gas_wanted;
            if max_gas >= 0 && gas > max_gas {
                break;
            }
            total_bytes = bytes;
            total_gas = gas;
            txs.push(pending.tx.clone());
        }
        txs
    }

    /// The first `max` transactions, or all of them if `max` is negative.
    pub fn reap_max_txs(&self, max: i64) -> Vec<Tx> {
        let state = self.state();
        let take = usize::try_from(max).unwrap_or(usize::MAX);
        state
            .txs
            .values()
            .take(take)
            .map(|pending| pending.tx.clone())
            .collect()
    }

    /// Removes the transactions committed in block `height` and, if
    /// configured, rechecks the rest against the updated application state.
    ///
    /// `results` are the delivery results of `txs`, by position. A tx whose
    /// delivery failed is dropped from the cache so it may be submitted
    /// again.
    pub fn update(&self, height: u64, txs: &[Tx], results: &[TxResponse]) {
        let to_recheck: Vec<(u64, Tx)> = {
            let mut state = self.state();
            state.height = height;
            state.notified_txs_available = false;

            for (i, tx) in txs.iter().enumerate() {
                if results.get(i).map_or(true, TxResponse::is_ok) {
                    state.cache.push(tx);
                } else {
                    state.cache.remove(tx);
                }
                state.remove_hash(&tx.hash());
            }
            state.record_metrics();

            if state.txs.is_empty() {
                return;
            }
            if !self.config.recheck {
                state.notify_txs_available();
                return;
            }
            state
                .txs
                .values()
                .map(|pending| (pending.seq, pending.tx.clone()))
                .collect()
        };
        self.recheck(height, to_recheck);
    }

    fn recheck(&self, height: u64, txs: Vec<(u64, Tx)>) {
        tracing::debug!(height, count = txs.len(), "Rechecking transactions");
        metrics::counter!("mempool_recheck_times", txs.len() as u64);

        let results: Vec<_> = txs
            .into_iter()
            .map(|(seq, tx)| {
                let response = self.conn.check_tx(tx.as_bytes(), CheckTxKind::Recheck);
                (seq, tx, response)
            })
            .collect();

        let mut state = self.state();
        for (seq, tx, response) in results {
            let over_gas =
                self.config.max_gas >= 0 && response.gas_wanted > self.config.max_gas;
            if response.is_ok() && !over_gas {
                continue;
            }
            if state.remove_seq(seq).is_some() {
                tracing::debug!(tx = %tx.hash(), code = response.code, "Transaction no longer valid");
                metrics::increment_counter!("mempool_failed_txs");
            }
            state.cache.remove(&tx);
        }
        state.record_metrics();
        state.notify_txs_available();
    }

    /// Drops every pending transaction and forgets every seen one.
    pub fn flush(&self) {
        let mut state = self.state();
        state.cache.reset();
        state.txs.clear();
        state.by_hash.clear();
        state.txs_bytes = 0;
        state.record_metrics();
    }

    pub fn size(&self) -> usize {
        self.state().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn txs_bytes(&self) -> u64 {
        self.state().txs_bytes
    }

    pub fn height(&self) -> u64 {
        self.state().height
    }

    pub fn contains(&self, tx: &Tx) -> bool {
        self.state().by_hash.contains_key(&tx.hash())
    }

    /// The first pending transaction after sequence number `cursor`.
    pub fn next_after(&self, cursor: u64) -> Option<MempoolTx> {
        let state = self.state();
        state
            .txs
            .range(cursor + 1..)
            .next()
            .map(|(_, pending)| pending.clone())
    }

    /// Watches the sequence number of the most recently added transaction.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.new_tx.subscribe()
    }
}

impl std::fmt::Debug for Mempool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Mempool")
            .field("size", &state.txs.len())
            .field("txs_bytes", &state.txs_bytes)
            .field("height", &state.height)
            .finish()
    }
}
