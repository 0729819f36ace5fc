//! Test doubles shared by the replica crates.
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::app::{AppInfo, Application, CheckTxKind, TxResponse};
use crate::p2p::{ChannelId, Peer, PeerId, Switch};
use crate::{Hash, LocalSigner, PrivValidator, Validator, ValidatorSet};

pub const CODE_EMPTY_TX: u32 = 1;
pub const CODE_INVALIDATED: u32 = 2;
pub const CODE_DELIVER_FAILED: u32 = 3;

#[derive(Default)]
struct KvState {
    store: BTreeMap<Vec<u8>, Vec<u8>>,
    height: u64,
    app_hash: Hash,
    delivered: Vec<Vec<u8>>,
    invalid: HashSet<Vec<u8>>,
    checks: Vec<(Vec<u8>, CheckTxKind)>,
}

/// A `key=value` store. Empty txs are rejected, txs starting with `fail` are
/// accepted into the mempool but fail on delivery.
#[derive(Default)]
pub struct KvStoreApp {
    state: Mutex<KvState>,
}

impl KvStoreApp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every later `check_tx` of `tx` fail.
    pub fn invalidate(&self, tx: &[u8]) {
        self.state.lock().unwrap().invalid.insert(tx.to_vec());
    }

    pub fn delivered(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().delivered.clone()
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.lock().unwrap().store.get(key).cloned()
    }

    pub fn height(&self) -> u64 {
        self.state.lock().unwrap().height
    }

    pub fn checks(&self) -> Vec<(Vec<u8>, CheckTxKind)> {
        self.state.lock().unwrap().checks.clone()
    }
}

impl Application for KvStoreApp {
    fn info(&self) -> AppInfo {
        let state = self.state.lock().unwrap();
        AppInfo {
            last_block_height: state.height,
            last_block_app_hash: state.app_hash,
        }
    }

    fn check_tx(&self, tx: &[u8], kind: CheckTxKind) -> TxResponse {
        let mut state = self.state.lock().unwrap();
        state.checks.push((tx.to_vec(), kind));
        if tx.is_empty() {
            return TxResponse::error(CODE_EMPTY_TX, "empty tx");
        }
        if state.invalid.contains(tx) {
            return TxResponse::error(CODE_INVALIDATED, "tx no longer valid");
        }
        TxResponse::ok(1)
    }

    fn deliver_tx(&self, tx: &[u8]) -> TxResponse {
        let mut state = self.state.lock().unwrap();
        state.delivered.push(tx.to_vec());
        if tx.starts_with(b"fail") {
            return TxResponse::error(CODE_DELIVER_FAILED, "delivery failed");
        }
        let (key, value) = match tx.iter().position(|b| *b == b'=') {
            Some(i) => (tx[..i].to_vec(), tx[i + 1..].to_vec()),
            None => (tx.to_vec(), tx.to_vec()),
        };
        state.store.insert(key, value);
        TxResponse {
            gas_used: 1,
            ..TxResponse::ok(1)
        }
    }

    fn commit(&self) -> Hash {
        let mut state = self.state.lock().unwrap();
        let mut bytes = Vec::new();
        for (k, v) in &state.store {
            bytes.extend_from_slice(k);
            bytes.push(b'=');
            bytes.extend_from_slice(v);
            bytes.push(b';');
        }
        state.height += 1;
        state.app_hash = Hash::digest(bytes);
        state.app_hash
    }
}

/// `n` validators of equal `power` and their signers, both in validator set
/// order.
pub fn validators(n: usize, power: i64) -> (ValidatorSet, Vec<Arc<LocalSigner>>) {
    let mut signers: Vec<Arc<LocalSigner>> = (0..n)
        .map(|i| Arc::new(LocalSigner::from_seed([i as u8 + 1; 32])))
        .collect();
    let set = ValidatorSet::new(
        signers
            .iter()
            .map(|s| Validator::new(s.pub_key(), power))
            .collect(),
    )
    .unwrap();
    signers.sort_by_key(|s| s.address());
    (set, signers)
}

/// A peer that records everything sent to it.
pub struct RecordingPeer {
    id: PeerId,
    sent: Mutex<Vec<(ChannelId, Vec<u8>)>>,
    accepting: AtomicBool,
}

impl RecordingPeer {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: PeerId::new(id),
            sent: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
        })
    }

    pub fn sent(&self) -> Vec<(ChannelId, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn take_sent(&self) -> Vec<(ChannelId, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// Simulates a disconnect: later sends fail.
    pub fn disconnect(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }
}

impl Peer for RecordingPeer {
    fn id(&self) -> &PeerId {
        &self.id
    }

    fn send(&self, channel: ChannelId, msg: Vec<u8>) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().unwrap().push((channel, msg));
        true
    }

    fn is_running(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct StaticSwitch {
    peers: Mutex<Vec<Arc<dyn Peer>>>,
}

impl StaticSwitch {
    pub fn new(peers: Vec<Arc<dyn Peer>>) -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(peers),
        })
    }

    pub fn add(&self, peer: Arc<dyn Peer>) {
        self.peers.lock().unwrap().push(peer);
    }
}

impl Switch for StaticSwitch {
    fn peers(&self) -> Vec<Arc<dyn Peer>> {
        self.peers.lock().unwrap().clone()
    }
}
