//! The application boundary.
//!
//! The state machine behind the chain is reached only through
//! [Application]. Callers never share a connection: mempool checks and block
//! execution each get their own [AppConn] so a slow `check_tx` cannot stall
//! block execution and vice versa.
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::macros::hex_bytes;
use crate::{DuplicateVoteEvidence, Hash, Header};

/// Result code of a successful call.
pub const CODE_OK: u32 = 0;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckTxKind {
    /// First admission into the mempool.
    New,
    /// Re-validation of a pending tx after a block was committed.
    Recheck,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResponse {
    pub code: u32,
    pub log: String,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    pub gas_wanted: i64,
    pub gas_used: i64,
}

impl TxResponse {
    pub fn ok(gas_wanted: i64) -> Self {
        Self {
            gas_wanted,
            ..Default::default()
        }
    }

    pub fn error(code: u32, log: impl Into<String>) -> Self {
        Self {
            code,
            log: log.into(),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }

    pub fn is_err(&self) -> bool {
        !self.is_ok()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppInfo {
    pub last_block_height: u64,
    pub last_block_app_hash: Hash,
}

/// The replicated state machine.
///
/// Implementations are shared between connections and must be internally
/// synchronised. Failures of individual transactions, including running out
/// of gas, are reported through [TxResponse] codes.
pub trait Application: Send + Sync {
    fn info(&self) -> AppInfo {
        AppInfo::default()
    }

    fn check_tx(&self, tx: &[u8], kind: CheckTxKind) -> TxResponse;

    fn begin_block(&self, _header: &Header, _byzantine: &[DuplicateVoteEvidence]) {}

    fn deliver_tx(&self, tx: &[u8]) -> TxResponse;

    fn end_block(&self, _height: u64) {}

    /// Persists the state and returns the resulting app hash.
    fn commit(&self) -> Hash;
}

/// One serialised connection to the application.
#[derive(Clone)]
pub struct AppConn {
    name: &'static str,
    app: Arc<dyn Application>,
    lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for AppConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConn").field("name", &self.name).finish()
    }
}

impl AppConn {
    pub fn new(name: &'static str, app: Arc<dyn Application>) -> Self {
        Self {
            name,
            app,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn serialised<T>(&self, f: impl FnOnce(&dyn Application) -> T) -> T {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        f(self.app.as_ref())
    }

    pub fn info(&self) -> AppInfo {
        self.serialised(|app| app.info())
    }

    pub fn check_tx(&self, tx: &[u8], kind: CheckTxKind) -> TxResponse {
        self.serialised(|app| app.check_tx(tx, kind))
    }

    pub fn begin_block(&self, header: &Header, byzantine: &[DuplicateVoteEvidence]) {
        self.serialised(|app| app.begin_block(header, byzantine))
    }

    pub fn deliver_tx(&self, tx: &[u8]) -> TxResponse {
        self.serialised(|app| app.deliver_tx(tx))
    }

    pub fn end_block(&self, height: u64) {
        self.serialised(|app| app.end_block(height))
    }

    pub fn commit(&self) -> Hash {
        self.serialised(|app| app.commit())
    }
}

/// The per-purpose connections to a single application.
#[derive(Clone, Debug)]
pub struct AppConns {
    pub mempool: AppConn,
    pub consensus: AppConn,
    pub query: AppConn,
}

impl AppConns {
    pub fn new(app: Arc<dyn Application>) -> Self {
        Self {
            mempool: AppConn::new("mempool", app.clone()),
            consensus: AppConn::new("consensus", app.clone()),
            query: AppConn::new("query", app),
        }
    }
}
