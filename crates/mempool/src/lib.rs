//! The pool of pending transactions and its peer gossip.
//!
//! Transactions enter through [Mempool::check_tx], are validated against the
//! application and kept in arrival order until a committed block removes
//! them in [Mempool::update]. The [MempoolReactor] streams the pool to peers
//! and feeds transactions received from them back into it.
mod cache;
mod config;
mod error;
mod ids;
mod mempool;
mod reactor;

pub use cache::{new_cache, LruTxCache, NopTxCache, TxCache};
pub use config::Config;
pub use error::MempoolError;
pub use ids::{MempoolIds, UNKNOWN_PEER_ID};
pub use mempool::{Mempool, MempoolTx, TxInfo};
pub use reactor::{MempoolMessage, MempoolReactor};
