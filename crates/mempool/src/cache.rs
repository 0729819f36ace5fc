//! Seen-transaction caches, keyed by the transaction hash.
use cached::{Cached, SizedCache};
use replica_common::{Hash, Tx};

pub trait TxCache: Send {
    /// Records `tx`. Returns `false` if it was already present.
    fn push(&mut self, tx: &Tx) -> bool;

    fn remove(&mut self, tx: &Tx);

    fn reset(&mut self);
}

/// Cache of the most recently seen transactions, bounded to a fixed number
/// of entries with least-recently-used eviction.
pub struct LruTxCache {
    cache: SizedCache<Hash, ()>,
    size: usize,
}

impl LruTxCache {
    /// `size` must be non-zero, see [new_cache] for the general case.
    pub fn new(size: usize) -> Self {
        Self {
            cache: SizedCache::with_size(size),
            size,
        }
    }

    pub fn len(&self) -> usize {
        self.cache.cache_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TxCache for LruTxCache {
    fn push(&mut self, tx: &Tx) -> bool {
        let key = tx.hash();
        // A hit moves the entry to the front.
        if self.cache.cache_get(&key).is_some() {
            return false;
        }
        self.cache.cache_set(key, ());
        true
    }

    fn remove(&mut self, tx: &Tx) {
        self.cache.cache_remove(&tx.hash());
    }

    fn reset(&mut self) {
        self.cache = SizedCache::with_size(self.size);
    }
}

/// A cache that remembers nothing.
#[derive(Debug, Default)]
pub struct NopTxCache;

impl TxCache for NopTxCache {
    fn push(&mut self, _tx: &Tx) -> bool {
        true
    }

    fn remove(&mut self, _tx: &Tx) {}

    fn reset(&mut self) {}
}

pub fn new_cache(size: usize) -> Box<dyn TxCache> {
    match size {
        0 => Box::new(NopTxCache),
        size => Box::new(LruTxCache::new(size)),
    }
}
