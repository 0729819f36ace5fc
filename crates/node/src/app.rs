//! The application the `replica` binary replicates: an in-memory map fed
//! with `key=value` transactions.
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use replica_common::app::{AppInfo, Application, CheckTxKind, TxResponse};
use replica_common::Hash;

pub const CODE_MALFORMED: u32 = 1;

#[derive(Default)]
struct State {
    store: BTreeMap<Vec<u8>, Vec<u8>>,
    height: u64,
    app_hash: Hash,
}

#[derive(Default)]
pub struct KvApp {
    state: Mutex<State>,
}

impl KvApp {
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state().store.get(key).cloned()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn split(tx: &[u8]) -> Option<(&[u8], &[u8])> {
    let eq = tx.iter().position(|b| *b == b'=')?;
    let (key, value) = (&tx[..eq], &tx[eq + 1..]);
    (!key.is_empty()).then_some((key, value))
}

impl Application for KvApp {
    fn info(&self) -> AppInfo {
        let state = self.state();
        AppInfo {
            last_block_height: state.height,
            last_block_app_hash: state.app_hash,
        }
    }

    fn check_tx(&self, tx: &[u8], _kind: CheckTxKind) -> TxResponse {
        match split(tx) {
            Some(_) => TxResponse::ok(1),
            None => TxResponse::error(CODE_MALFORMED, "expected key=value"),
        }
    }

    fn deliver_tx(&self, tx: &[u8]) -> TxResponse {
        let Some((key, value)) = split(tx) else {
            return TxResponse::error(CODE_MALFORMED, "expected key=value");
        };
        self.state().store.insert(key.to_vec(), value.to_vec());
        TxResponse {
            gas_used: 1,
            ..TxResponse::ok(1)
        }
    }

    fn commit(&self) -> Hash {
        let mut state = self.state();
        let entries: Vec<&[u8]> = state
            .store
            .iter()
            .flat_map(|(k, v)| [k.as_slice(), &b"="[..], v.as_slice(), &b";"[..]])
            .collect();
        let app_hash = Hash::digest_parts(&entries);
        state.height += 1;
        state.app_hash = app_hash;
        app_hash
    }
}
