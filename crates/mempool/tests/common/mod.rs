#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use replica_common::app::AppConn;
use replica_common::test_utils::KvStoreApp;
use replica_common::Tx;
use replica_mempool::{Config, Mempool};

pub fn mempool(config: Config) -> (Arc<KvStoreApp>, Arc<Mempool>) {
    let app = KvStoreApp::new();
    let conn = AppConn::new("mempool", app.clone());
    (app, Arc::new(Mempool::new(config, conn, 0)))
}

/// `count` distinct transactions of exactly `size` bytes.
pub fn txs(count: usize, size: usize) -> Vec<Tx> {
    (0..count)
        .map(|i| Tx::from(format!("{i:0size$}").into_bytes()))
        .collect()
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
