use std::sync::Arc;
use std::time::Duration;

use replica_common::app::AppConn;
use replica_common::p2p::{Peer, PeerHeights, PeerId, MEMPOOL_CHANNEL};
use replica_common::test_utils::{KvStoreApp, RecordingPeer};
use replica_common::Tx;
use replica_mempool::{Config, Mempool, MempoolMessage, MempoolReactor, TxInfo};

mod common;

fn sent_txs(peer: &RecordingPeer) -> Vec<Tx> {
    peer.sent()
        .into_iter()
        .map(|(channel, bytes)| {
            assert_eq!(channel, MEMPOOL_CHANNEL);
            let MempoolMessage::Tx(tx) = MempoolMessage::decode(&bytes).unwrap();
            tx
        })
        .collect()
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn txs_are_not_sent_back_to_their_sender() {
    let (_app, mempool) = common::mempool(Config::default());
    let reactor = MempoolReactor::new(mempool.clone());
    let a = RecordingPeer::new("a");
    let b = RecordingPeer::new("b");
    reactor.add_peer(a.clone()).unwrap();
    reactor.add_peer(b.clone()).unwrap();

    let from_a = Tx::from(&b"from=a"[..]);
    reactor
        .receive(a.id(), &MempoolMessage::Tx(from_a.clone()).encode())
        .await
        .unwrap();
    assert!(mempool.contains(&from_a));

    let local = Tx::from(&b"local=1"[..]);
    mempool.check_tx(local.clone(), TxInfo::local()).unwrap();

    common::wait_until(|| b.sent().len() == 2 && !a.sent().is_empty()).await;
    // Give a stray bounce the chance to show up.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(sent_txs(&b), [from_a, local.clone()]);
    assert_eq!(sent_txs(&a), [local]);

    tokio::time::timeout(Duration::from_secs(5), reactor.stop())
        .await
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn a_new_peer_receives_the_whole_pool() {
    let (_app, mempool) = common::mempool(Config::default());
    let txs = common::txs(10, 8);
    for tx in &txs {
        mempool.check_tx(tx.clone(), TxInfo::local()).unwrap();
    }

    let reactor = MempoolReactor::new(mempool);
    let peer = RecordingPeer::new("late");
    reactor.add_peer(peer.clone()).unwrap();

    common::wait_until(|| peer.sent().len() == txs.len()).await;
    assert_eq!(sent_txs(&peer), txs);
    reactor.stop().await;
}

#[test_log::test(tokio::test)]
async fn gossip_stops_when_the_peer_is_removed() {
    let (_app, mempool) = common::mempool(Config::default());
    let reactor = MempoolReactor::new(mempool.clone());
    let peer = RecordingPeer::new("a");
    reactor.add_peer(peer.clone()).unwrap();

    mempool.check_tx(&b"k=1"[..], TxInfo::local()).unwrap();
    common::wait_until(|| peer.sent().len() == 1).await;

    reactor.remove_peer(peer.id());
    tokio::time::sleep(Duration::from_millis(20)).await;
    mempool.check_tx(&b"k=2"[..], TxInfo::local()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(peer.sent().len(), 1);

    tokio::time::timeout(Duration::from_secs(5), reactor.stop())
        .await
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn gossip_stops_when_the_peer_disconnects() {
    let (_app, mempool) = common::mempool(Config::default());
    let reactor = MempoolReactor::new(mempool.clone());
    let peer = RecordingPeer::new("a");
    reactor.add_peer(peer.clone()).unwrap();

    peer.disconnect();
    mempool.check_tx(&b"k=1"[..], TxInfo::local()).unwrap();

    // The task exits on its own and lets go of the peer.
    common::wait_until(|| !reactor.is_gossiping(peer.id())).await;
    tokio::time::timeout(Duration::from_secs(5), reactor.stop())
        .await
        .unwrap();
    assert!(peer.sent().is_empty());
}

#[test_log::test(tokio::test)]
async fn peers_behind_the_pool_get_txs_once_caught_up() {
    // Every tx in this pool was admitted after block 5.
    let config = Config::default().with_peer_catchup_sleep(Duration::from_millis(10));
    let mempool = Arc::new(Mempool::new(
        config,
        AppConn::new("mempool", KvStoreApp::new()),
        5,
    ));
    mempool.check_tx(&b"k=v"[..], TxInfo::local()).unwrap();

    let heights = PeerHeights::new();
    let reactor = MempoolReactor::new(mempool).with_peer_heights(heights.clone());
    let lagging = RecordingPeer::new("lagging");
    let unknown = RecordingPeer::new("unknown");
    heights.set(lagging.id(), 3);
    reactor.add_peer(lagging.clone()).unwrap();
    reactor.add_peer(unknown.clone()).unwrap();

    common::wait_until(|| unknown.sent().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(lagging.sent().is_empty());
    assert!(reactor.is_gossiping(lagging.id()));

    heights.set(lagging.id(), 4);
    common::wait_until(|| lagging.sent().len() == 1).await;
    assert_eq!(sent_txs(&lagging), [Tx::from(&b"k=v"[..])]);

    tokio::time::timeout(Duration::from_secs(5), reactor.stop())
        .await
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn no_gossip_without_broadcast() {
    let (_app, mempool) = common::mempool(Config::default().with_broadcast(false));
    let reactor = MempoolReactor::new(mempool.clone());
    let peer = RecordingPeer::new("a");
    reactor.add_peer(peer.clone()).unwrap();

    reactor
        .receive(&PeerId::new("b"), &MempoolMessage::Tx(Tx::from(&b"k=1"[..])).encode())
        .await
        .unwrap();
    assert_eq!(mempool.size(), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(peer.sent().is_empty());
    reactor.stop().await;
}

#[test_log::test(tokio::test)]
async fn malformed_messages_are_rejected() {
    let (_app, mempool) = common::mempool(Config::default());
    let reactor = MempoolReactor::new(mempool.clone());
    let peer = RecordingPeer::new("a");
    reactor.receive(peer.id(), &[0x01, 0, 0]).await.unwrap_err();
    assert!(mempool.is_empty());
}
