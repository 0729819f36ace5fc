use replica_consensus::{BlockStore, Step};

mod common;
use common::Network;

#[test]
fn four_validators_commit_the_same_blocks() {
    //common::setup_tracing_full();

    let mut net = Network::new(4);
    net.submit(b"alice=1");
    net.submit(b"bob=2");
    net.start();

    assert!(net.run_until(200, |net| net.nodes.iter().all(|n| n.height() > 3)));

    let reference = &net.nodes[0];
    for height in 1..=3 {
        let block = reference.store.load_block(height).unwrap();
        for node in &net.nodes[1..] {
            assert_eq!(node.store.load_block(height).unwrap().hash(), block.hash());
        }
    }
    let first = reference.store.load_block(1).unwrap();
    assert_eq!(first.txs.len(), 2);

    for node in &net.nodes {
        assert_eq!(node.app.get(b"alice").as_deref(), Some(&b"1"[..]));
        assert_eq!(node.app.get(b"bob").as_deref(), Some(&b"2"[..]));
        // Committed transactions leave every pool.
        assert!(node.mempool.is_empty());

        let rs = node.state.round_state();
        assert_eq!(rs.step, Step::NewHeight);
        assert_eq!(rs.locked_round, None);
        assert_eq!(rs.valid_round, None);
        assert!(rs.last_commit.as_ref().unwrap().has_two_thirds_majority());
    }
}

#[test]
fn three_of_four_validators_keep_committing() {
    let mut net = Network::new(4);
    net.offline[3] = true;
    net.submit(b"k=v");
    net.start();

    // Rounds proposed by the offline validator time out and move on.
    assert!(net.run_until(2_000, |net| net.online().all(|n| n.height() > 5)));

    let hashes: Vec<_> = (1..=5)
        .map(|h| net.nodes[0].store.load_block(h).unwrap().hash())
        .collect();
    for node in net.online() {
        for (h, hash) in (1..=5).zip(&hashes) {
            assert_eq!(&node.store.load_block(h).unwrap().hash(), hash);
        }
        assert_eq!(node.app.get(b"k").as_deref(), Some(&b"v"[..]));
    }
    assert_eq!(net.nodes[3].store.height(), 0);
}

#[test]
fn two_of_four_validators_cannot_commit() {
    let mut net = Network::new(4);
    net.offline[2] = true;
    net.offline[3] = true;
    net.start();

    assert!(!net.run_until(300, |net| net.online().any(|n| n.height() > 1)));
    // Prevotes from half the power neither decide nor start a wait.
    for node in net.online() {
        assert_eq!(node.store.height(), 0);
        assert_eq!(node.state.round_state().step, Step::Prevote);
        assert!(node.state.pending_timeout().is_none());
    }
}

#[test]
fn lagging_validator_catches_up_from_peers() {
    let mut net = Network::new(4);
    net.offline[3] = true;
    net.start();
    assert!(net.run_until(2_000, |net| net.online().all(|n| n.height() > 2)));

    net.offline[3] = false;
    // Node 3 announces its position and is sent the blocks it missed.
    let status = net.nodes[3].state.round_step_message();
    let lagging = net.nodes[3].id.clone();
    net.nodes[0].state.peer_catchup(lagging, status);

    assert!(net.run_until(2_000, |net| net.nodes[3].height() > 2));
    assert_eq!(
        net.nodes[3].store.load_block(1).unwrap().hash(),
        net.nodes[0].store.load_block(1).unwrap().hash()
    );
}
