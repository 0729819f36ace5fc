use std::sync::Arc;
use std::time::Duration;

use replica_common::p2p::{ChannelId, Peer, PeerId};
use replica_common::test_utils::{validators, StaticSwitch};
use replica_consensus::{BlockStore, ConsensusReactor, ConsensusService, NopWal};
use tokio::sync::mpsc;

mod common;
use common::TestNode;

type Wire = mpsc::UnboundedSender<(PeerId, ChannelId, Vec<u8>)>;

/// Hands whatever is sent to it to the wire task of the node it stands for.
struct LoopbackPeer {
    id: PeerId,
    from: PeerId,
    wire: Wire,
}

impl Peer for LoopbackPeer {
    fn id(&self) -> &PeerId {
        &self.id
    }

    fn send(&self, channel: ChannelId, msg: Vec<u8>) -> bool {
        self.wire.send((self.from.clone(), channel, msg)).is_ok()
    }
}

#[tokio::test(start_paused = true)]
async fn services_connected_through_reactors_commit_blocks() {
    //common::setup_tracing_full();
    let (_, signers) = validators(4, 10);
    let genesis = common::genesis(&signers);
    let ids: Vec<_> = (0..4).map(|i| PeerId::new(format!("node-{i}"))).collect();
    let (wires, wire_rxs): (Vec<Wire>, Vec<_>) = (0..4).map(|_| mpsc::unbounded_channel()).unzip();

    let mut nodes = Vec::new();
    for (i, wire_rx) in wire_rxs.into_iter().enumerate() {
        let node = TestNode::new(ids[i].as_str(), &genesis, Some(signers[i].clone()), Box::new(NopWal));
        node.submit(b"k=v");
        let TestNode {
            state, app, store, ..
        } = node;

        let peers: Vec<Arc<dyn Peer>> = (0..4)
            .filter(|j| *j != i)
            .map(|j| {
                Arc::new(LoopbackPeer {
                    id: ids[j].clone(),
                    from: ids[i].clone(),
                    wire: wires[j].clone(),
                }) as Arc<dyn Peer>
            })
            .collect();

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let handle = ConsensusService::spawn(state, outbound).unwrap();
        let reactor = Arc::new(ConsensusReactor::new(StaticSwitch::new(peers), handle.inputs()));
        reactor.start(outbound_rx);

        let wire_task = tokio::spawn({
            let reactor = reactor.clone();
            let mut wire_rx = wire_rx;
            async move {
                while let Some((from, channel, bytes)) = wire_rx.recv().await {
                    reactor.receive(&from, channel, &bytes).await.unwrap();
                }
            }
        });
        nodes.push((handle, reactor, wire_task, app, store));
    }
    for (i, (_, reactor, ..)) in nodes.iter().enumerate() {
        for (j, id) in ids.iter().enumerate() {
            if i != j {
                reactor.add_peer(id.clone()).await;
            }
        }
    }

    let summaries: Vec<_> = nodes.iter().map(|(handle, ..)| handle.summary()).collect();
    let mut reached = false;
    for _ in 0..10_000 {
        if summaries.iter().all(|s| s.borrow().hrs.height >= 3) {
            reached = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(reached);

    let mut stores = Vec::new();
    for (handle, reactor, wire_task, app, store) in nodes {
        reactor.stop().await;
        handle.stop().await.unwrap();
        wire_task.abort();
        assert_eq!(app.get(b"k").as_deref(), Some(&b"v"[..]));
        stores.push(store);
    }
    for height in 1..=2 {
        let hash = stores[0].load_block(height).unwrap().hash();
        for store in &stores[1..] {
            assert_eq!(store.load_block(height).unwrap().hash(), hash);
        }
    }
}
