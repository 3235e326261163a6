//! Multi-node scenarios over real sockets on the loopback interface.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Encoder;

use ferrocoin_core::consensus::ConsensusKind;
use ferrocoin_core::wallet::Wallet;
use ferrocoin_node::{FrameCodec, FullNode, RpcMessage, SyncState};

async fn puzzle_node(seed: &str, difficulty: f64) -> FullNode {
    FullNode::new(
        ConsensusKind::Puzzle,
        difficulty,
        Wallet::from_seed(seed),
        "127.0.0.1",
        0,
    )
    .await
    .expect("node should start")
}

/// Grow a chain deterministically: at difficulty 0 every template is already
/// an acceptable block.
fn grow_chain(node: &FullNode, blocks: u64) {
    for _ in 0..blocks {
        let template = node.block_template().expect("template");
        assert!(node.submit_block(template), "template should be accepted");
    }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn mined_block_is_gossiped_and_accepted() {
    let miner = puzzle_node("gossip-miner", 1.0).await;
    let observer = puzzle_node("gossip-observer", 1.0).await;

    miner.connect_to(observer.local_addr()).await.unwrap();
    wait_until("peers to link up", || {
        miner.peer_count() == 1 && observer.peer_count() == 1
    })
    .await;

    miner.start_mining();
    wait_until("the observer to adopt a mined block", || {
        observer.height() >= 1
    })
    .await;
    miner.stop_mining().await;

    let adopted = observer.tip_block();
    assert!(adopted.hash().unwrap().starts_with('0'));
    assert!(!adopted.consensus_algorithm);

    miner.shutdown().await;
    observer.shutdown().await;
}

#[tokio::test]
async fn fork_resolution_pulls_the_longest_chain() {
    let node = puzzle_node("fork-a", 0.0).await;
    let sibling = puzzle_node("fork-b", 0.0).await;
    let leader = puzzle_node("fork-c", 0.0).await;

    grow_chain(&node, 5);
    grow_chain(&sibling, 5);
    grow_chain(&leader, 7);

    node.connect_to(sibling.local_addr()).await.unwrap();
    node.connect_to(leader.local_addr()).await.unwrap();
    wait_until("the mesh to form", || {
        node.peer_count() == 2 && sibling.peer_count() == 1 && leader.peer_count() == 1
    })
    .await;

    let outcome = node.sync(false, false).await;
    assert_eq!(outcome, SyncState::FullySynced);
    assert_eq!(node.sync_state(), SyncState::FullySynced);
    assert_eq!(node.height(), 7);

    node.shutdown().await;
    sibling.shutdown().await;
    leader.shutdown().await;
}

#[tokio::test]
async fn hard_sync_replaces_the_whole_chain() {
    let node = puzzle_node("hard-a", 0.0).await;
    let leader = puzzle_node("hard-c", 0.0).await;

    grow_chain(&node, 5);
    grow_chain(&leader, 7);

    node.connect_to(leader.local_addr()).await.unwrap();
    wait_until("the peers to link up", || {
        node.peer_count() == 1 && leader.peer_count() == 1
    })
    .await;

    let outcome = node.sync(true, false).await;
    assert_eq!(outcome, SyncState::FullySynced);
    assert_eq!(node.height(), 7);
    // After a hard sync the whole chain is the leader's.
    assert_eq!(
        node.tip_block().hash().unwrap(),
        leader.tip_block().hash().unwrap()
    );

    node.shutdown().await;
    leader.shutdown().await;
}

#[tokio::test]
async fn sync_with_no_peers_is_already_synced() {
    let loner = puzzle_node("loner", 0.0).await;
    assert_eq!(loner.sync(false, false).await, SyncState::AlreadySynced);
    loner.shutdown().await;
}

#[tokio::test]
async fn malformed_frames_do_not_kill_the_connection() {
    let node = puzzle_node("tolerant", 0.0).await;

    let mut socket = TcpStream::connect(node.local_addr()).await.unwrap();
    socket.write_all(b"{not json|").await.unwrap();

    // The same connection must still deliver valid blocks afterwards.
    for expected_height in 1..=2u64 {
        let template = node.block_template().unwrap();
        let mut frame = bytes::BytesMut::new();
        FrameCodec
            .encode(
                RpcMessage::NewBlock(template.canonical_json().unwrap()),
                &mut frame,
            )
            .unwrap();
        socket.write_all(&frame).await.unwrap();
        wait_until("the node to adopt the gossiped block", || {
            node.height() >= expected_height
        })
        .await;
    }

    node.shutdown().await;
}

#[tokio::test]
async fn stake_node_mines_with_funded_wallet() {
    let wallet = Wallet::from_seed("rich-staker");
    let address = wallet.address().to_string();
    let node = FullNode::with_beneficiaries(
        ConsensusKind::Stake,
        10.0,
        wallet,
        "127.0.0.1",
        0,
        &[address.clone()],
    )
    .await
    .unwrap();
    assert_eq!(node.wallet_balance(), 1);

    node.start_mining();
    wait_until("a stake block to land", || node.height() >= 1).await;
    node.stop_mining().await;

    let tip = node.tip_block();
    assert!(tip.consensus_algorithm);
    assert_eq!(tip.miner, address);
    // The beneficiary coin plus at least one mining reward.
    assert!(node.wallet_balance() >= 2);

    node.shutdown().await;
}

#[tokio::test]
async fn snapshot_round_trip_between_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chain.json");

    let source = puzzle_node("snapshot-source", 0.0).await;
    grow_chain(&source, 3);
    assert!(source.save_snapshot(&path, true));

    let restored = puzzle_node("snapshot-restored", 0.0).await;
    assert!(restored.load_snapshot(&path, false));
    assert_eq!(restored.height(), 3);
    assert_eq!(
        restored.tip_block().hash().unwrap(),
        source.tip_block().hash().unwrap()
    );
    // A second load is refused: the chains are now the same length.
    assert!(!restored.load_snapshot(&path, false));

    source.shutdown().await;
    restored.shutdown().await;
}

#[tokio::test]
async fn departing_peer_says_goodbye() {
    let staying = puzzle_node("staying", 0.0).await;
    let leaving = puzzle_node("leaving", 0.0).await;

    staying.connect_to(leaving.local_addr()).await.unwrap();
    wait_until("the peers to link up", || {
        staying.peer_count() == 1 && leaving.peer_count() == 1
    })
    .await;

    leaving.shutdown().await;
    wait_until("the end verb to drop the peer", || {
        staying.peer_count() == 0
    })
    .await;

    staying.shutdown().await;
}
