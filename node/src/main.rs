use std::net::ToSocketAddrs;
use std::path::PathBuf;

use anyhow::Result;
use log::{info, warn};

use ferrocoin_config::Config;
use ferrocoin_core::consensus::ConsensusKind;
use ferrocoin_core::wallet::Wallet;
use ferrocoin_node::p2p::PeerManager;
use ferrocoin_node::FullNode;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = Config::load(config_path)?;
    let kind = if cfg.is_stake() {
        ConsensusKind::Stake
    } else {
        ConsensusKind::Puzzle
    };

    let wallet = Wallet::from_seed(&cfg.wallet_seed);
    info!("wallet address: {}", wallet.address());

    let node = FullNode::new(kind, cfg.difficulty, wallet, &cfg.host, cfg.port).await?;

    let data_dir = cfg.data_dir_resolved();
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        warn!("could not create data dir '{}': {}", data_dir.display(), e);
    }
    let snapshot = data_dir.join("chain.json");
    if snapshot.is_file() && node.load_snapshot(&snapshot, false) {
        info!("resumed chain at height {}", node.height());
    }
    let seed = data_dir.join("transactions.json");
    if seed.is_file() {
        node.load_transaction_pool(&seed);
    }

    // Configured peers first, then whatever the last run knew about.
    let peer_cache = data_dir.join("peers.json");
    let mut peers: Vec<std::net::SocketAddr> = Vec::new();
    for peer in &cfg.peers {
        match peer.to_socket_addrs().ok().and_then(|mut it| it.next()) {
            Some(addr) => peers.push(addr),
            None => warn!("skipping unresolvable peer '{peer}'"),
        }
    }
    for addr in PeerManager::load_known_peers(&peer_cache) {
        if !peers.contains(&addr) {
            peers.push(addr);
        }
    }
    for addr in peers {
        if let Err(e) = node.connect_to(addr).await {
            warn!("could not reach peer {addr}: {e}");
        }
    }

    let state = node.sync(false, true).await;
    info!("initial sync finished: {state:?}");
    info!("{:?}", node.summary());

    tokio::signal::ctrl_c().await?;
    node.save_known_peers(&peer_cache);
    node.shutdown().await;
    if node.save_snapshot(&snapshot, false) {
        info!("chain saved to {}", snapshot.display());
    }
    Ok(())
}
