//! The three-phase chain synchronization protocol.
//!
//! Phase A advertises our tip height, phase B collects peer heights for a
//! short window and elects the tallest reporter, phase C pulls the missing
//! block range from that single peer and splices it in. The RPC dispatcher
//! forwards `listLastBlocks` / `updateInventory` into the run through an
//! mpsc channel; every wait is bounded.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};

use crate::fullnode::{NodeInner, SyncEvent, SyncState};
use crate::p2p::messages::RpcMessage;

/// How long phase B keeps collecting after the first height arrives.
const COLLECT_WINDOW: Duration = Duration::from_secs(3);
/// Hard bound on one whole attempt.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_SYNC_ATTEMPTS: u32 = 2;

pub(crate) async fn run_sync(
    inner: Arc<NodeInner>,
    hard: bool,
    autostart_mining: bool,
) -> SyncState {
    let mut outcome;
    if inner.peers.peer_count() == 0 {
        debug!("[{}] sync skipped: no peers connected", inner.id);
        outcome = SyncState::AlreadySynced;
        *inner.sync_state.lock() = outcome;
    } else {
        outcome = SyncState::NotEnoughHeights;
        for attempt in 1..=MAX_SYNC_ATTEMPTS {
            outcome = sync_attempt(&inner, hard).await;
            *inner.sync_state.lock() = outcome;
            inner.sync_session.lock().take();
            if outcome.is_synced() {
                break;
            }
            warn!(
                "[{}] sync attempt {}/{} ended in {:?}",
                inner.id, attempt, MAX_SYNC_ATTEMPTS, outcome
            );
        }
    }
    if outcome.is_synced() && autostart_mining {
        inner.start_mining();
    }
    outcome
}

async fn sync_attempt(inner: &Arc<NodeInner>, hard: bool) -> SyncState {
    let deadline = Instant::now() + ATTEMPT_TIMEOUT;
    *inner.sync_state.lock() = SyncState::Waiting;
    let (events, mut receiver) = mpsc::unbounded_channel();
    *inner.sync_session.lock() = Some(events);

    let own_height = inner.chain.lock().height();
    let peer_count = inner.peers.peer_count();
    info!(
        "[{}] syncing at height {} across {} peers (hard={})",
        inner.id, own_height, peer_count, hard
    );
    inner.peers.broadcast(&RpcMessage::GetLastBlock {
        latest_block_height: own_height,
    });

    // Phase B: the first response arms the collection window.
    let mut responses: Vec<(SocketAddr, u64)> = Vec::new();
    loop {
        match timeout_at(deadline, receiver.recv()).await {
            Ok(Some(SyncEvent::Heights { from, height })) => {
                responses.push((from, height));
                break;
            }
            Ok(Some(SyncEvent::Inventory { .. })) => continue,
            Ok(None) | Err(_) => {
                warn!("[{}] no peer reported a tip height", inner.id);
                return SyncState::NotEnoughHeights;
            }
        }
    }
    let window_end = (Instant::now() + COLLECT_WINDOW).min(deadline);
    loop {
        match timeout_at(window_end, receiver.recv()).await {
            Ok(Some(SyncEvent::Heights { from, height })) => {
                if !responses.iter().any(|(peer, _)| *peer == from) {
                    responses.push((from, height));
                }
            }
            Ok(Some(SyncEvent::Inventory { .. })) => {}
            Ok(None) => return SyncState::NotEnoughHeights,
            Err(_) => break,
        }
    }
    if responses.len() < peer_count / 2 {
        warn!(
            "[{}] only {}/{} peers reported their heights",
            inner.id,
            responses.len(),
            peer_count
        );
        return SyncState::NotEnoughHeights;
    }

    // Tallest reporter wins; the first one seen wins ties.
    let (mut best_peer, mut best_height) = responses[0];
    for (peer, height) in responses.iter().skip(1) {
        if *height > best_height {
            best_peer = *peer;
            best_height = *height;
        }
    }
    if best_height <= own_height {
        info!(
            "[{}] already on the longest chain (height {})",
            inner.id, own_height
        );
        return SyncState::AlreadySynced;
    }

    // Phase C: pull the missing range from the elected peer only.
    let backup = inner.chain.lock().blocks().to_vec();
    let from_height = if hard {
        inner.chain.lock().reset();
        0
    } else {
        own_height
    };
    let expected = best_height - from_height;
    info!(
        "[{}] pulling {} blocks ({}, {}] from {}",
        inner.id, expected, from_height, best_height, best_peer
    );
    inner.peers.send_to(
        best_peer,
        RpcMessage::GetInventory {
            from_height,
            to_height: best_height,
        },
    );

    loop {
        match timeout_at(deadline, receiver.recv()).await {
            Ok(Some(SyncEvent::Inventory { from, blocks })) => {
                if from != best_peer {
                    warn!(
                        "[{}] inventory from {} but {} was elected",
                        inner.id, from, best_peer
                    );
                    inner.chain.lock().replace(backup);
                    return SyncState::InvalidPeer;
                }
                if blocks.len() as u64 != expected {
                    warn!(
                        "[{}] inventory size mismatch: got {}, expected {}",
                        inner.id,
                        blocks.len(),
                        expected
                    );
                    inner.chain.lock().replace(backup);
                    return SyncState::InvalidState;
                }
                {
                    // Splice without per-block validation: historical blocks
                    // may have been mined under a different difficulty.
                    let mut chain = inner.chain.lock();
                    for block in blocks {
                        if block.height == 0 {
                            continue;
                        }
                        chain.add_block(block);
                    }
                }
                inner.refresh_wallet_balance();
                info!("[{}] synced to height {}", inner.id, best_height);
                return SyncState::FullySynced;
            }
            // Straggling phase-B replies are harmless here.
            Ok(Some(SyncEvent::Heights { .. })) => continue,
            Ok(None) | Err(_) => {
                warn!(
                    "[{}] inventory from {} never arrived",
                    inner.id, best_peer
                );
                inner.chain.lock().replace(backup);
                return SyncState::InvalidState;
            }
        }
    }
}
