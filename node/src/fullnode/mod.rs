use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use ferrocoin_core::block::Block;
use ferrocoin_core::blockchain::Blockchain;
use ferrocoin_core::config::{MAX_FUTURE_BLOCK_TIME, compute_reward};
use ferrocoin_core::consensus::{
    ConsensusAlgorithm, ConsensusError, ConsensusKind, MineOutcome, ProofOfStake, ProofOfWork,
};
use ferrocoin_core::transaction::{Transaction, TransactionStore};
use ferrocoin_core::wallet::Wallet;

use crate::p2p::manager::{PeerEvent, PeerManager};
use crate::p2p::messages::{RpcMessage, resolve_peer_address};

pub mod sync;

/// Where a node stands relative to its peers' chains. `Waiting` covers an
/// in-flight sync; the rest are terminal for one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Waiting,
    FullySynced,
    AlreadySynced,
    InvalidState,
    InvalidPeer,
    NotEnoughHeights,
}

impl SyncState {
    /// State-reading operations are only allowed in these two states.
    pub fn is_synced(self) -> bool {
        matches!(self, SyncState::FullySynced | SyncState::AlreadySynced)
    }
}

/// One-line view of a node for orchestrators and log output.
#[derive(Debug, Clone)]
pub struct ChainSummary {
    pub id: String,
    pub height: u64,
    pub tip_hash: String,
    pub balance: i64,
    pub mempool_len: usize,
    pub peer_count: usize,
    pub sync_state: SyncState,
    pub mining: bool,
}

/// Transaction seed file layout: `{"transactions": [tx, …]}`.
#[derive(Debug, serde::Deserialize)]
struct TransactionSeed {
    transactions: Vec<Transaction>,
}

/// Events the RPC dispatcher feeds into an in-flight sync run.
#[derive(Debug)]
pub(crate) enum SyncEvent {
    Heights { from: SocketAddr, height: u64 },
    Inventory { from: SocketAddr, blocks: Vec<Block> },
}

/// A full node: ledger, wallet, consensus, transport, mempool and the sync
/// state machine behind one handle.
pub struct FullNode {
    inner: Arc<NodeInner>,
}

pub(crate) struct NodeInner {
    pub(crate) id: String,
    pub(crate) kind: ConsensusKind,
    pub(crate) wallet: Arc<Mutex<Wallet>>,
    pub(crate) chain: Mutex<Blockchain>,
    pub(crate) mempool: Mutex<Vec<Transaction>>,
    pub(crate) consensus: Arc<dyn ConsensusAlgorithm>,
    pub(crate) peers: Arc<PeerManager>,
    pub(crate) sync_state: Mutex<SyncState>,
    pub(crate) sync_session: Mutex<Option<UnboundedSender<SyncEvent>>>,
    mining_active: AtomicBool,
    miner: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl FullNode {
    /// Start a node listening on `host:port` (port 0 picks a free one).
    pub async fn new(
        kind: ConsensusKind,
        difficulty: f64,
        wallet: Wallet,
        host: &str,
        port: u16,
    ) -> Result<FullNode> {
        Self::with_beneficiaries(kind, difficulty, wallet, host, port, &[]).await
    }

    /// Start a node whose genesis block funds each beneficiary with one coin
    /// (stake simulations need somebody to hold stake at the start).
    pub async fn with_beneficiaries(
        kind: ConsensusKind,
        difficulty: f64,
        wallet: Wallet,
        host: &str,
        port: u16,
        beneficiaries: &[String],
    ) -> Result<FullNode> {
        let id = wallet.short_id().to_string();
        let wallet = Arc::new(Mutex::new(wallet));
        let consensus: Arc<dyn ConsensusAlgorithm> = match kind {
            ConsensusKind::Puzzle => Arc::new(ProofOfWork::new(difficulty)),
            ConsensusKind::Stake => Arc::new(ProofOfStake::new(difficulty, wallet.clone())),
        };
        let chain = Blockchain::with_beneficiaries(kind.flag(), beneficiaries);
        let (peers, events) = PeerManager::bind(host, port).await?;

        let inner = Arc::new(NodeInner {
            id: id.clone(),
            kind,
            wallet,
            chain: Mutex::new(chain),
            mempool: Mutex::new(Vec::new()),
            consensus,
            peers,
            sync_state: Mutex::new(SyncState::FullySynced),
            sync_session: Mutex::new(None),
            mining_active: AtomicBool::new(false),
            miner: Mutex::new(None),
            dispatcher: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        });
        inner.refresh_wallet_balance();

        let dispatcher = tokio::spawn(dispatch(inner.clone(), events));
        *inner.dispatcher.lock() = Some(dispatcher);

        info!("[{}] node listening on {}", id, inner.peers.local_addr());
        Ok(FullNode { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn address(&self) -> String {
        self.inner.wallet.lock().address().to_string()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.peers.local_addr()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.peer_count()
    }

    pub fn height(&self) -> u64 {
        self.inner.chain.lock().height()
    }

    pub fn tip_block(&self) -> Block {
        self.inner.chain.lock().last_block().clone()
    }

    pub fn sync_state(&self) -> SyncState {
        *self.inner.sync_state.lock()
    }

    pub fn is_mining(&self) -> bool {
        self.inner.mining_active.load(Ordering::SeqCst)
    }

    pub fn wallet_balance(&self) -> i64 {
        self.inner.wallet.lock().balance
    }

    pub fn balance_of(&self, address: &str) -> i64 {
        self.inner.chain.lock().balance(address)
    }

    pub fn difficulty(&self) -> f64 {
        self.inner.consensus.difficulty()
    }

    /// Takes effect for the next `mine` call and the next verification.
    pub fn set_difficulty(&self, difficulty: f64) {
        self.inner.consensus.set_difficulty(difficulty);
    }

    pub fn mempool_len(&self) -> usize {
        self.inner.mempool.lock().len()
    }

    pub fn summary(&self) -> ChainSummary {
        let (height, tip_hash) = {
            let chain = self.inner.chain.lock();
            let tip = chain.last_block();
            (tip.height, tip.hash().unwrap_or_default())
        };
        ChainSummary {
            id: self.inner.id.clone(),
            height,
            tip_hash,
            balance: self.wallet_balance(),
            mempool_len: self.mempool_len(),
            peer_count: self.peer_count(),
            sync_state: self.sync_state(),
            mining: self.is_mining(),
        }
    }

    /// Seed the mempool from a JSON file of transactions. Returns how many
    /// were loaded; a missing or malformed file loads none.
    pub fn load_transaction_pool(&self, path: impl AsRef<Path>) -> usize {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    "[{}] could not read transaction pool '{}': {}",
                    self.inner.id,
                    path.display(),
                    e
                );
                return 0;
            }
        };
        let seed: TransactionSeed = match serde_json::from_str(&raw) {
            Ok(seed) => seed,
            Err(e) => {
                warn!(
                    "[{}] could not parse transaction pool '{}': {}",
                    self.inner.id,
                    path.display(),
                    e
                );
                return 0;
            }
        };
        let count = seed.transactions.len();
        self.inner.mempool.lock().extend(seed.transactions);
        info!(
            "[{}] seeded {} transactions from '{}'",
            self.inner.id,
            count,
            path.display()
        );
        count
    }

    /// Dial a peer; the remote records us and connects back.
    pub async fn connect_to(&self, peer: SocketAddr) -> Result<bool> {
        let connected = self.inner.peers.connect(peer).await?;
        if connected {
            info!("[{}] connected to {}", self.inner.id, peer);
        }
        Ok(connected)
    }

    pub fn add_transaction(&self, transaction: Transaction) {
        self.inner.mempool.lock().push(transaction);
    }

    /// Remove the first matching transaction; a miss is only logged.
    pub fn remove_transaction(&self, transaction: &Transaction) {
        let mut mempool = self.inner.mempool.lock();
        match mempool.iter().position(|entry| entry == transaction) {
            Some(index) => {
                mempool.remove(index);
            }
            None => warn!("[{}] transaction not found in mempool", self.inner.id),
        }
    }

    /// False when the node is not synced, per the not-synced sentinel rule.
    pub fn validate_transaction(&self, transaction: &Transaction) -> bool {
        if !self.inner.is_synced() {
            return false;
        }
        validate_transaction_against(&self.inner.chain.lock(), transaction)
    }

    /// False when the node is not synced, per the not-synced sentinel rule.
    pub fn validate_block(&self, block: &Block) -> bool {
        if !self.inner.is_synced() {
            return false;
        }
        validate_block_against(&self.inner.chain.lock(), &self.inner.consensus, block)
    }

    /// Candidate for the next block: mempool snapshot on top of the tip.
    pub fn block_template(&self) -> Result<Block> {
        Ok(self.inner.build_candidate()?)
    }

    /// Validate and adopt a block produced outside the mining loop; on
    /// success it is broadcast exactly like a mined one.
    pub fn submit_block(&self, block: Block) -> bool {
        if !self.inner.is_synced() {
            return false;
        }
        let json = match block.canonical_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("[{}] unserializable block submitted: {}", self.inner.id, e);
                return false;
            }
        };
        if !self.inner.accept_block(block, "local submit") {
            return false;
        }
        self.inner.peers.broadcast(&RpcMessage::NewBlock(json));
        true
    }

    /// Spawn the miner unless the node is unsynced, already mining, or a
    /// stake node with nothing staked.
    pub fn start_mining(&self) {
        self.inner.start_mining();
    }

    /// Preempt the current search and wait for the miner to wind down.
    pub async fn stop_mining(&self) {
        self.inner.stop_mining().await;
    }

    /// Run the three-phase sync protocol against the connected peers.
    pub async fn sync(&self, hard: bool, autostart_mining: bool) -> SyncState {
        sync::run_sync(self.inner.clone(), hard, autostart_mining).await
    }

    /// Persist the connected peer set for the next run.
    pub fn save_known_peers(&self, path: impl AsRef<Path>) -> bool {
        self.inner.peers.save_known_peers(path)
    }

    pub fn save_snapshot(&self, path: impl AsRef<Path>, overwrite: bool) -> bool {
        self.inner.chain.lock().save_to_json(path, overwrite)
    }

    pub fn load_snapshot(&self, path: impl AsRef<Path>, overwrite: bool) -> bool {
        let loaded = self.inner.chain.lock().load_from_json(path, overwrite);
        if loaded {
            self.inner.refresh_wallet_balance();
        }
        loaded
    }

    /// Say goodbye to the mesh, stop mining, stop listening.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[{}] shutting down", inner.id);
        inner.peers.broadcast(&RpcMessage::End {
            server_address: inner.peers.identity(),
        });
        inner.stop_mining().await;
        inner.peers.shutdown();
        if let Some(task) = inner.dispatcher.lock().take() {
            task.abort();
        }
    }
}

impl NodeInner {
    pub(crate) fn is_synced(&self) -> bool {
        self.sync_state.lock().is_synced()
    }

    /// Recompute the cached wallet balance from the ledger.
    pub(crate) fn refresh_wallet_balance(&self) {
        let address = self.wallet.lock().address().to_string();
        let balance = self.chain.lock().balance(&address);
        self.wallet.lock().balance = balance;
    }

    fn build_candidate(&self) -> serde_json::Result<Block> {
        let (height, previous_hash) = {
            let chain = self.chain.lock();
            let tip = chain.last_block();
            (tip.height + 1, tip.hash()?)
        };
        let transactions = self.mempool.lock().clone();
        Ok(Block {
            consensus_algorithm: self.kind.flag(),
            height,
            miner: self.wallet.lock().address().to_string(),
            nonce: 0,
            previous_hash,
            reward: compute_reward(),
            timestamp: now_seconds(),
            transaction_store: TransactionStore::from_transactions(transactions),
        })
    }

    /// Validate against the current tip and append atomically; also preempts
    /// a competing local search, since the candidate it is hashing just went
    /// stale.
    fn accept_block(&self, block: Block, origin: &str) -> bool {
        let height = block.height;
        let miner = block.miner.clone();
        {
            let mut chain = self.chain.lock();
            if !validate_block_against(&chain, &self.consensus, &block) {
                warn!("[{}] rejected block #{} via {}", self.id, height, origin);
                return false;
            }
            self.consensus.stop();
            chain.add_block(block);
        }
        self.refresh_wallet_balance();
        info!(
            "[{}] accepted block #{} mined by {} via {}",
            self.id,
            height,
            &miner[..miner.len().min(6)],
            origin
        );
        true
    }

    pub(crate) fn start_mining(self: &Arc<Self>) {
        if !self.is_synced() {
            warn!("[{}] not starting miner: node is not synced", self.id);
            return;
        }
        if self.kind == ConsensusKind::Stake && self.wallet.lock().balance <= 0 {
            warn!("[{}] not starting miner: wallet holds no stake", self.id);
            return;
        }
        if self.mining_active.swap(true, Ordering::SeqCst) {
            debug!("[{}] miner already running", self.id);
            return;
        }
        let inner = self.clone();
        let task = tokio::spawn(miner_loop(inner));
        *self.miner.lock() = Some(task);
    }

    pub(crate) async fn stop_mining(&self) {
        self.mining_active.store(false, Ordering::SeqCst);
        self.consensus.stop();
        let task = self.miner.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

/// Repeatedly snapshot the mempool, search, and publish. One instance at a
/// time; preemption comes from `stop_mining`, shutdown, or a gossiped block
/// winning the same height.
async fn miner_loop(inner: Arc<NodeInner>) {
    info!("[{}] miner started", inner.id);
    while inner.mining_active.load(Ordering::SeqCst) && !inner.shutting_down.load(Ordering::SeqCst)
    {
        let candidate = match inner.build_candidate() {
            Ok(candidate) => candidate,
            Err(e) => {
                error!("[{}] could not build a candidate block: {}", inner.id, e);
                break;
            }
        };
        let consensus = inner.consensus.clone();
        let mined = tokio::task::spawn_blocking(move || {
            let mut block = candidate;
            let outcome = consensus.mine(&mut block);
            (outcome, block)
        })
        .await;
        let (outcome, block) = match mined {
            Ok(pair) => pair,
            Err(e) => {
                error!("[{}] miner task failed: {}", inner.id, e);
                break;
            }
        };
        match outcome {
            Ok(MineOutcome::Found) => commit_mined_block(&inner, block),
            Ok(MineOutcome::Preempted) => {
                debug!("[{}] search preempted at height {}", inner.id, block.height);
            }
            Err(ConsensusError::InsufficientStake) => {
                warn!("[{}] wallet out of stake, miner stopping", inner.id);
                inner.mining_active.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                error!("[{}] mining failed: {}", inner.id, e);
                inner.mining_active.store(false, Ordering::SeqCst);
            }
        }
    }
    info!("[{}] miner stopped", inner.id);
}

fn commit_mined_block(inner: &Arc<NodeInner>, block: Block) {
    let json = match block.canonical_json() {
        Ok(json) => json,
        Err(e) => {
            error!("[{}] could not serialize mined block: {}", inner.id, e);
            return;
        }
    };
    {
        let mut chain = inner.chain.lock();
        let tip_hash = match chain.last_block().hash() {
            Ok(hash) => hash,
            Err(e) => {
                error!("[{}] could not hash the tip: {}", inner.id, e);
                return;
            }
        };
        if block.previous_hash != tip_hash {
            // A gossiped block won this height while we were hashing.
            debug!("[{}] discarding stale mined block #{}", inner.id, block.height);
            return;
        }
        chain.add_block(block.clone());
    }
    // Cleared even though the network may still reject the broadcast; the
    // transactions on that branch are lost.
    inner.mempool.lock().clear();
    inner.refresh_wallet_balance();
    info!(
        "[{}] mined block #{} ({} txs)",
        inner.id,
        block.height,
        block.transaction_store.len()
    );
    inner.peers.broadcast(&RpcMessage::NewBlock(json));
}

/// A transaction is valid against a ledger when both sides are non-empty,
/// no (address, amount) sender tuple repeats, and every sender's replayed
/// balance covers what it spends.
fn validate_transaction_against(chain: &Blockchain, transaction: &Transaction) -> bool {
    if transaction.senders.is_empty() || transaction.receivers.is_empty() {
        return false;
    }
    let mut seen = HashSet::new();
    for (address, amount) in &transaction.senders {
        if !seen.insert((address.as_str(), *amount)) {
            return false;
        }
    }
    transaction
        .senders
        .iter()
        .all(|(address, amount)| chain.balance(address) >= *amount as i64)
}

/// Full acceptance check for a block extending the current tip.
fn validate_block_against(
    chain: &Blockchain,
    consensus: &Arc<dyn ConsensusAlgorithm>,
    block: &Block,
) -> bool {
    let tip = chain.last_block();
    if !chain.is_empty() && block.height <= tip.height {
        return false;
    }
    match tip.hash() {
        Ok(tip_hash) if block.previous_hash == tip_hash => {}
        _ => return false,
    }
    if block.timestamp > now_seconds() + MAX_FUTURE_BLOCK_TIME {
        return false;
    }
    if block.reward != compute_reward() {
        return false;
    }
    let miner_balance = chain.balance(&block.miner);
    match consensus.verify(block, miner_balance) {
        Ok(true) => {}
        _ => return false,
    }
    block
        .transaction_store
        .transactions
        .iter()
        .all(|transaction| validate_transaction_against(chain, transaction))
}

/// Serialize every inbound RPC through one task: the verb dispatch that
/// replaces per-connection handler state. Errors stay inside their arm.
async fn dispatch(inner: Arc<NodeInner>, mut events: UnboundedReceiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        if inner.shutting_down.load(Ordering::SeqCst) {
            break;
        }
        match event {
            PeerEvent::Message { from, message } => {
                handle_message(&inner, from, message).await;
            }
            PeerEvent::Disconnected { from } => {
                debug!("[{}] inbound connection {} closed", inner.id, from);
            }
        }
    }
}

async fn handle_message(inner: &Arc<NodeInner>, from: SocketAddr, message: RpcMessage) {
    match message {
        RpcMessage::Connect {
            server_address,
            peers,
        } => {
            let identity = match resolve_peer_address(&server_address) {
                Ok(identity) => identity,
                Err(e) => {
                    warn!("[{}] connect with unusable identity: {}", inner.id, e);
                    return;
                }
            };
            inner.peers.register_identity(from, identity);
            debug!(
                "[{}] {} identifies as {} ({} peers advertised)",
                inner.id,
                from,
                identity,
                peers.len()
            );
            match inner.peers.connect(identity).await {
                Ok(true) => info!("[{}] connected back to {}", inner.id, identity),
                Ok(false) => debug!("[{}] already connected to {}", inner.id, identity),
                Err(e) => warn!("[{}] could not connect back to {}: {}", inner.id, identity, e),
            }
        }
        RpcMessage::End { server_address } => {
            if let Ok(identity) = resolve_peer_address(&server_address) {
                if inner.peers.disconnect(identity) {
                    info!("[{}] peer {} left the network", inner.id, identity);
                }
            }
        }
        RpcMessage::NewBlock(raw) => {
            if !inner.is_synced() {
                return;
            }
            match Block::from_json(&raw) {
                Ok(block) => {
                    inner.accept_block(block, "gossip");
                }
                Err(e) => warn!("[{}] malformed newBlock payload: {}", inner.id, e),
            }
        }
        RpcMessage::GetLastBlock {
            latest_block_height,
        } => {
            if !inner.is_synced() {
                return;
            }
            let height = inner.chain.lock().height();
            if height < latest_block_height {
                return;
            }
            match inner.peers.identity_of(from) {
                Some(identity) => {
                    inner.peers.send_to(
                        identity,
                        RpcMessage::ListLastBlocks {
                            last_block_height: height,
                        },
                    );
                }
                None => warn!(
                    "[{}] cannot answer getLastBlock: {} has no known identity",
                    inner.id, from
                ),
            }
        }
        RpcMessage::ListLastBlocks { last_block_height } => {
            let Some(identity) = inner.peers.identity_of(from) else {
                warn!(
                    "[{}] dropping listLastBlocks from unidentified {}",
                    inner.id, from
                );
                return;
            };
            let session = inner.sync_session.lock();
            match session.as_ref() {
                Some(events) => {
                    let _ = events.send(SyncEvent::Heights {
                        from: identity,
                        height: last_block_height,
                    });
                }
                None => debug!("[{}] unsolicited listLastBlocks from {}", inner.id, identity),
            }
        }
        RpcMessage::GetInventory {
            from_height,
            to_height,
        } => {
            if !inner.is_synced() {
                return;
            }
            let blocks = inner.chain.lock().block_range(from_height, to_height);
            let mut payload = Vec::with_capacity(blocks.len());
            for block in &blocks {
                match block.canonical_json() {
                    Ok(json) => payload.push(json),
                    Err(e) => {
                        error!("[{}] could not serialize inventory: {}", inner.id, e);
                        return;
                    }
                }
            }
            match inner.peers.identity_of(from) {
                Some(identity) => {
                    info!(
                        "[{}] serving {} blocks ({}, {}] to {}",
                        inner.id,
                        payload.len(),
                        from_height,
                        to_height,
                        identity
                    );
                    inner
                        .peers
                        .send_to(identity, RpcMessage::UpdateInventory(payload));
                }
                None => warn!(
                    "[{}] cannot serve inventory: {} has no known identity",
                    inner.id, from
                ),
            }
        }
        RpcMessage::UpdateInventory(raw_blocks) => {
            let Some(identity) = inner.peers.identity_of(from) else {
                warn!(
                    "[{}] dropping updateInventory from unidentified {}",
                    inner.id, from
                );
                return;
            };
            let mut blocks = Vec::with_capacity(raw_blocks.len());
            for raw in &raw_blocks {
                match Block::from_json(raw) {
                    Ok(block) => blocks.push(block),
                    Err(e) => {
                        warn!("[{}] malformed inventory block: {}", inner.id, e);
                        return;
                    }
                }
            }
            let session = inner.sync_session.lock();
            match session.as_ref() {
                Some(events) => {
                    let _ = events.send(SyncEvent::Inventory {
                        from: identity,
                        blocks,
                    });
                }
                None => debug!(
                    "[{}] unsolicited updateInventory from {}",
                    inner.id, identity
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn puzzle_node(difficulty: f64) -> FullNode {
        FullNode::new(
            ConsensusKind::Puzzle,
            difficulty,
            Wallet::from_seed("node-under-test"),
            "127.0.0.1",
            0,
        )
        .await
        .unwrap()
    }

    fn mined(node: &FullNode, mutate: impl FnOnce(&mut Block)) -> Block {
        let mut block = node.block_template().unwrap();
        mutate(&mut block);
        // Difficulty 0 in these tests: any nonce satisfies the rule.
        block
    }

    #[tokio::test]
    async fn accepts_a_well_formed_next_block() {
        let node = puzzle_node(0.0).await;
        let block = mined(&node, |_| {});
        assert!(node.validate_block(&block));
        assert!(node.submit_block(block));
        assert_eq!(node.height(), 1);
    }

    #[tokio::test]
    async fn rejects_stale_or_unlinked_heights() {
        let node = puzzle_node(0.0).await;
        assert!(node.submit_block(mined(&node, |_| {})));

        // Height at or below the tip.
        let stale = mined(&node, |block| block.height = 1);
        assert!(!node.validate_block(&stale));

        // Wrong parent hash.
        let unlinked = mined(&node, |block| {
            block.previous_hash = "f".repeat(64);
        });
        assert!(!node.validate_block(&unlinked));
    }

    #[tokio::test]
    async fn rejects_far_future_timestamps() {
        let node = puzzle_node(0.0).await;
        let block = mined(&node, |block| {
            block.timestamp = now_seconds() + 24.0 * 3600.0;
        });
        assert!(!node.validate_block(&block));

        let ok = mined(&node, |_| {});
        assert!(node.validate_block(&ok));
    }

    #[tokio::test]
    async fn rejects_wrong_rewards() {
        let node = puzzle_node(0.0).await;
        let block = mined(&node, |block| block.reward = 0);
        assert!(!node.validate_block(&block));
        let greedy = mined(&node, |block| block.reward = 2);
        assert!(!node.validate_block(&greedy));
    }

    #[tokio::test]
    async fn rejects_unmined_blocks_under_real_difficulty() {
        let node = puzzle_node(1.0).await;
        let mut block = node.block_template().unwrap();
        // Walk nonces until the hash fails difficulty 1.
        while block.hash().unwrap().starts_with('0') {
            block.nonce += 1;
        }
        assert!(!node.validate_block(&block));
    }

    #[tokio::test]
    async fn transaction_validation_rules() {
        let node = puzzle_node(0.0).await;
        // Fund alice by mining in her name.
        let funded = mined(&node, |block| block.miner = "alice-address".to_string());
        assert!(node.submit_block(funded));
        assert_eq!(node.balance_of("alice-address"), 1);

        let ok = Transaction::new(
            vec![("alice-address".to_string(), 1)],
            vec![("bob-address".to_string(), 1)],
        )
        .unwrap();
        assert!(node.validate_transaction(&ok));

        let empty_senders = Transaction {
            receivers: vec![("bob-address".to_string(), 1)],
            senders: vec![],
        };
        assert!(!node.validate_transaction(&empty_senders));

        let empty_receivers = Transaction {
            receivers: vec![],
            senders: vec![("alice-address".to_string(), 1)],
        };
        assert!(!node.validate_transaction(&empty_receivers));

        let duplicated = Transaction {
            receivers: vec![("bob-address".to_string(), 1)],
            senders: vec![
                ("alice-address".to_string(), 1),
                ("alice-address".to_string(), 1),
            ],
        };
        assert!(!node.validate_transaction(&duplicated));

        let overdraft = Transaction::new(
            vec![("alice-address".to_string(), 5)],
            vec![("bob-address".to_string(), 5)],
        )
        .unwrap();
        assert!(!node.validate_transaction(&overdraft));
    }

    #[tokio::test]
    async fn blocks_with_invalid_transactions_are_rejected() {
        let node = puzzle_node(0.0).await;
        let block = mined(&node, |block| {
            block.transaction_store.add_transaction(Transaction {
                receivers: vec![],
                senders: vec![],
            });
        });
        assert!(!node.validate_block(&block));
    }

    #[tokio::test]
    async fn mempool_snapshot_rides_in_the_template() {
        let node = puzzle_node(0.0).await;
        let tx = Transaction::new(
            vec![("a".to_string(), 1)],
            vec![("b".to_string(), 1)],
        )
        .unwrap();
        node.add_transaction(tx.clone());
        node.add_transaction(tx.clone());
        assert_eq!(node.mempool_len(), 2);

        let template = node.block_template().unwrap();
        assert_eq!(template.transaction_store.len(), 2);

        node.remove_transaction(&tx);
        assert_eq!(node.mempool_len(), 1);
        // Removing a missing transaction only logs.
        let other = Transaction::new(
            vec![("c".to_string(), 1)],
            vec![("d".to_string(), 1)],
        )
        .unwrap();
        node.remove_transaction(&other);
        assert_eq!(node.mempool_len(), 1);
    }

    #[tokio::test]
    async fn summary_reflects_node_state() {
        let node = puzzle_node(0.0).await;
        assert!(node.submit_block(mined(&node, |_| {})));

        let summary = node.summary();
        assert_eq!(summary.height, 1);
        assert_eq!(summary.tip_hash, node.tip_block().hash().unwrap());
        assert_eq!(summary.peer_count, 0);
        assert_eq!(summary.sync_state, SyncState::FullySynced);
        assert!(!summary.mining);
    }

    #[tokio::test]
    async fn transaction_pool_seeds_from_json() {
        let node = puzzle_node(0.0).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.json");
        std::fs::write(
            &path,
            r#"{"transactions": [
                {"receivers": [["bob", 1]], "senders": [["alice", 1]]},
                {"receivers": [["carol", 2]], "senders": [["bob", 2]]}
            ]}"#,
        )
        .unwrap();

        assert_eq!(node.load_transaction_pool(&path), 2);
        assert_eq!(node.mempool_len(), 2);
        assert_eq!(node.load_transaction_pool(dir.path().join("missing.json")), 0);
    }

    #[tokio::test]
    async fn zero_stake_node_refuses_to_mine() {
        let node = FullNode::new(
            ConsensusKind::Stake,
            10.0,
            Wallet::from_seed("penniless"),
            "127.0.0.1",
            0,
        )
        .await
        .unwrap();
        assert_eq!(node.wallet_balance(), 0);
        node.start_mining();
        assert!(!node.is_mining());
        node.shutdown().await;
    }
}
