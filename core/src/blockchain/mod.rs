use std::fs;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::config::{GENESIS_MINER, GENESIS_PREVIOUS_HASH, GENESIS_REWARD};
use crate::transaction::{Transaction, TransactionStore};

/// On-disk snapshot layout: `{savedTime, lastBlockHeight, blocks: [json, …]}`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    saved_time: f64,
    last_block_height: u64,
    blocks: Vec<String>,
}

/// The replicated ledger: an append-only block sequence indexed by height.
///
/// Appending is unconditional; validation is the caller's business. The whole
/// chain may be replaced on a hard sync or a snapshot load, which is the only
/// point where the tip height is allowed to go backwards.
#[derive(Debug, Clone)]
pub struct Blockchain {
    blocks: Vec<Block>,
}

impl Blockchain {
    /// Fresh ledger holding only a genesis block for the given consensus tag.
    pub fn new(stake: bool) -> Self {
        Self::with_beneficiaries(stake, &[])
    }

    /// Fresh ledger whose genesis funds each beneficiary with one coin sent
    /// from the "0" pseudo-address.
    pub fn with_beneficiaries(stake: bool, beneficiaries: &[String]) -> Self {
        let mut store = TransactionStore::new();
        for address in beneficiaries {
            // The "0" sender has no funds; its balance simply goes negative.
            store.add_transaction(Transaction {
                receivers: vec![(address.clone(), 1)],
                senders: vec![(GENESIS_MINER.to_string(), 1)],
            });
        }
        let genesis = Block {
            consensus_algorithm: stake,
            height: 0,
            miner: GENESIS_MINER.to_string(),
            nonce: 0,
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            reward: GENESIS_REWARD,
            timestamp: 0.0,
            transaction_store: store,
        };
        Blockchain {
            blocks: vec![genesis],
        }
    }

    pub fn last_block(&self) -> &Block {
        // The ledger is never empty: construction and reset both seed genesis.
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn height(&self) -> u64 {
        self.last_block().height
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Unconditional append.
    pub fn add_block(&mut self, block: Block) {
        self.blocks.push(block);
    }

    /// Drop everything above genesis (hard-sync support).
    pub fn reset(&mut self) {
        self.blocks.truncate(1);
    }

    /// Replace the whole chain, e.g. restoring a backup after a failed sync.
    pub fn replace(&mut self, blocks: Vec<Block>) {
        self.blocks = blocks;
    }

    /// Blocks with heights in `(from, to]`, the inventory range served to a
    /// syncing peer.
    pub fn block_range(&self, from: u64, to: u64) -> Vec<Block> {
        self.blocks
            .iter()
            .filter(|block| block.height > from && block.height <= to)
            .cloned()
            .collect()
    }

    /// Structural integrity: heights contiguous from 0 and every block
    /// linked to its parent by hash. A forked splice can break this; the
    /// check is diagnostic, appends stay unconditional.
    pub fn is_valid(&self) -> bool {
        for (index, block) in self.blocks.iter().enumerate() {
            if block.height != index as u64 {
                return false;
            }
            if index > 0 {
                match self.blocks[index - 1].hash() {
                    Ok(parent_hash) if block.previous_hash == parent_hash => {}
                    _ => return false,
                }
            }
        }
        !self.blocks.is_empty()
    }

    /// Balance by full replay: rewards mined plus amounts received minus
    /// amounts sent. Negative results are not clamped.
    pub fn balance(&self, address: &str) -> i64 {
        let mut total: i64 = 0;
        for block in &self.blocks {
            if block.miner == address {
                total += block.reward as i64;
            }
            for tx in &block.transaction_store.transactions {
                for (receiver, amount) in &tx.receivers {
                    if receiver == address {
                        total += *amount as i64;
                    }
                }
                for (sender, amount) in &tx.senders {
                    if sender == address {
                        total -= *amount as i64;
                    }
                }
            }
        }
        total
    }

    /// Save the chain to a JSON snapshot. Without `overwrite` the call
    /// refuses (returns false) when the file already holds a chain at least
    /// as long as ours; otherwise previously saved blocks are kept and only
    /// newer ones appended. The file is rewritten atomically.
    pub fn save_to_json(&self, path: impl AsRef<Path>, overwrite: bool) -> bool {
        let path = path.as_ref();
        let mut kept: Vec<String> = Vec::new();
        let mut last_saved: i64 = -1;

        if !overwrite {
            match fs::read_to_string(path) {
                Ok(raw) => match serde_json::from_str::<Snapshot>(&raw) {
                    Ok(previous) => {
                        if previous.last_block_height >= self.height() {
                            log::warn!(
                                "save aborted: '{}' holds a chain at height {} >= ours at {} \
                                 (pass overwrite to force)",
                                path.display(),
                                previous.last_block_height,
                                self.height()
                            );
                            return false;
                        }
                        last_saved = previous.last_block_height as i64;
                        kept = previous.blocks;
                    }
                    Err(e) => {
                        log::error!("could not parse snapshot '{}': {}", path.display(), e);
                        return false;
                    }
                },
                // Missing file: fresh save.
                Err(_) => {}
            }
        }

        for block in &self.blocks {
            if block.height as i64 > last_saved {
                match block.canonical_json() {
                    Ok(json) => kept.push(json),
                    Err(e) => {
                        log::error!("could not serialize block #{}: {}", block.height, e);
                        return false;
                    }
                }
            }
        }

        let snapshot = Snapshot {
            saved_time: Utc::now().timestamp_micros() as f64 / 1e6,
            last_block_height: self.height(),
            blocks: kept,
        };
        let body = match serde_json::to_string(&snapshot) {
            Ok(body) => body,
            Err(e) => {
                log::error!("could not serialize snapshot: {}", e);
                return false;
            }
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = fs::create_dir_all(parent) {
                    log::error!("could not create '{}': {}", parent.display(), e);
                    return false;
                }
            }
        }
        let tmp = path.with_extension("tmp");
        if let Err(e) = fs::write(&tmp, body).and_then(|_| fs::rename(&tmp, path)) {
            log::error!("could not write snapshot '{}': {}", path.display(), e);
            return false;
        }

        log::info!(
            "saved {} blocks to '{}'",
            self.blocks.len(),
            path.display()
        );
        true
    }

    /// Load a JSON snapshot. Without `overwrite` the call refuses when the
    /// saved chain is not strictly longer than ours; with it the whole ledger
    /// is replaced. Failures leave the ledger untouched.
    pub fn load_from_json(&mut self, path: impl AsRef<Path>, overwrite: bool) -> bool {
        let path = path.as_ref();
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                log::error!("could not read snapshot '{}': {}", path.display(), e);
                return false;
            }
        };
        let snapshot: Snapshot = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::error!("could not parse snapshot '{}': {}", path.display(), e);
                return false;
            }
        };
        if !overwrite && snapshot.last_block_height <= self.height() {
            log::warn!(
                "load aborted: current chain at height {} is not shorter than '{}' at {} \
                 (pass overwrite to force)",
                self.height(),
                path.display(),
                snapshot.last_block_height
            );
            return false;
        }

        // Parse everything first so a bad entry cannot leave a half-loaded chain.
        let mut parsed = Vec::with_capacity(snapshot.blocks.len());
        for raw_block in &snapshot.blocks {
            match Block::from_json(raw_block) {
                Ok(block) => parsed.push(block),
                Err(e) => {
                    log::error!("could not parse saved block: {}", e);
                    return false;
                }
            }
        }

        let mut last_kept = self.height() as i64;
        if overwrite {
            self.blocks.clear();
            last_kept = -1;
        }
        let mut loaded = 0usize;
        for block in parsed {
            if block.height as i64 > last_kept {
                self.blocks.push(block);
                loaded += 1;
            }
        }

        log::info!(
            "loaded {} blocks from '{}' (saved at {})",
            loaded,
            path.display(),
            snapshot.saved_time
        );
        true
    }
}
