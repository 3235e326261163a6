use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use primitive_types::U512;
use sha3::{Digest, Sha3_256};

use crate::block::Block;
use crate::consensus::{ConsensusAlgorithm, ConsensusError, ConsensusKind, MineOutcome};
use crate::wallet::Wallet;

/// Stake-weighted rule: an attempt hash over (previous hash, miner address,
/// nonce) is acceptable when it does not exceed `2^256 * balance / difficulty`,
/// so the win chance per attempt scales with the miner's stake.
///
/// The nonce is the attempt time in 100-ns ticks, packed big-endian for
/// hashing, which makes every attempt distinct without a counter.
pub struct ProofOfStake {
    difficulty: Mutex<f64>,
    preempted: AtomicBool,
    wallet: Arc<Mutex<Wallet>>,
}

/// Milli-unit scale used to keep the threshold division integral.
const DIFFICULTY_SCALE: u64 = 1000;

impl ProofOfStake {
    pub fn new(difficulty: f64, wallet: Arc<Mutex<Wallet>>) -> Self {
        ProofOfStake {
            difficulty: Mutex::new(difficulty),
            preempted: AtomicBool::new(false),
            wallet,
        }
    }

    /// `2^256 * balance / difficulty`, exact in 512-bit arithmetic.
    fn threshold(balance: i64, difficulty: f64) -> U512 {
        if balance <= 0 {
            return U512::zero();
        }
        let millis = (difficulty * DIFFICULTY_SCALE as f64).round() as u64;
        (U512::one() << 256usize) * U512::from(balance as u64) * U512::from(DIFFICULTY_SCALE)
            / U512::from(millis.max(1))
    }

    fn attempt_hash(previous_hash: &str, miner: &str, nonce: u64) -> U512 {
        let mut hasher = Sha3_256::new();
        hasher.update(previous_hash.as_bytes());
        hasher.update(miner.as_bytes());
        hasher.update(nonce.to_be_bytes());
        U512::from_big_endian(&hasher.finalize())
    }

    /// Current monotonic-enough wall time in 100-ns ticks.
    fn time_nonce() -> u64 {
        (Utc::now().timestamp_nanos_opt().unwrap_or_default() / 100) as u64
    }

    fn checked_difficulty(&self) -> Result<f64, ConsensusError> {
        let difficulty = *self.difficulty.lock();
        if difficulty <= 0.0 || !difficulty.is_finite() {
            return Err(ConsensusError::InvalidStakeDifficulty(difficulty));
        }
        Ok(difficulty)
    }
}

impl ConsensusAlgorithm for ProofOfStake {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::Stake
    }

    fn difficulty(&self) -> f64 {
        *self.difficulty.lock()
    }

    fn set_difficulty(&self, difficulty: f64) {
        *self.difficulty.lock() = difficulty;
    }

    fn mine(&self, block: &mut Block) -> Result<MineOutcome, ConsensusError> {
        let difficulty = self.checked_difficulty()?;
        let balance = self.wallet.lock().balance;
        if balance <= 0 {
            return Err(ConsensusError::InsufficientStake);
        }
        let threshold = Self::threshold(balance, difficulty);
        self.preempted.store(false, Ordering::Relaxed);

        loop {
            if self.preempted.load(Ordering::Relaxed) {
                return Ok(MineOutcome::Preempted);
            }
            block.nonce = Self::time_nonce();
            let attempt = Self::attempt_hash(&block.previous_hash, &block.miner, block.nonce);
            if attempt <= threshold {
                return Ok(MineOutcome::Found);
            }
        }
    }

    fn stop(&self) {
        self.preempted.store(true, Ordering::Relaxed);
    }

    fn verify(&self, block: &Block, miner_balance: i64) -> Result<bool, ConsensusError> {
        let difficulty = self.checked_difficulty()?;
        let threshold = Self::threshold(miner_balance, difficulty);
        let attempt = Self::attempt_hash(&block.previous_hash, &block.miner, block.nonce);
        Ok(attempt <= threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Blockchain;
    use crate::transaction::TransactionStore;

    fn stake_wallet(seed: &str, balance: i64) -> Arc<Mutex<Wallet>> {
        let mut wallet = Wallet::from_seed(seed);
        wallet.balance = balance;
        Arc::new(Mutex::new(wallet))
    }

    fn candidate(chain: &Blockchain, miner: String) -> Block {
        let tip = chain.last_block();
        Block {
            consensus_algorithm: true,
            height: tip.height + 1,
            miner,
            nonce: 0,
            previous_hash: tip.hash().unwrap(),
            reward: 1,
            timestamp: 1234567890.0,
            transaction_store: TransactionStore::new(),
        }
    }

    #[test]
    fn mined_block_stays_under_threshold() {
        let wallet = stake_wallet("stake-test", 1);
        let miner = wallet.lock().address().to_string();
        let chain = Blockchain::new(true);
        let pos = ProofOfStake::new(10.0, wallet);

        let mut block = candidate(&chain, miner);
        assert_eq!(pos.mine(&mut block).unwrap(), MineOutcome::Found);

        let attempt =
            ProofOfStake::attempt_hash(&block.previous_hash, &block.miner, block.nonce);
        assert!(attempt <= ProofOfStake::threshold(1, 10.0));
        assert!(pos.verify(&block, 1).unwrap());
    }

    #[test]
    fn zero_balance_is_a_typed_error() {
        let wallet = stake_wallet("broke", 0);
        let miner = wallet.lock().address().to_string();
        let chain = Blockchain::new(true);
        let pos = ProofOfStake::new(10.0, wallet);

        let mut block = candidate(&chain, miner);
        assert!(matches!(
            pos.mine(&mut block),
            Err(ConsensusError::InsufficientStake)
        ));
    }

    #[test]
    fn richer_wallets_get_larger_thresholds() {
        let poor = ProofOfStake::threshold(1, 10.0);
        let rich = ProofOfStake::threshold(100, 10.0);
        assert!(rich > poor);
        assert_eq!(ProofOfStake::threshold(0, 10.0), U512::zero());
        assert_eq!(ProofOfStake::threshold(-5, 10.0), U512::zero());
    }

    #[test]
    fn verify_uses_the_reported_balance() {
        let wallet = stake_wallet("verifier", 1);
        let miner = wallet.lock().address().to_string();
        let chain = Blockchain::new(true);
        let pos = ProofOfStake::new(10.0, wallet);

        let mut block = candidate(&chain, miner);
        assert_eq!(pos.mine(&mut block).unwrap(), MineOutcome::Found);
        // A zero-stake miner could not have produced any acceptable block.
        assert!(!pos.verify(&block, 0).unwrap());
    }

    #[test]
    fn invalid_difficulty_is_rejected() {
        let wallet = stake_wallet("odd", 1);
        let miner = wallet.lock().address().to_string();
        let chain = Blockchain::new(true);
        let pos = ProofOfStake::new(0.0, wallet);
        let mut block = candidate(&chain, miner);
        assert!(matches!(
            pos.mine(&mut block),
            Err(ConsensusError::InvalidStakeDifficulty(_))
        ));
    }
}
