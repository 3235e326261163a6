use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::block::Block;
use crate::consensus::{ConsensusAlgorithm, ConsensusError, ConsensusKind, MineOutcome};

/// Computational-puzzle rule: a hash is acceptable when it starts with
/// `floor(difficulty)` zero characters, plus a '0' or '1' at the next
/// position when the difficulty carries a .5 fraction.
pub struct ProofOfWork {
    difficulty: Mutex<f64>,
    preempted: AtomicBool,
}

impl ProofOfWork {
    pub fn new(difficulty: f64) -> Self {
        ProofOfWork {
            difficulty: Mutex::new(difficulty),
            preempted: AtomicBool::new(false),
        }
    }

    /// Split a difficulty into (whole, half-step) parts, rejecting anything
    /// that is not a non-negative multiple of 0.5.
    fn split(difficulty: f64) -> Result<(usize, bool), ConsensusError> {
        if difficulty < 0.0 || !difficulty.is_finite() {
            return Err(ConsensusError::InvalidDifficulty(difficulty));
        }
        let whole = difficulty.floor();
        let frac = difficulty - whole;
        if frac == 0.0 {
            Ok((whole as usize, false))
        } else if frac == 0.5 {
            Ok((whole as usize, true))
        } else {
            Err(ConsensusError::InvalidDifficulty(difficulty))
        }
    }

    fn meets_target(hash: &str, whole: usize, half: bool) -> bool {
        let bytes = hash.as_bytes();
        if bytes.len() < whole {
            return false;
        }
        if !bytes.iter().take(whole).all(|&c| c == b'0') {
            return false;
        }
        if half {
            matches!(bytes.get(whole).copied(), Some(b'0') | Some(b'1'))
        } else {
            true
        }
    }
}

impl ConsensusAlgorithm for ProofOfWork {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::Puzzle
    }

    fn difficulty(&self) -> f64 {
        *self.difficulty.lock()
    }

    fn set_difficulty(&self, difficulty: f64) {
        *self.difficulty.lock() = difficulty;
    }

    fn mine(&self, block: &mut Block) -> Result<MineOutcome, ConsensusError> {
        let (whole, half) = Self::split(self.difficulty())?;
        self.preempted.store(false, Ordering::Relaxed);

        loop {
            if self.preempted.load(Ordering::Relaxed) {
                return Ok(MineOutcome::Preempted);
            }
            if Self::meets_target(&block.hash()?, whole, half) {
                return Ok(MineOutcome::Found);
            }
            block.nonce = block.nonce.wrapping_add(1);
        }
    }

    fn stop(&self) {
        self.preempted.store(true, Ordering::Relaxed);
    }

    fn verify(&self, block: &Block, _miner_balance: i64) -> Result<bool, ConsensusError> {
        let (whole, half) = Self::split(self.difficulty())?;
        Ok(Self::meets_target(&block.hash()?, whole, half))
    }
}
