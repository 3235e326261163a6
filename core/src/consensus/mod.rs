use thiserror::Error;

use crate::block::Block;

pub mod pos;
pub mod pow;

pub use pos::ProofOfStake;
pub use pow::ProofOfWork;

/// Which consensus rule a node (and its blocks) run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusKind {
    Puzzle,
    Stake,
}

impl ConsensusKind {
    /// Tag carried on blocks: false = puzzle, true = stake.
    pub fn flag(self) -> bool {
        matches!(self, ConsensusKind::Stake)
    }

    pub fn from_flag(flag: bool) -> Self {
        if flag {
            ConsensusKind::Stake
        } else {
            ConsensusKind::Puzzle
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MineOutcome {
    /// The block now carries a nonce satisfying the rule.
    Found,
    /// `stop()` interrupted the search; the block is unchanged in meaning.
    Preempted,
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error(
        "puzzle difficulty must be non-negative with fractional part 0 or 0.5, got {0}"
    )]
    InvalidDifficulty(f64),
    #[error("stake difficulty must be positive, got {0}")]
    InvalidStakeDifficulty(f64),
    #[error("cannot mine with a zero-balance wallet")]
    InsufficientStake,
    #[error("block serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Common contract of the two mining rules.
///
/// `mine` blocks the calling thread until it finds a satisfying nonce or a
/// concurrent `stop()` preempts it; the preemption flag is re-armed on every
/// call, so consecutive `mine` calls behave identically. The difficulty knob
/// is read once at `mine` entry; updates between blocks are tolerated,
/// updates within one call are not observed.
pub trait ConsensusAlgorithm: Send + Sync {
    fn kind(&self) -> ConsensusKind;

    fn difficulty(&self) -> f64;

    fn set_difficulty(&self, difficulty: f64);

    fn mine(&self, block: &mut Block) -> Result<MineOutcome, ConsensusError>;

    /// Request preemption of a `mine` in progress. No-op when idle.
    fn stop(&self);

    /// Check a foreign block against the rule. `miner_balance` is the block
    /// miner's ledger balance; the puzzle variant ignores it.
    fn verify(&self, block: &Block, miner_balance: i64) -> Result<bool, ConsensusError>;
}
