//! Protocol-level constants shared by mining, validation and the ledger.

/// Reward credited to the miner of every non-genesis block.
/// Flat schedule, no halving.
pub const BLOCK_REWARD: u64 = 1;

/// Reward recorded on the genesis block for its "0" pseudo-miner.
pub const GENESIS_REWARD: u64 = 100;

/// Parent hash of the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Pseudo-address that mines the genesis block and funds genesis
/// beneficiaries. Its balance is allowed to go negative.
pub const GENESIS_MINER: &str = "0";

/// Maximum number of seconds a block timestamp may lie in the future.
pub const MAX_FUTURE_BLOCK_TIME: f64 = 3600.0;

/// Reward for the next block to be mined.
pub fn compute_reward() -> u64 {
    BLOCK_REWARD
}
