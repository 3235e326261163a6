pub mod block;
pub mod blockchain;
pub mod config;
pub mod consensus;
pub mod transaction;
pub mod wallet;

// Explicit re-exports to avoid ambiguous glob re-exports
pub use block::Block;
pub use blockchain::Blockchain;
pub use consensus::{ConsensusAlgorithm, ConsensusError, ConsensusKind, MineOutcome};
pub use transaction::{Transaction, TransactionStore};
pub use wallet::Wallet;
