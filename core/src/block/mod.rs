use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use crate::transaction::TransactionStore;

/// One ledger entry.
///
/// Fields are declared in the lexical order of their serialized keys, so the
/// derived serde output *is* the canonical key-sorted JSON the hash is
/// computed over. `consensus_algorithm` tags the rule the block was mined
/// under: false = computational puzzle, true = stake-weighted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub consensus_algorithm: bool,
    pub height: u64,
    pub miner: String,
    pub nonce: u64,
    pub previous_hash: String,
    pub reward: u64,
    pub timestamp: f64,
    pub transaction_store: TransactionStore,
}

impl Block {
    /// Canonical serialization: all fields, keys in lexical order,
    /// transactions double-encoded as strings.
    pub fn canonical_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Lowercase hex SHA3-256 over the canonical serialization (nonce
    /// included, so mining changes the hash).
    pub fn hash(&self) -> serde_json::Result<String> {
        let canonical = self.canonical_json()?;
        Ok(hex::encode(Sha3_256::digest(canonical.as_bytes())))
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Block equality is hash equality; a block that fails to serialize is equal
/// to nothing.
impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        match (self.hash(), other.hash()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}
