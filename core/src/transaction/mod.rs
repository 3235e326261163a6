use serde::de::Error as DeError;
use serde::ser::{Error as SerError, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("sum of sent amounts ({input}) must cover sum of received amounts ({output})")]
    OutputsExceedInputs { input: u64, output: u64 },
}

/// A coin transfer: addresses paired with the amounts they send or receive.
///
/// Transactions carry no signatures; any sender list is trusted. The wallet
/// keeps a signing hook for a later authenticated scheme.
///
/// Field order is the lexical key order of the canonical JSON form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub receivers: Vec<(String, u64)>,
    pub senders: Vec<(String, u64)>,
}

impl Transaction {
    /// Build a transaction, refusing one that creates coins out of thin air.
    pub fn new(
        senders: Vec<(String, u64)>,
        receivers: Vec<(String, u64)>,
    ) -> Result<Self, TransactionError> {
        let input: u64 = senders.iter().map(|(_, amount)| amount).sum();
        let output: u64 = receivers.iter().map(|(_, amount)| amount).sum();
        if output > input {
            return Err(TransactionError::OutputsExceedInputs { input, output });
        }
        Ok(Transaction { receivers, senders })
    }

    pub fn total_input(&self) -> u64 {
        self.senders.iter().map(|(_, amount)| amount).sum()
    }

    pub fn total_output(&self) -> u64 {
        self.receivers.iter().map(|(_, amount)| amount).sum()
    }

    /// Canonical key-sorted JSON, e.g. `{"receivers":[["bob",2]],"senders":[["alice",2]]}`.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Ordered transactions carried inside a block.
///
/// On the wire and in the canonical block serialization this is an array of
/// *stringified* transaction JSONs; the double encoding is part of the hash
/// input and must round-trip exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionStore {
    pub transactions: Vec<Transaction>,
}

impl TransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_transactions(transactions: Vec<Transaction>) -> Self {
        TransactionStore { transactions }
    }

    pub fn add_transaction(&mut self, transaction: Transaction) {
        self.transactions.push(transaction);
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

impl Serialize for TransactionStore {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.transactions.len()))?;
        for transaction in &self.transactions {
            let raw = transaction.to_json().map_err(S::Error::custom)?;
            seq.serialize_element(&raw)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for TransactionStore {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: Vec<String> = Vec::deserialize(deserializer)?;
        let transactions = raw
            .iter()
            .map(|entry| Transaction::from_json(entry))
            .collect::<Result<Vec<_>, _>>()
            .map_err(D::Error::custom)?;
        Ok(TransactionStore { transactions })
    }
}
