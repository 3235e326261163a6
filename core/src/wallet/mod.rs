use once_cell::sync::Lazy;
use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("amount cannot be negative or zero")]
    NonPositiveAmount,
    #[error("balance cannot go negative")]
    InsufficientFunds,
}

/// Wallet owned by a full node.
///
/// Keys are derived deterministically from a seed string so a simulation
/// gets stable addresses across runs. The balance is a cache the node
/// refreshes from the ledger; transactions themselves are unsigned, but the
/// keypair and `sign`/`verify_signature` stay as the hook for an
/// authenticated scheme.
pub struct Wallet {
    display_name: String,
    pub balance: i64,
    secret_key: SecretKey,
    public_key: PublicKey,
    address: String,
}

impl Wallet {
    pub fn from_seed(seed: &str) -> Self {
        Self::with_display_name(seed, "")
    }

    pub fn with_display_name(seed: &str, display_name: &str) -> Self {
        let secret_key = Self::derive_secret(seed.as_bytes());
        let public_key = PublicKey::from_secret_key(&SECP, &secret_key);
        let address = bs58::encode(Sha256::digest(public_key.serialize())).into_string();
        Wallet {
            display_name: display_name.to_string(),
            balance: 0,
            secret_key,
            public_key,
            address,
        }
    }

    /// Hash the seed until it lands on a valid curve scalar. The first
    /// digest is virtually always valid; the loop covers the rest.
    fn derive_secret(seed: &[u8]) -> SecretKey {
        let mut digest = Sha256::digest(seed);
        loop {
            if let Ok(secret_key) = SecretKey::from_slice(&digest) {
                return secret_key;
            }
            digest = Sha256::digest(digest);
        }
    }

    /// Base58 string identity; peers only ever see this.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// First six address characters, used as the node id in logs.
    pub fn short_id(&self) -> &str {
        &self.address[..6]
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn credit(&mut self, amount: i64) -> Result<(), WalletError> {
        if amount <= 0 {
            return Err(WalletError::NonPositiveAmount);
        }
        self.balance += amount;
        Ok(())
    }

    pub fn debit(&mut self, amount: i64) -> Result<(), WalletError> {
        if amount <= 0 {
            return Err(WalletError::NonPositiveAmount);
        }
        if self.balance - amount < 0 {
            return Err(WalletError::InsufficientFunds);
        }
        self.balance -= amount;
        Ok(())
    }

    /// Signature hook for a future authenticated transaction format.
    pub fn sign(&self, payload: &[u8]) -> Signature {
        let digest: [u8; 32] = Sha256::digest(payload).into();
        SECP.sign_ecdsa(&Message::from_digest(digest), &self.secret_key)
    }

    pub fn verify_signature(payload: &[u8], signature: &Signature, key: &PublicKey) -> bool {
        let digest: [u8; 32] = Sha256::digest(payload).into();
        SECP.verify_ecdsa(&Message::from_digest(digest), signature, key)
            .is_ok()
    }
}
