use serde::{Deserialize, Serialize};
use std::{fs, io, path::PathBuf};

/// Node configuration, stored as JSON under the user's home directory by
/// default. Every field has a default so partial files load fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interface the node listens on.
    pub host: String,
    /// Listening port; 0 lets the OS pick one.
    pub port: u16,
    /// "puzzle" or "stake".
    pub consensus: String,
    pub difficulty: f64,
    /// Seed the wallet keypair is derived from; same seed, same address.
    pub wallet_seed: String,
    /// Peers to dial on startup, as "host:port" strings.
    pub peers: Vec<String>,
    /// Directory for chain snapshots.
    pub data_dir: String,
}

impl Config {
    fn expand_path(path: &str) -> PathBuf {
        let expanded = shellexpand::tilde(path);
        PathBuf::from(expanded.into_owned())
    }

    fn default_data_dir() -> String {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".ferrocoin")
            .join("data")
            .to_string_lossy()
            .into_owned()
    }

    pub fn default_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".ferrocoin").join("config.json")
    }

    /// Data directory with tilde expansion applied.
    pub fn data_dir_resolved(&self) -> PathBuf {
        Self::expand_path(&self.data_dir)
    }

    pub fn is_stake(&self) -> bool {
        self.consensus.eq_ignore_ascii_case("stake")
    }

    /// Load from an explicit path, or from the default location; a missing
    /// default file yields the default configuration.
    pub fn load(path: Option<PathBuf>) -> io::Result<Self> {
        let path = path.unwrap_or_else(Self::default_path);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path)?;
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn save(&self, path: Option<PathBuf>) -> io::Result<()> {
        let path = path.unwrap_or_else(Self::default_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&path, json)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 13337,
            consensus: "puzzle".to_string(),
            difficulty: 1.0,
            wallet_seed: "ferrocoin".to_string(),
            peers: Vec::new(),
            data_dir: Self::default_data_dir(),
        }
    }
}
