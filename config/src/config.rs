use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config file format error: {0}")]
    Format(#[from] serde_json::Error),
    #[error("unknown configuration key: {0}")]
    UnknownKey(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: String,
    pub p2p_bind: String,
    pub rpc_bind: String,
    /// Node API the operator CLI talks to.
    pub node_rpc_url: String,
    pub peers: Vec<String>,
    /// Auto-checkpoint lag in blocks; negative means manual checkpoints only.
    pub checkpoint_depth: i64,
    /// Checkpoint master private key (hex). Only set on the master node.
    pub checkpoint_key: Option<String>,
    pub network: String,
}

impl Config {
    fn expand_path(path: &str) -> PathBuf {
        let expanded = shellexpand::tilde(path);
        PathBuf::from(expanded.into_owned())
    }

    fn base_dir() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));

        // Use a Windows-friendly folder when building on Windows to avoid tilde expansion issues.
        if cfg!(target_os = "windows") {
            return dirs::data_dir().unwrap_or(home).join("Syncpoint");
        }
        home.join(".syncpoint")
    }

    fn default_data_dir() -> String {
        Self::base_dir().join("data").to_string_lossy().into_owned()
    }

    pub fn default_path() -> PathBuf {
        Self::base_dir().join("config.json")
    }

    /// Data directory with tilde expansion applied.
    pub fn data_dir_resolved(&self) -> PathBuf {
        Self::expand_path(&self.data_dir)
    }

    /// Load the default config file, creating it on first use.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::info!(
                "Configuration file not found, creating default configuration: {:?}",
                path
            );
            let cfg = Self::default();
            cfg.save_to(path)?;
            return Ok(cfg);
        }
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(io_err)
    }

    /// Update one field from its string form. Does not save.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "data_dir" => self.data_dir = value.to_string(),
            "p2p_bind" => self.p2p_bind = value.to_string(),
            "rpc_bind" => self.rpc_bind = value.to_string(),
            "node_rpc_url" => self.node_rpc_url = value.to_string(),
            "peers" => {
                self.peers = value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            }
            "checkpoint_depth" => self.checkpoint_depth = value.parse().map_err(|_| invalid())?,
            "checkpoint_key" => {
                self.checkpoint_key = (!value.is_empty()).then(|| value.to_string())
            }
            "network" => match value {
                "mainnet" | "regtest" => self.network = value.to_string(),
                _ => return Err(invalid()),
            },
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Pretty JSON with the master key masked.
    pub fn view(&self) -> Result<String, ConfigError> {
        let mut shown = self.clone();
        if shown.checkpoint_key.is_some() {
            shown.checkpoint_key = Some("********".to_string());
        }
        Ok(serde_json::to_string_pretty(&shown)?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            p2p_bind: "0.0.0.0:8335".to_string(),
            rpc_bind: "127.0.0.1:19533".to_string(),
            node_rpc_url: "http://127.0.0.1:19533".to_string(),
            peers: Vec::new(),
            checkpoint_depth: -1,
            checkpoint_key: None,
            network: "mainnet".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_load_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let cfg = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.checkpoint_depth, -1);
        assert!(cfg.checkpoint_key.is_none());
        assert_eq!(Config::load_from(&path).unwrap(), cfg);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"checkpoint_depth": 8, "network": "regtest"}"#).unwrap();
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.checkpoint_depth, 8);
        assert_eq!(cfg.network, "regtest");
        assert_eq!(cfg.rpc_bind, Config::default().rpc_bind);
    }

    #[test]
    fn broken_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::Format(_))
        ));
    }

    #[test]
    fn set_value_parses_and_validates() {
        let mut cfg = Config::default();
        cfg.set_value("checkpoint_depth", "12").unwrap();
        assert_eq!(cfg.checkpoint_depth, 12);
        cfg.set_value("peers", "10.0.0.1:8335, 10.0.0.2:8335,").unwrap();
        assert_eq!(cfg.peers.len(), 2);
        cfg.set_value("checkpoint_key", "ab").unwrap();
        assert_eq!(cfg.checkpoint_key.as_deref(), Some("ab"));
        cfg.set_value("checkpoint_key", "").unwrap();
        assert!(cfg.checkpoint_key.is_none());

        assert!(matches!(
            cfg.set_value("checkpoint_depth", "deep"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            cfg.set_value("network", "testnet"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            cfg.set_value("wallet_path", "x"),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn view_masks_key() {
        let mut cfg = Config::default();
        cfg.checkpoint_key = Some("11".repeat(32));
        let shown = cfg.view().unwrap();
        assert!(!shown.contains(&"11".repeat(32)));
        assert!(shown.contains("********"));
    }
}
