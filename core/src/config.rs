// Network consensus parameters relevant to checkpoint sync
use crate::block::{BlockHash, BlockHeader, compute_header_hash};
use crate::blockchain::ChainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ========== Checkpoint master keys ==========

/// Compressed secp256k1 public key of the mainnet checkpoint master.
pub const MAINNET_CHECKPOINT_PUBKEY: &str =
    "024ec75adfb1ae53272ed43203f83c02a4b5a65989ab2e2407deb3b29823ad43e4";

/// Regtest master key is public knowledge: private key is 0x11 repeated.
pub const REGTEST_CHECKPOINT_PUBKEY: &str =
    "034f355bdcb7cc0af728ef3cceb9615d90684bb5b2ca5f859ab0f0b704075871aa";

// ========== Auto checkpoint policy ==========

/// Default `checkpoint_depth`: negative means manual mode.
pub const DEFAULT_AUTOCHECKPOINT: i64 = -1;

/// Smallest lag that gives auto checkpoints meaningful protection.
pub const MIN_RECOMMENDED_DEPTH: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Regtest,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => f.write_str("mainnet"),
            Network::Regtest => f.write_str("regtest"),
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}

/// Read-only consensus parameters consulted by the checkpoint subsystem.
#[derive(Debug, Clone)]
pub struct ConsensusParams {
    pub network: Network,
    pub genesis: BlockHeader,
    pub genesis_hash: BlockHash,
    /// Public key every checkpoint signature is verified against.
    pub checkpoint_pubkey: String,
    /// Fallback checkpoint installed on first run and after key rotation.
    pub assume_valid: BlockHash,
}

impl ConsensusParams {
    pub fn new(
        network: Network,
        genesis: BlockHeader,
        checkpoint_pubkey: impl Into<String>,
        assume_valid: Option<BlockHash>,
    ) -> Result<Self, ChainError> {
        let genesis_hash =
            compute_header_hash(&genesis).map_err(|e| ChainError::Encode(e.to_string()))?;
        Ok(Self {
            network,
            genesis,
            genesis_hash,
            checkpoint_pubkey: checkpoint_pubkey.into(),
            assume_valid: assume_valid.unwrap_or(genesis_hash),
        })
    }

    pub fn for_network(network: Network) -> Result<Self, ChainError> {
        match network {
            Network::Mainnet => Self::mainnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    pub fn mainnet() -> Result<Self, ChainError> {
        let genesis = BlockHeader {
            height: 0,
            previous_hash: BlockHash::ZERO,
            merkle_root: BlockHash([0x5c; 32]),
            timestamp: 1_735_689_600, // 2025-01-01T00:00:00Z
            nonce: 2_083_236_893,
        };
        Self::new(Network::Mainnet, genesis, MAINNET_CHECKPOINT_PUBKEY, None)
    }

    pub fn regtest() -> Result<Self, ChainError> {
        let genesis = BlockHeader {
            height: 0,
            previous_hash: BlockHash::ZERO,
            merkle_root: BlockHash::ZERO,
            timestamp: 1_296_688_602,
            nonce: 2,
        };
        Self::new(Network::Regtest, genesis, REGTEST_CHECKPOINT_PUBKEY, None)
    }
}
