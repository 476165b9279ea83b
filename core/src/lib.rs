pub mod block;
pub mod blockchain;
pub mod checkpoint;
pub mod config;
pub mod crypto;
pub mod db;

// Explicit re-exports to avoid ambiguous glob re-exports
pub use block::{BlockHash, BlockHeader, compute_header_hash};
pub use blockchain::{BlockIndex, ChainQuery, IndexEntry};
pub use checkpoint::{
    CheckpointError, CheckpointMessage, CheckpointRelay, ReceiveOutcome, Synchronizer,
};
pub use config::{ConsensusParams, Network};
pub use crypto::{Secp256k1Engine, SignatureEngine};
pub use db::{CheckpointStore, HeaderStore, MemoryCheckpointStore, RocksCheckpointStore};
