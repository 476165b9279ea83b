//! Synchronized checkpoints (centrally signed, locally verified)
//!
//! A node configured with the checkpoint master private key periodically
//! signs a block hash and broadcasts it. Every node verifies the signature
//! against the network's master public key and checks that the new
//! checkpoint descends from the currently accepted one. An accepted
//! checkpoint pins history: blocks that would replace it, or anything below
//! it, are refused by `Synchronizer::check_against_checkpoint`.
//!
//! A conflicting checkpoint means either the master key is compromised or the
//! operator made a mistake. It is discarded, the currently accepted
//! checkpoint is kept, and an operator warning is raised.
//!
//! Lock order: callers hold the block index lock (if any) before calling
//! into the synchronizer; the synchronizer never calls back into the index
//! owner and never holds its state lock while relaying to peers.

pub mod message;
pub mod state;
pub mod sync;
pub mod validator;

pub use message::{CHECKPOINT_VERSION, CheckpointMessage, UnsignedCheckpoint};
pub use state::CheckpointState;
pub use sync::{
    CheckpointDepth, CheckpointRelay, CheckpointStatus, PromoteOutcome, SendOutcome, Synchronizer,
};
pub use validator::{Validation, check_block, validate};

use crate::block::BlockHash;
use crate::blockchain::ChainError;
use crate::crypto::KeyError;
use crate::db::StoreError;
use std::fmt;

/// What happened to a received checkpoint message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Persisted and now active; relayed to peers.
    Applied,
    /// Lineage-valid but the block is not on the active chain yet.
    Parked,
    /// Block unknown locally; message dropped until re-delivered.
    Deferred,
    /// Not newer than the active checkpoint.
    Stale,
    /// Incompatible with the active checkpoint.
    Conflict,
}

impl fmt::Display for ReceiveOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReceiveOutcome::Applied => "applied",
            ReceiveOutcome::Parked => "parked",
            ReceiveOutcome::Deferred => "deferred",
            ReceiveOutcome::Stale => "stale",
            ReceiveOutcome::Conflict => "conflict",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint signature verification failed")]
    BadSignature,
    #[error("malformed checkpoint message: {0}")]
    MalformedMessage(String),
    #[error("block index missing for checkpoint {0}")]
    MissingIndex(BlockHash),
    #[error("block index corrupt: {0}")]
    CorruptIndex(#[from] ChainError),
    #[error("active checkpoint {0} is not on the active chain")]
    InactiveCheckpoint(BlockHash),
    #[error("checkpoint master key unavailable")]
    NoMasterKey,
    #[error("checkpoint master key invalid: {0}")]
    InvalidKey(#[from] KeyError),
    #[error("failed to persist checkpoint state: {0}")]
    Store(#[from] StoreError),
    #[error("checkpoint {hash} was not applied ({outcome})")]
    NotApplied {
        hash: BlockHash,
        outcome: ReceiveOutcome,
    },
}

impl CheckpointError {
    /// Errors caused by untrusted input: the message is dropped and nothing
    /// else happens.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CheckpointError::BadSignature
                | CheckpointError::MalformedMessage(_)
                | CheckpointError::MissingIndex(_)
        )
    }
}
