use super::message::{CheckpointMessage, UnsignedCheckpoint};
use super::state::CheckpointState;
use super::validator::{Validation, check_block};
use super::{CheckpointError, ReceiveOutcome};
use crate::block::BlockHash;
use crate::blockchain::{ChainQuery, IndexEntry};
use crate::config::ConsensusParams;
use crate::crypto::{KeyError, SignatureEngine};
use crate::db::CheckpointStore;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outbound side of checkpoint propagation.
pub trait CheckpointRelay: Send + Sync {
    /// Best effort: delivery failures are the relay's concern.
    fn broadcast_checkpoint(&self, message: &CheckpointMessage);

    fn peer_count(&self) -> usize;
}

/// How far behind the tip a master auto-selects checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointDepth {
    /// Only explicit `sendcheckpoint` requests are signed.
    Manual,
    Lag(u32),
}

impl From<i64> for CheckpointDepth {
    fn from(depth: i64) -> Self {
        if depth < 0 {
            CheckpointDepth::Manual
        } else {
            CheckpointDepth::Lag(u32::try_from(depth).unwrap_or(u32::MAX))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(BlockHash),
    NoPeers,
    NullCheckpoint,
    Manual,
    /// Auto-selected block is not newer than the active checkpoint.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteOutcome {
    Idle,
    /// Pending checkpoint is still valid but not on the active chain.
    Waiting,
    Promoted(BlockHash),
    Discarded(Validation),
}

/// Snapshot returned by the `getcheckpoint` query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointStatus {
    pub active: BlockHash,
    pub height: Option<u64>,
    pub timestamp: Option<i64>,
    pub pending: Option<BlockHash>,
    pub last_conflict: Option<BlockHash>,
    pub warning: Option<String>,
    pub policy: String,
    pub master: bool,
}

/// Receives, validates, persists and relays checkpoints, and signs them when
/// the master key is installed.
pub struct Synchronizer {
    state: Mutex<CheckpointState>,
    store: Arc<dyn CheckpointStore>,
    engine: Arc<dyn SignatureEngine>,
    params: ConsensusParams,
    master_key: RwLock<Option<String>>,
}

impl Synchronizer {
    /// Synchronizer with no accepted checkpoint. Nothing is read from the
    /// store; see [`Synchronizer::open`].
    pub fn new(
        params: ConsensusParams,
        store: Arc<dyn CheckpointStore>,
        engine: Arc<dyn SignatureEngine>,
    ) -> Self {
        Self {
            state: Mutex::new(CheckpointState::default()),
            store,
            engine,
            params,
            master_key: RwLock::new(None),
        }
    }

    /// Load the persisted checkpoint and reset to assume-valid on first run
    /// or when the master public key changed since the last run.
    pub fn open(
        params: ConsensusParams,
        store: Arc<dyn CheckpointStore>,
        engine: Arc<dyn SignatureEngine>,
    ) -> Result<Self, CheckpointError> {
        let sync = Self::new(params, store, engine);
        if let Some(hash) = sync.store.read_checkpoint()? {
            log::info!("Loaded sync checkpoint {}", hash);
            *sync.state.lock() = CheckpointState::new(hash);
        }
        sync.check_master_pubkey()?;
        Ok(sync)
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn check_master_pubkey(&self) -> Result<(), CheckpointError> {
        let configured = &self.params.checkpoint_pubkey;
        let persisted = self.store.read_master_pubkey()?;
        if persisted.as_deref() == Some(configured.as_str()) {
            return Ok(());
        }
        match &persisted {
            Some(old) => log::warn!(
                "Checkpoint master key changed from {} to {}, resetting sync checkpoint",
                old,
                configured
            ),
            None => log::info!("No checkpoint master key on record, initializing"),
        }
        self.reset_to_assume_valid()?;
        self.store.write_master_pubkey(configured)?;
        self.store.flush()?;
        Ok(())
    }

    /// Startup check that the active checkpoint is in the restored index.
    /// When the headers behind it were lost, fall back to assume-valid so
    /// header sync can resume. Returns whether a reset happened.
    pub fn ensure_active_indexed<C: ChainQuery + ?Sized>(
        &self,
        chain: &C,
    ) -> Result<bool, CheckpointError> {
        let active = self.active();
        if chain.lookup(&active).is_some() {
            return Ok(false);
        }
        log::warn!(
            "Sync checkpoint {} is not in the block index, falling back to {}",
            active,
            self.params.assume_valid
        );
        self.reset_to_assume_valid()?;
        Ok(true)
    }

    pub fn reset_to_assume_valid(&self) -> Result<(), CheckpointError> {
        let hash = self.params.assume_valid;
        let mut state = self.state.lock();
        self.store.write_checkpoint(&hash)?;
        self.store.flush()?;
        state.set_active(hash, CheckpointMessage::null());
        log::info!("Sync checkpoint reset to {}", hash);
        Ok(())
    }

    /// Persist then install. On a store failure the state is left as it was.
    fn commit(
        &self,
        state: &mut CheckpointState,
        message: CheckpointMessage,
    ) -> Result<(), CheckpointError> {
        let hash = message.hash();
        self.store.write_checkpoint(&hash)?;
        self.store.flush()?;
        state.set_active(hash, message);
        log::info!("Sync checkpoint at {}", hash);
        Ok(())
    }

    /// Handle a checkpoint message from a peer (or from ourselves as master).
    ///
    /// Signature and payload errors drop the message without touching the
    /// state. Only `Applied` messages are relayed, after the state lock is
    /// released.
    pub fn receive<C: ChainQuery + ?Sized>(
        &self,
        message: CheckpointMessage,
        chain: &C,
        relay: &dyn CheckpointRelay,
    ) -> Result<ReceiveOutcome, CheckpointError> {
        let message = message
            .verify(self.engine.as_ref(), &self.params.checkpoint_pubkey)
            .inspect_err(|e| log::warn!("Dropping checkpoint message: {}", e))?;
        let hash = message.hash();

        let outcome = {
            let mut state = self.state.lock();
            let Some(entry) = chain.lookup(&hash) else {
                log::info!("Missing headers for received sync checkpoint {}", hash);
                return Ok(ReceiveOutcome::Deferred);
            };

            match state.validate(hash, chain)? {
                Validation::Stale => {
                    log::debug!("Ignoring stale checkpoint {}", hash);
                    state.clear_pending();
                    ReceiveOutcome::Stale
                }
                Validation::Conflict => {
                    state.clear_pending();
                    ReceiveOutcome::Conflict
                }
                Validation::Accept if chain.contains(entry) => {
                    self.commit(&mut state, message.clone())?;
                    ReceiveOutcome::Applied
                }
                Validation::Accept => {
                    log::info!("Pending sync checkpoint {}", hash);
                    state.set_pending(message.clone());
                    ReceiveOutcome::Parked
                }
            }
        };

        if outcome == ReceiveOutcome::Applied {
            relay.broadcast_checkpoint(&message);
        }
        Ok(outcome)
    }

    /// Re-check the pending checkpoint after the active chain changed.
    pub fn promote_pending<C: ChainQuery + ?Sized>(
        &self,
        chain: &C,
        relay: &dyn CheckpointRelay,
    ) -> Result<PromoteOutcome, CheckpointError> {
        let promoted = {
            let mut state = self.state.lock();
            let Some(pending) = state.pending().cloned() else {
                return Ok(PromoteOutcome::Idle);
            };
            let hash = pending.hash();
            let Some(entry) = chain.lookup(&hash) else {
                return Ok(PromoteOutcome::Waiting);
            };

            let verdict = state.validate(hash, chain)?;
            if verdict != Validation::Accept {
                log::warn!("Discarding pending checkpoint {} ({:?})", hash, verdict);
                state.clear_pending();
                return Ok(PromoteOutcome::Discarded(verdict));
            }
            if !chain.contains(entry) {
                return Ok(PromoteOutcome::Waiting);
            }

            self.commit(&mut state, pending.clone())?;
            pending
        };

        relay.broadcast_checkpoint(&promoted);
        Ok(PromoteOutcome::Promoted(promoted.hash()))
    }

    /// Block-acceptance guard; see [`check_block`].
    pub fn check_against_checkpoint<C: ChainQuery + ?Sized>(
        &self,
        block: &IndexEntry,
        chain: &C,
    ) -> Result<bool, CheckpointError> {
        let state = self.state.lock();
        check_block(state.active(), block, chain)
    }

    /// Active-chain block `lag` blocks below the tip, or genesis when the
    /// chain is shorter than that.
    pub fn auto_select<C: ChainQuery + ?Sized>(
        chain: &C,
        lag: u32,
    ) -> Result<Option<BlockHash>, CheckpointError> {
        let Some(tip) = chain.tip() else {
            return Ok(None);
        };
        let target = tip.height.saturating_sub(u64::from(lag));
        Ok(Some(chain.ancestor(tip, target)?.hash))
    }

    /// Install the master private key for this process. An invalid key is
    /// rejected and any previously installed key stays.
    pub fn set_master_key(&self, private_key: &str) -> Result<(), CheckpointError> {
        let private_key = private_key.trim();
        let pubkey = self.engine.public_key_for(private_key)?;
        if pubkey != self.params.checkpoint_pubkey {
            log::warn!(
                "Installed checkpoint key {} does not match network master key {}; \
                 checkpoints it signs will be rejected",
                pubkey,
                self.params.checkpoint_pubkey
            );
        }
        *self.master_key.write() = Some(private_key.to_string());
        log::info!("Checkpoint master key installed");
        Ok(())
    }

    pub fn is_master(&self) -> bool {
        self.master_key.read().is_some()
    }

    pub fn master_sign(&self, hash: BlockHash) -> Result<CheckpointMessage, CheckpointError> {
        let key = self
            .master_key
            .read()
            .clone()
            .ok_or(CheckpointError::NoMasterKey)?;
        if !self.engine.validate_private_key(&key) {
            return Err(KeyError::Invalid.into());
        }
        let payload = UnsignedCheckpoint::new(hash).to_bytes()?;
        let signature = self.engine.sign(&key, &payload)?;
        Ok(CheckpointMessage::signed(hash, payload, signature))
    }

    /// Operator `sendcheckpoint`: sign `hash`, process it like any received
    /// message, and relay it.
    pub fn send_checkpoint<C: ChainQuery + ?Sized>(
        &self,
        hash: BlockHash,
        chain: &C,
        relay: &dyn CheckpointRelay,
    ) -> Result<SendOutcome, CheckpointError> {
        if relay.peer_count() == 0 {
            log::debug!("No peers connected, not sending checkpoint {}", hash);
            return Ok(SendOutcome::NoPeers);
        }
        if hash.is_zero() {
            return Ok(SendOutcome::NullCheckpoint);
        }

        let message = self.master_sign(hash)?;
        match self.receive(message, chain, relay)? {
            ReceiveOutcome::Applied => Ok(SendOutcome::Sent(hash)),
            outcome => Err(CheckpointError::NotApplied { hash, outcome }),
        }
    }

    /// Periodic master task: checkpoint the block `depth` below the tip.
    pub fn auto_checkpoint<C: ChainQuery + ?Sized>(
        &self,
        chain: &C,
        depth: CheckpointDepth,
        relay: &dyn CheckpointRelay,
    ) -> Result<SendOutcome, CheckpointError> {
        let CheckpointDepth::Lag(lag) = depth else {
            return Ok(SendOutcome::Manual);
        };
        if !self.is_master() {
            return Err(CheckpointError::NoMasterKey);
        }
        let Some(hash) = Self::auto_select(chain, lag)? else {
            return Ok(SendOutcome::NullCheckpoint);
        };
        if hash == self.active() {
            return Ok(SendOutcome::Unchanged);
        }
        match self.send_checkpoint(hash, chain, relay) {
            Err(CheckpointError::NotApplied {
                outcome: ReceiveOutcome::Stale,
                ..
            }) => Ok(SendOutcome::Unchanged),
            other => other,
        }
    }

    pub fn status<C: ChainQuery + ?Sized>(&self, chain: &C) -> CheckpointStatus {
        let state = self.state.lock();
        let entry = chain.lookup(&state.active());
        let last_conflict = state.last_conflict();
        CheckpointStatus {
            active: state.active(),
            height: entry.map(|e| e.height),
            timestamp: entry.map(|e| e.timestamp),
            pending: state.pending_hash(),
            last_conflict: (!last_conflict.is_zero()).then_some(last_conflict),
            warning: state.warning().map(str::to_string),
            policy: "strict".to_string(),
            master: self.is_master(),
        }
    }

    /// Signed message for the active checkpoint, if one was received since
    /// start-up.
    pub fn current_message(&self) -> Option<CheckpointMessage> {
        let state = self.state.lock();
        let message = state.active_message();
        (!message.is_null()).then(|| message.clone())
    }

    pub fn active(&self) -> BlockHash {
        self.state.lock().active()
    }

    pub fn pending_hash(&self) -> Option<BlockHash> {
        self.state.lock().pending_hash()
    }

    pub fn last_conflict(&self) -> Option<BlockHash> {
        let hash = self.state.lock().last_conflict();
        (!hash.is_zero()).then_some(hash)
    }

    pub fn warning(&self) -> Option<String> {
        self.state.lock().warning().map(str::to_string)
    }
}
