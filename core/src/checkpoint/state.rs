use super::message::CheckpointMessage;
use super::validator::{Validation, validate};
use super::CheckpointError;
use crate::block::BlockHash;
use crate::blockchain::ChainQuery;

/// Accepted, pending and last conflicting checkpoint. Owned by the
/// `Synchronizer` behind its mutex.
#[derive(Debug, Clone, Default)]
pub struct CheckpointState {
    active: BlockHash,
    active_message: CheckpointMessage,
    pending: Option<CheckpointMessage>,
    last_conflict: BlockHash,
    warning: Option<String>,
}

impl CheckpointState {
    pub fn new(active: BlockHash) -> Self {
        Self {
            active,
            ..Self::default()
        }
    }

    pub fn active(&self) -> BlockHash {
        self.active
    }

    /// Signed message for the active checkpoint. Null after a reset or a
    /// restart, until the next checkpoint is received.
    pub fn active_message(&self) -> &CheckpointMessage {
        &self.active_message
    }

    pub fn pending(&self) -> Option<&CheckpointMessage> {
        self.pending.as_ref()
    }

    pub fn pending_hash(&self) -> Option<BlockHash> {
        self.pending.as_ref().map(|m| m.hash())
    }

    pub fn last_conflict(&self) -> BlockHash {
        self.last_conflict
    }

    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    /// Validate `candidate` against the active checkpoint, recording it
    /// when it conflicts.
    pub fn validate<C: ChainQuery + ?Sized>(
        &mut self,
        candidate: BlockHash,
        chain: &C,
    ) -> Result<Validation, CheckpointError> {
        let verdict = validate(self.active, candidate, chain)?;
        if verdict == Validation::Conflict {
            self.record_conflict(candidate);
        }
        Ok(verdict)
    }

    pub fn record_conflict(&mut self, candidate: BlockHash) {
        self.last_conflict = candidate;
        let text = format!(
            "checkpoint {} conflicts with accepted checkpoint {}; the master key may be \
             compromised or misused, investigate before trusting new checkpoints",
            candidate, self.active
        );
        log::error!("{}", text);
        self.warning = Some(text);
    }

    /// Install a new active checkpoint. Any pending checkpoint is dropped.
    pub fn set_active(&mut self, hash: BlockHash, message: CheckpointMessage) {
        self.active = hash;
        self.active_message = message;
        self.pending = None;
    }

    pub fn set_pending(&mut self, message: CheckpointMessage) {
        self.pending = Some(message);
    }

    pub fn clear_pending(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::BlockIndex;
    use crate::blockchain::tests::{extend, genesis};

    #[test]
    fn conflict_is_recorded_with_warning() {
        let g = genesis();
        let mut index = BlockIndex::with_genesis(&g).unwrap();
        let main = extend(&mut index, &g, 10, 1);
        let fork = extend(&mut index, &main[8], 1, 2);
        index.set_active_tip(&main[9].hash().unwrap()).unwrap();

        let h10 = main[9].hash().unwrap();
        let rival = fork[0].hash().unwrap();
        let mut state = CheckpointState::new(h10);
        assert_eq!(state.validate(rival, &index).unwrap(), Validation::Conflict);
        assert_eq!(state.last_conflict(), rival);
        let warning = state.warning().unwrap();
        assert!(warning.contains(&rival.to_string()));
        assert_eq!(state.active(), h10);

        // a later stale candidate leaves the record alone
        assert_eq!(state.validate(h10, &index).unwrap(), Validation::Stale);
        assert_eq!(state.last_conflict(), rival);
        assert!(state.warning().is_some());
    }

    #[test]
    fn set_active_clears_pending() {
        let mut state = CheckpointState::default();
        assert!(state.active().is_zero());
        assert!(state.active_message().is_null());

        let msg = CheckpointMessage::signed(BlockHash([4; 32]), vec![1], vec![2]);
        state.set_pending(msg.clone());
        assert_eq!(state.pending_hash(), Some(BlockHash([4; 32])));

        state.set_active(msg.hash(), msg.clone());
        assert_eq!(state.active(), BlockHash([4; 32]));
        assert_eq!(state.active_message(), &msg);
        assert!(state.pending().is_none());
        assert!(state.last_conflict().is_zero());
    }
}
