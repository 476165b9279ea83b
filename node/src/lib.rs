pub mod p2p;
pub mod server;

pub use crate::p2p::manager::PeerManager;
pub use server::*;

use parking_lot::RwLock;
use std::sync::Arc;
use syncpoint_core::block::{BlockHash, BlockHeader};
use syncpoint_core::blockchain::{BlockIndex, ChainError, ChainQuery, IndexEntry, TipChange};
use syncpoint_core::checkpoint::{
    CheckpointDepth, CheckpointError, CheckpointMessage, PromoteOutcome, ReceiveOutcome,
    Synchronizer,
};
use syncpoint_core::db::HeaderStore;

/// Shared state of a running node.
pub struct NodeHandles {
    pub index: Arc<RwLock<BlockIndex>>,
    pub sync: Arc<Synchronizer>,
    pub p2p: Arc<PeerManager>,
    /// Accepted headers and the active tip, reloaded at startup.
    pub headers: Arc<dyn HeaderStore>,
    pub depth: CheckpointDepth,
    pub node_start_time: std::time::Instant,
}

// Lock order (when nested): index -> checkpoint state. Relaying never
// happens under the checkpoint state lock.

pub type NodeHandle = Arc<NodeHandles>;

/// Result of feeding a batch of headers into the index.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeaderReport {
    pub inserted: usize,
    pub known: usize,
    /// First header refused by the checkpoint guard; the rest of the batch is skipped.
    pub refused: Option<BlockHash>,
    /// First header whose parent is unknown; the rest of the batch is skipped.
    pub orphan: Option<BlockHash>,
    pub tip_change: Option<TipChange>,
    pub promoted: Option<BlockHash>,
}

impl NodeHandles {
    pub fn new(
        index: BlockIndex,
        sync: Synchronizer,
        headers: Arc<dyn HeaderStore>,
        depth: CheckpointDepth,
    ) -> Self {
        let p2p = Arc::new(PeerManager::new());
        p2p.set_my_height(index.height());
        Self {
            index: Arc::new(RwLock::new(index)),
            sync: Arc::new(sync),
            p2p,
            headers,
            depth,
            node_start_time: std::time::Instant::now(),
        }
    }

    /// Insert headers from a peer, move the tip to the best new header and
    /// give a pending checkpoint the chance to activate.
    pub fn accept_headers(&self, headers: &[BlockHeader]) -> Result<HeaderReport, CheckpointError> {
        let mut report = HeaderReport::default();
        let mut index = self.index.write();
        let mut best: Option<(u64, BlockHash)> = None;
        let mut accepted: Vec<BlockHeader> = Vec::new();

        for header in headers {
            let hash = header
                .hash()
                .map_err(|e| ChainError::Encode(e.to_string()))?;
            if index.lookup(&hash).is_some() {
                report.known += 1;
                continue;
            }
            if index.lookup(&header.previous_hash).is_none() {
                log::debug!("Header {} has unknown parent {}", hash, header.previous_hash);
                report.orphan = Some(hash);
                break;
            }

            let entry = IndexEntry {
                hash,
                height: header.height,
                parent: Some(header.previous_hash),
                timestamp: header.timestamp,
            };
            if !self.sync.check_against_checkpoint(&entry, &*index)? {
                log::warn!(
                    "Refusing header {} at height {}: conflicts with sync checkpoint {}",
                    hash,
                    header.height,
                    self.sync.active()
                );
                report.refused = Some(hash);
                break;
            }

            match index.insert_header(header) {
                Ok(_) => {
                    report.inserted += 1;
                    accepted.push(header.clone());
                }
                Err(ChainError::HeightMismatch { .. }) => {
                    log::warn!("Header {} has an inconsistent height", hash);
                    report.refused = Some(hash);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
            if best.is_none_or(|(h, _)| header.height > h) {
                best = Some((header.height, hash));
            }
        }

        let mut new_tip = None;
        if let Some((height, hash)) = best {
            if height > index.height() {
                let change = index.set_active_tip(&hash)?;
                log::info!("New tip {} at height {}", hash, height);
                report.tip_change = Some(change);
                self.p2p.set_my_height(height);
                new_tip = Some(hash);
            }
        }
        if !accepted.is_empty() {
            self.headers.save_headers(&accepted, new_tip.as_ref())?;
        }

        if report.tip_change.is_some() {
            if let PromoteOutcome::Promoted(hash) =
                self.sync.promote_pending(&*index, self.p2p.as_ref())?
            {
                report.promoted = Some(hash);
            }
        }
        Ok(report)
    }

    /// Process a checkpoint message received from a peer. Returns a locator
    /// to request headers with when the checkpoint block is not on our chain yet.
    pub fn accept_checkpoint(
        &self,
        message: CheckpointMessage,
    ) -> Result<(ReceiveOutcome, Option<Vec<BlockHash>>), CheckpointError> {
        let index = self.index.read();
        let outcome = self.sync.receive(message, &*index, self.p2p.as_ref())?;
        let locator = match outcome {
            ReceiveOutcome::Parked | ReceiveOutcome::Deferred => Some(index.locator()),
            _ => None,
        };
        Ok((outcome, locator))
    }

    pub fn height(&self) -> u64 {
        self.index.read().height()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use syncpoint_core::checkpoint::UnsignedCheckpoint;
    use syncpoint_core::config::{ConsensusParams, Network, REGTEST_CHECKPOINT_PUBKEY};
    use syncpoint_core::crypto::{Secp256k1Engine, SignatureEngine};
    use syncpoint_core::db::{CheckpointStore, MemoryCheckpointStore};

    pub(crate) const MASTER_KEY: &str =
        "1111111111111111111111111111111111111111111111111111111111111111";

    pub(crate) fn genesis() -> BlockHeader {
        BlockHeader {
            height: 0,
            previous_hash: BlockHash::ZERO,
            merkle_root: BlockHash::ZERO,
            timestamp: 1_700_000_000,
            nonce: 0,
        }
    }

    pub(crate) fn build_chain(from: &BlockHeader, count: usize, nonce: u64) -> Vec<BlockHeader> {
        let mut out: Vec<BlockHeader> = Vec::new();
        let mut parent = from.clone();
        for _ in 0..count {
            let next = BlockHeader {
                height: parent.height + 1,
                previous_hash: parent.hash().unwrap(),
                merkle_root: BlockHash::ZERO,
                timestamp: parent.timestamp + 120,
                nonce,
            };
            out.push(next.clone());
            parent = next;
        }
        out
    }

    pub(crate) fn node(depth: CheckpointDepth) -> NodeHandle {
        node_on(Arc::new(MemoryCheckpointStore::new()), depth)
    }

    /// Start a node the way the binary does: restore the index from `store`,
    /// then load the checkpoint state.
    fn node_on(store: Arc<MemoryCheckpointStore>, depth: CheckpointDepth) -> NodeHandle {
        let params =
            ConsensusParams::new(Network::Regtest, genesis(), REGTEST_CHECKPOINT_PUBKEY, None)
                .unwrap();
        let index = BlockIndex::restore(
            &params.genesis,
            store.read_headers().unwrap(),
            store.read_tip().unwrap(),
        )
        .unwrap();
        let sync =
            Synchronizer::open(params, store.clone(), Arc::new(Secp256k1Engine::new())).unwrap();
        sync.ensure_active_indexed(&index).unwrap();
        Arc::new(NodeHandles::new(index, sync, store, depth))
    }

    pub(crate) fn signed(hash: BlockHash) -> CheckpointMessage {
        let payload = UnsignedCheckpoint::new(hash).to_bytes().unwrap();
        let sig = Secp256k1Engine::new().sign(MASTER_KEY, &payload).unwrap();
        CheckpointMessage::unverified(payload, sig)
    }

    #[test]
    fn headers_extend_the_tip() {
        let node = node(CheckpointDepth::Manual);
        let chain = build_chain(&genesis(), 5, 1);
        let report = node.accept_headers(&chain).unwrap();
        assert_eq!(report.inserted, 5);
        assert_eq!(node.height(), 5);
        assert_eq!(node.p2p.get_my_height(), 5);

        let again = node.accept_headers(&chain).unwrap();
        assert_eq!(again.known, 5);
        assert!(again.tip_change.is_none());
    }

    #[test]
    fn orphan_headers_stop_the_batch() {
        let node = node(CheckpointDepth::Manual);
        let chain = build_chain(&genesis(), 4, 1);
        let report = node.accept_headers(&chain[2..]).unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(report.orphan, Some(chain[2].hash().unwrap()));
        assert_eq!(node.height(), 0);
    }

    #[test]
    fn parked_checkpoint_activates_when_headers_arrive() {
        let node = node(CheckpointDepth::Manual);
        let chain = build_chain(&genesis(), 10, 1);
        node.accept_headers(&chain[..6]).unwrap();

        // checkpoint for a block we do not know yet
        let h10 = chain[9].hash().unwrap();
        let (outcome, locator) = node.accept_checkpoint(signed(h10)).unwrap();
        assert_eq!(outcome, ReceiveOutcome::Deferred);
        assert!(locator.is_some());

        // index the block off-chain, then the checkpoint parks
        {
            let mut index = node.index.write();
            for h in &chain[6..] {
                index.insert_header(h).unwrap();
            }
        }
        let (outcome, _) = node.accept_checkpoint(signed(h10)).unwrap();
        assert_eq!(outcome, ReceiveOutcome::Parked);

        // a later header batch moves the tip and promotes it
        let more = build_chain(&chain[9], 1, 1);
        let report = node.accept_headers(&more).unwrap();
        assert_eq!(report.promoted, Some(h10));
        assert_eq!(node.sync.active(), h10);
        assert!(node.sync.pending_hash().is_none());
    }

    #[test]
    fn headers_below_checkpoint_are_refused() {
        let node = node(CheckpointDepth::Manual);
        let chain = build_chain(&genesis(), 10, 1);
        node.accept_headers(&chain).unwrap();
        let h8 = chain[7].hash().unwrap();
        let (outcome, _) = node.accept_checkpoint(signed(h8)).unwrap();
        assert_eq!(outcome, ReceiveOutcome::Applied);

        // a longer fork from H5 would rewrite the checkpointed H8; its first
        // header is new history below the checkpoint
        let fork = build_chain(&chain[4], 8, 2);
        let report = node.accept_headers(&fork).unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(report.refused, Some(fork[0].hash().unwrap()));
        assert_eq!(node.index.read().active_hash_at(10), Some(chain[9].hash().unwrap()));

        // a fork above the checkpoint is fine
        let shallow = build_chain(&chain[8], 3, 3);
        let report = node.accept_headers(&shallow).unwrap();
        assert_eq!(report.inserted, 3);
        assert_eq!(node.height(), 12);
    }

    #[test]
    fn restart_resumes_from_stored_headers() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let chain = build_chain(&genesis(), 10, 1);
        let h8 = chain[7].hash().unwrap();
        {
            let node = node_on(store.clone(), CheckpointDepth::Manual);
            node.accept_headers(&chain).unwrap();
            let (outcome, _) = node.accept_checkpoint(signed(h8)).unwrap();
            assert_eq!(outcome, ReceiveOutcome::Applied);
        }

        let node = node_on(store.clone(), CheckpointDepth::Manual);
        assert_eq!(node.height(), 10);
        assert_eq!(node.sync.active(), h8);
        assert_eq!(node.p2p.get_my_height(), 10);

        // a peer resending known headers plus new ones keeps syncing
        let more = build_chain(&chain[9], 2, 1);
        let mut batch = chain.clone();
        batch.extend(more);
        let report = node.accept_headers(&batch).unwrap();
        assert_eq!(report.known, 10);
        assert_eq!(report.inserted, 2);
        assert_eq!(node.height(), 12);

        // and the checkpoint guard still holds after the restart
        let fork = build_chain(&chain[4], 8, 2);
        let report = node.accept_headers(&fork).unwrap();
        assert_eq!(report.refused, Some(fork[0].hash().unwrap()));
    }

    #[test]
    fn restart_without_headers_falls_back_to_genesis() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let chain = build_chain(&genesis(), 10, 1);
        {
            let node = node_on(store.clone(), CheckpointDepth::Manual);
            node.accept_headers(&chain).unwrap();
            node.accept_checkpoint(signed(chain[7].hash().unwrap()))
                .unwrap();
        }

        // checkpoint kept, headers gone
        let fresh = Arc::new(MemoryCheckpointStore::new());
        fresh
            .write_checkpoint(&store.read_checkpoint().unwrap().unwrap())
            .unwrap();
        fresh
            .write_master_pubkey(&store.read_master_pubkey().unwrap().unwrap())
            .unwrap();

        let node = node_on(fresh, CheckpointDepth::Manual);
        assert_eq!(node.sync.active(), genesis().hash().unwrap());
        let report = node.accept_headers(&chain).unwrap();
        assert_eq!(report.inserted, 10);
        assert_eq!(node.height(), 10);
    }

    #[test]
    fn header_store_failure_is_reported() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let node = node_on(store.clone(), CheckpointDepth::Manual);
        store.fail_writes(true);
        let err = node
            .accept_headers(&build_chain(&genesis(), 2, 1))
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Store(_)));
    }
}
