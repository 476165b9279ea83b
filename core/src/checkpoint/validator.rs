// Descendant-consistency checks shared by checkpoint messages and ordinary blocks
use super::CheckpointError;
use crate::block::BlockHash;
use crate::blockchain::{ChainError, ChainQuery, IndexEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// Candidate descends from the current checkpoint.
    Accept,
    /// Candidate is not newer and already on the active chain.
    Stale,
    /// Candidate does not descend from the current checkpoint.
    Conflict,
}

/// Decide whether `candidate` may replace `current` as the accepted
/// checkpoint.
///
/// Both hashes must be indexed. A candidate at or below the current height
/// is `Stale` when the active chain holds it (this covers resubmission of
/// `current` itself) and `Conflict` otherwise. A higher candidate is walked
/// back to the current height; it is accepted only if that ancestor is
/// `current`.
pub fn validate<C: ChainQuery + ?Sized>(
    current: BlockHash,
    candidate: BlockHash,
    chain: &C,
) -> Result<Validation, CheckpointError> {
    let cur = chain
        .lookup(&current)
        .ok_or(CheckpointError::MissingIndex(current))?;
    let cand = chain
        .lookup(&candidate)
        .ok_or(CheckpointError::MissingIndex(candidate))?;

    if cand.height <= cur.height {
        if chain.contains(cand) {
            return Ok(Validation::Stale);
        }
        return Ok(Validation::Conflict);
    }

    let ancestor = chain.ancestor(cand, cur.height)?;
    if ancestor.hash == cur.hash {
        Ok(Validation::Accept)
    } else {
        Ok(Validation::Conflict)
    }
}

/// Whether `block` may join the index given the accepted `checkpoint`.
///
/// `block` need not be indexed yet; its parent must be. Blocks above the
/// checkpoint must fork from the active chain at or above the checkpoint
/// height. A block at the checkpoint height must be the checkpoint itself,
/// and blocks below it are only allowed if already known.
pub fn check_block<C: ChainQuery + ?Sized>(
    checkpoint: BlockHash,
    block: &IndexEntry,
    chain: &C,
) -> Result<bool, CheckpointError> {
    if block.height == 0 || checkpoint.is_zero() {
        return Ok(true);
    }

    let sync = chain
        .lookup(&checkpoint)
        .ok_or(CheckpointError::MissingIndex(checkpoint))?;
    if !chain.contains(sync) {
        return Err(CheckpointError::InactiveCheckpoint(checkpoint));
    }

    if block.height > sync.height {
        let parent_hash = block.parent.ok_or(ChainError::BrokenLink {
            hash: block.hash,
            height: block.height,
        })?;
        let mut cursor = chain.lookup(&parent_hash).ok_or(ChainError::MissingParent {
            hash: block.hash,
            parent: parent_hash,
        })?;
        // walk down to the fork point with the active chain
        while cursor.height > sync.height && !chain.contains(cursor) {
            let broken = ChainError::BrokenLink {
                hash: cursor.hash,
                height: cursor.height,
            };
            cursor = cursor
                .parent
                .and_then(|p| chain.lookup(&p))
                .ok_or(broken)?;
        }
        return Ok(cursor.height >= sync.height && chain.contains(cursor));
    }

    if block.height == sync.height {
        return Ok(block.hash == sync.hash);
    }

    Ok(chain.lookup(&block.hash).is_some())
}
