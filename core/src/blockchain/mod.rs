use crate::block::{BlockHash, BlockHeader, compute_header_hash};
use log;
use std::collections::HashMap;

/// Maximum headers handed out per `headers_after` call.
pub const MAX_HEADERS_RESULTS: usize = 2000;

/// One node of the block index. The parent is stored as a key into the
/// index, never as a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub hash: BlockHash,
    pub height: u64,
    pub parent: Option<BlockHash>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("block {0} is not in the index")]
    UnknownBlock(BlockHash),
    #[error("parent {parent} of block {hash} is not in the index")]
    MissingParent { hash: BlockHash, parent: BlockHash },
    #[error("block {hash} claims height {height} but its parent is at height {parent_height}")]
    HeightMismatch {
        hash: BlockHash,
        height: u64,
        parent_height: u64,
    },
    #[error("block index structure failure below {hash} at height {height}")]
    BrokenLink { hash: BlockHash, height: u64 },
    #[error("genesis header must have height 0, got {0}")]
    BadGenesis(u64),
    #[error("failed to hash header: {0}")]
    Encode(String),
}

/// Read-only view of the block index and the active chain.
pub trait ChainQuery {
    /// Index entry for `hash`, if the block is known.
    fn lookup(&self, hash: &BlockHash) -> Option<&IndexEntry>;

    /// Whether `entry` lies on the active chain.
    fn contains(&self, entry: &IndexEntry) -> bool;

    /// Tip of the active chain.
    fn tip(&self) -> Option<&IndexEntry>;

    /// Walk parent links from `entry` down to `height`.
    ///
    /// Returns `entry` itself when it is already at or below `height`. A
    /// missing parent or a parent at the wrong height means the index is
    /// corrupt and yields [`ChainError::BrokenLink`].
    fn ancestor<'a>(
        &'a self,
        entry: &'a IndexEntry,
        height: u64,
    ) -> Result<&'a IndexEntry, ChainError> {
        let mut current = entry;
        while current.height > height {
            let broken = ChainError::BrokenLink {
                hash: current.hash,
                height: current.height,
            };
            let parent_hash = current.parent.ok_or_else(|| broken.clone())?;
            let parent = self.lookup(&parent_hash).ok_or_else(|| broken.clone())?;
            if parent.height + 1 != current.height {
                return Err(broken);
            }
            current = parent;
        }
        Ok(current)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(BlockHash),
    AlreadyKnown(BlockHash),
}

impl InsertOutcome {
    pub fn hash(&self) -> BlockHash {
        match self {
            InsertOutcome::Inserted(h) | InsertOutcome::AlreadyKnown(h) => *h,
        }
    }
}

/// Result of moving the active tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipChange {
    pub fork_height: u64,
    pub disconnected: usize,
    pub connected: usize,
}

/// In-memory block index: an arena of entries keyed by hash plus the active
/// chain as a height-indexed list of hashes.
#[derive(Debug)]
pub struct BlockIndex {
    entries: HashMap<BlockHash, IndexEntry>,
    headers: HashMap<BlockHash, BlockHeader>,
    active: Vec<BlockHash>,
}

fn hash_header(header: &BlockHeader) -> Result<BlockHash, ChainError> {
    compute_header_hash(header).map_err(|e| ChainError::Encode(e.to_string()))
}

impl BlockIndex {
    pub fn with_genesis(genesis: &BlockHeader) -> Result<Self, ChainError> {
        if genesis.height != 0 {
            return Err(ChainError::BadGenesis(genesis.height));
        }
        let hash = hash_header(genesis)?;
        let entry = IndexEntry {
            hash,
            height: 0,
            parent: None,
            timestamp: genesis.timestamp,
        };

        let mut entries = HashMap::new();
        entries.insert(hash, entry);
        let mut headers = HashMap::new();
        headers.insert(hash, genesis.clone());

        log::info!("Block index initialized with genesis {}", hash);

        Ok(BlockIndex {
            entries,
            headers,
            active: vec![hash],
        })
    }

    /// Rebuild the index from stored headers and move to the stored tip.
    ///
    /// Headers whose ancestry is incomplete are skipped. A stored tip that is
    /// not among the restored headers leaves the active chain at the highest
    /// restored header instead.
    pub fn restore(
        genesis: &BlockHeader,
        mut headers: Vec<BlockHeader>,
        tip: Option<BlockHash>,
    ) -> Result<Self, ChainError> {
        let mut index = Self::with_genesis(genesis)?;
        headers.sort_by_key(|h| h.height);

        let mut best: Option<(u64, BlockHash)> = None;
        for header in headers.iter().filter(|h| h.height > 0) {
            match index.insert_header(header) {
                Ok(outcome) => {
                    if best.is_none_or(|(height, _)| header.height > height) {
                        best = Some((header.height, outcome.hash()));
                    }
                }
                Err(ChainError::MissingParent { hash, parent }) => {
                    log::warn!("Skipping stored header {}: parent {} not restored", hash, parent);
                }
                Err(e) => return Err(e),
            }
        }

        let target = match tip {
            Some(hash) if index.entries.contains_key(&hash) => Some(hash),
            Some(hash) => {
                log::warn!("Stored tip {} was not restored", hash);
                best.map(|(_, h)| h)
            }
            None => best.map(|(_, h)| h),
        };
        if let Some(hash) = target {
            index.set_active_tip(&hash)?;
        }
        log::info!(
            "Block index restored: {} headers, height {}",
            index.len(),
            index.height()
        );
        Ok(index)
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.active[0]
    }

    /// Height of the active tip.
    pub fn height(&self) -> u64 {
        (self.active.len() - 1) as u64
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn header(&self, hash: &BlockHash) -> Option<&BlockHeader> {
        self.headers.get(hash)
    }

    pub fn active_hash_at(&self, height: u64) -> Option<BlockHash> {
        self.active.get(height as usize).copied()
    }

    /// Add a header whose parent is already indexed. Does not touch the
    /// active chain.
    pub fn insert_header(&mut self, header: &BlockHeader) -> Result<InsertOutcome, ChainError> {
        let hash = hash_header(header)?;
        if self.entries.contains_key(&hash) {
            return Ok(InsertOutcome::AlreadyKnown(hash));
        }
        if header.height == 0 {
            return Err(ChainError::MissingParent {
                hash,
                parent: header.previous_hash,
            });
        }

        let parent = self
            .entries
            .get(&header.previous_hash)
            .ok_or(ChainError::MissingParent {
                hash,
                parent: header.previous_hash,
            })?;
        if parent.height + 1 != header.height {
            return Err(ChainError::HeightMismatch {
                hash,
                height: header.height,
                parent_height: parent.height,
            });
        }

        self.entries.insert(
            hash,
            IndexEntry {
                hash,
                height: header.height,
                parent: Some(header.previous_hash),
                timestamp: header.timestamp,
            },
        );
        self.headers.insert(hash, header.clone());
        Ok(InsertOutcome::Inserted(hash))
    }

    /// Make `hash` the active tip, rewinding to the fork point with the
    /// current active chain and connecting the new branch.
    pub fn set_active_tip(&mut self, hash: &BlockHash) -> Result<TipChange, ChainError> {
        let mut entry = self
            .entries
            .get(hash)
            .ok_or(ChainError::UnknownBlock(*hash))?;

        let mut branch = Vec::new();
        while !self.contains(entry) {
            branch.push(entry.hash);
            let parent = entry.parent.ok_or(ChainError::BrokenLink {
                hash: entry.hash,
                height: entry.height,
            })?;
            entry = self.entries.get(&parent).ok_or(ChainError::BrokenLink {
                hash: entry.hash,
                height: entry.height,
            })?;
        }

        let fork_height = entry.height;
        let disconnected = self.active.len() - (fork_height as usize + 1);
        let connected = branch.len();

        self.active.truncate(fork_height as usize + 1);
        self.active.extend(branch.into_iter().rev());

        if disconnected > 0 {
            log::warn!(
                "Active chain reorganized at height {}: {} disconnected, {} connected",
                fork_height,
                disconnected,
                connected
            );
        }

        Ok(TipChange {
            fork_height,
            disconnected,
            connected,
        })
    }

    /// Active-chain headers following the highest locator hash found on the
    /// active chain (or following genesis when none match).
    pub fn headers_after(&self, locator: &[BlockHash], limit: usize) -> Vec<BlockHeader> {
        let start = locator
            .iter()
            .filter_map(|h| self.entries.get(h))
            .filter(|e| self.contains(e))
            .map(|e| e.height + 1)
            .max()
            .unwrap_or(1);

        self.active
            .iter()
            .skip(start as usize)
            .take(limit.min(MAX_HEADERS_RESULTS))
            .filter_map(|h| self.headers.get(h).cloned())
            .collect()
    }

    /// A locator for header sync: recent active hashes, densest near the tip.
    pub fn locator(&self) -> Vec<BlockHash> {
        let mut out = Vec::new();
        let mut height = self.height() as i64;
        let mut step = 1i64;
        while height >= 0 {
            out.push(self.active[height as usize]);
            if out.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        if out.last() != Some(&self.active[0]) {
            out.push(self.active[0]);
        }
        out
    }
}

impl ChainQuery for BlockIndex {
    fn lookup(&self, hash: &BlockHash) -> Option<&IndexEntry> {
        self.entries.get(hash)
    }

    fn contains(&self, entry: &IndexEntry) -> bool {
        self.active.get(entry.height as usize) == Some(&entry.hash)
    }

    fn tip(&self) -> Option<&IndexEntry> {
        self.active.last().and_then(|h| self.entries.get(h))
    }
}
