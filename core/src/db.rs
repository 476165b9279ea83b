use crate::block::{BlockHash, BlockHeader};
use parking_lot::Mutex;
use rocksdb::{DB, Direction, IteratorMode, Options, WriteBatch, WriteOptions};
use std::collections::HashMap;
use std::path::Path;

const KEY_SYNC_CHECKPOINT: &[u8] = b"checkpoint:sync";
const KEY_MASTER_PUBKEY: &[u8] = b"checkpoint:pubkey";
const KEY_BEST_TIP: &[u8] = b"chain:tip";
const HEADER_PREFIX: &[u8] = b"h:";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("rocksdb: {0}")]
    Rocks(#[from] rocksdb::Error),
    #[error("corrupt value under {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("write rejected: {0}")]
    WriteFailed(String),
    #[error("header encoding: {0}")]
    Encode(String),
}

/// Durable record of the accepted checkpoint and the master public key it
/// was accepted under.
pub trait CheckpointStore: Send + Sync {
    fn read_checkpoint(&self) -> Result<Option<BlockHash>, StoreError>;

    fn write_checkpoint(&self, hash: &BlockHash) -> Result<(), StoreError>;

    fn read_master_pubkey(&self) -> Result<Option<String>, StoreError>;

    fn write_master_pubkey(&self, pubkey: &str) -> Result<(), StoreError>;

    /// Force everything written so far onto disk.
    fn flush(&self) -> Result<(), StoreError>;
}

/// Indexed headers and the active tip, so the block index can be rebuilt
/// after a restart.
pub trait HeaderStore: Send + Sync {
    /// Append `headers` and, when given, record `tip` as the active tip.
    fn save_headers(&self, headers: &[BlockHeader], tip: Option<&BlockHash>)
    -> Result<(), StoreError>;

    /// Every stored header, in no particular order.
    fn read_headers(&self) -> Result<Vec<BlockHeader>, StoreError>;

    fn read_tip(&self) -> Result<Option<BlockHash>, StoreError>;
}

fn header_key(hash: &BlockHash) -> Vec<u8> {
    let mut key = HEADER_PREFIX.to_vec();
    key.extend_from_slice(hash.as_bytes());
    key
}

fn hash_for_store(header: &BlockHeader) -> Result<BlockHash, StoreError> {
    header.hash().map_err(|e| StoreError::Encode(e.to_string()))
}

fn decode_hash(key: &[u8], raw: &[u8]) -> Result<BlockHash, StoreError> {
    let bytes: [u8; 32] = raw.try_into().map_err(|_| StoreError::Corrupt {
        key: String::from_utf8_lossy(key).into_owned(),
        reason: format!("expected 32 bytes, found {}", raw.len()),
    })?;
    Ok(BlockHash(bytes))
}

pub fn open_db(path: impl AsRef<Path>) -> Result<DB, StoreError> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    Ok(DB::open(&opts, path)?)
}

/// Single-key put with a synced WAL write.
pub fn put_synced(db: &DB, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
    let mut wo = WriteOptions::default();
    wo.set_sync(true);
    db.put_opt(key, value, &wo)?;
    Ok(())
}

pub struct RocksCheckpointStore {
    db: DB,
}

impl RocksCheckpointStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = open_db(path)?;
        Ok(Self { db })
    }
}

impl CheckpointStore for RocksCheckpointStore {
    fn read_checkpoint(&self) -> Result<Option<BlockHash>, StoreError> {
        self.db
            .get(KEY_SYNC_CHECKPOINT)?
            .map(|raw| decode_hash(KEY_SYNC_CHECKPOINT, &raw))
            .transpose()
    }

    fn write_checkpoint(&self, hash: &BlockHash) -> Result<(), StoreError> {
        put_synced(&self.db, KEY_SYNC_CHECKPOINT, hash.as_bytes())
    }

    fn read_master_pubkey(&self) -> Result<Option<String>, StoreError> {
        match self.db.get(KEY_MASTER_PUBKEY)? {
            None => Ok(None),
            Some(raw) => String::from_utf8(raw)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key: String::from_utf8_lossy(KEY_MASTER_PUBKEY).into_owned(),
                    reason: e.to_string(),
                }),
        }
    }

    fn write_master_pubkey(&self, pubkey: &str) -> Result<(), StoreError> {
        put_synced(&self.db, KEY_MASTER_PUBKEY, pubkey.as_bytes())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl HeaderStore for RocksCheckpointStore {
    fn save_headers(
        &self,
        headers: &[BlockHeader],
        tip: Option<&BlockHash>,
    ) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for header in headers {
            let hash = hash_for_store(header)?;
            let value = bincode::encode_to_vec(header, bincode::config::standard())
                .map_err(|e| StoreError::Encode(e.to_string()))?;
            batch.put(header_key(&hash), value);
        }
        if let Some(tip) = tip {
            batch.put(KEY_BEST_TIP, tip.as_bytes());
        }
        let mut wo = WriteOptions::default();
        wo.set_sync(true);
        self.db.write_opt(batch, &wo)?;
        Ok(())
    }

    fn read_headers(&self) -> Result<Vec<BlockHeader>, StoreError> {
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(HEADER_PREFIX, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(HEADER_PREFIX) {
                break;
            }
            let (header, _): (BlockHeader, usize) =
                bincode::decode_from_slice(&value, bincode::config::standard()).map_err(|e| {
                    StoreError::Corrupt {
                        key: hex::encode(&key[HEADER_PREFIX.len()..]),
                        reason: e.to_string(),
                    }
                })?;
            out.push(header);
        }
        Ok(out)
    }

    fn read_tip(&self) -> Result<Option<BlockHash>, StoreError> {
        self.db
            .get(KEY_BEST_TIP)?
            .map(|raw| decode_hash(KEY_BEST_TIP, &raw))
            .transpose()
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    checkpoint: Option<BlockHash>,
    pubkey: Option<String>,
    headers: HashMap<BlockHash, BlockHeader>,
    tip: Option<BlockHash>,
    flushes: usize,
    fail_writes: bool,
}

/// Non-durable store for ephemeral nodes and tests. Writes can be made to
/// fail on demand.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    pub fn flush_count(&self) -> usize {
        self.inner.lock().flushes
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn read_checkpoint(&self) -> Result<Option<BlockHash>, StoreError> {
        Ok(self.inner.lock().checkpoint)
    }

    fn write_checkpoint(&self, hash: &BlockHash) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.fail_writes {
            return Err(StoreError::WriteFailed(format!("checkpoint {}", hash)));
        }
        inner.checkpoint = Some(*hash);
        Ok(())
    }

    fn read_master_pubkey(&self) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().pubkey.clone())
    }

    fn write_master_pubkey(&self, pubkey: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.fail_writes {
            return Err(StoreError::WriteFailed("master pubkey".to_string()));
        }
        inner.pubkey = Some(pubkey.to_string());
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.inner.lock().flushes += 1;
        Ok(())
    }
}

impl HeaderStore for MemoryCheckpointStore {
    fn save_headers(
        &self,
        headers: &[BlockHeader],
        tip: Option<&BlockHash>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.fail_writes {
            return Err(StoreError::WriteFailed(format!("{} headers", headers.len())));
        }
        for header in headers {
            inner.headers.insert(hash_for_store(header)?, header.clone());
        }
        if let Some(tip) = tip {
            inner.tip = Some(*tip);
        }
        Ok(())
    }

    fn read_headers(&self) -> Result<Vec<BlockHeader>, StoreError> {
        Ok(self.inner.lock().headers.values().cloned().collect())
    }

    fn read_tip(&self) -> Result<Option<BlockHash>, StoreError> {
        Ok(self.inner.lock().tip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(count: u64) -> Vec<BlockHeader> {
        let mut out: Vec<BlockHeader> = Vec::new();
        let mut previous_hash = BlockHash::ZERO;
        for height in 1..=count {
            let header = BlockHeader {
                height,
                previous_hash,
                merkle_root: BlockHash::ZERO,
                timestamp: 1_700_000_000 + height as i64,
                nonce: 1,
            };
            previous_hash = header.hash().unwrap();
            out.push(header);
        }
        out
    }

    #[test]
    fn rocks_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let hash = BlockHash([0x42; 32]);
        {
            let store = RocksCheckpointStore::open(dir.path()).unwrap();
            assert_eq!(store.read_checkpoint().unwrap(), None);
            assert_eq!(store.read_master_pubkey().unwrap(), None);
            store.write_checkpoint(&hash).unwrap();
            store.write_master_pubkey("02abcdef").unwrap();
            store.flush().unwrap();
        }
        let store = RocksCheckpointStore::open(dir.path()).unwrap();
        assert_eq!(store.read_checkpoint().unwrap(), Some(hash));
        assert_eq!(store.read_master_pubkey().unwrap().as_deref(), Some("02abcdef"));
    }

    #[test]
    fn rocks_store_rejects_corrupt_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksCheckpointStore::open(dir.path()).unwrap();
        store.db.put(KEY_SYNC_CHECKPOINT, b"short").unwrap();
        assert!(matches!(
            store.read_checkpoint(),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn memory_store_fault_injection() {
        let store = MemoryCheckpointStore::new();
        store.write_checkpoint(&BlockHash([1; 32])).unwrap();
        store.fail_writes(true);
        assert!(store.write_checkpoint(&BlockHash([2; 32])).is_err());
        assert!(store.write_master_pubkey("02aa").is_err());
        assert_eq!(store.read_checkpoint().unwrap(), Some(BlockHash([1; 32])));
        store.flush().unwrap();
        assert_eq!(store.flush_count(), 1);
    }

    #[test]
    fn rocks_headers_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let chain = headers(5);
        let tip = chain[4].hash().unwrap();
        {
            let store = RocksCheckpointStore::open(dir.path()).unwrap();
            assert!(store.read_headers().unwrap().is_empty());
            assert_eq!(store.read_tip().unwrap(), None);
            store.save_headers(&chain[..3], None).unwrap();
            store.save_headers(&chain[3..], Some(&tip)).unwrap();
            store.write_checkpoint(&tip).unwrap();
        }
        let store = RocksCheckpointStore::open(dir.path()).unwrap();
        let mut loaded = store.read_headers().unwrap();
        loaded.sort_by_key(|h| h.height);
        assert_eq!(loaded, chain);
        assert_eq!(store.read_tip().unwrap(), Some(tip));
        assert_eq!(store.read_checkpoint().unwrap(), Some(tip));
    }

    #[test]
    fn memory_header_writes_can_fail() {
        let store = MemoryCheckpointStore::new();
        let chain = headers(2);
        store.save_headers(&chain[..1], None).unwrap();
        store.fail_writes(true);
        assert!(store.save_headers(&chain[1..], None).is_err());
        assert_eq!(store.read_headers().unwrap(), chain[..1].to_vec());
        assert_eq!(store.read_tip().unwrap(), None);
    }
}
