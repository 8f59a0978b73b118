use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::StorageError;
use crate::message::{HardState, LogEntry, SnapshotMeta};
use crate::topology::Topology;
use crate::traits::{
    HardStateStorage, LogEntryStorage, SnapshotMetaStorage, Storage, StorageResult,
    TopologyStorage,
};

struct MemoryLog {
    /// Index of the entry just before `entries[0]`; everything up to it was compacted.
    offset: u64,
    entries: Vec<LogEntry>,
}

impl MemoryLog {
    fn last_index(&self) -> u64 {
        self.offset + self.entries.len() as u64
    }

    fn position(&self, idx: u64) -> Option<usize> {
        if idx <= self.offset || idx > self.last_index() {
            None
        } else {
            Some((idx - self.offset - 1) as usize)
        }
    }
}

struct MemoryStorageInner {
    hard_state: RwLock<Option<HardState>>,
    log: RwLock<MemoryLog>,
    snapshot_meta: RwLock<Option<SnapshotMeta>>,
    topology: RwLock<Option<Topology>>,
}

/// 内存存储实现（用于测试和单机场景）
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<MemoryStorageInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryStorageInner {
                hard_state: RwLock::new(None),
                log: RwLock::new(MemoryLog {
                    offset: 0,
                    entries: Vec::new(),
                }),
                snapshot_meta: RwLock::new(None),
                topology: RwLock::new(None),
            }),
        }
    }

    /// Number of entries currently held, compacted ones excluded.
    pub fn log_len(&self) -> usize {
        self.inner.log.read().entries.len()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HardStateStorage for MemoryStorage {
    async fn save_hard_state(&self, hard_state: HardState) -> StorageResult<()> {
        *self.inner.hard_state.write() = Some(hard_state);
        Ok(())
    }

    async fn load_hard_state(&self) -> StorageResult<Option<HardState>> {
        Ok(self.inner.hard_state.read().clone())
    }
}

#[async_trait]
impl LogEntryStorage for MemoryStorage {
    async fn append_log_entries(&self, entries: &[LogEntry]) -> StorageResult<()> {
        let mut log = self.inner.log.write();
        let Some(first) = entries.first() else {
            return Ok(());
        };
        // Compaction and snapshot installs move the offset; appends only ever extend the log.
        let mut expected = log.last_index() + 1;
        if first.index != expected {
            return Err(StorageError::Consistency(format!(
                "append expected index {}, got {}",
                expected, first.index
            )));
        }
        for entry in entries {
            if entry.index != expected {
                return Err(StorageError::Consistency(format!(
                    "append expected index {}, got {}",
                    expected, entry.index
                )));
            }
            expected += 1;
        }
        log.entries.extend_from_slice(entries);
        Ok(())
    }

    async fn get_log_entries(&self, low: u64, high: u64) -> StorageResult<Vec<LogEntry>> {
        let log = self.inner.log.read();
        if low >= high {
            return Ok(Vec::new());
        }
        if low <= log.offset {
            return Err(StorageError::LogCompacted(low));
        }
        let Some(start) = log.position(low) else {
            return Err(StorageError::LogNotFound(low));
        };
        let end = high.min(log.last_index() + 1);
        let end = (end - log.offset - 1) as usize;
        Ok(log.entries[start..end].to_vec())
    }

    async fn truncate_log_suffix(&self, idx: u64) -> StorageResult<()> {
        let mut log = self.inner.log.write();
        if idx <= log.offset {
            log.entries.clear();
        } else if let Some(pos) = log.position(idx) {
            log.entries.truncate(pos);
        }
        Ok(())
    }

    async fn truncate_log_prefix(&self, idx: u64) -> StorageResult<()> {
        let mut log = self.inner.log.write();
        if idx <= log.offset {
            return Ok(());
        }
        if idx >= log.last_index() {
            log.entries.clear();
        } else if let Some(pos) = log.position(idx) {
            log.entries.drain(..=pos);
        }
        log.offset = idx;
        Ok(())
    }

    async fn get_last_log_index(&self) -> StorageResult<(u64, u64)> {
        let log = self.inner.log.read();
        Ok(log
            .entries
            .last()
            .map(|e| (e.index, e.term))
            .unwrap_or((0, 0)))
    }

    async fn get_log_term(&self, idx: u64) -> StorageResult<u64> {
        if idx == 0 {
            return Ok(0);
        }
        let log = self.inner.log.read();
        if idx <= log.offset {
            return Err(StorageError::LogCompacted(idx));
        }
        log.position(idx)
            .map(|pos| log.entries[pos].term)
            .ok_or(StorageError::LogNotFound(idx))
    }
}

#[async_trait]
impl SnapshotMetaStorage for MemoryStorage {
    async fn save_snapshot_meta(&self, meta: SnapshotMeta) -> StorageResult<()> {
        *self.inner.snapshot_meta.write() = Some(meta);
        Ok(())
    }

    async fn load_snapshot_meta(&self) -> StorageResult<Option<SnapshotMeta>> {
        Ok(self.inner.snapshot_meta.read().clone())
    }
}

#[async_trait]
impl TopologyStorage for MemoryStorage {
    async fn save_topology(&self, topology: &Topology) -> StorageResult<()> {
        *self.inner.topology.write() = Some(topology.clone());
        Ok(())
    }

    async fn load_topology(&self) -> StorageResult<Option<Topology>> {
        Ok(self.inner.topology.read().clone())
    }
}

impl Storage for MemoryStorage {}
