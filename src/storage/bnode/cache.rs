use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::NodeId;

/// Buffer holding one bnode's bytes in memory.
#[derive(Debug)]
pub struct CachedChunk {
    id: NodeId,
    data: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
}

impl CachedChunk {
    pub fn new(id: NodeId, buf: Vec<u8>) -> Self {
        Self {
            id,
            data: RwLock::new(buf.into_boxed_slice()),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}

/// Per-tree page cache.
///
/// Dirty chunks stay resident until the sync pass writes them; clean chunks
/// nobody references are evicted in LRU order beyond `capacity`.
pub struct ChunkCache {
    capacity: usize,
    entries: Mutex<LruCache<NodeId, Arc<CachedChunk>>>,
}

impl ChunkCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(LruCache::unbounded()),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<CachedChunk>> {
        self.entries.lock().get(&id).cloned()
    }

    /// Inserts or replaces the chunk for its id.
    pub fn insert(&self, chunk: Arc<CachedChunk>) {
        self.entries.lock().put(chunk.id(), chunk);
    }

    pub fn remove(&self, id: NodeId) -> Option<Arc<CachedChunk>> {
        self.entries.lock().pop(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dirty chunks in id order.
    pub fn dirty(&self) -> Vec<Arc<CachedChunk>> {
        let mut out: Vec<_> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, c)| c.is_dirty())
            .map(|(_, c)| Arc::clone(c))
            .collect();
        out.sort_by_key(|c| c.id());
        out
    }

    /// Evicts clean, unreferenced chunks until the cache fits its capacity.
    ///
    /// Returns the number evicted.
    pub fn shrink(&self) -> usize {
        let mut entries = self.entries.lock();
        let excess = entries.len().saturating_sub(self.capacity);
        if excess == 0 {
            return 0;
        }
        let victims: Vec<NodeId> = entries
            .iter()
            .rev()
            .filter(|(_, c)| !c.is_dirty() && Arc::strong_count(c) == 1)
            .map(|(id, _)| *id)
            .take(excess)
            .collect();
        for id in &victims {
            entries.pop(id);
        }
        victims.len()
    }
}
