#![forbid(unsafe_code)]

//! Bnode cache.
//!
//! A bnode is one B-tree node spanning `blocks_per_node` logical blocks of a
//! tree special file. Handles are reference counted: the per-tree hash table
//! holds weak entries, so the last handle dropped removes the node from the
//! table while its chunk stays in the chunk cache. Concurrent lookups of a
//! node being read from disk wait for the first reader to publish it.

mod cache;
mod header;
mod idmap;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::storage::MetaContext;
use crate::types::checksum::verify_crc32;
use crate::types::{NodeId, Result, SpecialFile, VdfsError, Version};

pub use cache::{CachedChunk, ChunkCache};
pub use header::{
    stamp_version, version_of, HeadHeader, NodeHeader, NodeKind, BNODE_MAGIC, HEAD_BITMAP_OFFSET,
    HEAD_MAGIC, NODE_HDR_LEN,
};
pub use idmap::FreeIdBitmap;

/// Access mode of a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BnodeMode {
    ReadOnly,
    ReadWrite,
}

enum FaultState {
    Loading,
    Ready(Arc<CachedChunk>),
    Failed(VdfsError),
}

/// Hash-table resident node. Dropping the last handle unhashes it.
pub struct Bnode {
    id: NodeId,
    store: Arc<NodeStore>,
    state: Mutex<FaultState>,
    ready: Condvar,
}

impl Bnode {
    fn loading(store: Arc<NodeStore>, id: NodeId) -> Self {
        Self {
            id,
            store,
            state: Mutex::new(FaultState::Loading),
            ready: Condvar::new(),
        }
    }

    fn ready(store: Arc<NodeStore>, id: NodeId, chunk: Arc<CachedChunk>) -> Self {
        Self {
            id,
            store,
            state: Mutex::new(FaultState::Ready(chunk)),
            ready: Condvar::new(),
        }
    }

    fn publish(&self, result: Result<Arc<CachedChunk>>) -> Result<Arc<CachedChunk>> {
        let mut state = self.state.lock();
        let out = match result {
            Ok(chunk) => {
                *state = FaultState::Ready(Arc::clone(&chunk));
                Ok(chunk)
            }
            Err(err) => {
                *state = FaultState::Failed(err.duplicate());
                Err(err)
            }
        };
        drop(state);
        self.ready.notify_all();
        out
    }

    fn wait_ready(&self) -> Result<Arc<CachedChunk>> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                FaultState::Ready(chunk) => return Ok(Arc::clone(chunk)),
                FaultState::Failed(err) => return Err(err.duplicate()),
                FaultState::Loading => self.ready.wait(&mut state),
            }
        }
    }

    fn try_ready(&self) -> Option<Result<Arc<CachedChunk>>> {
        match &*self.state.lock() {
            FaultState::Ready(chunk) => Some(Ok(Arc::clone(chunk))),
            FaultState::Failed(err) => Some(Err(err.duplicate())),
            FaultState::Loading => None,
        }
    }
}

impl Drop for Bnode {
    fn drop(&mut self) {
        self.store.unhash(self.id);
        self.store.cache.shrink();
    }
}

/// Counted reference to a cached bnode.
#[derive(Clone)]
pub struct BnodeRef {
    node: Arc<Bnode>,
    chunk: Arc<CachedChunk>,
    mode: BnodeMode,
}

impl BnodeRef {
    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub fn mode(&self) -> BnodeMode {
        self.mode
    }

    /// Live handles to this node, including this one.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.node)
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.chunk.read()
    }

    /// Mutable bytes; read-only handles are refused.
    pub fn data_mut(&self) -> Result<RwLockWriteGuard<'_, Box<[u8]>>> {
        if self.mode != BnodeMode::ReadWrite {
            return Err(VdfsError::Bug("write access through a read-only bnode handle"));
        }
        Ok(self.chunk.write())
    }

    pub fn is_dirty(&self) -> bool {
        self.chunk.is_dirty()
    }
}

/// Counter snapshot for one tree's bnode store.
#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct BnodeStats {
    pub cache_hits: u64,
    pub disk_reads: u64,
    pub allocations: u64,
    pub destroyed: u64,
    pub reentrant_gets: u64,
    pub validation_failures: u64,
    pub cached_chunks: usize,
    pub dirty_chunks: usize,
    pub live_nodes: usize,
    pub free_ids: u32,
}

#[derive(Default)]
struct Counters {
    cache_hits: AtomicU64,
    disk_reads: AtomicU64,
    allocations: AtomicU64,
    destroyed: AtomicU64,
    reentrant_gets: AtomicU64,
    validation_failures: AtomicU64,
}

/// Per-tree bnode table, id map, and chunk cache.
pub struct NodeStore {
    object: SpecialFile,
    ctx: Arc<MetaContext>,
    node_size: usize,
    blocks_per_node: u64,
    id_limit: u32,
    tree_lock: RwLock<()>,
    hash: Mutex<FxHashMap<NodeId, Weak<Bnode>>>,
    ids: Mutex<FreeIdBitmap>,
    cache: ChunkCache,
    counters: Counters,
}

impl NodeStore {
    /// Creates the store for one tree special file.
    pub fn new(object: SpecialFile, ctx: Arc<MetaContext>) -> Result<Arc<Self>> {
        if !object.is_tree() {
            return Err(VdfsError::Invalid("bnode store requires a tree special file"));
        }
        let config = ctx.snapshot.config();
        let blocks_per_node = config.chunk_blocks(object);
        let node_size = blocks_per_node as usize * config.block_size;
        let capacity_ids = config.capacities[object.index()] / blocks_per_node;
        let id_limit = FreeIdBitmap::capacity_for(node_size).min(capacity_ids as u32);
        if id_limit < 2 {
            return Err(VdfsError::Invalid("tree capacity below two nodes"));
        }
        let cache = ChunkCache::new(ctx.cache_chunks);
        Ok(Arc::new(Self {
            object,
            ctx,
            node_size,
            blocks_per_node,
            id_limit,
            tree_lock: RwLock::new(()),
            hash: Mutex::new(FxHashMap::default()),
            ids: Mutex::new(FreeIdBitmap::new(id_limit)),
            cache,
            counters: Counters::default(),
        }))
    }

    pub fn object(&self) -> SpecialFile {
        self.object
    }

    pub fn node_size(&self) -> usize {
        self.node_size
    }

    pub fn id_limit(&self) -> u32 {
        self.id_limit
    }

    pub fn context(&self) -> &MetaContext {
        &self.ctx
    }

    /// The tree's reader/writer lock.
    pub fn tree_lock(&self) -> &RwLock<()> {
        &self.tree_lock
    }

    pub fn free_ids(&self) -> u32 {
        self.ids.lock().free_count()
    }

    pub fn is_allocated(&self, id: NodeId) -> bool {
        self.ids.lock().is_allocated(id)
    }

    fn bug(&self, msg: &'static str) -> VdfsError {
        self.ctx.errors.escalate(VdfsError::Bug(msg))
    }

    fn check_access(&self, mode: BnodeMode) -> Result<()> {
        match mode {
            BnodeMode::ReadWrite if !self.ctx.snapshot.in_transaction() => {
                Err(self.bug("write bnode access outside a transaction"))
            }
            BnodeMode::ReadOnly if !self.tree_lock.is_locked() => {
                Err(self.bug("read bnode access without the tree lock"))
            }
            _ => Ok(()),
        }
    }

    /// Looks up or faults in a node, blocking on a concurrent fault.
    pub fn get_bnode(self: &Arc<Self>, id: NodeId, mode: BnodeMode) -> Result<BnodeRef> {
        self.check_access(mode)?;
        self.lookup(id, mode, true)?
            .ok_or(VdfsError::Bug("blocking bnode lookup returned nothing"))
    }

    /// Like [`get_bnode`](Self::get_bnode) but returns `None` while another
    /// thread is still reading the node.
    pub fn try_get_bnode(self: &Arc<Self>, id: NodeId, mode: BnodeMode) -> Result<Option<BnodeRef>> {
        self.check_access(mode)?;
        self.lookup(id, mode, false)
    }

    fn lookup(self: &Arc<Self>, id: NodeId, mode: BnodeMode, wait: bool) -> Result<Option<BnodeRef>> {
        if !id.is_head() && !self.is_allocated(id) {
            return Err(VdfsError::NotFound);
        }
        let mut hash = self.hash.lock();
        if let Some(node) = hash.get(&id).and_then(Weak::upgrade) {
            drop(hash);
            if mode == BnodeMode::ReadWrite && !id.is_head() && Arc::strong_count(&node) > 2 {
                self.counters.reentrant_gets.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "vdfs::bnode",
                    tree = self.object.name(),
                    node = id.0,
                    refs = Arc::strong_count(&node),
                    "bnode.reentrant_write_get"
                );
            }
            let chunk = if wait {
                node.wait_ready()?
            } else {
                match node.try_ready() {
                    Some(ready) => ready?,
                    None => return Ok(None),
                }
            };
            return Ok(Some(BnodeRef { node, chunk, mode }));
        }
        let node = Arc::new(Bnode::loading(Arc::clone(self), id));
        hash.insert(id, Arc::downgrade(&node));
        drop(hash);
        let result = self.fault_in(id);
        let chunk = node.publish(result).map_err(|err| self.ctx.errors.escalate(err))?;
        Ok(Some(BnodeRef { node, chunk, mode }))
    }

    fn fault_in(&self, id: NodeId) -> Result<Arc<CachedChunk>> {
        if let Some(chunk) = self.cache.get(id) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(chunk);
        }
        let mut attempt = 0;
        loop {
            match self.read_validated(id) {
                Ok(buf) => {
                    let chunk = Arc::new(CachedChunk::new(id, buf));
                    self.cache.insert(Arc::clone(&chunk));
                    return Ok(chunk);
                }
                Err(err) if err.is_fatal() && attempt < self.ctx.validation_retries => {
                    attempt += 1;
                    warn!(
                        target: "vdfs::bnode",
                        tree = self.object.name(),
                        node = id.0,
                        attempt,
                        error = %err,
                        "bnode.validation_retry"
                    );
                }
                Err(err) => {
                    if err.is_fatal() {
                        self.counters.validation_failures.fetch_add(1, Ordering::Relaxed);
                    }
                    return Err(err);
                }
            }
        }
    }

    fn read_validated(&self, id: NodeId) -> Result<Vec<u8>> {
        let _writeback = self.ctx.snapshot.writeback_shared();
        let entry = self
            .ctx
            .snapshot
            .chunk_location(self.object, u64::from(id.0) * self.blocks_per_node)?
            .ok_or(VdfsError::Corruption("bnode has no physical mapping"))?;
        let mut buf = vec![0u8; self.node_size];
        self.ctx.device.read_blocks(entry.phys, &mut buf)?;
        self.counters.disk_reads.fetch_add(1, Ordering::Relaxed);
        trace!(target: "vdfs::bnode", node = id.0, phys = entry.phys, "bnode.read");
        self.validate(&buf, id, entry.version)?;
        Ok(buf)
    }

    fn validate(&self, buf: &[u8], id: NodeId, expected: Version) -> Result<()> {
        if id.is_head() {
            let head = HeadHeader::decode(buf)?;
            if head.object != self.object {
                return Err(VdfsError::Corruption("head node belongs to another tree"));
            }
        } else if NodeHeader::decode(buf)?.node_id != id {
            return Err(VdfsError::Corruption("bnode id mismatch"));
        }
        if version_of(buf, id.is_head()) != expected {
            return Err(VdfsError::Corruption("bnode version stamp mismatch"));
        }
        if !verify_crc32(buf) {
            return Err(VdfsError::Corruption("bnode crc mismatch"));
        }
        Ok(())
    }

    /// Reads the head node at mount and loads the id map from it.
    pub fn load_head(self: &Arc<Self>) -> Result<(BnodeRef, HeadHeader)> {
        let head = self
            .lookup(NodeId::HEAD, BnodeMode::ReadWrite, true)?
            .ok_or(VdfsError::Bug("head lookup returned nothing"))?;
        let parsed = {
            let data = head.data();
            let parsed = HeadHeader::decode(&data)?;
            if parsed.id_limit != self.id_limit {
                return Err(VdfsError::Corruption("head id limit does not match geometry"));
            }
            let ids = FreeIdBitmap::from_bytes(&data[HEAD_BITMAP_OFFSET..], parsed.id_limit)?;
            if !ids.is_allocated(NodeId::HEAD) || !ids.is_allocated(parsed.root) {
                return Err(VdfsError::Corruption("head or root id marked free"));
            }
            *self.ids.lock() = ids;
            parsed
        };
        Ok((head, parsed))
    }

    /// Creates the head node of a new tree. Requires the tree write lock.
    pub fn init_head(self: &Arc<Self>, max_record_len: u16) -> Result<BnodeRef> {
        if !self.tree_lock.is_locked_exclusive() {
            return Err(self.bug("head init without the tree write lock"));
        }
        let mut ids = FreeIdBitmap::new(self.id_limit);
        ids.mark(NodeId::HEAD)?;
        let mut buf = vec![0u8; self.node_size];
        HeadHeader {
            version: Version::default(),
            root: NodeId(0),
            height: 0,
            object: self.object,
            node_size: self.node_size as u32,
            max_record_len,
            id_limit: self.id_limit,
        }
        .encode(&mut buf);
        ids.write_into(&mut buf);
        *self.ids.lock() = ids;
        let head = self.install(NodeId::HEAD, buf)?;
        self.mark_dirty(&head)?;
        Ok(head)
    }

    fn install(self: &Arc<Self>, id: NodeId, buf: Vec<u8>) -> Result<BnodeRef> {
        let chunk = Arc::new(CachedChunk::new(id, buf));
        let mut hash = self.hash.lock();
        if hash.get(&id).is_some_and(|w| w.strong_count() > 0) {
            return Err(self.bug("new bnode id is still live"));
        }
        let node = Arc::new(Bnode::ready(Arc::clone(self), id, Arc::clone(&chunk)));
        hash.insert(id, Arc::downgrade(&node));
        drop(hash);
        self.cache.insert(Arc::clone(&chunk));
        Ok(BnodeRef {
            node,
            chunk,
            mode: BnodeMode::ReadWrite,
        })
    }

    /// Allocates, initialises, and dirties a fresh node.
    ///
    /// On `NoSpace` (ids or blocks) no state visible to readers changes.
    pub fn alloc_new_bnode(self: &Arc<Self>, head: &BnodeRef, kind: NodeKind) -> Result<BnodeRef> {
        if !self.tree_lock.is_locked_exclusive() {
            return Err(self.bug("bnode allocation without the tree write lock"));
        }
        if self.ids.lock().free_count() == 0 {
            return Err(VdfsError::NoSpace);
        }
        self.mark_dirty(head)?;
        let id = self.ids.lock().reserve_first_free()?;
        let mut buf = vec![0u8; self.node_size];
        NodeHeader::empty(id, kind, self.node_size).encode(&mut buf);
        let node = match self.install(id, buf) {
            Ok(node) => node,
            Err(err) => {
                let _ = self.ids.lock().release(id);
                return Err(err);
            }
        };
        if let Err(err) = self.mark_dirty(&node) {
            drop(node);
            self.cache.remove(id);
            let _ = self.ids.lock().release(id);
            return Err(err);
        }
        self.ids.lock().write_into(&mut head.data_mut()?);
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        debug!(target: "vdfs::bnode", tree = self.object.name(), node = id.0, ?kind, "bnode.alloc");
        Ok(node)
    }

    /// Frees a node's id. The caller must hold the only handle.
    pub fn destroy_bnode(self: &Arc<Self>, head: &BnodeRef, node: BnodeRef) -> Result<()> {
        let id = node.id();
        if id.is_head() {
            return Err(self.bug("destroying the head node"));
        }
        if node.mode != BnodeMode::ReadWrite {
            return Err(self.bug("destroying through a read-only handle"));
        }
        if !self.tree_lock.is_locked_exclusive() || !self.ctx.snapshot.in_transaction() {
            return Err(self.bug("bnode destroy without tree write lock and transaction"));
        }
        if node.ref_count() != 1 {
            return Err(self.bug("destroying a bnode that is still referenced"));
        }
        self.mark_dirty(head)?;
        self.ids
            .lock()
            .release(id)
            .map_err(|err| self.ctx.errors.escalate(err))?;
        drop(node);
        self.cache.remove(id);
        self.ids.lock().write_into(&mut head.data_mut()?);
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        debug!(target: "vdfs::bnode", tree = self.object.name(), node = id.0, "bnode.destroy");
        Ok(())
    }

    /// Relocates the node's chunk for this epoch and flags it for writeback.
    pub fn mark_dirty(&self, node: &BnodeRef) -> Result<()> {
        if node.mode != BnodeMode::ReadWrite {
            return Err(self.bug("dirtying a read-only bnode handle"));
        }
        if !self.ctx.snapshot.in_transaction() {
            return Err(self.bug("dirtying a bnode outside a transaction"));
        }
        if !self.tree_lock.is_locked_exclusive() {
            return Err(self.bug("dirtying a bnode without the tree write lock"));
        }
        self.ctx
            .errors
            .check(
                self.ctx
                    .snapshot
                    .add_chunk(self.object, u64::from(node.id().0) * self.blocks_per_node),
            )?;
        node.chunk.mark_dirty();
        Ok(())
    }

    /// Dirty chunks awaiting the sync pass.
    pub fn dirty_chunks(&self) -> Vec<Arc<CachedChunk>> {
        self.cache.dirty()
    }

    /// Clears dirty flags after a successful writeback and trims the cache.
    pub fn clear_dirty(&self, written: Vec<Arc<CachedChunk>>) {
        for chunk in &written {
            chunk.clear_dirty();
        }
        drop(written);
        self.cache.shrink();
    }

    /// Stamps, seals, and writes one dirty chunk at its relocated address.
    ///
    /// The caller holds the sync and writeback locks; the dirty flag is
    /// cleared separately once the whole pass succeeded.
    pub fn write_chunk(&self, chunk: &CachedChunk, version: Version) -> Result<u64> {
        let index = u64::from(chunk.id().0) * self.blocks_per_node;
        let entry = self
            .ctx
            .snapshot
            .chunk_location(self.object, index)?
            .ok_or(VdfsError::Bug("dirty bnode has no mapping"))?;
        if entry.version != version {
            return Err(VdfsError::Bug("dirty bnode was not relocated this epoch"));
        }
        let mut data = chunk.write();
        stamp_version(&mut data, chunk.id().is_head(), version);
        crate::types::seal_crc32(&mut data);
        self.ctx.device.write_blocks(entry.phys, &data)?;
        trace!(target: "vdfs::bnode", node = chunk.id().0, phys = entry.phys, "bnode.write");
        Ok(entry.phys)
    }

    /// Nodes with at least one outstanding handle.
    pub fn live_nodes(&self) -> usize {
        self.hash
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    fn unhash(&self, id: NodeId) {
        let mut hash = self.hash.lock();
        if hash.get(&id).is_some_and(|w| w.strong_count() == 0) {
            hash.remove(&id);
        }
    }

    pub fn stats(&self) -> BnodeStats {
        BnodeStats {
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            disk_reads: self.counters.disk_reads.load(Ordering::Relaxed),
            allocations: self.counters.allocations.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            reentrant_gets: self.counters.reentrant_gets.load(Ordering::Relaxed),
            validation_failures: self.counters.validation_failures.load(Ordering::Relaxed),
            cached_chunks: self.cache.len(),
            dirty_chunks: self.cache.dirty().len(),
            live_nodes: self.live_nodes(),
            free_ids: self.free_ids(),
        }
    }
}
