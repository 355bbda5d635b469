#![forbid(unsafe_code)]

//! Generic B-tree over bnodes.
//!
//! Every node stores `(key, value)` records in key order; index nodes store
//! `(separator, child id)` pairs where child `i` holds keys from separator
//! `i` up to separator `i + 1` (child 0 also takes anything smaller). Nodes
//! on one level are chained through `prev`/`next`. The head node records the
//! root id and the height.
//!
//! Writers take the tree write lock inside a metadata transaction; readers
//! take the read lock. Chunk data guards are never held across a call that
//! may fault in another node.

/// Record layout inside a regular node.
pub mod node;
mod stats;

use std::cmp::Ordering;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::debug;

use crate::storage::bnode::{BnodeMode, BnodeRef, HeadHeader, NodeKind, NodeStore};
use crate::storage::MetaContext;
use crate::types::{NodeId, Result, SpecialFile, VdfsError};

use node::NodeView;

pub use stats::{BTreeStats, BTreeStatsSnapshot};

/// Key ordering of a tree.
pub type KeyCompare = fn(&[u8], &[u8]) -> Ordering;

/// Plain lexicographic byte order.
pub fn bytewise(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Whether an insert may dip into the split reserve.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InsertMode {
    /// Refuse with `NoSpace` unless a worst-case split chain can complete.
    #[default]
    Normal,
    /// Skip the reserve check.
    Force,
}

/// Summary produced by [`BTree::check`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct TreeCheck {
    pub height: u16,
    pub nodes: u32,
    pub leaves: u32,
    pub records: u64,
    pub free_ids: u32,
}

type Path = SmallVec<[(BnodeRef, usize); 8]>;

/// One tree special file.
pub struct BTree {
    store: Arc<NodeStore>,
    head: BnodeRef,
    compare: KeyCompare,
    max_record_len: usize,
    stats: BTreeStats,
}

impl BTree {
    /// Largest `max_record_len` that still lets any full node split in two.
    pub fn max_record_len_for(node_size: usize) -> u16 {
        let limit = node::usable(node_size) / 3 - node::RECORD_HDR_LEN - node::SLOT_LEN;
        limit.min(u16::MAX as usize) as u16
    }

    /// Builds an empty tree: head node plus an empty leaf root.
    pub fn create(store: Arc<NodeStore>, max_record_len: u16, compare: KeyCompare) -> Result<Self> {
        if max_record_len == 0 || max_record_len > Self::max_record_len_for(store.node_size()) {
            return Err(VdfsError::Invalid("max record length does not fit the node size"));
        }
        let head = {
            let ctx = store.context();
            ctx.errors.check_writable()?;
            let _tx = ctx.snapshot.start_transaction()?;
            let _tree = store.tree_lock().write();
            let head = store.init_head(max_record_len)?;
            let root = store.alloc_new_bnode(&head, NodeKind::Leaf)?;
            HeadHeader::set_root(&mut head.data_mut()?, root.id(), 1);
            head
        };
        debug!(target: "vdfs::btree", tree = store.object().name(), "btree.create");
        Ok(Self {
            store,
            head,
            compare,
            max_record_len: usize::from(max_record_len),
            stats: BTreeStats::default(),
        })
    }

    /// Opens an existing tree from its head node.
    pub fn open(store: Arc<NodeStore>, compare: KeyCompare) -> Result<Self> {
        let (head, hdr) = store.load_head()?;
        if hdr.height == 0 || hdr.root.is_head() || !store.is_allocated(hdr.root) {
            return Err(store
                .context()
                .errors
                .escalate(VdfsError::Corruption("tree head has no valid root")));
        }
        debug!(
            target: "vdfs::btree",
            tree = store.object().name(),
            root = hdr.root.0,
            height = hdr.height,
            "btree.open"
        );
        Ok(Self {
            store,
            head,
            compare,
            max_record_len: usize::from(hdr.max_record_len),
            stats: BTreeStats::default(),
        })
    }

    pub fn object(&self) -> SpecialFile {
        self.store.object()
    }

    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    pub fn max_record_len(&self) -> usize {
        self.max_record_len
    }

    pub fn stats(&self) -> BTreeStatsSnapshot {
        self.stats.snapshot()
    }

    fn ctx(&self) -> &MetaContext {
        self.store.context()
    }

    fn root(&self) -> Result<(NodeId, u16)> {
        let hdr = HeadHeader::decode(&self.head.data())?;
        Ok((hdr.root, hdr.height))
    }

    pub fn root_id(&self) -> Result<NodeId> {
        Ok(self.root()?.0)
    }

    pub fn height(&self) -> Result<u16> {
        Ok(self.root()?.1)
    }

    pub fn free_node_ids(&self) -> u32 {
        self.store.free_ids()
    }

    fn parse<'a>(&self, data: &'a [u8]) -> Result<NodeView<'a>> {
        self.ctx().errors.check(NodeView::parse(data))
    }

    fn corrupt(&self, msg: &'static str) -> VdfsError {
        self.ctx().errors.escalate(VdfsError::Corruption(msg))
    }

    fn check_record(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(VdfsError::Invalid("empty key"));
        }
        if key.len() + value.len() > self.max_record_len {
            return Err(VdfsError::Invalid("record exceeds the tree's maximum length"));
        }
        Ok(())
    }

    fn record_count(&self, node: &BnodeRef) -> Result<usize> {
        let data = node.data();
        let view = self.parse(&data)?;
        Ok(view.len())
    }

    /// Reads a node and picks the child covering `key`; `None` at a leaf.
    fn step(&self, node: &BnodeRef, level: u16, key: Option<&[u8]>) -> Result<Option<(NodeId, usize)>> {
        let data = node.data();
        let view = self.parse(&data)?;
        match (view.kind(), level) {
            (NodeKind::Leaf, 1) => Ok(None),
            (NodeKind::Index, l) if l > 1 => {
                if view.is_empty() {
                    return Err(self.corrupt("empty index node"));
                }
                let slot = match key {
                    Some(key) => view.child_slot(key, self.compare),
                    None => 0,
                };
                Ok(Some((view.child(slot)?, slot)))
            }
            _ => Err(self.corrupt("node kind does not match tree level")),
        }
    }

    fn descend_read(&self, key: Option<&[u8]>) -> Result<BnodeRef> {
        let (mut id, height) = self.root()?;
        for level in (1..=height).rev() {
            let node = self.store.get_bnode(id, BnodeMode::ReadOnly)?;
            match self.step(&node, level, key)? {
                None => return Ok(node),
                Some((child, _)) => id = child,
            }
        }
        Err(self.corrupt("tree height is zero"))
    }

    fn descend_write(&self, key: &[u8]) -> Result<(Path, BnodeRef)> {
        let (mut id, height) = self.root()?;
        let mut path = Path::new();
        for level in (1..=height).rev() {
            let node = self.store.get_bnode(id, BnodeMode::ReadWrite)?;
            match self.step(&node, level, Some(key))? {
                None => return Ok((path, node)),
                Some((child, slot)) => {
                    path.push((node, slot));
                    id = child;
                }
            }
        }
        Err(self.corrupt("tree height is zero"))
    }

    /// Looks up the value stored under `key`.
    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let _tree = self.store.tree_lock().read();
        self.stats.inc_finds();
        let leaf = self.descend_read(Some(key))?;
        let data = leaf.data();
        let view = self.parse(&data)?;
        Ok(view
            .search(key, self.compare)
            .ok()
            .map(|idx| view.value(idx).to_vec()))
    }

    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.insert_with_mode(key, value, InsertMode::Normal)
    }

    /// Inserts a new record; `Exists` if the key is present.
    pub fn insert_with_mode(&self, key: &[u8], value: &[u8], mode: InsertMode) -> Result<()> {
        self.check_record(key, value)?;
        let ctx = self.ctx();
        ctx.errors.check_writable()?;
        let _tx = ctx.snapshot.start_transaction()?;
        let _tree = self.store.tree_lock().write();
        let (_, height) = self.root()?;
        if mode == InsertMode::Normal && self.store.free_ids() < u32::from(height) + 1 {
            return Err(VdfsError::NoSpace);
        }
        let (path, leaf) = self.descend_write(key)?;
        let idx = {
            let data = leaf.data();
            let view = self.parse(&data)?;
            match view.search(key, self.compare) {
                Ok(_) => return Err(VdfsError::Exists),
                Err(idx) => idx,
            }
        };
        self.insert_into(path, leaf, idx, key, value)?;
        self.stats.inc_inserts();
        Ok(())
    }

    /// Overwrites the value of an existing record.
    pub fn replace(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_record(key, value)?;
        let ctx = self.ctx();
        ctx.errors.check_writable()?;
        let _tx = ctx.snapshot.start_transaction()?;
        let _tree = self.store.tree_lock().write();
        let (_, height) = self.root()?;
        let (path, leaf) = self.descend_write(key)?;
        let (idx, old, fits) = {
            let data = leaf.data();
            let view = self.parse(&data)?;
            let idx = view
                .search(key, self.compare)
                .map_err(|_| VdfsError::NotFound)?;
            let old = view.value(idx).to_vec();
            let fits = view.free_space() + old.len() >= value.len();
            (idx, old, fits)
        };
        if !fits && self.store.free_ids() < u32::from(height) + 1 {
            return Err(VdfsError::NoSpace);
        }
        self.store.mark_dirty(&leaf)?;
        node::remove_at(&mut leaf.data_mut()?, idx)?;
        if let Err(err) = self.insert_into(path, leaf.clone(), idx, key, value) {
            if matches!(err, VdfsError::NoSpace) {
                node::insert_at(&mut leaf.data_mut()?, idx, key, &old)?;
            }
            return Err(err);
        }
        self.stats.inc_replaces();
        Ok(())
    }

    /// Inserts at `idx` of `leaf`, splitting up the path as needed.
    ///
    /// Every node the insert will modify is relocated and every new node is
    /// allocated before any record moves, so `NoSpace` or an I/O error
    /// leaves the tree unchanged.
    fn insert_into(
        &self,
        path: Path,
        leaf: BnodeRef,
        idx: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let splits = self.plan_splits(&path, &leaf, idx, key, value)?;
        self.store.mark_dirty(&leaf)?;
        if splits == 0 {
            node::insert_at(&mut leaf.data_mut()?, idx, key, value)?;
            return Ok(());
        }
        let grows = splits > path.len();
        for (ancestor, _) in path.iter().rev().take(splits) {
            self.store.mark_dirty(ancestor)?;
        }
        self.store.mark_dirty(&self.head)?;
        let mut siblings = Vec::with_capacity(splits);
        for split in std::iter::once(&leaf).chain(path.iter().rev().map(|(n, _)| n)).take(splits) {
            siblings.push(self.right_sibling(split)?);
        }
        let prepared = Prepared {
            fresh: self.alloc_nodes(splits + usize::from(grows))?,
            siblings,
            grows,
        };
        self.apply_splits(&path, leaf, idx, key, value, prepared)
            .map_err(|err| self.propagation(err))
    }

    /// Counts the nodes, leaf first, that split when `key` lands at `idx`.
    fn plan_splits(
        &self,
        path: &Path,
        leaf: &BnodeRef,
        idx: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<usize> {
        let Some(mut separator) = self.split_separator(leaf, idx, key, value)? else {
            return Ok(0);
        };
        let mut splits = 1;
        // child ids are fixed width; the placeholder only sizes the record
        let child = node::child_value(NodeId(0));
        for (parent, slot) in path.iter().rev() {
            match self.split_separator(parent, slot + 1, &separator, &child)? {
                None => break,
                Some(next) => {
                    separator = next;
                    splits += 1;
                }
            }
        }
        Ok(splits)
    }

    /// Separator a split of `target` would push up, or `None` if the record fits.
    fn split_separator(
        &self,
        target: &BnodeRef,
        idx: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let data = target.data();
        let view = self.parse(&data)?;
        if view.free_space() >= node::footprint(key.len(), value.len()) {
            return Ok(None);
        }
        let mut records = view.records();
        records.insert(idx, (key.to_vec(), value.to_vec()));
        let mid = node::split_point(&records);
        Ok(Some(records[mid].0.clone()))
    }

    fn right_sibling(&self, node: &BnodeRef) -> Result<Option<BnodeRef>> {
        let next = {
            let data = node.data();
            let view = self.parse(&data)?;
            view.header().next
        };
        if next == NodeId(0) {
            return Ok(None);
        }
        let sibling = self.store.get_bnode(next, BnodeMode::ReadWrite)?;
        self.store.mark_dirty(&sibling)?;
        Ok(Some(sibling))
    }

    /// Allocates `count` nodes: a leaf, then index nodes. All or nothing.
    fn alloc_nodes(&self, count: usize) -> Result<Vec<BnodeRef>> {
        let mut fresh = Vec::with_capacity(count);
        for i in 0..count {
            let kind = if i == 0 { NodeKind::Leaf } else { NodeKind::Index };
            match self.store.alloc_new_bnode(&self.head, kind) {
                Ok(node) => fresh.push(node),
                Err(err) => {
                    while let Some(node) = fresh.pop() {
                        self.store.destroy_bnode(&self.head, node)?;
                    }
                    return Err(err);
                }
            }
        }
        Ok(fresh)
    }

    fn apply_splits(
        &self,
        path: &[(BnodeRef, usize)],
        leaf: BnodeRef,
        idx: usize,
        key: &[u8],
        value: &[u8],
        Prepared { fresh, siblings, grows }: Prepared,
    ) -> Result<()> {
        let short = || VdfsError::Bug("split plan ran out of prepared nodes");
        let mut fresh = fresh.into_iter();
        let mut levels = path.iter().rev();
        let mut left = leaf;
        let mut at = idx;
        let mut record = (key.to_vec(), value.to_vec());
        for sibling in siblings {
            let right = fresh.next().ok_or_else(short)?;
            let (separator, right_id) = self.split(&left, at, &record.0, &record.1, right, sibling)?;
            record = (separator, node::child_value(right_id).to_vec());
            match levels.next() {
                Some((parent, slot)) => {
                    left = parent.clone();
                    at = slot + 1;
                }
                None if grows => {
                    let root = fresh.next().ok_or_else(short)?;
                    return self.grow_root(&left, (record.0, right_id), root);
                }
                None => return Err(short()),
            }
        }
        let inserted = node::insert_at(&mut left.data_mut()?, at, &record.0, &record.1);
        inserted
    }

    fn propagation(&self, err: VdfsError) -> VdfsError {
        match err {
            VdfsError::NoSpace => self
                .ctx()
                .errors
                .escalate(VdfsError::Bug("out of space while propagating a split")),
            other => self.ctx().errors.escalate(other),
        }
    }

    /// Moves the upper half of `left`, plus the new record, into `right`.
    /// Returns the separator and id of `right`.
    fn split(
        &self,
        left: &BnodeRef,
        idx: usize,
        key: &[u8],
        value: &[u8],
        right: BnodeRef,
        sibling: Option<BnodeRef>,
    ) -> Result<(Vec<u8>, NodeId)> {
        let (kind, mut records, next) = {
            let data = left.data();
            let view = self.parse(&data)?;
            (view.kind(), view.records(), view.header().next)
        };
        if sibling.as_ref().map_or(NodeId(0), BnodeRef::id) != next {
            return Err(VdfsError::Bug("prepared sibling does not follow the split node"));
        }
        records.insert(idx, (key.to_vec(), value.to_vec()));
        let mid = node::split_point(&records);
        let upper = records.split_off(mid);
        let separator = upper[0].0.clone();
        {
            let mut buf = right.data_mut()?;
            node::init(&mut buf, right.id(), kind);
            node::rewrite(&mut buf, &upper)?;
            node::set_links(&mut buf, left.id(), next)?;
        }
        {
            let mut buf = left.data_mut()?;
            node::rewrite(&mut buf, &records)?;
            node::set_next(&mut buf, right.id())?;
        }
        if let Some(sibling) = sibling {
            node::set_prev(&mut sibling.data_mut()?, right.id())?;
        }
        self.stats.inc_split(kind == NodeKind::Leaf);
        debug!(
            target: "vdfs::btree",
            tree = self.object().name(),
            left = left.id().0,
            right = right.id().0,
            ?kind,
            "btree.split"
        );
        Ok((separator, right.id()))
    }

    fn grow_root(
        &self,
        left: &BnodeRef,
        (separator, right): (Vec<u8>, NodeId),
        root: BnodeRef,
    ) -> Result<()> {
        let first = {
            let data = left.data();
            let view = self.parse(&data)?;
            if view.is_empty() {
                return Err(VdfsError::Bug("split left an empty node"));
            }
            view.key(0).to_vec()
        };
        let (_, height) = self.root()?;
        {
            let mut buf = root.data_mut()?;
            node::init(&mut buf, root.id(), NodeKind::Index);
            node::insert_at(&mut buf, 0, &first, &node::child_value(left.id()))?;
            node::insert_at(&mut buf, 1, &separator, &node::child_value(right))?;
        }
        HeadHeader::set_root(&mut self.head.data_mut()?, root.id(), height + 1);
        self.stats.inc_root_splits();
        debug!(
            target: "vdfs::btree",
            tree = self.object().name(),
            root = root.id().0,
            height = height + 1,
            "btree.grow"
        );
        Ok(())
    }

    /// Deletes the record under `key`, releasing nodes that empty out.
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        let ctx = self.ctx();
        ctx.errors.check_writable()?;
        let _tx = ctx.snapshot.start_transaction()?;
        let _tree = self.store.tree_lock().write();
        let (mut path, leaf) = self.descend_write(key)?;
        let (idx, leaf_len) = {
            let data = leaf.data();
            let view = self.parse(&data)?;
            let idx = view
                .search(key, self.compare)
                .map_err(|_| VdfsError::NotFound)?;
            (idx, view.len())
        };

        // Nodes, bottom-up from the leaf, that empty out. The root never does.
        let mut doomed = 0;
        if leaf_len == 1 && !path.is_empty() {
            doomed = 1;
            for (node, _) in path.iter().skip(1).rev() {
                if self.record_count(node)? != 1 {
                    break;
                }
                doomed += 1;
            }
            if doomed == path.len() && self.record_count(&path[0].0)? < 2 {
                return Err(self.corrupt("index root with a single child"));
            }
        }

        // Dirty everything this removal touches before changing anything,
        // so running out of blocks leaves the tree as it was.
        self.store.mark_dirty(&leaf)?;
        let mut relinks = Vec::with_capacity(doomed);
        if doomed > 0 {
            self.store.mark_dirty(&self.head)?;
            let victims = std::iter::once(&leaf).chain(path.iter().rev().map(|(n, _)| n));
            for victim in victims.take(doomed) {
                relinks.push(self.detach_siblings(victim)?);
            }
            self.store.mark_dirty(&path[path.len() - doomed].0)?;
        }

        node::remove_at(&mut leaf.data_mut()?, idx)?;
        if doomed == 0 {
            self.stats.inc_removes();
            return Ok(());
        }
        for relink in relinks {
            relink.apply()?;
        }
        self.store.destroy_bnode(&self.head, leaf)?;
        for _ in 1..doomed {
            let (node, _) = path
                .pop()
                .ok_or(VdfsError::Bug("removal path shorter than cascade"))?;
            self.store.destroy_bnode(&self.head, node)?;
        }
        let (keeper, slot) = path
            .pop()
            .ok_or(VdfsError::Bug("removal path shorter than cascade"))?;
        node::remove_at(&mut keeper.data_mut()?, slot)?;
        self.stats.add_nodes_freed(doomed as u64);
        debug!(
            target: "vdfs::btree",
            tree = self.object().name(),
            freed = doomed,
            "btree.release_nodes"
        );
        drop(keeper);
        drop(path);
        self.collapse_root()?;
        self.stats.inc_removes();
        Ok(())
    }

    fn detach_siblings(&self, node: &BnodeRef) -> Result<Relink> {
        let (prev_id, next_id) = {
            let data = node.data();
            let view = self.parse(&data)?;
            (view.header().prev, view.header().next)
        };
        let fetch = |id: NodeId| -> Result<Option<BnodeRef>> {
            if id == NodeId(0) {
                return Ok(None);
            }
            let sibling = self.store.get_bnode(id, BnodeMode::ReadWrite)?;
            self.store.mark_dirty(&sibling)?;
            Ok(Some(sibling))
        };
        Ok(Relink {
            prev: fetch(prev_id)?,
            next: fetch(next_id)?,
            prev_id,
            next_id,
        })
    }

    fn collapse_root(&self) -> Result<()> {
        loop {
            let (root_id, height) = self.root()?;
            if height <= 1 {
                return Ok(());
            }
            let root = self.store.get_bnode(root_id, BnodeMode::ReadWrite)?;
            let child = {
                let data = root.data();
                let view = self.parse(&data)?;
                if view.len() != 1 {
                    return Ok(());
                }
                view.child(0)?
            };
            self.store.mark_dirty(&self.head)?;
            HeadHeader::set_root(&mut self.head.data_mut()?, child, height - 1);
            self.store.destroy_bnode(&self.head, root)?;
            self.stats.inc_root_collapses();
            debug!(
                target: "vdfs::btree",
                tree = self.object().name(),
                root = child.0,
                height = height - 1,
                "btree.collapse"
            );
        }
    }

    /// Visits records in key order, starting at the first key not below
    /// `from`, until `visit` returns false. `visit` must not call back into
    /// this tree.
    pub fn scan(&self, from: Option<&[u8]>, mut visit: impl FnMut(&[u8], &[u8]) -> bool) -> Result<()> {
        let _tree = self.store.tree_lock().read();
        let mut node = self.descend_read(from)?;
        let mut start = match from {
            Some(key) => {
                let data = node.data();
                let view = self.parse(&data)?;
                let (Ok(idx) | Err(idx)) = view.search(key, self.compare);
                idx
            }
            None => 0,
        };
        loop {
            let next = {
                let data = node.data();
                let view = self.parse(&data)?;
                for idx in start..view.len() {
                    if !visit(view.key(idx), view.value(idx)) {
                        return Ok(());
                    }
                }
                view.header().next
            };
            if next == NodeId(0) {
                return Ok(());
            }
            node = self.store.get_bnode(next, BnodeMode::ReadOnly)?;
            start = 0;
        }
    }

    /// Every record in key order.
    pub fn collect(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        self.scan(None, |k, v| {
            out.push((k.to_vec(), v.to_vec()));
            true
        })?;
        Ok(out)
    }

    /// Walks the whole tree and validates its structure.
    ///
    /// Checks node kinds against levels, key order and separator bounds,
    /// sibling chains per level, and that every allocated id is reachable.
    pub fn check(&self) -> Result<TreeCheck> {
        let _tree = self.store.tree_lock().read();
        let (root, height) = self.root()?;
        if height == 0 {
            return Err(VdfsError::Corruption("tree height is zero"));
        }
        let mut report = TreeCheck {
            height,
            free_ids: self.store.free_ids(),
            ..TreeCheck::default()
        };
        let mut level_nodes: Vec<(NodeId, Option<Vec<u8>>, Option<Vec<u8>>)> =
            vec![(root, None, None)];
        for level in (1..=height).rev() {
            let mut below = Vec::new();
            for (pos, (id, lo, hi)) in level_nodes.iter().enumerate() {
                if id.is_head() || !self.store.is_allocated(*id) {
                    return Err(VdfsError::Corruption("tree references a free node id"));
                }
                let node = self.store.get_bnode(*id, BnodeMode::ReadOnly)?;
                let data = node.data();
                let view = NodeView::parse(&data)?;
                let hdr = view.header();
                let expected_prev = if pos == 0 { NodeId(0) } else { level_nodes[pos - 1].0 };
                let expected_next = level_nodes.get(pos + 1).map_or(NodeId(0), |n| n.0);
                if hdr.prev != expected_prev || hdr.next != expected_next {
                    return Err(VdfsError::Corruption("sibling chain does not match tree order"));
                }
                let is_root = level == height;
                let leaf = level == 1;
                if (view.kind() == NodeKind::Leaf) != leaf {
                    return Err(VdfsError::Corruption("node kind does not match tree level"));
                }
                let min_records = match (is_root, leaf) {
                    (true, true) => 0,
                    (true, false) => 2,
                    (false, _) => 1,
                };
                if view.len() < min_records {
                    return Err(VdfsError::Corruption("underfull node"));
                }
                for idx in 0..view.len() {
                    let key = view.key(idx);
                    if idx > 0 && (self.compare)(view.key(idx - 1), key) != Ordering::Less {
                        return Err(VdfsError::Corruption("keys out of order"));
                    }
                    let bounded = leaf || idx > 0;
                    if bounded && lo.as_deref().is_some_and(|lo| (self.compare)(key, lo) == Ordering::Less) {
                        return Err(VdfsError::Corruption("key below separator"));
                    }
                    if hi.as_deref().is_some_and(|hi| (self.compare)(key, hi) != Ordering::Less) {
                        return Err(VdfsError::Corruption("key above separator"));
                    }
                }
                if !leaf {
                    for idx in 0..view.len() {
                        let child_lo = if idx == 0 { lo.clone() } else { Some(view.key(idx).to_vec()) };
                        let child_hi = if idx + 1 < view.len() {
                            Some(view.key(idx + 1).to_vec())
                        } else {
                            hi.clone()
                        };
                        below.push((view.child(idx)?, child_lo, child_hi));
                    }
                } else {
                    report.leaves += 1;
                    report.records += view.len() as u64;
                }
                report.nodes += 1;
            }
            level_nodes = below;
        }
        let allocated = self.store.id_limit() - report.free_ids;
        if allocated != report.nodes + 1 {
            return Err(VdfsError::Corruption("allocated node ids unreachable from the root"));
        }
        Ok(report)
    }
}

/// Nodes an insert needs, gathered before any record moves.
struct Prepared {
    /// One right node per split, then the new root if the tree grows.
    fresh: Vec<BnodeRef>,
    /// Relocated right sibling of each splitting node, leaf first.
    siblings: Vec<Option<BnodeRef>>,
    grows: bool,
}

/// Sibling handles of a node about to be released.
struct Relink {
    prev: Option<BnodeRef>,
    next: Option<BnodeRef>,
    prev_id: NodeId,
    next_id: NodeId,
}

impl Relink {
    fn apply(self) -> Result<()> {
        if let Some(prev) = &self.prev {
            node::set_next(&mut prev.data_mut()?, self.next_id)?;
        }
        if let Some(next) = &self.next {
            node::set_prev(&mut next.data_mut()?, self.prev_id)?;
        }
        Ok(())
    }
}
