use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of B-tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BTreeStatsSnapshot {
    /// Point lookups served.
    pub finds: u64,
    /// Records inserted.
    pub inserts: u64,
    /// Records replaced in place or by reinsertion.
    pub replaces: u64,
    /// Records removed.
    pub removes: u64,
    /// Leaf nodes split.
    pub leaf_splits: u64,
    /// Index nodes split.
    pub index_splits: u64,
    /// Root splits that grew the tree by one level.
    pub root_splits: u64,
    /// Nodes released after becoming empty.
    pub nodes_freed: u64,
    /// Single-child roots removed.
    pub root_collapses: u64,
}

/// Thread-safe counters for one tree.
#[derive(Default)]
pub struct BTreeStats {
    finds: AtomicU64,
    inserts: AtomicU64,
    replaces: AtomicU64,
    removes: AtomicU64,
    leaf_splits: AtomicU64,
    index_splits: AtomicU64,
    root_splits: AtomicU64,
    nodes_freed: AtomicU64,
    root_collapses: AtomicU64,
}

impl BTreeStats {
    pub(crate) fn inc_finds(&self) {
        self.finds.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_inserts(&self) {
        self.inserts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_replaces(&self) {
        self.replaces.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_removes(&self) {
        self.removes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_split(&self, leaf: bool) {
        let counter = if leaf {
            &self.leaf_splits
        } else {
            &self.index_splits
        };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_splits(&self) {
        self.root_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn add_nodes_freed(&self, count: u64) {
        self.nodes_freed.fetch_add(count, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_collapses(&self) {
        self.root_collapses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> BTreeStatsSnapshot {
        BTreeStatsSnapshot {
            finds: self.finds.load(AtomicOrdering::Relaxed),
            inserts: self.inserts.load(AtomicOrdering::Relaxed),
            replaces: self.replaces.load(AtomicOrdering::Relaxed),
            removes: self.removes.load(AtomicOrdering::Relaxed),
            leaf_splits: self.leaf_splits.load(AtomicOrdering::Relaxed),
            index_splits: self.index_splits.load(AtomicOrdering::Relaxed),
            root_splits: self.root_splits.load(AtomicOrdering::Relaxed),
            nodes_freed: self.nodes_freed.load(AtomicOrdering::Relaxed),
            root_collapses: self.root_collapses.load(AtomicOrdering::Relaxed),
        }
    }
}
