use std::collections::{BTreeMap, BTreeSet};

use crate::types::{Result, VdfsError};

/// Highest power-of-two size class; longer extents share the last bucket.
pub const MAX_ORDER: usize = 16;

/// A run of contiguous free blocks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, serde::Serialize)]
pub struct FreeExtent {
    /// First block.
    pub start: u64,
    /// Number of blocks.
    pub len: u64,
}

impl FreeExtent {
    pub fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    /// One past the last block.
    pub fn end(&self) -> u64 {
        self.start + self.len
    }

    pub fn contains(&self, block: u64) -> bool {
        block >= self.start && block < self.end()
    }

    /// Absorbs `other` if it starts where `self` ends.
    pub fn coalesce_with(&mut self, other: &FreeExtent) -> bool {
        if self.end() == other.start {
            self.len += other.len;
            true
        } else {
            false
        }
    }
}

pub(crate) fn order_of(len: u64) -> usize {
    debug_assert!(len > 0);
    ((63 - len.leading_zeros()) as usize).min(MAX_ORDER)
}

/// Ordered, coalescing set of free extents with size-class buckets.
///
/// Keyed by start block. Each extent also sits in the bucket for
/// `floor(log2(len))` so best-fit search starts at the right class.
#[derive(Debug, Clone)]
pub struct ExtentTree {
    by_start: BTreeMap<u64, u64>,
    buckets: Vec<BTreeSet<u64>>,
    max_nodes: usize,
    total: u64,
}

impl ExtentTree {
    /// Creates an empty tree that tracks at most `max_nodes` extents.
    pub fn new(max_nodes: usize) -> Self {
        Self {
            by_start: BTreeMap::new(),
            buckets: vec![BTreeSet::new(); MAX_ORDER + 1],
            max_nodes: max_nodes.max(1),
            total: 0,
        }
    }

    /// Number of tracked extents.
    pub fn len(&self) -> usize {
        self.by_start.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }

    /// Blocks covered by tracked extents.
    pub fn total_blocks(&self) -> u64 {
        self.total
    }

    pub fn clear(&mut self) {
        self.by_start.clear();
        self.buckets.iter_mut().for_each(BTreeSet::clear);
        self.total = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = FreeExtent> + '_ {
        self.by_start
            .iter()
            .map(|(&start, &len)| FreeExtent::new(start, len))
    }

    fn link(&mut self, start: u64, len: u64) {
        self.by_start.insert(start, len);
        self.buckets[order_of(len)].insert(start);
        self.total += len;
    }

    fn unlink(&mut self, start: u64) -> Option<u64> {
        let len = self.by_start.remove(&start)?;
        self.buckets[order_of(len)].remove(&start);
        self.total -= len;
        Some(len)
    }

    /// Inserts and coalesces with neighbours.
    ///
    /// Returns `Ok(false)` when the extent would need a new node beyond the
    /// cap; the caller accounts it as untracked. Overlap is an invariant
    /// violation.
    pub fn insert(&mut self, start: u64, len: u64) -> Result<bool> {
        if len == 0 {
            return Ok(true);
        }
        let end = start
            .checked_add(len)
            .ok_or(VdfsError::Invalid("extent overflows block space"))?;
        let prev = self
            .by_start
            .range(..=start)
            .next_back()
            .map(|(&s, &l)| FreeExtent::new(s, l));
        let next = self
            .by_start
            .range(start..)
            .next()
            .map(|(&s, &l)| FreeExtent::new(s, l));
        if prev.is_some_and(|p| p.end() > start) || next.is_some_and(|n| n.start < end) {
            return Err(VdfsError::Bug("free extent overlaps a tracked extent"));
        }
        let merge_prev = prev.filter(|p| p.end() == start);
        let merge_next = next.filter(|n| n.start == end);
        if merge_prev.is_none() && merge_next.is_none() && self.by_start.len() >= self.max_nodes {
            return Ok(false);
        }
        let mut merged = FreeExtent::new(start, len);
        if let Some(p) = merge_prev {
            self.unlink(p.start);
            merged = FreeExtent::new(p.start, p.len + len);
        }
        if let Some(n) = merge_next {
            self.unlink(n.start);
            merged.len += n.len;
        }
        self.link(merged.start, merged.len);
        Ok(true)
    }

    /// The extent holding `block`, if any.
    pub fn containing(&self, block: u64) -> Option<FreeExtent> {
        self.by_start
            .range(..=block)
            .next_back()
            .map(|(&s, &l)| FreeExtent::new(s, l))
            .filter(|e| e.contains(block))
    }

    /// Best-fit search by size class.
    ///
    /// Scans classes upward from `need`'s class for an extent at least `need`
    /// long. With `allow_partial`, falls back to the largest extent found
    /// scanning downward.
    pub fn find(&self, need: u64, allow_partial: bool) -> Option<FreeExtent> {
        let order = order_of(need);
        for bucket in &self.buckets[order..] {
            let hit = bucket
                .iter()
                .map(|&s| FreeExtent::new(s, self.by_start[&s]))
                .find(|e| e.len >= need);
            if hit.is_some() {
                return hit;
            }
        }
        if !allow_partial {
            return None;
        }
        (0..=order).rev().find_map(|o| {
            self.buckets[o]
                .iter()
                .map(|&s| FreeExtent::new(s, self.by_start[&s]))
                .max_by_key(|e| e.len)
        })
    }

    /// Removes `[start, start+len)`, which must lie inside one extent.
    ///
    /// Returns the number of blocks that dropped out of tracking because the
    /// split would exceed the node cap.
    pub fn carve(&mut self, start: u64, len: u64) -> Result<u64> {
        let host = self
            .containing(start)
            .filter(|e| e.end() >= start + len)
            .ok_or(VdfsError::Bug("carve range is not free"))?;
        self.unlink(host.start);
        let left = FreeExtent::new(host.start, start - host.start);
        let right = FreeExtent::new(start + len, host.end() - (start + len));
        let mut dropped = 0;
        for piece in [left, right] {
            if piece.len == 0 {
                continue;
            }
            if self.by_start.len() >= self.max_nodes {
                dropped += piece.len;
            } else {
                self.link(piece.start, piece.len);
            }
        }
        Ok(dropped)
    }

    /// Returns the parts of `[start, start+len)` not covered by this tree.
    pub fn uncovered(&self, start: u64, len: u64) -> Vec<FreeExtent> {
        let end = start + len;
        let mut out = Vec::new();
        let mut cursor = start;
        let first = self
            .by_start
            .range(..start)
            .next_back()
            .map(|(&s, &l)| FreeExtent::new(s, l))
            .filter(|e| e.end() > start);
        let overlapping = first
            .into_iter()
            .chain(self.by_start.range(start..end).map(|(&s, &l)| FreeExtent::new(s, l)));
        for ext in overlapping {
            if ext.start > cursor {
                out.push(FreeExtent::new(cursor, ext.start - cursor));
            }
            cursor = cursor.max(ext.end());
        }
        if cursor < end {
            out.push(FreeExtent::new(cursor, end - cursor));
        }
        out
    }

    /// Removes and returns every extent in start order.
    pub fn drain(&mut self) -> Vec<FreeExtent> {
        let out: Vec<_> = self.iter().collect();
        self.clear();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn insert_coalesces_both_sides() -> Result<()> {
        let mut tree = ExtentTree::new(16);
        assert!(tree.insert(10, 5)?);
        assert!(tree.insert(20, 5)?);
        assert!(tree.insert(15, 5)?);
        assert_eq!(tree.iter().collect::<Vec<_>>(), vec![FreeExtent::new(10, 15)]);
        assert_eq!(tree.total_blocks(), 15);
        Ok(())
    }

    #[test]
    fn overlap_is_rejected() -> Result<()> {
        let mut tree = ExtentTree::new(16);
        tree.insert(10, 5)?;
        assert!(matches!(tree.insert(12, 1), Err(VdfsError::Bug(_))));
        assert!(matches!(tree.insert(5, 6), Err(VdfsError::Bug(_))));
        Ok(())
    }

    #[test]
    fn node_cap_reports_untracked() -> Result<()> {
        let mut tree = ExtentTree::new(2);
        assert!(tree.insert(0, 1)?);
        assert!(tree.insert(10, 1)?);
        assert!(!tree.insert(20, 1)?);
        // merging still works at the cap
        assert!(tree.insert(11, 1)?);
        assert_eq!(tree.len(), 2);
        Ok(())
    }

    #[test]
    fn find_prefers_fitting_class_then_partial() -> Result<()> {
        let mut tree = ExtentTree::new(16);
        tree.insert(0, 3)?;
        tree.insert(100, 40)?;
        tree.insert(200, 9)?;
        assert_eq!(tree.find(8, false), Some(FreeExtent::new(200, 9)));
        assert_eq!(tree.find(33, false), Some(FreeExtent::new(100, 40)));
        assert_eq!(tree.find(64, false), None);
        assert_eq!(tree.find(64, true), Some(FreeExtent::new(100, 40)));
        Ok(())
    }

    #[test]
    fn carve_splits_host() -> Result<()> {
        let mut tree = ExtentTree::new(16);
        tree.insert(0, 100)?;
        assert_eq!(tree.carve(40, 10)?, 0);
        assert_eq!(
            tree.iter().collect::<Vec<_>>(),
            vec![FreeExtent::new(0, 40), FreeExtent::new(50, 50)]
        );
        assert!(tree.carve(45, 2).is_err());
        Ok(())
    }

    #[test]
    fn uncovered_subtracts_tracked_ranges() -> Result<()> {
        let mut tree = ExtentTree::new(16);
        tree.insert(5, 5)?;
        tree.insert(20, 5)?;
        assert_eq!(
            tree.uncovered(0, 30),
            vec![
                FreeExtent::new(0, 5),
                FreeExtent::new(10, 10),
                FreeExtent::new(25, 5)
            ]
        );
        assert!(tree.uncovered(6, 2).is_empty());
        Ok(())
    }

    proptest! {
        #[test]
        fn total_tracks_inserted_blocks(starts in proptest::collection::btree_set(0u64..500, 1..40)) {
            let mut tree = ExtentTree::new(1024);
            for &s in &starts {
                tree.insert(s * 2, 1).unwrap();
            }
            prop_assert_eq!(tree.total_blocks(), starts.len() as u64);
            let order_ok = tree
                .iter()
                .collect::<Vec<_>>()
                .windows(2)
                .all(|w| w[0].end() < w[1].start);
            prop_assert!(order_ok);
        }
    }
}
