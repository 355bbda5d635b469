#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    RawRwLock, RwLock,
};
use rustc_hash::FxHashMap;

use crate::types::{Result, VdfsError};

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

enum Held {
    Shared {
        depth: usize,
        _guard: ArcRwLockReadGuard<RawRwLock, ()>,
    },
    Exclusive,
}

thread_local! {
    static HELD: RefCell<FxHashMap<u64, Held>> = RefCell::new(FxHashMap::default());
}

/// Volume-wide transaction lock.
///
/// Shared holders are metadata transactions and may nest on one thread; the
/// exclusive holder is the sync pass. The shared lock is taken once per
/// thread, so a nested `begin` never queues behind a waiting sync.
pub struct TransactionLock {
    id: u64,
    lock: Arc<RwLock<()>>,
    open: AtomicUsize,
}

/// Snapshot of lock state for observability.
#[derive(Default, Debug, Clone, Copy, serde::Serialize)]
pub struct LockSnapshot {
    /// Threads currently inside a transaction.
    pub transactions: usize,
    /// Whether the sync pass holds the lock.
    pub exclusive: bool,
}

/// Marks the current thread as inside a transaction until dropped.
pub struct TransactionGuard<'a> {
    owner: &'a TransactionLock,
    _not_send: PhantomData<*const ()>,
}

/// Exclusive hold used by the sync pass.
pub struct ExclusiveGuard<'a> {
    owner: &'a TransactionLock,
    _guard: ArcRwLockWriteGuard<RawRwLock, ()>,
    _not_send: PhantomData<*const ()>,
}

impl Default for TransactionLock {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionLock {
    /// Creates an unheld lock.
    pub fn new() -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            lock: Arc::new(RwLock::new(())),
            open: AtomicUsize::new(0),
        }
    }

    /// Enters a transaction, re-entrantly on the calling thread.
    pub fn begin(&self) -> Result<TransactionGuard<'_>> {
        let nested = HELD.with(|held| {
            let mut held = held.borrow_mut();
            match held.get_mut(&self.id) {
                Some(Held::Shared { depth, .. }) => {
                    *depth += 1;
                    Ok(true)
                }
                Some(Held::Exclusive) => Err(VdfsError::Bug(
                    "transaction started while holding the sync lock",
                )),
                None => Ok(false),
            }
        })?;
        if !nested {
            let guard = self.lock.read_arc();
            HELD.with(|held| {
                held.borrow_mut().insert(
                    self.id,
                    Held::Shared {
                        depth: 1,
                        _guard: guard,
                    },
                )
            });
            self.open.fetch_add(1, Ordering::AcqRel);
        }
        Ok(TransactionGuard {
            owner: self,
            _not_send: PhantomData,
        })
    }

    /// Blocks until no transaction is open, then excludes new ones.
    pub fn lock_exclusive(&self) -> Result<ExclusiveGuard<'_>> {
        if self.held_by_current_thread() {
            return Err(VdfsError::Bug("sync requested from inside a transaction"));
        }
        let guard = self.lock.write_arc();
        HELD.with(|held| held.borrow_mut().insert(self.id, Held::Exclusive));
        Ok(ExclusiveGuard {
            owner: self,
            _guard: guard,
            _not_send: PhantomData,
        })
    }

    /// Returns true if this thread is inside a transaction or holds the sync lock.
    pub fn held_by_current_thread(&self) -> bool {
        HELD.with(|held| held.borrow().contains_key(&self.id))
    }

    /// Returns true if this thread holds the lock exclusively.
    pub fn held_exclusive_by_current_thread(&self) -> bool {
        HELD.with(|held| matches!(held.borrow().get(&self.id), Some(Held::Exclusive)))
    }

    /// Nesting depth of the calling thread's transaction.
    pub fn depth(&self) -> usize {
        HELD.with(|held| match held.borrow().get(&self.id) {
            Some(Held::Shared { depth, .. }) => *depth,
            _ => 0,
        })
    }

    /// Lock state for reports.
    pub fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            transactions: self.open.load(Ordering::Acquire),
            exclusive: self.lock.is_locked_exclusive(),
        }
    }

    fn leave(&self) {
        let released = HELD.with(|held| {
            let mut held = held.borrow_mut();
            let done = match held.get_mut(&self.id) {
                Some(Held::Shared { depth, .. }) => {
                    *depth -= 1;
                    *depth == 0
                }
                _ => false,
            };
            if done {
                held.remove(&self.id)
            } else {
                None
            }
        });
        if released.is_some() {
            self.open.fetch_sub(1, Ordering::AcqRel);
        }
        drop(released);
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        self.owner.leave();
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        HELD.with(|held| {
            held.borrow_mut().remove(&self.owner.id);
        });
    }
}
