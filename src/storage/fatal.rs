use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::error;

use crate::types::{Result, VdfsError};

/// What happens when an integrity or logic error is detected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalPolicy {
    /// Flip the volume read-only and keep serving reads.
    #[default]
    ReadOnly,
    /// Abort the process.
    Panic,
}

/// Single entry point for fatal errors.
///
/// Errors seen before mount completes are returned to the mount path
/// without changing volume state.
#[derive(Debug)]
pub struct ErrorHandler {
    policy: FatalPolicy,
    read_only: AtomicBool,
    mounted: AtomicBool,
    fatal_count: AtomicU64,
}

impl ErrorHandler {
    pub fn new(policy: FatalPolicy, read_only: bool) -> Self {
        Self {
            policy,
            read_only: AtomicBool::new(read_only),
            mounted: AtomicBool::new(false),
            fatal_count: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> FatalPolicy {
        self.policy
    }

    /// Marks mount as complete; later fatal errors apply the policy.
    pub fn mark_mounted(&self) {
        self.mounted.store(true, Ordering::Release);
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    /// Records a fatal error and applies the policy.
    pub fn fatal(&self, err: &VdfsError) {
        if !self.is_mounted() {
            error!(target: "vdfs::fatal", error = %err, "volume.fatal_during_mount");
            return;
        }
        self.fatal_count.fetch_add(1, Ordering::Relaxed);
        error!(target: "vdfs::fatal", error = %err, policy = ?self.policy, "volume.fatal");
        match self.policy {
            FatalPolicy::ReadOnly => self.read_only.store(true, Ordering::Release),
            FatalPolicy::Panic => panic!("vdfs fatal error: {err}"),
        }
    }

    /// Routes `err` through [`fatal`](Self::fatal) when it is fatal, then returns it.
    pub fn escalate(&self, err: VdfsError) -> VdfsError {
        if err.is_fatal() {
            self.fatal(&err);
        }
        err
    }

    /// Passes a result through, escalating fatal errors.
    pub fn check<T>(&self, result: Result<T>) -> Result<T> {
        result.map_err(|err| self.escalate(err))
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Fails with `ReadOnly` once the volume stopped accepting writes.
    pub fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            Err(VdfsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    pub fn fatal_count(&self) -> u64 {
        self.fatal_count.load(Ordering::Relaxed)
    }
}
