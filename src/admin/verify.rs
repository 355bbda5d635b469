use std::path::Path;

use serde::Serialize;

use crate::storage::btree::TreeCheck;
use crate::volume::{MountOptions, Volume};

use crate::admin::util::open_volume;
use crate::admin::Result;

const MAX_FINDINGS: usize = 32;

/// Specifies the depth of verification checks to perform.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// Tables against the free-space bitmap and allocator counters.
    Fast,
    /// Also walks every node of every tree.
    Full,
}

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Informational message about the verification process.
    Info,
    /// Non-critical issue that may indicate a problem.
    Warning,
    /// Critical issue indicating data corruption or integrity failure.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    pub severity: VerifySeverity,
    pub message: String,
}

/// Per-tree walk result.
#[derive(Clone, Debug, Serialize)]
pub struct TreeSummary {
    pub name: &'static str,
    pub check: TreeCheck,
}

/// Statistics collected during the verification process.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Logical blocks with a physical mapping.
    pub mapped_blocks: u64,
    /// Allocated blocks in the data area.
    pub allocated_blocks: u64,
    pub free_blocks: u64,
    pub trees: Vec<TreeSummary>,
}

/// Complete report of a verification operation.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    pub level: VerifyLevel,
    /// Whether verification passed without any error finding.
    pub success: bool,
    pub findings: Vec<VerifyFinding>,
    pub counts: VerifyCounts,
}

/// Verifies the metadata of a volume image.
///
/// The image is mounted read-only. `Fast` cross-checks the translation table
/// against the free-space bitmap and the allocator's own counters; `Full`
/// additionally validates every node of every tree (magic, CRC, version,
/// key order, sibling chains and id-bitmap agreement).
///
/// # Errors
///
/// Returns an error if the image cannot be mounted at all.
pub fn verify(
    path: impl AsRef<Path>,
    opts: &MountOptions,
    level: VerifyLevel,
) -> Result<VerifyReport> {
    let volume = open_volume(path.as_ref(), opts)?;
    Ok(verify_volume(&volume, level))
}

/// Runs the checks of [`verify`] against an already mounted volume.
pub fn verify_volume(volume: &Volume, level: VerifyLevel) -> VerifyReport {
    let mut findings = Vec::new();
    let mut counts = VerifyCounts::default();

    let mapped = volume.snapshot().mapped_blocks();
    counts.mapped_blocks = mapped.len() as u64;
    let first_data = volume.superblock().first_data_block();
    for (object, index, entry) in &mapped {
        if entry.phys < first_data || entry.phys >= volume.superblock().total_blocks {
            push_error(
                &mut findings,
                format!("{object} block {index} maps outside the data area ({})", entry.phys),
            );
        }
    }
    if let Err(err) = volume.snapshot().verify_against_fsm() {
        push_error(&mut findings, format!("translation table vs bitmap: {err}"));
    }
    if let Err(err) = volume.fsm().check_consistency() {
        push_error(&mut findings, format!("free-space manager: {err}"));
    }
    let fsm = volume.fsm().stats();
    counts.allocated_blocks = fsm.allocated_blocks;
    counts.free_blocks = fsm.free_blocks;
    if fsm.untracked_blocks > 0 {
        push(
            &mut findings,
            VerifySeverity::Info,
            format!("{} free blocks are not tracked by extents", fsm.untracked_blocks),
        );
    }

    if matches!(level, VerifyLevel::Full) {
        for tree in volume.trees() {
            let name = tree.object().name();
            match tree.check() {
                Ok(check) => counts.trees.push(TreeSummary { name, check }),
                Err(err) => push_error(&mut findings, format!("tree {name}: {err}")),
            }
            if findings.len() >= MAX_FINDINGS {
                break;
            }
        }
    }

    if volume.errors().fatal_count() > 0 {
        push(
            &mut findings,
            VerifySeverity::Warning,
            format!("{} fatal errors raised while checking", volume.errors().fatal_count()),
        );
    }
    VerifyReport {
        level,
        success: !findings.iter().any(|f| f.severity == VerifySeverity::Error),
        findings,
        counts,
    }
}

fn push(findings: &mut Vec<VerifyFinding>, severity: VerifySeverity, message: impl Into<String>) {
    if findings.len() < MAX_FINDINGS {
        findings.push(VerifyFinding {
            severity,
            message: message.into(),
        });
    }
}

fn push_error(findings: &mut Vec<VerifyFinding>, message: impl Into<String>) {
    push(findings, VerifySeverity::Error, message);
}
