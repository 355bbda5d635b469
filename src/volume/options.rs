use serde::Deserialize;

use crate::storage::FatalPolicy;
use crate::types::{Result, VdfsError};

/// Options applied when mounting an existing volume.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountOptions {
    /// Refuse transactions and sync.
    pub read_only: bool,
    /// Case-insensitive name comparison for the catalog.
    pub case_insensitive: bool,
    /// Permission bits cleared on new files.
    pub fmask: u32,
    /// Permission bits cleared on new directories.
    pub dmask: u32,
    /// Skip signature checks on the superblock and tables; CRCs are still verified.
    pub skip_signature_check: bool,
    /// Number of device operations to fail after mount.
    pub inject_errors: u32,
    /// Behaviour on integrity or logic errors.
    pub fatal_policy: FatalPolicy,
    /// Extra reads after a failed node validation.
    pub validation_retries: u32,
    /// Cap on tracked extents per free-space tree.
    pub fsm_max_extents: usize,
    /// Clean chunks retained per tree cache.
    pub cache_chunks: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            case_insensitive: false,
            fmask: 0o022,
            dmask: 0o022,
            skip_signature_check: false,
            inject_errors: 0,
            fatal_policy: if cfg!(feature = "panic-on-fatal") {
                FatalPolicy::Panic
            } else {
                FatalPolicy::ReadOnly
            },
            validation_retries: 0,
            fsm_max_extents: 65_536,
            cache_chunks: 1024,
        }
    }
}

impl MountOptions {
    /// Parses a comma-separated option string such as `ro,count=3,fmask=0022,dncs`.
    ///
    /// Unknown options are rejected.
    pub fn parse(list: &str) -> Result<Self> {
        let mut opts = Self::default();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (name, value) = match item.split_once('=') {
                Some((n, v)) => (n, Some(v)),
                None => (item, None),
            };
            match (name, value) {
                ("ro", None) => opts.read_only = true,
                ("rw", None) => opts.read_only = false,
                ("dncs", None) => opts.skip_signature_check = true,
                ("case_insensitive", None) => opts.case_insensitive = true,
                ("fmask", Some(v)) => opts.fmask = parse_octal(v)?,
                ("dmask", Some(v)) => opts.dmask = parse_octal(v)?,
                ("count", Some(v)) => opts.inject_errors = parse_num(v)?,
                ("retries", Some(v)) => opts.validation_retries = parse_num(v)?,
                ("cache", Some(v)) => opts.cache_chunks = parse_num(v)?,
                ("max_extents", Some(v)) => opts.fsm_max_extents = parse_num(v)?,
                ("fatal", Some("ro")) => opts.fatal_policy = FatalPolicy::ReadOnly,
                ("fatal", Some("panic")) => opts.fatal_policy = FatalPolicy::Panic,
                _ => return Err(VdfsError::Invalid("unrecognized mount option")),
            }
        }
        opts.validate()?;
        Ok(opts)
    }

    /// Loads options from a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let opts: Self =
            toml::from_str(text).map_err(|_| VdfsError::Invalid("malformed mount options file"))?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fmask > 0o777 || self.dmask > 0o777 {
            return Err(VdfsError::Invalid("permission mask out of range"));
        }
        if self.fsm_max_extents < 2 {
            return Err(VdfsError::Invalid("fsm_max_extents must be at least 2"));
        }
        if self.cache_chunks == 0 {
            return Err(VdfsError::Invalid("cache_chunks must be non-zero"));
        }
        Ok(())
    }
}

fn parse_octal(value: &str) -> Result<u32> {
    u32::from_str_radix(value, 8).map_err(|_| VdfsError::Invalid("mask must be octal"))
}

fn parse_num<T: std::str::FromStr>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| VdfsError::Invalid("option value must be a number"))
}

/// Geometry of a new volume.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FormatOptions {
    pub block_size: usize,
    pub total_blocks: u64,
    /// Blocks per bnode; a power of two.
    pub blocks_per_node: u32,
    pub erase_block_blocks: u64,
    /// Extended-table slots per table half.
    pub max_ext_tables: u32,
    /// Node capacity of the catalog tree.
    pub catalog_nodes: u64,
    /// Node capacity of the extents tree.
    pub extents_nodes: u64,
    /// Node capacity of the xattr tree.
    pub xattr_nodes: u64,
    /// Inode numbers tracked by the inode bitmap.
    pub inode_count: u64,
    /// Record limit; 0 picks the largest that keeps three records per node.
    pub max_record_len: u16,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            total_blocks: 16_384,
            blocks_per_node: 4,
            erase_block_blocks: 64,
            max_ext_tables: 8,
            catalog_nodes: 1024,
            extents_nodes: 512,
            xattr_nodes: 256,
            inode_count: 65_536,
            max_record_len: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_option_string() -> Result<()> {
        let opts = MountOptions::parse("ro,count=3,fmask=0027,dncs")?;
        assert!(opts.read_only);
        assert!(opts.skip_signature_check);
        assert_eq!(opts.inject_errors, 3);
        assert_eq!(opts.fmask, 0o027);
        assert_eq!(opts.dmask, 0o022);
        assert_eq!(MountOptions::parse("")?, MountOptions::default());
        Ok(())
    }

    #[test]
    fn unknown_or_malformed_options_are_rejected() {
        for bad in ["bogus", "fmask=9", "count=x", "ro=1", "fatal=maybe", "cache=0"] {
            assert!(
                matches!(MountOptions::parse(bad), Err(VdfsError::Invalid(_))),
                "{bad} accepted"
            );
        }
    }

    #[test]
    fn toml_fills_defaults() -> Result<()> {
        let opts = MountOptions::from_toml_str(
            "read_only = true\nfatal_policy = \"panic\"\ncache_chunks = 16\n",
        )?;
        assert!(opts.read_only);
        assert_eq!(opts.fatal_policy, FatalPolicy::Panic);
        assert_eq!(opts.cache_chunks, 16);
        assert_eq!(opts.fsm_max_extents, 65_536);
        assert!(MountOptions::from_toml_str("no_such_key = 1").is_err());
        Ok(())
    }
}
