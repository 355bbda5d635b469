//! Binary entry point for the vdfs maintenance CLI.
#![forbid(unsafe_code)]

mod config;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use vdfs::{
    admin::{
        dump_node, dump_table, info, mkfs, verify, AdminError, FormatReport, InfoReport, NodeDump,
        TableDump, VerifyLevel, VerifyReport,
    },
    types::SpecialFile,
    volume::{FormatOptions, MountOptions},
    VdfsError,
};

use config::{CliConfig, ConfigError};

#[derive(Parser, Debug)]
#[command(
    name = "vdfs",
    version,
    about = "Maintenance CLI for vdfs volume images",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        env = "VDFS_CONFIG",
        value_name = "FILE",
        help = "CLI config file (TOML)"
    )]
    config: Option<PathBuf>,

    #[arg(
        short = 'o',
        long = "options",
        global = true,
        value_name = "OPTS",
        help = "Mount options, e.g. dncs,retries=2 (replaces the config file's)"
    )]
    options: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct MkfsCmd {
    #[arg(value_name = "IMAGE")]
    image: PathBuf,

    #[arg(long, help = "Block size in bytes")]
    block_size: Option<usize>,

    #[arg(long, help = "Total blocks in the image")]
    blocks: Option<u64>,

    #[arg(long, help = "Blocks per B-tree node")]
    blocks_per_node: Option<u32>,

    #[arg(long, help = "Blocks per erase block")]
    erase_block: Option<u64>,

    #[arg(long, help = "Extended translation tables per half")]
    max_ext_tables: Option<u32>,

    #[arg(long, help = "Number of inode ids")]
    inodes: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create and format a volume image")]
    Mkfs(MkfsCmd),

    #[command(about = "Show geometry and engine counters")]
    Info {
        #[arg(value_name = "IMAGE")]
        image: Option<PathBuf>,
    },

    #[command(about = "Check metadata integrity")]
    Verify {
        #[arg(value_name = "IMAGE")]
        image: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = VerifyLevelArg::Full)]
        level: VerifyLevelArg,
    },

    #[command(about = "List the translation table")]
    DumpTable {
        #[arg(value_name = "IMAGE")]
        image: Option<PathBuf>,
    },

    #[command(about = "Hex dump of one B-tree node")]
    DumpNode {
        #[arg(value_name = "IMAGE")]
        image: Option<PathBuf>,

        #[arg(long, value_enum)]
        tree: TreeArg,

        #[arg(long, default_value_t = 0)]
        node: u32,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum VerifyLevelArg {
    Fast,
    Full,
}

impl From<VerifyLevelArg> for VerifyLevel {
    fn from(level: VerifyLevelArg) -> Self {
        match level {
            VerifyLevelArg::Fast => VerifyLevel::Fast,
            VerifyLevelArg::Full => VerifyLevel::Full,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum TreeArg {
    Catalog,
    Extents,
    Xattr,
}

impl From<TreeArg> for SpecialFile {
    fn from(tree: TreeArg) -> Self {
        match tree {
            TreeArg::Catalog => SpecialFile::CatalogTree,
            TreeArg::Extents => SpecialFile::ExtentsTree,
            TreeArg::Xattr => SpecialFile::XattrTree,
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Admin(#[from] AdminError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Core(#[from] VdfsError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("no image given and no default image configured")]
    NoImage,
}

fn main() {
    init_tracing();
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vdfs=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

/// Returns `Ok(false)` when a check completed but found problems.
fn run() -> Result<bool, CliError> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.clone())?;
    let mount = match cli.options.as_deref() {
        Some(list) => MountOptions::parse(list)?,
        None => config.mount_options().clone(),
    };
    let image = |given: Option<PathBuf>| -> Result<PathBuf, CliError> {
        given
            .or_else(|| config.default_image().cloned())
            .ok_or(CliError::NoImage)
    };

    match cli.command {
        Command::Mkfs(cmd) => {
            let opts = format_options(config.format_options(), &cmd);
            let report = mkfs(&cmd.image, &opts)?;
            emit(cli.format, &report, print_mkfs_text)?;
        }
        Command::Info { image: path } => {
            let report = info(image(path)?, &mount)?;
            emit(cli.format, &report, print_info_text)?;
        }
        Command::Verify { image: path, level } => {
            let report = verify(image(path)?, &mount, level.into())?;
            emit(cli.format, &report, print_verify_text)?;
            return Ok(report.success);
        }
        Command::DumpTable { image: path } => {
            let dump = dump_table(image(path)?, &mount)?;
            emit(cli.format, &dump, print_table_text)?;
        }
        Command::DumpNode {
            image: path,
            tree,
            node,
        } => {
            let dump = dump_node(image(path)?, &mount, tree.into(), node)?;
            emit(cli.format, &dump, print_node_text)?;
        }
    }
    Ok(true)
}

fn format_options(base: &FormatOptions, cmd: &MkfsCmd) -> FormatOptions {
    let mut opts = base.clone();
    if let Some(block_size) = cmd.block_size {
        opts.block_size = block_size;
    }
    if let Some(blocks) = cmd.blocks {
        opts.total_blocks = blocks;
    }
    if let Some(bpn) = cmd.blocks_per_node {
        opts.blocks_per_node = bpn;
    }
    if let Some(erase) = cmd.erase_block {
        opts.erase_block_blocks = erase;
    }
    if let Some(max_ext) = cmd.max_ext_tables {
        opts.max_ext_tables = max_ext;
    }
    if let Some(inodes) = cmd.inodes {
        opts.inode_count = inodes;
    }
    opts
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), CliError>
where
    T: serde::Serialize,
    F: Fn(&T),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(value),
    }
    Ok(())
}

fn print_mkfs_text(report: &FormatReport) {
    let sb = &report.superblock;
    println!(
        "Formatted {} ({} bytes): block_size={} blocks={} node_blocks={} first_data_block={}",
        report.path,
        report.size_bytes,
        sb.block_size,
        sb.total_blocks,
        sb.blocks_per_node,
        report.first_data_block
    );
}

fn print_info_text(report: &InfoReport) {
    let stats = &report.stats;
    let sb = &stats.superblock;
    println!("Image: {}", report.path);
    println!(
        "  block_size={} total_blocks={} blocks_per_node={} erase_block={} mount_count={}",
        sb.block_size, sb.total_blocks, sb.blocks_per_node, sb.erase_block_blocks, sb.mount_count
    );
    println!(
        "  tables_start={} base_blocks={} max_ext_tables={} first_data_block={}",
        sb.tables_start,
        sb.base_blocks,
        sb.max_ext_tables,
        sb.first_data_block()
    );
    println!();
    println!(
        "Free space: free={} reserved={} allocated={} extents={}",
        stats.fsm.free_blocks,
        stats.fsm.reserved_blocks,
        stats.fsm.allocated_blocks,
        stats.fsm.tracked_extents
    );
    println!(
        "Snapshot: epoch={} active_half={} ext_tables={} mapped_blocks={}",
        stats.snapshot.epoch,
        stats.snapshot.active_half,
        stats.snapshot.ext_tables_written,
        stats.snapshot.durable_blocks
    );
    println!("Inodes: free={}", stats.free_inodes);
    println!();
    for tree in &stats.trees {
        println!(
            "Tree {}: height={} free_ids={} disk_reads={}",
            tree.name, tree.height, tree.bnode.free_ids, tree.bnode.disk_reads
        );
    }
}

fn print_verify_text(report: &VerifyReport) {
    println!(
        "Verify ({:?}) => success={} mapped_blocks={} allocated_blocks={} free_blocks={}",
        report.level,
        report.success,
        report.counts.mapped_blocks,
        report.counts.allocated_blocks,
        report.counts.free_blocks,
    );
    for tree in &report.counts.trees {
        println!(
            "  {}: height={} nodes={} leaves={} records={}",
            tree.name, tree.check.height, tree.check.nodes, tree.check.leaves, tree.check.records
        );
    }
    for finding in &report.findings {
        println!("- {:?}: {}", finding.severity, finding.message);
    }
}

fn print_table_text(dump: &TableDump) {
    println!(
        "Active half {} with {} extended tables",
        dump.active_half, dump.ext_tables
    );
    for row in &dump.rows {
        println!(
            "  {:<12} {:>8} -> {:>10} @ {}",
            row.object.name(),
            row.index,
            row.phys,
            row.version
        );
    }
}

fn print_node_text(dump: &NodeDump) {
    println!(
        "{} node {} at block {}:",
        dump.object.name(),
        dump.node,
        dump.phys
    );
    for (i, line) in dump.hex.as_bytes().chunks(64).enumerate() {
        println!("  {:08x}  {}", i * 32, String::from_utf8_lossy(line));
    }
}
