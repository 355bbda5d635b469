#![allow(missing_docs)]
#![cfg(unix)]

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::{tempdir, TempDir};

const GEOMETRY: [&str; 12] = [
    "--block-size",
    "512",
    "--blocks",
    "4096",
    "--blocks-per-node",
    "2",
    "--erase-block",
    "16",
    "--max-ext-tables",
    "4",
    "--inodes",
    "1024",
];

fn vdfs(config_home: &Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("vdfs");
    cmd.env("XDG_CONFIG_HOME", config_home)
        .env_remove("VDFS_CONFIG")
        .env("RUST_LOG", "off");
    cmd
}

fn json(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("valid json output")
}

fn formatted_image(dir: &TempDir) -> std::path::PathBuf {
    let image = dir.path().join("vol.img");
    vdfs(dir.path())
        .arg("mkfs")
        .arg(&image)
        .args(GEOMETRY)
        .assert()
        .success();
    image
}

#[test]
fn mkfs_reports_geometry() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("images").join("vol.img");
    let output = vdfs(dir.path())
        .args(["--format", "json", "mkfs"])
        .arg(&image)
        .args(GEOMETRY)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report = json(&output);
    assert_eq!(report["size_bytes"].as_u64(), Some(512 * 4096));
    assert_eq!(report["superblock"]["block_size"].as_u64(), Some(512));
    assert_eq!(report["superblock"]["mount_count"].as_u64(), Some(1));
    assert!(report["first_data_block"].as_u64().unwrap() > 2);
    assert_eq!(std::fs::metadata(&image).unwrap().len(), 512 * 4096);
}

#[test]
fn info_mounts_read_only() {
    let dir = tempdir().unwrap();
    let image = formatted_image(&dir);
    let before = std::fs::read(&image).unwrap();

    let output = vdfs(dir.path())
        .args(["--format", "json", "info"])
        .arg(&image)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let info = json(&output);
    let stats = &info["stats"];
    assert_eq!(stats["read_only"].as_bool(), Some(true));
    assert_eq!(stats["superblock"]["mount_count"].as_u64(), Some(1));
    assert_eq!(stats["trees"].as_array().map(Vec::len), Some(3));
    assert_eq!(stats["trees"][0]["name"].as_str(), Some("catalog"));
    assert_eq!(std::fs::read(&image).unwrap(), before);

    let text = vdfs(dir.path())
        .arg("info")
        .arg(&image)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(text).unwrap();
    assert!(text.contains("block_size=512"));
    assert!(text.contains("Tree xattr"));
}

#[test]
fn verify_passes_on_fresh_image() {
    let dir = tempdir().unwrap();
    let image = formatted_image(&dir);
    let output = vdfs(dir.path())
        .args(["--format", "json", "verify", "--level", "full"])
        .arg(&image)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report = json(&output);
    assert_eq!(report["success"].as_bool(), Some(true));
    assert_eq!(report["level"].as_str(), Some("full"));
    assert_eq!(report["counts"]["trees"].as_array().map(Vec::len), Some(3));

    vdfs(dir.path())
        .args(["verify", "--level", "fast"])
        .arg(&image)
        .assert()
        .success();
}

#[test]
fn dump_table_and_node() {
    let dir = tempdir().unwrap();
    let image = formatted_image(&dir);

    let output = vdfs(dir.path())
        .args(["--format", "json", "dump-table"])
        .arg(&image)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let table = json(&output);
    assert_eq!(table["active_half"].as_u64(), Some(0));
    assert_eq!(table["ext_tables"].as_u64(), Some(0));
    let rows = table["rows"].as_array().unwrap();
    assert!(rows
        .iter()
        .any(|row| row["object"].as_str() == Some("fsm_bitmap")));

    let output = vdfs(dir.path())
        .args(["--format", "json", "dump-node", "--tree", "extents", "--node", "1"])
        .arg(&image)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let node = json(&output);
    assert_eq!(node["object"].as_str(), Some("extents"));
    assert_eq!(node["hex"].as_str().map(str::len), Some(2 * 1024));

    vdfs(dir.path())
        .args(["dump-node", "--tree", "catalog", "--node", "40"])
        .arg(&image)
        .assert()
        .failure();
}

#[test]
fn verify_fails_on_corrupted_node() {
    let dir = tempdir().unwrap();
    let image = formatted_image(&dir);
    let output = vdfs(dir.path())
        .args(["--format", "json", "dump-node", "--tree", "catalog", "--node", "1"])
        .arg(&image)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let phys = json(&output)["phys"].as_u64().unwrap();

    let file = OpenOptions::new().read(true).write(true).open(&image).unwrap();
    let offset = phys * 512 + 200;
    let mut byte = [0u8; 1];
    file.read_exact_at(&mut byte, offset).unwrap();
    file.write_all_at(&[byte[0] ^ 0xff], offset).unwrap();
    drop(file);

    let output = vdfs(dir.path())
        .args(["--format", "json", "verify"])
        .arg(&image)
        .assert()
        .code(2)
        .get_output()
        .stdout
        .clone();
    let report = json(&output);
    assert_eq!(report["success"].as_bool(), Some(false));
    assert!(!report["findings"].as_array().unwrap().is_empty());

    // the fast level never touches tree nodes
    vdfs(dir.path())
        .args(["verify", "--level", "fast"])
        .arg(&image)
        .assert()
        .success();
}

#[test]
fn missing_image_and_bad_options_fail() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("nope.img");
    let output = vdfs(dir.path())
        .arg("info")
        .arg(&missing)
        .assert()
        .code(1)
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8_lossy(&output).contains("not found"));

    let image = formatted_image(&dir);
    vdfs(dir.path())
        .args(["-o", "ro,bogus"])
        .arg("info")
        .arg(&image)
        .assert()
        .code(1);

    vdfs(dir.path()).arg("info").assert().code(1);
}

#[test]
fn config_file_supplies_image_and_geometry() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("configured.img");
    let config_dir = dir.path().join("vdfs");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(
        config_dir.join("cli.toml"),
        format!(
            "[image]\ndefault = {:?}\n\n[mount]\ncache_chunks = 16\n\n[format]\nblock_size = 1024\ntotal_blocks = 2048\nblocks_per_node = 1\ncatalog_nodes = 128\nextents_nodes = 64\nxattr_nodes = 32\ninode_count = 512\n",
            image.display().to_string()
        ),
    )
    .unwrap();

    vdfs(dir.path()).arg("mkfs").arg(&image).assert().success();
    let output = vdfs(dir.path())
        .args(["--format", "json", "info"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let info = json(&output);
    assert_eq!(info["stats"]["superblock"]["block_size"].as_u64(), Some(1024));
    assert_eq!(info["stats"]["superblock"]["total_blocks"].as_u64(), Some(2048));

    let explicit = dir.path().join("other.toml");
    vdfs(dir.path())
        .arg("--config")
        .arg(&explicit)
        .arg("info")
        .assert()
        .code(1);
}
