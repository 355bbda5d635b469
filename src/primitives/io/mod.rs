#![forbid(unsafe_code)]

use std::{
    fs::File,
    io,
    path::Path,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use tracing::warn;

use crate::types::{Result, VdfsError};

/// Default metadata block size.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Block-addressed storage underneath the volume.
///
/// Buffers passed to `read_blocks`/`write_blocks` must be a whole number of blocks.
pub trait BlockDevice: Send + Sync + 'static {
    /// Size of one block in bytes.
    fn block_size(&self) -> usize;
    /// Number of addressable blocks.
    fn block_count(&self) -> u64;
    /// Reads `dst.len() / block_size` blocks starting at `block`.
    fn read_blocks(&self, block: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes `src.len() / block_size` blocks starting at `block`.
    fn write_blocks(&self, block: u64, src: &[u8]) -> Result<()>;
    /// Makes every completed write durable.
    fn flush(&self) -> Result<()>;
    /// Hints that a range no longer carries live data.
    fn discard(&self, _block: u64, _count: u64) -> Result<()> {
        Ok(())
    }
}

fn check_span(dev: &dyn BlockDevice, block: u64, len: usize) -> Result<u64> {
    let bs = dev.block_size();
    if len == 0 || len % bs != 0 {
        return Err(VdfsError::Invalid("buffer is not a whole number of blocks"));
    }
    let count = (len / bs) as u64;
    let end = block
        .checked_add(count)
        .ok_or(VdfsError::Invalid("block range overflow"))?;
    if end > dev.block_count() {
        return Err(VdfsError::Invalid("block range beyond device end"));
    }
    Ok(block * bs as u64)
}

#[cfg(unix)]
/// Unix positioned I/O.
pub mod stdio_unix {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::unix::fs::FileExt,
    };

    /// Reads exactly `dst.len()` bytes at `off`.
    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        tracing::trace!(target: "vdfs::io", off, len = dst.len(), "io.read");
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    /// Writes all of `src` at `off`.
    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        tracing::trace!(target: "vdfs::io", off, len = src.len(), "io.write");
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
/// Windows positioned I/O.
pub mod stdio_win {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::windows::fs::FileExt,
    };

    /// Reads exactly `dst.len()` bytes at `off`.
    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    /// Writes all of `src` at `off`.
    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// Image file used as a block device.
#[derive(Clone)]
pub struct FileDevice {
    inner: Arc<File>,
    block_size: usize,
    blocks: u64,
}

impl FileDevice {
    /// Creates (or truncates) an image of `blocks` blocks.
    pub fn create(path: impl AsRef<Path>, block_size: usize, blocks: u64) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(blocks * block_size as u64)?;
        Ok(Self {
            inner: Arc::new(file),
            block_size,
            blocks,
        })
    }

    /// Opens an existing image; the block count follows the file length.
    pub fn open(path: impl AsRef<Path>, block_size: usize, writable: bool) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;
        let len = file.metadata()?.len();
        if len % block_size as u64 != 0 {
            return Err(VdfsError::Invalid("image length is not block aligned"));
        }
        Ok(Self {
            inner: Arc::new(file),
            block_size,
            blocks: len / block_size as u64,
        })
    }

    #[cfg(unix)]
    fn read_exact(&self, off: u64, dst: &mut [u8]) -> io::Result<()> {
        stdio_unix::read_exact(&self.inner, off, dst)
    }

    #[cfg(windows)]
    fn read_exact(&self, off: u64, dst: &mut [u8]) -> io::Result<()> {
        stdio_win::read_exact(&self.inner, off, dst)
    }

    #[cfg(unix)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        stdio_unix::write_all(&self.inner, off, src)
    }

    #[cfg(windows)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        stdio_win::write_all(&self.inner, off, src)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_exact(&self, _off: u64, _dst: &mut [u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "FileDevice unsupported on this platform",
        ))
    }

    #[cfg(not(any(unix, windows)))]
    fn write_all(&self, _off: u64, _src: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "FileDevice unsupported on this platform",
        ))
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.blocks
    }

    fn read_blocks(&self, block: u64, dst: &mut [u8]) -> Result<()> {
        let off = check_span(self, block, dst.len())?;
        self.read_exact(off, dst).map_err(VdfsError::from)
    }

    fn write_blocks(&self, block: u64, src: &[u8]) -> Result<()> {
        let off = check_span(self, block, src.len())?;
        self.write_all(off, src).map_err(VdfsError::from)
    }

    fn flush(&self) -> Result<()> {
        tracing::trace!(target: "vdfs::io", "io.flush");
        self.inner.sync_all().map_err(VdfsError::from)
    }
}

/// In-memory device for tests and tooling.
pub struct MemDevice {
    block_size: usize,
    blocks: u64,
    data: RwLock<Vec<u8>>,
    flushes: AtomicU64,
    discarded: AtomicU64,
}

impl MemDevice {
    /// Creates a zero-filled device.
    pub fn new(block_size: usize, blocks: u64) -> Self {
        Self {
            block_size,
            blocks,
            data: RwLock::new(vec![0; block_size * blocks as usize]),
            flushes: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Flips bits at a byte offset, simulating media corruption.
    pub fn corrupt_byte(&self, byte_offset: u64, xor: u8) {
        let mut data = self.data.write();
        data[byte_offset as usize] ^= xor;
    }

    /// Copies the whole image.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Replaces the whole image.
    pub fn restore(&self, image: &[u8]) {
        let mut data = self.data.write();
        data.copy_from_slice(image);
    }

    /// Number of flush calls seen.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Number of blocks reported through `discard`.
    pub fn discarded_blocks(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

impl BlockDevice for MemDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.blocks
    }

    fn read_blocks(&self, block: u64, dst: &mut [u8]) -> Result<()> {
        let off = check_span(self, block, dst.len())? as usize;
        dst.copy_from_slice(&self.data.read()[off..off + dst.len()]);
        Ok(())
    }

    fn write_blocks(&self, block: u64, src: &[u8]) -> Result<()> {
        let off = check_span(self, block, src.len())? as usize;
        self.data.write()[off..off + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn discard(&self, _block: u64, count: u64) -> Result<()> {
        self.discarded.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }
}

/// Wraps a device and fails the next N operations.
///
/// Backs the `count=N` mount option.
pub struct FaultyDevice {
    inner: Arc<dyn BlockDevice>,
    remaining: AtomicU32,
}

impl FaultyDevice {
    /// Wraps `inner` with no failures armed.
    pub fn new(inner: Arc<dyn BlockDevice>) -> Self {
        Self {
            inner,
            remaining: AtomicU32::new(0),
        }
    }

    /// Arms `count` failing operations.
    pub fn arm(&self, count: u32) {
        self.remaining.store(count, Ordering::SeqCst);
    }

    /// Failures still armed.
    pub fn armed(&self) -> u32 {
        self.remaining.load(Ordering::SeqCst)
    }

    fn inject(&self, op: &'static str) -> Result<()> {
        let hit = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            warn!(target: "vdfs::io", op, "io.fault_injected");
            return Err(VdfsError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected I/O error",
            )));
        }
        Ok(())
    }
}

impl BlockDevice for FaultyDevice {
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn read_blocks(&self, block: u64, dst: &mut [u8]) -> Result<()> {
        self.inject("read")?;
        self.inner.read_blocks(block, dst)
    }

    fn write_blocks(&self, block: u64, src: &[u8]) -> Result<()> {
        self.inject("write")?;
        self.inner.write_blocks(block, src)
    }

    fn flush(&self) -> Result<()> {
        self.inject("flush")?;
        self.inner.flush()
    }

    fn discard(&self, block: u64, count: u64) -> Result<()> {
        self.inner.discard(block, count)
    }
}
