#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the `BlockDevice` trait consumed by every storage component,
//! byte-addressed backends (file and memory), a write-back [`BufferCache`]
//! with dirty tracking, and a striped [`BlockLockTable`] used to serialize
//! read-modify-write cycles on shared metadata blocks.

use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use vfs_error::{Result, VfsError};
use vfs_types::BlockNumber;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

// ── Byte devices ────────────────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(offset: u64, len: usize, device_len: u64, op: &str) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| VfsError::Format(format!("{op} length overflows u64")))?,
        )
        .ok_or_else(|| VfsError::Format(format!("{op} range overflows u64")))?;
    if end > device_len {
        return Err(VfsError::Format(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device.
///
/// Uses `std::os::unix::fs::FileExt`, so concurrent readers and writers do
/// not share a seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open an existing image, falling back to read-only access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create (or truncate) an image file of exactly `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(VfsError::PermissionDenied);
        }
        check_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device.
///
/// Backs unit tests and tooling that builds images without touching disk.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range(offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(u64::MAX), "read")?;
        let start =
            usize::try_from(offset).map_err(|_| VfsError::Format("offset overflow".into()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_range(offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(u64::MAX), "write")?;
        let start =
            usize::try_from(offset).map_err(|_| VfsError::Format("offset overflow".into()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Block devices ───────────────────────────────────────────────────────────

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for Arc<T> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        (**self).read_block(block)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        (**self).write_block(block, data)
    }

    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

fn block_len(block_size: u32) -> Result<usize> {
    usize::try_from(block_size).map_err(|_| VfsError::Format("block_size does not fit usize".into()))
}

/// Adapts a [`ByteDevice`] to fixed-size block I/O.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(VfsError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(VfsError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        Ok(Self {
            inner,
            block_size,
            block_count: len / block_size_u64,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn offset_of(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(VfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| VfsError::Format("block offset overflow".into()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.offset_of(block)?;
        let mut buf = vec![0_u8; block_len(self.block_size)?];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = block_len(self.block_size)?;
        if data.len() != expected {
            return Err(VfsError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        let offset = self.offset_of(block)?;
        self.inner.write_all_at(offset, data)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

// ── Buffer cache ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct CachedBlock {
    bytes: Vec<u8>,
    dirty: bool,
    last_use: u64,
}

#[derive(Debug)]
struct CacheState {
    capacity: usize,
    tick: u64,
    entries: HashMap<BlockNumber, CachedBlock>,
    /// Recency order: tick -> block. The smallest tick is the LRU victim.
    lru: BTreeMap<u64, BlockNumber>,
}

impl CacheState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: 0,
            entries: HashMap::new(),
            lru: BTreeMap::new(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, block: BlockNumber) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(&block) {
            let _ = self.lru.remove(&entry.last_use);
            entry.last_use = tick;
            self.lru.insert(tick, block);
        }
    }

    fn put(&mut self, block: BlockNumber, bytes: Vec<u8>, dirty: bool) {
        let tick = self.next_tick();
        if let Some(old) = self.entries.insert(
            block,
            CachedBlock {
                bytes,
                dirty,
                last_use: tick,
            },
        ) {
            let _ = self.lru.remove(&old.last_use);
        }
        self.lru.insert(tick, block);
    }

    /// Least recently used entry, once the cache is over capacity.
    fn victim(&self) -> Option<BlockNumber> {
        if self.entries.len() <= self.capacity {
            return None;
        }
        self.lru.first_key_value().map(|(_, block)| *block)
    }

    fn remove(&mut self, block: BlockNumber) {
        if let Some(entry) = self.entries.remove(&block) {
            let _ = self.lru.remove(&entry.last_use);
        }
    }
}

/// Write-back cache around a [`BlockDevice`].
///
/// - `write_block` stores the block and marks it dirty; subsequent reads of
///   the same block observe the new bytes.
/// - `flush` writes every dirty block back in ascending block order.
/// - Evicting a dirty block writes it back before dropping it. A failed
///   write-back leaves the block cached and dirty.
/// - A miss reads the inner device under the cache lock, so no write can
///   land between the read and the insert.
#[derive(Debug)]
pub struct BufferCache<D: BlockDevice> {
    inner: D,
    state: Mutex<CacheState>,
}

impl<D: BlockDevice> BufferCache<D> {
    pub fn new(inner: D, capacity_blocks: usize) -> Result<Self> {
        if capacity_blocks == 0 {
            return Err(VfsError::Format(
                "BufferCache capacity_blocks must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            inner,
            state: Mutex::new(CacheState::new(capacity_blocks)),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// Number of blocks written but not yet flushed.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.state.lock().entries.values().filter(|e| e.dirty).count()
    }

    /// Write all dirty blocks back to the inner device.
    pub fn flush(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let mut dirty: Vec<BlockNumber> = guard
            .entries
            .iter()
            .filter_map(|(block, entry)| entry.dirty.then_some(*block))
            .collect();
        dirty.sort_unstable();
        for block in &dirty {
            if let Some(entry) = guard.entries.get_mut(block) {
                self.inner.write_block(*block, &entry.bytes)?;
                entry.dirty = false;
            }
        }
        drop(guard);
        if !dirty.is_empty() {
            debug!(flushed = dirty.len(), "buffer_cache_flush");
        }
        Ok(())
    }

    fn evict_over_capacity(&self, state: &mut CacheState) -> Result<()> {
        while let Some(block) = state.victim() {
            if let Some(entry) = state.entries.get(&block).filter(|e| e.dirty) {
                trace!(block = block.0, "buffer_cache_writeback_evict");
                if let Err(err) = self.inner.write_block(block, &entry.bytes) {
                    warn!(block = block.0, error = %err, "buffer_cache_writeback_failed");
                    return Err(err);
                }
            }
            state.remove(block);
        }
        Ok(())
    }
}

impl<D: BlockDevice> BlockDevice for BufferCache<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let mut guard = self.state.lock();
        if let Some(bytes) = guard.entries.get(&block).map(|e| e.bytes.clone()) {
            guard.touch(block);
            drop(guard);
            return Ok(BlockBuf::new(bytes));
        }

        // Held across the miss: a write and eviction of this block in the gap
        // would otherwise leave the device bytes cached as clean.
        let buf = self.inner.read_block(block)?;
        guard.put(block, buf.as_slice().to_vec(), false);
        self.evict_over_capacity(&mut guard)?;
        drop(guard);
        Ok(buf)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = block_len(self.inner.block_size())?;
        if data.len() != expected {
            return Err(VfsError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        if block.0 >= self.inner.block_count() {
            return Err(VfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0,
                self.inner.block_count()
            )));
        }
        let mut guard = self.state.lock();
        guard.put(block, data.to_vec(), true);
        self.evict_over_capacity(&mut guard)?;
        drop(guard);
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self) -> Result<()> {
        self.flush()?;
        self.inner.sync()
    }
}

// ── Block lock table ────────────────────────────────────────────────────────

/// Striped mutexes keyed by block number.
///
/// Holding the guard for a block serializes read-modify-write cycles of
/// that block against every other holder of the same stripe.
#[derive(Debug)]
pub struct BlockLockTable {
    stripes: Vec<Mutex<()>>,
}

impl BlockLockTable {
    pub const DEFAULT_STRIPES: usize = 64;

    #[must_use]
    pub fn new(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn lock(&self, block: BlockNumber) -> MutexGuard<'_, ()> {
        let idx = (block.0 % self.stripes.len() as u64) as usize;
        self.stripes[idx].lock()
    }
}

impl Default for BlockLockTable {
    fn default() -> Self {
        Self::new(Self::DEFAULT_STRIPES)
    }
}

/// Convenience constructor for an in-memory block device of `blocks` blocks.
pub fn mem_block_device(block_size: u32, blocks: u64) -> Result<ByteBlockDevice<MemByteDevice>> {
    let len = usize::try_from(u64::from(block_size) * blocks)
        .map_err(|_| VfsError::Format("device size does not fit usize".into()))?;
    ByteBlockDevice::new(MemByteDevice::new(len), block_size)
}
