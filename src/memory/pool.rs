//! Buffer pool with slab and system-allocator variants.

use crate::config::DEFAULT_POOL_CAPACITY;
use crate::error::{report, Error, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Which allocation strategy a pool uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Integrated slab allocator: first-fit free list over one
    /// contiguous arena. `maxfree` is exact.
    Slab,
    /// Delegate to the system allocator. `maxfree` is reported
    /// conservatively as the total free budget.
    System,
}

impl PoolKind {
    /// The build-time default: slab unless the `system-alloc` feature
    /// is enabled.
    pub fn default_kind() -> Self {
        if cfg!(feature = "system-alloc") {
            PoolKind::System
        } else {
            PoolKind::Slab
        }
    }
}

/// Live pool statistics.
///
/// `maxfree` is the largest single contiguous free block; the flush
/// controller depends on it being tight for the slab variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes currently allocated.
    pub curalloc: usize,
    /// Total free bytes.
    pub totfree: usize,
    /// Largest contiguous free block in bytes.
    pub maxfree: usize,
    /// Lifetime number of successful acquires.
    pub gets: u64,
    /// Lifetime number of releases.
    pub releases: u64,
}

/// Contiguous backing storage for the slab variant.
///
/// A boxed slice keeps the memory pinned; blocks carve disjoint ranges
/// out of it and access them through raw pointers, the same loan shape
/// as a pool slot.
struct Arena {
    data: Box<[u8]>,
}

impl Arena {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
        }
    }

    fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr() as *mut u8
    }
}

struct PoolInner {
    kind: PoolKind,
    capacity: usize,
    /// Free extents, offset -> length. Slab variant only.
    free: BTreeMap<usize, usize>,
    curalloc: usize,
    maxusage: usize,
    gets: u64,
    releases: u64,
}

impl PoolInner {
    fn maxfree(&self) -> usize {
        match self.kind {
            PoolKind::Slab => self.free.values().copied().max().unwrap_or(0),
            PoolKind::System => self.capacity - self.curalloc,
        }
    }

    /// First-fit search. Returns the offset of a carved extent.
    fn take_extent(&mut self, n: usize) -> Option<usize> {
        let (off, flen) = self
            .free
            .iter()
            .find(|(_, flen)| **flen >= n)
            .map(|(off, flen)| (*off, *flen))?;
        self.free.remove(&off);
        if flen > n {
            self.free.insert(off + n, flen - n);
        }
        Some(off)
    }

    /// Return an extent, coalescing with both neighbors.
    fn put_extent(&mut self, mut off: usize, mut len: usize) {
        if len == 0 {
            return;
        }
        if let Some((&prev_off, &prev_len)) = self.free.range(..off).next_back() {
            debug_assert!(prev_off + prev_len <= off, "overlapping free extents");
            if prev_off + prev_len == off {
                self.free.remove(&prev_off);
                off = prev_off;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(off + len)) {
            self.free.remove(&(off + len));
            len += next_len;
        }
        self.free.insert(off, len);
    }

    fn note_alloc(&mut self, n: usize) {
        self.curalloc += n;
        self.gets += 1;
        if self.curalloc > self.maxusage {
            self.maxusage = self.curalloc;
        }
    }
}

struct PoolShared {
    arena: Option<Arena>,
    inner: Mutex<PoolInner>,
}

/// A buffer pool with acquire/grow/release primitives and live stats.
///
/// One pool per task, shared across all of that task's files. Blocks
/// are zero-filled on acquire. Double release is unrepresentable:
/// [`BufferPool::release`] consumes the block, and dropping a block
/// releases it exactly once.
///
/// # Example
///
/// ```rust
/// use pario::memory::BufferPool;
///
/// let pool = BufferPool::with_capacity(4096);
/// let mut block = pool.acquire(128).unwrap();
/// block.as_mut_slice()[0] = 7;
/// assert_eq!(pool.stats().curalloc, 128);
/// pool.release(block);
/// assert_eq!(pool.stats().curalloc, 0);
/// ```
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Create a pool of the build-time default kind with the default
    /// capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY)
    }

    /// Create a pool of the build-time default kind with an explicit
    /// capacity in bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_kind(PoolKind::default_kind(), capacity)
    }

    /// Create a pool of an explicit kind and capacity.
    pub fn with_kind(kind: PoolKind, capacity: usize) -> Self {
        let arena = match kind {
            PoolKind::Slab => Some(Arena::new(capacity)),
            PoolKind::System => None,
        };
        let mut free = BTreeMap::new();
        if kind == PoolKind::Slab {
            free.insert(0, capacity);
        }
        Self {
            shared: Arc::new(PoolShared {
                arena,
                inner: Mutex::new(PoolInner {
                    kind,
                    capacity,
                    free,
                    curalloc: 0,
                    maxusage: 0,
                    gets: 0,
                    releases: 0,
                }),
            }),
        }
    }

    /// Acquire a zero-filled contiguous block of at least `n` bytes.
    pub fn acquire(&self, n: usize) -> Result<PoolBlock> {
        let mut inner = self.shared.inner.lock().expect("pool lock poisoned");
        let repr = match inner.kind {
            PoolKind::Slab => {
                if n == 0 {
                    inner.note_alloc(0);
                    BlockRepr::Slab { offset: 0, len: 0 }
                } else {
                    let Some(offset) = inner.take_extent(n) else {
                        let maxfree = inner.maxfree();
                        return Err(report(Error::OutOfMemory {
                            requested: n,
                            maxfree,
                        }));
                    };
                    inner.note_alloc(n);
                    // Freed extents carry stale bytes.
                    let arena = self.shared.arena.as_ref().expect("slab pool has arena");
                    unsafe { std::ptr::write_bytes(arena.as_ptr().add(offset), 0, n) };
                    BlockRepr::Slab { offset, len: n }
                }
            }
            PoolKind::System => {
                if inner.curalloc + n > inner.capacity {
                    let maxfree = inner.maxfree();
                    return Err(report(Error::OutOfMemory {
                        requested: n,
                        maxfree,
                    }));
                }
                inner.note_alloc(n);
                BlockRepr::Sys { buf: vec![0u8; n] }
            }
        };
        drop(inner);
        Ok(PoolBlock {
            shared: Arc::clone(&self.shared),
            repr,
        })
    }

    /// Grow (or shrink) a block to `n` bytes, preserving its contents.
    ///
    /// The realloc analogue: extends in place when the adjoining extent
    /// is free, otherwise moves. On failure the block is unchanged and
    /// still valid. Newly exposed bytes are zeroed.
    pub fn grow(&self, block: &mut PoolBlock, n: usize) -> Result<()> {
        debug_assert!(
            Arc::ptr_eq(&self.shared, &block.shared),
            "block grown through a foreign pool"
        );
        let mut inner = self.shared.inner.lock().expect("pool lock poisoned");
        match &mut block.repr {
            BlockRepr::Slab { offset, len } => {
                let arena = self.shared.arena.as_ref().expect("slab pool has arena");
                if n == *len {
                    return Ok(());
                }
                if n < *len {
                    inner.put_extent(*offset + n, *len - n);
                    inner.curalloc -= *len - n;
                    *len = n;
                    return Ok(());
                }
                let delta = n - *len;
                // In place: eat the head of the adjoining free extent.
                let tail = *offset + *len;
                if *len > 0 {
                    if let Some(&flen) = inner.free.get(&tail) {
                        if flen >= delta {
                            inner.free.remove(&tail);
                            if flen > delta {
                                inner.free.insert(tail + delta, flen - delta);
                            }
                            inner.curalloc += delta;
                            if inner.curalloc > inner.maxusage {
                                inner.maxusage = inner.curalloc;
                            }
                            unsafe { std::ptr::write_bytes(arena.as_ptr().add(tail), 0, delta) };
                            *len = n;
                            return Ok(());
                        }
                    }
                }
                // Move: carve a fresh extent, copy, free the old one.
                let Some(new_off) = inner.take_extent(n) else {
                    let maxfree = inner.maxfree();
                    return Err(report(Error::OutOfMemory {
                        requested: n,
                        maxfree,
                    }));
                };
                unsafe {
                    let src = arena.as_ptr().add(*offset);
                    let dst = arena.as_ptr().add(new_off);
                    std::ptr::copy_nonoverlapping(src, dst, *len);
                    std::ptr::write_bytes(dst.add(*len), 0, n - *len);
                }
                let (old_off, old_len) = (*offset, *len);
                inner.put_extent(old_off, old_len);
                inner.curalloc += n - old_len;
                if inner.curalloc > inner.maxusage {
                    inner.maxusage = inner.curalloc;
                }
                *offset = new_off;
                *len = n;
                Ok(())
            }
            BlockRepr::Sys { buf } => {
                let old = buf.len();
                if n > old && inner.curalloc + (n - old) > inner.capacity {
                    let maxfree = inner.maxfree();
                    return Err(report(Error::OutOfMemory {
                        requested: n,
                        maxfree,
                    }));
                }
                buf.resize(n, 0);
                if n >= old {
                    inner.curalloc += n - old;
                } else {
                    inner.curalloc -= old - n;
                }
                if inner.curalloc > inner.maxusage {
                    inner.maxusage = inner.curalloc;
                }
                Ok(())
            }
        }
    }

    /// Return a block to the pool.
    ///
    /// Dropping the block has the same effect; this form reads better
    /// at call sites that release eagerly.
    pub fn release(&self, block: PoolBlock) {
        drop(block);
    }

    /// Snapshot the pool statistics.
    pub fn stats(&self) -> PoolStats {
        let inner = self.shared.inner.lock().expect("pool lock poisoned");
        PoolStats {
            curalloc: inner.curalloc,
            totfree: inner.capacity - inner.curalloc,
            maxfree: inner.maxfree(),
            gets: inner.gets,
            releases: inner.releases,
        }
    }

    /// Trace the high-water mark and current accounting.
    pub fn usage_report(&self) {
        let inner = self.shared.inner.lock().expect("pool lock poisoned");
        tracing::debug!(
            curalloc = inner.curalloc,
            maxusage = inner.maxusage,
            gets = inner.gets,
            releases = inner.releases,
            "buffer pool usage"
        );
    }

    /// Pool capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.shared.inner.lock().expect("pool lock poisoned").capacity
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for BufferPool {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

enum BlockRepr {
    Slab { offset: usize, len: usize },
    Sys { buf: Vec<u8> },
}

/// A block loaned from a [`BufferPool`].
///
/// The extent returns to the pool when the block is dropped.
pub struct PoolBlock {
    shared: Arc<PoolShared>,
    repr: BlockRepr,
}

impl std::fmt::Debug for PoolBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBlock").field("len", &self.len()).finish()
    }
}

impl PoolBlock {
    /// Length of the block in bytes.
    pub fn len(&self) -> usize {
        match &self.repr {
            BlockRepr::Slab { len, .. } => *len,
            BlockRepr::Sys { buf } => buf.len(),
        }
    }

    /// Returns true if the block has zero length.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// View the block as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        match &self.repr {
            BlockRepr::Slab { offset, len } => {
                let arena = self.shared.arena.as_ref().expect("slab block has arena");
                unsafe { std::slice::from_raw_parts(arena.as_ptr().add(*offset), *len) }
            }
            BlockRepr::Sys { buf } => buf,
        }
    }

    /// View the block as a mutable byte slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.repr {
            BlockRepr::Slab { offset, len } => {
                let arena = self.shared.arena.as_ref().expect("slab block has arena");
                unsafe { std::slice::from_raw_parts_mut(arena.as_ptr().add(*offset), *len) }
            }
            BlockRepr::Sys { buf } => buf,
        }
    }
}

impl Drop for PoolBlock {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock().expect("pool lock poisoned");
        inner.releases += 1;
        match &self.repr {
            BlockRepr::Slab { offset, len } => {
                inner.curalloc -= *len;
                inner.put_extent(*offset, *len);
            }
            BlockRepr::Sys { buf } => {
                inner.curalloc -= buf.len();
            }
        }
    }
}
