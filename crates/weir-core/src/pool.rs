//! Reference-counted buffer pool with best-fit reuse and idle reclamation.
//!
//! The [`BufferPool`] owns every byte the engine touches. Pool blocks are
//! handed out as opaque [`BlockId`] handles; ports store handles plus offsets
//! and never hold raw slices across calls. Client buffers at the topology
//! boundary are registered as *external* blocks in the same arena so that the
//! copy engine can address both kinds through one owner.
//!
//! # Free list
//!
//! Free blocks are kept in a vector sorted ascending by size. [`acquire`]
//! returns the first block whose size is at least the request ("best fit from
//! above"). [`release`] inserts a block before the first entry of equal or
//! larger size, so among equal sizes the most recently released is reused
//! first.
//!
//! # Reclamation
//!
//! Blocks at the tail of the free list (largest, least recently needed) age
//! by one step per reclaim interval. Once a tail block reaches
//! [`PoolConfig::max_unused_count`] it is freed. Reclamation is skipped while
//! the [`PoolHost`] reports a low-power residency vote.
//!
//! [`acquire`]: BufferPool::acquire
//! [`release`]: BufferPool::release

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, vec, vec::Vec};

use crate::error::PoolError;

/// Default interval between two idle reclamation passes, in microseconds.
pub const DEFAULT_RECLAIM_INTERVAL_US: u64 = 100_000;

/// Default staleness count after which a free block is destroyed.
pub const DEFAULT_MAX_UNUSED_COUNT: u32 = 5;

/// Opaque handle to a block in the pool's arena.
///
/// The generation guards against use of a handle after its block was freed
/// and the slot recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl BlockId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// Buffer retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolMode {
    /// Emptied buffers always go back to the pool.
    #[default]
    Normal,
    /// Emptied buffers may stay at real-time ports across cycles, and output
    /// ports may borrow space in the next real input's buffer.
    LowLatency,
}

/// Pool tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Retention policy.
    pub mode: PoolMode,
    /// Minimum time between two reclamation passes.
    pub reclaim_interval_us: u64,
    /// Staleness at which a free tail block is destroyed.
    pub max_unused_count: u32,
    /// Upper bound on bytes held by pool blocks (`None` = unbounded).
    pub max_total_bytes: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            mode: PoolMode::Normal,
            reclaim_interval_us: DEFAULT_RECLAIM_INTERVAL_US,
            max_unused_count: DEFAULT_MAX_UNUSED_COUNT,
            max_total_bytes: None,
        }
    }
}

/// Capabilities the pool needs from its environment.
pub trait PoolHost {
    /// Monotonic time in microseconds.
    fn now_us(&self) -> u64;

    /// Whether the container currently votes to stay in low-power residency.
    fn low_power_vote(&self) -> bool {
        false
    }

    /// Leave the restricted low-power context before heap work.
    fn exit_low_power_temporarily(&mut self) {}
}

/// Host with a frozen clock and no low-power residency.
///
/// With a frozen clock idle reclamation never runs, which suits embedded
/// builds without a timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHost;

impl PoolHost for NoopHost {
    fn now_us(&self) -> u64 {
        0
    }
}

/// Host backed by [`std::time::Instant`].
#[cfg(feature = "std")]
#[derive(Debug, Clone, Copy)]
pub struct StdHost {
    start: std::time::Instant,
}

#[cfg(feature = "std")]
impl Default for StdHost {
    fn default() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl PoolHost for StdHost {
    fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

/// Counters describing pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Pool blocks currently allocated (leased + free).
    pub allocated_blocks: usize,
    /// Pool blocks currently leased to ports.
    pub leased_blocks: usize,
    /// Pool blocks on the free list.
    pub free_blocks: usize,
    /// Bytes held by pool blocks.
    pub allocated_bytes: usize,
    /// Highest number of simultaneously leased blocks.
    pub peak_leased_blocks: usize,
    /// External blocks registered by the container.
    pub external_blocks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Pooled,
    External,
}

#[derive(Debug)]
struct Block {
    data: Box<[u8]>,
    kind: BlockKind,
    ref_count: u32,
    unused_count: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    block: Option<Block>,
}

#[derive(Debug, Clone, Copy)]
struct FreeEntry {
    size: usize,
    id: BlockId,
}

/// Owned pool of reusable byte blocks.
pub struct BufferPool {
    config: PoolConfig,
    host: Box<dyn PoolHost + Send>,
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    free: Vec<FreeEntry>,
    stats: PoolStats,
    last_reclaim_us: u64,
}

impl core::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferPool")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .field("free", &self.free.len())
            .finish_non_exhaustive()
    }
}

impl BufferPool {
    /// Creates a pool with the default host for the build.
    pub fn new(config: PoolConfig) -> Self {
        #[cfg(feature = "std")]
        let host: Box<dyn PoolHost + Send> = Box::new(StdHost::default());
        #[cfg(not(feature = "std"))]
        let host: Box<dyn PoolHost + Send> = Box::new(NoopHost);
        Self::with_host(config, host)
    }

    /// Creates a pool that consults `host` for time and low-power state.
    pub fn with_host(config: PoolConfig, host: Box<dyn PoolHost + Send>) -> Self {
        Self {
            config,
            host,
            slots: Vec::new(),
            vacant: Vec::new(),
            free: Vec::new(),
            stats: PoolStats::default(),
            last_reclaim_us: 0,
        }
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns the retention policy.
    pub fn mode(&self) -> PoolMode {
        self.config.mode
    }

    /// Switches the retention policy.
    pub fn set_mode(&mut self, mode: PoolMode) {
        self.config.mode = mode;
    }

    /// Returns occupancy counters.
    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Sizes of the free blocks in free-list order (ascending).
    pub fn free_sizes(&self) -> impl Iterator<Item = usize> + '_ {
        self.free.iter().map(|e| e.size)
    }

    /// Leases a block of at least `size` bytes.
    ///
    /// Returns `Ok(None)` for a zero-size request.
    pub fn acquire(&mut self, size: usize) -> Result<Option<BlockId>, PoolError> {
        if size == 0 {
            return Ok(None);
        }

        let pos = self.free.partition_point(|e| e.size < size);
        let id = if pos < self.free.len() {
            let entry = self.free.remove(pos);
            let block = self.block_mut(entry.id)?;
            block.ref_count = 1;
            block.unused_count = 0;
            self.stats.free_blocks -= 1;
            entry.id
        } else {
            self.host.exit_low_power_temporarily();
            let id = self.allocate(size)?;
            #[cfg(feature = "tracing")]
            tracing::debug!(
                "pool_alloc: {id} of {size} bytes, {} blocks allocated",
                self.stats.allocated_blocks
            );
            id
        };

        self.stats.leased_blocks += 1;
        self.stats.peak_leased_blocks = self.stats.peak_leased_blocks.max(self.stats.leased_blocks);
        self.reclaim_idle();
        Ok(Some(id))
    }

    /// Adds a lease on an already leased block.
    pub fn add_ref(&mut self, id: BlockId) -> Result<(), PoolError> {
        let block = self.block_mut(id)?;
        if block.kind == BlockKind::External {
            return Err(PoolError::NotPooled(id));
        }
        if block.ref_count == 0 {
            return Err(PoolError::DoubleRelease(id));
        }
        block.ref_count += 1;
        Ok(())
    }

    /// Drops one lease. Returns `true` when the block went back to the free list.
    pub fn release(&mut self, id: BlockId) -> Result<bool, PoolError> {
        let block = self.block_mut(id)?;
        if block.kind == BlockKind::External {
            return Err(PoolError::NotPooled(id));
        }
        if block.ref_count == 0 {
            return Err(PoolError::DoubleRelease(id));
        }
        block.ref_count -= 1;
        if block.ref_count > 0 {
            return Ok(false);
        }
        block.unused_count = 0;
        let size = block.data.len();

        let pos = self.free.partition_point(|e| e.size < size);
        self.free.insert(pos, FreeEntry { size, id });
        self.stats.free_blocks += 1;
        self.stats.leased_blocks -= 1;

        self.reclaim_idle();
        Ok(true)
    }

    /// Current reference count of a pool block.
    pub fn ref_count(&self, id: BlockId) -> Option<u32> {
        self.block(id).ok().map(|b| b.ref_count)
    }

    /// Size in bytes of any live block.
    pub fn block_size(&self, id: BlockId) -> Option<usize> {
        self.block(id).ok().map(|b| b.data.len())
    }

    /// Whether the handle refers to a live block.
    pub fn is_live(&self, id: BlockId) -> bool {
        self.block(id).is_ok()
    }

    /// Rate-limited aging and destruction of stale free blocks.
    pub fn reclaim_idle(&mut self) {
        if self.free.is_empty() {
            return;
        }

        let now = self.host.now_us();
        if now.saturating_sub(self.last_reclaim_us) < self.config.reclaim_interval_us {
            return;
        }
        self.last_reclaim_us = now;

        if !self.host.low_power_vote() {
            self.destroy_stale_tail();
        }

        let max = self.config.max_unused_count;
        for entry in self.free.iter().rev() {
            let Some(Some(block)) = self
                .slots
                .get_mut(entry.id.index as usize)
                .map(|s| s.block.as_mut())
            else {
                continue;
            };
            if block.unused_count < max {
                block.unused_count += 1;
                break;
            }
        }
    }

    /// Destroys every block on the free list.
    pub fn destroy_all_unused(&mut self) {
        if self.free.is_empty() {
            return;
        }
        self.host.exit_low_power_temporarily();
        while let Some(entry) = self.free.pop() {
            self.destroy(entry.id);
        }
    }

    /// Registers a container-owned buffer in the arena.
    pub fn attach_external(&mut self, data: Vec<u8>) -> BlockId {
        let id = self.insert(Block {
            data: data.into_boxed_slice(),
            kind: BlockKind::External,
            ref_count: 0,
            unused_count: 0,
        });
        self.stats.external_blocks += 1;
        id
    }

    /// Removes an external buffer from the arena and hands it back.
    pub fn detach_external(&mut self, id: BlockId) -> Result<Vec<u8>, PoolError> {
        if self.block(id)?.kind != BlockKind::External {
            return Err(PoolError::NotPooled(id));
        }
        let slot = &mut self.slots[id.index as usize];
        let block = slot.block.take().ok_or(PoolError::StaleHandle(id))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(id.index);
        self.stats.external_blocks -= 1;
        Ok(block.data.into_vec())
    }

    /// Bytes of a live block.
    pub fn bytes(&self, id: BlockId) -> Option<&[u8]> {
        self.block(id).ok().map(|b| &b.data[..])
    }

    /// Mutable bytes of a live block.
    pub fn bytes_mut(&mut self, id: BlockId) -> Option<&mut [u8]> {
        self.block_mut(id).ok().map(|b| &mut b.data[..])
    }

    /// Borrows two distinct live blocks at once.
    pub fn pair_mut(&mut self, a: BlockId, b: BlockId) -> Option<(&mut [u8], &mut [u8])> {
        if a.index == b.index || !self.is_live(a) || !self.is_live(b) {
            return None;
        }
        let (lo, hi, swapped) = if a.index < b.index {
            (a.index as usize, b.index as usize, false)
        } else {
            (b.index as usize, a.index as usize, true)
        };
        let (head, tail) = self.slots.split_at_mut(hi);
        let lo_block = head[lo].block.as_mut()?;
        let hi_block = tail[0].block.as_mut()?;
        let (x, y) = (&mut lo_block.data[..], &mut hi_block.data[..]);
        if swapped { Some((y, x)) } else { Some((x, y)) }
    }

    /// Copies `len` bytes between two locations, which may share a block.
    ///
    /// Returns the number of bytes copied, clamped to both block bounds.
    pub fn copy_bytes(
        &mut self,
        src: BlockId,
        src_offset: usize,
        dst: BlockId,
        dst_offset: usize,
        len: usize,
    ) -> usize {
        if len == 0 {
            return 0;
        }
        if src == dst {
            let Some(data) = self.bytes_mut(src) else {
                return 0;
            };
            let n = len
                .min(data.len().saturating_sub(src_offset))
                .min(data.len().saturating_sub(dst_offset));
            data.copy_within(src_offset..src_offset + n, dst_offset);
            return n;
        }
        let Some((s, d)) = self.pair_mut(src, dst) else {
            return 0;
        };
        let n = len
            .min(s.len().saturating_sub(src_offset))
            .min(d.len().saturating_sub(dst_offset));
        d[dst_offset..dst_offset + n].copy_from_slice(&s[src_offset..src_offset + n]);
        n
    }

    /// Moves bytes inside one block (`memmove` semantics).
    pub fn move_within(&mut self, id: BlockId, src_offset: usize, dst_offset: usize, len: usize) {
        if len == 0 || src_offset == dst_offset {
            return;
        }
        if let Some(data) = self.bytes_mut(id) {
            let n = len
                .min(data.len().saturating_sub(src_offset))
                .min(data.len().saturating_sub(dst_offset));
            data.copy_within(src_offset..src_offset + n, dst_offset);
        }
    }

    /// Zeroes `len` bytes starting at `offset`.
    pub fn zero(&mut self, id: BlockId, offset: usize, len: usize) {
        if let Some(data) = self.bytes_mut(id) {
            let end = (offset + len).min(data.len());
            if offset < end {
                data[offset..end].fill(0);
            }
        }
    }

    fn allocate(&mut self, size: usize) -> Result<BlockId, PoolError> {
        if let Some(limit) = self.config.max_total_bytes {
            if self.stats.allocated_bytes + size > limit {
                #[cfg(feature = "tracing")]
                tracing::error!("pool_alloc: {size} bytes would exceed limit {limit}");
                return Err(PoolError::OutOfMemory {
                    requested: size,
                    limit,
                });
            }
        }

        let mut data = Vec::new();
        if data.try_reserve_exact(size).is_err() {
            return Err(PoolError::OutOfMemory {
                requested: size,
                limit: self.config.max_total_bytes.unwrap_or(usize::MAX),
            });
        }
        data.resize(size, 0u8);

        let id = self.insert(Block {
            data: data.into_boxed_slice(),
            kind: BlockKind::Pooled,
            ref_count: 1,
            unused_count: 0,
        });
        self.stats.allocated_blocks += 1;
        self.stats.allocated_bytes += size;
        Ok(id)
    }

    fn insert(&mut self, block: Block) -> BlockId {
        if let Some(index) = self.vacant.pop() {
            let slot = &mut self.slots[index as usize];
            slot.block = Some(block);
            BlockId::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                block: Some(block),
            });
            BlockId::new(index, 0)
        }
    }

    fn destroy_stale_tail(&mut self) {
        let max = self.config.max_unused_count;
        while let Some(last) = self.free.last().copied() {
            let stale = self
                .block(last.id)
                .map(|b| b.unused_count >= max)
                .unwrap_or(true);
            if !stale {
                break;
            }
            self.free.pop();
            self.host.exit_low_power_temporarily();
            self.destroy(last.id);
            #[cfg(feature = "tracing")]
            tracing::debug!(
                "pool_reclaim: destroyed {} ({} bytes), {} blocks remain",
                last.id,
                last.size,
                self.stats.allocated_blocks
            );
        }
    }

    fn destroy(&mut self, id: BlockId) {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return;
        };
        if slot.generation != id.generation {
            return;
        }
        if let Some(block) = slot.block.take() {
            slot.generation = slot.generation.wrapping_add(1);
            self.vacant.push(id.index);
            self.stats.allocated_blocks -= 1;
            self.stats.free_blocks -= 1;
            self.stats.allocated_bytes -= block.data.len();
        }
    }

    fn block(&self, id: BlockId) -> Result<&Block, PoolError> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.block.as_ref())
            .ok_or(PoolError::StaleHandle(id))
    }

    fn block_mut(&mut self, id: BlockId) -> Result<&mut Block, PoolError> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.block.as_mut())
            .ok_or(PoolError::StaleHandle(id))
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

    /// Host with a hand-driven clock.
    #[derive(Default)]
    struct TestHost {
        now: AtomicU64,
        island: AtomicBool,
        exits: AtomicU32,
    }

    impl PoolHost for Arc<TestHost> {
        fn now_us(&self) -> u64 {
            self.now.load(Ordering::Relaxed)
        }
        fn low_power_vote(&self) -> bool {
            self.island.load(Ordering::Relaxed)
        }
        fn exit_low_power_temporarily(&mut self) {
            self.exits.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn harness(max_unused: u32) -> (BufferPool, Arc<TestHost>) {
        let host = Arc::new(TestHost::default());
        let config = PoolConfig {
            reclaim_interval_us: 10,
            max_unused_count: max_unused,
            ..PoolConfig::default()
        };
        (BufferPool::with_host(config, Box::new(host.clone())), host)
    }

    #[test]
    fn zero_size_is_noop() {
        let mut pool = BufferPool::default();
        assert_eq!(pool.acquire(0), Ok(None));
        assert_eq!(pool.stats().allocated_blocks, 0);
    }

    #[test]
    fn miss_allocates_and_exits_low_power() {
        let (mut pool, host) = harness(5);
        let id = pool.acquire(64).unwrap().unwrap();
        assert_eq!(pool.block_size(id), Some(64));
        assert_eq!(pool.ref_count(id), Some(1));
        assert_eq!(host.exits.load(Ordering::Relaxed), 1);
        assert_eq!(pool.stats().leased_blocks, 1);
    }

    #[test]
    fn best_fit_from_above() {
        let mut pool = BufferPool::default();
        let ids: Vec<_> = [32, 128, 64]
            .iter()
            .map(|&s| pool.acquire(s).unwrap().unwrap())
            .collect();
        for id in &ids {
            pool.release(*id).unwrap();
        }
        assert_eq!(pool.free_sizes().collect::<Vec<_>>(), vec![32, 64, 128]);

        let got = pool.acquire(40).unwrap().unwrap();
        assert_eq!(pool.block_size(got), Some(64));
        assert_eq!(pool.free_sizes().collect::<Vec<_>>(), vec![32, 128]);
    }

    #[test]
    fn equal_sizes_reuse_most_recent() {
        let mut pool = BufferPool::default();
        let a = pool.acquire(48).unwrap().unwrap();
        let b = pool.acquire(48).unwrap().unwrap();
        pool.release(a).unwrap();
        pool.release(b).unwrap();
        assert_eq!(pool.acquire(48).unwrap(), Some(b));
    }

    #[test]
    fn shared_block_returns_after_last_release() {
        let mut pool = BufferPool::default();
        let id = pool.acquire(16).unwrap().unwrap();
        pool.add_ref(id).unwrap();
        assert_eq!(pool.release(id), Ok(false));
        assert_eq!(pool.stats().free_blocks, 0);
        assert_eq!(pool.release(id), Ok(true));
        assert_eq!(pool.stats().free_blocks, 1);
    }

    #[test]
    fn double_release_is_rejected() {
        let mut pool = BufferPool::default();
        let id = pool.acquire(16).unwrap().unwrap();
        pool.release(id).unwrap();
        assert_eq!(pool.release(id), Err(PoolError::DoubleRelease(id)));
        assert_eq!(pool.stats().free_blocks, 1);
    }

    #[test]
    fn byte_limit_reports_out_of_memory() {
        let mut pool = BufferPool::new(PoolConfig {
            max_total_bytes: Some(100),
            ..PoolConfig::default()
        });
        pool.acquire(80).unwrap();
        assert_eq!(
            pool.acquire(40),
            Err(PoolError::OutOfMemory {
                requested: 40,
                limit: 100
            })
        );
    }

    #[test]
    fn idle_tail_is_reclaimed_after_aging() {
        let (mut pool, host) = harness(2);
        let small = pool.acquire(8).unwrap().unwrap();
        let big = pool.acquire(256).unwrap().unwrap();
        pool.release(small).unwrap();
        pool.release(big).unwrap();

        // Two aging steps on the tail, then the next pass destroys it.
        for step in 1..=3 {
            host.now.store(step * 10, Ordering::Relaxed);
            pool.reclaim_idle();
        }
        assert_eq!(pool.free_sizes().collect::<Vec<_>>(), vec![8]);
        assert!(!pool.is_live(big));
        assert_eq!(pool.stats().allocated_bytes, 8);
    }

    #[test]
    fn reclaim_is_rate_limited() {
        let (mut pool, host) = harness(1);
        let id = pool.acquire(8).unwrap().unwrap();
        pool.release(id).unwrap();
        host.now.store(10, Ordering::Relaxed);
        pool.reclaim_idle();
        host.now.store(15, Ordering::Relaxed);
        pool.reclaim_idle();
        assert!(pool.is_live(id), "second pass inside the interval must not run");
        host.now.store(20, Ordering::Relaxed);
        pool.reclaim_idle();
        assert!(!pool.is_live(id));
    }

    #[test]
    fn low_power_vote_skips_destruction() {
        let (mut pool, host) = harness(1);
        let id = pool.acquire(8).unwrap().unwrap();
        pool.release(id).unwrap();
        host.island.store(true, Ordering::Relaxed);
        for step in 1..=4 {
            host.now.store(step * 10, Ordering::Relaxed);
            pool.reclaim_idle();
        }
        assert!(pool.is_live(id));
        host.island.store(false, Ordering::Relaxed);
        host.now.store(50, Ordering::Relaxed);
        pool.reclaim_idle();
        assert!(!pool.is_live(id));
    }

    #[test]
    fn stale_handle_after_destroy() {
        let mut pool = BufferPool::default();
        let id = pool.acquire(8).unwrap().unwrap();
        pool.release(id).unwrap();
        pool.destroy_all_unused();
        assert_eq!(pool.add_ref(id), Err(PoolError::StaleHandle(id)));
        let again = pool.acquire(8).unwrap().unwrap();
        assert_ne!(again, id, "recycled slot must carry a new generation");
    }

    #[test]
    fn external_blocks_are_not_pooled() {
        let mut pool = BufferPool::default();
        let id = pool.attach_external(vec![1, 2, 3]);
        assert_eq!(pool.release(id), Err(PoolError::NotPooled(id)));
        assert_eq!(pool.bytes(id), Some(&[1u8, 2, 3][..]));
        assert_eq!(pool.detach_external(id).unwrap(), vec![1, 2, 3]);
        assert!(!pool.is_live(id));
    }

    #[test]
    fn copy_between_and_within_blocks() {
        let mut pool = BufferPool::default();
        let a = pool.attach_external(vec![1, 2, 3, 4]);
        let b = pool.acquire(4).unwrap().unwrap();
        assert_eq!(pool.copy_bytes(a, 1, b, 0, 3), 3);
        assert_eq!(pool.bytes(b), Some(&[2u8, 3, 4, 0][..]));
        pool.move_within(b, 0, 1, 3);
        assert_eq!(pool.bytes(b), Some(&[2u8, 2, 3, 4][..]));
        assert_eq!(pool.copy_bytes(b, 2, b, 0, 8), 2);
        assert_eq!(pool.bytes(b), Some(&[3u8, 4, 3, 4][..]));
    }
}
