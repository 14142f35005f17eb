//! Size-classed buffer pool.
//!
//! Four classes cover the common MTUs: 128 (control packets), 1514 (standard
//! Ethernet), 9018 (jumbo frames), 65536 (maximum reassembled payload).
//! Blocks are pre-allocated per class; acquisition CASes a per-block in-use
//! flag, expansion happens under a mutex when the class runs dry. Each thread
//! keeps a small cache of recently released blocks so the steady state never
//! touches the global lists.
//!
//! Leases are RAII: [`ScopedBuffer`] returns its block on drop, so a double
//! release is unrepresentable. Statistics use relaxed atomics; call
//! [`BufferPool::statistics`] for a coherent snapshot.

use dissect_common::{AtomicCounter, PoolError};
use parking_lot::RwLock;
use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Buffer sizes of the four classes, smallest first.
pub const SIZE_CLASSES: [usize; 4] = [128, 1514, 9018, 65536];

const THREAD_CACHE_CAPACITY: usize = 16;

/// Pool construction parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Blocks pre-allocated in the 128-byte class.
    pub small_pool_size: usize,
    /// Blocks pre-allocated in the 1514-byte class.
    pub medium_pool_size: usize,
    /// Blocks pre-allocated in the 9018-byte class.
    pub large_pool_size: usize,
    /// Blocks pre-allocated in the 65536-byte class.
    pub extra_large_pool_size: usize,
    /// Grow a class when it runs out instead of failing.
    pub auto_expand: bool,
    /// Keep a per-thread cache of released blocks.
    pub thread_cache: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            small_pool_size: 1024,
            medium_pool_size: 512,
            large_pool_size: 256,
            extra_large_pool_size: 64,
            auto_expand: true,
            thread_cache: true,
        }
    }
}

struct Block {
    data: UnsafeCell<Box<[u8]>>,
    in_use: AtomicBool,
}

// A block's data is only ever touched by the unique holder of its lease;
// the in_use flag is the ownership token.
unsafe impl Sync for Block {}
unsafe impl Send for Block {}

impl Block {
    fn new(size: usize, in_use: bool) -> Arc<Self> {
        Arc::new(Self {
            data: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
            in_use: AtomicBool::new(in_use),
        })
    }
}

struct ClassPool {
    buffer_size: usize,
    blocks: RwLock<Vec<Arc<Block>>>,
}

impl ClassPool {
    fn new(buffer_size: usize, capacity: usize) -> Self {
        let blocks = (0..capacity).map(|_| Block::new(buffer_size, false)).collect();
        Self {
            buffer_size,
            blocks: RwLock::new(blocks),
        }
    }
}

#[derive(Debug, Default)]
struct PoolStats {
    total_allocations: AtomicCounter,
    total_releases: AtomicCounter,
    cache_hits: AtomicCounter,
    cache_misses: AtomicCounter,
    current_usage: AtomicCounter,
    peak_usage: AtomicCounter,
}

/// Coherent copy of the pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    pub total_allocations: u64,
    pub total_releases: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub current_usage: u64,
    pub peak_usage: u64,
}

impl PoolStatsSnapshot {
    /// Fraction of acquisitions served from the thread cache.
    pub fn hit_rate(&self) -> f64 {
        if self.total_allocations == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / self.total_allocations as f64
    }
}

struct PoolInner {
    config: PoolConfig,
    classes: [ClassPool; 4],
    stats: PoolStats,
}

struct CacheEntry {
    pool_id: usize,
    class: usize,
    block: Arc<Block>,
}

/// Per-thread stash of released blocks; flags stay set while cached so no
/// other thread can claim them. Cleared on thread exit.
#[derive(Default)]
struct ThreadCache {
    entries: Vec<CacheEntry>,
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        for entry in self.entries.drain(..) {
            entry.block.in_use.store(false, Ordering::Release);
        }
    }
}

thread_local! {
    static THREAD_CACHE: RefCell<ThreadCache> = RefCell::new(ThreadCache::default());
}

/// Size-classed buffer pool with thread-local caching.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool with the given configuration.
    pub fn new(config: PoolConfig) -> Self {
        let classes = [
            ClassPool::new(SIZE_CLASSES[0], config.small_pool_size),
            ClassPool::new(SIZE_CLASSES[1], config.medium_pool_size),
            ClassPool::new(SIZE_CLASSES[2], config.large_pool_size),
            ClassPool::new(SIZE_CLASSES[3], config.extra_large_pool_size),
        ];
        Self {
            inner: Arc::new(PoolInner {
                config,
                classes,
                stats: PoolStats::default(),
            }),
        }
    }

    /// Process-wide pool, initialized once with the default configuration.
    pub fn global() -> &'static BufferPool {
        static GLOBAL: OnceLock<BufferPool> = OnceLock::new();
        GLOBAL.get_or_init(|| BufferPool::new(PoolConfig::default()))
    }

    fn pool_id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Acquire a buffer of at least `size` bytes.
    ///
    /// Picks the smallest size class that fits. The returned lease exposes
    /// the full class-sized block and releases it on drop.
    pub fn acquire(&self, size: usize) -> Result<ScopedBuffer, PoolError> {
        let class = SIZE_CLASSES
            .iter()
            .position(|&c| c >= size)
            .ok_or(PoolError::OversizedRequest(size))?;

        if self.inner.config.thread_cache {
            let cached = THREAD_CACHE.with(|cache| {
                let mut cache = cache.borrow_mut();
                let pool_id = self.pool_id();
                let pos = cache
                    .entries
                    .iter()
                    .position(|e| e.pool_id == pool_id && e.class == class);
                pos.map(|p| cache.entries.swap_remove(p).block)
            });
            if let Some(block) = cached {
                self.inner.stats.cache_hits.inc();
                return Ok(self.lease(class, block));
            }
        }
        self.inner.stats.cache_misses.inc();

        {
            let blocks = self.inner.classes[class].blocks.read();
            for block in blocks.iter() {
                if block
                    .in_use
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok(self.lease(class, block.clone()));
                }
            }
        }

        if !self.inner.config.auto_expand {
            return Err(PoolError::Exhausted(SIZE_CLASSES[class]));
        }

        let buffer_size = self.inner.classes[class].buffer_size;
        let mut blocks = self.inner.classes[class].blocks.write();
        // Another thread may have expanded while we waited for the lock.
        for block in blocks.iter() {
            if block
                .in_use
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(self.lease(class, block.clone()));
            }
        }
        let grow = (blocks.len() / 2).max(8);
        tracing::debug!(class = SIZE_CLASSES[class], grow, "expanding buffer pool");
        let claimed = Block::new(buffer_size, true);
        blocks.push(claimed.clone());
        for _ in 1..grow {
            blocks.push(Block::new(buffer_size, false));
        }
        Ok(self.lease(class, claimed))
    }

    fn lease(&self, class: usize, block: Arc<Block>) -> ScopedBuffer {
        let stats = &self.inner.stats;
        stats.total_allocations.inc();
        let usage = stats.current_usage.inc() + 1;
        stats.peak_usage.fetch_max(usage);
        ScopedBuffer {
            inner: self.inner.clone(),
            block: Some(block),
            class,
        }
    }

    /// A coherent copy of the statistics counters.
    pub fn statistics(&self) -> PoolStatsSnapshot {
        let s = &self.inner.stats;
        PoolStatsSnapshot {
            total_allocations: s.total_allocations.get(),
            total_releases: s.total_releases.get(),
            cache_hits: s.cache_hits.get(),
            cache_misses: s.cache_misses.get(),
            current_usage: s.current_usage.get(),
            peak_usage: s.peak_usage.get(),
        }
    }

    /// Total blocks currently allocated in `class` (free and leased).
    pub fn class_capacity(&self, class: usize) -> usize {
        self.inner.classes[class].blocks.read().len()
    }
}

/// RAII lease over a pooled block.
///
/// Derefs to the full class-sized byte slice. Moving the lease transfers
/// ownership; dropping it returns the block to the pool (thread cache first,
/// global flag otherwise).
pub struct ScopedBuffer {
    inner: Arc<PoolInner>,
    block: Option<Arc<Block>>,
    class: usize,
}

impl ScopedBuffer {
    /// Size of the underlying block.
    pub fn capacity(&self) -> usize {
        SIZE_CLASSES[self.class]
    }
}

impl std::ops::Deref for ScopedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        let block = self.block.as_ref().expect("lease already released");
        unsafe { &*block.data.get() }
    }
}

impl std::ops::DerefMut for ScopedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        let block = self.block.as_ref().expect("lease already released");
        unsafe { &mut *block.data.get() }
    }
}

impl Drop for ScopedBuffer {
    fn drop(&mut self) {
        let Some(block) = self.block.take() else {
            return;
        };
        let stats = &self.inner.stats;
        stats.total_releases.inc();
        stats.current_usage.sub(1);

        if self.inner.config.thread_cache {
            let pool_id = Arc::as_ptr(&self.inner) as usize;
            let cached = THREAD_CACHE.with(|cache| {
                let mut cache = cache.borrow_mut();
                if cache.entries.len() < THREAD_CACHE_CAPACITY {
                    cache.entries.push(CacheEntry {
                        pool_id,
                        class: self.class,
                        block: block.clone(),
                    });
                    true
                } else {
                    false
                }
            });
            if cached {
                return;
            }
        }
        block.in_use.store(false, Ordering::Release);
    }
}
