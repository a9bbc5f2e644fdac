use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::MemoryBackend;

/// Smallest slab class handed out by the pool
pub const MIN_SLAB_SIZE: usize = 64;

/// Slab cache tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Requests above this size bypass the cache
    pub max_slab_size: usize,
    /// Cached regions idle longer than this are released by `maintain`
    pub idle_timeout_ms: u64,
    /// Period of the maintenance timer, 0 disables it
    pub maintenance_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_slab_size: 64 << 20,
            idle_timeout_ms: 30_000,
            maintenance_interval_ms: 10_000,
        }
    }
}

struct CachedRegion {
    region: Box<[u8]>,
    released_at: Instant,
}

struct PoolInner {
    backend: Arc<dyn MemoryBackend>,
    free: Mutex<HashMap<usize, Vec<CachedRegion>>>,
    cached_bytes: AtomicUsize,
    live_regions: AtomicUsize,
    max_slab_size: usize,
    idle_timeout: Duration,
}

impl PoolInner {
    fn release(&self, region: Box<[u8]>, class: Option<usize>) {
        self.live_regions.fetch_sub(1, Ordering::Relaxed);

        let Some(class) = class else {
            self.backend.mem_free(region);
            return;
        };

        let mut free = self.free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.cached_bytes.fetch_add(class, Ordering::Relaxed);
        free.entry(class).or_default().push(CachedRegion {
            region,
            released_at: Instant::now(),
        });
    }
}

/// Per-device slab cache of raw byte regions
#[derive(Clone)]
pub struct SlabPool {
    inner: Arc<PoolInner>,
}

impl SlabPool {
    pub fn new(backend: Arc<dyn MemoryBackend>, config: &PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                backend,
                free: Mutex::new(HashMap::new()),
                cached_bytes: AtomicUsize::new(0),
                live_regions: AtomicUsize::new(0),
                max_slab_size: config.max_slab_size.max(MIN_SLAB_SIZE),
                idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            }),
        }
    }

    /// Slab class serving a request, `None` when the request bypasses the cache
    pub fn slab_class(&self, size: usize) -> Option<usize> {
        let class = size.max(MIN_SLAB_SIZE).checked_next_power_of_two()?;
        (class <= self.inner.max_slab_size).then_some(class)
    }

    /// Returns `None` when the backend cannot satisfy the request
    pub fn allocate(&self, size: usize) -> Option<PooledRegion> {
        let class = self.slab_class(size);

        let cached = class.and_then(|class| {
            let mut free = self.inner.free
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let cached = free.get_mut(&class)?.pop()?;
            self.inner.cached_bytes.fetch_sub(class, Ordering::Relaxed);
            Some(cached.region)
        });

        let region = match cached {
            Some(region) => region,
            None => {
                let region = self.inner.backend.mem_alloc(class.unwrap_or(size));
                if region.is_none() {
                    warn!(size, "pool allocation failed");
                }
                region?
            }
        };

        self.inner.live_regions.fetch_add(1, Ordering::Relaxed);
        Some(PooledRegion {
            region: Some(region),
            len: size,
            class,
            pool: self.inner.clone(),
        })
    }

    pub fn free(&self, region: PooledRegion) {
        drop(region);
    }

    /// Releases cached regions that have been idle past the timeout
    pub fn maintain(&self) -> usize {
        self.shrink(|cached| cached.released_at.elapsed() >= self.inner.idle_timeout)
    }

    /// Releases every cached region back to the backend
    pub fn drain(&self) -> usize {
        self.shrink(|_| true)
    }

    fn shrink(&self, expired: impl Fn(&CachedRegion) -> bool) -> usize {
        let mut released = Vec::new();
        {
            let mut free = self.inner.free
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for (class, regions) in free.iter_mut() {
                let (old, keep): (Vec<_>, Vec<_>) = regions.drain(..).partition(|r| expired(r));
                *regions = keep;
                self.inner.cached_bytes.fetch_sub(class * old.len(), Ordering::Relaxed);
                released.extend(old);
            }
            free.retain(|_, regions| !regions.is_empty());
        }

        let count = released.len();
        for cached in released {
            self.inner.backend.mem_free(cached.region);
        }
        if count > 0 {
            debug!(count, "released idle slab regions");
        }
        count
    }

    pub fn cached_bytes(&self) -> usize {
        self.inner.cached_bytes.load(Ordering::Relaxed)
    }

    pub fn cached_regions(&self) -> usize {
        self.inner.free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }

    /// `(class, cached regions)` pairs in ascending class order
    pub fn cached_by_class(&self) -> Vec<(usize, usize)> {
        let mut classes: Vec<_> = self.inner.free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(class, regions)| (*class, regions.len()))
            .filter(|(_, count)| *count > 0)
            .collect();
        classes.sort_unstable();
        classes
    }

    pub fn live_regions(&self) -> usize {
        self.inner.live_regions.load(Ordering::Relaxed)
    }
}

/// A region checked out of the pool; returns to it on drop
pub struct PooledRegion {
    region: Option<Box<[u8]>>,
    len: usize,
    class: Option<usize>,
    pool: Arc<PoolInner>,
}

impl PooledRegion {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slab class the region was served from, `None` for oversized requests
    pub fn class(&self) -> Option<usize> {
        self.class
    }

    pub fn as_slice(&self) -> &[u8] {
        self.region.as_ref().map(|r| &r[..self.len]).unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len;
        self.region.as_mut().map(|r| &mut r[..len]).unwrap_or(&mut [])
    }
}

impl Drop for PooledRegion {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            self.pool.release(region, self.class);
        }
    }
}
