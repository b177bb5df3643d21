/*!
 * Pooled allocator over OS virtual-memory regions
 *
 * Carves fixed regions out of anonymous OS mappings and hands out blocks
 * via best-fit search. Grows by mapping new regions up to a configured
 * ceiling, releases long-idle free regions on `cleanup`, and merges
 * adjacent free blocks on `defragment`. All state sits behind one pool
 * lock.
 */

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use crate::config::PoolConfig;
use crate::diagnostics::{Diagnostics, ErrorCategory, MemoryCategory};

const BLOCK_ALIGN: usize = 16;
/// Leftover space below this is not worth splitting off.
const MIN_SPLIT_BYTES: usize = 64;

/// Pool counters, snapshot via [`MemoryPool::stats`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolStats {
    pub total_allocations: u64,
    pub total_deallocations: u64,
    pub current_allocations: u64,
    pub current_bytes: usize,
    pub peak_bytes: usize,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub region_count: usize,
}

#[derive(Debug)]
struct Block {
    offset: usize,
    size: usize,
    allocated: bool,
}

struct Region {
    base: *mut u8,
    size: usize,
    blocks: Vec<Block>,
    last_used: Instant,
    track_id: u64,
}

// Region bases never move and are only touched under the pool lock.
unsafe impl Send for Region {}

impl Region {
    fn is_idle(&self) -> bool {
        self.blocks.iter().all(|b| !b.allocated)
    }
}

struct Inner {
    regions: Vec<Region>,
    total_os_bytes: usize,
    last_region_size: usize,
    stats: PoolStats,
}

/// Best-fit pooled allocator.
pub struct MemoryPool {
    inner: Mutex<Inner>,
    config: PoolConfig,
    diag: Arc<Diagnostics>,
}

impl MemoryPool {
    pub fn new(config: PoolConfig, diag: Arc<Diagnostics>) -> Self {
        diag.errors.info(
            ErrorCategory::Memory,
            "MemoryPool",
            format!(
                "pool created, initial region {} bytes, ceiling {} bytes",
                config.initial_region_size, config.max_pool_size
            ),
        );
        Self {
            inner: Mutex::new(Inner {
                regions: Vec::new(),
                total_os_bytes: 0,
                last_region_size: 0,
                stats: PoolStats::default(),
            }),
            config,
            diag,
        }
    }

    /// Allocate `size` bytes from the pool. Returns None on exhaustion.
    pub fn allocate(&self, size: usize, tag: &str) -> Option<*mut u8> {
        if size == 0 {
            return None;
        }
        let need = align_up(size, BLOCK_ALIGN);
        let _timer = self.diag.perf.start_timer("pool.allocate");

        let mut inner = self.inner.lock().unwrap();

        let found = Self::find_best_fit(&inner.regions, need);
        let (region_idx, block_idx) = match found {
            Some(loc) => {
                inner.stats.pool_hits += 1;
                loc
            }
            None => {
                inner.stats.pool_misses += 1;
                let region_idx = self.grow(&mut inner, need, tag)?;
                (region_idx, 0)
            }
        };

        let region = &mut inner.regions[region_idx];
        region.last_used = Instant::now();
        Self::split_block(region, block_idx, need);
        let block = &mut region.blocks[block_idx];
        block.allocated = true;
        let ptr = unsafe { region.base.add(block.offset) };

        inner.stats.total_allocations += 1;
        inner.stats.current_allocations += 1;
        inner.stats.current_bytes += need;
        if inner.stats.current_bytes > inner.stats.peak_bytes {
            inner.stats.peak_bytes = inner.stats.current_bytes;
        }
        Some(ptr)
    }

    /// Return a block to the pool. Returns false for pointers the pool
    /// does not own.
    pub fn deallocate(&self, ptr: *mut u8) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        for region in inner.regions.iter_mut() {
            let base = region.base as usize;
            let addr = ptr as usize;
            if addr < base || addr >= base + region.size {
                continue;
            }
            let offset = addr - base;
            let Some(block) = region
                .blocks
                .iter_mut()
                .find(|b| b.offset == offset && b.allocated)
            else {
                break;
            };
            block.allocated = false;
            let size = block.size;
            region.last_used = Instant::now();
            inner.stats.total_deallocations += 1;
            inner.stats.current_allocations -= 1;
            inner.stats.current_bytes -= size;
            return true;
        }
        self.diag.errors.warning(
            ErrorCategory::Memory,
            "MemoryPool",
            format!("deallocate of pointer not owned by pool: {ptr:p}"),
        );
        false
    }

    /// Release OS regions that are fully free and have sat idle past the
    /// configured duration.
    pub fn cleanup(&self) {
        let _timer = self.diag.perf.start_timer("pool.cleanup");
        let mut inner = self.inner.lock().unwrap();
        let idle = self.config.idle_cleanup;
        let mut released = 0usize;
        let mut kept = Vec::with_capacity(inner.regions.len());
        for region in inner.regions.drain(..) {
            if region.is_idle() && region.last_used.elapsed() >= idle {
                released += region.size;
                self.diag.memory.release(region.track_id);
                drop_region(region);
            } else {
                kept.push(region);
            }
        }
        inner.regions = kept;
        inner.total_os_bytes -= released;
        inner.stats.region_count = inner.regions.len();
        if released > 0 {
            self.diag.errors.info(
                ErrorCategory::Memory,
                "MemoryPool",
                format!("cleanup released {released} bytes of idle regions"),
            );
        }
    }

    /// Best-effort merge of address-adjacent free blocks within each
    /// region.
    pub fn defragment(&self) {
        let _timer = self.diag.perf.start_timer("pool.defragment");
        let mut inner = self.inner.lock().unwrap();
        for region in inner.regions.iter_mut() {
            region.blocks.sort_by_key(|b| b.offset);
            let mut merged: Vec<Block> = Vec::with_capacity(region.blocks.len());
            for block in region.blocks.drain(..) {
                match merged.last_mut() {
                    Some(prev)
                        if !prev.allocated
                            && !block.allocated
                            && prev.offset + prev.size == block.offset =>
                    {
                        prev.size += block.size;
                    }
                    _ => merged.push(block),
                }
            }
            region.blocks = merged;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        let mut stats = inner.stats;
        stats.region_count = inner.regions.len();
        stats
    }

    pub fn owns(&self, ptr: *const u8) -> bool {
        let inner = self.inner.lock().unwrap();
        let addr = ptr as usize;
        inner.regions.iter().any(|r| {
            let base = r.base as usize;
            addr >= base && addr < base + r.size
        })
    }

    fn find_best_fit(regions: &[Region], need: usize) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize, usize)> = None;
        for (ri, region) in regions.iter().enumerate() {
            for (bi, block) in region.blocks.iter().enumerate() {
                if block.allocated || block.size < need {
                    continue;
                }
                if best.map(|(_, _, size)| block.size < size).unwrap_or(true) {
                    best = Some((ri, bi, block.size));
                }
            }
        }
        best.map(|(ri, bi, _)| (ri, bi))
    }

    fn split_block(region: &mut Region, block_idx: usize, need: usize) {
        let block = &mut region.blocks[block_idx];
        let remainder = block.size - need;
        if remainder >= MIN_SPLIT_BYTES {
            let tail_offset = block.offset + need;
            block.size = need;
            region.blocks.insert(
                block_idx + 1,
                Block {
                    offset: tail_offset,
                    size: remainder,
                    allocated: false,
                },
            );
        }
    }

    /// Map a new OS region sized for `need`. Returns its index, with a
    /// single free block covering the whole region.
    fn grow(&self, inner: &mut Inner, need: usize, tag: &str) -> Option<usize> {
        let mut size = if inner.last_region_size == 0 {
            self.config.initial_region_size
        } else {
            (inner.last_region_size as f64 * self.config.growth_factor) as usize
        };
        if size < need {
            size = align_up(need, page_size());
        }
        if inner.total_os_bytes + size > self.config.max_pool_size {
            // Fall back to the exact need before giving up.
            size = align_up(need, page_size());
            if inner.total_os_bytes + size > self.config.max_pool_size {
                self.diag.errors.error(
                    ErrorCategory::Memory,
                    "MemoryPool",
                    format!(
                        "pool exhausted: {need} bytes requested for '{tag}', \
                         {} of {} bytes in use",
                        inner.total_os_bytes, self.config.max_pool_size
                    ),
                );
                return None;
            }
        }

        let base = match map_region(size) {
            Some(base) => base,
            None => {
                let err = std::io::Error::last_os_error();
                self.diag.errors.error_os(
                    ErrorCategory::Memory,
                    "MemoryPool",
                    format!("mapping a {size}-byte pool region failed"),
                    err.raw_os_error().unwrap_or(0),
                );
                return None;
            }
        };
        let track_id = self
            .diag
            .memory
            .track("pool.region", size, MemoryCategory::General);
        inner.regions.push(Region {
            base,
            size,
            blocks: vec![Block {
                offset: 0,
                size,
                allocated: false,
            }],
            last_used: Instant::now(),
            track_id,
        });
        inner.total_os_bytes += size;
        inner.last_region_size = size;
        inner.stats.region_count = inner.regions.len();
        self.diag.errors.debug(
            ErrorCategory::Memory,
            "MemoryPool",
            format!("mapped new pool region of {size} bytes"),
        );
        Some(inner.regions.len() - 1)
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        for region in inner.regions.drain(..) {
            self.diag.memory.release(region.track_id);
            drop_region(region);
        }
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

#[cfg(unix)]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(windows)]
fn page_size() -> usize {
    4096
}

#[cfg(unix)]
fn map_region(size: usize) -> Option<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return None;
    }
    Some(ptr as *mut u8)
}

#[cfg(unix)]
fn drop_region(region: Region) {
    unsafe {
        libc::munmap(region.base as *mut libc::c_void, region.size);
    }
}

#[cfg(windows)]
fn map_region(size: usize) -> Option<*mut u8> {
    use windows::Win32::System::Memory::{
        VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE,
    };
    let ptr = unsafe { VirtualAlloc(None, size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
    if ptr.is_null() {
        return None;
    }
    Some(ptr as *mut u8)
}

#[cfg(windows)]
fn drop_region(region: Region) {
    use windows::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
    unsafe {
        let _ = VirtualFree(region.base as *mut core::ffi::c_void, 0, MEM_RELEASE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool(config: PoolConfig) -> MemoryPool {
        MemoryPool::new(config, Arc::new(Diagnostics::default()))
    }

    fn small_pool() -> MemoryPool {
        pool(PoolConfig {
            initial_region_size: 64 * 1024,
            max_pool_size: 256 * 1024,
            growth_factor: 2.0,
            idle_cleanup: Duration::from_secs(30),
        })
    }

    #[test]
    fn allocate_and_deallocate() {
        let p = small_pool();
        let a = p.allocate(1000, "a").unwrap();
        let b = p.allocate(2000, "b").unwrap();
        assert_ne!(a, b);
        assert!(p.owns(a));

        unsafe { std::ptr::write_bytes(a, 0xAB, 1000) };

        assert!(p.deallocate(a));
        assert!(p.deallocate(b));
        assert!(!p.deallocate(a)); // double free rejected

        let stats = p.stats();
        assert_eq!(stats.total_allocations, 2);
        assert_eq!(stats.total_deallocations, 2);
        assert_eq!(stats.current_bytes, 0);
        assert!(stats.peak_bytes >= 3000);
    }

    #[test]
    fn best_fit_prefers_smallest_sufficient_block() {
        let p = small_pool();
        // Carve two differently sized free holes.
        let big = p.allocate(8192, "big").unwrap();
        let small = p.allocate(1024, "small").unwrap();
        let _tail = p.allocate(64, "tail").unwrap(); // keep holes separate
        p.deallocate(big);
        p.deallocate(small);

        // A 512-byte request must land in the 1024-byte hole, not the
        // 8192-byte one.
        let c = p.allocate(512, "c").unwrap();
        assert_eq!(c, small);
    }

    #[test]
    fn defragment_merges_adjacent_free_blocks() {
        let p = pool(PoolConfig {
            initial_region_size: 4096,
            max_pool_size: 4096,
            growth_factor: 2.0,
            idle_cleanup: Duration::from_secs(30),
        });
        let a = p.allocate(1024, "a").unwrap();
        let b = p.allocate(1024, "b").unwrap();
        let c = p.allocate(1024, "c").unwrap();
        p.deallocate(a);
        p.deallocate(b);
        p.deallocate(c);

        // Three 1 KiB fragments cannot serve 3 KiB until merged.
        p.defragment();
        let merged = p.allocate(3072, "merged");
        assert!(merged.is_some());
    }

    #[test]
    fn growth_is_capped_at_ceiling() {
        let p = pool(PoolConfig {
            initial_region_size: 4096,
            max_pool_size: 8192,
            growth_factor: 2.0,
            idle_cleanup: Duration::from_secs(30),
        });
        assert!(p.allocate(4000, "a").is_some());
        assert!(p.allocate(4000, "b").is_some());
        assert!(p.allocate(4000, "c").is_none());
        assert_eq!(p.stats().pool_misses, 3);
    }

    #[test]
    fn failed_region_mapping_is_logged() {
        let diag = Arc::new(Diagnostics::default());
        let p = MemoryPool::new(
            PoolConfig {
                initial_region_size: 4096,
                max_pool_size: usize::MAX,
                growth_factor: 2.0,
                idle_cleanup: Duration::from_secs(30),
            },
            Arc::clone(&diag),
        );
        // Larger than any address space, so the OS mapping call fails.
        assert!(p.allocate(1usize << 55, "huge").is_none());
        assert_eq!(diag.errors.severity_counts().error, 1);
    }

    #[test]
    fn cleanup_releases_idle_regions() {
        let p = pool(PoolConfig {
            initial_region_size: 4096,
            max_pool_size: 64 * 1024,
            growth_factor: 2.0,
            idle_cleanup: Duration::ZERO,
        });
        let a = p.allocate(1024, "a").unwrap();
        assert_eq!(p.stats().region_count, 1);
        p.cleanup();
        assert_eq!(p.stats().region_count, 1); // still allocated, kept
        p.deallocate(a);
        p.cleanup();
        assert_eq!(p.stats().region_count, 0);
    }
}
