use std::ops::Range;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, warn};

use crate::buffer::{CodeBuffer, FinalizedCode};
use crate::encoder::InstructionEncoder;
use crate::error::{JitError, JitResult};
use crate::logging::Category;

pub mod sys;

pub use sys::page_size;

/// Region starts stay 8-byte aligned so a trailing literal pool is too.
pub const REGION_ALIGNMENT: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protection {
    Writable,
    Executable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Keep pages either writable or executable, never both.
    pub wx_exclusive: bool,
    pub small_pool_pages: usize,
    pub max_small_pools: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            wx_exclusive: true,
            small_pool_pages: 16,
            max_small_pools: 4,
        }
    }
}

/// Rounds `request` up to a multiple of `granularity` (a power of two).
/// Returns `None` when the rounded size does not fit in `usize`.
pub fn round_up_allocation_size(request: usize, granularity: usize) -> Option<usize> {
    debug_assert!(granularity.is_power_of_two());
    let size = request.checked_add(granularity - 1)?;
    Some(size & !(granularity - 1))
}

#[derive(Default)]
struct AllocatorCounters {
    pools_live: AtomicUsize,
    bytes_reserved: AtomicUsize,
    regions_live: AtomicUsize,
}

struct PoolState {
    free: usize,
    /// Open write windows per page.
    page_writers: Vec<usize>,
}

/// Maximal runs of pages in `span` whose writer count is zero.
fn idle_runs(page_writers: &[usize], span: Range<usize>) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut open = None;
    for page in span.clone() {
        match (page_writers[page] == 0, open) {
            (true, None) => open = Some(page),
            (false, Some(start)) => {
                runs.push(start..page);
                open = None;
            }
            _ => {}
        }
    }
    if let Some(start) = open {
        runs.push(start..span.end);
    }
    runs
}

/// One OS mapping carved into regions front to back. Pages go back to the OS
/// when the allocator and every region carved from it have dropped it.
pub struct ExecutablePool {
    base: NonNull<u8>,
    size: usize,
    /// Page protection flips between writable and executable. MAP_JIT pools
    /// on macOS stay mapped RWX and gate writes per thread instead.
    toggles_protection: bool,
    state: Mutex<PoolState>,
    counters: Arc<AllocatorCounters>,
}

unsafe impl Send for ExecutablePool {}
unsafe impl Sync for ExecutablePool {}

impl ExecutablePool {
    fn map(size: usize, wx_exclusive: bool, counters: &Arc<AllocatorCounters>) -> JitResult<Arc<Self>> {
        let base = sys::reserve(size, !wx_exclusive)?;
        counters.pools_live.fetch_add(1, Ordering::Relaxed);
        counters.bytes_reserved.fetch_add(size, Ordering::Relaxed);
        let pool = Self {
            base,
            size,
            toggles_protection: wx_exclusive && !cfg!(target_os = "macos"),
            state: Mutex::new(PoolState {
                free: 0,
                page_writers: vec![0; size.div_ceil(page_size())],
            }),
            counters: Arc::clone(counters),
        };
        if pool.toggles_protection {
            sys::protect(base, size, Protection::Executable)?;
        }
        debug!(
            "{} mapped pool of {size} bytes at {:p}",
            Category::Memory,
            base.as_ptr()
        );
        Ok(Arc::new(pool))
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("executable pool lock poisoned")
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.size - self.lock().free
    }

    fn carve(&self, n: usize) -> Option<usize> {
        let mut state = self.lock();
        if n > self.size - state.free {
            return None;
        }
        let offset = state.free;
        state.free += n;
        Some(offset)
    }

    /// Pages covering `[offset, offset + len)`.
    fn page_span(&self, offset: usize, len: usize) -> Range<usize> {
        let page = page_size();
        let pages = self.size.div_ceil(page);
        let first = (offset / page).min(pages);
        let last = (offset + len.max(1)).div_ceil(page).min(pages);
        first..last
    }

    fn protect_pages(&self, pages: Range<usize>, protection: Protection) -> JitResult<()> {
        let page = page_size();
        let start = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(pages.start * page)) };
        sys::protect(start, pages.len() * page, protection)
    }

    /// Opens a write window over the pages holding `[offset, offset + len)`
    /// for the calling thread. Windows nest per page; a page flips back once
    /// its last writer has finished.
    fn begin_write(&self, offset: usize, len: usize) -> JitResult<()> {
        let span = self.page_span(offset, len);
        let mut state = self.lock();
        if self.toggles_protection {
            let runs = idle_runs(&state.page_writers, span.clone());
            for (index, run) in runs.iter().enumerate() {
                if let Err(err) = self.protect_pages(run.clone(), Protection::Writable) {
                    for flipped in &runs[..index] {
                        let _ = self.protect_pages(flipped.clone(), Protection::Executable);
                    }
                    return Err(err);
                }
            }
        }
        for writers in &mut state.page_writers[span] {
            *writers += 1;
        }
        sys::enter_thread_write();
        Ok(())
    }

    fn end_write(&self, offset: usize, len: usize) -> JitResult<()> {
        let span = self.page_span(offset, len);
        let mut state = self.lock();
        for writers in &mut state.page_writers[span.clone()] {
            *writers = writers.saturating_sub(1);
        }
        sys::leave_thread_write();
        if self.toggles_protection {
            for run in idle_runs(&state.page_writers, span) {
                self.protect_pages(run, Protection::Executable)?;
            }
        }
        Ok(())
    }

    /// Whether any page under `[offset, offset + len)` is currently mapped
    /// writable, possibly on behalf of a neighbouring region.
    fn span_writable(&self, offset: usize, len: usize) -> bool {
        if !self.toggles_protection {
            return false;
        }
        let span = self.page_span(offset, len);
        self.lock().page_writers[span]
            .iter()
            .any(|&writers| writers > 0)
    }
}

impl Drop for ExecutablePool {
    fn drop(&mut self) {
        self.counters.pools_live.fetch_sub(1, Ordering::Relaxed);
        self.counters
            .bytes_reserved
            .fetch_sub(self.size, Ordering::Relaxed);
        if let Err(err) = sys::release(self.base, self.size) {
            warn!("{} failed to release pool: {err}", Category::Memory);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    pub page_size: usize,
    pub pools_live: usize,
    pub small_pools: usize,
    pub small_pool_available: Vec<usize>,
    pub bytes_reserved: usize,
    pub regions_live: usize,
}

/// Hands out executable regions from a small set of shared pools, or from a
/// dedicated pool when a request is larger than a shared pool.
pub struct ExecutableAllocator {
    config: AllocatorConfig,
    small_pools: Mutex<Vec<Arc<ExecutablePool>>>,
    counters: Arc<AllocatorCounters>,
}

impl Default for ExecutableAllocator {
    fn default() -> Self {
        Self::new(AllocatorConfig::default())
    }
}

impl ExecutableAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            config,
            small_pools: Mutex::new(Vec::new()),
            counters: Arc::new(AllocatorCounters::default()),
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn small_pool_size(&self) -> usize {
        page_size() * self.config.small_pool_pages.max(1)
    }

    /// Reserves `n` bytes (rounded up to the region alignment) that the caller
    /// fills through [`PendingRegion::publish`].
    pub fn allocate(&self, n: usize) -> JitResult<PendingRegion> {
        let size = round_up_allocation_size(n.max(1), REGION_ALIGNMENT)
            .ok_or(JitError::OversizeAllocation(n))?;
        let (pool, offset) = self.carve(size)?;
        Ok(PendingRegion { pool, offset, size })
    }

    fn carve(&self, n: usize) -> JitResult<(Arc<ExecutablePool>, usize)> {
        let mut small = self.small_pools.lock().expect("small pool lock poisoned");

        let best_fit = small
            .iter()
            .filter(|pool| pool.available() >= n)
            .min_by_key(|pool| pool.available());
        if let Some(pool) = best_fit {
            if let Some(offset) = pool.carve(n) {
                return Ok((Arc::clone(pool), offset));
            }
        }

        let small_size = self.small_pool_size();
        if n > small_size {
            let size =
                round_up_allocation_size(n, page_size()).ok_or(JitError::OversizeAllocation(n))?;
            let pool = ExecutablePool::map(size, self.config.wx_exclusive, &self.counters)?;
            let offset = pool.carve(n).ok_or(JitError::OutOfMemory)?;
            return Ok((pool, offset));
        }

        let pool = ExecutablePool::map(small_size, self.config.wx_exclusive, &self.counters)?;
        let offset = pool.carve(n).ok_or(JitError::OutOfMemory)?;
        if small.len() < self.config.max_small_pools {
            small.push(Arc::clone(&pool));
        } else {
            let fullest = small
                .iter()
                .enumerate()
                .map(|(index, pool)| (index, pool.available()))
                .min_by_key(|&(_, available)| available);
            // Keep whichever pool has more room left.
            if let Some((index, available)) = fullest {
                if pool.available() > available {
                    small[index] = Arc::clone(&pool);
                }
            }
        }
        Ok((pool, offset))
    }

    /// Finalizes `buf` against a freshly reserved region, copies the code in
    /// and leaves the region executable.
    pub fn publish(&self, buf: &mut CodeBuffer) -> JitResult<ExecutableRegion> {
        if buf.is_finalized() || buf.is_oom() {
            // Consumes the buffer and reports why it cannot be published.
            buf.finalize(0)?;
        }
        let pending = self.allocate(buf.size_for_copy())?;
        let finalized = buf.finalize(pending.start())?;
        pending.publish(&finalized, Arc::clone(buf.encoder()))
    }

    pub fn stats(&self) -> AllocatorStats {
        let small = self.small_pools.lock().expect("small pool lock poisoned");
        AllocatorStats {
            page_size: page_size(),
            pools_live: self.counters.pools_live.load(Ordering::Relaxed),
            small_pools: small.len(),
            small_pool_available: small.iter().map(|pool| pool.available()).collect(),
            bytes_reserved: self.counters.bytes_reserved.load(Ordering::Relaxed),
            regions_live: self.counters.regions_live.load(Ordering::Relaxed),
        }
    }
}

/// Reserved executable memory whose final address is known but which holds no
/// code yet.
pub struct PendingRegion {
    pool: Arc<ExecutablePool>,
    offset: usize,
    size: usize,
}

impl PendingRegion {
    pub fn start(&self) -> usize {
        self.pool.base.as_ptr() as usize + self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Copies code finalized for this region's start and marks it executable.
    pub fn publish(
        self,
        code: &FinalizedCode,
        encoder: Arc<dyn InstructionEncoder>,
    ) -> JitResult<ExecutableRegion> {
        if code.base != self.start() || code.len() > self.size {
            return Err(JitError::InvalidSite {
                offset: code.base,
                len: code.len(),
                region_size: self.size,
            });
        }
        let ptr = unsafe { self.pool.base.as_ptr().add(self.offset) };
        self.pool.begin_write(self.offset, self.size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(code.code.as_ptr(), ptr, code.len());
        }
        sys::flush_icache(ptr, code.len());
        self.pool.end_write(self.offset, self.size)?;

        self.pool
            .counters
            .regions_live
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            "{} published {} bytes of {} code at 0x{:x}",
            Category::Memory,
            code.len(),
            encoder.arch().name(),
            code.base
        );
        Ok(ExecutableRegion {
            pool: self.pool,
            offset: self.offset,
            size: self.size,
            code_len: code.len(),
            encoder,
            state: Mutex::new(RegionState {
                protection: Protection::Executable,
                to_writable: 0,
                to_executable: 0,
            }),
            patch_lock: Mutex::new(()),
        })
    }
}

struct RegionState {
    protection: Protection,
    to_writable: usize,
    to_executable: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ProtectionTransitions {
    pub to_writable: usize,
    pub to_executable: usize,
}

/// Published code. Executable whenever no write window is open.
pub struct ExecutableRegion {
    pool: Arc<ExecutablePool>,
    offset: usize,
    size: usize,
    code_len: usize,
    encoder: Arc<dyn InstructionEncoder>,
    state: Mutex<RegionState>,
    patch_lock: Mutex<()>,
}

impl std::fmt::Debug for ExecutableRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableRegion")
            .field("start", &format_args!("0x{:x}", self.start()))
            .field("size", &self.size)
            .field("code_len", &self.code_len)
            .field("protection", &self.protection())
            .finish()
    }
}

impl ExecutableRegion {
    fn ptr(&self) -> *mut u8 {
        unsafe { self.pool.base.as_ptr().add(self.offset) }
    }

    fn lock_state(&self) -> MutexGuard<'_, RegionState> {
        self.state.lock().expect("region state lock poisoned")
    }

    pub fn start(&self) -> usize {
        self.ptr() as usize
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn code_len(&self) -> usize {
        self.code_len
    }

    pub fn encoder(&self) -> &Arc<dyn InstructionEncoder> {
        &self.encoder
    }

    /// Copy of the current code, taken while no edit is in flight.
    pub fn read_code(&self) -> Vec<u8> {
        let _lock = self.patch_lock.lock().expect("region patch lock poisoned");
        unsafe { std::slice::from_raw_parts(self.ptr(), self.code_len) }.to_vec()
    }

    /// `Writable` while this region's write window is open, or while a
    /// region sharing one of its pages has one open.
    pub fn protection(&self) -> Protection {
        let own = self.lock_state().protection;
        if own == Protection::Executable && self.pool.span_writable(self.offset, self.size) {
            Protection::Writable
        } else {
            own
        }
    }

    pub fn transitions(&self) -> ProtectionTransitions {
        let state = self.lock_state();
        ProtectionTransitions {
            to_writable: state.to_writable,
            to_executable: state.to_executable,
        }
    }

    /// Opens the region for editing. Edits to one region are serialized; the
    /// returned guard restores executable protection however it is dropped.
    pub fn make_writable(&self) -> JitResult<WriteGuard<'_>> {
        let lock = self.patch_lock.lock().expect("region patch lock poisoned");
        self.pool.begin_write(self.offset, self.size)?;
        let mut state = self.lock_state();
        state.protection = Protection::Writable;
        state.to_writable += 1;
        drop(state);
        Ok(WriteGuard {
            region: self,
            _lock: lock,
            restored: false,
        })
    }

    /// Drops the region, returning it to its pool. Must not be called while
    /// any thread may still execute the code or hold a patch site into it.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ExecutableRegion {
    fn drop(&mut self) {
        debug!(
            "{} releasing region of {} bytes at 0x{:x}",
            Category::Memory,
            self.size,
            self.start()
        );
        self.pool
            .counters
            .regions_live
            .fetch_sub(1, Ordering::Relaxed);
    }
}

/// Scoped write access to a published region.
pub struct WriteGuard<'a> {
    region: &'a ExecutableRegion,
    _lock: MutexGuard<'a, ()>,
    restored: bool,
}

impl WriteGuard<'_> {
    pub fn base(&self) -> usize {
        self.region.start()
    }

    pub fn region(&self) -> &ExecutableRegion {
        self.region
    }

    pub fn code(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.region.ptr(), self.region.code_len) }
    }

    pub fn code_mut(&mut self) -> &mut [u8] {
        // The patch lock is held and the pages are writable for as long as
        // the guard lives.
        unsafe { std::slice::from_raw_parts_mut(self.region.ptr(), self.region.code_len) }
    }

    /// Synchronizes the instruction cache for bytes written in `range`.
    pub fn flush(&self, range: Range<usize>) {
        if range.start >= range.end || range.end > self.region.code_len {
            return;
        }
        let ptr = unsafe { self.region.ptr().add(range.start) };
        sys::flush_icache(ptr, range.len());
    }

    pub fn make_executable(mut self) -> JitResult<()> {
        self.restore()
    }

    fn restore(&mut self) -> JitResult<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        let mut state = self.region.lock_state();
        state.protection = Protection::Executable;
        state.to_executable += 1;
        drop(state);
        self.region
            .pool
            .end_write(self.region.offset, self.region.size)
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.restore() {
            warn!(
                "{} failed to restore executable protection at 0x{:x}: {err}",
                Category::Memory,
                self.region.start()
            );
        }
    }
}
