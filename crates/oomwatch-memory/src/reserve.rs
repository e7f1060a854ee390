use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use thiserror::Error;

/// Bytes per reserve size unit.
pub const MB: u64 = 1024 * 1024;

const FALLBACK_PAGE_SIZE: usize = 4096;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReserveError {
    #[error("a reserve of {size_mb} MiB is not addressable on this platform")]
    TooLarge { size_mb: u64 },
    #[error("a reserve of {size_mb} MiB exceeds the memory this host can offer ({limit_bytes} bytes)")]
    ExceedsMemoryLimit { size_mb: u64, limit_bytes: u64 },
    #[error("failed to allocate a reserve of {size_mb} MiB")]
    Allocation { size_mb: u64 },
}

/// A committed, zero-filled block of memory.
pub struct ReserveBlock {
    bytes: Vec<u8>,
    size_mb: u64,
    locked: bool,
}

impl ReserveBlock {
    /// Allocates `size_mb` MiB, zero-fills it, then writes to every page.
    ///
    /// The page walk is a forced-commit step: it makes the kernel back every
    /// page now rather than lazily, so the memory really exists when it is
    /// handed back under distress.
    pub fn zeroed(size_mb: u64) -> Result<Self, ReserveError> {
        let len = size_mb
            .checked_mul(MB)
            .and_then(|len| usize::try_from(len).ok())
            .ok_or(ReserveError::TooLarge { size_mb })?;

        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| ReserveError::Allocation { size_mb })?;
        bytes.resize(len, 0);
        touch_pages(&mut bytes);

        Ok(Self {
            bytes,
            size_mb,
            locked: false,
        })
    }

    pub fn size_mb(&self) -> u64 {
        self.size_mb
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Pins the block in RAM so it cannot be swapped out.
    #[cfg(unix)]
    pub fn lock(&mut self) -> std::io::Result<()> {
        if self.locked || self.bytes.is_empty() {
            return Ok(());
        }
        // SAFETY: the range is a live allocation owned by `self.bytes`.
        let rc = unsafe { libc::mlock(self.bytes.as_ptr().cast(), self.bytes.len()) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        self.locked = true;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn lock(&mut self) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "memory locking is not supported on this platform",
        ))
    }
}

impl Drop for ReserveBlock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if self.locked {
                // SAFETY: same range that was passed to `mlock`, still allocated.
                unsafe {
                    let _ = libc::munlock(self.bytes.as_ptr().cast(), self.bytes.len());
                }
            }
        }
    }
}

impl fmt::Debug for ReserveBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReserveBlock")
            .field("size_mb", &self.size_mb)
            .field("locked", &self.locked)
            .finish()
    }
}

fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: `sysconf` has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if let Ok(size) = usize::try_from(size) {
            if size > 0 {
                return size;
            }
        }
    }
    FALLBACK_PAGE_SIZE
}

fn touch_pages(bytes: &mut [u8]) {
    let base = bytes.as_mut_ptr();
    for offset in (0..bytes.len()).step_by(page_size()) {
        // SAFETY: `offset < bytes.len()`, so the write stays inside the slice.
        // Volatile keeps the store from being folded into the zero fill.
        unsafe { std::ptr::write_volatile(base.add(offset), 0) };
    }
}

/// Strategy used to obtain reserve blocks.
pub trait ReserveAllocator: Send + Sync {
    fn allocate(&self, size_mb: u64) -> Result<ReserveBlock, ReserveError>;
}

/// Allocates reserve blocks on the process heap.
///
/// With overcommit a request can "succeed" and then get the watchdog killed
/// while its pages are committed. Requests are therefore checked, at every
/// allocation, against the smallest of physical memory, currently available
/// memory and an optional cgroup limit, before the allocator is touched.
#[derive(Debug, Clone, Copy)]
pub struct HeapAllocator {
    limit_bytes: Option<u64>,
    check_available: bool,
}

impl HeapAllocator {
    /// Bounded by physical memory, and by available memory at each allocation.
    pub fn new() -> Self {
        Self {
            limit_bytes: host_memory().total,
            check_available: true,
        }
    }

    /// A fixed upper bound; available memory is not consulted.
    pub fn with_limit(bytes: u64) -> Self {
        Self {
            limit_bytes: Some(bytes),
            check_available: false,
        }
    }

    pub fn unbounded() -> Self {
        Self {
            limit_bytes: None,
            check_available: false,
        }
    }

    /// Tightens the fixed bound, typically with the cgroup's `memory.max`.
    pub fn with_memory_limit(mut self, bytes: Option<u64>) -> Self {
        if let Some(bytes) = bytes {
            self.limit_bytes = Some(self.limit_bytes.map_or(bytes, |limit| limit.min(bytes)));
        }
        self
    }

    pub fn limit_bytes(&self) -> Option<u64> {
        self.limit_bytes
    }

    fn ceiling_bytes(&self) -> Option<u64> {
        let available = if self.check_available {
            host_memory().available
        } else {
            None
        };
        match (self.limit_bytes, available) {
            (Some(limit), Some(available)) => Some(limit.min(available)),
            (limit, available) => limit.or(available),
        }
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ReserveAllocator for HeapAllocator {
    fn allocate(&self, size_mb: u64) -> Result<ReserveBlock, ReserveError> {
        if let Some(limit_bytes) = self.ceiling_bytes() {
            if size_mb.saturating_mul(MB) > limit_bytes {
                return Err(ReserveError::ExceedsMemoryLimit {
                    size_mb,
                    limit_bytes,
                });
            }
        }
        ReserveBlock::zeroed(size_mb)
    }
}

struct HostMemory {
    total: Option<u64>,
    available: Option<u64>,
}

fn host_memory() -> HostMemory {
    use sysinfo::{MemoryRefreshKind, RefreshKind, System};

    let system =
        System::new_with_specifics(RefreshKind::new().with_memory(MemoryRefreshKind::new().with_ram()));
    let total = system.total_memory();
    if total == 0 {
        tracing::debug!(
            target = "oomwatch.memory",
            "host memory size unavailable; reserve size is unbounded"
        );
    }
    let nonzero = |bytes: u64| (bytes > 0).then_some(bytes);
    HostMemory {
        total: nonzero(total),
        available: nonzero(system.available_memory()),
    }
}

/// Owner of the single emergency reserve block.
///
/// The block lives in a lock-free slot so the notification path can drop it
/// without waiting on the worker.
pub struct EmergencyReserve {
    slot: ArcSwapOption<ReserveBlock>,
    allocator: Arc<dyn ReserveAllocator>,
}

impl EmergencyReserve {
    pub fn new(allocator: Arc<dyn ReserveAllocator>) -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            allocator,
        }
    }

    /// Allocates a block of `size_mb` MiB and installs it, replacing any
    /// current block. On failure the current block is left as it was.
    pub fn ensure(&self, size_mb: u64, lock: bool) -> Result<(), ReserveError> {
        let mut block = self.allocator.allocate(size_mb)?;
        if lock {
            if let Err(err) = block.lock() {
                tracing::warn!(
                    target = "oomwatch.memory",
                    size_mb,
                    error = %err,
                    "failed to lock emergency reserve; keeping it unlocked"
                );
            }
        }
        self.slot.store(Some(Arc::new(block)));
        Ok(())
    }

    /// Frees the block if one is held. Returns whether a block was released.
    pub fn release(&self) -> bool {
        self.slot.swap(None).is_some()
    }

    pub fn is_present(&self) -> bool {
        self.slot.load().is_some()
    }

    /// Size of the held block, if any.
    pub fn held_size_mb(&self) -> Option<u64> {
        self.slot.load().as_ref().map(|block| block.size_mb())
    }
}

impl fmt::Debug for EmergencyReserve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmergencyReserve")
            .field("held_size_mb", &self.held_size_mb())
            .finish_non_exhaustive()
    }
}
