//! Page-aligned host memory allocator.
//!
//! Every buffer handed out is zero-filled and recorded in a process-wide
//! allocation table keyed by address. Operations on an address that is not
//! in the table are rejected (or ignored, for `free`) instead of touching
//! memory, so a stale or forged [`HostBuffer`] can never cause a double free.
//!
//! Guest mappings pin the allocation they are backed by. Releasing a pinned
//! allocation (through `free`, `reallocate` or `cleanup`) only retires it:
//! the memory stays valid until the last mapping goes away, and is freed
//! then.

use std::collections::BTreeMap;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{const_mutex, Mutex, MutexGuard};

use super::{HostBuffer, PAGE_SIZE};
use crate::error::{Error, Result};

/// One outstanding allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    ptr: NonNull<u8>,
    size: usize,
    alignment: usize,
}

// Safety: the pointer is only dereferenced while holding the table lock.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl Allocation {
    /// Start address.
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Alignment the allocation was requested with.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    fn buffer(&self) -> HostBuffer {
        HostBuffer::tracked(self.ptr, self.size)
    }
}

struct Entry {
    allocation: Allocation,
    owner: u64,
    /// Guest mappings currently backed by this allocation.
    mappings: u32,
    /// Released by its owner while still mapped.
    retired: bool,
}

type Table = BTreeMap<usize, Entry>;

static TABLE: Mutex<Table> = const_mutex(BTreeMap::new());
static NEXT_ALLOCATOR: AtomicU64 = AtomicU64::new(1);

fn table() -> MutexGuard<'static, Table> {
    TABLE.lock()
}

/// Release the entry at `addr`, or retire it while mappings remain.
fn release(table: &mut Table, addr: usize) {
    let Some(entry) = table.get_mut(&addr) else {
        return;
    };
    if entry.mappings > 0 {
        entry.retired = true;
        tracing::debug!(
            addr = format_args!("{:#x}", addr),
            "allocation still mapped, release deferred"
        );
        return;
    }
    if let Some(entry) = table.remove(&addr) {
        raw_free(entry.allocation);
    }
}

/// Record a guest mapping backed by `buffer`.
///
/// Returns the id of the allocator owning the buffer, or `None` for caller
/// memory that entered through [`HostBuffer::from_raw_parts`]. Fails with
/// `InvalidAddress` when an allocator buffer has already been released, and
/// with `BufferTooSmall` when it is shorter than `size`.
pub(crate) fn pin(buffer: HostBuffer, size: u64) -> Result<Option<u64>> {
    if !buffer.is_tracked() {
        return Ok(None);
    }
    let mut table = table();
    let entry = match table.get_mut(&buffer.addr()) {
        Some(entry) if !entry.retired => entry,
        _ => return Err(Error::InvalidAddress),
    };
    if (entry.allocation.size as u64) < size {
        return Err(Error::BufferTooSmall);
    }
    entry.mappings += 1;
    Ok(Some(entry.owner))
}

/// Drop a mapping recorded by [`pin`], freeing a retired allocation once
/// nothing maps it.
pub(crate) fn unpin(buffer: HostBuffer) {
    if !buffer.is_tracked() {
        return;
    }
    let mut table = table();
    let addr = buffer.addr();
    let Some(entry) = table.get_mut(&addr) else {
        return;
    };
    entry.mappings = entry.mappings.saturating_sub(1);
    if entry.mappings == 0 && entry.retired {
        release(&mut table, addr);
    }
}

/// Tracks zeroed, aligned host allocations used to back guest memory.
///
/// All methods take `&self` and the allocator can be shared between threads.
/// Dropping the allocator releases everything it still holds.
pub struct HostAllocator {
    id: u64,
}

impl HostAllocator {
    /// Create an empty allocator.
    pub fn new() -> Self {
        Self {
            id: NEXT_ALLOCATOR.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Allocate `size` zeroed bytes aligned to [`PAGE_SIZE`].
    pub fn allocate(&self, size: usize) -> Result<HostBuffer> {
        self.allocate_aligned(size, PAGE_SIZE as usize)
    }

    /// Allocate `size` zeroed bytes with the given power-of-two alignment.
    pub fn allocate_aligned(&self, size: usize, alignment: usize) -> Result<HostBuffer> {
        let allocation = raw_allocate(size, alignment)?;
        table().insert(
            allocation.addr(),
            Entry {
                allocation,
                owner: self.id,
                mappings: 0,
                retired: false,
            },
        );

        tracing::trace!(addr = format_args!("{:#x}", allocation.addr()), size, "host allocation");
        Ok(allocation.buffer())
    }

    /// Move `buffer` into a new allocation of `new_size` bytes.
    ///
    /// The first `min(old, new)` bytes are copied and the old allocation is
    /// released, so the old handle must not be used afterwards. A guest
    /// mapping of the old buffer keeps its memory alive until it is unmapped.
    pub fn reallocate(&self, buffer: HostBuffer, new_size: usize) -> Result<HostBuffer> {
        let mut table = table();
        let old = self.live(&table, buffer)?;

        let new = raw_allocate(new_size, old.alignment)?;
        // SAFETY: both allocations are live and at least `min(old, new)` bytes long.
        unsafe {
            ptr::copy_nonoverlapping(
                old.ptr.as_ptr(),
                new.ptr.as_ptr(),
                old.size.min(new_size),
            );
        }
        release(&mut table, old.addr());
        table.insert(
            new.addr(),
            Entry {
                allocation: new,
                owner: self.id,
                mappings: 0,
                retired: false,
            },
        );

        Ok(new.buffer())
    }

    /// Release `buffer`. Unknown buffers are ignored.
    pub fn free(&self, buffer: HostBuffer) {
        let mut table = table();
        if self.live(&table, buffer).is_ok() {
            release(&mut table, buffer.addr());
        }
    }

    /// Release every allocation this allocator holds. Safe to call repeatedly.
    pub fn cleanup(&self) {
        let mut table = table();
        let addrs: Vec<usize> = table
            .iter()
            .filter(|(_, e)| e.owner == self.id && !e.retired)
            .map(|(&addr, _)| addr)
            .collect();
        if !addrs.is_empty() {
            tracing::debug!(count = addrs.len(), "releasing host allocations");
        }
        for addr in addrs {
            release(&mut table, addr);
        }
    }

    /// Copy `size` bytes from `source` to `destination`.
    ///
    /// Both buffers must be live allocations of this allocator and at least
    /// `size` bytes long. The ranges may overlap.
    pub fn copy(&self, destination: HostBuffer, source: HostBuffer, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::BufferTooSmall);
        }
        let table = table();
        let dst = self.live(&table, destination)?;
        let src = self.live(&table, source)?;
        if size > dst.size || size > src.size {
            return Err(Error::BufferTooSmall);
        }
        // SAFETY: both ranges lie inside live allocations; `copy` handles overlap.
        unsafe { ptr::copy(src.ptr.as_ptr(), dst.ptr.as_ptr(), size) };
        Ok(())
    }

    /// Write `data` into `destination` starting at `offset`.
    pub fn write(&self, destination: HostBuffer, data: &[u8], offset: usize) -> Result<()> {
        let table = table();
        let dst = self.live(&table, destination)?;
        let end = offset.checked_add(data.len()).ok_or(Error::BufferTooSmall)?;
        if end > dst.size {
            return Err(Error::BufferTooSmall);
        }
        // SAFETY: `offset..end` is inside the allocation; `data` is a distinct borrow.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), dst.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Read `out.len()` bytes from `source` starting at `offset`.
    pub fn read(&self, source: HostBuffer, offset: usize, out: &mut [u8]) -> Result<()> {
        let table = table();
        let src = self.live(&table, source)?;
        let end = offset.checked_add(out.len()).ok_or(Error::BufferTooSmall)?;
        if end > src.size {
            return Err(Error::BufferTooSmall);
        }
        // SAFETY: `offset..end` is inside the allocation.
        unsafe {
            ptr::copy_nonoverlapping(src.ptr.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    /// Set the first `size` bytes of `buffer` to `value`.
    pub fn fill(&self, buffer: HostBuffer, value: u8, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::BufferTooSmall);
        }
        let table = table();
        let dst = self.live(&table, buffer)?;
        if size > dst.size {
            return Err(Error::BufferTooSmall);
        }
        // SAFETY: the first `size` bytes are inside the allocation.
        unsafe { ptr::write_bytes(dst.ptr.as_ptr(), value, size) };
        Ok(())
    }

    /// Bookkeeping entry for `buffer`, if it is a live allocation of this allocator.
    pub fn allocation(&self, buffer: HostBuffer) -> Option<Allocation> {
        self.live(&table(), buffer).ok()
    }

    /// Whether `buffer` was handed out by this allocator and not yet released.
    pub fn owns(&self, buffer: HostBuffer) -> bool {
        self.live(&table(), buffer).is_ok()
    }

    /// Number of guest mappings currently backed by `buffer`.
    pub fn mappings(&self, buffer: HostBuffer) -> u32 {
        table()
            .get(&buffer.addr())
            .filter(|e| e.owner == self.id && buffer.is_tracked())
            .map_or(0, |e| e.mappings)
    }

    /// Number of allocations still holding memory, including released ones
    /// kept alive by a guest mapping.
    pub fn len(&self) -> usize {
        table().values().filter(|e| e.owner == self.id).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes across [`len`](Self::len) allocations.
    pub fn allocated_bytes(&self) -> usize {
        table()
            .values()
            .filter(|e| e.owner == self.id)
            .map(|e| e.allocation.size)
            .sum()
    }

    fn live(&self, table: &Table, buffer: HostBuffer) -> Result<Allocation> {
        if !buffer.is_tracked() {
            return Err(Error::InvalidAddress);
        }
        match table.get(&buffer.addr()) {
            Some(entry) if entry.owner == self.id && !entry.retired => Ok(entry.allocation),
            _ => Err(Error::InvalidAddress),
        }
    }
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HostAllocator {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn raw_allocate(size: usize, alignment: usize) -> Result<Allocation> {
    if size == 0 || !alignment.is_power_of_two() {
        return Err(Error::InvalidSize);
    }
    // posix_memalign requires a multiple of sizeof(void *).
    let effective = alignment.max(std::mem::size_of::<*mut libc::c_void>());

    let mut raw: *mut libc::c_void = ptr::null_mut();
    // SAFETY: `raw` is a valid out-pointer and `effective` is a power of two
    // multiple of the pointer size.
    let ret = unsafe { libc::posix_memalign(&mut raw, effective, size) };
    let ptr = match NonNull::new(raw.cast::<u8>()) {
        Some(ptr) if ret == 0 => ptr,
        _ => {
            tracing::warn!(size, alignment, ret, "posix_memalign failed");
            return Err(Error::AllocationFailed);
        }
    };
    // SAFETY: freshly allocated, `size` bytes long.
    unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };

    Ok(Allocation {
        ptr,
        size,
        alignment,
    })
}

fn raw_free(allocation: Allocation) {
    // SAFETY: the allocation came from posix_memalign and was removed from
    // the table before this call, so it is freed exactly once.
    unsafe { libc::free(allocation.ptr.as_ptr().cast()) };
}
