//! Host memory and guest-physical address space management.
//!
//! - [`HostAllocator`] hands out zeroed, page-aligned host buffers and tracks
//!   them so cleanup is total.
//! - [`RegionTable`] records which host buffer backs which guest-physical
//!   range, and keeps those ranges from overlapping.

mod allocator;
mod region;

use std::fmt;
use std::ops::BitOr;
use std::ptr::NonNull;

pub use crate::arch::PAGE_SIZE;
pub use allocator::{Allocation, HostAllocator};
pub(crate) use allocator::{pin, unpin};
pub use region::{MemoryRegion, RegionOwnership, RegionTable};

/// Access permissions of a guest memory region.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemoryPermissions(u8);

impl MemoryPermissions {
    /// No access.
    pub const NONE: Self = Self(0);
    /// Guest may read.
    pub const READ: Self = Self(1 << 0);
    /// Guest may write.
    pub const WRITE: Self = Self(1 << 1);
    /// Guest may execute.
    pub const EXECUTE: Self = Self(1 << 2);
    /// Read and write.
    pub const RW: Self = Self(Self::READ.0 | Self::WRITE.0);
    /// Read, write and execute.
    pub const RWX: Self = Self(Self::READ.0 | Self::WRITE.0 | Self::EXECUTE.0);

    /// Raw bit representation (bit 0 read, bit 1 write, bit 2 execute).
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Build from raw bits, rejecting unknown bits.
    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::RWX.0 == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    /// Whether every permission in `other` is also in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for MemoryPermissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for MemoryPermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |p: Self, c: char| if self.contains(p) { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(Self::READ, 'r'),
            flag(Self::WRITE, 'w'),
            flag(Self::EXECUTE, 'x')
        )
    }
}

impl fmt::Display for MemoryPermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A span of host memory used to back guest-physical memory.
///
/// This is a plain handle (address and length). It does not own the memory:
/// buffers come either from a [`HostAllocator`] or from the caller via
/// [`HostBuffer::from_raw_parts`]. Allocator buffers are checked against the
/// allocation table before they are mapped, so a released one is refused.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostBuffer {
    ptr: NonNull<u8>,
    len: usize,
    tracked: bool,
}

// Safety: HostBuffer is an address/length pair. Every dereference goes through
// the allocator (which validates the address against its table under a lock)
// or through the hypervisor backend.
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    pub(crate) fn tracked(ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            ptr,
            len,
            tracked: true,
        }
    }

    /// Wrap caller-owned memory.
    ///
    /// Returns `None` for a null pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// any guest mapping created from this buffer exists. hvcore never frees
    /// memory that entered through this constructor.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self {
            ptr,
            len,
            tracked: false,
        })
    }

    /// Raw pointer to the start of the buffer.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Host virtual address of the buffer.
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the buffer came from a [`HostAllocator`].
    pub fn is_tracked(&self) -> bool {
        self.tracked
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_sets() {
        let rw = MemoryPermissions::READ | MemoryPermissions::WRITE;
        assert_eq!(rw, MemoryPermissions::RW);
        assert!(MemoryPermissions::RWX.contains(rw));
        assert!(!rw.contains(MemoryPermissions::EXECUTE));
        assert!(MemoryPermissions::NONE.is_empty());
        assert_eq!(format!("{:?}", rw), "rw-");
        assert_eq!(MemoryPermissions::RWX.to_string(), "rwx");
    }

    #[test]
    fn test_permission_bits() {
        assert_eq!(MemoryPermissions::from_bits(0b101).map(|p| p.bits()), Some(0b101));
        assert_eq!(MemoryPermissions::from_bits(0b1000), None);
    }

    #[test]
    fn test_host_buffer_from_raw_parts() {
        let mut backing = vec![0u8; 64];
        let buf = unsafe { HostBuffer::from_raw_parts(backing.as_mut_ptr(), backing.len()) }.unwrap();
        assert_eq!(buf.len(), 64);
        assert_eq!(buf.addr(), backing.as_ptr() as usize);
        assert!(unsafe { HostBuffer::from_raw_parts(std::ptr::null_mut(), 8) }.is_none());
    }
}
