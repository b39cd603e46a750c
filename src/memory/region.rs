//! Guest memory regions and the per-VM region table.

use std::collections::BTreeMap;

use super::{HostBuffer, MemoryPermissions, PAGE_SIZE};
use crate::backend::{Hypervisor, VmHandle};
use crate::error::{Error, Result};
use crate::util::is_aligned;

/// Who is responsible for the host memory behind a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionOwnership {
    /// Caller-supplied memory. Never freed by hvcore.
    Borrowed,
    /// Memory from the VM's host allocator, freed when the region goes away.
    Allocator,
}

/// A guest-physical range backed by host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    guest_address: u64,
    size: u64,
    host_buffer: HostBuffer,
    permissions: MemoryPermissions,
    ownership: RegionOwnership,
}

impl MemoryRegion {
    /// Guest-physical base address.
    pub fn guest_address(&self) -> u64 {
        self.guest_address
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// First guest address past the region.
    pub fn end(&self) -> u64 {
        self.guest_address + self.size
    }

    pub fn host_buffer(&self) -> HostBuffer {
        self.host_buffer
    }

    pub fn permissions(&self) -> MemoryPermissions {
        self.permissions
    }

    pub fn ownership(&self) -> RegionOwnership {
        self.ownership
    }

    /// Check if an address falls within this region.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.guest_address && addr < self.end()
    }

    /// Get the offset of an address within this region.
    pub fn offset(&self, addr: u64) -> Option<u64> {
        if self.contains(addr) {
            Some(addr - self.guest_address)
        } else {
            None
        }
    }

    /// Whether `[start, start + size)` shares at least one byte with this region.
    pub fn overlaps(&self, start: u64, size: u64) -> bool {
        let end = start.saturating_add(size);
        start < self.end() && self.guest_address < end
    }
}

/// Authoritative map of one VM's guest-physical address space.
///
/// Intervals are kept pairwise disjoint. The table itself is not locked; the
/// owning VM serializes mutation.
#[derive(Debug, Default)]
pub struct RegionTable {
    regions: BTreeMap<u64, MemoryRegion>,
}

impl RegionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that `guest_address` and `size` describe a page-aligned,
    /// non-empty range that does not wrap the address space.
    pub fn validate(guest_address: u64, size: u64) -> Result<()> {
        if !is_aligned(guest_address, PAGE_SIZE) || size == 0 || !is_aligned(size, PAGE_SIZE) {
            return Err(Error::InvalidAddress);
        }
        guest_address.checked_add(size).ok_or(Error::InvalidAddress)?;
        Ok(())
    }

    /// The region intersecting `[guest_address, guest_address + size)`, if any.
    pub fn find_overlap(&self, guest_address: u64, size: u64) -> Option<&MemoryRegion> {
        let end = guest_address.saturating_add(size);
        // Regions are disjoint, so only the last one starting before `end`
        // can reach into the range.
        self.regions
            .range(..end)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.overlaps(guest_address, size))
    }

    /// Register a region and map it in the backend.
    ///
    /// Nothing is recorded if validation or the backend call fails.
    pub fn map(
        &mut self,
        backend: &dyn Hypervisor,
        vm: VmHandle,
        host_buffer: HostBuffer,
        guest_address: u64,
        size: u64,
        permissions: MemoryPermissions,
        ownership: RegionOwnership,
    ) -> Result<MemoryRegion> {
        Self::validate(guest_address, size)?;
        if (host_buffer.len() as u64) < size {
            return Err(Error::BufferTooSmall);
        }
        if self.find_overlap(guest_address, size).is_some() {
            return Err(Error::RegionOverlap);
        }

        backend
            .map_memory(vm, host_buffer, guest_address, size, permissions)
            .map_err(Error::MemoryMappingFailed)?;

        let region = MemoryRegion {
            guest_address,
            size,
            host_buffer,
            permissions,
            ownership,
        };
        self.regions.insert(guest_address, region);
        tracing::debug!(
            guest_addr = format_args!("{:#x}", guest_address),
            size,
            %permissions,
            "mapped guest memory"
        );
        Ok(region)
    }

    /// Unmap the region starting exactly at `guest_address`.
    ///
    /// On backend failure the region stays in the table.
    pub fn unmap(
        &mut self,
        backend: &dyn Hypervisor,
        vm: VmHandle,
        guest_address: u64,
    ) -> Result<MemoryRegion> {
        let region = *self.regions.get(&guest_address).ok_or(Error::RegionNotFound)?;
        backend
            .unmap_memory(vm, guest_address, region.size)
            .map_err(Error::MemoryUnmappingFailed)?;
        self.regions.remove(&guest_address);

        tracing::debug!(guest_addr = format_args!("{:#x}", guest_address), "unmapped guest memory");
        Ok(region)
    }

    /// The region containing `guest_address`.
    pub fn lookup(&self, guest_address: u64) -> Option<MemoryRegion> {
        self.regions
            .range(..=guest_address)
            .next_back()
            .map(|(_, region)| *region)
            .filter(|region| region.contains(guest_address))
    }

    /// All regions, ordered by guest address.
    pub fn regions(&self) -> Vec<MemoryRegion> {
        self.regions.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Sum of all region sizes.
    pub fn mapped_bytes(&self) -> u64 {
        self.regions.values().map(|r| r.size).sum()
    }

    /// Forget every region without calling the backend.
    ///
    /// Used on VM teardown, where destroying the backend VM releases the
    /// mappings. Returns the removed regions so owned buffers can be freed.
    pub fn clear(&mut self) -> Vec<MemoryRegion> {
        std::mem::take(&mut self.regions).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FakeHypervisor, FakeOp};
    use crate::config::VmConfig;
    use crate::memory::HostAllocator;

    struct Fixture {
        fake: FakeHypervisor,
        alloc: HostAllocator,
        vm: VmHandle,
        table: RegionTable,
    }

    fn fixture() -> Fixture {
        let fake = FakeHypervisor::new();
        let vm = fake.create_vm(&VmConfig::default()).unwrap();
        Fixture {
            fake,
            alloc: HostAllocator::new(),
            vm,
            table: RegionTable::new(),
        }
    }

    impl Fixture {
        fn map(&mut self, addr: u64, size: u64) -> Result<MemoryRegion> {
            let buf = self.alloc.allocate(size.max(1) as usize).unwrap();
            self.table.map(
                &self.fake,
                self.vm,
                buf,
                addr,
                size,
                MemoryPermissions::RW,
                RegionOwnership::Borrowed,
            )
        }
    }

    #[test]
    fn test_validate() {
        assert!(RegionTable::validate(0x1000, 0x1000).is_ok());
        assert_eq!(RegionTable::validate(0x1001, 0x1000), Err(Error::InvalidAddress));
        assert_eq!(RegionTable::validate(0x1000, 0), Err(Error::InvalidAddress));
        assert_eq!(RegionTable::validate(0x1000, 0x800), Err(Error::InvalidAddress));
        assert_eq!(
            RegionTable::validate(u64::MAX & !0xfff, 0x2000),
            Err(Error::InvalidAddress)
        );
    }

    #[test]
    fn test_overlap_cases() {
        let mut f = fixture();
        f.map(0x4000, 0x4000).unwrap();

        // identical, partial front, partial back, enclosing, enclosed
        for (addr, size) in [
            (0x4000, 0x4000),
            (0x2000, 0x3000),
            (0x7000, 0x2000),
            (0x0, 0x10000),
            (0x5000, 0x1000),
        ] {
            assert_eq!(f.map(addr, size), Err(Error::RegionOverlap), "{addr:#x}+{size:#x}");
        }
        assert_eq!(f.table.len(), 1);

        // adjacent on both sides is fine
        f.map(0x3000, 0x1000).unwrap();
        f.map(0x8000, 0x1000).unwrap();
        assert_eq!(f.table.len(), 3);
        assert_eq!(f.table.mapped_bytes(), 0x6000);
    }

    #[test]
    fn test_buffer_too_small() {
        let mut f = fixture();
        let buf = f.alloc.allocate(0x1000).unwrap();
        let err = f.table.map(
            &f.fake,
            f.vm,
            buf,
            0,
            0x2000,
            MemoryPermissions::RW,
            RegionOwnership::Borrowed,
        );
        assert_eq!(err, Err(Error::BufferTooSmall));
    }

    #[test]
    fn test_backend_failure_rolls_back() {
        let mut f = fixture();
        f.fake.fail_next(FakeOp::MapMemory, 42);
        assert_eq!(f.map(0x1000, 0x1000), Err(Error::MemoryMappingFailed(42)));
        assert!(f.table.is_empty());
        assert_eq!(f.fake.mapping_count(), 0);
        f.map(0x1000, 0x1000).unwrap();
    }

    #[test]
    fn test_unmap() {
        let mut f = fixture();
        f.map(0x1000, 0x2000).unwrap();
        assert_eq!(f.table.unmap(&f.fake, f.vm, 0x2000), Err(Error::RegionNotFound));

        f.fake.fail_next(FakeOp::UnmapMemory, 9);
        assert_eq!(
            f.table.unmap(&f.fake, f.vm, 0x1000),
            Err(Error::MemoryUnmappingFailed(9))
        );
        assert_eq!(f.table.len(), 1);

        let region = f.table.unmap(&f.fake, f.vm, 0x1000).unwrap();
        assert_eq!(region.size(), 0x2000);
        assert!(f.table.is_empty());
    }

    #[test]
    fn test_lookup() {
        let mut f = fixture();
        f.map(0x1000, 0x2000).unwrap();
        f.map(0x10000, 0x1000).unwrap();

        assert_eq!(f.table.lookup(0x2fff).map(|r| r.guest_address()), Some(0x1000));
        assert_eq!(f.table.lookup(0x3000), None);
        assert_eq!(f.table.lookup(0x0), None);
        let region = f.table.lookup(0x10800).unwrap();
        assert_eq!(region.offset(0x10800), Some(0x800));
    }

    #[test]
    fn test_clear_skips_backend() {
        let mut f = fixture();
        f.map(0x1000, 0x1000).unwrap();
        f.map(0x3000, 0x1000).unwrap();
        let removed = f.table.clear();
        assert_eq!(removed.len(), 2);
        assert!(f.table.is_empty());
        assert_eq!(f.fake.mapping_count(), 2);
    }
}
