//! The modeled process address space.
//!
//! A sorted list of non-overlapping mappings, each a window onto a
//! [VmObject]. This is what `process_map_vm` and friends manipulate, and
//! what every syscall user-pointer access and futex word access resolves
//! through. Hardware page tables are the arch layer's business; the
//! model enforces the same rules (user range, permissions, alignment)
//! without them.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use borealis_libkern::object::MemoryPermissions;

use crate::config::PAGE_SIZE;
use crate::error::KernelError;
use crate::mem::{UserLand, VirtualAddress};
use crate::objects::VmObject;

/// One mapping.
#[derive(Debug, Clone)]
pub struct Mapping {
    /// First mapped address.
    addr: VirtualAddress,
    /// Length in bytes. Page-aligned except for internal mappings.
    length: usize,
    /// The backing object.
    vmo: Arc<VmObject>,
    /// Offset of the window into the vmo.
    vmo_offset: usize,
    /// Access permissions.
    perms: MemoryPermissions,
    /// Kernel-made mapping (data-pipe two-phase windows): byte-granular
    /// and unmappable through `process_unmap_vm`.
    internal: bool,
}

impl Mapping {
    /// First mapped address.
    pub fn addr(&self) -> VirtualAddress {
        self.addr
    }

    /// Length in bytes.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Access permissions.
    pub fn perms(&self) -> MemoryPermissions {
        self.perms
    }
}

/// The address space of one process.
#[derive(Debug)]
pub struct ProcessMemory {
    /// Mappings keyed by start address.
    mappings: BTreeMap<usize, Mapping>,
}

impl ProcessMemory {
    /// Creates an empty address space.
    pub fn new() -> ProcessMemory {
        ProcessMemory {
            mappings: BTreeMap::new(),
        }
    }

    /// Checks the accepted permission combinations: READ, READ|WRITE,
    /// READ|EXECUTE. Write-only (and executable-writable) are rejected.
    pub fn check_perms(perms: MemoryPermissions) -> Result<(), KernelError> {
        let ok = perms == MemoryPermissions::READ
            || perms == MemoryPermissions::READ | MemoryPermissions::WRITE
            || perms == MemoryPermissions::READ | MemoryPermissions::EXECUTE;
        if ok {
            Ok(())
        } else {
            Err(KernelError::invalid_combination())
        }
    }

    /// Whether `[addr, addr+len)` overlaps an existing mapping.
    fn overlaps(&self, addr: usize, len: usize) -> bool {
        let end = addr + len;
        self.mappings
            .range(..end)
            .next_back()
            .map_or(false, |(&start, mapping)| start + mapping.length > addr)
    }

    /// First-fit search for `len` bytes of free userland, page-aligned.
    pub fn find_available_space(&self, len: usize) -> Result<VirtualAddress, KernelError> {
        let len = borealis_libutils::align_up(len, PAGE_SIZE);
        let mut candidate = UserLand::start().addr();
        for (&start, mapping) in self.mappings.iter() {
            if start.saturating_sub(candidate) >= len {
                break;
            }
            let mapping_end = start + mapping.length;
            candidate = candidate.max(borealis_libutils::align_up(mapping_end, PAGE_SIZE));
        }
        if candidate + len > UserLand::end().addr() {
            return Err(KernelError::no_memory());
        }
        Ok(VirtualAddress(candidate))
    }

    /// Maps `len` bytes of `vmo` starting at `vmo_offset`.
    ///
    /// `addr_hint` of 0 lets the kernel pick; otherwise it must be a
    /// page-aligned free userland range. The window must lie inside the
    /// vmo.
    pub fn map_vmo(
        &mut self,
        vmo: Arc<VmObject>,
        vmo_offset: usize,
        len: usize,
        perms: MemoryPermissions,
        addr_hint: usize,
    ) -> Result<VirtualAddress, KernelError> {
        ProcessMemory::check_perms(perms)?;
        if len == 0 {
            return Err(KernelError::invalid_size(0));
        }
        let end = vmo_offset
            .checked_add(len)
            .ok_or_else(KernelError::out_of_range)?;
        if end > vmo.size() {
            return Err(KernelError::out_of_range());
        }
        let aligned_len = borealis_libutils::align_up(len, PAGE_SIZE);
        let addr = if addr_hint == 0 {
            self.find_available_space(aligned_len)?
        } else {
            let addr = VirtualAddress(addr_hint);
            if !addr.is_page_aligned() {
                return Err(KernelError::alignment(addr_hint, PAGE_SIZE));
            }
            UserLand::check_contains(addr_hint, aligned_len)?;
            if self.overlaps(addr_hint, aligned_len) {
                return Err(KernelError::invalid_address(addr_hint));
            }
            addr
        };
        self.mappings.insert(
            addr.addr(),
            Mapping {
                addr,
                length: aligned_len,
                vmo,
                vmo_offset,
                perms,
                internal: false,
            },
        );
        Ok(addr)
    }

    /// Maps a byte-granular kernel window (data-pipe two-phase). Picks
    /// its own address; not visible to `unmap`.
    pub fn map_internal(
        &mut self,
        vmo: Arc<VmObject>,
        vmo_offset: usize,
        len: usize,
        perms: MemoryPermissions,
    ) -> Result<VirtualAddress, KernelError> {
        let addr = self.find_available_space(borealis_libutils::align_up(len.max(1), PAGE_SIZE))?;
        self.mappings.insert(
            addr.addr(),
            Mapping {
                addr,
                length: len,
                vmo,
                vmo_offset,
                perms,
                internal: true,
            },
        );
        Ok(addr)
    }

    /// Unmaps the mapping starting exactly at `addr`, whose length must
    /// match `len` up to page rounding.
    pub fn unmap(&mut self, addr: usize, len: usize) -> Result<(), KernelError> {
        let mapping = self
            .mappings
            .get(&addr)
            .ok_or_else(KernelError::not_found)?;
        if mapping.internal {
            return Err(KernelError::not_found());
        }
        let aligned_len = borealis_libutils::align_up(len, PAGE_SIZE);
        if aligned_len != mapping.length {
            return Err(KernelError::invalid_size(len));
        }
        self.mappings.remove(&addr);
        Ok(())
    }

    /// Tears down a kernel window made by [map_internal](Self::map_internal).
    pub fn unmap_internal(&mut self, addr: VirtualAddress) {
        let removed = self.mappings.remove(&addr.addr());
        debug_assert!(
            removed.map_or(false, |m| m.internal),
            "unmap_internal on a non-internal mapping"
        );
    }

    /// Changes the permissions of the mapping starting exactly at
    /// `addr`.
    pub fn protect(
        &mut self,
        addr: usize,
        len: usize,
        perms: MemoryPermissions,
    ) -> Result<(), KernelError> {
        ProcessMemory::check_perms(perms)?;
        let mapping = self
            .mappings
            .get_mut(&addr)
            .ok_or_else(KernelError::not_found)?;
        if mapping.internal {
            return Err(KernelError::not_found());
        }
        let aligned_len = borealis_libutils::align_up(len, PAGE_SIZE);
        if aligned_len != mapping.length {
            return Err(KernelError::invalid_size(len));
        }
        mapping.perms = perms;
        Ok(())
    }

    /// Resolves `[addr, addr+len)` to its backing `(vmo, offset)`,
    /// requiring `need` permissions.
    ///
    /// The range must lie inside a single mapping; page faults on the
    /// boundary of two adjacent mappings are the arch layer's concern.
    pub fn resolve(
        &self,
        addr: usize,
        len: usize,
        need: MemoryPermissions,
    ) -> Result<(Arc<VmObject>, usize), KernelError> {
        UserLand::check_contains(addr, len)?;
        let (&start, mapping) = self
            .mappings
            .range(..=addr)
            .next_back()
            .ok_or_else(|| KernelError::invalid_address(addr))?;
        let offset = addr - start;
        if offset + len > mapping.length {
            return Err(KernelError::invalid_address(addr));
        }
        if !mapping.perms.contains(need) {
            // A permission miss on a user pointer is the same bad-pointer
            // error as an unmapped one; no side channel about the layout.
            return Err(KernelError::invalid_address(addr));
        }
        Ok((mapping.vmo.clone(), mapping.vmo_offset + offset))
    }

    /// Copies `buf.len()` bytes from user memory at `addr`.
    pub fn read_bytes(&self, addr: usize, buf: &mut [u8]) -> Result<(), KernelError> {
        let (vmo, offset) = self.resolve(addr, buf.len(), MemoryPermissions::READ)?;
        vmo.read(offset, buf)
    }

    /// Copies `data` into user memory at `addr`.
    pub fn write_bytes(&self, addr: usize, data: &[u8]) -> Result<(), KernelError> {
        let (vmo, offset) = self.resolve(addr, data.len(), MemoryPermissions::WRITE)?;
        vmo.write(offset, data)
    }

    /// Reads an aligned 32-bit user word.
    pub fn read_u32(&self, addr: usize) -> Result<u32, KernelError> {
        if !borealis_libutils::is_aligned(addr, 4) {
            return Err(KernelError::alignment(addr, 4));
        }
        let (vmo, offset) = self.resolve(addr, 4, MemoryPermissions::READ)?;
        vmo.read_u32(offset)
    }

    /// Writes an aligned 32-bit user word.
    pub fn write_u32(&self, addr: usize, value: u32) -> Result<(), KernelError> {
        if !borealis_libutils::is_aligned(addr, 4) {
            return Err(KernelError::alignment(addr, 4));
        }
        let (vmo, offset) = self.resolve(addr, 4, MemoryPermissions::WRITE)?;
        vmo.write_u32(offset, value)
    }

    /// Drops every mapping. Process teardown.
    pub fn clear(&mut self) {
        self.mappings.clear();
    }

    /// The current mappings, for diagnostics.
    pub fn mappings(&self) -> Vec<Mapping> {
        self.mappings.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::USER_BASE;

    fn space_with_page() -> (ProcessMemory, usize) {
        let mut pmemory = ProcessMemory::new();
        let vmo = VmObject::new(PAGE_SIZE).unwrap();
        let addr = pmemory
            .map_vmo(vmo, 0, PAGE_SIZE, MemoryPermissions::READ | MemoryPermissions::WRITE, 0)
            .unwrap();
        (pmemory, addr.addr())
    }

    #[test]
    fn map_read_write() {
        let (pmemory, addr) = space_with_page();
        pmemory.write_bytes(addr + 16, b"payload").unwrap();
        let mut buf = [0u8; 7];
        pmemory.read_bytes(addr + 16, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn unmapped_access_fails() {
        let pmemory = ProcessMemory::new();
        let mut buf = [0u8; 4];
        assert!(pmemory.read_bytes(USER_BASE, &mut buf).is_err());
    }

    #[test]
    fn write_only_rejected() {
        let mut pmemory = ProcessMemory::new();
        let vmo = VmObject::new(PAGE_SIZE).unwrap();
        assert!(pmemory
            .map_vmo(vmo, 0, PAGE_SIZE, MemoryPermissions::WRITE, 0)
            .is_err());
    }

    #[test]
    fn protect_drops_write() {
        let (mut pmemory, addr) = space_with_page();
        pmemory
            .protect(addr, PAGE_SIZE, MemoryPermissions::READ)
            .unwrap();
        assert!(pmemory.write_bytes(addr, b"x").is_err());
        let mut buf = [0u8; 1];
        assert!(pmemory.read_bytes(addr, &mut buf).is_ok());
    }

    #[test]
    fn unmap_exact_region() {
        let (mut pmemory, addr) = space_with_page();
        assert!(pmemory.unmap(addr + PAGE_SIZE, PAGE_SIZE).is_err());
        assert!(pmemory.unmap(addr, PAGE_SIZE / 2 + 1).is_err());
        pmemory.unmap(addr, PAGE_SIZE).unwrap();
        let mut buf = [0u8; 1];
        assert!(pmemory.read_bytes(addr, &mut buf).is_err());
    }

    #[test]
    fn hint_collision_detected() {
        let (mut pmemory, addr) = space_with_page();
        let vmo = VmObject::new(PAGE_SIZE).unwrap();
        assert!(pmemory
            .map_vmo(vmo.clone(), 0, PAGE_SIZE, MemoryPermissions::READ, addr)
            .is_err());
        let next = pmemory
            .map_vmo(vmo, 0, PAGE_SIZE, MemoryPermissions::READ, addr + PAGE_SIZE)
            .unwrap();
        assert_eq!(next.addr(), addr + PAGE_SIZE);
    }

    #[test]
    fn mapping_window_inside_vmo() {
        let mut pmemory = ProcessMemory::new();
        let vmo = VmObject::new(PAGE_SIZE).unwrap();
        assert!(pmemory
            .map_vmo(vmo, PAGE_SIZE / 2, PAGE_SIZE, MemoryPermissions::READ, 0)
            .is_err());
    }

    #[test]
    fn word_access_checks_alignment() {
        let (pmemory, addr) = space_with_page();
        pmemory.write_u32(addr + 8, 77).unwrap();
        assert_eq!(pmemory.read_u32(addr + 8).unwrap(), 77);
        assert!(pmemory.read_u32(addr + 6).is_err());
    }
}
