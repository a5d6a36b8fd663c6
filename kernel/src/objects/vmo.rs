//! Virtual memory objects.
//!
//! A VmObject is the unit of mappable memory: a resizable byte buffer
//! with a koid. Mappings in a process address space, data-pipe rings and
//! plain vmo_read/vmo_write all go through the accessors here. Physical
//! page management is out of scope: backing store is always
//! materialized.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;

use borealis_libkern::object::VmoOp;
use borealis_libkern::ObjectType;

use crate::config::VMO_MAX_SIZE;
use crate::error::KernelError;
use crate::objects::{Dispatcher, KObjectBase, StaticObjectType};
use crate::sync::SpinLock;

/// Mutable half of a [VmObject].
struct VmoState {
    /// The backing bytes. Length == current size.
    bytes: Vec<u8>,
}

/// A virtual memory object.
pub struct VmObject {
    /// Base; VMOs are not waitable.
    base: KObjectBase,
    /// Guarded backing store.
    state: SpinLock<VmoState>,
}

impl core::fmt::Debug for VmObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "VmObject {{ koid: {}, size: {} }}", self.base.koid(), self.size())
    }
}

impl VmObject {
    /// Creates a zero-filled vmo of `size` bytes.
    pub fn new(size: usize) -> Result<Arc<VmObject>, KernelError> {
        if size > VMO_MAX_SIZE {
            return Err(KernelError::exceeding_maximum(size as u64, VMO_MAX_SIZE as u64));
        }
        Ok(Arc::new(VmObject {
            base: KObjectBase::new(),
            state: SpinLock::new(VmoState {
                bytes: alloc::vec![0; size],
            }),
        }))
    }

    /// Current size in bytes.
    pub fn size(&self) -> usize {
        self.state.lock().bytes.len()
    }

    /// Resizes. Growth zero-fills; shrink truncates.
    pub fn set_size(&self, size: usize) -> Result<(), KernelError> {
        if size > VMO_MAX_SIZE {
            return Err(KernelError::exceeding_maximum(size as u64, VMO_MAX_SIZE as u64));
        }
        self.state.lock().bytes.resize(size, 0);
        Ok(())
    }

    /// Copies bytes out of the vmo into `buf`.
    ///
    /// The whole range must be inside the object.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), KernelError> {
        let state = self.state.lock();
        let end = offset
            .checked_add(buf.len())
            .filter(|&end| end <= state.bytes.len())
            .ok_or_else(KernelError::out_of_range)?;
        buf.copy_from_slice(&state.bytes[offset..end]);
        Ok(())
    }

    /// Copies `data` into the vmo at `offset`.
    ///
    /// The whole range must be inside the object.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= state.bytes.len())
            .ok_or_else(KernelError::out_of_range)?;
        state.bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Reads a 32-bit word. `offset` must be 4-aligned.
    ///
    /// The futex subsystem reads its words through this, under its
    /// context lock, which is what makes compare-and-park atomic with
    /// respect to wakes.
    pub fn read_u32(&self, offset: usize) -> Result<u32, KernelError> {
        if offset % 4 != 0 {
            return Err(KernelError::alignment(offset, 4));
        }
        let mut word = [0u8; 4];
        self.read(offset, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Writes a 32-bit word. `offset` must be 4-aligned.
    pub fn write_u32(&self, offset: usize, value: u32) -> Result<(), KernelError> {
        if offset % 4 != 0 {
            return Err(KernelError::alignment(offset, 4));
        }
        self.write(offset, &value.to_le_bytes())
    }

    /// Applies a `vmo_op_range` operation.
    pub fn op_range(&self, op: VmoOp, offset: usize, len: usize) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= state.bytes.len())
            .ok_or_else(KernelError::out_of_range)?;
        match op {
            // Backing store is always materialized; commit has nothing to
            // do and decommit degrades to zeroing.
            VmoOp::COMMIT => Ok(()),
            VmoOp::DECOMMIT | VmoOp::ZERO => {
                for byte in &mut state.bytes[offset..end] {
                    *byte = 0;
                }
                Ok(())
            }
            VmoOp::CACHE_CLEAN | VmoOp::CACHE_INVALIDATE => Err(KernelError::not_supported()),
            _ => Err(KernelError::invalid_combination()),
        }
    }
}

impl Dispatcher for VmObject {
    fn base(&self) -> &KObjectBase {
        &self.base
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::VM_OBJECT
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl StaticObjectType for VmObject {
    fn static_object_type() -> ObjectType {
        ObjectType::VM_OBJECT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_roundtrip() {
        let vmo = VmObject::new(0x1000).unwrap();
        vmo.write(0x10, b"hello").unwrap();
        let mut buf = [0u8; 5];
        vmo.read(0x10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn out_of_range_is_rejected() {
        let vmo = VmObject::new(0x10).unwrap();
        let mut buf = [0u8; 8];
        assert!(vmo.read(0x9, &mut buf).is_err());
        assert!(vmo.write(usize::max_value(), &[1]).is_err());
    }

    #[test]
    fn resize_zero_fills() {
        let vmo = VmObject::new(4).unwrap();
        vmo.write(0, &[0xff; 4]).unwrap();
        vmo.set_size(8).unwrap();
        let mut buf = [0u8; 8];
        vmo.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0]);

        vmo.set_size(2).unwrap();
        assert_eq!(vmo.size(), 2);
        assert!(vmo.read(0, &mut buf).is_err());
    }

    #[test]
    fn op_range_zeroes() {
        let vmo = VmObject::new(8).unwrap();
        vmo.write(0, &[0xaa; 8]).unwrap();
        vmo.op_range(VmoOp::ZERO, 2, 4).unwrap();
        let mut buf = [0u8; 8];
        vmo.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0xaa, 0xaa, 0, 0, 0, 0, 0xaa, 0xaa]);

        assert!(vmo.op_range(VmoOp::CACHE_CLEAN, 0, 8).is_err());
    }

    #[test]
    fn word_access_checks_alignment() {
        let vmo = VmObject::new(16).unwrap();
        vmo.write_u32(8, 0xdead_beef).unwrap();
        assert_eq!(vmo.read_u32(8).unwrap(), 0xdead_beef);
        assert!(vmo.read_u32(6).is_err());
    }
}
