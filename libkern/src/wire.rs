//! Wire layout of records exchanged through syscalls.
//!
//! Every struct here is `repr(C)`, padding-free and `Plain`: the kernel
//! builds them in place and copies them out as bytes; userspace
//! reinterprets the bytes it read back. [`as_bytes`] and [`read_from`]
//! are the only two conversions either side needs.

use plain::Plain;

/// Views a wire record as its underlying bytes.
pub fn as_bytes<T: Plain>(val: &T) -> &[u8] {
    // Safe: Plain guarantees no padding and no invalid bit patterns, so
    // exposing the object representation cannot leak uninitialized bytes.
    unsafe {
        core::slice::from_raw_parts(val as *const T as *const u8, core::mem::size_of::<T>())
    }
}

/// Reads a wire record out of a byte slice, unaligned.
///
/// Returns `None` if the slice is shorter than the record.
pub fn read_from<T: Plain + Copy>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < core::mem::size_of::<T>() {
        return None;
    }
    // Safe: Plain guarantees every bit pattern is a valid T, and
    // read_unaligned handles the arbitrary alignment of the slice.
    Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

/// The record `object_get_info(HANDLE_BASIC)` fills.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct InfoHandleBasic {
    /// Kernel object id of the object behind the handle.
    pub koid: u64,
    /// Koid of the related object: the peer for paired kinds, the owning
    /// process for threads, 0 otherwise.
    pub related_koid: u64,
    /// Rights mask of the handle.
    pub rights: u32,
    /// Object type tag.
    pub otype: u32,
    /// Nonzero when the object carries a state tracker (is waitable).
    pub waitable: u32,
    /// Reserved, zero.
    pub reserved: u32,
}

unsafe impl Plain for InfoHandleBasic {}
assert_eq_size!(InfoHandleBasic, [u64; 4]);

/// The record `object_get_info(PROCESS)` fills.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct InfoProcess {
    /// Return code, valid once `exited` is nonzero.
    pub return_code: i32,
    /// Nonzero once the process has started.
    pub started: u32,
    /// Nonzero once the process is dead.
    pub exited: u32,
    /// Number of live threads.
    pub thread_count: u32,
}

unsafe impl Plain for InfoProcess {}
assert_eq_size!(InfoProcess, [u32; 4]);

/// Header of every io-port packet.
///
/// Followed by `size` bytes of per-type payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketHeader {
    /// Binding or user key.
    pub key: u64,
    /// One of [`crate::object::packet_type`].
    pub ptype: u32,
    /// Payload bytes following this header.
    pub size: u32,
}

unsafe impl Plain for PacketHeader {}
assert_eq_size!(PacketHeader, [u64; 2]);

/// Payload of a [`crate::object::packet_type::SIGNAL`] packet.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketSignal {
    /// The bound signal mask that matched.
    pub trigger: u32,
    /// The satisfied set observed at the matching edge.
    pub observed: u32,
}

unsafe impl Plain for PacketSignal {}

/// Header of an exception report: `(size, type)`.
///
/// `size` covers header plus context so handlers written against a newer
/// ABI can skip unknown trailing fields.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ExceptionHeader {
    /// Total report size in bytes.
    pub size: u32,
    /// One of [`crate::object::exception_type`].
    pub extype: u32,
}

unsafe impl Plain for ExceptionHeader {}

/// The machine context of an exception report.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ExceptionContext {
    /// Architecture identifier of the register file layout.
    pub arch_id: u32,
    /// Exception subtype, duplicated from the header for convenience.
    pub subtype: u32,
    /// Koid of the faulting process.
    pub pid: u64,
    /// Koid of the faulting thread.
    pub tid: u64,
    /// Faulting program counter.
    pub pc: u64,
    /// Fault address; meaningful for page faults, zero otherwise.
    pub fault_address: u64,
    /// General-purpose register file at the fault.
    pub regs: [u64; 8],
}

unsafe impl Plain for ExceptionContext {}

/// A complete exception report.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ExceptionReport {
    /// Report header.
    pub header: ExceptionHeader,
    /// Machine context.
    pub context: ExceptionContext,
}

unsafe impl Plain for ExceptionReport {}

/// One result record of a `waitset_wait`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitSetResultWire {
    /// The entry's cookie.
    pub cookie: u64,
    /// 0 for satisfied, otherwise the status word explaining why the
    /// entry is dead.
    pub status: u32,
    /// Reserved, zero.
    pub reserved: u32,
    /// The entry's observed signal state.
    pub state: crate::signals::SignalsState,
}

unsafe impl Plain for WaitSetResultWire {}
assert_eq_size!(WaitSetResultWire, [u64; 3]);

/// The per-record header of the kernel log stream.
///
/// Followed by `datalen` payload bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRecordHeader {
    /// Monotonic sequence number of the record.
    pub seq: u64,
    /// Nanoseconds since boot at write time.
    pub timestamp: u64,
    /// Koid of the writing process, 0 for the kernel itself.
    pub pid: u64,
    /// Koid of the writing thread, 0 for the kernel itself.
    pub tid: u64,
    /// Payload length in bytes.
    pub datalen: u32,
    /// Writer-supplied flags, stored verbatim.
    pub flags: u32,
}

unsafe impl Plain for LogRecordHeader {}
assert_eq_size!(LogRecordHeader, [u64; 5]);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bytes_roundtrip() {
        let info = InfoHandleBasic {
            koid: 42,
            related_koid: 43,
            rights: 0b111,
            otype: 4,
            waitable: 1,
            reserved: 0,
        };
        let bytes = as_bytes(&info);
        assert_eq!(bytes.len(), core::mem::size_of::<InfoHandleBasic>());
        let back: InfoHandleBasic = read_from(bytes).unwrap();
        assert_eq!(back.koid, 42);
        assert_eq!(back.related_koid, 43);
        assert_eq!(back.otype, 4);
    }

    #[test]
    fn read_from_too_short() {
        let bytes = [0u8; 4];
        assert!(read_from::<InfoHandleBasic>(&bytes).is_none());
    }

    #[test]
    fn read_from_unaligned() {
        let mut buf = [0u8; 64];
        let hdr = PacketHeader { key: 7, ptype: 1, size: 8 };
        buf[1..17].copy_from_slice(as_bytes(&hdr));
        let back: PacketHeader = read_from(&buf[1..]).unwrap();
        assert_eq!(back.key, 7);
        assert_eq!(back.size, 8);
    }
}
