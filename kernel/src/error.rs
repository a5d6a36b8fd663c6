//! UserspaceError and KernelError
//!
//! The kernel works with [KernelError] internally: a rich error carrying
//! the parameters that caused the failure and a backtrace of its origin,
//! for debug. When a syscall fails, the KernelError is converted to a
//! [UserspaceError], the stable status code userspace sees.

use failure::Backtrace;
use core::fmt::{self, Display};

pub use borealis_libkern::error::KernelError as UserspaceError;

use borealis_libkern::Rights;

/// Kernel Error.
///
/// Used pretty much everywhere that an error can occur. Holds the reason
/// of the error, and a backtrace of its origin, for debug.
///
/// When a KernelError must be propagated to userspace, i.e. a syscall
/// failed, it must be converted to a [UserspaceError].
#[derive(Debug, Fail)]
#[allow(missing_docs, clippy::missing_docs_in_private_items)]
pub enum KernelError {
    #[fail(display = "Invalid address: address {:#010x} is considered invalid", address)]
    InvalidAddress {
        address: usize,
        backtrace: Backtrace,
    },
    #[fail(display = "Invalid size: size {} is considered invalid", size)]
    InvalidSize {
        size: usize,
        backtrace: Backtrace,
    },
    #[fail(display = "Alignment error: expected alignment {}, got {}", needed, given)]
    AlignmentError {
        given: usize,
        needed: usize,
        backtrace: Backtrace,
    },
    #[fail(display = "Invalid combination of values passed.")]
    InvalidCombination {
        backtrace: Backtrace,
    },
    #[fail(display = "The passed value ({}) would overflow the maximum ({}).", value, maximum)]
    ExceedingMaximum {
        value: u64,
        maximum: u64,
        backtrace: Backtrace,
    },
    #[fail(display = "Handle value {:#010x} names no live handle of this process", value)]
    BadHandle {
        value: u32,
        backtrace: Backtrace,
    },
    #[fail(display = "Handle names an object of the wrong type")]
    WrongType {
        backtrace: Backtrace,
    },
    #[fail(display = "Handle rights {:?} do not include required {:?}", has, needs)]
    AccessDenied {
        has: Rights,
        needs: Rights,
        backtrace: Backtrace,
    },
    #[fail(display = "Object is in the wrong state for this operation")]
    BadState {
        backtrace: Backtrace,
    },
    #[fail(display = "Allocation error: kernel memory or arena exhausted")]
    NoMemory {
        backtrace: Backtrace,
    },
    #[fail(display = "The deadline expired before the operation completed")]
    TimedOut {
        backtrace: Backtrace,
    },
    #[fail(display = "The wait was torn down by task death")]
    Interrupted {
        backtrace: Backtrace,
    },
    #[fail(display = "The wait was cancelled by a handle close")]
    Cancelled {
        backtrace: Backtrace,
    },
    #[fail(display = "Supplied buffer is too small, {} bytes needed", needed)]
    BufferTooSmall {
        needed: usize,
        backtrace: Backtrace,
    },
    #[fail(display = "Offset or length falls outside the object")]
    OutOfRange {
        backtrace: Backtrace,
    },
    #[fail(display = "No entry matches the given key")]
    NotFound {
        backtrace: Backtrace,
    },
    #[fail(display = "Operation not supported by this object")]
    NotSupported {
        backtrace: Backtrace,
    },
    #[fail(display = "The futex word changed, or the slot is occupied")]
    AlreadyBound {
        backtrace: Backtrace,
    },
    #[fail(display = "The peer endpoint is closed")]
    ChannelClosed {
        backtrace: Backtrace,
    },
    #[fail(display = "No progress possible right now, wait and retry")]
    ShouldWait {
        backtrace: Backtrace,
    },
    #[fail(display = "Process was killed before finishing operation")]
    ProcessKilled {
        backtrace: Backtrace,
    },
}

impl From<KernelError> for UserspaceError {
    fn from(err: KernelError) -> UserspaceError {
        err.make_userspace_error()
    }
}

impl KernelError {
    /// The status code userspace sees for this error.
    pub fn make_userspace_error(&self) -> UserspaceError {
        match *self {
            KernelError::InvalidAddress { .. } => UserspaceError::InvalidArgs,
            KernelError::InvalidSize { .. } => UserspaceError::InvalidArgs,
            KernelError::AlignmentError { .. } => UserspaceError::InvalidArgs,
            KernelError::InvalidCombination { .. } => UserspaceError::InvalidArgs,
            KernelError::ExceedingMaximum { .. } => UserspaceError::InvalidArgs,
            KernelError::BadHandle { .. } => UserspaceError::BadHandle,
            KernelError::WrongType { .. } => UserspaceError::WrongType,
            KernelError::AccessDenied { .. } => UserspaceError::AccessDenied,
            KernelError::BadState { .. } => UserspaceError::BadState,
            KernelError::NoMemory { .. } => UserspaceError::NoMemory,
            KernelError::TimedOut { .. } => UserspaceError::TimedOut,
            KernelError::Interrupted { .. } => UserspaceError::Interrupted,
            KernelError::Cancelled { .. } => UserspaceError::Cancelled,
            KernelError::BufferTooSmall { .. } => UserspaceError::BufferTooSmall,
            KernelError::OutOfRange { .. } => UserspaceError::OutOfRange,
            KernelError::NotFound { .. } => UserspaceError::NotFound,
            KernelError::NotSupported { .. } => UserspaceError::NotSupported,
            KernelError::AlreadyBound { .. } => UserspaceError::AlreadyBound,
            KernelError::ChannelClosed { .. } => UserspaceError::ChannelClosed,
            KernelError::ShouldWait { .. } => UserspaceError::ShouldWait,
            KernelError::ProcessKilled { .. } => UserspaceError::Interrupted,
        }
    }
}

impl From<UserspaceError> for KernelError {
    fn from(err: UserspaceError) -> KernelError {
        match err {
            UserspaceError::InvalidArgs => KernelError::invalid_combination(),
            UserspaceError::BadHandle => KernelError::bad_handle(0),
            UserspaceError::WrongType => KernelError::wrong_type(),
            UserspaceError::AccessDenied => KernelError::access_denied(Rights::empty(), Rights::empty()),
            UserspaceError::NoMemory => KernelError::no_memory(),
            UserspaceError::BadState => KernelError::bad_state(),
            UserspaceError::TimedOut => KernelError::timed_out(),
            UserspaceError::Interrupted => KernelError::interrupted(),
            UserspaceError::BufferTooSmall => KernelError::buffer_too_small(0),
            UserspaceError::OutOfRange => KernelError::out_of_range(),
            UserspaceError::NotFound => KernelError::not_found(),
            UserspaceError::NotSupported => KernelError::not_supported(),
            UserspaceError::AlreadyBound => KernelError::already_bound(),
            UserspaceError::ChannelClosed => KernelError::channel_closed(),
            UserspaceError::ShouldWait => KernelError::should_wait(),
            UserspaceError::Cancelled => KernelError::cancelled(),
        }
    }
}

/// Constructors shortening the common `Variant { backtrace: Backtrace::new() }` dance.
#[allow(missing_docs)]
impl KernelError {
    pub fn invalid_address(address: usize) -> KernelError {
        KernelError::InvalidAddress { address, backtrace: Backtrace::new() }
    }
    pub fn invalid_size(size: usize) -> KernelError {
        KernelError::InvalidSize { size, backtrace: Backtrace::new() }
    }
    pub fn alignment(given: usize, needed: usize) -> KernelError {
        KernelError::AlignmentError { given, needed, backtrace: Backtrace::new() }
    }
    pub fn invalid_combination() -> KernelError {
        KernelError::InvalidCombination { backtrace: Backtrace::new() }
    }
    pub fn exceeding_maximum(value: u64, maximum: u64) -> KernelError {
        KernelError::ExceedingMaximum { value, maximum, backtrace: Backtrace::new() }
    }
    pub fn bad_handle(value: u32) -> KernelError {
        KernelError::BadHandle { value, backtrace: Backtrace::new() }
    }
    pub fn wrong_type() -> KernelError {
        KernelError::WrongType { backtrace: Backtrace::new() }
    }
    pub fn access_denied(has: Rights, needs: Rights) -> KernelError {
        KernelError::AccessDenied { has, needs, backtrace: Backtrace::new() }
    }
    pub fn bad_state() -> KernelError {
        KernelError::BadState { backtrace: Backtrace::new() }
    }
    pub fn no_memory() -> KernelError {
        KernelError::NoMemory { backtrace: Backtrace::new() }
    }
    pub fn timed_out() -> KernelError {
        KernelError::TimedOut { backtrace: Backtrace::new() }
    }
    pub fn interrupted() -> KernelError {
        KernelError::Interrupted { backtrace: Backtrace::new() }
    }
    pub fn cancelled() -> KernelError {
        KernelError::Cancelled { backtrace: Backtrace::new() }
    }
    pub fn buffer_too_small(needed: usize) -> KernelError {
        KernelError::BufferTooSmall { needed, backtrace: Backtrace::new() }
    }
    pub fn out_of_range() -> KernelError {
        KernelError::OutOfRange { backtrace: Backtrace::new() }
    }
    pub fn not_found() -> KernelError {
        KernelError::NotFound { backtrace: Backtrace::new() }
    }
    pub fn not_supported() -> KernelError {
        KernelError::NotSupported { backtrace: Backtrace::new() }
    }
    pub fn already_bound() -> KernelError {
        KernelError::AlreadyBound { backtrace: Backtrace::new() }
    }
    pub fn channel_closed() -> KernelError {
        KernelError::ChannelClosed { backtrace: Backtrace::new() }
    }
    pub fn should_wait() -> KernelError {
        KernelError::ShouldWait { backtrace: Backtrace::new() }
    }
    pub fn process_killed() -> KernelError {
        KernelError::ProcessKilled { backtrace: Backtrace::new() }
    }
}

/// A [Display] wrapper printing the userspace conversion next to the
/// kernel error, for syscall tracing.
#[derive(Debug)]
pub struct SyscallFailure<'a>(pub &'a KernelError);

impl<'a> Display for SyscallFailure<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (ret {})", self.0, self.0.make_userspace_error().make_ret())
    }
}
