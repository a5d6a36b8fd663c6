//! Status codes returned to userspace.
//!
//! Every syscall returns a status word: 0 for success, one of the codes
//! below for failure. The kernel's internal error type converts into this
//! one at the syscall boundary, so userspace only ever sees these stable
//! values.

use core::fmt;

/// An error returned by a syscall.
///
/// The discriminants are ABI: they are the values the status word takes on
/// the wire and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum KernelError {
    /// An argument failed validation: bad pointer, misaligned value,
    /// oversize length, unknown flag.
    InvalidArgs = 1,
    /// The handle value does not name a live handle of the calling
    /// process.
    BadHandle = 2,
    /// The handle names an object of a different type than the operation
    /// expects.
    WrongType = 3,
    /// The handle does not carry the rights the operation requires.
    AccessDenied = 4,
    /// Kernel memory or a fixed-capacity arena is exhausted.
    NoMemory = 5,
    /// The object is in a state where the operation is meaningless:
    /// dying, dead, mid-transaction, or already consumed.
    BadState = 6,
    /// The deadline expired before the operation could complete.
    TimedOut = 7,
    /// The wait was torn down by thread or process death.
    Interrupted = 8,
    /// The supplied buffer is too small for the result.
    BufferTooSmall = 9,
    /// An offset or length falls outside the object.
    OutOfRange = 10,
    /// No entry matches the given key.
    NotFound = 11,
    /// The operation is not implemented for this object.
    NotSupported = 12,
    /// The futex word did not hold the expected value, or the slot is
    /// already occupied.
    AlreadyBound = 13,
    /// The peer endpoint is closed and the queue direction is dead.
    ChannelClosed = 14,
    /// The operation cannot make progress right now; wait for the
    /// relevant signal and retry.
    ShouldWait = 15,
    /// The wait was cancelled because the observed handle was closed.
    Cancelled = 16,
}

impl KernelError {
    /// The status word for this error.
    pub fn make_ret(self) -> u32 {
        self as u32
    }

    /// Decodes a nonzero status word. Unknown codes decode to `None`.
    pub fn from_ret(ret: u32) -> Option<KernelError> {
        match ret {
            1 => Some(KernelError::InvalidArgs),
            2 => Some(KernelError::BadHandle),
            3 => Some(KernelError::WrongType),
            4 => Some(KernelError::AccessDenied),
            5 => Some(KernelError::NoMemory),
            6 => Some(KernelError::BadState),
            7 => Some(KernelError::TimedOut),
            8 => Some(KernelError::Interrupted),
            9 => Some(KernelError::BufferTooSmall),
            10 => Some(KernelError::OutOfRange),
            11 => Some(KernelError::NotFound),
            12 => Some(KernelError::NotSupported),
            13 => Some(KernelError::AlreadyBound),
            14 => Some(KernelError::ChannelClosed),
            15 => Some(KernelError::ShouldWait),
            16 => Some(KernelError::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match *self {
            KernelError::InvalidArgs => "invalid argument",
            KernelError::BadHandle => "bad handle",
            KernelError::WrongType => "wrong object type",
            KernelError::AccessDenied => "access denied",
            KernelError::NoMemory => "out of memory",
            KernelError::BadState => "bad state",
            KernelError::TimedOut => "timed out",
            KernelError::Interrupted => "interrupted",
            KernelError::BufferTooSmall => "buffer too small",
            KernelError::OutOfRange => "out of range",
            KernelError::NotFound => "not found",
            KernelError::NotSupported => "not supported",
            KernelError::AlreadyBound => "already bound",
            KernelError::ChannelClosed => "channel closed",
            KernelError::ShouldWait => "should wait",
            KernelError::Cancelled => "cancelled",
        };
        write!(f, "{}", desc)
    }
}

#[cfg(test)]
mod test {
    use super::KernelError;

    #[test]
    fn ret_roundtrip() {
        for code in 1..=16 {
            let err = KernelError::from_ret(code).unwrap();
            assert_eq!(err.make_ret(), code);
        }
        assert_eq!(KernelError::from_ret(0), None);
        assert_eq!(KernelError::from_ret(0xdead), None);
    }
}
