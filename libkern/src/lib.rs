//! Types shared between the kernel and userspace.
//!
//! Everything in this crate is part of the syscall ABI: status codes,
//! signal and rights bitmasks, object type tags, syscall numbers and the
//! wire layout of the records syscalls exchange. The kernel depends on it
//! for the authoritative definitions; userspace links it to interpret
//! what the kernel hands back.

#![no_std]

// rustc warnings
#![warn(unused)]
#![warn(missing_debug_implementations)]
#![allow(dead_code)]
#![cfg_attr(test, allow(unused_imports))]

// rustdoc warnings
#![warn(missing_docs)]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate static_assertions;

pub mod error;
pub mod nr;
pub mod object;
pub mod rights;
pub mod signals;
pub mod wire;

pub use crate::error::KernelError;
pub use crate::object::{HandlePolicy, InfoTopic, ObjectType, Property};
pub use crate::rights::Rights;
pub use crate::signals::{Signals, SignalsState};

/// A userspace-visible handle value.
///
/// Always a non-negative `i32` when reinterpreted as signed, always has
/// the bottom bit set, never zero. Userspace treats it as opaque.
pub type HandleValue = u32;

/// The invalid handle value. Never names a live handle.
pub const INVALID_HANDLE: HandleValue = 0;

/// Maximum number of bytes in a single message-pipe message.
pub const MAX_MSG_BYTES: usize = 64 * 1024;

/// Maximum number of handles transferred by a single message.
pub const MAX_MSG_HANDLES: usize = 64;

/// Maximum number of handles a single `handle_wait_many` call may take.
pub const MAX_WAIT_HANDLE_COUNT: usize = 32;

/// Maximum payload bytes of an io-port packet.
pub const MAX_PORT_PACKET_PAYLOAD: usize = 128;

/// Maximum payload bytes of a single kernel log record.
pub const MAX_LOG_RECORD_PAYLOAD: usize = 224;

/// Maximum bytes `cprng_draw` will fill in one call.
pub const MAX_CPRNG_DRAW: usize = 256;

/// Maximum length of an object name property, terminator included.
pub const MAX_NAME_LEN: usize = 32;

/// Deadline value meaning "never": wait forever.
pub const DEADLINE_INFINITE: u64 = u64::max_value();
