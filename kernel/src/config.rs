//! Compile-time configuration of the core.
//!
//! There is no runtime configuration surface: every tunable is a constant
//! here, and the wire-visible caps live in libkern next to the ABI.

/// Page size of the modeled address space.
pub const PAGE_SIZE: usize = 0x1000;

/// Lowest user-mappable address. Everything below is a guard region so
/// that null-ish pointers never validate.
pub const USER_BASE: usize = 0x0020_0000;

/// One past the highest user-mappable address.
pub const USER_TOP: usize = 0x8000_0000;

/// Capacity of the global handle arena, in slots. Upper bound of live
/// handles across the whole system.
pub const HANDLE_ARENA_CAPACITY: usize = 1 << 15;

/// Depth cap of each message-pipe direction, in messages.
pub const MSGPIPE_QUEUE_DEPTH: usize = 1024;

/// Depth cap of an io-port FIFO, in packets.
pub const PORT_QUEUE_DEPTH: usize = 1024;

/// Byte capacity of each socket stream direction.
pub const SOCKET_CAPACITY: usize = 256 * 1024;

/// Depth cap of a socket out-of-band channel, in datagrams.
pub const SOCKET_OOB_DEPTH: usize = 32;

/// Largest data-pipe capacity accepted at creation, in bytes.
pub const DATAPIPE_MAX_CAPACITY: usize = 16 * 1024 * 1024;

/// Default data-pipe capacity when the caller passes 0.
pub const DATAPIPE_DEFAULT_CAPACITY: usize = 64 * 1024;

/// Largest vm object accepted at creation, in bytes.
pub const VMO_MAX_SIZE: usize = 1 << 30;

/// Records retained by the global kernel log ring.
pub const LOG_RING_DEPTH: usize = 1024;
