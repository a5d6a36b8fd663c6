//! Synchronization primitives used by the core.
//!
//! Every per-object lock in the kernel is a [SpinLock]. The lock order,
//! outermost first, is:
//!
//! process-state → handle-table → handle-arena → dispatcher-internal →
//! state-tracker
//!
//! No operation holds two state-tracker locks at once; anything that must
//! touch a second tracker (peer notification on close, transfer cancel)
//! defers it until after the first lock is released.
//!
//! IRQ masking around lock acquisition is the arch layer's concern and
//! happens outside this crate; the core only relies on the mutual
//! exclusion these locks provide.

pub use spin::{Mutex as SpinLock, MutexGuard as SpinLockGuard};
pub use spin::{Once, RwLock, RwLockReadGuard, RwLockWriteGuard};
