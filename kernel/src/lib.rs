//! Borealis kernel core.
//!
//! The object-and-handle subsystem of a capability microkernel: every
//! user-visible kernel resource is a [Dispatcher](objects::Dispatcher)
//! reached through per-process randomized [handles](handle), waited on
//! through [state trackers](event::StateTracker), and reached from
//! userspace through the [syscalls] surface.
//!
//! The architecture layer — trap glue, context switch, device drivers —
//! lives outside this crate and only consumes the object/handle/signal
//! API. The [scheduler] module models the park/unpark contract the arch
//! layer provides, over host threads, which is what lets the whole core
//! run under `cargo test`.

// rustc warnings
#![warn(unused)]
#![warn(missing_debug_implementations)]
#![allow(unused_unsafe)]
#![allow(dead_code)]
#![cfg_attr(test, allow(unused_imports))]

// rustdoc warnings
#![warn(missing_docs)]

extern crate alloc;

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;
#[macro_use]
extern crate log;
#[macro_use]
extern crate failure;

pub mod config;
pub mod cprng;
pub mod error;
pub mod event;
pub mod exception;
pub mod futex;
pub mod handle;
pub mod log_impl;
pub mod mem;
pub mod objects;
pub mod process;
pub mod scheduler;
pub mod sync;
pub mod syscalls;
pub mod timer;
pub mod vmm;

use core::sync::atomic::{AtomicBool, Ordering};

/// Tracks whether [init] already ran.
static KERNEL_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// One-time kernel initialization.
///
/// Installs the logger, arms the boot clock and seeds the CPRNG pool.
/// Idempotent: callers racing on it are fine, only the first does the
/// work. The arch layer calls this before creating the first process;
/// tests call it from every entry point that needs a live core.
pub fn init() {
    use crate::objects::Dispatcher;

    if KERNEL_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    log_impl::init();
    timer::init();
    cprng::seed_from_host();
    let root = objects::root_resource();
    info!("borealis core initialized, root resource koid {}", root.base().koid());
}
