//! The cooperation contract with the scheduler.
//!
//! The real scheduling algorithm lives in the arch layer and is out of
//! scope; the core only relies on three things, all provided here:
//!
//! 1. a current-task binding: syscall entry points can always find the
//!    [ProcessStruct] and [ThreadStruct] they execute on behalf of;
//! 2. park/unpark with deadline, consumed through
//!    [WaitEvent](crate::event::WaitEvent);
//! 3. a teardown hook: killing a task converts its outstanding wait into
//!    an `Interrupted` outcome through the registered blocker.
//!
//! Here the binding is a thread-local on the host thread driving the
//! task, and park/unpark is the host's. We keep an `Arc` to the current
//! thread in the binding; this both lets any kernel path find the current
//! task and keeps the ThreadStruct alive while code runs on its behalf.

use alloc::sync::Arc;
use core::cell::RefCell;

use crate::event::WaitEvent;
use crate::process::{ProcessStruct, ThreadStruct};

std::thread_local! {
    /// The task this host thread is currently executing on behalf of.
    static CURRENT_THREAD: RefCell<Option<Arc<ThreadStruct>>> = RefCell::new(None);
}

/// Gets the current ThreadStruct, if this host thread is bound to one.
pub fn get_current_thread() -> Option<Arc<ThreadStruct>> {
    CURRENT_THREAD.with(|cur| cur.borrow().clone())
}

/// Gets the ProcessStruct of the current thread.
pub fn get_current_process() -> Option<Arc<ProcessStruct>> {
    get_current_thread().map(|thread| thread.process.clone())
}

/// Scoped binding of a host thread to a [ThreadStruct].
///
/// Everything the bound closure does — syscalls, waits, faults — is
/// attributed to that task until the binding drops. Bindings nest: the
/// previous one is restored on drop.
#[derive(Debug)]
pub struct ThreadBinding {
    /// Binding to restore on drop.
    prev: Option<Arc<ThreadStruct>>,
}

impl Drop for ThreadBinding {
    fn drop(&mut self) {
        CURRENT_THREAD.with(|cur| {
            *cur.borrow_mut() = self.prev.take();
        });
    }
}

/// Binds the calling host thread to `thread` until the guard drops.
pub fn bind_thread(thread: &Arc<ThreadStruct>) -> ThreadBinding {
    let prev = CURRENT_THREAD.with(|cur| {
        cur.borrow_mut().replace(thread.clone())
    });
    ThreadBinding { prev }
}

/// Registers (or clears) the wait event the current task is about to
/// park on, so [ThreadStruct::interrupt] can reach it.
///
/// Called by `WaitEvent::wait` around the park; harmless when the host
/// thread is unbound (bare unit tests).
pub fn set_current_blocker(event: Option<Arc<WaitEvent>>) {
    if let Some(thread) = get_current_thread() {
        *thread.blocked_on.lock() = event;
    }
}

/// Runs `body` on a new host thread bound to `thread`, completing the
/// task's lifecycle when the body returns.
///
/// This is the hosted stand-in for the arch layer's "switch to the new
/// thread at its entry point": the body plays the role of the user code
/// at `pc`. The thread must already have been started through
/// [ThreadStruct::start].
pub fn spawn_on_host<F>(thread: Arc<ThreadStruct>, body: F) -> std::thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::spawn(move || {
        let binding = bind_thread(&thread);
        body();
        drop(binding);
        // Exiting twice is fine: if the body already called thread_exit,
        // this is a no-op.
        thread.exit();
    })
}

/// Relinquishes the processor, as syscall exit paths optionally do.
pub fn yield_now() {
    std::thread::yield_now();
}

/// Checks whether the current task was killed mid-syscall.
///
/// Syscall dispatch calls this on the way out; a dying thread gets
/// [UserspaceError::Interrupted](crate::error::UserspaceError) instead of
/// its result, mirroring the "run pending thread signals on exit"
/// contract.
pub fn current_thread_killed() -> bool {
    get_current_thread().map_or(false, |thread| thread.is_dying())
}
