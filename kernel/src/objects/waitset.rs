//! Wait sets: long-lived multi-object waits.
//!
//! Where `handle_wait_many` builds its observer set anew on every call, a
//! wait set keeps `(source, desired signals, cookie)` entries attached
//! across calls and reports, per wait, which entries are currently
//! satisfied (or dead).

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::any::Any;

use hashbrown::HashMap;

use borealis_libkern::{ObjectType, Signals, SignalsState};

use crate::error::{KernelError, UserspaceError};
use crate::event::{ObserverAction, StateObserver, WaitEvent, WaitResult};
use crate::objects::{Dispatcher, KObjectBase, StaticObjectType};
use crate::sync::SpinLock;
use crate::timer;

/// What one entry reports out of a wait.
#[derive(Debug, Clone, Copy)]
pub struct WaitSetResult {
    /// The entry's cookie.
    pub cookie: u64,
    /// 0 for a satisfied entry, otherwise the status explaining why the
    /// entry can no longer be satisfied.
    pub status: u32,
    /// The entry's last observed signal state.
    pub state: SignalsState,
}

/// Per-entry observation state.
struct EntryState {
    /// Last state the source tracker reported.
    last: SignalsState,
    /// The source handle was closed under us.
    cancelled: bool,
}

/// One `(source, desired, cookie)` membership.
struct WaitSetEntry {
    /// User key of the entry.
    cookie: u64,
    /// Signals the entry watches.
    watched: Signals,
    /// Arena index of the handle the entry was added through.
    handle_index: u32,
    /// The watched object. Keeps it alive while it is in the set.
    source: Arc<dyn Dispatcher>,
    /// Guarded observation state.
    state: SpinLock<EntryState>,
    /// The owning set, for wakeups.
    owner: Weak<WaitSetDispatcher>,
}

impl WaitSetEntry {
    /// Whether this entry should be reported by a wait right now.
    fn triggered(&self) -> Option<WaitSetResult> {
        let state = self.state.lock();
        let status = if state.cancelled {
            UserspaceError::Cancelled.make_ret()
        } else if !(state.last.satisfied() & self.watched).is_empty() {
            0
        } else if (state.last.satisfiable() & self.watched).is_empty() {
            UserspaceError::BadState.make_ret()
        } else {
            return None;
        };
        Some(WaitSetResult {
            cookie: self.cookie,
            status,
            state: state.last,
        })
    }
}

impl StateObserver for WaitSetEntry {
    fn on_state_change(&self, state: SignalsState) -> ObserverAction {
        let fire = {
            let mut entry_state = self.state.lock();
            entry_state.last = state;
            !(state.satisfied() & self.watched).is_empty()
                || (state.satisfiable() & self.watched).is_empty()
        };
        if fire {
            if let Some(owner) = self.owner.upgrade() {
                owner.wake_waiters(WaitResult::Satisfied);
            }
        }
        ObserverAction::Keep
    }

    fn on_cancel(&self, handle_index: u32) -> ObserverAction {
        if handle_index != self.handle_index {
            return ObserverAction::Keep;
        }
        self.state.lock().cancelled = true;
        if let Some(owner) = self.owner.upgrade() {
            owner.wake_waiters(WaitResult::Satisfied);
        }
        ObserverAction::Detach
    }
}

/// A wait set.
pub struct WaitSetDispatcher {
    /// Base; the set itself is not waitable, it is waited *with*.
    base: KObjectBase,
    /// Entries by cookie.
    entries: SpinLock<HashMap<u64, Arc<WaitSetEntry>>>,
    /// Parked waiters. A leaf lock: entry callbacks take it under source
    /// tracker locks, so nothing here may grab a tracker while holding
    /// it.
    waiters: SpinLock<Vec<Arc<WaitEvent>>>,
}

impl core::fmt::Debug for WaitSetDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "WaitSetDispatcher {{ koid: {} }}", self.base.koid())
    }
}

impl WaitSetDispatcher {
    /// Creates an empty set.
    pub fn new() -> Arc<WaitSetDispatcher> {
        Arc::new(WaitSetDispatcher {
            base: KObjectBase::new(),
            entries: SpinLock::new(HashMap::new()),
            waiters: SpinLock::new(Vec::new()),
        })
    }

    /// Adds an entry watching `watched` on `source` under `cookie`.
    ///
    /// The source must be waitable; a cookie already in the set is
    /// refused.
    pub fn add(
        self: &Arc<Self>,
        source: Arc<dyn Dispatcher>,
        handle_index: u32,
        watched: Signals,
        cookie: u64,
    ) -> Result<(), KernelError> {
        if source.state_tracker().is_none() {
            return Err(KernelError::not_supported());
        }
        let entry = Arc::new(WaitSetEntry {
            cookie,
            watched,
            handle_index,
            source: source.clone(),
            state: SpinLock::new(EntryState {
                last: SignalsState::default(),
                cancelled: false,
            }),
            owner: Arc::downgrade(self),
        });
        {
            let mut entries = self.entries.lock();
            if entries.contains_key(&cookie) {
                return Err(KernelError::already_bound());
            }
            entries.insert(cookie, entry.clone());
        }
        // Attach outside the entries lock; the initial report may fire
        // waiters right away.
        source
            .state_tracker()
            .expect("checked waitable above")
            .attach(entry);
        Ok(())
    }

    /// Removes the entry under `cookie`.
    pub fn remove(&self, cookie: u64) -> Result<(), KernelError> {
        let entry = self
            .entries
            .lock()
            .remove(&cookie)
            .ok_or_else(KernelError::not_found)?;
        if let Some(tracker) = entry.source.state_tracker() {
            let observer: Arc<dyn StateObserver> = entry.clone();
            tracker.detach(&observer);
        }
        Ok(())
    }

    /// Reports currently-triggered entries, blocking up to `timeout_ns`
    /// for the first one.
    ///
    /// Returns the triggered results (at most `max`) and the total number
    /// triggered, which can exceed `results.len()` when truncated.
    pub fn wait(
        &self,
        timeout_ns: u64,
        max: usize,
    ) -> Result<(Vec<WaitSetResult>, usize), KernelError> {
        // One absolute deadline across re-parks: an entry that satisfies
        // and drops back between the wake and our re-check must not
        // re-arm the caller's timeout in full.
        let deadline = timer::deadline_after(timeout_ns);
        loop {
            let event = WaitEvent::new();
            self.waiters.lock().push(event.clone());

            let mut triggered = self.collect();
            if !triggered.is_empty() {
                self.forget_waiter(&event);
                let total = triggered.len();
                triggered.truncate(max);
                return Ok((triggered, total));
            }
            if timeout_ns == 0 {
                self.forget_waiter(&event);
                return Err(KernelError::timed_out());
            }

            let (result, _) = event.wait_until(deadline);
            self.forget_waiter(&event);
            match result {
                WaitResult::Satisfied => continue,
                WaitResult::TimedOut => return Err(KernelError::timed_out()),
                WaitResult::Cancelled => return Err(KernelError::cancelled()),
                WaitResult::Interrupted => return Err(KernelError::interrupted()),
            }
        }
    }

    /// Snapshot of every triggered entry.
    fn collect(&self) -> Vec<WaitSetResult> {
        let entries: Vec<Arc<WaitSetEntry>> = self.entries.lock().values().cloned().collect();
        entries.iter().filter_map(|entry| entry.triggered()).collect()
    }

    /// Wakes every parked waiter. Called from entry callbacks, possibly
    /// under a source tracker lock.
    fn wake_waiters(&self, result: WaitResult) {
        let waiters = {
            let mut guard = self.waiters.lock();
            core::mem::replace(&mut *guard, Vec::new())
        };
        for waiter in waiters {
            waiter.signal(result, 0);
        }
    }

    /// Drops a waiter registration.
    fn forget_waiter(&self, event: &Arc<WaitEvent>) {
        self.waiters.lock().retain(|w| !Arc::ptr_eq(w, event));
    }

    /// Number of entries in the set.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Dispatcher for WaitSetDispatcher {
    fn base(&self) -> &KObjectBase {
        &self.base
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::WAIT_SET
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn on_zero_handles(&self) {
        let entries = {
            let mut guard = self.entries.lock();
            core::mem::replace(&mut *guard, HashMap::new())
        };
        for (_, entry) in entries {
            if let Some(tracker) = entry.source.state_tracker() {
                let observer: Arc<dyn StateObserver> = entry.clone();
                tracker.detach(&observer);
            }
        }
        self.wake_waiters(WaitResult::Cancelled);
    }
}

impl StaticObjectType for WaitSetDispatcher {
    fn static_object_type() -> ObjectType {
        ObjectType::WAIT_SET
    }
}
