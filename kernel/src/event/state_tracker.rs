//! State trackers and their observers.

use alloc::sync::Arc;
use alloc::vec::Vec;

use borealis_libkern::{Signals, SignalsState};

use crate::error::KernelError;
use crate::event::{WaitEvent, WaitResult};
use crate::sync::SpinLock;

/// What the tracker should do with an observer after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverAction {
    /// Leave the observer attached.
    Keep,
    /// Remove the observer from the list. The only way an observer may
    /// detach itself from inside a callback, since the tracker lock is
    /// held there.
    Detach,
}

/// An entity watching a tracker's state.
///
/// Both callbacks run under the tracker's lock: they must not touch this
/// tracker again, and must not take any lock that can itself be held
/// around a tracker operation.
pub trait StateObserver: Send + Sync {
    /// The tracker's state changed (also called once at attach time with
    /// the then-current state).
    fn on_state_change(&self, state: SignalsState) -> ObserverAction;

    /// A handle the tracker's object was reachable through is being
    /// closed. `handle_index` is the arena index of that handle.
    fn on_cancel(&self, handle_index: u32) -> ObserverAction;
}

/// Mutable half of a [StateTracker].
struct TrackerInner {
    /// Currently active signals.
    satisfied: Signals,
    /// Signals that may still become active.
    satisfiable: Signals,
    /// Attached observers.
    observers: Vec<Arc<dyn StateObserver>>,
}

impl TrackerInner {
    /// Walks the observer list with the current state, dropping observers
    /// that ask to be detached.
    fn notify(&mut self) {
        let state = SignalsState::new(self.satisfied, self.satisfiable);
        self.observers
            .retain(|obs| obs.on_state_change(state) == ObserverAction::Keep);
    }
}

/// The signaling facade of a dispatcher.
///
/// Carries the `(satisfied, satisfiable)` pair and the observer list. At
/// every observable point `satisfied ⊆ satisfiable`; the four mutating
/// operations maintain that by masking and by stripping satisfied bits
/// whose satisfiable bit is withdrawn.
pub struct StateTracker {
    /// Guarded signal state + observers.
    inner: SpinLock<TrackerInner>,
}

impl core::fmt::Debug for StateTracker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.inner.try_lock() {
            Some(inner) => write!(
                f,
                "StateTracker {{ satisfied: {:?}, satisfiable: {:?}, observers: {} }}",
                inner.satisfied,
                inner.satisfiable,
                inner.observers.len()
            ),
            None => write!(f, "StateTracker {{ <locked> }}"),
        }
    }
}

impl StateTracker {
    /// Creates a tracker with the given initial state.
    ///
    /// # Panics
    ///
    /// Panics if `satisfied` is not a subset of `satisfiable`: the
    /// constructing dispatcher is buggy.
    pub fn new(satisfied: Signals, satisfiable: Signals) -> StateTracker {
        assert!(
            satisfiable.contains(satisfied),
            "tracker constructed with satisfied {:?} ⊄ satisfiable {:?}",
            satisfied,
            satisfiable
        );
        StateTracker {
            inner: SpinLock::new(TrackerInner {
                satisfied,
                satisfiable,
                observers: Vec::new(),
            }),
        }
    }

    /// The current `(satisfied, satisfiable)` pair.
    pub fn state(&self) -> SignalsState {
        let inner = self.inner.lock();
        SignalsState::new(inner.satisfied, inner.satisfiable)
    }

    /// Attaches an observer and immediately reports the current state to
    /// it, under the lock, so no edge can slip between attach and first
    /// update.
    pub fn attach(&self, observer: Arc<dyn StateObserver>) {
        let mut inner = self.inner.lock();
        let state = SignalsState::new(inner.satisfied, inner.satisfiable);
        if observer.on_state_change(state) == ObserverAction::Keep {
            inner.observers.push(observer);
        }
    }

    /// Detaches an observer previously passed to [attach](Self::attach).
    /// A no-op if it already detached itself.
    pub fn detach(&self, observer: &Arc<dyn StateObserver>) {
        let mut inner = self.inner.lock();
        inner
            .observers
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    /// The primitive all four public mutations go through: clears and
    /// sets on both masks under one lock hold, then notifies.
    pub fn update_state(
        &self,
        satisfied_clear: Signals,
        satisfied_set: Signals,
        satisfiable_clear: Signals,
        satisfiable_set: Signals,
    ) {
        let mut inner = self.inner.lock();
        inner.satisfiable = (inner.satisfiable - satisfiable_clear) | satisfiable_set;
        // Only satisfiable bits may be satisfied; a withdrawn satisfiable
        // bit takes its satisfied bit down with it.
        inner.satisfied = ((inner.satisfied - satisfied_clear) | satisfied_set) & inner.satisfiable;
        debug_assert!(inner.satisfiable.contains(inner.satisfied));
        inner.notify();
    }

    /// Clears and sets satisfied bits.
    pub fn update_satisfied(&self, clear: Signals, set: Signals) {
        self.update_state(clear, set, Signals::empty(), Signals::empty());
    }

    /// Clears and sets satisfiable bits.
    pub fn update_satisfiable(&self, clear: Signals, set: Signals) {
        self.update_state(Signals::empty(), Signals::empty(), clear, set);
    }

    /// Applies a userspace `object_signal` request.
    ///
    /// `allowed` is the dispatcher's user-settable set; touching any bit
    /// outside it is refused without side effects.
    pub fn user_signal(
        &self,
        clear: Signals,
        set: Signals,
        allowed: Signals,
    ) -> Result<(), KernelError> {
        if !allowed.contains(clear | set) {
            return Err(KernelError::access_denied(allowed, clear | set));
        }
        self.update_state(clear, set, Signals::empty(), set);
        Ok(())
    }

    /// Tells every observer that the handle at `handle_index` is going
    /// away, so in-flight waits through it unblock without false
    /// readiness.
    pub fn cancel(&self, handle_index: u32) {
        let mut inner = self.inner.lock();
        inner
            .observers
            .retain(|obs| obs.on_cancel(handle_index) == ObserverAction::Keep);
    }
}

/// The observer behind `handle_wait_one` / `handle_wait_many`.
///
/// Shares one [WaitEvent] with the other observers of the same call;
/// `context` disambiguates which of them fired (the caller's array
/// index). Wakes when a watched signal becomes satisfied, and also when
/// the watched set becomes entirely unsatisfiable, because sleeping on
/// a signal that can never come is not a wait, it is a leak.
pub struct WaitStateObserver {
    /// Event shared across the wait call.
    event: Arc<WaitEvent>,
    /// Signals the caller asked about.
    watched: Signals,
    /// Arena index of the handle the wait goes through.
    handle_index: u32,
    /// Delivered as the wait event context on wake.
    context: u64,
    /// Last state reported by the tracker, for the caller's result array.
    observed: SpinLock<SignalsState>,
}

impl core::fmt::Debug for WaitStateObserver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "WaitStateObserver {{ watched: {:?}, handle_index: {} }}",
            self.watched, self.handle_index
        )
    }
}

impl WaitStateObserver {
    /// Creates an observer for one entry of a wait call.
    pub fn new(
        event: Arc<WaitEvent>,
        watched: Signals,
        handle_index: u32,
        context: u64,
    ) -> Arc<WaitStateObserver> {
        Arc::new(WaitStateObserver {
            event,
            watched,
            handle_index,
            context,
            observed: SpinLock::new(SignalsState::default()),
        })
    }

    /// The last state the tracker reported through this observer.
    pub fn observed(&self) -> SignalsState {
        *self.observed.lock()
    }
}

impl StateObserver for WaitStateObserver {
    fn on_state_change(&self, state: SignalsState) -> ObserverAction {
        *self.observed.lock() = state;
        if !(state.satisfied() & self.watched).is_empty()
            || (state.satisfiable() & self.watched).is_empty()
        {
            self.event.signal(WaitResult::Satisfied, self.context);
        }
        ObserverAction::Keep
    }

    fn on_cancel(&self, handle_index: u32) -> ObserverAction {
        if handle_index == self.handle_index {
            self.event.signal(WaitResult::Cancelled, self.context);
            ObserverAction::Detach
        } else {
            ObserverAction::Keep
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satisfied_stays_subset_of_satisfiable() {
        let tracker = StateTracker::new(Signals::WRITABLE, Signals::READABLE | Signals::WRITABLE);
        // Trying to satisfy a non-satisfiable bit is masked off.
        tracker.update_satisfied(Signals::empty(), Signals::SIGNALED);
        let state = tracker.state();
        assert_eq!(state.satisfied(), Signals::WRITABLE);

        // Withdrawing a satisfiable bit strips its satisfied bit.
        tracker.update_satisfiable(Signals::WRITABLE, Signals::empty());
        let state = tracker.state();
        assert!(state.satisfied().is_empty());
        assert_eq!(state.satisfiable(), Signals::READABLE);
    }

    #[test]
    fn attach_reports_current_state() {
        let tracker = StateTracker::new(Signals::READABLE, Signals::READABLE | Signals::WRITABLE);
        let event = WaitEvent::new();
        let obs = WaitStateObserver::new(event.clone(), Signals::READABLE, 3, 0);
        tracker.attach(obs.clone());
        // The pre-existing level woke us, no edge needed.
        assert_eq!(event.wait(0).0, WaitResult::Satisfied);
        assert_eq!(obs.observed().satisfied(), Signals::READABLE);
    }

    #[test]
    fn edge_wakes_watcher() {
        let tracker = StateTracker::new(Signals::empty(), Signals::READABLE | Signals::WRITABLE);
        let event = WaitEvent::new();
        let obs = WaitStateObserver::new(event.clone(), Signals::READABLE, 3, 7);
        tracker.attach(obs.clone());
        assert!(event.outcome().is_none());

        tracker.update_satisfied(Signals::empty(), Signals::READABLE);
        assert_eq!(event.wait(0), (WaitResult::Satisfied, 7));
    }

    #[test]
    fn unsatisfiable_watch_wakes() {
        let tracker = StateTracker::new(Signals::empty(), Signals::READABLE | Signals::WRITABLE);
        let event = WaitEvent::new();
        let obs = WaitStateObserver::new(event.clone(), Signals::READABLE, 3, 0);
        tracker.attach(obs.clone());

        tracker.update_satisfiable(Signals::READABLE, Signals::empty());
        assert_eq!(event.wait(0).0, WaitResult::Satisfied);
        assert_eq!(obs.observed().satisfiable(), Signals::WRITABLE);
    }

    #[test]
    fn cancel_wakes_only_matching_handle() {
        let tracker = StateTracker::new(Signals::empty(), Signals::READABLE);
        let ev_a = WaitEvent::new();
        let ev_b = WaitEvent::new();
        tracker.attach(WaitStateObserver::new(ev_a.clone(), Signals::READABLE, 1, 0));
        tracker.attach(WaitStateObserver::new(ev_b.clone(), Signals::READABLE, 2, 0));

        tracker.cancel(1);
        assert_eq!(ev_a.wait(0).0, WaitResult::Cancelled);
        assert!(ev_b.outcome().is_none());
    }

    #[test]
    fn user_signal_respects_allowed_mask() {
        let tracker = StateTracker::new(
            Signals::empty(),
            Signals::SIGNALED | Signals::user_all(),
        );
        let allowed = Signals::SIGNALED | Signals::user_all();
        tracker.user_signal(Signals::empty(), Signals::USER_0, allowed).unwrap();
        assert!(tracker.state().satisfied().contains(Signals::USER_0));

        let err = tracker.user_signal(Signals::empty(), Signals::READABLE, allowed);
        assert!(err.is_err());
        assert!(!tracker.state().satisfied().contains(Signals::READABLE));
    }
}
