//! Signaling: state trackers, observers and the wait event.
//!
//! Every waitable dispatcher owns a [StateTracker] carrying the
//! `(satisfied, satisfiable)` signal pair. Waiters attach
//! [StateObserver]s to one or more trackers; each observer decides on
//! every state change whether its [WaitEvent] should fire. A multi-wait
//! shares a single wait event across all its observers, so whichever
//! tracker satisfies first wakes the thread exactly once.

mod state_tracker;
mod wait_event;

pub use self::state_tracker::{ObserverAction, StateObserver, StateTracker, WaitStateObserver};
pub use self::wait_event::{WaitEvent, WaitResult};
