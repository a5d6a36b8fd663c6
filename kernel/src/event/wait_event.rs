//! The blocking primitive everything suspends on.
//!
//! A [WaitEvent] parks exactly one thread until somebody calls
//! [signal](WaitEvent::signal), the timeout expires, or the wait is torn
//! down by cancellation. It is one-shot: the first outcome latches, and
//! every later signal is an idempotent no-op. Operations that wait
//! repeatedly (wait sets, port waits) allocate a fresh event per wait.

use alloc::sync::Arc;
use std::thread::{self, Thread};
use std::time::Instant;

use crate::scheduler;
use crate::sync::SpinLock;
use crate::timer;

/// Why a wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// A signaller fired the event.
    Satisfied,
    /// The deadline expired first.
    TimedOut,
    /// The observed handle was closed under the waiter.
    Cancelled,
    /// The waiting thread is being torn down.
    Interrupted,
}

/// Mutable half of a [WaitEvent].
struct WaitEventState {
    /// The latched outcome and its context, set by the first signaller
    /// (or by timeout expiry).
    outcome: Option<(WaitResult, u64)>,
    /// The parked thread, if one is currently waiting.
    waiter: Option<Thread>,
}

/// A one-shot cooperative blocking primitive.
///
/// On a real target this is a thin wrapper over the scheduler's
/// park/unpark; here the park is the host's, which has the same contract.
pub struct WaitEvent {
    /// Guarded outcome + waiter registration.
    state: SpinLock<WaitEventState>,
}

impl core::fmt::Debug for WaitEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.state.try_lock() {
            Some(st) => write!(f, "WaitEvent {{ outcome: {:?} }}", st.outcome),
            None => write!(f, "WaitEvent {{ <locked> }}"),
        }
    }
}

impl WaitEvent {
    /// Creates an unsignalled event.
    pub fn new() -> Arc<WaitEvent> {
        Arc::new(WaitEvent {
            state: SpinLock::new(WaitEventState {
                outcome: None,
                waiter: None,
            }),
        })
    }

    /// Blocks the calling thread until the event fires or `timeout_ns`
    /// elapses.
    ///
    /// A zero timeout never blocks: it returns the latched outcome if
    /// there is one, `TimedOut` otherwise. Once this returns, the outcome
    /// is latched and every subsequent call observes the same pair.
    pub fn wait(self: &Arc<Self>, timeout_ns: u64) -> (WaitResult, u64) {
        if timeout_ns == 0 {
            let mut state = self.state.lock();
            if let Some(outcome) = state.outcome {
                return outcome;
            }
            state.outcome = Some((WaitResult::TimedOut, 0));
            return (WaitResult::TimedOut, 0);
        }
        self.wait_until(timer::deadline_after(timeout_ns))
    }

    /// [wait](Self::wait) against an absolute deadline; `None` waits
    /// forever.
    ///
    /// Retry loops that re-park around one logical deadline (port and
    /// wait-set waits) go through this so that a spurious wake cannot
    /// re-arm the caller's timeout in full. A deadline already in the
    /// past degrades to a try: latched outcome or `TimedOut`, no park.
    pub fn wait_until(self: &Arc<Self>, deadline: Option<Instant>) -> (WaitResult, u64) {
        {
            let mut state = self.state.lock();
            if let Some(outcome) = state.outcome {
                return outcome;
            }
            state.waiter = Some(thread::current());
        }

        // Make thread teardown able to find us: a kill converts this wait
        // into an Interrupted outcome through the registered blocker.
        scheduler::set_current_blocker(Some(self.clone()));
        let outcome = self.park_until(deadline);
        scheduler::set_current_blocker(None);
        outcome
    }

    /// Park loop. Returns the latched outcome.
    fn park_until(self: &Arc<Self>, deadline: Option<Instant>) -> (WaitResult, u64) {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(outcome) = state.outcome {
                    state.waiter = None;
                    return outcome;
                }
                if let Some(d) = deadline {
                    if Instant::now() >= d {
                        state.waiter = None;
                        state.outcome = Some((WaitResult::TimedOut, 0));
                        return (WaitResult::TimedOut, 0);
                    }
                }
            }
            // An unpark between the check above and the park below is not
            // lost: park consumes the token and returns immediately.
            match deadline {
                None => thread::park(),
                Some(d) => {
                    let now = Instant::now();
                    if now < d {
                        thread::park_timeout(d - now);
                    }
                }
            }
        }
    }

    /// Fires the event with the given outcome.
    ///
    /// Returns true if this call was the first signaller; later calls
    /// change nothing and return false.
    pub fn signal(&self, result: WaitResult, context: u64) -> bool {
        let mut state = self.state.lock();
        if state.outcome.is_some() {
            return false;
        }
        state.outcome = Some((result, context));
        if let Some(waiter) = state.waiter.take() {
            waiter.unpark();
        }
        true
    }

    /// The latched outcome, if the event already fired.
    pub fn outcome(&self) -> Option<(WaitResult, u64)> {
        self.state.lock().outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn zero_timeout_does_not_block() {
        let ev = WaitEvent::new();
        assert_eq!(ev.wait(0), (WaitResult::TimedOut, 0));
    }

    #[test]
    fn first_signal_wins() {
        let ev = WaitEvent::new();
        assert!(ev.signal(WaitResult::Satisfied, 7));
        assert!(!ev.signal(WaitResult::Cancelled, 9));
        assert_eq!(ev.wait(0), (WaitResult::Satisfied, 7));
        assert_eq!(ev.wait(1_000_000), (WaitResult::Satisfied, 7));
    }

    #[test]
    fn wait_times_out() {
        let ev = WaitEvent::new();
        let (result, _) = ev.wait(2_000_000);
        assert_eq!(result, WaitResult::TimedOut);
        // The timeout latched; a late signal is a no-op.
        assert!(!ev.signal(WaitResult::Satisfied, 1));
    }

    #[test]
    fn expired_deadline_does_not_park() {
        let ev = WaitEvent::new();
        let past = Instant::now() - Duration::from_millis(5);
        assert_eq!(ev.wait_until(Some(past)), (WaitResult::TimedOut, 0));

        // A signalled event still reports its outcome through an expired
        // deadline.
        let ev = WaitEvent::new();
        ev.signal(WaitResult::Satisfied, 3);
        assert_eq!(ev.wait_until(Some(past)), (WaitResult::Satisfied, 3));
    }

    #[test]
    fn cross_thread_signal_wakes() {
        let ev = WaitEvent::new();
        let ev2 = ev.clone();
        let signaller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            ev2.signal(WaitResult::Satisfied, 42)
        });
        let (result, ctx) = ev.wait(borealis_libkern::DEADLINE_INFINITE);
        assert_eq!(result, WaitResult::Satisfied);
        assert_eq!(ctx, 42);
        assert!(signaller.join().unwrap());
    }
}
