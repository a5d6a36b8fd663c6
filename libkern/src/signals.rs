//! Signal bitmasks.
//!
//! Signals are level-triggered conditions raised on an object's state
//! tracker. A waiter becomes runnable whenever the intersection of the
//! satisfied set and its desired set is non-empty.

bitflags! {
    /// A set of signals.
    ///
    /// The low bits are standard and shared across object types; the high
    /// byte is reserved for user-settable bits whose meaning is private to
    /// the users of an object.
    pub struct Signals: u32 {
        /// The object holds something to read.
        const READABLE = 1 << 0;
        /// The object can accept a write.
        const WRITABLE = 1 << 1;
        /// The paired endpoint is closed.
        const PEER_CLOSED = 1 << 2;
        /// The object reached its signaled state (task exit, event set).
        const SIGNALED = 1 << 3;
        /// User signal 0.
        const USER_0 = 1 << 24;
        /// User signal 1.
        const USER_1 = 1 << 25;
        /// User signal 2.
        const USER_2 = 1 << 26;
        /// User signal 3.
        const USER_3 = 1 << 27;
        /// User signal 4.
        const USER_4 = 1 << 28;
        /// User signal 5.
        const USER_5 = 1 << 29;
        /// User signal 6.
        const USER_6 = 1 << 30;
        /// User signal 7.
        const USER_7 = 1 << 31;
    }
}

impl Signals {
    /// The whole user-settable range.
    pub fn user_all() -> Signals {
        Signals::USER_0 | Signals::USER_1 | Signals::USER_2 | Signals::USER_3
            | Signals::USER_4 | Signals::USER_5 | Signals::USER_6 | Signals::USER_7
    }
}

/// The `(satisfied, satisfiable)` pair a wait reports for one object.
///
/// `satisfied` is the set of signals currently active; `satisfiable` the
/// set that can still become active in this object's lifetime. Invariant:
/// `satisfied` is always a subset of `satisfiable`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalsState {
    /// Currently active signals.
    pub satisfied: u32,
    /// Signals that may yet become active.
    pub satisfiable: u32,
}

unsafe impl plain::Plain for SignalsState {}

assert_eq_size!(SignalsState, u64);

impl SignalsState {
    /// Builds a state pair from typed masks.
    pub fn new(satisfied: Signals, satisfiable: Signals) -> SignalsState {
        SignalsState {
            satisfied: satisfied.bits(),
            satisfiable: satisfiable.bits(),
        }
    }

    /// The satisfied set, typed.
    pub fn satisfied(self) -> Signals {
        Signals::from_bits_truncate(self.satisfied)
    }

    /// The satisfiable set, typed.
    pub fn satisfiable(self) -> Signals {
        Signals::from_bits_truncate(self.satisfiable)
    }
}
