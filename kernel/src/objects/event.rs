//! Event and event pair: pure signaling primitives.

use alloc::sync::{Arc, Weak};
use core::any::Any;
use core::sync::atomic::{AtomicU64, Ordering};

use borealis_libkern::{ObjectType, Signals};

use crate::error::KernelError;
use crate::objects::{Dispatcher, KObjectBase, StaticObjectType};
use crate::sync::SpinLock;

/// A plain event: nothing but user-settable bits on a tracker.
pub struct EventDispatcher {
    /// Base with the tracker.
    base: KObjectBase,
}

impl core::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EventDispatcher {{ koid: {} }}", self.base.koid())
    }
}

impl EventDispatcher {
    /// Creates an event with nothing satisfied.
    pub fn new() -> Arc<EventDispatcher> {
        Arc::new(EventDispatcher {
            base: KObjectBase::waitable(
                Signals::empty(),
                Signals::SIGNALED | Signals::user_all(),
            ),
        })
    }
}

impl Dispatcher for EventDispatcher {
    fn base(&self) -> &KObjectBase {
        &self.base
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::EVENT
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn allowed_user_signals(&self) -> Signals {
        Signals::SIGNALED | Signals::user_all()
    }
}

impl StaticObjectType for EventDispatcher {
    fn static_object_type() -> ObjectType {
        ObjectType::EVENT
    }
}

/// One half of an event pair.
///
/// Like an event, but the halves can signal each other and the survivor
/// learns about the peer's death through PEER_CLOSED.
pub struct EventPairDispatcher {
    /// Base with the tracker.
    base: KObjectBase,
    /// The other half. Weak: the pair must not keep itself alive.
    peer: SpinLock<Weak<EventPairDispatcher>>,
    /// Koid of the other half, for `related_koid`.
    peer_koid: AtomicU64,
}

impl core::fmt::Debug for EventPairDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EventPairDispatcher {{ koid: {} }}", self.base.koid())
    }
}

impl EventPairDispatcher {
    /// Creates both halves, already joined.
    pub fn new_pair() -> (Arc<EventPairDispatcher>, Arc<EventPairDispatcher>) {
        let make = || {
            Arc::new(EventPairDispatcher {
                base: KObjectBase::waitable(
                    Signals::empty(),
                    Signals::SIGNALED | Signals::PEER_CLOSED | Signals::user_all(),
                ),
                peer: SpinLock::new(Weak::new()),
                peer_koid: AtomicU64::new(0),
            })
        };
        let end0 = make();
        let end1 = make();
        *end0.peer.lock() = Arc::downgrade(&end1);
        *end1.peer.lock() = Arc::downgrade(&end0);
        end0.peer_koid.store(end1.base.koid(), Ordering::Relaxed);
        end1.peer_koid.store(end0.base.koid(), Ordering::Relaxed);
        (end0, end1)
    }

    /// Applies an `object_signal_peer` to the other half.
    pub fn signal_peer(&self, clear: Signals, set: Signals) -> Result<(), KernelError> {
        let peer = self.peer.lock().upgrade().ok_or_else(KernelError::channel_closed)?;
        peer.base
            .tracker()
            .expect("event pair halves always carry a tracker")
            .user_signal(clear, set, self.allowed_user_signals())
    }
}

impl Dispatcher for EventPairDispatcher {
    fn base(&self) -> &KObjectBase {
        &self.base
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::EVENT_PAIR
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn allowed_user_signals(&self) -> Signals {
        Signals::SIGNALED | Signals::user_all()
    }

    fn related_koid(&self) -> u64 {
        self.peer_koid.load(Ordering::Relaxed)
    }

    fn on_zero_handles(&self) {
        // Tell the survivor its peer is gone and sever the link both
        // ways.
        let peer = self.peer.lock().upgrade();
        if let Some(peer) = peer {
            *peer.peer.lock() = Weak::new();
            peer.base
                .tracker()
                .expect("event pair halves always carry a tracker")
                .update_satisfied(Signals::empty(), Signals::PEER_CLOSED);
        }
    }
}

impl StaticObjectType for EventPairDispatcher {
    fn static_object_type() -> ObjectType {
        ObjectType::EVENT_PAIR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_allows_user_signals_only() {
        let event = EventDispatcher::new();
        let tracker = event.state_tracker().unwrap();
        tracker
            .user_signal(Signals::empty(), Signals::SIGNALED, event.allowed_user_signals())
            .unwrap();
        assert!(tracker.state().satisfied().contains(Signals::SIGNALED));
        assert!(tracker
            .user_signal(Signals::empty(), Signals::READABLE, event.allowed_user_signals())
            .is_err());
    }

    #[test]
    fn pair_signals_cross() {
        let (end0, end1) = EventPairDispatcher::new_pair();
        end0.signal_peer(Signals::empty(), Signals::USER_1).unwrap();
        assert!(end1
            .state_tracker()
            .unwrap()
            .state()
            .satisfied()
            .contains(Signals::USER_1));
        assert_eq!(end0.related_koid(), end1.base().koid());
    }

    #[test]
    fn close_raises_peer_closed() {
        let (end0, end1) = EventPairDispatcher::new_pair();
        end0.on_zero_handles();
        assert!(end1
            .state_tracker()
            .unwrap()
            .state()
            .satisfied()
            .contains(Signals::PEER_CLOSED));
        assert!(end1.signal_peer(Signals::empty(), Signals::USER_0).is_err());
    }
}
