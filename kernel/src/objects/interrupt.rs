//! Interrupt objects.
//!
//! The waitable face of an interrupt line. The arch layer's irq glue
//! calls [fire](InterruptDispatcher::fire) from its handler; userspace
//! waits on SIGNALED through the ordinary wait syscalls and acknowledges
//! with [complete](InterruptDispatcher::complete) before the next edge
//! is observable.

use alloc::sync::Arc;
use core::any::Any;
use core::sync::atomic::{AtomicU32, Ordering};

use borealis_libkern::{ObjectType, Signals};

use crate::objects::{Dispatcher, KObjectBase, StaticObjectType};

/// An interrupt line object.
pub struct InterruptDispatcher {
    /// Base with the tracker; SIGNALED is the only signal.
    base: KObjectBase,
    /// The line number, for the arch layer's bookkeeping.
    vector: u32,
    /// Edges fired since the last complete.
    pending: AtomicU32,
}

impl core::fmt::Debug for InterruptDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "InterruptDispatcher {{ koid: {}, vector: {} }}",
            self.base.koid(),
            self.vector
        )
    }
}

impl InterruptDispatcher {
    /// Creates the object for interrupt line `vector`.
    pub fn new(vector: u32) -> Arc<InterruptDispatcher> {
        Arc::new(InterruptDispatcher {
            base: KObjectBase::waitable(Signals::empty(), Signals::SIGNALED),
            vector,
            pending: AtomicU32::new(0),
        })
    }

    /// The interrupt line number.
    pub fn vector(&self) -> u32 {
        self.vector
    }

    /// Notes an edge on the line. Interrupt context on a real target, so
    /// nothing here may block.
    pub fn fire(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.base
            .tracker()
            .expect("interrupt objects always carry a tracker")
            .update_satisfied(Signals::empty(), Signals::SIGNALED);
    }

    /// Acknowledges the observed edges, rearming SIGNALED.
    ///
    /// Returns how many edges had fired since the previous complete.
    pub fn complete(&self) -> u32 {
        let fired = self.pending.swap(0, Ordering::AcqRel);
        self.base
            .tracker()
            .expect("interrupt objects always carry a tracker")
            .update_satisfied(Signals::SIGNALED, Signals::empty());
        fired
    }
}

impl Dispatcher for InterruptDispatcher {
    fn base(&self) -> &KObjectBase {
        &self.base
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::INTERRUPT
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl StaticObjectType for InterruptDispatcher {
    fn static_object_type() -> ObjectType {
        ObjectType::INTERRUPT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fire_complete_cycle() {
        let irq = InterruptDispatcher::new(9);
        let tracker = irq.state_tracker().unwrap();
        assert!(!tracker.state().satisfied().contains(Signals::SIGNALED));

        irq.fire();
        irq.fire();
        assert!(tracker.state().satisfied().contains(Signals::SIGNALED));
        assert_eq!(irq.complete(), 2);
        assert!(!tracker.state().satisfied().contains(Signals::SIGNALED));
    }
}
