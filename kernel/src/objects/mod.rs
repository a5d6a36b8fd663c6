//! Kernel objects.
//!
//! Every user-visible kernel resource is a [Dispatcher]: a shared,
//! ref-counted object with a frozen type tag and koid, optionally
//! carrying a [StateTracker] when it is waitable. Handles hold
//! `Arc<dyn Dispatcher>`; syscalls check the type tag once per entry
//! point and downcast to the concrete kind.
//!
//! Paired kinds (message pipe ends, data pipe producer/consumer, socket
//! halves, event pair halves) share an internal object holding both
//! sides' queues; each end dispatcher is a thin facade with a side
//! index.

use alloc::sync::Arc;
use core::any::Any;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use borealis_libkern::{ObjectType, Signals};

use crate::error::KernelError;
use crate::event::StateTracker;
use crate::sync::SpinLock;

pub mod datapipe;
pub mod event;
pub mod interrupt;
pub mod log;
pub mod msgpipe;
pub mod port;
pub mod resource;
pub mod socket;
pub mod vmo;
pub mod waitset;

pub use self::datapipe::{DataPipeConsumer, DataPipeProducer};
pub use self::event::{EventDispatcher, EventPairDispatcher};
pub use self::interrupt::InterruptDispatcher;
pub use self::log::LogDispatcher;
pub use self::msgpipe::{HandleList, MessagePacket, MessagePipeEnd};
pub use self::port::{IoPacket, IoPortClient, IoPortDispatcher};
pub use self::resource::{root_resource, ResourceDispatcher, ResourceKind};
pub use self::socket::SocketDispatcher;
pub use self::vmo::VmObject;
pub use self::waitset::WaitSetDispatcher;

/// Koids are handed out from here: globally monotonic, never reused,
/// starting at 1 so that 0 can mean "no object".
static NEXT_KOID: AtomicU64 = AtomicU64::new(1);

/// Allocates a fresh koid.
pub fn new_koid() -> u64 {
    NEXT_KOID.fetch_add(1, Ordering::Relaxed)
}

/// State every dispatcher embeds: koid, live-handle count, the optional
/// state tracker and the optional io-port binding.
pub struct KObjectBase {
    /// Kernel object id. Frozen at construction.
    koid: u64,
    /// Number of live [Handle](crate::handle::Handle)s referencing this
    /// object, whether in a table or in transit inside a message.
    handle_count: AtomicU32,
    /// The signaling facade, present iff the object is waitable.
    state_tracker: Option<StateTracker>,
    /// The io-port binding, at most one per object.
    port_client: SpinLock<Option<Arc<IoPortClient>>>,
}

impl core::fmt::Debug for KObjectBase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "KObjectBase {{ koid: {} }}", self.koid)
    }
}

impl KObjectBase {
    /// Creates a base with no state tracker.
    pub fn new() -> KObjectBase {
        KObjectBase::with_tracker(None)
    }

    /// Creates a base carrying the given tracker.
    pub fn waitable(satisfied: Signals, satisfiable: Signals) -> KObjectBase {
        KObjectBase::with_tracker(Some(StateTracker::new(satisfied, satisfiable)))
    }

    fn with_tracker(state_tracker: Option<StateTracker>) -> KObjectBase {
        KObjectBase {
            koid: new_koid(),
            handle_count: AtomicU32::new(0),
            state_tracker,
            port_client: SpinLock::new(None),
        }
    }

    /// The object's koid.
    pub fn koid(&self) -> u64 {
        self.koid
    }

    /// The tracker, if the object is waitable.
    pub fn tracker(&self) -> Option<&StateTracker> {
        self.state_tracker.as_ref()
    }

    /// Notes a new live handle to this object.
    pub fn inc_handle_count(&self) {
        self.handle_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Notes a destroyed handle. Returns true when this was the last one:
    /// the caller must then run the object's closed hook.
    pub fn dec_handle_count(&self) -> bool {
        self.handle_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Current live-handle count.
    pub fn handle_count(&self) -> u32 {
        self.handle_count.load(Ordering::Acquire)
    }

    /// The io-port binding slot.
    pub fn port_client(&self) -> &SpinLock<Option<Arc<IoPortClient>>> {
        &self.port_client
    }
}

/// A kernel object.
///
/// The type tag, not the vtable, is what syscalls dispatch on: every
/// entry point checks `object_type()` once (through
/// [downcast_dispatcher]) and then talks to the concrete type.
pub trait Dispatcher: Send + Sync + 'static {
    /// The embedded base.
    fn base(&self) -> &KObjectBase;

    /// The frozen type tag.
    fn object_type(&self) -> ObjectType;

    /// Upcast for typed downcasting. Implementations return `self`.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// The signaling facade, if this object is waitable.
    ///
    /// Paired kinds whose trackers live in the shared object override
    /// this; everything else keeps the base's.
    fn state_tracker(&self) -> Option<&StateTracker> {
        self.base().tracker()
    }

    /// Signals userspace may set and clear through `object_signal`.
    fn allowed_user_signals(&self) -> Signals {
        Signals::empty()
    }

    /// Koid of the related object: the peer for paired kinds, the owning
    /// process for threads. 0 when there is none.
    fn related_koid(&self) -> u64 {
        0
    }

    /// Runs when the last handle to this object is destroyed.
    ///
    /// This is the uniform "closed" hook: paired kinds sever their peer
    /// here, queues drop their content. Note that the object itself may
    /// outlive this call through `Arc` references held by packets or
    /// observers; only handle reachability ends here.
    fn on_zero_handles(&self) {}
}

/// Koid of any dispatcher behind an `Arc<dyn Dispatcher>`.
pub fn dispatcher_koid(dispatcher: &Arc<dyn Dispatcher>) -> u64 {
    dispatcher.base().koid()
}

/// Downcasts a type-erased dispatcher to a concrete kind.
///
/// The single runtime type check of every typed entry point. Fails with
/// `WrongType` without touching the object.
pub fn downcast_dispatcher<T: Dispatcher + StaticObjectType>(
    dispatcher: &Arc<dyn Dispatcher>,
) -> Result<Arc<T>, KernelError> {
    if dispatcher.object_type() == T::static_object_type() {
        let any = dispatcher.clone().as_any_arc();
        any.downcast::<T>().map_err(|_| KernelError::wrong_type())
    } else {
        Err(KernelError::wrong_type())
    }
}

/// Associated type tag, used by [downcast_dispatcher] to check the tag
/// without constructing an instance.
pub trait StaticObjectType {
    /// The tag all instances of this kind carry.
    fn static_object_type() -> ObjectType;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn koids_are_monotonic_and_nonzero() {
        let a = new_koid();
        let b = new_koid();
        assert!(a > 0);
        assert!(b > a);
    }

    #[test]
    fn handle_count_last_drop_detected() {
        let base = KObjectBase::new();
        base.inc_handle_count();
        base.inc_handle_count();
        assert!(!base.dec_handle_count());
        assert!(base.dec_handle_count());
    }
}
