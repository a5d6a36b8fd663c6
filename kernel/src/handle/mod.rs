//! Handles: per-process capabilities to dispatchers.
//!
//! A [Handle] couples a shared dispatcher reference with a rights mask
//! and the koid of the process owning it. Handles physically live in the
//! global [arena]; ownership moves around as [OwnedHandle] tokens, which
//! is what a [table](crate::handle::table) entry or an in-transit message
//! actually holds. Dropping the token destroys the handle: cancel hook,
//! then destructor, then the slot returns to the free list.

pub mod arena;
pub mod table;

pub use self::table::ProcessHandleTable;

use alloc::sync::Arc;

use borealis_libkern::Rights;

use crate::objects::Dispatcher;

/// A capability: a dispatcher reference plus the rights this particular
/// reference grants.
///
/// Exclusively owned by one handle table at any instant, or by a message
/// packet while in transit (owner koid 0). Never constructed outside the
/// [arena].
pub struct Handle {
    /// The object this handle names.
    dispatcher: Arc<dyn Dispatcher>,
    /// What this handle may do with it.
    rights: Rights,
    /// Koid of the owning process, 0 while unowned or in transit.
    owner: u64,
    /// This handle's slot in the arena. Stable for the handle's whole
    /// life, including transfers; waits key their cancel registration on
    /// it.
    index: u32,
}

impl core::fmt::Debug for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Handle {{ koid: {}, rights: {:?}, owner: {}, index: {} }}",
            self.dispatcher.base().koid(),
            self.rights,
            self.owner,
            self.index
        )
    }
}

impl Handle {
    /// Called by the arena only; everybody else goes through
    /// [arena::alloc_handle].
    fn new(dispatcher: Arc<dyn Dispatcher>, rights: Rights, index: u32) -> Handle {
        dispatcher.base().inc_handle_count();
        Handle {
            dispatcher,
            rights,
            owner: 0,
            index,
        }
    }

    /// The object behind the handle.
    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    /// The rights mask.
    pub fn rights(&self) -> Rights {
        self.rights
    }

    /// Koid of the owning process, 0 if unowned.
    pub fn owner(&self) -> u64 {
        self.owner
    }

    /// The arena slot index.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        // Unblock any wait that was registered through this handle before
        // the dispatcher reference can go away; the tracker's raw
        // handle-index keys must never outlive the handle they name.
        if let Some(tracker) = self.dispatcher.state_tracker() {
            tracker.cancel(self.index);
        }
        if self.dispatcher.base().dec_handle_count() {
            self.dispatcher.on_zero_handles();
        }
    }
}

/// Owning token for a live arena slot.
///
/// Whoever holds the token owns the handle: a table entry, a message
/// packet, or a stack frame mid-transfer. Dropping it destroys the
/// handle through [arena::delete_handle].
pub struct OwnedHandle {
    /// Arena index of the owned slot.
    index: u32,
}

impl core::fmt::Debug for OwnedHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "OwnedHandle({})", self.index)
    }
}

impl OwnedHandle {
    /// Wraps a freshly allocated arena index. Internal to the handle
    /// module.
    pub(crate) fn from_index(index: u32) -> OwnedHandle {
        OwnedHandle { index }
    }

    /// The arena index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Gives up ownership without destroying the handle. The caller
    /// becomes responsible for eventually reconstructing a token for the
    /// index.
    pub(crate) fn into_index(self) -> u32 {
        let index = self.index;
        core::mem::forget(self);
        index
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        arena::delete_handle(self.index);
    }
}
