//! The global handle arena.
//!
//! A fixed-capacity slab holding every live [Handle] in the system, so
//! each handle has a stable index for its whole life. The user-visible
//! handle value is the index, tagged and XOR-masked with a per-process
//! secret: forging a value for somebody else's handle means guessing
//! their secret, and a stale value from before a close decodes to a free
//! (zeroed) slot and is rejected.

use alloc::sync::Arc;
use alloc::vec::Vec;

use borealis_libkern::{HandleValue, Rights};
use borealis_libutils::{bit_array_first_zero, bit_array_get, bit_array_set};

use crate::config::HANDLE_ARENA_CAPACITY;
use crate::error::KernelError;
use crate::handle::{Handle, OwnedHandle};
use crate::objects::Dispatcher;
use crate::sync::SpinLock;

// The encoding leaves 2 tag bits and a sign bit around the index.
const_assert!(HANDLE_ARENA_CAPACITY <= 1 << 29);

/// Slab state. Protected by the one global handle lock.
struct ArenaInner {
    /// The slots. Grows on demand up to [HANDLE_ARENA_CAPACITY]; a `None`
    /// is a free slot, and lookup relies on freed slots being reset to
    /// `None`.
    slots: Vec<Option<Handle>>,
    /// Allocation bitmap over the full capacity; bit set = slot in use.
    bitmap: Vec<u8>,
    /// Number of live handles.
    live: usize,
}

lazy_static! {
    /// The global arena.
    static ref ARENA: SpinLock<ArenaInner> = SpinLock::new(ArenaInner {
        slots: Vec::new(),
        bitmap: alloc::vec![0; HANDLE_ARENA_CAPACITY / 8],
        live: 0,
    });
}

/// Allocates a slot and constructs a [Handle] in place.
///
/// The new handle is unowned; the caller attaches it to a table (or a
/// packet) through the returned token.
pub fn alloc_handle(
    dispatcher: Arc<dyn Dispatcher>,
    rights: Rights,
) -> Result<OwnedHandle, KernelError> {
    let mut arena = ARENA.lock();
    let index = bit_array_first_zero(&arena.bitmap).ok_or_else(KernelError::no_memory)?;
    bit_array_set(&mut arena.bitmap, index, true);
    if arena.slots.len() <= index {
        arena.slots.resize_with(index + 1, || None);
    }
    debug_assert!(arena.slots[index].is_none(), "allocation bitmap out of sync with slots");
    arena.slots[index] = Some(Handle::new(dispatcher, rights, index as u32));
    arena.live += 1;
    Ok(OwnedHandle::from_index(index as u32))
}

/// Destroys the handle at `index`: takes it out of its slot, zeroes the
/// slot, and runs the handle destructor outside the arena lock (the
/// cancel hook and a possible last-reference teardown both take other
/// locks).
///
/// # Panics
///
/// Panics on a free slot: a double free is a kernel bug, not a user
/// error.
pub(crate) fn delete_handle(index: u32) {
    let handle = {
        let mut arena = ARENA.lock();
        let slot = arena
            .slots
            .get_mut(index as usize)
            .and_then(Option::take);
        let handle = slot.unwrap_or_else(|| panic!("double free of handle slot {}", index));
        bit_array_set(&mut arena.bitmap, index as usize, false);
        arena.live -= 1;
        handle
    };
    drop(handle);
}

/// Copies out the `(dispatcher, rights, owner)` triple of a live slot.
///
/// `None` for a free or never-allocated slot.
pub fn inspect(index: u32) -> Option<(Arc<dyn Dispatcher>, Rights, u64)> {
    let arena = ARENA.lock();
    arena
        .slots
        .get(index as usize)
        .and_then(|slot| slot.as_ref())
        .map(|handle| (handle.dispatcher().clone(), handle.rights(), handle.owner()))
}

/// Rewrites the owner koid of a live slot. 0 marks the handle unowned /
/// in transit.
pub(crate) fn set_owner(index: u32, owner: u64) {
    let mut arena = ARENA.lock();
    let handle = arena
        .slots
        .get_mut(index as usize)
        .and_then(|slot| slot.as_mut())
        .expect("set_owner on a free handle slot");
    handle.owner = owner;
}

/// Number of live handles in the whole system.
pub fn live_count() -> usize {
    ARENA.lock().live
}

/// Whether the slot at `index` is currently allocated.
pub fn is_live(index: u32) -> bool {
    let arena = ARENA.lock();
    (index as usize) < HANDLE_ARENA_CAPACITY && bit_array_get(&arena.bitmap, index as usize)
}

/// Mask applied to every fresh handle secret.
///
/// Top bit clear keeps values non-negative as an `i32`; the two low bits
/// clear keep the encoding's tag bits visible in the value, so a value
/// always has its bottom bit set and can never be 0.
pub const SECRET_MASK: u32 = 0x7fff_fffc;

/// Encodes an arena index into the user-visible handle value.
pub fn map_handle_to_value(index: u32, secret: u32) -> HandleValue {
    debug_assert_eq!(secret & !SECRET_MASK, 0, "unmasked handle secret");
    ((index << 2) | 1) ^ secret
}

/// Decodes a user-supplied value back to an arena index.
///
/// Rejects values whose tag bits are wrong or whose index is out of
/// range; the caller still has to check slot liveness and ownership.
pub fn map_value_to_handle(value: HandleValue, secret: u32) -> Result<u32, KernelError> {
    let unmasked = value ^ secret;
    if unmasked & 0b11 != 0b01 {
        return Err(KernelError::bad_handle(value));
    }
    let index = unmasked >> 2;
    if index as usize >= HANDLE_ARENA_CAPACITY {
        return Err(KernelError::bad_handle(value));
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::EventDispatcher;

    fn new_event_dispatcher() -> Arc<dyn Dispatcher> {
        let dispatcher: Arc<dyn Dispatcher> = EventDispatcher::new();
        dispatcher
    }

    #[test]
    fn alloc_inspect_delete() {
        let owned = alloc_handle(new_event_dispatcher(), Rights::default_rw()).unwrap();
        let index = owned.index();
        assert!(is_live(index));
        let (_, rights, owner) = inspect(index).unwrap();
        assert_eq!(rights, Rights::default_rw());
        assert_eq!(owner, 0);

        drop(owned);
        assert!(!is_live(index));
        assert!(inspect(index).is_none());
    }

    #[test]
    fn value_encoding_roundtrips_and_tags() {
        let secret = 0x1234_5670 & SECRET_MASK;
        for &index in &[0u32, 1, 42, (HANDLE_ARENA_CAPACITY - 1) as u32] {
            let value = map_handle_to_value(index, secret);
            // Non-negative, bottom bit set, nonzero.
            assert_eq!(value & 0x8000_0000, 0);
            assert_eq!(value & 1, 1);
            assert_ne!(value, 0);
            assert_eq!(map_value_to_handle(value, secret).unwrap(), index);
        }
    }

    #[test]
    fn value_decoding_rejects_garbage() {
        let secret = 0x0bad_b004 & SECRET_MASK;
        // Wrong tag bits.
        assert!(map_value_to_handle(secret, secret).is_err());
        // Out-of-range index.
        let too_far = map_handle_to_value(HANDLE_ARENA_CAPACITY as u32, secret);
        assert!(map_value_to_handle(too_far, secret).is_err());
    }

    #[test]
    fn arena_bijection_on_live_slots() {
        let secret = 0x7f0f_0f0c;
        let a = alloc_handle(new_event_dispatcher(), Rights::default_rw()).unwrap();
        let b = alloc_handle(new_event_dispatcher(), Rights::default_rw()).unwrap();
        for owned in &[&a, &b] {
            let value = map_handle_to_value(owned.index(), secret);
            assert_eq!(map_value_to_handle(value, secret).unwrap(), owned.index());
        }
    }
}
