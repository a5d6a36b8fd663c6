//! The per-process handle table.
//!
//! Maps user-visible handle values to arena slots for one process. All
//! operations run under the table's own lock; the arena lock nests
//! inside it. Duplicate and replace run under the same lock hold as add,
//! which is what keeps values unique per process.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;

use borealis_libkern::rights::SAME_RIGHTS;
use borealis_libkern::{HandleValue, Rights};

use crate::cprng;
use crate::error::KernelError;
use crate::handle::arena::{self, map_handle_to_value, map_value_to_handle, SECRET_MASK};
use crate::handle::OwnedHandle;
use crate::objects::Dispatcher;
use crate::sync::SpinLock;

/// One process's view of its handles.
pub struct ProcessHandleTable {
    /// Koid of the owning process; every handle in the table carries it.
    owner: u64,
    /// The value-scrambling secret, drawn from the CPRNG at process
    /// creation.
    secret: u32,
    /// Live entries, keyed by arena index.
    inner: SpinLock<HashMap<u32, OwnedHandle>>,
}

impl core::fmt::Debug for ProcessHandleTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ProcessHandleTable {{ owner: {} }}", self.owner)
    }
}

impl ProcessHandleTable {
    /// Creates an empty table for the process with the given koid.
    pub fn new(owner: u64) -> ProcessHandleTable {
        ProcessHandleTable {
            owner,
            secret: cprng::draw_u32() & SECRET_MASK,
            inner: SpinLock::new(HashMap::new()),
        }
    }

    /// Takes ownership of `handle` and hands back the value userspace
    /// will use for it.
    pub fn add_handle(&self, handle: OwnedHandle) -> HandleValue {
        let mut inner = self.inner.lock();
        let index = handle.index();
        arena::set_owner(index, self.owner);
        let value = map_handle_to_value(index, self.secret);
        let evicted = inner.insert(index, handle);
        debug_assert!(evicted.is_none(), "arena index {} owned twice", index);
        value
    }

    /// Decodes `value` and checks it names a live handle of this process.
    ///
    /// Returns the arena index. The building block of every other
    /// operation here; callers must be holding the table lock or accept
    /// that the handle may be gone by the time they use the index.
    fn resolve(&self, inner: &HashMap<u32, OwnedHandle>, value: HandleValue) -> Result<u32, KernelError> {
        let index = map_value_to_handle(value, self.secret)?;
        if !inner.contains_key(&index) {
            return Err(KernelError::bad_handle(value));
        }
        Ok(index)
    }

    /// Looks `value` up and checks `required` rights.
    ///
    /// This is the syscall path: bad value → `BadHandle`, missing rights
    /// → `AccessDenied`.
    pub fn lookup(
        &self,
        value: HandleValue,
        required: Rights,
    ) -> Result<Arc<dyn Dispatcher>, KernelError> {
        self.lookup_with_rights(value, required).map(|(dispatcher, _)| dispatcher)
    }

    /// [lookup](Self::lookup), also reporting the handle's full rights.
    pub fn lookup_with_rights(
        &self,
        value: HandleValue,
        required: Rights,
    ) -> Result<(Arc<dyn Dispatcher>, Rights), KernelError> {
        self.lookup_indexed(value, required)
            .map(|(_, dispatcher, rights)| (dispatcher, rights))
    }

    /// [lookup](Self::lookup), also reporting the arena index and full
    /// rights. Waits key their cancel registration on the index.
    pub fn lookup_indexed(
        &self,
        value: HandleValue,
        required: Rights,
    ) -> Result<(u32, Arc<dyn Dispatcher>, Rights), KernelError> {
        let inner = self.inner.lock();
        let index = self.resolve(&inner, value)?;
        let (dispatcher, rights, owner) = arena::inspect(index)
            .ok_or_else(|| KernelError::bad_handle(value))?;
        if owner != self.owner {
            // A stale index colliding with somebody else's live slot.
            return Err(KernelError::bad_handle(value));
        }
        if !rights.allows(required) {
            return Err(KernelError::access_denied(rights, required));
        }
        Ok((index, dispatcher, rights))
    }

    /// Removes `value` from the table, returning ownership of the
    /// handle. The handle is not destroyed; it is now unowned (owner 0),
    /// as a message in flight carries it.
    pub fn remove_handle(&self, value: HandleValue) -> Result<OwnedHandle, KernelError> {
        let mut inner = self.inner.lock();
        let index = self.resolve(&inner, value)?;
        let handle = inner.remove(&index).expect("resolve checked presence");
        arena::set_owner(index, 0);
        Ok(handle)
    }

    /// Closes `value`: removes it and destroys the handle. Destruction
    /// runs outside the table lock.
    pub fn close_handle(&self, value: HandleValue) -> Result<(), KernelError> {
        let handle = self.remove_handle(value)?;
        drop(handle);
        Ok(())
    }

    /// Duplicates `value` into a new handle of this table.
    ///
    /// Requires the DUPLICATE right. `rights_word` is either the
    /// SAME_RIGHTS sentinel or a subset of the source's rights; asking
    /// for more than the source has is refused with the table unchanged.
    pub fn duplicate(&self, value: HandleValue, rights_word: u32) -> Result<HandleValue, KernelError> {
        let mut inner = self.inner.lock();
        let index = self.resolve(&inner, value)?;
        let (dispatcher, src_rights, _) = arena::inspect(index)
            .ok_or_else(|| KernelError::bad_handle(value))?;
        if !src_rights.allows(Rights::DUPLICATE) {
            return Err(KernelError::access_denied(src_rights, Rights::DUPLICATE));
        }
        let new_rights = narrow_rights(src_rights, rights_word)?;
        let new_handle = arena::alloc_handle(dispatcher, new_rights)?;
        let new_index = new_handle.index();
        arena::set_owner(new_index, self.owner);
        let new_value = map_handle_to_value(new_index, self.secret);
        inner.insert(new_index, new_handle);
        Ok(new_value)
    }

    /// Atomically replaces `value` with a new handle carrying
    /// `rights_word`.
    ///
    /// On success the old value is dead and the new one is live. On any
    /// failure the table is observably unchanged: the new handle is
    /// allocated before the old one is removed, so an arena-exhaustion
    /// failure rolls back by never having touched the original.
    pub fn replace(&self, value: HandleValue, rights_word: u32) -> Result<HandleValue, KernelError> {
        let old_handle;
        let new_value;
        {
            let mut inner = self.inner.lock();
            let index = self.resolve(&inner, value)?;
            let (dispatcher, src_rights, _) = arena::inspect(index)
                .ok_or_else(|| KernelError::bad_handle(value))?;
            let new_rights = narrow_rights(src_rights, rights_word)?;
            let new_handle = arena::alloc_handle(dispatcher, new_rights)?;
            let new_index = new_handle.index();
            arena::set_owner(new_index, self.owner);
            new_value = map_handle_to_value(new_index, self.secret);
            inner.insert(new_index, new_handle);
            old_handle = inner.remove(&index).expect("resolve checked presence");
            arena::set_owner(index, 0);
        }
        // Destroy the replaced handle outside the table lock.
        drop(old_handle);
        Ok(new_value)
    }

    /// Empties the table, returning every handle for destruction.
    ///
    /// Process teardown calls this and drops the result outside the
    /// lock, one handle at a time.
    pub fn drain(&self) -> Vec<OwnedHandle> {
        let mut inner = self.inner.lock();
        inner.drain().map(|(_, handle)| handle).collect()
    }

    /// Number of live handles in the table.
    pub fn count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Re-encodes a live arena index into this process's value space.
    ///
    /// Used when re-attaching received handles: the index survived the
    /// transfer, the value is per-process.
    pub fn value_for_index(&self, index: u32) -> HandleValue {
        map_handle_to_value(index, self.secret)
    }
}

/// Applies the duplicate/replace narrowing rule.
fn narrow_rights(source: Rights, rights_word: u32) -> Result<Rights, KernelError> {
    if rights_word == SAME_RIGHTS {
        return Ok(source);
    }
    let requested = Rights::from_bits(rights_word)
        .ok_or_else(KernelError::invalid_combination)?;
    if !source.contains(requested) {
        // Rights monotonicity: never mint a capability stronger than its
        // source.
        return Err(KernelError::invalid_combination())
    }
    Ok(requested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::EventDispatcher;

    fn table() -> ProcessHandleTable {
        ProcessHandleTable::new(crate::objects::new_koid())
    }

    fn event_handle(rights: Rights) -> OwnedHandle {
        let dispatcher: Arc<dyn Dispatcher> = EventDispatcher::new();
        arena::alloc_handle(dispatcher, rights).unwrap()
    }

    #[test]
    fn add_lookup_close() {
        let table = table();
        let value = table.add_handle(event_handle(Rights::default_rw()));
        assert_ne!(value, 0);
        assert_eq!(value & 1, 1);

        let dispatcher = table.lookup(value, Rights::READ).unwrap();
        assert_eq!(dispatcher.base().handle_count(), 1);

        table.close_handle(value).unwrap();
        assert!(matches!(
            table.lookup(value, Rights::empty()),
            Err(KernelError::BadHandle { .. })
        ));
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn lookup_checks_rights() {
        let table = table();
        let value = table.add_handle(event_handle(Rights::READ));
        assert!(matches!(
            table.lookup(value, Rights::WRITE),
            Err(KernelError::AccessDenied { .. })
        ));
    }

    #[test]
    fn foreign_value_is_bad_handle() {
        let table_a = table();
        let table_b = table();
        let value = table_a.add_handle(event_handle(Rights::default_rw()));
        // Same bits presented to another table decode under a different
        // secret and miss.
        assert!(table_b.lookup(value, Rights::empty()).is_err());
    }

    #[test]
    fn duplicate_narrows_never_widens() {
        let table = table();
        let rights = Rights::DUPLICATE | Rights::READ | Rights::WRITE;
        let value = table.add_handle(event_handle(rights));

        let narrowed = table
            .duplicate(value, (Rights::DUPLICATE | Rights::READ).bits())
            .unwrap();
        let (_, dup_rights) = table.lookup_with_rights(narrowed, Rights::empty()).unwrap();
        assert_eq!(dup_rights, Rights::DUPLICATE | Rights::READ);

        // Superset request fails and changes nothing.
        let before = table.count();
        assert!(table.duplicate(value, (rights | Rights::MAP).bits()).is_err());
        assert_eq!(table.count(), before);

        // SAME_RIGHTS copies.
        let copied = table.duplicate(value, SAME_RIGHTS).unwrap();
        let (_, same_rights) = table.lookup_with_rights(copied, Rights::empty()).unwrap();
        assert_eq!(same_rights, rights);
    }

    #[test]
    fn duplicate_requires_duplicate_right() {
        let table = table();
        let value = table.add_handle(event_handle(Rights::READ));
        assert!(matches!(
            table.duplicate(value, SAME_RIGHTS),
            Err(KernelError::AccessDenied { .. })
        ));
    }

    #[test]
    fn replace_kills_old_value() {
        let table = table();
        let rights = Rights::DUPLICATE | Rights::READ | Rights::WRITE;
        let value = table.add_handle(event_handle(rights));

        let new_value = table.replace(value, Rights::READ.bits()).unwrap();
        assert_ne!(new_value, value);
        assert!(table.lookup(value, Rights::empty()).is_err());
        let (_, new_rights) = table.lookup_with_rights(new_value, Rights::empty()).unwrap();
        assert_eq!(new_rights, Rights::READ);
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn replace_widening_leaves_table_unchanged() {
        let table = table();
        let value = table.add_handle(event_handle(Rights::READ));
        assert!(table.replace(value, (Rights::READ | Rights::WRITE).bits()).is_err());
        // The original survives a failed replace.
        assert!(table.lookup(value, Rights::READ).is_ok());
    }

    #[test]
    fn value_uniqueness() {
        let table = table();
        let mut values = alloc::vec::Vec::new();
        for _ in 0..64 {
            values.push(table.add_handle(event_handle(Rights::default_rw())));
        }
        let mut deduped = values.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), values.len());
        for value in values {
            table.close_handle(value).unwrap();
        }
    }

    #[test]
    fn drain_destroys_everything() {
        let table = table();
        let dispatcher: Arc<dyn Dispatcher> = EventDispatcher::new();
        let v1 = table.add_handle(arena::alloc_handle(dispatcher.clone(), Rights::default_rw()).unwrap());
        let _v2 = table.add_handle(arena::alloc_handle(dispatcher.clone(), Rights::default_rw()).unwrap());
        assert_eq!(dispatcher.base().handle_count(), 2);

        for handle in table.drain() {
            drop(handle);
        }
        assert_eq!(dispatcher.base().handle_count(), 0);
        assert_eq!(table.count(), 0);
        assert!(table.lookup(v1, Rights::empty()).is_err());
    }
}
