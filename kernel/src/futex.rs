//! Futexes: address-keyed wait queues for user synchronization.
//!
//! Each process owns a [FutexContext]: a lazily populated map from user
//! virtual address to a FIFO of parked waiters. Keys are plain addresses
//! in the owning process, so futexes are private to a process by
//! construction; there is no cross-process key.
//!
//! The compare-and-park reads the user word while holding the context
//! lock, and wakers take the same lock to pick their victims: a wake
//! that observes any parked waiter happened after that waiter's compare,
//! never between compare and park.

use alloc::sync::Arc;
use alloc::collections::VecDeque;

use hashbrown::HashMap;

use crate::error::KernelError;
use crate::event::{WaitEvent, WaitResult};
use crate::sync::SpinLock;
use crate::vmm::ProcessMemory;

/// One process's futexes.
pub struct FutexContext {
    /// Wait queues keyed by user address. A key exists only while
    /// waiters are parked on it.
    buckets: SpinLock<HashMap<usize, VecDeque<Arc<WaitEvent>>>>,
}

impl core::fmt::Debug for FutexContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "FutexContext {{ keys: {} }}", self.buckets.lock().len())
    }
}

impl FutexContext {
    /// Creates an empty context.
    pub fn new() -> FutexContext {
        FutexContext {
            buckets: SpinLock::new(HashMap::new()),
        }
    }

    /// Compare-and-park.
    ///
    /// Validates that `addr` is an aligned, mapped user word, compares
    /// it against `expected` under the context lock, and parks until a
    /// wake, the timeout, or teardown. A mismatching word reports
    /// AlreadyBound without parking.
    pub fn wait(
        &self,
        pmemory: &SpinLock<ProcessMemory>,
        addr: usize,
        expected: u32,
        timeout_ns: u64,
    ) -> Result<(), KernelError> {
        let event = {
            let mut buckets = self.buckets.lock();
            // Reading through the address space under the bucket lock is
            // what makes the compare atomic against wakers.
            let current = pmemory.lock().read_u32(addr)?;
            if current != expected {
                return Err(KernelError::already_bound());
            }
            let event = WaitEvent::new();
            buckets
                .entry(addr)
                .or_insert_with(VecDeque::new)
                .push_back(event.clone());
            event
        };

        let (result, _) = event.wait(timeout_ns);
        match result {
            WaitResult::Satisfied => Ok(()),
            WaitResult::TimedOut => {
                self.forget_waiter(addr, &event);
                Err(KernelError::timed_out())
            }
            WaitResult::Cancelled => {
                self.forget_waiter(addr, &event);
                Err(KernelError::cancelled())
            }
            WaitResult::Interrupted => {
                self.forget_waiter(addr, &event);
                Err(KernelError::interrupted())
            }
        }
    }

    /// Wakes up to `count` waiters parked on `addr`, oldest first.
    /// Returns how many were woken.
    pub fn wake(&self, addr: usize, count: usize) -> usize {
        let woken = {
            let mut buckets = self.buckets.lock();
            let mut woken = alloc::vec::Vec::new();
            if let Some(bucket) = buckets.get_mut(&addr) {
                while woken.len() < count {
                    match bucket.pop_front() {
                        Some(event) => woken.push(event),
                        None => break,
                    }
                }
                if bucket.is_empty() {
                    buckets.remove(&addr);
                }
            }
            woken
        };
        let n = woken.len();
        for event in woken {
            event.signal(WaitResult::Satisfied, 0);
        }
        n
    }

    /// Compare, wake up to `wake_count` waiters on `addr_wake`, and move
    /// up to `requeue_count` of the remainder onto `addr_requeue`'s
    /// queue.
    pub fn requeue(
        &self,
        pmemory: &SpinLock<ProcessMemory>,
        addr_wake: usize,
        wake_count: usize,
        expected: u32,
        addr_requeue: usize,
        requeue_count: usize,
    ) -> Result<usize, KernelError> {
        if addr_wake == addr_requeue {
            return Err(KernelError::invalid_combination());
        }
        let woken = {
            let mut buckets = self.buckets.lock();
            let current = pmemory.lock().read_u32(addr_wake)?;
            if current != expected {
                return Err(KernelError::already_bound());
            }
            let mut woken = alloc::vec::Vec::new();
            let mut moved = VecDeque::new();
            if let Some(bucket) = buckets.get_mut(&addr_wake) {
                while woken.len() < wake_count {
                    match bucket.pop_front() {
                        Some(event) => woken.push(event),
                        None => break,
                    }
                }
                while moved.len() < requeue_count {
                    match bucket.pop_front() {
                        Some(event) => moved.push_back(event),
                        None => break,
                    }
                }
                if bucket.is_empty() {
                    buckets.remove(&addr_wake);
                }
            }
            if !moved.is_empty() {
                buckets
                    .entry(addr_requeue)
                    .or_insert_with(VecDeque::new)
                    .append(&mut moved);
            }
            woken
        };
        let n = woken.len();
        for event in woken {
            event.signal(WaitResult::Satisfied, 0);
        }
        Ok(n)
    }

    /// Releases every parked waiter with a cancellation result. Process
    /// teardown.
    pub fn wake_all(&self) {
        let buckets = {
            let mut guard = self.buckets.lock();
            core::mem::replace(&mut *guard, HashMap::new())
        };
        for (_, bucket) in buckets {
            for event in bucket {
                event.signal(WaitResult::Cancelled, 0);
            }
        }
    }

    /// Drops a waiter that stopped waiting on its own (timeout,
    /// interrupt) from whichever bucket currently holds it.
    ///
    /// `addr` is where the waiter parked, but a requeue may have moved
    /// it since; if it is not there, every bucket is scanned. Leaving a
    /// dead waiter behind would make a later wake spend its count on it.
    fn forget_waiter(&self, addr: usize, event: &Arc<WaitEvent>) {
        let mut buckets = self.buckets.lock();
        let mut found = false;
        if let Some(bucket) = buckets.get_mut(&addr) {
            let before = bucket.len();
            bucket.retain(|e| !Arc::ptr_eq(e, event));
            found = bucket.len() != before;
            if bucket.is_empty() {
                buckets.remove(&addr);
            }
        }
        if !found {
            for bucket in buckets.values_mut() {
                bucket.retain(|e| !Arc::ptr_eq(e, event));
            }
            buckets.retain(|_, bucket| !bucket.is_empty());
        }
    }

    /// Number of addresses with parked waiters.
    pub fn key_count(&self) -> usize {
        self.buckets.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use std::time::Duration;

    use borealis_libkern::object::MemoryPermissions;
    use borealis_libkern::DEADLINE_INFINITE;

    use crate::config::PAGE_SIZE;
    use crate::objects::VmObject;

    /// A process-memory with one RW page; returns its base address.
    fn memory_with_page() -> (Arc<SpinLock<ProcessMemory>>, usize) {
        let mut pmemory = ProcessMemory::new();
        let vmo = VmObject::new(PAGE_SIZE).unwrap();
        let addr = pmemory
            .map_vmo(vmo, 0, PAGE_SIZE, MemoryPermissions::READ | MemoryPermissions::WRITE, 0)
            .unwrap()
            .addr();
        (Arc::new(SpinLock::new(pmemory)), addr)
    }

    #[test]
    fn mismatched_compare_does_not_park() {
        let (pmemory, addr) = memory_with_page();
        let ctx = FutexContext::new();
        pmemory.lock().write_u32(addr, 8).unwrap();
        assert!(matches!(
            ctx.wait(&pmemory, addr, 7, DEADLINE_INFINITE),
            Err(KernelError::AlreadyBound { .. })
        ));
        assert_eq!(ctx.key_count(), 0);
    }

    #[test]
    fn misaligned_or_unmapped_address_rejected() {
        let (pmemory, addr) = memory_with_page();
        let ctx = FutexContext::new();
        assert!(ctx.wait(&pmemory, addr + 2, 0, 0).is_err());
        assert!(ctx.wait(&pmemory, addr + PAGE_SIZE, 0, 0).is_err());
    }

    #[test]
    fn wait_times_out_and_leaves_no_key() {
        let (pmemory, addr) = memory_with_page();
        let ctx = FutexContext::new();
        assert!(matches!(
            ctx.wait(&pmemory, addr, 0, 2_000_000),
            Err(KernelError::TimedOut { .. })
        ));
        assert_eq!(ctx.key_count(), 0);
    }

    #[test]
    fn wake_releases_parked_waiter() {
        let (pmemory, addr) = memory_with_page();
        let ctx = Arc::new(FutexContext::new());

        let ctx2 = ctx.clone();
        let pmemory2 = pmemory.clone();
        let waiter = std::thread::spawn(move || {
            ctx2.wait(&pmemory2, addr, 7, DEADLINE_INFINITE)
        });

        pmemory.lock().write_u32(addr, 7).unwrap();
        // Wait until the waiter is actually parked.
        while ctx.key_count() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        pmemory.lock().write_u32(addr, 8).unwrap();
        assert_eq!(ctx.wake(addr, 1), 1);
        waiter.join().unwrap().unwrap();
        assert_eq!(ctx.key_count(), 0);
    }

    #[test]
    fn wake_respects_count_and_fifo() {
        let (pmemory, addr) = memory_with_page();
        let ctx = Arc::new(FutexContext::new());
        pmemory.lock().write_u32(addr, 1).unwrap();

        let spawn_waiter = || {
            let ctx = ctx.clone();
            let pmemory = pmemory.clone();
            std::thread::spawn(move || ctx.wait(&pmemory, addr, 1, DEADLINE_INFINITE))
        };
        let w1 = spawn_waiter();
        let w2 = spawn_waiter();
        let w3 = spawn_waiter();

        let parked = |n: usize| {
            loop {
                let count = ctx
                    .buckets
                    .lock()
                    .get(&addr)
                    .map_or(0, |bucket| bucket.len());
                if count == n {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        };
        parked(3);

        assert_eq!(ctx.wake(addr, 2), 2);
        parked(1);
        assert_eq!(ctx.wake(addr, 8), 1);
        w1.join().unwrap().unwrap();
        w2.join().unwrap().unwrap();
        w3.join().unwrap().unwrap();
    }

    #[test]
    fn requeue_moves_waiters() {
        let (pmemory, addr_a) = memory_with_page();
        let addr_b = addr_a + 64;
        let ctx = Arc::new(FutexContext::new());
        pmemory.lock().write_u32(addr_a, 5).unwrap();

        let mut waiters = alloc::vec::Vec::new();
        for _ in 0..3 {
            let ctx = ctx.clone();
            let pmemory = pmemory.clone();
            waiters.push(std::thread::spawn(move || {
                ctx.wait(&pmemory, addr_a, 5, DEADLINE_INFINITE)
            }));
        }
        loop {
            let count = ctx.buckets.lock().get(&addr_a).map_or(0, |b| b.len());
            if count == 3 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        // Same-address requeue is malformed.
        assert!(ctx
            .requeue(&pmemory, addr_a, 1, 5, addr_a, 1)
            .is_err());
        // Stale compare fails.
        assert!(matches!(
            ctx.requeue(&pmemory, addr_a, 1, 6, addr_b, 1),
            Err(KernelError::AlreadyBound { .. })
        ));

        // Wake one, move one, leave one.
        assert_eq!(ctx.requeue(&pmemory, addr_a, 1, 5, addr_b, 1).unwrap(), 1);
        {
            let buckets = ctx.buckets.lock();
            assert_eq!(buckets.get(&addr_a).map_or(0, |b| b.len()), 1);
            assert_eq!(buckets.get(&addr_b).map_or(0, |b| b.len()), 1);
        }

        // Release everybody.
        ctx.wake(addr_a, usize::max_value());
        ctx.wake(addr_b, usize::max_value());
        for waiter in waiters {
            waiter.join().unwrap().unwrap();
        }
    }

    #[test]
    fn requeued_waiter_timeout_leaves_no_key() {
        let (pmemory, addr_a) = memory_with_page();
        let addr_b = addr_a + 32;
        let ctx = Arc::new(FutexContext::new());
        pmemory.lock().write_u32(addr_a, 1).unwrap();

        let ctx2 = ctx.clone();
        let pmemory2 = pmemory.clone();
        let waiter = std::thread::spawn(move || {
            ctx2.wait(&pmemory2, addr_a, 1, 50_000_000)
        });
        while ctx.key_count() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        // Move the parked waiter to addr_b, then let it time out there.
        assert_eq!(ctx.requeue(&pmemory, addr_a, 0, 1, addr_b, 1).unwrap(), 0);
        assert!(matches!(
            waiter.join().unwrap(),
            Err(KernelError::TimedOut { .. })
        ));
        // The timeout cleanup found it in the bucket it was moved to.
        assert_eq!(ctx.key_count(), 0);
    }

    #[test]
    fn wake_all_cancels() {
        let (pmemory, addr) = memory_with_page();
        let ctx = Arc::new(FutexContext::new());
        let ctx2 = ctx.clone();
        let pmemory2 = pmemory.clone();
        let waiter = std::thread::spawn(move || {
            ctx2.wait(&pmemory2, addr, 0, DEADLINE_INFINITE)
        });
        while ctx.key_count() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        ctx.wake_all();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(KernelError::Cancelled { .. })
        ));
    }
}
