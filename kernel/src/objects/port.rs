//! Io ports: bounded packet FIFOs with signal bindings.
//!
//! A port queues fixed-size-capped packets; `port_wait` blocks until one
//! arrives. Binding an [IoPortClient] to a source dispatcher's tracker
//! turns signal edges into automatically queued packets, which is how an
//! event loop multiplexes many objects over one blocking point.
//!
//! Lock note: a client's `on_state_change` runs under the source's
//! tracker lock and takes the port's queue lock. The port never touches
//! a tracker while holding its queue lock, so that nesting is one-way.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use alloc::collections::VecDeque;
use core::any::Any;
use core::sync::atomic::{AtomicBool, Ordering};

use borealis_libkern::object::packet_type;
use borealis_libkern::wire::{self, PacketSignal};
use borealis_libkern::{ObjectType, Signals, SignalsState, MAX_PORT_PACKET_PAYLOAD};

use crate::config::PORT_QUEUE_DEPTH;
use crate::error::KernelError;
use crate::event::{ObserverAction, StateObserver, WaitEvent, WaitResult};
use crate::objects::{Dispatcher, KObjectBase, StaticObjectType};
use crate::sync::SpinLock;
use crate::timer;

/// A packet in a port's FIFO.
#[derive(Debug, Clone)]
pub struct IoPacket {
    /// Binding or user key.
    pub key: u64,
    /// One of [packet_type].
    pub ptype: u32,
    /// Per-type payload, at most [MAX_PORT_PACKET_PAYLOAD] bytes.
    pub payload: Vec<u8>,
}

/// Mutable half of a port.
struct PortInner {
    /// Queued packets, oldest first.
    queue: VecDeque<IoPacket>,
    /// Parked `port_wait` callers, oldest first. One is woken per queued
    /// packet and retries the dequeue.
    waiters: VecDeque<Arc<WaitEvent>>,
}

/// An io port.
pub struct IoPortDispatcher {
    /// Base; ports are drained through `port_wait`, not waited on.
    base: KObjectBase,
    /// Guarded queue + waiters.
    inner: SpinLock<PortInner>,
}

impl core::fmt::Debug for IoPortDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "IoPortDispatcher {{ koid: {} }}", self.base.koid())
    }
}

impl IoPortDispatcher {
    /// Creates an empty port.
    pub fn new() -> Arc<IoPortDispatcher> {
        Arc::new(IoPortDispatcher {
            base: KObjectBase::new(),
            inner: SpinLock::new(PortInner {
                queue: VecDeque::new(),
                waiters: VecDeque::new(),
            }),
        })
    }

    /// Appends a packet, waking one parked waiter.
    ///
    /// Oversize payloads are rejected; a full queue reports ShouldWait.
    pub fn queue(&self, packet: IoPacket) -> Result<(), KernelError> {
        if packet.payload.len() > MAX_PORT_PACKET_PAYLOAD {
            return Err(KernelError::invalid_size(packet.payload.len()));
        }
        let woken = {
            let mut inner = self.inner.lock();
            if inner.queue.len() >= PORT_QUEUE_DEPTH {
                return Err(KernelError::should_wait());
            }
            inner.queue.push_back(packet);
            inner.waiters.pop_front()
        };
        if let Some(waiter) = woken {
            waiter.signal(WaitResult::Satisfied, 0);
        }
        Ok(())
    }

    /// Dequeues the oldest packet, blocking up to `timeout_ns`.
    pub fn wait(&self, timeout_ns: u64) -> Result<IoPacket, KernelError> {
        // One absolute deadline for the whole call: a re-park after a
        // stolen wake runs against the remainder, not a fresh timeout.
        let deadline = timer::deadline_after(timeout_ns);
        loop {
            let event = {
                let mut inner = self.inner.lock();
                if let Some(packet) = inner.queue.pop_front() {
                    return Ok(packet);
                }
                if timeout_ns == 0 {
                    return Err(KernelError::timed_out());
                }
                let event = WaitEvent::new();
                inner.waiters.push_back(event.clone());
                event
            };
            let (result, _) = event.wait_until(deadline);
            match result {
                // Retry; the packet may already be gone to a faster
                // waiter, in which case we park again.
                WaitResult::Satisfied => continue,
                WaitResult::TimedOut => {
                    self.forget_waiter(&event);
                    return Err(KernelError::timed_out());
                }
                WaitResult::Cancelled => {
                    self.forget_waiter(&event);
                    return Err(KernelError::cancelled());
                }
                WaitResult::Interrupted => {
                    self.forget_waiter(&event);
                    return Err(KernelError::interrupted());
                }
            }
        }
    }

    /// Drops a no-longer-waiting event from the waiter list, passing its
    /// wake on to the next waiter if one raced in.
    fn forget_waiter(&self, event: &Arc<WaitEvent>) {
        let stolen_wake = {
            let mut inner = self.inner.lock();
            let before = inner.waiters.len();
            inner.waiters.retain(|w| !Arc::ptr_eq(w, event));
            // If the event is gone from the list, a queue() already woke
            // it; that wake must not be lost.
            before == inner.waiters.len() && !inner.queue.is_empty()
        };
        if stolen_wake {
            let next = self.inner.lock().waiters.pop_front();
            if let Some(next) = next {
                next.signal(WaitResult::Satisfied, 0);
            }
        }
    }

    /// Packets currently queued.
    pub fn depth(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

impl Dispatcher for IoPortDispatcher {
    fn base(&self) -> &KObjectBase {
        &self.base
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::IO_PORT
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl StaticObjectType for IoPortDispatcher {
    fn static_object_type() -> ObjectType {
        ObjectType::IO_PORT
    }
}

/// A signal binding: observer attached to a source dispatcher's tracker
/// that queues a SIGNAL packet on every satisfying edge.
pub struct IoPortClient {
    /// The port packets go to. Weak: a dead port just ends the binding.
    port: Weak<IoPortDispatcher>,
    /// Key stamped on every queued packet.
    key: u64,
    /// Signals the binding watches.
    watched: Signals,
    /// Arena index of the source handle the binding was made through;
    /// closing that handle severs the binding.
    source_handle_index: u32,
    /// Set once the binding is severed. The slot in the source's base
    /// may still hold this client; a later bind treats a dead one as
    /// absent.
    dead: AtomicBool,
    /// Satisfied∩watched observed last time, for edge detection.
    last: SpinLock<Signals>,
}

impl core::fmt::Debug for IoPortClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "IoPortClient {{ key: {}, watched: {:?} }}",
            self.key, self.watched
        )
    }
}

impl IoPortClient {
    /// Creates a binding. The caller attaches it to the source tracker
    /// and parks it in the source's base.
    pub fn new(
        port: &Arc<IoPortDispatcher>,
        key: u64,
        watched: Signals,
        source_handle_index: u32,
    ) -> Arc<IoPortClient> {
        Arc::new(IoPortClient {
            port: Arc::downgrade(port),
            key,
            watched,
            source_handle_index,
            dead: AtomicBool::new(false),
            last: SpinLock::new(Signals::empty()),
        })
    }

    /// Whether the binding was severed by a handle close.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }
}

impl StateObserver for IoPortClient {
    fn on_state_change(&self, state: SignalsState) -> ObserverAction {
        let now = state.satisfied() & self.watched;
        let newly = now - core::mem::replace(&mut *self.last.lock(), now);
        if newly.is_empty() {
            return ObserverAction::Keep;
        }
        let port = match self.port.upgrade() {
            Some(port) => port,
            None => return ObserverAction::Detach,
        };
        let payload = PacketSignal {
            trigger: newly.bits(),
            observed: state.satisfied,
        };
        let packet = IoPacket {
            key: self.key,
            ptype: packet_type::SIGNAL,
            payload: wire::as_bytes(&payload).to_vec(),
        };
        if let Err(err) = port.queue(packet) {
            // A full port drops edges; the consumer is too far behind for
            // them to matter.
            warn!("dropping signal packet for key {}: {}", self.key, err);
        }
        ObserverAction::Keep
    }

    fn on_cancel(&self, handle_index: u32) -> ObserverAction {
        if handle_index == self.source_handle_index {
            self.dead.store(true, Ordering::Release);
            ObserverAction::Detach
        } else {
            ObserverAction::Keep
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::EventDispatcher;

    #[test]
    fn queue_then_wait() {
        let port = IoPortDispatcher::new();
        port.queue(IoPacket { key: 9, ptype: packet_type::USER, payload: alloc::vec![1, 2] })
            .unwrap();
        let packet = port.wait(0).unwrap();
        assert_eq!(packet.key, 9);
        assert_eq!(packet.payload, [1, 2]);
        assert!(matches!(port.wait(0), Err(KernelError::TimedOut { .. })));
    }

    #[test]
    fn oversize_packet_rejected() {
        let port = IoPortDispatcher::new();
        let packet = IoPacket {
            key: 0,
            ptype: packet_type::USER,
            payload: alloc::vec![0; MAX_PORT_PACKET_PAYLOAD + 1],
        };
        assert!(port.queue(packet).is_err());
    }

    #[test]
    fn cross_thread_wait_wakes() {
        let port = IoPortDispatcher::new();
        let port2 = port.clone();
        let producer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            port2
                .queue(IoPacket { key: 1, ptype: packet_type::USER, payload: Vec::new() })
                .unwrap();
        });
        let packet = port.wait(borealis_libkern::DEADLINE_INFINITE).unwrap();
        assert_eq!(packet.key, 1);
        producer.join().unwrap();
    }

    #[test]
    fn binding_turns_edges_into_packets() {
        let port = IoPortDispatcher::new();
        let source = EventDispatcher::new();
        let client = IoPortClient::new(&port, 0xfeed, Signals::SIGNALED, 77);
        source.state_tracker().unwrap().attach(client);

        // Rising edge queues exactly one packet; holding the level quiet.
        let tracker = source.state_tracker().unwrap();
        tracker.update_satisfied(Signals::empty(), Signals::SIGNALED);
        tracker.update_satisfied(Signals::empty(), Signals::SIGNALED);
        assert_eq!(port.depth(), 1);

        let packet = port.wait(0).unwrap();
        assert_eq!(packet.key, 0xfeed);
        assert_eq!(packet.ptype, packet_type::SIGNAL);
        let sig: PacketSignal = wire::read_from(&packet.payload).unwrap();
        assert_eq!(sig.trigger, Signals::SIGNALED.bits());

        // Falling then rising edge queues again.
        tracker.update_satisfied(Signals::SIGNALED, Signals::empty());
        tracker.update_satisfied(Signals::empty(), Signals::SIGNALED);
        assert_eq!(port.depth(), 1);
    }
}
