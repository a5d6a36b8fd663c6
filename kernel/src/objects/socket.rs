//! Sockets: bidirectional byte streams with an out-of-band lane.
//!
//! Both halves share one object holding a byte ring per direction plus a
//! small datagram queue per direction for out-of-band traffic. Stream
//! reads and writes are partial; OOB datagrams are all-or-nothing.

use alloc::sync::Arc;
use alloc::vec::Vec;
use alloc::collections::VecDeque;
use core::any::Any;
use core::sync::atomic::{AtomicU64, Ordering};

use borealis_libkern::{ObjectType, Signals};

use crate::config::{SOCKET_CAPACITY, SOCKET_OOB_DEPTH};
use crate::error::KernelError;
use crate::event::StateTracker;
use crate::objects::{Dispatcher, KObjectBase, StaticObjectType};
use crate::sync::SpinLock;

/// Mutable half of a socket pair.
struct SocketInner {
    /// `streams[i]` holds bytes written by side `i`, read by its peer.
    streams: [VecDeque<u8>; 2],
    /// `oob[i]` holds datagrams written by side `i`.
    oob: [VecDeque<Vec<u8>>; 2],
    /// Side `i` half-closed its write direction.
    shutdown: [bool; 2],
    /// Side `i` still has live handles.
    alive: [bool; 2],
}

/// State shared by both halves.
struct SocketShared {
    /// Guarded queues.
    inner: SpinLock<SocketInner>,
    /// One tracker per side; stored here so either side can update its
    /// peer's.
    trackers: [StateTracker; 2],
    /// Koids of the two end dispatchers.
    koids: [AtomicU64; 2],
}

impl SocketShared {
    /// Recomputes both sides' signal state from the queues. Runs under
    /// the inner lock; trackers are the innermost locks so that nesting
    /// is in order.
    fn update_signals(&self, inner: &SocketInner) {
        for side in 0..2 {
            let peer = 1 - side;
            let incoming = !inner.streams[peer].is_empty() || !inner.oob[peer].is_empty();
            let peer_feeding = inner.alive[peer] && !inner.shutdown[peer];
            let can_write =
                inner.alive[peer] && !inner.shutdown[side] && inner.streams[side].len() < SOCKET_CAPACITY;

            let mut satisfied = Signals::empty();
            let mut satisfiable = Signals::PEER_CLOSED;
            if incoming {
                satisfied |= Signals::READABLE;
            }
            if incoming || peer_feeding {
                satisfiable |= Signals::READABLE;
            }
            if can_write {
                satisfied |= Signals::WRITABLE;
            }
            if inner.alive[peer] && !inner.shutdown[side] {
                satisfiable |= Signals::WRITABLE;
            }
            if !inner.alive[peer] {
                satisfied |= Signals::PEER_CLOSED;
            }
            self.trackers[side].update_state(
                Signals::all(),
                satisfied,
                Signals::all(),
                satisfiable,
            );
        }
    }
}

/// One half of a socket.
pub struct SocketDispatcher {
    /// Base; the tracker lives in the shared object.
    base: KObjectBase,
    /// The shared pair state.
    shared: Arc<SocketShared>,
    /// Which side this half is.
    side: usize,
}

impl core::fmt::Debug for SocketDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "SocketDispatcher {{ koid: {}, side: {} }}",
            self.base.koid(),
            self.side
        )
    }
}

impl SocketDispatcher {
    /// Creates a joined pair of socket halves.
    pub fn new_pair() -> (Arc<SocketDispatcher>, Arc<SocketDispatcher>) {
        let initial_satisfied = Signals::WRITABLE;
        let initial_satisfiable = Signals::READABLE | Signals::WRITABLE | Signals::PEER_CLOSED;
        let shared = Arc::new(SocketShared {
            inner: SpinLock::new(SocketInner {
                streams: [VecDeque::new(), VecDeque::new()],
                oob: [VecDeque::new(), VecDeque::new()],
                shutdown: [false, false],
                alive: [true, true],
            }),
            trackers: [
                StateTracker::new(initial_satisfied, initial_satisfiable),
                StateTracker::new(initial_satisfied, initial_satisfiable),
            ],
            koids: [AtomicU64::new(0), AtomicU64::new(0)],
        });
        let end0 = Arc::new(SocketDispatcher {
            base: KObjectBase::new(),
            shared: shared.clone(),
            side: 0,
        });
        let end1 = Arc::new(SocketDispatcher {
            base: KObjectBase::new(),
            shared: shared.clone(),
            side: 1,
        });
        shared.koids[0].store(end0.base.koid(), Ordering::Relaxed);
        shared.koids[1].store(end1.base.koid(), Ordering::Relaxed);
        (end0, end1)
    }

    /// Writes stream bytes, partial if the ring is short on space.
    /// Returns the bytes accepted.
    pub fn write(&self, data: &[u8]) -> Result<usize, KernelError> {
        let mut inner = self.shared.inner.lock();
        let peer = 1 - self.side;
        if !inner.alive[peer] {
            return Err(KernelError::channel_closed());
        }
        if inner.shutdown[self.side] {
            return Err(KernelError::bad_state());
        }
        let space = SOCKET_CAPACITY - inner.streams[self.side].len();
        let accepted = space.min(data.len());
        if accepted == 0 && !data.is_empty() {
            return Err(KernelError::should_wait());
        }
        inner.streams[self.side].extend(&data[..accepted]);
        self.shared.update_signals(&inner);
        Ok(accepted)
    }

    /// Queues an out-of-band datagram, all-or-nothing.
    pub fn write_oob(&self, data: &[u8]) -> Result<(), KernelError> {
        let mut inner = self.shared.inner.lock();
        let peer = 1 - self.side;
        if !inner.alive[peer] {
            return Err(KernelError::channel_closed());
        }
        if inner.shutdown[self.side] {
            return Err(KernelError::bad_state());
        }
        if inner.oob[self.side].len() >= SOCKET_OOB_DEPTH {
            return Err(KernelError::should_wait());
        }
        inner.oob[self.side].push_back(data.to_vec());
        self.shared.update_signals(&inner);
        Ok(())
    }

    /// Reads stream bytes. Returns the bytes copied; an empty stream
    /// whose peer can still write reports ShouldWait, a dead one
    /// ChannelClosed.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut inner = self.shared.inner.lock();
        let peer = 1 - self.side;
        if inner.streams[peer].is_empty() {
            if !inner.alive[peer] || inner.shutdown[peer] {
                return Err(KernelError::channel_closed());
            }
            return Err(KernelError::should_wait());
        }
        let n = buf.len().min(inner.streams[peer].len());
        for slot in buf[..n].iter_mut() {
            *slot = inner.streams[peer].pop_front().expect("length checked above");
        }
        self.shared.update_signals(&inner);
        Ok(n)
    }

    /// Dequeues one out-of-band datagram into `buf`.
    pub fn read_oob(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut inner = self.shared.inner.lock();
        let peer = 1 - self.side;
        let needed = match inner.oob[peer].front() {
            Some(datagram) => datagram.len(),
            None if !inner.alive[peer] || inner.shutdown[peer] => {
                return Err(KernelError::channel_closed())
            }
            None => return Err(KernelError::should_wait()),
        };
        if buf.len() < needed {
            return Err(KernelError::buffer_too_small(needed));
        }
        let datagram = inner.oob[peer].pop_front().expect("peeked above");
        buf[..needed].copy_from_slice(&datagram);
        self.shared.update_signals(&inner);
        Ok(needed)
    }

    /// Half-closes this side's write direction. The peer drains what is
    /// left, then reads ChannelClosed.
    pub fn shutdown(&self) {
        let mut inner = self.shared.inner.lock();
        inner.shutdown[self.side] = true;
        self.shared.update_signals(&inner);
    }
}

impl Dispatcher for SocketDispatcher {
    fn base(&self) -> &KObjectBase {
        &self.base
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::SOCKET
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn state_tracker(&self) -> Option<&StateTracker> {
        Some(&self.shared.trackers[self.side])
    }

    fn related_koid(&self) -> u64 {
        self.shared.koids[1 - self.side].load(Ordering::Relaxed)
    }

    fn on_zero_handles(&self) {
        let mut inner = self.shared.inner.lock();
        inner.alive[self.side] = false;
        // Own unread OOB queue dies with us; stream data written by the
        // peer was already theirs to keep, data written by us stays
        // readable.
        inner.oob[1 - self.side].clear();
        self.shared.update_signals(&inner);
    }
}

impl StaticObjectType for SocketDispatcher {
    fn static_object_type() -> ObjectType {
        ObjectType::SOCKET
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_roundtrip() {
        let (a, b) = SocketDispatcher::new_pair();
        assert_eq!(a.write(b"hello").unwrap(), 5);

        let tracker = b.state_tracker().unwrap();
        assert!(tracker.state().satisfied().contains(Signals::READABLE));

        let mut buf = [0u8; 3];
        assert_eq!(b.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        assert!(matches!(b.read(&mut buf), Err(KernelError::ShouldWait { .. })));
        assert!(!tracker.state().satisfied().contains(Signals::READABLE));
    }

    #[test]
    fn oob_is_datagram_oriented() {
        let (a, b) = SocketDispatcher::new_pair();
        a.write_oob(b"urgent").unwrap();
        a.write_oob(b"more").unwrap();

        let mut small = [0u8; 2];
        assert!(matches!(
            b.read_oob(&mut small),
            Err(KernelError::BufferTooSmall { needed: 6, .. })
        ));
        let mut buf = [0u8; 16];
        assert_eq!(b.read_oob(&mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"urgent");
        assert_eq!(b.read_oob(&mut buf).unwrap(), 4);
    }

    #[test]
    fn close_propagates() {
        let (a, b) = SocketDispatcher::new_pair();
        a.write(b"tail").unwrap();
        a.on_zero_handles();

        let tracker = b.state_tracker().unwrap();
        assert!(tracker.state().satisfied().contains(Signals::PEER_CLOSED));
        assert!(!tracker.state().satisfiable().contains(Signals::WRITABLE));
        // Residual data still drains.
        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).unwrap(), 4);
        assert!(matches!(b.read(&mut buf), Err(KernelError::ChannelClosed { .. })));
        assert!(matches!(b.write(b"x"), Err(KernelError::ChannelClosed { .. })));
    }

    #[test]
    fn shutdown_half_closes() {
        let (a, b) = SocketDispatcher::new_pair();
        a.write(b"fin").unwrap();
        a.shutdown();
        assert!(matches!(a.write(b"late"), Err(KernelError::BadState { .. })));

        // Other direction still works.
        b.write(b"reply").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(a.read(&mut buf).unwrap(), 5);

        assert_eq!(b.read(&mut buf).unwrap(), 3);
        assert!(matches!(b.read(&mut buf), Err(KernelError::ChannelClosed { .. })));
    }

    #[test]
    fn backpressure_reports_should_wait() {
        let (a, _b) = SocketDispatcher::new_pair();
        let chunk = alloc::vec![0u8; SOCKET_CAPACITY];
        assert_eq!(a.write(&chunk).unwrap(), SOCKET_CAPACITY);
        assert!(matches!(a.write(b"x"), Err(KernelError::ShouldWait { .. })));
        assert!(!a
            .state_tracker()
            .unwrap()
            .state()
            .satisfied()
            .contains(Signals::WRITABLE));
    }
}
