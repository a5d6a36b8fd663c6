//! Message pipes: bidirectional datagram channels with handle transfer.
//!
//! Two end dispatchers share one pipe object holding a FIFO of
//! [MessagePacket]s per direction. A packet owns its payload and the
//! handles riding in it; destroying an unread packet destroys those
//! handles, which is how capability leaks on close are prevented.
//!
//! Reading is two-phase: `begin_read` reports the head message's sizes
//! without consuming, `accept_read` dequeues it. The serial returned by
//! `begin_read` pins the head: of two racing readers, the one whose
//! serial went stale observes BAD_STATE.

use alloc::sync::Arc;
use alloc::vec::Vec;
use alloc::collections::VecDeque;
use core::any::Any;
use core::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use borealis_libkern::{ObjectType, Signals};

use crate::config::MSGPIPE_QUEUE_DEPTH;
use crate::error::KernelError;
use crate::event::StateTracker;
use crate::handle::OwnedHandle;
use crate::objects::{Dispatcher, KObjectBase, StaticObjectType};
use crate::sync::SpinLock;

/// Handle array of a message. Most messages carry no or few handles;
/// the inline capacity keeps those off the heap.
pub type HandleList = SmallVec<[OwnedHandle; 4]>;

/// One message in flight.
pub struct MessagePacket {
    /// Payload bytes.
    pub data: Vec<u8>,
    /// Handles in transit. Their arena slots carry owner 0 until the
    /// reader re-attaches them.
    pub handles: HandleList,
}

impl core::fmt::Debug for MessagePacket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "MessagePacket {{ data: {} bytes, handles: {} }}",
            self.data.len(),
            self.handles.len()
        )
    }
}

/// Mutable half of a pipe.
struct PipeInner {
    /// `queues[i]` holds messages readable by side `i`.
    queues: [VecDeque<MessagePacket>; 2],
    /// Dequeue counter per side; `begin_read` hands it out, a stale one
    /// fails `accept_read`.
    read_serial: [u64; 2],
    /// Side `i` still has live handles.
    alive: [bool; 2],
}

/// State shared by both ends.
struct PipeShared {
    /// Guarded queues.
    inner: SpinLock<PipeInner>,
    /// One tracker per side.
    trackers: [StateTracker; 2],
    /// Koids of the end dispatchers.
    koids: [AtomicU64; 2],
    /// Whether the pair was created in reply-pipe mode.
    reply_pipe: bool,
}

impl PipeShared {
    /// Recomputes both trackers from the queues, under the inner lock.
    fn update_signals(&self, inner: &PipeInner) {
        for side in 0..2 {
            let peer = 1 - side;
            let pending = !inner.queues[side].is_empty();

            let mut satisfied = Signals::empty();
            let mut satisfiable = Signals::PEER_CLOSED;
            if pending {
                satisfied |= Signals::READABLE;
            }
            if pending || inner.alive[peer] {
                satisfiable |= Signals::READABLE;
            }
            if inner.alive[peer] {
                satisfiable |= Signals::WRITABLE;
                if inner.queues[peer].len() < MSGPIPE_QUEUE_DEPTH {
                    satisfied |= Signals::WRITABLE;
                }
            } else {
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

/// One end of a message pipe.
pub struct MessagePipeEnd {
    /// Base; the tracker lives in the shared object.
    base: KObjectBase,
    /// The shared pipe.
    shared: Arc<PipeShared>,
    /// Which side this end is.
    side: usize,
}

impl core::fmt::Debug for MessagePipeEnd {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "MessagePipeEnd {{ koid: {}, side: {} }}",
            self.base.koid(),
            self.side
        )
    }
}

impl MessagePipeEnd {
    /// Creates a joined pair of ends.
    pub fn new_pair(reply_pipe: bool) -> (Arc<MessagePipeEnd>, Arc<MessagePipeEnd>) {
        let initial_satisfied = Signals::WRITABLE;
        let initial_satisfiable = Signals::READABLE | Signals::WRITABLE | Signals::PEER_CLOSED;
        let shared = Arc::new(PipeShared {
            inner: SpinLock::new(PipeInner {
                queues: [VecDeque::new(), VecDeque::new()],
                read_serial: [0, 0],
                alive: [true, true],
            }),
            trackers: [
                StateTracker::new(initial_satisfied, initial_satisfiable),
                StateTracker::new(initial_satisfied, initial_satisfiable),
            ],
            koids: [AtomicU64::new(0), AtomicU64::new(0)],
            reply_pipe,
        });
        let end0 = Arc::new(MessagePipeEnd {
            base: KObjectBase::new(),
            shared: shared.clone(),
            side: 0,
        });
        let end1 = Arc::new(MessagePipeEnd {
            base: KObjectBase::new(),
            shared: shared.clone(),
            side: 1,
        });
        shared.koids[0].store(end0.base.koid(), Ordering::Relaxed);
        shared.koids[1].store(end1.base.koid(), Ordering::Relaxed);
        (end0, end1)
    }

    /// Whether the pair was created in reply-pipe mode.
    pub fn is_reply_pipe(&self) -> bool {
        self.shared.reply_pipe
    }

    /// Koid of the other end.
    pub fn peer_koid(&self) -> u64 {
        self.shared.koids[1 - self.side].load(Ordering::Relaxed)
    }

    /// Queues `packet` towards the other end.
    ///
    /// The packet must already own its handles; on a dead peer the
    /// packet is handed back so the caller can undo the transfer.
    pub fn write(&self, packet: MessagePacket) -> Result<(), (KernelError, MessagePacket)> {
        let mut inner = self.shared.inner.lock();
        let peer = 1 - self.side;
        if !inner.alive[peer] {
            return Err((KernelError::channel_closed(), packet));
        }
        if inner.queues[peer].len() >= MSGPIPE_QUEUE_DEPTH {
            return Err((KernelError::should_wait(), packet));
        }
        inner.queues[peer].push_back(packet);
        self.shared.update_signals(&inner);
        Ok(())
    }

    /// Reports the head message's `(data_len, handle_count)` plus the
    /// serial to pass to [accept_read](Self::accept_read), without
    /// consuming anything.
    pub fn begin_read(&self) -> Result<(usize, usize, u64), KernelError> {
        let inner = self.shared.inner.lock();
        match inner.queues[self.side].front() {
            Some(packet) => Ok((
                packet.data.len(),
                packet.handles.len(),
                inner.read_serial[self.side],
            )),
            None if !inner.alive[1 - self.side] => Err(KernelError::channel_closed()),
            // An empty queue is a state error, not backpressure: the
            // caller is expected to wait on READABLE, not to spin here.
            None => Err(KernelError::bad_state()),
        }
    }

    /// Dequeues the message pinned by `serial`.
    ///
    /// BAD_STATE when another reader got there first (the serial went
    /// stale) or nothing is queued.
    pub fn accept_read(&self, serial: u64) -> Result<MessagePacket, KernelError> {
        let mut inner = self.shared.inner.lock();
        if inner.read_serial[self.side] != serial {
            return Err(KernelError::bad_state());
        }
        let packet = inner.queues[self.side]
            .pop_front()
            .ok_or_else(KernelError::bad_state)?;
        inner.read_serial[self.side] += 1;
        self.shared.update_signals(&inner);
        Ok(packet)
    }

    /// Messages currently queued towards this end.
    pub fn pending(&self) -> usize {
        self.shared.inner.lock().queues[self.side].len()
    }
}

impl Dispatcher for MessagePipeEnd {
    fn base(&self) -> &KObjectBase {
        &self.base
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::MESSAGE_PIPE
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn state_tracker(&self) -> Option<&StateTracker> {
        Some(&self.shared.trackers[self.side])
    }

    fn related_koid(&self) -> u64 {
        self.peer_koid()
    }

    fn on_zero_handles(&self) {
        let unread = {
            let mut inner = self.shared.inner.lock();
            inner.alive[self.side] = false;
            let unread = core::mem::replace(&mut inner.queues[self.side], VecDeque::new());
            self.shared.update_signals(&inner);
            unread
        };
        // Destroying unread packets destroys their handles, which can
        // close further objects (even this pipe's own peer); that must
        // run without the pipe lock held.
        drop(unread);
    }
}

impl StaticObjectType for MessagePipeEnd {
    fn static_object_type() -> ObjectType {
        ObjectType::MESSAGE_PIPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(data: &[u8]) -> MessagePacket {
        MessagePacket {
            data: data.to_vec(),
            handles: HandleList::new(),
        }
    }

    #[test]
    fn write_read_in_order() {
        let (end0, end1) = MessagePipeEnd::new_pair(false);
        end0.write(packet(b"one")).map_err(|(e, _)| e).unwrap();
        end0.write(packet(b"two")).map_err(|(e, _)| e).unwrap();

        let (len, handles, serial) = end1.begin_read().unwrap();
        assert_eq!((len, handles), (3, 0));
        let msg = end1.accept_read(serial).unwrap();
        assert_eq!(msg.data, b"one");
        let (_, _, serial) = end1.begin_read().unwrap();
        assert_eq!(end1.accept_read(serial).unwrap().data, b"two");
        assert!(matches!(end1.begin_read(), Err(KernelError::BadState { .. })));
    }

    #[test]
    fn stale_serial_is_bad_state() {
        let (end0, end1) = MessagePipeEnd::new_pair(false);
        end0.write(packet(b"a")).map_err(|(e, _)| e).unwrap();
        end0.write(packet(b"b")).map_err(|(e, _)| e).unwrap();

        let (_, _, serial_x) = end1.begin_read().unwrap();
        let (_, _, serial_y) = end1.begin_read().unwrap();
        assert_eq!(serial_x, serial_y);

        // First acceptor wins.
        end1.accept_read(serial_x).unwrap();
        // The second one raced and lost, even though a message is queued.
        assert!(matches!(end1.accept_read(serial_y), Err(KernelError::BadState { .. })));
    }

    #[test]
    fn close_sets_peer_closed_and_keeps_queue_readable() {
        let (end0, end1) = MessagePipeEnd::new_pair(false);
        end0.write(packet(b"parting")).map_err(|(e, _)| e).unwrap();
        end0.on_zero_handles();

        let tracker = end1.state_tracker().unwrap();
        let state = tracker.state();
        assert!(state.satisfied().contains(Signals::PEER_CLOSED));
        assert!(!state.satisfiable().contains(Signals::WRITABLE));
        assert!(state.satisfied().contains(Signals::READABLE));

        // The queued message is still there.
        let (_, _, serial) = end1.begin_read().unwrap();
        assert_eq!(end1.accept_read(serial).unwrap().data, b"parting");
        // Drained and the peer is gone: READABLE can never come back.
        assert!(!tracker.state().satisfiable().contains(Signals::READABLE));
        assert!(matches!(end1.begin_read(), Err(KernelError::ChannelClosed { .. })));

        // Writing towards the dead end fails.
        assert!(matches!(
            end1.write(packet(b"x")),
            Err((KernelError::ChannelClosed { .. }, _))
        ));
    }

    #[test]
    fn reply_pipe_flag_sticks() {
        let (end0, _end1) = MessagePipeEnd::new_pair(true);
        assert!(end0.is_reply_pipe());
        let (end0, _end1) = MessagePipeEnd::new_pair(false);
        assert!(!end0.is_reply_pipe());
    }

    #[test]
    fn peer_koids_cross_reference() {
        let (end0, end1) = MessagePipeEnd::new_pair(false);
        assert_eq!(end0.peer_koid(), end1.base().koid());
        assert_eq!(end1.peer_koid(), end0.base().koid());
    }
}
