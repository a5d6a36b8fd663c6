//! The kernel log object.
//!
//! All log objects share one global ring of records. Writers append;
//! each readable log handle carries its own cursor into the stream and
//! raises READABLE while records remain ahead of it. Old records fall
//! off the ring; a slow reader skips forward, it does not stall writers.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use alloc::collections::VecDeque;
use core::any::Any;

use borealis_libkern::wire::{self, LogRecordHeader};
use borealis_libkern::{ObjectType, Signals, MAX_LOG_RECORD_PAYLOAD};
use borealis_libutils::CursorWrite;

use crate::config::LOG_RING_DEPTH;
use crate::error::KernelError;
use crate::objects::{Dispatcher, KObjectBase, StaticObjectType};
use crate::sync::SpinLock;
use crate::timer;

/// One record of the stream.
struct DlogRecord {
    /// Sequence number, monotonic over the whole stream.
    seq: u64,
    /// Nanoseconds since boot at write time.
    timestamp: u64,
    /// Writer process koid, 0 for the kernel.
    pid: u64,
    /// Writer thread koid, 0 for the kernel.
    tid: u64,
    /// Writer-supplied flags.
    flags: u32,
    /// Payload bytes.
    payload: Vec<u8>,
}

impl DlogRecord {
    /// Bytes this record occupies in a reader's buffer.
    fn wire_len(&self) -> usize {
        core::mem::size_of::<LogRecordHeader>() + self.payload.len()
    }
}

/// The shared ring.
struct DlogState {
    /// Retained records, oldest first.
    records: VecDeque<DlogRecord>,
    /// Next sequence number to assign.
    next_seq: u64,
    /// Every readable log dispatcher, to raise READABLE on append.
    readers: Vec<Weak<LogDispatcher>>,
}

lazy_static! {
    /// The global log ring.
    static ref DLOG: SpinLock<DlogState> = SpinLock::new(DlogState {
        records: VecDeque::new(),
        next_seq: 0,
        readers: Vec::new(),
    });
}

/// A log handle's kernel object.
pub struct LogDispatcher {
    /// Base with the tracker (READABLE only).
    base: KObjectBase,
    /// Whether this object was created readable.
    readable: bool,
    /// Next sequence this reader wants.
    cursor: SpinLock<u64>,
}

impl core::fmt::Debug for LogDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "LogDispatcher {{ koid: {}, readable: {} }}",
            self.base.koid(),
            self.readable
        )
    }
}

impl LogDispatcher {
    /// Creates a log object. Readable ones start their cursor at the
    /// oldest retained record and join the notification list.
    pub fn new(readable: bool) -> Arc<LogDispatcher> {
        let mut dlog = DLOG.lock();
        let cursor = dlog.records.front().map_or(dlog.next_seq, |r| r.seq);
        let satisfied = if readable && cursor < dlog.next_seq {
            Signals::READABLE
        } else {
            Signals::empty()
        };
        let log = Arc::new(LogDispatcher {
            base: KObjectBase::waitable(satisfied, Signals::READABLE),
            readable,
            cursor: SpinLock::new(cursor),
        });
        if readable {
            dlog.readers.push(Arc::downgrade(&log));
        }
        log
    }

    /// Appends a record to the shared ring on behalf of `(pid, tid)`.
    pub fn write(&self, flags: u32, payload: &[u8], pid: u64, tid: u64) -> Result<(), KernelError> {
        if payload.len() > MAX_LOG_RECORD_PAYLOAD {
            return Err(KernelError::invalid_size(payload.len()));
        }
        let mut dlog = DLOG.lock();
        let seq = dlog.next_seq;
        dlog.next_seq += 1;
        dlog.records.push_back(DlogRecord {
            seq,
            timestamp: timer::current_time_ns(),
            pid,
            tid,
            flags,
            payload: payload.to_vec(),
        });
        while dlog.records.len() > LOG_RING_DEPTH {
            dlog.records.pop_front();
        }
        // Raise READABLE on everybody, dropping readers that went away.
        dlog.readers.retain(|weak| match weak.upgrade() {
            Some(reader) => {
                reader
                    .base
                    .tracker()
                    .expect("log objects always carry a tracker")
                    .update_satisfied(Signals::empty(), Signals::READABLE);
                true
            }
            None => false,
        });
        Ok(())
    }

    /// Copies the next unread record into `buf` as a wire record
    /// (header + payload). Returns the bytes written.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        if !self.readable {
            return Err(KernelError::bad_state());
        }
        let dlog = DLOG.lock();
        let mut cursor = self.cursor.lock();
        let record = match dlog.records.iter().find(|r| r.seq >= *cursor) {
            Some(record) => record,
            None => {
                self.base
                    .tracker()
                    .expect("log objects always carry a tracker")
                    .update_satisfied(Signals::READABLE, Signals::empty());
                return Err(KernelError::should_wait());
            }
        };
        let needed = record.wire_len();
        if buf.len() < needed {
            return Err(KernelError::buffer_too_small(needed));
        }
        let header = LogRecordHeader {
            seq: record.seq,
            timestamp: record.timestamp,
            pid: record.pid,
            tid: record.tid,
            datalen: record.payload.len() as u32,
            flags: record.flags,
        };
        let mut cur = CursorWrite::new(buf);
        cur.write_bytes(wire::as_bytes(&header));
        cur.write_bytes(&record.payload);
        *cursor = record.seq + 1;
        if !dlog.records.iter().any(|r| r.seq >= *cursor) {
            self.base
                .tracker()
                .expect("log objects always carry a tracker")
                .update_satisfied(Signals::READABLE, Signals::empty());
        }
        Ok(cur.written())
    }
}

impl Dispatcher for LogDispatcher {
    fn base(&self) -> &KObjectBase {
        &self.base
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::LOG
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl StaticObjectType for LogDispatcher {
    fn static_object_type() -> ObjectType {
        ObjectType::LOG
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test fn on purpose: the ring is global, and two tests touching
    // it in parallel would see each other's records.
    #[test]
    fn write_read_drain() {
        let writer = LogDispatcher::new(false);
        let reader = LogDispatcher::new(true);

        writer.write(0x5, b"oops", 7, 8).unwrap();
        assert!(reader
            .state_tracker()
            .unwrap()
            .state()
            .satisfied()
            .contains(Signals::READABLE));

        let mut buf = [0u8; 512];
        let len = reader.read(&mut buf).unwrap();
        let header: LogRecordHeader = wire::read_from(&buf).unwrap();
        assert_eq!(header.datalen, 4);
        assert_eq!(header.flags, 0x5);
        assert_eq!(header.pid, 7);
        assert_eq!(&buf[core::mem::size_of::<LogRecordHeader>()..len], b"oops");

        // Drained: READABLE drops until the next write.
        match reader.read(&mut buf) {
            Err(KernelError::ShouldWait { .. }) => (),
            other => panic!("expected ShouldWait, got {:?}", other.map(|_| ())),
        }
        assert!(!reader
            .state_tracker()
            .unwrap()
            .state()
            .satisfied()
            .contains(Signals::READABLE));

        let big = alloc::vec![0u8; MAX_LOG_RECORD_PAYLOAD + 1];
        assert!(writer.write(0, &big, 0, 0).is_err());
    }
}
