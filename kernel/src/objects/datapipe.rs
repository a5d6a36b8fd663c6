//! Data pipes: unidirectional element rings.
//!
//! A fixed-capacity ring of fixed-size elements (size 1 when
//! byte-oriented), exposed as a producer dispatcher and a consumer
//! dispatcher. Copy-based read/write work on arbitrary element
//! multiples; the two-phase begin/end paths expose a contiguous run of
//! the ring for zero-copy access through a mapping of the backing vmo.
//!
//! READABLE and WRITABLE follow per-side thresholds: the consumer is
//! readable while at least `read_threshold` bytes are available, the
//! producer writable while at least `write_threshold` bytes are free.

use alloc::sync::Arc;
use core::any::Any;
use core::sync::atomic::{AtomicU64, Ordering};

use borealis_libkern::{ObjectType, Signals};

use crate::config::{DATAPIPE_DEFAULT_CAPACITY, DATAPIPE_MAX_CAPACITY};
use crate::error::KernelError;
use crate::event::StateTracker;
use crate::objects::{Dispatcher, KObjectBase, StaticObjectType, VmObject};
use crate::sync::SpinLock;

/// Producer side index.
const PRODUCER: usize = 0;
/// Consumer side index.
const CONSUMER: usize = 1;

/// An outstanding two-phase transaction.
struct Txn {
    /// Ring offset the transaction covers.
    offset: usize,
    /// Bytes handed out.
    len: usize,
}

/// Mutable half of a data pipe.
struct RingInner {
    /// Ring offset of the oldest unread byte.
    read_off: usize,
    /// Bytes available to read.
    avail: usize,
    /// Outstanding two-phase write, producer side.
    write_txn: Option<Txn>,
    /// Outstanding two-phase read, consumer side.
    read_txn: Option<Txn>,
    /// READABLE threshold in bytes.
    read_threshold: usize,
    /// WRITABLE threshold in bytes.
    write_threshold: usize,
    /// Liveness of [producer, consumer].
    alive: [bool; 2],
}

/// State shared by the two end dispatchers.
pub struct DataPipeShared {
    /// The ring's backing store; two-phase callers map a slice of it.
    vmo: Arc<VmObject>,
    /// Element size in bytes.
    element_size: usize,
    /// Ring capacity in bytes, a multiple of `element_size`.
    capacity: usize,
    /// Guarded ring state.
    inner: SpinLock<RingInner>,
    /// One tracker per side.
    trackers: [StateTracker; 2],
    /// Koids of the end dispatchers.
    koids: [AtomicU64; 2],
}

impl DataPipeShared {
    /// Recomputes both trackers from the ring state, under the inner
    /// lock.
    fn update_signals(&self, inner: &RingInner) {
        let free = self.capacity - inner.avail;

        let mut p_satisfied = Signals::empty();
        let mut p_satisfiable = Signals::PEER_CLOSED;
        if inner.alive[CONSUMER] {
            p_satisfiable |= Signals::WRITABLE;
            if free >= inner.write_threshold && inner.write_txn.is_none() {
                p_satisfied |= Signals::WRITABLE;
            }
        } else {
            p_satisfied |= Signals::PEER_CLOSED;
        }

        let mut c_satisfied = Signals::empty();
        let mut c_satisfiable = Signals::PEER_CLOSED;
        if inner.avail > 0 || inner.alive[PRODUCER] {
            c_satisfiable |= Signals::READABLE;
        }
        if inner.avail >= inner.read_threshold && inner.read_txn.is_none() {
            c_satisfied |= Signals::READABLE;
        }
        if !inner.alive[PRODUCER] {
            c_satisfied |= Signals::PEER_CLOSED;
        }

        self.trackers[PRODUCER].update_state(Signals::all(), p_satisfied, Signals::all(), p_satisfiable);
        self.trackers[CONSUMER].update_state(Signals::all(), c_satisfied, Signals::all(), c_satisfiable);
    }

    /// Copies `data` into the ring at the write offset, handling the
    /// wrap, and advances.
    fn push_bytes(&self, inner: &mut RingInner, data: &[u8]) -> Result<(), KernelError> {
        let write_off = (inner.read_off + inner.avail) % self.capacity;
        let first = data.len().min(self.capacity - write_off);
        self.vmo.write(write_off, &data[..first])?;
        if first < data.len() {
            self.vmo.write(0, &data[first..])?;
        }
        inner.avail += data.len();
        Ok(())
    }

    /// Copies `buf.len()` bytes out of the ring at the read offset,
    /// without advancing.
    fn peek_bytes(&self, inner: &RingInner, buf: &mut [u8]) -> Result<(), KernelError> {
        let first = buf.len().min(self.capacity - inner.read_off);
        self.vmo.read(inner.read_off, &mut buf[..first])?;
        if first < buf.len() {
            let rest = buf.len() - first;
            self.vmo.read(0, &mut buf[first..first + rest])?;
        }
        Ok(())
    }
}

/// Shared constructor.
///
/// A zero `capacity` picks the default, rounded up to a whole number of
/// elements.
pub fn create(
    element_size: usize,
    capacity: usize,
) -> Result<(Arc<DataPipeProducer>, Arc<DataPipeConsumer>), KernelError> {
    if element_size == 0 {
        return Err(KernelError::invalid_size(0));
    }
    let capacity = if capacity == 0 {
        // Default, rounded up to a whole number of elements.
        borealis_libutils::div_ceil(DATAPIPE_DEFAULT_CAPACITY, element_size) * element_size
    } else {
        capacity
    };
    if capacity % element_size != 0 {
        return Err(KernelError::invalid_combination());
    }
    if capacity > DATAPIPE_MAX_CAPACITY {
        return Err(KernelError::exceeding_maximum(capacity as u64, DATAPIPE_MAX_CAPACITY as u64));
    }
    let shared = Arc::new(DataPipeShared {
        vmo: VmObject::new(capacity)?,
        element_size,
        capacity,
        inner: SpinLock::new(RingInner {
            read_off: 0,
            avail: 0,
            write_txn: None,
            read_txn: None,
            read_threshold: element_size,
            write_threshold: element_size,
            alive: [true, true],
        }),
        trackers: [
            StateTracker::new(
                Signals::WRITABLE,
                Signals::WRITABLE | Signals::PEER_CLOSED,
            ),
            StateTracker::new(
                Signals::empty(),
                Signals::READABLE | Signals::PEER_CLOSED,
            ),
        ],
        koids: [AtomicU64::new(0), AtomicU64::new(0)],
    });
    let producer = Arc::new(DataPipeProducer {
        base: KObjectBase::new(),
        shared: shared.clone(),
        window: SpinLock::new(None),
    });
    let consumer = Arc::new(DataPipeConsumer {
        base: KObjectBase::new(),
        shared: shared.clone(),
        window: SpinLock::new(None),
    });
    shared.koids[PRODUCER].store(producer.base.koid(), Ordering::Relaxed);
    shared.koids[CONSUMER].store(consumer.base.koid(), Ordering::Relaxed);
    Ok((producer, consumer))
}

/// The producing end.
pub struct DataPipeProducer {
    /// Base; tracker lives in the shared object.
    base: KObjectBase,
    /// The ring.
    shared: Arc<DataPipeShared>,
    /// User address of the open two-phase window, parked here between
    /// the begin and end syscalls so end can unmap it.
    window: SpinLock<Option<usize>>,
}

impl core::fmt::Debug for DataPipeProducer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "DataPipeProducer {{ koid: {} }}", self.base.koid())
    }
}

impl DataPipeProducer {
    /// Copies bytes into the ring. Partial unless `all_or_none`.
    /// Returns the bytes accepted.
    pub fn write(&self, data: &[u8], all_or_none: bool) -> Result<usize, KernelError> {
        let shared = &self.shared;
        if data.len() % shared.element_size != 0 {
            return Err(KernelError::invalid_size(data.len()));
        }
        let mut inner = shared.inner.lock();
        if !inner.alive[CONSUMER] {
            return Err(KernelError::channel_closed());
        }
        if inner.write_txn.is_some() {
            return Err(KernelError::bad_state());
        }
        let free = shared.capacity - inner.avail;
        let mut accepted = free.min(data.len());
        accepted -= accepted % shared.element_size;
        if accepted < data.len() && all_or_none {
            return Err(KernelError::should_wait());
        }
        if accepted == 0 && !data.is_empty() {
            return Err(KernelError::should_wait());
        }
        shared.push_bytes(&mut inner, &data[..accepted])?;
        shared.update_signals(&inner);
        Ok(accepted)
    }

    /// Opens a two-phase write: a contiguous `(vmo, offset, len)` run of
    /// free ring space the caller maps writable.
    pub fn begin_write(&self) -> Result<(Arc<VmObject>, usize, usize), KernelError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        if !inner.alive[CONSUMER] {
            return Err(KernelError::channel_closed());
        }
        if inner.write_txn.is_some() {
            return Err(KernelError::bad_state());
        }
        let free = shared.capacity - inner.avail;
        let write_off = (inner.read_off + inner.avail) % shared.capacity;
        let len = free.min(shared.capacity - write_off);
        if len == 0 {
            return Err(KernelError::should_wait());
        }
        inner.write_txn = Some(Txn { offset: write_off, len });
        shared.update_signals(&inner);
        Ok((shared.vmo.clone(), write_off, len))
    }

    /// Closes a two-phase write, publishing `written` bytes. 0 aborts
    /// without advancing; so does an invalid count, reported as an
    /// error.
    pub fn end_write(&self, written: usize) -> Result<(), KernelError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        let txn = inner.write_txn.take().ok_or_else(KernelError::bad_state)?;
        if written > txn.len || written % shared.element_size != 0 {
            shared.update_signals(&inner);
            return Err(KernelError::invalid_size(written));
        }
        inner.avail += written;
        shared.update_signals(&inner);
        Ok(())
    }

    /// The two-phase window bookkeeping slot, used by the begin/end
    /// syscalls to remember the mapped user address.
    pub fn window(&self) -> &SpinLock<Option<usize>> {
        &self.window
    }

    /// Sets the WRITABLE threshold. 0 restores the one-element default.
    pub fn set_write_threshold(&self, bytes: usize) -> Result<(), KernelError> {
        let shared = &self.shared;
        let bytes = if bytes == 0 { shared.element_size } else { bytes };
        if bytes % shared.element_size != 0 || bytes > shared.capacity {
            return Err(KernelError::invalid_size(bytes));
        }
        let mut inner = shared.inner.lock();
        inner.write_threshold = bytes;
        shared.update_signals(&inner);
        Ok(())
    }

    /// The current WRITABLE threshold in bytes.
    pub fn write_threshold(&self) -> usize {
        self.shared.inner.lock().write_threshold
    }
}

impl Dispatcher for DataPipeProducer {
    fn base(&self) -> &KObjectBase {
        &self.base
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::DATA_PIPE_PRODUCER
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn state_tracker(&self) -> Option<&StateTracker> {
        Some(&self.shared.trackers[PRODUCER])
    }

    fn related_koid(&self) -> u64 {
        self.shared.koids[CONSUMER].load(Ordering::Relaxed)
    }

    fn on_zero_handles(&self) {
        let mut inner = self.shared.inner.lock();
        inner.alive[PRODUCER] = false;
        inner.write_txn = None;
        self.shared.update_signals(&inner);
    }
}

impl StaticObjectType for DataPipeProducer {
    fn static_object_type() -> ObjectType {
        ObjectType::DATA_PIPE_PRODUCER
    }
}

/// The consuming end.
pub struct DataPipeConsumer {
    /// Base; tracker lives in the shared object.
    base: KObjectBase,
    /// The ring.
    shared: Arc<DataPipeShared>,
    /// User address of the open two-phase window, parked here between
    /// the begin and end syscalls so end can unmap it.
    window: SpinLock<Option<usize>>,
}

impl core::fmt::Debug for DataPipeConsumer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "DataPipeConsumer {{ koid: {} }}", self.base.koid())
    }
}

impl DataPipeConsumer {
    /// Common entry validation for the consuming paths.
    fn readable_len(&self, inner: &RingInner, wanted: usize, all_or_none: bool) -> Result<usize, KernelError> {
        let shared = &self.shared;
        if wanted % shared.element_size != 0 {
            return Err(KernelError::invalid_size(wanted));
        }
        if inner.read_txn.is_some() {
            return Err(KernelError::bad_state());
        }
        let mut n = inner.avail.min(wanted);
        n -= n % shared.element_size;
        if n < wanted && all_or_none {
            return Err(KernelError::should_wait());
        }
        if n == 0 && wanted != 0 {
            return if inner.alive[PRODUCER] {
                Err(KernelError::should_wait())
            } else {
                Err(KernelError::channel_closed())
            };
        }
        Ok(n)
    }

    /// Copies bytes out of the ring and consumes them.
    pub fn read(&self, buf: &mut [u8], all_or_none: bool) -> Result<usize, KernelError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        let n = self.readable_len(&inner, buf.len(), all_or_none)?;
        shared.peek_bytes(&inner, &mut buf[..n])?;
        inner.read_off = (inner.read_off + n) % shared.capacity;
        inner.avail -= n;
        shared.update_signals(&inner);
        Ok(n)
    }

    /// Copies bytes out without consuming them.
    pub fn peek(&self, buf: &mut [u8], all_or_none: bool) -> Result<usize, KernelError> {
        let shared = &self.shared;
        let inner = shared.inner.lock();
        let n = self.readable_len(&inner, buf.len(), all_or_none)?;
        shared.peek_bytes(&inner, &mut buf[..n])?;
        Ok(n)
    }

    /// Consumes up to `len` bytes without copying.
    pub fn discard(&self, len: usize, all_or_none: bool) -> Result<usize, KernelError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        let n = self.readable_len(&inner, len, all_or_none)?;
        inner.read_off = (inner.read_off + n) % shared.capacity;
        inner.avail -= n;
        shared.update_signals(&inner);
        Ok(n)
    }

    /// Bytes currently available to read.
    pub fn query(&self) -> usize {
        self.shared.inner.lock().avail
    }

    /// Opens a two-phase read: a contiguous `(vmo, offset, len)` run of
    /// available data the caller maps readable.
    pub fn begin_read(&self) -> Result<(Arc<VmObject>, usize, usize), KernelError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        if inner.read_txn.is_some() {
            return Err(KernelError::bad_state());
        }
        let len = inner.avail.min(shared.capacity - inner.read_off);
        if len == 0 {
            return if inner.alive[PRODUCER] {
                Err(KernelError::should_wait())
            } else {
                Err(KernelError::channel_closed())
            };
        }
        let offset = inner.read_off;
        inner.read_txn = Some(Txn { offset, len });
        shared.update_signals(&inner);
        Ok((shared.vmo.clone(), offset, len))
    }

    /// Closes a two-phase read, consuming `read` bytes. 0 aborts without
    /// advancing.
    pub fn end_read(&self, read: usize) -> Result<(), KernelError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        let txn = inner.read_txn.take().ok_or_else(KernelError::bad_state)?;
        if read > txn.len || read % shared.element_size != 0 {
            shared.update_signals(&inner);
            return Err(KernelError::invalid_size(read));
        }
        inner.read_off = (inner.read_off + read) % shared.capacity;
        inner.avail -= read;
        shared.update_signals(&inner);
        Ok(())
    }

    /// The two-phase window bookkeeping slot, used by the begin/end
    /// syscalls to remember the mapped user address.
    pub fn window(&self) -> &SpinLock<Option<usize>> {
        &self.window
    }

    /// Sets the READABLE threshold. 0 restores the one-element default.
    pub fn set_read_threshold(&self, bytes: usize) -> Result<(), KernelError> {
        let shared = &self.shared;
        let bytes = if bytes == 0 { shared.element_size } else { bytes };
        if bytes % shared.element_size != 0 || bytes > shared.capacity {
            return Err(KernelError::invalid_size(bytes));
        }
        let mut inner = shared.inner.lock();
        inner.read_threshold = bytes;
        shared.update_signals(&inner);
        Ok(())
    }

    /// The current READABLE threshold in bytes.
    pub fn read_threshold(&self) -> usize {
        self.shared.inner.lock().read_threshold
    }
}

impl Dispatcher for DataPipeConsumer {
    fn base(&self) -> &KObjectBase {
        &self.base
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::DATA_PIPE_CONSUMER
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn state_tracker(&self) -> Option<&StateTracker> {
        Some(&self.shared.trackers[CONSUMER])
    }

    fn related_koid(&self) -> u64 {
        self.shared.koids[PRODUCER].load(Ordering::Relaxed)
    }

    fn on_zero_handles(&self) {
        let mut inner = self.shared.inner.lock();
        inner.alive[CONSUMER] = false;
        inner.read_txn = None;
        self.shared.update_signals(&inner);
    }
}

impl StaticObjectType for DataPipeConsumer {
    fn static_object_type() -> ObjectType {
        ObjectType::DATA_PIPE_CONSUMER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_roundtrip_with_wrap() {
        let (producer, consumer) = create(1, 8).unwrap();
        assert_eq!(producer.write(b"abcdef", false).unwrap(), 6);
        let mut buf = [0u8; 4];
        assert_eq!(consumer.read(&mut buf, false).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        // Wraps around the 8-byte ring.
        assert_eq!(producer.write(b"ghijkl", false).unwrap(), 6);
        let mut buf = [0u8; 8];
        assert_eq!(consumer.read(&mut buf, false).unwrap(), 8);
        assert_eq!(&buf, b"efghijkl");
    }

    #[test]
    fn element_granularity_enforced() {
        let (producer, consumer) = create(4, 16).unwrap();
        assert!(producer.write(b"abc", false).is_err());
        assert_eq!(producer.write(b"abcdefgh", false).unwrap(), 8);
        let mut buf = [0u8; 6];
        assert!(consumer.read(&mut buf, false).is_err());
    }

    #[test]
    fn all_or_none_wants_everything() {
        let (producer, consumer) = create(1, 4).unwrap();
        assert!(matches!(
            producer.write(b"abcdef", true),
            Err(KernelError::ShouldWait { .. })
        ));
        producer.write(b"ab", false).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            consumer.read(&mut buf, true),
            Err(KernelError::ShouldWait { .. })
        ));
        assert_eq!(consumer.read(&mut buf[..2], true).unwrap(), 2);
    }

    #[test]
    fn peek_discard_query() {
        let (producer, consumer) = create(1, 8).unwrap();
        producer.write(b"abcd", false).unwrap();
        assert_eq!(consumer.query(), 4);

        let mut buf = [0u8; 2];
        assert_eq!(consumer.peek(&mut buf, false).unwrap(), 2);
        assert_eq!(&buf, b"ab");
        assert_eq!(consumer.query(), 4);

        assert_eq!(consumer.discard(2, false).unwrap(), 2);
        let mut buf = [0u8; 2];
        assert_eq!(consumer.read(&mut buf, false).unwrap(), 2);
        assert_eq!(&buf, b"cd");
    }

    #[test]
    fn two_phase_write_then_read() {
        let (producer, consumer) = create(1, 8).unwrap();

        let (vmo, offset, len) = producer.begin_write().unwrap();
        assert_eq!((offset, len), (0, 8));
        // Concurrent copy write during a transaction is refused.
        assert!(matches!(producer.write(b"x", false), Err(KernelError::BadState { .. })));
        vmo.write(offset, b"ring").unwrap();
        producer.end_write(4).unwrap();

        let (vmo, offset, len) = consumer.begin_read().unwrap();
        assert_eq!((offset, len), (0, 4));
        let mut buf = [0u8; 4];
        vmo.read(offset, &mut buf).unwrap();
        assert_eq!(&buf, b"ring");
        consumer.end_read(4).unwrap();
        assert_eq!(consumer.query(), 0);

        // end without begin is a state error.
        assert!(matches!(consumer.end_read(0), Err(KernelError::BadState { .. })));
    }

    #[test]
    fn end_write_zero_aborts() {
        let (producer, _consumer) = create(1, 8).unwrap();
        producer.begin_write().unwrap();
        producer.end_write(0).unwrap();
        assert_eq!(producer.write(b"ok", false).unwrap(), 2);
    }

    #[test]
    fn thresholds_gate_signals() {
        let (producer, consumer) = create(1, 8).unwrap();
        consumer.set_read_threshold(4).unwrap();

        producer.write(b"ab", false).unwrap();
        assert!(!consumer
            .state_tracker()
            .unwrap()
            .state()
            .satisfied()
            .contains(Signals::READABLE));
        producer.write(b"cd", false).unwrap();
        assert!(consumer
            .state_tracker()
            .unwrap()
            .state()
            .satisfied()
            .contains(Signals::READABLE));

        producer.set_write_threshold(8).unwrap();
        assert!(!producer
            .state_tracker()
            .unwrap()
            .state()
            .satisfied()
            .contains(Signals::WRITABLE));
    }

    #[test]
    fn producer_close_leaves_data_readable() {
        let (producer, consumer) = create(1, 8).unwrap();
        producer.write(b"tail", false).unwrap();
        producer.on_zero_handles();

        let tracker = consumer.state_tracker().unwrap();
        assert!(tracker.state().satisfied().contains(Signals::PEER_CLOSED));
        assert!(tracker.state().satisfied().contains(Signals::READABLE));

        let mut buf = [0u8; 8];
        assert_eq!(consumer.read(&mut buf, false).unwrap(), 4);
        assert!(matches!(consumer.read(&mut buf, false), Err(KernelError::ChannelClosed { .. })));
        assert!(!tracker.state().satisfiable().contains(Signals::READABLE));
    }

    #[test]
    fn consumer_close_kills_writes() {
        let (producer, consumer) = create(1, 8).unwrap();
        consumer.on_zero_handles();
        assert!(matches!(producer.write(b"x", false), Err(KernelError::ChannelClosed { .. })));
        assert!(producer
            .state_tracker()
            .unwrap()
            .state()
            .satisfied()
            .contains(Signals::PEER_CLOSED));
    }
}
