//! Handle, wait and generic object syscalls.

use alloc::sync::Arc;
use alloc::vec::Vec;

use arrayvec::ArrayVec;

use borealis_libkern::object::{InfoTopic, Property};
use borealis_libkern::wire::{self, InfoHandleBasic, InfoProcess};
use borealis_libkern::{
    HandleValue, Rights, Signals, SignalsState, MAX_NAME_LEN, MAX_WAIT_HANDLE_COUNT,
};
use borealis_libutils::CursorWrite;

use crate::error::{KernelError, UserspaceError};
use crate::event::{StateObserver, WaitEvent, WaitResult, WaitStateObserver};
use crate::objects::{
    downcast_dispatcher, DataPipeConsumer, DataPipeProducer, Dispatcher, EventPairDispatcher,
    VmObject,
};
use crate::process::{ProcessState, ProcessStruct, ThreadStruct};
use crate::syscalls::{
    copy_from_user, copy_to_user, current_process, lookup_handle, lookup_handle_indexed,
    read_user_u64,
};

/// Closes a handle.
pub fn handle_close(handle: HandleValue) -> Result<(), UserspaceError> {
    let process = current_process()?;
    process.phandles.close_handle(handle).map_err(|err| {
        if let KernelError::BadHandle { .. } = err {
            process.on_bad_handle(handle);
        }
        err.into()
    })
}

/// Duplicates a handle, narrowing rights.
pub fn handle_duplicate(
    handle: HandleValue,
    rights_word: u32,
) -> Result<HandleValue, UserspaceError> {
    let process = current_process()?;
    process.phandles.duplicate(handle, rights_word).map_err(|err| {
        if let KernelError::BadHandle { .. } = err {
            process.on_bad_handle(handle);
        }
        err.into()
    })
}

/// Replaces a handle with one carrying new (narrowed) rights.
pub fn handle_replace(
    handle: HandleValue,
    rights_word: u32,
) -> Result<HandleValue, UserspaceError> {
    let process = current_process()?;
    process.phandles.replace(handle, rights_word).map_err(|err| {
        if let KernelError::BadHandle { .. } = err {
            process.on_bad_handle(handle);
        }
        err.into()
    })
}

/// Parses a signal mask argument.
fn parse_signals(bits: u32) -> Result<Signals, UserspaceError> {
    Signals::from_bits(bits).ok_or(UserspaceError::InvalidArgs)
}

/// Maps the end of a wait to the syscall result, given what the
/// winning observer saw.
fn wait_outcome(
    result: WaitResult,
    observed: SignalsState,
    watched: Signals,
) -> Result<SignalsState, UserspaceError> {
    match result {
        WaitResult::Satisfied => {
            if (observed.satisfied() & watched).is_empty() {
                // Woken because the watched set became unsatisfiable:
                // waiting longer would never help.
                Err(UserspaceError::BadState)
            } else {
                Ok(observed)
            }
        }
        WaitResult::TimedOut => Err(UserspaceError::TimedOut),
        WaitResult::Cancelled => Err(UserspaceError::Cancelled),
        WaitResult::Interrupted => Err(UserspaceError::Interrupted),
    }
}

/// Waits for any of `signal_bits` on one handle.
pub fn handle_wait_one(
    handle: HandleValue,
    signal_bits: u32,
    timeout_ns: u64,
) -> Result<SignalsState, UserspaceError> {
    let process = current_process()?;
    let watched = parse_signals(signal_bits)?;
    let (index, dispatcher) = lookup_handle_indexed(&process, handle, Rights::READ)?;
    let tracker = dispatcher.state_tracker().ok_or(UserspaceError::NotSupported)?;

    let event = WaitEvent::new();
    let observer = WaitStateObserver::new(event.clone(), watched, index, 0);
    tracker.attach(observer.clone());
    let (result, _) = event.wait(timeout_ns);
    let detach_me: Arc<dyn StateObserver> = observer.clone();
    tracker.detach(&detach_me);

    wait_outcome(result, observer.observed(), watched)
}

/// Waits for signals across up to [MAX_WAIT_HANDLE_COUNT] handles.
///
/// `handles_addr` and `signals_addr` are user arrays of `count` u32;
/// `states_addr`, when nonzero, receives `count` [SignalsState] records.
/// Returns the index whose wait completed.
pub fn handle_wait_many(
    handles_addr: usize,
    signals_addr: usize,
    count: usize,
    timeout_ns: u64,
    states_addr: usize,
) -> Result<u32, UserspaceError> {
    let process = current_process()?;
    if count > MAX_WAIT_HANDLE_COUNT {
        return Err(UserspaceError::OutOfRange);
    }
    if count == 0 {
        // Nothing can ever be satisfied; this is a sleep.
        let event = WaitEvent::new();
        return match event.wait(timeout_ns).0 {
            WaitResult::Interrupted => Err(UserspaceError::Interrupted),
            _ => Err(UserspaceError::TimedOut),
        };
    }
    let handle_values = read_wait_array(&process, handles_addr, count)?;
    let signal_words = read_wait_array(&process, signals_addr, count)?;

    let event = WaitEvent::new();
    let mut observers: ArrayVec<
        [(Arc<dyn Dispatcher>, Arc<WaitStateObserver>, Signals); MAX_WAIT_HANDLE_COUNT],
    > = ArrayVec::new();
    let mut setup_error = None;
    for (i, (&value, &bits)) in handle_values.iter().zip(signal_words.iter()).enumerate() {
        let watched = match parse_signals(bits) {
            Ok(watched) => watched,
            Err(err) => {
                setup_error = Some(err);
                break;
            }
        };
        let (index, dispatcher) = match lookup_handle_indexed(&process, value, Rights::READ) {
            Ok(found) => found,
            Err(err) => {
                setup_error = Some(err);
                break;
            }
        };
        if dispatcher.state_tracker().is_none() {
            setup_error = Some(UserspaceError::NotSupported);
            break;
        }
        let observer = WaitStateObserver::new(event.clone(), watched, index, i as u64);
        dispatcher
            .state_tracker()
            .expect("checked above")
            .attach(observer.clone());
        observers.push((dispatcher, observer, watched));
    }

    let outcome = match setup_error {
        Some(err) => Err(err),
        None => {
            let (result, winner) = event.wait(timeout_ns);
            let (_, observer, watched) = &observers[winner as usize];
            wait_outcome(result, observer.observed(), *watched).map(|_| winner as u32)
        }
    };

    // Tear down every registration, then report the final states.
    let mut states: ArrayVec<[SignalsState; MAX_WAIT_HANDLE_COUNT]> = ArrayVec::new();
    for (dispatcher, observer, _) in &observers {
        let detach_me: Arc<dyn StateObserver> = observer.clone();
        dispatcher
            .state_tracker()
            .expect("was waitable at attach time")
            .detach(&detach_me);
        states.push(observer.observed());
    }
    if states_addr != 0 && !states.is_empty() {
        let mut raw = [0u8; MAX_WAIT_HANDLE_COUNT * core::mem::size_of::<SignalsState>()];
        let mut cur = CursorWrite::new(&mut raw);
        for state in &states {
            cur.write_bytes(wire::as_bytes(state));
        }
        let written = cur.written();
        copy_to_user(&process, states_addr, &raw[..written])?;
    }
    outcome
}

/// Reads one u32 argument array of a wait_many call into a bounded
/// stack buffer; the count is already capped at
/// [MAX_WAIT_HANDLE_COUNT], so nothing here touches the heap.
fn read_wait_array(
    process: &ProcessStruct,
    addr: usize,
    count: usize,
) -> Result<ArrayVec<[u32; MAX_WAIT_HANDLE_COUNT]>, UserspaceError> {
    let mut raw = [0u8; MAX_WAIT_HANDLE_COUNT * 4];
    process
        .pmemory
        .lock()
        .read_bytes(addr, &mut raw[..count * 4])
        .map_err(UserspaceError::from)?;
    let mut out = ArrayVec::new();
    for chunk in raw[..count * 4].chunks_exact(4) {
        out.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(out)
}

/// Applies a user signal mutation to a handle's tracker.
pub fn object_signal(
    handle: HandleValue,
    clear_bits: u32,
    set_bits: u32,
) -> Result<(), UserspaceError> {
    let process = current_process()?;
    let clear = parse_signals(clear_bits)?;
    let set = parse_signals(set_bits)?;
    let dispatcher = lookup_handle(&process, handle, Rights::WRITE)?;
    let tracker = dispatcher.state_tracker().ok_or(UserspaceError::NotSupported)?;
    tracker
        .user_signal(clear, set, dispatcher.allowed_user_signals())
        .map_err(UserspaceError::from)
}

/// Applies a user signal mutation to the peer of an event pair half.
pub fn object_signal_peer(
    handle: HandleValue,
    clear_bits: u32,
    set_bits: u32,
) -> Result<(), UserspaceError> {
    let process = current_process()?;
    let clear = parse_signals(clear_bits)?;
    let set = parse_signals(set_bits)?;
    let dispatcher = lookup_handle(&process, handle, Rights::WRITE)?;
    let pair = downcast_dispatcher::<EventPairDispatcher>(&dispatcher)
        .map_err(UserspaceError::from)?;
    pair.signal_peer(clear, set).map_err(UserspaceError::from)
}

/// Fills `buf` with an info record for `topic`. Returns bytes written.
pub fn object_get_info(
    handle: HandleValue,
    topic: u32,
    buf_addr: usize,
    buf_len: usize,
) -> Result<usize, UserspaceError> {
    let process = current_process()?;
    let record: Vec<u8> = match InfoTopic(topic) {
        InfoTopic::HANDLE_BASIC => {
            let (dispatcher, rights) = process
                .phandles
                .lookup_with_rights(handle, Rights::empty())
                .map_err(|err| {
                    if let KernelError::BadHandle { .. } = err {
                        process.on_bad_handle(handle);
                    }
                    UserspaceError::from(err)
                })?;
            let info = InfoHandleBasic {
                koid: dispatcher.base().koid(),
                related_koid: dispatcher.related_koid(),
                rights: rights.bits(),
                otype: dispatcher.object_type().0,
                waitable: dispatcher.state_tracker().is_some() as u32,
                reserved: 0,
            };
            wire::as_bytes(&info).to_vec()
        }
        InfoTopic::PROCESS => {
            let dispatcher = lookup_handle(&process, handle, Rights::READ)?;
            let target = downcast_dispatcher::<ProcessStruct>(&dispatcher)
                .map_err(UserspaceError::from)?;
            let state = target.state();
            let info = InfoProcess {
                return_code: target.retcode(),
                started: (state != ProcessState::Initial) as u32,
                exited: (state == ProcessState::Dead) as u32,
                thread_count: target.thread_count() as u32,
            };
            wire::as_bytes(&info).to_vec()
        }
        InfoTopic::PROCESS_HANDLE_COUNT => {
            let dispatcher = lookup_handle(&process, handle, Rights::READ)?;
            let target = downcast_dispatcher::<ProcessStruct>(&dispatcher)
                .map_err(UserspaceError::from)?;
            (target.phandles.count() as u32).to_le_bytes().to_vec()
        }
        InfoTopic::VMO_SIZE => {
            let dispatcher = lookup_handle(&process, handle, Rights::READ)?;
            let vmo = downcast_dispatcher::<VmObject>(&dispatcher).map_err(UserspaceError::from)?;
            (vmo.size() as u64).to_le_bytes().to_vec()
        }
        _ => return Err(UserspaceError::InvalidArgs),
    };
    if buf_len < record.len() {
        return Err(UserspaceError::BufferTooSmall);
    }
    copy_to_user(&process, buf_addr, &record)?;
    Ok(record.len())
}

/// Reads a property into `buf`. Returns bytes written.
pub fn object_get_property(
    handle: HandleValue,
    property: u32,
    buf_addr: usize,
    buf_len: usize,
) -> Result<usize, UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::GET_PROPERTY)?;
    let record: Vec<u8> = match Property(property) {
        Property::NAME => {
            let name = task_name(&dispatcher)?;
            let mut bytes = name.into_bytes();
            bytes.push(0);
            bytes
        }
        Property::BAD_HANDLE_POLICY => {
            let target = downcast_dispatcher::<ProcessStruct>(&dispatcher)
                .map_err(UserspaceError::from)?;
            target.policy().0.to_le_bytes().to_vec()
        }
        Property::DATAPIPE_READ_THRESHOLD => {
            let consumer = downcast_dispatcher::<DataPipeConsumer>(&dispatcher)
                .map_err(UserspaceError::from)?;
            (consumer.read_threshold() as u64).to_le_bytes().to_vec()
        }
        Property::DATAPIPE_WRITE_THRESHOLD => {
            let producer = downcast_dispatcher::<DataPipeProducer>(&dispatcher)
                .map_err(UserspaceError::from)?;
            (producer.write_threshold() as u64).to_le_bytes().to_vec()
        }
        _ => return Err(UserspaceError::InvalidArgs),
    };
    if buf_len < record.len() {
        return Err(UserspaceError::BufferTooSmall);
    }
    copy_to_user(&process, buf_addr, &record)?;
    Ok(record.len())
}

/// Writes a property from `buf`.
pub fn object_set_property(
    handle: HandleValue,
    property: u32,
    buf_addr: usize,
    buf_len: usize,
) -> Result<(), UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::SET_PROPERTY)?;
    match Property(property) {
        Property::NAME => {
            if buf_len > MAX_NAME_LEN {
                return Err(UserspaceError::InvalidArgs);
            }
            let bytes = copy_from_user(&process, buf_addr, buf_len)?;
            let name = core::str::from_utf8(&bytes).map_err(|_| UserspaceError::InvalidArgs)?;
            set_task_name(&dispatcher, name)
        }
        Property::BAD_HANDLE_POLICY => {
            if buf_len < 4 {
                return Err(UserspaceError::BufferTooSmall);
            }
            let raw = crate::syscalls::read_user_u32(&process, buf_addr)?;
            let target = downcast_dispatcher::<ProcessStruct>(&dispatcher)
                .map_err(UserspaceError::from)?;
            target.set_policy(raw).map_err(UserspaceError::from)
        }
        Property::DATAPIPE_READ_THRESHOLD => {
            if buf_len < 8 {
                return Err(UserspaceError::BufferTooSmall);
            }
            let bytes = read_user_u64(&process, buf_addr)?;
            let consumer = downcast_dispatcher::<DataPipeConsumer>(&dispatcher)
                .map_err(UserspaceError::from)?;
            consumer
                .set_read_threshold(bytes as usize)
                .map_err(UserspaceError::from)
        }
        Property::DATAPIPE_WRITE_THRESHOLD => {
            if buf_len < 8 {
                return Err(UserspaceError::BufferTooSmall);
            }
            let bytes = read_user_u64(&process, buf_addr)?;
            let producer = downcast_dispatcher::<DataPipeProducer>(&dispatcher)
                .map_err(UserspaceError::from)?;
            producer
                .set_write_threshold(bytes as usize)
                .map_err(UserspaceError::from)
        }
        _ => Err(UserspaceError::InvalidArgs),
    }
}

/// The NAME property getter, polymorphic over processes and threads.
fn task_name(dispatcher: &Arc<dyn Dispatcher>) -> Result<alloc::string::String, UserspaceError> {
    if let Ok(target) = downcast_dispatcher::<ProcessStruct>(dispatcher) {
        return Ok(target.name());
    }
    if let Ok(target) = downcast_dispatcher::<ThreadStruct>(dispatcher) {
        return Ok(target.name());
    }
    Err(UserspaceError::WrongType)
}

/// The NAME property setter, polymorphic over processes and threads.
fn set_task_name(dispatcher: &Arc<dyn Dispatcher>, name: &str) -> Result<(), UserspaceError> {
    if let Ok(target) = downcast_dispatcher::<ProcessStruct>(dispatcher) {
        return target.set_name(name).map_err(UserspaceError::from);
    }
    if let Ok(target) = downcast_dispatcher::<ThreadStruct>(dispatcher) {
        return target.set_name(name).map_err(UserspaceError::from);
    }
    Err(UserspaceError::WrongType)
}
