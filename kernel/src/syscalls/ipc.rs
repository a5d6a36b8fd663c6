//! IPC syscalls: message pipes, data pipes, sockets, ports, wait sets,
//! events and logs.

use alloc::sync::Arc;
use alloc::vec::Vec;

use arrayvec::ArrayVec;

use borealis_libkern::object::{flags, packet_type, MemoryPermissions};
use borealis_libkern::wire::{self, PacketHeader, WaitSetResultWire};
use borealis_libkern::{
    HandleValue, Rights, Signals, MAX_MSG_BYTES, MAX_MSG_HANDLES, MAX_PORT_PACKET_PAYLOAD,
};

use crate::error::{KernelError, UserspaceError};
use crate::handle::arena;
use crate::objects::{
    self, downcast_dispatcher, DataPipeConsumer, DataPipeProducer, EventDispatcher,
    EventPairDispatcher, HandleList, IoPacket, IoPortClient, IoPortDispatcher, LogDispatcher,
    MessagePacket, MessagePipeEnd, SocketDispatcher, WaitSetDispatcher,
};
use crate::process::ProcessStruct;
use crate::syscalls::{
    copy_from_user, copy_to_user, current_process, current_thread, lookup_handle,
    lookup_handle_indexed, read_user_u32, write_user_u32, write_user_u32_array,
};

/// Reads a message's handle-value array into a bounded stack buffer;
/// the count is already capped at [MAX_MSG_HANDLES].
fn read_handle_array(
    process: &ProcessStruct,
    addr: usize,
    count: usize,
) -> Result<ArrayVec<[u32; MAX_MSG_HANDLES]>, UserspaceError> {
    let mut raw = [0u8; MAX_MSG_HANDLES * 4];
    if count > 0 {
        process
            .pmemory
            .lock()
            .read_bytes(addr, &mut raw[..count * 4])
            .map_err(UserspaceError::from)?;
    }
    let mut out = ArrayVec::new();
    for chunk in raw[..count * 4].chunks_exact(4) {
        out.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(out)
}

/// Rights a fresh message pipe handle carries.
fn msgpipe_rights() -> Rights {
    Rights::TRANSFER | Rights::READ | Rights::WRITE | Rights::GET_PROPERTY
}

/// Creates a message pipe pair.
pub fn msgpipe_create(create_flags: u32) -> Result<(HandleValue, HandleValue), UserspaceError> {
    if create_flags & !flags::MSGPIPE_CREATE_REPLY_PIPE != 0 {
        return Err(UserspaceError::InvalidArgs);
    }
    let process = current_process()?;
    let reply_pipe = create_flags & flags::MSGPIPE_CREATE_REPLY_PIPE != 0;
    let (end0, end1) = MessagePipeEnd::new_pair(reply_pipe);
    let h0 = process
        .new_handle(end0, msgpipe_rights())
        .map_err(UserspaceError::from)?;
    let h1 = match process.new_handle(end1, msgpipe_rights()) {
        Ok(h1) => h1,
        Err(err) => {
            let _ = process.phandles.close_handle(h0);
            return Err(err.into());
        }
    };
    Ok((h0, h1))
}

/// Writes a message, atomically transferring the listed handles.
///
/// On any failure every removed handle is restored, so the caller's
/// table is observably unchanged.
pub fn msgpipe_write(
    handle: HandleValue,
    data_addr: usize,
    data_len: usize,
    handles_addr: usize,
    handles_count: usize,
    write_flags: u32,
) -> Result<(), UserspaceError> {
    if write_flags != 0 {
        return Err(UserspaceError::InvalidArgs);
    }
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::WRITE)?;
    let pipe = downcast_dispatcher::<MessagePipeEnd>(&dispatcher).map_err(UserspaceError::from)?;
    if data_len > MAX_MSG_BYTES || handles_count > MAX_MSG_HANDLES {
        return Err(UserspaceError::OutOfRange);
    }
    let data = copy_from_user(&process, data_addr, data_len)?;
    let values = read_handle_array(&process, handles_addr, handles_count)?;

    // Pull every handle out of the table, keeping an undo log. A
    // duplicate value in the array fails its second removal on its own.
    let mut removed = HandleList::new();
    let mut failure: Option<UserspaceError> = None;
    for (position, &value) in values.iter().enumerate() {
        if value == handle {
            // The handle being written on cannot ride its own message.
            failure = Some(UserspaceError::NotSupported);
            break;
        }
        let owned = match process.phandles.remove_handle(value) {
            Ok(owned) => owned,
            Err(err) => {
                if let KernelError::BadHandle { .. } = err {
                    process.on_bad_handle(value);
                }
                failure = Some(err.into());
                break;
            }
        };
        let (transferred, rights, _) = arena::inspect(owned.index())
            .expect("handle removed from our table moments ago");
        if !rights.allows(Rights::TRANSFER) {
            process.phandles.add_handle(owned);
            failure = Some(UserspaceError::AccessDenied);
            break;
        }
        if transferred.base().koid() == pipe.peer_koid() {
            // The pipe's own other end: reply-pipe mode only, and it has
            // to ride last.
            let last = position == values.len() - 1;
            if !pipe.is_reply_pipe() || !last {
                process.phandles.add_handle(owned);
                failure = Some(UserspaceError::InvalidArgs);
                break;
            }
        }
        removed.push(owned);
    }
    if let Some(err) = failure {
        // Replay the undo log: same arena slots, same secret, same
        // values.
        for owned in removed {
            process.phandles.add_handle(owned);
        }
        return Err(err);
    }

    // The handles are committed to transfer: kill sender-side waits
    // registered through them.
    for owned in &removed {
        if let Some((transferred, _, _)) = arena::inspect(owned.index()) {
            if let Some(tracker) = transferred.state_tracker() {
                tracker.cancel(owned.index());
            }
        }
    }

    let packet = MessagePacket {
        data,
        handles: removed,
    };
    pipe.write(packet).map_err(|(err, packet)| {
        for owned in packet.handles {
            process.phandles.add_handle(owned);
        }
        UserspaceError::from(err)
    })
}

/// Reads a message.
///
/// `data_size_addr` and `handles_count_addr` are in/out u32 user
/// pointers: capacities in, actual (or needed) sizes out. With
/// MAY_DISCARD, a too-small buffer consumes and drops the message
/// instead of leaving it queued.
pub fn msgpipe_read(
    handle: HandleValue,
    data_addr: usize,
    data_size_addr: usize,
    handles_addr: usize,
    handles_count_addr: usize,
    read_flags: u32,
) -> Result<(), UserspaceError> {
    if read_flags & !flags::MSGPIPE_READ_MAY_DISCARD != 0 {
        return Err(UserspaceError::InvalidArgs);
    }
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::READ)?;
    let pipe = downcast_dispatcher::<MessagePipeEnd>(&dispatcher).map_err(UserspaceError::from)?;

    let data_capacity = if data_size_addr != 0 {
        read_user_u32(&process, data_size_addr)? as usize
    } else {
        0
    };
    let handles_capacity = if handles_count_addr != 0 {
        read_user_u32(&process, handles_count_addr)? as usize
    } else {
        0
    };

    let (data_len, handles_len, serial) = pipe.begin_read().map_err(UserspaceError::from)?;
    if data_size_addr != 0 {
        write_user_u32(&process, data_size_addr, data_len as u32)?;
    }
    if handles_count_addr != 0 {
        write_user_u32(&process, handles_count_addr, handles_len as u32)?;
    }
    if data_len > data_capacity || handles_len > handles_capacity {
        if read_flags & flags::MSGPIPE_READ_MAY_DISCARD != 0 {
            // Consume and drop; in-transit handles die with the packet.
            let _ = pipe.accept_read(serial);
        }
        return Err(UserspaceError::BufferTooSmall);
    }

    let packet = pipe.accept_read(serial).map_err(UserspaceError::from)?;
    copy_to_user(&process, data_addr, &packet.data)?;
    // Packets never carry more than MAX_MSG_HANDLES; the write side
    // enforced it.
    let mut received: ArrayVec<[HandleValue; MAX_MSG_HANDLES]> = ArrayVec::new();
    for owned in packet.handles {
        received.push(process.phandles.add_handle(owned));
    }
    write_user_u32_array(&process, handles_addr, &received)
}

/// Creates a data pipe, returning `(producer, consumer)` handles.
pub fn datapipe_create(
    element_size: usize,
    capacity: usize,
) -> Result<(HandleValue, HandleValue), UserspaceError> {
    let process = current_process()?;
    let (producer, consumer) = objects::datapipe::create(element_size, capacity)
        .map_err(UserspaceError::from)?;
    let producer_rights =
        Rights::TRANSFER | Rights::WRITE | Rights::READ | Rights::GET_PROPERTY | Rights::SET_PROPERTY;
    let consumer_rights =
        Rights::TRANSFER | Rights::READ | Rights::GET_PROPERTY | Rights::SET_PROPERTY;
    let h_producer = process
        .new_handle(producer, producer_rights)
        .map_err(UserspaceError::from)?;
    let h_consumer = match process.new_handle(consumer, consumer_rights) {
        Ok(h) => h,
        Err(err) => {
            let _ = process.phandles.close_handle(h_producer);
            return Err(err.into());
        }
    };
    Ok((h_producer, h_consumer))
}

/// Copies bytes into a data pipe.
pub fn datapipe_write(
    handle: HandleValue,
    buf_addr: usize,
    buf_len: usize,
    write_flags: u32,
) -> Result<usize, UserspaceError> {
    if write_flags & !flags::DATAPIPE_ALL_OR_NONE != 0 {
        return Err(UserspaceError::InvalidArgs);
    }
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::WRITE)?;
    let producer =
        downcast_dispatcher::<DataPipeProducer>(&dispatcher).map_err(UserspaceError::from)?;
    let data = copy_from_user(&process, buf_addr, buf_len)?;
    producer
        .write(&data, write_flags & flags::DATAPIPE_ALL_OR_NONE != 0)
        .map_err(UserspaceError::from)
}

/// Reads, peeks, discards or queries a data pipe.
pub fn datapipe_read(
    handle: HandleValue,
    buf_addr: usize,
    buf_len: usize,
    read_flags: u32,
) -> Result<usize, UserspaceError> {
    let known = flags::DATAPIPE_ALL_OR_NONE
        | flags::DATAPIPE_READ_DISCARD
        | flags::DATAPIPE_READ_PEEK
        | flags::DATAPIPE_READ_QUERY;
    if read_flags & !known != 0 {
        return Err(UserspaceError::InvalidArgs);
    }
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::READ)?;
    let consumer =
        downcast_dispatcher::<DataPipeConsumer>(&dispatcher).map_err(UserspaceError::from)?;
    let all_or_none = read_flags & flags::DATAPIPE_ALL_OR_NONE != 0;

    if read_flags & flags::DATAPIPE_READ_QUERY != 0 {
        return Ok(consumer.query());
    }
    if read_flags & flags::DATAPIPE_READ_DISCARD != 0 {
        return consumer.discard(buf_len, all_or_none).map_err(UserspaceError::from);
    }
    let mut buf = alloc::vec![0; buf_len];
    let n = if read_flags & flags::DATAPIPE_READ_PEEK != 0 {
        consumer.peek(&mut buf, all_or_none)
    } else {
        consumer.read(&mut buf, all_or_none)
    }
    .map_err(UserspaceError::from)?;
    copy_to_user(&process, buf_addr, &buf[..n])?;
    Ok(n)
}

/// Opens a two-phase data pipe write, mapping the free run into the
/// caller. Returns `(user address, length)`.
pub fn datapipe_begin_write(handle: HandleValue) -> Result<(usize, usize), UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::WRITE)?;
    let producer =
        downcast_dispatcher::<DataPipeProducer>(&dispatcher).map_err(UserspaceError::from)?;
    let mut window = producer.window().lock();
    if window.is_some() {
        return Err(UserspaceError::BadState);
    }
    let (vmo, offset, len) = producer.begin_write().map_err(UserspaceError::from)?;
    let addr = process
        .pmemory
        .lock()
        .map_internal(vmo, offset, len, MemoryPermissions::READ | MemoryPermissions::WRITE)
        .map_err(|err| {
            let _ = producer.end_write(0);
            UserspaceError::from(err)
        })?;
    *window = Some(addr.addr());
    Ok((addr.addr(), len))
}

/// Closes a two-phase data pipe write, publishing `written` bytes.
pub fn datapipe_end_write(handle: HandleValue, written: usize) -> Result<(), UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::WRITE)?;
    let producer =
        downcast_dispatcher::<DataPipeProducer>(&dispatcher).map_err(UserspaceError::from)?;
    let addr = producer
        .window()
        .lock()
        .take()
        .ok_or(UserspaceError::BadState)?;
    process
        .pmemory
        .lock()
        .unmap_internal(crate::mem::VirtualAddress(addr));
    producer.end_write(written).map_err(UserspaceError::from)
}

/// Opens a two-phase data pipe read. Returns `(user address, length)`.
pub fn datapipe_begin_read(handle: HandleValue) -> Result<(usize, usize), UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::READ)?;
    let consumer =
        downcast_dispatcher::<DataPipeConsumer>(&dispatcher).map_err(UserspaceError::from)?;
    let mut window = consumer.window().lock();
    if window.is_some() {
        return Err(UserspaceError::BadState);
    }
    let (vmo, offset, len) = consumer.begin_read().map_err(UserspaceError::from)?;
    let addr = process
        .pmemory
        .lock()
        .map_internal(vmo, offset, len, MemoryPermissions::READ)
        .map_err(|err| {
            let _ = consumer.end_read(0);
            UserspaceError::from(err)
        })?;
    *window = Some(addr.addr());
    Ok((addr.addr(), len))
}

/// Closes a two-phase data pipe read, consuming `read` bytes.
pub fn datapipe_end_read(handle: HandleValue, read: usize) -> Result<(), UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::READ)?;
    let consumer =
        downcast_dispatcher::<DataPipeConsumer>(&dispatcher).map_err(UserspaceError::from)?;
    let addr = consumer
        .window()
        .lock()
        .take()
        .ok_or(UserspaceError::BadState)?;
    process
        .pmemory
        .lock()
        .unmap_internal(crate::mem::VirtualAddress(addr));
    consumer.end_read(read).map_err(UserspaceError::from)
}

/// Creates a socket pair.
pub fn socket_create() -> Result<(HandleValue, HandleValue), UserspaceError> {
    let process = current_process()?;
    let (end0, end1) = SocketDispatcher::new_pair();
    let rights = Rights::TRANSFER | Rights::READ | Rights::WRITE;
    let h0 = process.new_handle(end0, rights).map_err(UserspaceError::from)?;
    let h1 = match process.new_handle(end1, rights) {
        Ok(h1) => h1,
        Err(err) => {
            let _ = process.phandles.close_handle(h0);
            return Err(err.into());
        }
    };
    Ok((h0, h1))
}

/// Writes to a socket; CONTROL selects the out-of-band lane, SHUTDOWN
/// half-closes after the write.
pub fn socket_write(
    handle: HandleValue,
    buf_addr: usize,
    buf_len: usize,
    write_flags: u32,
) -> Result<usize, UserspaceError> {
    if write_flags & !(flags::SOCKET_CONTROL | flags::SOCKET_SHUTDOWN) != 0 {
        return Err(UserspaceError::InvalidArgs);
    }
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::WRITE)?;
    let socket =
        downcast_dispatcher::<SocketDispatcher>(&dispatcher).map_err(UserspaceError::from)?;
    let data = copy_from_user(&process, buf_addr, buf_len)?;
    let written = if write_flags & flags::SOCKET_CONTROL != 0 {
        socket.write_oob(&data).map(|()| data.len())
    } else if data.is_empty() {
        Ok(0)
    } else {
        socket.write(&data)
    }
    .map_err(UserspaceError::from)?;
    if write_flags & flags::SOCKET_SHUTDOWN != 0 {
        socket.shutdown();
    }
    Ok(written)
}

/// Reads from a socket; CONTROL selects the out-of-band lane.
pub fn socket_read(
    handle: HandleValue,
    buf_addr: usize,
    buf_len: usize,
    read_flags: u32,
) -> Result<usize, UserspaceError> {
    if read_flags & !flags::SOCKET_CONTROL != 0 {
        return Err(UserspaceError::InvalidArgs);
    }
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::READ)?;
    let socket =
        downcast_dispatcher::<SocketDispatcher>(&dispatcher).map_err(UserspaceError::from)?;
    let mut buf = alloc::vec![0; buf_len];
    let n = if read_flags & flags::SOCKET_CONTROL != 0 {
        socket.read_oob(&mut buf)
    } else {
        socket.read(&mut buf)
    }
    .map_err(UserspaceError::from)?;
    copy_to_user(&process, buf_addr, &buf[..n])?;
    Ok(n)
}

/// Creates an io port.
pub fn port_create() -> Result<HandleValue, UserspaceError> {
    let process = current_process()?;
    let port = IoPortDispatcher::new();
    process
        .new_handle(port, Rights::TRANSFER | Rights::READ | Rights::WRITE | Rights::DUPLICATE)
        .map_err(UserspaceError::from)
}

/// Queues a user packet: a [PacketHeader] followed by its payload.
pub fn port_queue(
    handle: HandleValue,
    packet_addr: usize,
    packet_len: usize,
) -> Result<(), UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::WRITE)?;
    let port =
        downcast_dispatcher::<IoPortDispatcher>(&dispatcher).map_err(UserspaceError::from)?;
    let header_len = core::mem::size_of::<PacketHeader>();
    if packet_len < header_len {
        return Err(UserspaceError::InvalidArgs);
    }
    let bytes = copy_from_user(&process, packet_addr, packet_len)?;
    let header: PacketHeader = wire::read_from(&bytes).ok_or(UserspaceError::InvalidArgs)?;
    if header.size as usize != packet_len - header_len {
        return Err(UserspaceError::InvalidArgs);
    }
    let packet = IoPacket {
        key: header.key,
        // Userspace cannot spoof kernel-synthesized packet types.
        ptype: packet_type::USER,
        payload: bytes[header_len..].to_vec(),
    };
    port.queue(packet).map_err(UserspaceError::from)
}

/// Dequeues a packet, blocking up to `timeout_ns`. The buffer must fit
/// a maximal packet. Returns bytes written.
pub fn port_wait(
    handle: HandleValue,
    timeout_ns: u64,
    buf_addr: usize,
    buf_len: usize,
) -> Result<usize, UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::READ)?;
    let port =
        downcast_dispatcher::<IoPortDispatcher>(&dispatcher).map_err(UserspaceError::from)?;
    let header_len = core::mem::size_of::<PacketHeader>();
    if buf_len < header_len + MAX_PORT_PACKET_PAYLOAD {
        return Err(UserspaceError::InvalidArgs);
    }
    let packet = port.wait(timeout_ns).map_err(UserspaceError::from)?;
    let header = PacketHeader {
        key: packet.key,
        ptype: packet.ptype,
        size: packet.payload.len() as u32,
    };
    let mut bytes = Vec::with_capacity(header_len + packet.payload.len());
    bytes.extend_from_slice(wire::as_bytes(&header));
    bytes.extend_from_slice(&packet.payload);
    copy_to_user(&process, buf_addr, &bytes)?;
    Ok(bytes.len())
}

/// Binds (nonzero `signal_bits`) or unbinds (zero) a port to a source
/// handle's signals.
pub fn port_bind(
    port_handle: HandleValue,
    key: u64,
    source_handle: HandleValue,
    signal_bits: u32,
) -> Result<(), UserspaceError> {
    let process = current_process()?;
    let (source_index, source) =
        lookup_handle_indexed(&process, source_handle, Rights::READ)?;
    let tracker = source.state_tracker().ok_or(UserspaceError::NotSupported)?;

    if signal_bits == 0 {
        // Unbind.
        let client = source
            .base()
            .port_client()
            .lock()
            .take()
            .ok_or(UserspaceError::NotFound)?;
        let observer: Arc<dyn crate::event::StateObserver> = client;
        tracker.detach(&observer);
        return Ok(());
    }

    let watched = Signals::from_bits(signal_bits).ok_or(UserspaceError::InvalidArgs)?;
    let dispatcher = lookup_handle(&process, port_handle, Rights::WRITE)?;
    let port =
        downcast_dispatcher::<IoPortDispatcher>(&dispatcher).map_err(UserspaceError::from)?;
    let client = IoPortClient::new(&port, key, watched, source_index);
    {
        let mut slot = source.base().port_client().lock();
        // A binding severed by its handle's close counts as absent.
        if slot.as_ref().map_or(false, |old| !old.is_dead()) {
            return Err(UserspaceError::AlreadyBound);
        }
        *slot = Some(client.clone());
    }
    tracker.attach(client);
    Ok(())
}

/// Creates a wait set.
pub fn waitset_create() -> Result<HandleValue, UserspaceError> {
    let process = current_process()?;
    let set = WaitSetDispatcher::new();
    process
        .new_handle(set, Rights::READ | Rights::WRITE)
        .map_err(UserspaceError::from)
}

/// Adds `(source, signals, cookie)` to a wait set.
pub fn waitset_add(
    set_handle: HandleValue,
    cookie: u64,
    source_handle: HandleValue,
    signal_bits: u32,
) -> Result<(), UserspaceError> {
    let process = current_process()?;
    let watched = Signals::from_bits(signal_bits).ok_or(UserspaceError::InvalidArgs)?;
    let dispatcher = lookup_handle(&process, set_handle, Rights::WRITE)?;
    let set =
        downcast_dispatcher::<WaitSetDispatcher>(&dispatcher).map_err(UserspaceError::from)?;
    let (source_index, source) =
        lookup_handle_indexed(&process, source_handle, Rights::READ)?;
    set.add(source, source_index, watched, cookie)
        .map_err(UserspaceError::from)
}

/// Removes the entry under `cookie`.
pub fn waitset_remove(set_handle: HandleValue, cookie: u64) -> Result<(), UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, set_handle, Rights::WRITE)?;
    let set =
        downcast_dispatcher::<WaitSetDispatcher>(&dispatcher).map_err(UserspaceError::from)?;
    set.remove(cookie).map_err(UserspaceError::from)
}

/// Waits on a wait set.
///
/// `num_addr` is an in/out u32: result capacity in, results reported
/// out. `results_addr` receives that many [WaitSetResultWire] records;
/// `max_addr`, when nonzero, receives the untruncated total.
pub fn waitset_wait(
    set_handle: HandleValue,
    timeout_ns: u64,
    num_addr: usize,
    results_addr: usize,
    max_addr: usize,
) -> Result<(), UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, set_handle, Rights::READ)?;
    let set =
        downcast_dispatcher::<WaitSetDispatcher>(&dispatcher).map_err(UserspaceError::from)?;
    let capacity = read_user_u32(&process, num_addr)? as usize;

    let (results, total) = set.wait(timeout_ns, capacity).map_err(UserspaceError::from)?;
    let mut bytes = Vec::with_capacity(results.len() * core::mem::size_of::<WaitSetResultWire>());
    for result in &results {
        let record = WaitSetResultWire {
            cookie: result.cookie,
            status: result.status,
            reserved: 0,
            state: result.state,
        };
        bytes.extend_from_slice(wire::as_bytes(&record));
    }
    copy_to_user(&process, results_addr, &bytes)?;
    write_user_u32(&process, num_addr, results.len() as u32)?;
    if max_addr != 0 {
        write_user_u32(&process, max_addr, total as u32)?;
    }
    Ok(())
}

/// Creates an event.
pub fn event_create() -> Result<HandleValue, UserspaceError> {
    let process = current_process()?;
    process
        .new_handle(EventDispatcher::new(), Rights::default_rw())
        .map_err(UserspaceError::from)
}

/// Creates an event pair.
pub fn eventpair_create() -> Result<(HandleValue, HandleValue), UserspaceError> {
    let process = current_process()?;
    let (end0, end1) = EventPairDispatcher::new_pair();
    let h0 = process
        .new_handle(end0, Rights::default_rw())
        .map_err(UserspaceError::from)?;
    let h1 = match process.new_handle(end1, Rights::default_rw()) {
        Ok(h1) => h1,
        Err(err) => {
            let _ = process.phandles.close_handle(h0);
            return Err(err.into());
        }
    };
    Ok((h0, h1))
}

/// Creates a log handle. LOG_READABLE grants the read side.
pub fn log_create(create_flags: u32) -> Result<HandleValue, UserspaceError> {
    if create_flags & !flags::LOG_READABLE != 0 {
        return Err(UserspaceError::InvalidArgs);
    }
    let process = current_process()?;
    let readable = create_flags & flags::LOG_READABLE != 0;
    let mut rights = Rights::TRANSFER | Rights::WRITE;
    if readable {
        rights |= Rights::READ;
    }
    process
        .new_handle(LogDispatcher::new(readable), rights)
        .map_err(UserspaceError::from)
}

/// Appends a record to the kernel log.
pub fn log_write(
    handle: HandleValue,
    buf_addr: usize,
    buf_len: usize,
    record_flags: u32,
) -> Result<(), UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::WRITE)?;
    let log = downcast_dispatcher::<LogDispatcher>(&dispatcher).map_err(UserspaceError::from)?;
    let payload = copy_from_user(&process, buf_addr, buf_len)?;
    let tid = current_thread().map(|t| t.tid()).unwrap_or(0);
    log.write(record_flags, &payload, process.pid(), tid)
        .map_err(UserspaceError::from)
}

/// Reads the next unread record into `buf`. Returns bytes written.
pub fn log_read(
    handle: HandleValue,
    buf_addr: usize,
    buf_len: usize,
) -> Result<usize, UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::READ)?;
    let log = downcast_dispatcher::<LogDispatcher>(&dispatcher).map_err(UserspaceError::from)?;
    let mut buf = alloc::vec![0; buf_len];
    let n = log.read(&mut buf).map_err(UserspaceError::from)?;
    copy_to_user(&process, buf_addr, &buf[..n])?;
    Ok(n)
}
