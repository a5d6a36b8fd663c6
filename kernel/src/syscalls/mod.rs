//! The syscall surface.
//!
//! Every entry point follows the same recipe: find the current process,
//! validate each user pointer range through its address space, look up
//! each handle under the table lock with the required rights (routing
//! bad values through the process's bad-handle policy), downcast once,
//! run the typed operation, and convert [KernelError] to the stable
//! [UserspaceError] on the way out.
//!
//! The typed functions here are the kernel-side API; [dispatch_syscall]
//! is the numeric ABI layer the arch trap glue feeds registers into.

mod handles;
mod ipc;
mod tasks;

pub use self::handles::*;
pub use self::ipc::*;
pub use self::tasks::*;

use alloc::sync::Arc;
use alloc::vec::Vec;

use borealis_libkern::{nr, HandleValue, Rights};

use crate::error::{KernelError, UserspaceError};
use crate::objects::Dispatcher;
use crate::process::{ProcessStruct, ThreadStruct};
use crate::scheduler;

/// The process the calling thread belongs to.
///
/// Syscalls arrive on a bound thread by construction; an unbound caller
/// is kernel code misusing the surface and gets BadState.
pub(crate) fn current_process() -> Result<Arc<ProcessStruct>, UserspaceError> {
    scheduler::get_current_process().ok_or(UserspaceError::BadState)
}

/// The calling thread.
pub(crate) fn current_thread() -> Result<Arc<ThreadStruct>, UserspaceError> {
    scheduler::get_current_thread().ok_or(UserspaceError::BadState)
}

/// Handle lookup with bad-handle policy routing.
pub(crate) fn lookup_handle(
    process: &Arc<ProcessStruct>,
    value: HandleValue,
    required: Rights,
) -> Result<Arc<dyn Dispatcher>, UserspaceError> {
    lookup_handle_indexed(process, value, required).map(|(_, dispatcher)| dispatcher)
}

/// [lookup_handle], also reporting the arena index for wait
/// registration.
pub(crate) fn lookup_handle_indexed(
    process: &Arc<ProcessStruct>,
    value: HandleValue,
    required: Rights,
) -> Result<(u32, Arc<dyn Dispatcher>), UserspaceError> {
    match process.phandles.lookup_indexed(value, required) {
        Ok((index, dispatcher, _)) => Ok((index, dispatcher)),
        Err(err) => {
            if let KernelError::BadHandle { .. } = err {
                process.on_bad_handle(value);
            }
            Err(err.into())
        }
    }
}

/// Copies `len` bytes in from user memory.
pub(crate) fn copy_from_user(
    process: &ProcessStruct,
    addr: usize,
    len: usize,
) -> Result<Vec<u8>, UserspaceError> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut buf = alloc::vec![0; len];
    process
        .pmemory
        .lock()
        .read_bytes(addr, &mut buf)
        .map_err(UserspaceError::from)?;
    Ok(buf)
}

/// Copies bytes out to user memory.
pub(crate) fn copy_to_user(
    process: &ProcessStruct,
    addr: usize,
    data: &[u8],
) -> Result<(), UserspaceError> {
    if data.is_empty() {
        return Ok(());
    }
    process
        .pmemory
        .lock()
        .write_bytes(addr, data)
        .map_err(UserspaceError::from)
}

/// Reads one user u32.
pub(crate) fn read_user_u32(process: &ProcessStruct, addr: usize) -> Result<u32, UserspaceError> {
    process.pmemory.lock().read_u32(addr).map_err(UserspaceError::from)
}

/// Writes one user u32.
pub(crate) fn write_user_u32(
    process: &ProcessStruct,
    addr: usize,
    value: u32,
) -> Result<(), UserspaceError> {
    process.pmemory.lock().write_u32(addr, value).map_err(UserspaceError::from)
}

/// Writes one user u64 (two aligned words).
pub(crate) fn write_user_u64(
    process: &ProcessStruct,
    addr: usize,
    value: u64,
) -> Result<(), UserspaceError> {
    copy_to_user(process, addr, &value.to_le_bytes())
}

/// Reads one user u64.
pub(crate) fn read_user_u64(process: &ProcessStruct, addr: usize) -> Result<u64, UserspaceError> {
    let bytes = copy_from_user(process, addr, 8)?;
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes);
    Ok(u64::from_le_bytes(word))
}

/// Writes a user array of u32.
pub(crate) fn write_user_u32_array(
    process: &ProcessStruct,
    addr: usize,
    values: &[u32],
) -> Result<(), UserspaceError> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    copy_to_user(process, addr, &bytes)
}

/// Encodes a syscall result as the status word.
fn status_of(result: Result<(), UserspaceError>) -> u32 {
    match result {
        Ok(()) => 0,
        Err(err) => err.make_ret(),
    }
}

/// The numeric ABI entry point.
///
/// `args` are the raw argument registers of the trap frame; out-values
/// go through the user pointers among them. Returns the status word to
/// put in the return register. After the operation, a caller whose
/// thread was killed mid-syscall gets Interrupted instead of its result,
/// and the slot is given a chance to reschedule.
pub fn dispatch_syscall(syscall_nr: u32, args: [usize; 8]) -> u32 {
    let status = status_of(dispatch_inner(syscall_nr, args));
    if scheduler::current_thread_killed() {
        if let Ok(thread) = current_thread() {
            thread.exit();
        }
        return UserspaceError::Interrupted.make_ret();
    }
    scheduler::yield_now();
    status
}

/// The match. Split out so `?` works.
fn dispatch_inner(syscall_nr: u32, args: [usize; 8]) -> Result<(), UserspaceError> {
    match syscall_nr {
        nr::HANDLE_CLOSE => handle_close(args[0] as u32),
        nr::HANDLE_DUPLICATE => {
            let out = handle_duplicate(args[0] as u32, args[1] as u32)?;
            write_user_u32(&*current_process()?, args[2], out)
        }
        nr::HANDLE_REPLACE => {
            let out = handle_replace(args[0] as u32, args[1] as u32)?;
            write_user_u32(&*current_process()?, args[2], out)
        }
        nr::HANDLE_WAIT_ONE => {
            let state = handle_wait_one(args[0] as u32, args[1] as u32, args[2] as u64)?;
            let process = current_process()?;
            write_user_u32(&process, args[3], state.satisfied)?;
            write_user_u32(&process, args[3] + 4, state.satisfiable)
        }
        nr::HANDLE_WAIT_MANY => {
            let index = handle_wait_many(args[0], args[1], args[2], args[3] as u64, args[4])?;
            write_user_u32(&*current_process()?, args[5], index)
        }
        nr::OBJECT_GET_INFO => {
            let written = object_get_info(args[0] as u32, args[1] as u32, args[2], args[3])?;
            write_user_u32(&*current_process()?, args[4], written as u32)
        }
        nr::OBJECT_GET_PROPERTY => {
            let written = object_get_property(args[0] as u32, args[1] as u32, args[2], args[3])?;
            write_user_u32(&*current_process()?, args[4], written as u32)
        }
        nr::OBJECT_SET_PROPERTY => {
            object_set_property(args[0] as u32, args[1] as u32, args[2], args[3])
        }
        nr::OBJECT_SIGNAL => object_signal(args[0] as u32, args[1] as u32, args[2] as u32),
        nr::OBJECT_SIGNAL_PEER => {
            object_signal_peer(args[0] as u32, args[1] as u32, args[2] as u32)
        }
        nr::MSGPIPE_CREATE => {
            let (h0, h1) = msgpipe_create(args[0] as u32)?;
            let process = current_process()?;
            write_user_u32(&process, args[1], h0)?;
            write_user_u32(&process, args[2], h1)
        }
        nr::MSGPIPE_WRITE => {
            msgpipe_write(args[0] as u32, args[1], args[2], args[3], args[4], args[5] as u32)
        }
        nr::MSGPIPE_READ => {
            msgpipe_read(args[0] as u32, args[1], args[2], args[3], args[4], args[5] as u32)
        }
        nr::DATAPIPE_CREATE => {
            let (producer, consumer) = datapipe_create(args[0], args[1])?;
            let process = current_process()?;
            write_user_u32(&process, args[2], producer)?;
            write_user_u32(&process, args[3], consumer)
        }
        nr::DATAPIPE_WRITE => {
            let written = datapipe_write(args[0] as u32, args[1], args[2], args[3] as u32)?;
            write_user_u32(&*current_process()?, args[4], written as u32)
        }
        nr::DATAPIPE_READ => {
            let read = datapipe_read(args[0] as u32, args[1], args[2], args[3] as u32)?;
            write_user_u32(&*current_process()?, args[4], read as u32)
        }
        nr::DATAPIPE_BEGIN_WRITE => {
            let (addr, len) = datapipe_begin_write(args[0] as u32)?;
            let process = current_process()?;
            write_user_u32(&process, args[1], addr as u32)?;
            write_user_u32(&process, args[2], len as u32)
        }
        nr::DATAPIPE_END_WRITE => datapipe_end_write(args[0] as u32, args[1]),
        nr::DATAPIPE_BEGIN_READ => {
            let (addr, len) = datapipe_begin_read(args[0] as u32)?;
            let process = current_process()?;
            write_user_u32(&process, args[1], addr as u32)?;
            write_user_u32(&process, args[2], len as u32)
        }
        nr::DATAPIPE_END_READ => datapipe_end_read(args[0] as u32, args[1]),
        nr::SOCKET_CREATE => {
            let (h0, h1) = socket_create()?;
            let process = current_process()?;
            write_user_u32(&process, args[0], h0)?;
            write_user_u32(&process, args[1], h1)
        }
        nr::SOCKET_WRITE => {
            let written = socket_write(args[0] as u32, args[1], args[2], args[3] as u32)?;
            write_user_u32(&*current_process()?, args[4], written as u32)
        }
        nr::SOCKET_READ => {
            let read = socket_read(args[0] as u32, args[1], args[2], args[3] as u32)?;
            write_user_u32(&*current_process()?, args[4], read as u32)
        }
        nr::PORT_CREATE => {
            let handle = port_create()?;
            write_user_u32(&*current_process()?, args[0], handle)
        }
        nr::PORT_QUEUE => port_queue(args[0] as u32, args[1], args[2]),
        nr::PORT_WAIT => {
            let written = port_wait(args[0] as u32, args[1] as u64, args[2], args[3])?;
            write_user_u32(&*current_process()?, args[4], written as u32)
        }
        nr::PORT_BIND => {
            port_bind(args[0] as u32, args[1] as u64, args[2] as u32, args[3] as u32)
        }
        nr::WAITSET_CREATE => {
            let handle = waitset_create()?;
            write_user_u32(&*current_process()?, args[0], handle)
        }
        nr::WAITSET_ADD => {
            waitset_add(args[0] as u32, args[1] as u64, args[2] as u32, args[3] as u32)
        }
        nr::WAITSET_REMOVE => waitset_remove(args[0] as u32, args[1] as u64),
        nr::WAITSET_WAIT => waitset_wait(args[0] as u32, args[1] as u64, args[2], args[3], args[4]),
        nr::EVENT_CREATE => {
            let handle = event_create()?;
            write_user_u32(&*current_process()?, args[0], handle)
        }
        nr::EVENTPAIR_CREATE => {
            let (h0, h1) = eventpair_create()?;
            let process = current_process()?;
            write_user_u32(&process, args[0], h0)?;
            write_user_u32(&process, args[1], h1)
        }
        nr::VMO_CREATE => {
            let handle = vmo_create(args[0] as u64)?;
            write_user_u32(&*current_process()?, args[1], handle)
        }
        nr::VMO_READ => {
            let read = vmo_read(args[0] as u32, args[1], args[2] as u64, args[3])?;
            write_user_u32(&*current_process()?, args[4], read as u32)
        }
        nr::VMO_WRITE => {
            let written = vmo_write(args[0] as u32, args[1], args[2] as u64, args[3])?;
            write_user_u32(&*current_process()?, args[4], written as u32)
        }
        nr::VMO_GET_SIZE => {
            let size = vmo_get_size(args[0] as u32)?;
            write_user_u64(&*current_process()?, args[1], size)
        }
        nr::VMO_SET_SIZE => vmo_set_size(args[0] as u32, args[1] as u64),
        nr::VMO_OP_RANGE => {
            vmo_op_range(args[0] as u32, args[1] as u32, args[2] as u64, args[3] as u64)
        }
        nr::PROCESS_CREATE => {
            let handle = process_create(args[0], args[1])?;
            write_user_u32(&*current_process()?, args[2], handle)
        }
        nr::PROCESS_START => {
            process_start(args[0] as u32, args[1] as u32, args[2], args[3], args[4], args[5])
        }
        nr::PROCESS_MAP_VM => {
            let addr = process_map_vm(
                args[0] as u32,
                args[1] as u32,
                args[2] as u64,
                args[3],
                args[4],
                args[5] as u32,
            )?;
            write_user_u64(&*current_process()?, args[6], addr as u64)
        }
        nr::PROCESS_UNMAP_VM => process_unmap_vm(args[0] as u32, args[1], args[2]),
        nr::PROCESS_PROTECT_VM => {
            process_protect_vm(args[0] as u32, args[1], args[2], args[3] as u32)
        }
        nr::THREAD_CREATE => {
            let handle = thread_create(args[0] as u32, args[1], args[2])?;
            write_user_u32(&*current_process()?, args[3], handle)
        }
        nr::THREAD_START => {
            thread_start(args[0] as u32, args[1], args[2], args[3], args[4])
        }
        nr::THREAD_EXIT => thread_exit(),
        nr::TASK_KILL => task_kill(args[0] as u32),
        nr::TASK_RESUME => task_resume(args[0] as u32, args[1] as u32),
        nr::TASK_SET_EXCEPTION_PORT => {
            task_set_exception_port(args[0] as u32, args[1] as u32, args[2] as u64)
        }
        nr::FUTEX_WAIT => futex_wait(args[0], args[1] as u32, args[2] as u64),
        nr::FUTEX_WAKE => {
            let woken = futex_wake(args[0], args[1])?;
            write_user_u32(&*current_process()?, args[2], woken as u32)
        }
        nr::FUTEX_REQUEUE => {
            let woken = futex_requeue(args[0], args[1], args[2] as u32, args[3], args[4])?;
            write_user_u32(&*current_process()?, args[5], woken as u32)
        }
        nr::NANOSLEEP => nanosleep(args[0] as u64),
        nr::CURRENT_TIME => {
            let now = current_time();
            write_user_u64(&*current_process()?, args[0], now)
        }
        nr::CPRNG_DRAW => {
            let drawn = cprng_draw(args[0], args[1])?;
            write_user_u32(&*current_process()?, args[2], drawn as u32)
        }
        nr::CPRNG_ADD_ENTROPY => cprng_add_entropy(args[0], args[1]),
        nr::LOG_CREATE => {
            let handle = log_create(args[0] as u32)?;
            write_user_u32(&*current_process()?, args[1], handle)
        }
        nr::LOG_WRITE => log_write(args[0] as u32, args[1], args[2], args[3] as u32),
        nr::LOG_READ => {
            let read = log_read(args[0] as u32, args[1], args[2])?;
            write_user_u32(&*current_process()?, args[3], read as u32)
        }
        unknown => {
            debug!("unknown syscall {:#x}", unknown);
            Err(UserspaceError::NotSupported)
        }
    }
}
