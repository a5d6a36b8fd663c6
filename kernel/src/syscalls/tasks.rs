//! Task, memory, futex, time and entropy syscalls.

use borealis_libkern::object::{flags, MemoryPermissions, VmoOp};
use borealis_libkern::{HandleValue, Rights, MAX_CPRNG_DRAW, MAX_NAME_LEN};

use crate::cprng;
use crate::error::UserspaceError;
use crate::event::{WaitEvent, WaitResult};
use crate::exception::{self, ExceptionPort};
use crate::objects::{downcast_dispatcher, MessagePipeEnd, VmObject};
use crate::process::{ProcessStruct, ThreadStruct};
use crate::syscalls::{
    copy_from_user, copy_to_user, current_process, current_thread, lookup_handle,
};
use crate::timer;

/// Rights a fresh process or thread handle carries.
fn task_rights() -> Rights {
    Rights::default_rw() | Rights::TRANSFER
}

/// Rights a fresh vmo handle carries.
fn vmo_rights() -> Rights {
    Rights::DUPLICATE
        | Rights::TRANSFER
        | Rights::READ
        | Rights::WRITE
        | Rights::MAP
        | Rights::GET_PROPERTY
        | Rights::SET_PROPERTY
}

/// Creates a vm object of `size` bytes.
pub fn vmo_create(size: u64) -> Result<HandleValue, UserspaceError> {
    let process = current_process()?;
    let vmo = VmObject::new(size as usize).map_err(UserspaceError::from)?;
    process.new_handle(vmo, vmo_rights()).map_err(UserspaceError::from)
}

/// Copies bytes out of a vmo. Returns the bytes read.
pub fn vmo_read(
    handle: HandleValue,
    buf_addr: usize,
    offset: u64,
    len: usize,
) -> Result<usize, UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::READ)?;
    let vmo = downcast_dispatcher::<VmObject>(&dispatcher).map_err(UserspaceError::from)?;
    let mut buf = alloc::vec![0; len];
    vmo.read(offset as usize, &mut buf).map_err(UserspaceError::from)?;
    copy_to_user(&process, buf_addr, &buf)?;
    Ok(len)
}

/// Copies bytes into a vmo. Returns the bytes written.
pub fn vmo_write(
    handle: HandleValue,
    buf_addr: usize,
    offset: u64,
    len: usize,
) -> Result<usize, UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::WRITE)?;
    let vmo = downcast_dispatcher::<VmObject>(&dispatcher).map_err(UserspaceError::from)?;
    let data = copy_from_user(&process, buf_addr, len)?;
    vmo.write(offset as usize, &data).map_err(UserspaceError::from)?;
    Ok(len)
}

/// The vmo's current size.
pub fn vmo_get_size(handle: HandleValue) -> Result<u64, UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::READ)?;
    let vmo = downcast_dispatcher::<VmObject>(&dispatcher).map_err(UserspaceError::from)?;
    Ok(vmo.size() as u64)
}

/// Resizes the vmo.
pub fn vmo_set_size(handle: HandleValue, size: u64) -> Result<(), UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::WRITE)?;
    let vmo = downcast_dispatcher::<VmObject>(&dispatcher).map_err(UserspaceError::from)?;
    vmo.set_size(size as usize).map_err(UserspaceError::from)
}

/// Runs a range op on the vmo.
pub fn vmo_op_range(
    handle: HandleValue,
    op: u32,
    offset: u64,
    len: u64,
) -> Result<(), UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::WRITE)?;
    let vmo = downcast_dispatcher::<VmObject>(&dispatcher).map_err(UserspaceError::from)?;
    vmo.op_range(VmoOp(op), offset as usize, len as usize)
        .map_err(UserspaceError::from)
}

/// Creates a process named by the user string at `name_addr`.
pub fn process_create(name_addr: usize, name_len: usize) -> Result<HandleValue, UserspaceError> {
    let process = current_process()?;
    if name_len > MAX_NAME_LEN {
        return Err(UserspaceError::InvalidArgs);
    }
    let bytes = copy_from_user(&process, name_addr, name_len)?;
    let name = core::str::from_utf8(&bytes).map_err(|_| UserspaceError::InvalidArgs)?;
    let new_process = ProcessStruct::new(name).map_err(UserspaceError::from)?;
    process
        .new_handle(new_process, task_rights())
        .map_err(UserspaceError::from)
}

/// Starts a process on its first thread.
pub fn process_start(
    process_handle: HandleValue,
    thread_handle: HandleValue,
    pc: usize,
    sp: usize,
    arg1: usize,
    arg2: usize,
) -> Result<(), UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, process_handle, Rights::WRITE)?;
    let target = downcast_dispatcher::<ProcessStruct>(&dispatcher).map_err(UserspaceError::from)?;
    let dispatcher = lookup_handle(&process, thread_handle, Rights::WRITE)?;
    let thread = downcast_dispatcher::<ThreadStruct>(&dispatcher).map_err(UserspaceError::from)?;
    target
        .start(&thread, pc, sp, arg1, arg2)
        .map_err(UserspaceError::from)
}

/// Checks that the caller's vmo handle rights cover the mapping
/// permissions it asks for.
fn check_map_rights(rights: Rights, perms: MemoryPermissions) -> Result<(), UserspaceError> {
    if !rights.allows(Rights::MAP) {
        return Err(UserspaceError::AccessDenied);
    }
    if perms.contains(MemoryPermissions::READ) && !rights.allows(Rights::READ) {
        return Err(UserspaceError::AccessDenied);
    }
    if perms.contains(MemoryPermissions::WRITE) && !rights.allows(Rights::WRITE) {
        return Err(UserspaceError::AccessDenied);
    }
    if perms.contains(MemoryPermissions::EXECUTE) && !rights.allows(Rights::EXECUTE) {
        return Err(UserspaceError::AccessDenied);
    }
    Ok(())
}

/// Maps a vmo window into a process address space. Returns the mapped
/// address.
pub fn process_map_vm(
    process_handle: HandleValue,
    vmo_handle: HandleValue,
    vmo_offset: u64,
    len: usize,
    addr_hint: usize,
    perm_bits: u32,
) -> Result<usize, UserspaceError> {
    let process = current_process()?;
    let perms = MemoryPermissions::from_bits(perm_bits).ok_or(UserspaceError::InvalidArgs)?;
    let dispatcher = lookup_handle(&process, process_handle, Rights::WRITE)?;
    let target = downcast_dispatcher::<ProcessStruct>(&dispatcher).map_err(UserspaceError::from)?;
    let (vmo_dispatcher, vmo_rights) = process
        .phandles
        .lookup_with_rights(vmo_handle, Rights::empty())
        .map_err(UserspaceError::from)?;
    let vmo = downcast_dispatcher::<VmObject>(&vmo_dispatcher).map_err(UserspaceError::from)?;
    check_map_rights(vmo_rights, perms)?;
    let addr = target
        .pmemory
        .lock()
        .map_vmo(vmo, vmo_offset as usize, len, perms, addr_hint)
        .map_err(UserspaceError::from)?;
    Ok(addr.addr())
}

/// Unmaps a mapping from a process address space.
pub fn process_unmap_vm(
    process_handle: HandleValue,
    addr: usize,
    len: usize,
) -> Result<(), UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, process_handle, Rights::WRITE)?;
    let target = downcast_dispatcher::<ProcessStruct>(&dispatcher).map_err(UserspaceError::from)?;
    let result = target.pmemory.lock().unmap(addr, len).map_err(UserspaceError::from);
    result
}

/// Changes the permissions of a mapping.
pub fn process_protect_vm(
    process_handle: HandleValue,
    addr: usize,
    len: usize,
    perm_bits: u32,
) -> Result<(), UserspaceError> {
    let process = current_process()?;
    let perms = MemoryPermissions::from_bits(perm_bits).ok_or(UserspaceError::InvalidArgs)?;
    let dispatcher = lookup_handle(&process, process_handle, Rights::WRITE)?;
    let target = downcast_dispatcher::<ProcessStruct>(&dispatcher).map_err(UserspaceError::from)?;
    let result = target
        .pmemory
        .lock()
        .protect(addr, len, perms)
        .map_err(UserspaceError::from);
    result
}

/// Creates a thread in the target process.
pub fn thread_create(
    process_handle: HandleValue,
    name_addr: usize,
    name_len: usize,
) -> Result<HandleValue, UserspaceError> {
    let process = current_process()?;
    if name_len > MAX_NAME_LEN {
        return Err(UserspaceError::InvalidArgs);
    }
    let bytes = copy_from_user(&process, name_addr, name_len)?;
    let name = core::str::from_utf8(&bytes).map_err(|_| UserspaceError::InvalidArgs)?;
    let dispatcher = lookup_handle(&process, process_handle, Rights::WRITE)?;
    let target = downcast_dispatcher::<ProcessStruct>(&dispatcher).map_err(UserspaceError::from)?;
    let thread = ThreadStruct::new(&target, name).map_err(UserspaceError::from)?;
    process.new_handle(thread, task_rights()).map_err(UserspaceError::from)
}

/// Starts a thread.
pub fn thread_start(
    thread_handle: HandleValue,
    pc: usize,
    sp: usize,
    arg1: usize,
    arg2: usize,
) -> Result<(), UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, thread_handle, Rights::WRITE)?;
    let thread = downcast_dispatcher::<ThreadStruct>(&dispatcher).map_err(UserspaceError::from)?;
    thread.start(pc, sp, arg1, arg2).map_err(UserspaceError::from)
}

/// Exits the calling thread.
pub fn thread_exit() -> Result<(), UserspaceError> {
    let thread = current_thread()?;
    thread.exit();
    Ok(())
}

/// Kills a process or a thread.
pub fn task_kill(handle: HandleValue) -> Result<(), UserspaceError> {
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, handle, Rights::WRITE)?;
    if let Ok(target) = downcast_dispatcher::<ProcessStruct>(&dispatcher) {
        target.kill();
        return Ok(());
    }
    if let Ok(target) = downcast_dispatcher::<ThreadStruct>(&dispatcher) {
        target.kill();
        return Ok(());
    }
    Err(UserspaceError::WrongType)
}

/// Resumes a thread parked in exception delivery.
pub fn task_resume(thread_handle: HandleValue, resume_flags: u32) -> Result<(), UserspaceError> {
    if resume_flags & !flags::RESUME_NOT_HANDLED != 0 {
        return Err(UserspaceError::InvalidArgs);
    }
    let process = current_process()?;
    let dispatcher = lookup_handle(&process, thread_handle, Rights::WRITE)?;
    let thread = downcast_dispatcher::<ThreadStruct>(&dispatcher).map_err(UserspaceError::from)?;
    exception::resume_thread(&thread, resume_flags).map_err(UserspaceError::from)
}

/// Installs or clears an exception port.
///
/// `task_handle` names a process or a thread; 0 addresses the system
/// scope. A zero `pipe_handle` clears the scope's port; installing over
/// an existing one is refused.
pub fn task_set_exception_port(
    task_handle: HandleValue,
    pipe_handle: HandleValue,
    key: u64,
) -> Result<(), UserspaceError> {
    let process = current_process()?;

    let port = if pipe_handle == 0 {
        None
    } else {
        let dispatcher = lookup_handle(&process, pipe_handle, Rights::WRITE)?;
        let pipe =
            downcast_dispatcher::<MessagePipeEnd>(&dispatcher).map_err(UserspaceError::from)?;
        Some(ExceptionPort::new(pipe, key))
    };

    if task_handle == 0 {
        return match port {
            Some(port) => exception::set_system_exception_port(port).map_err(UserspaceError::from),
            None => {
                exception::clear_system_exception_port();
                Ok(())
            }
        };
    }

    let dispatcher = lookup_handle(&process, task_handle, Rights::WRITE)?;
    if let Ok(target) = downcast_dispatcher::<ProcessStruct>(&dispatcher) {
        return match port {
            Some(port) => target.set_exception_port(port).map_err(UserspaceError::from),
            None => {
                target.clear_exception_port();
                Ok(())
            }
        };
    }
    if let Ok(target) = downcast_dispatcher::<ThreadStruct>(&dispatcher) {
        return match port {
            Some(port) => target.set_exception_port(port).map_err(UserspaceError::from),
            None => {
                target.clear_exception_port();
                Ok(())
            }
        };
    }
    Err(UserspaceError::WrongType)
}

/// Compare-and-park on a user word.
pub fn futex_wait(addr: usize, expected: u32, timeout_ns: u64) -> Result<(), UserspaceError> {
    let process = current_process()?;
    process
        .futex_ctx
        .wait(&process.pmemory, addr, expected, timeout_ns)
        .map_err(UserspaceError::from)
}

/// Wakes up to `count` futex waiters. Returns how many were woken.
pub fn futex_wake(addr: usize, count: usize) -> Result<usize, UserspaceError> {
    let process = current_process()?;
    Ok(process.futex_ctx.wake(addr, count))
}

/// Futex wake-and-requeue. Returns how many were woken.
pub fn futex_requeue(
    addr_wake: usize,
    wake_count: usize,
    expected: u32,
    addr_requeue: usize,
    requeue_count: usize,
) -> Result<usize, UserspaceError> {
    let process = current_process()?;
    process
        .futex_ctx
        .requeue(
            &process.pmemory,
            addr_wake,
            wake_count,
            expected,
            addr_requeue,
            requeue_count,
        )
        .map_err(UserspaceError::from)
}

/// Sleeps for `ns` nanoseconds. Interruptible by task teardown.
pub fn nanosleep(ns: u64) -> Result<(), UserspaceError> {
    let event = WaitEvent::new();
    match event.wait(ns).0 {
        WaitResult::Interrupted => Err(UserspaceError::Interrupted),
        _ => Ok(()),
    }
}

/// Nanoseconds since boot.
pub fn current_time() -> u64 {
    timer::current_time_ns()
}

/// Fills a user buffer with CPRNG bytes. Returns the bytes written.
pub fn cprng_draw(buf_addr: usize, len: usize) -> Result<usize, UserspaceError> {
    let process = current_process()?;
    if len > MAX_CPRNG_DRAW {
        return Err(UserspaceError::InvalidArgs);
    }
    let mut buf = alloc::vec![0; len];
    cprng::draw(&mut buf);
    copy_to_user(&process, buf_addr, &buf)?;
    Ok(len)
}

/// Mixes user bytes into the CPRNG pool.
pub fn cprng_add_entropy(buf_addr: usize, len: usize) -> Result<(), UserspaceError> {
    let process = current_process()?;
    if len > MAX_CPRNG_DRAW {
        return Err(UserspaceError::InvalidArgs);
    }
    let bytes = copy_from_user(&process, buf_addr, len)?;
    cprng::add_entropy(&bytes);
    Ok(())
}
