//! Exception ports and fault delivery.
//!
//! The arch layer's fault glue synthesizes a machine context and hands
//! it to [dispatch_user_exception]. The core walks the scopes in order
//! thread → process → system, queues an exception report on the first
//! registered port's message pipe, and parks the faulting thread until a
//! `task_resume`. A NOT_HANDLED resume propagates to the next scope;
//! running out of scopes kills the process.

use alloc::sync::Arc;

use borealis_libkern::object::{exception_type, flags};
use borealis_libkern::wire::{self, ExceptionContext, ExceptionHeader, ExceptionReport};
use borealis_libkern::DEADLINE_INFINITE;

use crate::error::KernelError;
use crate::event::{WaitEvent, WaitResult};
use crate::objects::{HandleList, MessagePacket, MessagePipeEnd};
use crate::process::{ProcessStruct, ThreadStruct};
use crate::sync::SpinLock;

/// A registered exception port: a message pipe end plus the key stamped
/// on every report sent through it.
#[derive(Clone)]
pub struct ExceptionPort {
    /// The registered pipe end; reports are written through it to the
    /// handler holding the other end.
    pipe: Arc<MessagePipeEnd>,
    /// Key identifying this registration to the handler.
    key: u64,
}

impl core::fmt::Debug for ExceptionPort {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ExceptionPort {{ key: {} }}", self.key)
    }
}

impl ExceptionPort {
    /// Creates a registration.
    pub fn new(pipe: Arc<MessagePipeEnd>, key: u64) -> ExceptionPort {
        ExceptionPort { pipe, key }
    }

    /// The registration key.
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Queues `report` through the pipe. A dead or full pipe reports the
    /// error; the report is dropped either way.
    fn post(&self, report: &ExceptionReport) -> Result<(), KernelError> {
        let packet = MessagePacket {
            data: wire::as_bytes(report).to_vec(),
            handles: HandleList::new(),
        };
        self.pipe.write(packet).map_err(|(err, _)| err)
    }
}

lazy_static! {
    /// The system-scope exception port.
    static ref SYSTEM_EXCEPTION_PORT: SpinLock<Option<ExceptionPort>> = SpinLock::new(None);
}

/// Installs the system-scope port. At most one; replacing requires
/// clearing first.
pub fn set_system_exception_port(port: ExceptionPort) -> Result<(), KernelError> {
    let mut slot = SYSTEM_EXCEPTION_PORT.lock();
    if slot.is_some() {
        return Err(KernelError::already_bound());
    }
    *slot = Some(port);
    Ok(())
}

/// Clears the system-scope port.
pub fn clear_system_exception_port() {
    *SYSTEM_EXCEPTION_PORT.lock() = None;
}

/// The system-scope port, if any.
pub fn system_exception_port() -> Option<ExceptionPort> {
    SYSTEM_EXCEPTION_PORT.lock().clone()
}

/// How a dispatched exception ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionOutcome {
    /// A handler resumed the thread; it continues from the faulting
    /// instruction.
    Resumed,
    /// No handler took the fault; the process was killed.
    Killed,
}

/// Builds the wire report for a fault.
fn build_report(
    thread: &ThreadStruct,
    extype: u32,
    pc: u64,
    fault_address: u64,
    regs: [u64; 8],
) -> ExceptionReport {
    ExceptionReport {
        header: ExceptionHeader {
            size: core::mem::size_of::<ExceptionReport>() as u32,
            extype,
        },
        context: ExceptionContext {
            // Single modeled architecture.
            arch_id: 1,
            subtype: extype,
            pid: thread.process.pid(),
            tid: thread.tid(),
            pc,
            fault_address,
            regs,
        },
    }
}

/// Delivers a fault on `thread` through the scope chain, blocking the
/// thread while a handler examines it.
///
/// Must run on the faulting thread itself, exactly as the arch glue
/// would call it from the trap path.
pub fn dispatch_user_exception(
    thread: &Arc<ThreadStruct>,
    extype: u32,
    pc: u64,
    fault_address: u64,
    regs: [u64; 8],
) -> ExceptionOutcome {
    let report = build_report(thread, extype, pc, fault_address, regs);
    let scopes = [
        thread.exception_port(),
        thread.process.exception_port(),
        system_exception_port(),
    ];
    for port in scopes.iter().flatten() {
        // Arm the resume slot before the report is visible, so a handler
        // that reacts instantly still finds somebody to resume.
        let event = WaitEvent::new();
        *thread.exception_resume.lock() = Some(event.clone());
        if port.post(&report).is_err() {
            // Handler went away; its scope no longer counts.
            *thread.exception_resume.lock() = None;
            continue;
        }
        let (result, resume_flags) = event.wait(DEADLINE_INFINITE);
        *thread.exception_resume.lock() = None;
        match result {
            WaitResult::Satisfied
                if resume_flags & u64::from(flags::RESUME_NOT_HANDLED) != 0 =>
            {
                continue;
            }
            WaitResult::Satisfied => return ExceptionOutcome::Resumed,
            // Teardown while parked in a fault: the thread dies with the
            // process, nothing left to deliver.
            _ => return ExceptionOutcome::Killed,
        }
    }
    warn!(
        "unhandled exception {} in thread {} of process {}, killing process",
        extype,
        thread.tid(),
        thread.process.pid()
    );
    thread.process.kill();
    ExceptionOutcome::Killed
}

/// Resumes a thread parked in [dispatch_user_exception].
///
/// `resume_flags` is the raw `task_resume` flag word; NOT_HANDLED sends
/// the fault on to the next scope. BadState when the thread is not
/// parked in a fault.
pub fn resume_thread(thread: &ThreadStruct, resume_flags: u32) -> Result<(), KernelError> {
    let event = thread
        .exception_resume
        .lock()
        .clone()
        .ok_or_else(KernelError::bad_state)?;
    event.signal(WaitResult::Satisfied, u64::from(resume_flags));
    Ok(())
}

/// Reports a process exit to the process- and system-scope ports.
/// Nobody blocks on these; they exist so a debugger observes deaths.
pub fn notify_process_exit(process: &Arc<ProcessStruct>) {
    let report = ExceptionReport {
        header: ExceptionHeader {
            size: core::mem::size_of::<ExceptionReport>() as u32,
            extype: exception_type::PROCESS_EXIT,
        },
        context: ExceptionContext {
            arch_id: 1,
            subtype: exception_type::PROCESS_EXIT,
            pid: process.pid(),
            tid: 0,
            pc: 0,
            fault_address: 0,
            regs: [0; 8],
        },
    };
    for port in [process.exception_port(), system_exception_port()].iter().flatten() {
        let _ = port.post(&report);
    }
}
