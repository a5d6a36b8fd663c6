//! Threads.
//!
//! A [ThreadStruct] is bound to one process for life. Its own state
//! machine is INITIAL → RUNNING → DYING → DEAD; the tracker raises
//! SIGNALED at exit, which is what `handle_wait_one` on a thread handle
//! observes. The register file only records what `thread_start` was
//! given: executing it is the arch layer's job, modeled by
//! [scheduler::spawn_on_host](crate::scheduler::spawn_on_host).

use alloc::string::String;
use alloc::sync::Arc;
use core::any::Any;

use atomic::{Atomic, Ordering};

use borealis_libkern::{ObjectType, Signals, MAX_NAME_LEN};

use crate::error::KernelError;
use crate::event::WaitEvent;
use crate::exception::ExceptionPort;
use crate::objects::{Dispatcher, KObjectBase, StaticObjectType};
use crate::process::ProcessStruct;
use crate::sync::SpinLock;

/// The thread lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created, never started.
    Initial,
    /// Started.
    Running,
    /// Asked to stop; unwinding.
    Dying,
    /// Gone.
    Dead,
}

/// The initial register file recorded by `thread_start`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterFile {
    /// Entry point.
    pub pc: usize,
    /// Stack pointer.
    pub sp: usize,
    /// First opaque argument register.
    pub arg1: usize,
    /// Second opaque argument register.
    pub arg2: usize,
}

/// A thread.
pub struct ThreadStruct {
    /// Base with the tracker; SIGNALED fires at exit.
    base: KObjectBase,
    /// The owning process. Fixed for life.
    pub process: Arc<ProcessStruct>,
    /// Lifecycle state.
    state: Atomic<ThreadState>,
    /// Registers recorded at start.
    registers: SpinLock<RegisterFile>,
    /// The wait event this thread is currently parked on, if any.
    /// Teardown fires it with an Interrupted outcome.
    pub(crate) blocked_on: SpinLock<Option<Arc<WaitEvent>>>,
    /// The thread-scope exception port slot.
    exception_port: SpinLock<Option<ExceptionPort>>,
    /// The wait a faulted thread parks on until `task_resume`.
    pub(crate) exception_resume: SpinLock<Option<Arc<WaitEvent>>>,
    /// Thread name.
    name: SpinLock<String>,
}

impl core::fmt::Debug for ThreadStruct {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "ThreadStruct {{ koid: {}, process: {}, state: {:?} }}",
            self.base.koid(),
            self.process.pid(),
            self.state.load(Ordering::Acquire)
        )
    }
}

impl ThreadStruct {
    /// Creates a thread in `process`. Fails BadState once the process is
    /// dying.
    pub fn new(process: &Arc<ProcessStruct>, name: &str) -> Result<Arc<ThreadStruct>, KernelError> {
        if name.len() > MAX_NAME_LEN {
            return Err(KernelError::invalid_size(name.len()));
        }
        let thread = Arc::new(ThreadStruct {
            base: KObjectBase::waitable(Signals::empty(), Signals::SIGNALED),
            process: process.clone(),
            state: Atomic::new(ThreadState::Initial),
            registers: SpinLock::new(RegisterFile::default()),
            blocked_on: SpinLock::new(None),
            exception_port: SpinLock::new(None),
            exception_resume: SpinLock::new(None),
            name: SpinLock::new(String::from(name)),
        });
        process.add_thread(&thread)?;
        Ok(thread)
    }

    /// The thread koid.
    pub fn tid(&self) -> u64 {
        self.base.koid()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ThreadState {
        self.state.load(Ordering::Acquire)
    }

    /// Whether teardown started.
    pub fn is_dying(&self) -> bool {
        match self.state() {
            ThreadState::Dying | ThreadState::Dead => true,
            _ => false,
        }
    }

    /// The thread name.
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Renames the thread.
    pub fn set_name(&self, name: &str) -> Result<(), KernelError> {
        if name.len() > MAX_NAME_LEN {
            return Err(KernelError::invalid_size(name.len()));
        }
        *self.name.lock() = String::from(name);
        Ok(())
    }

    /// Starts the thread: records `(pc, sp, arg1, arg2)` in the initial
    /// register file and goes INITIAL → RUNNING. Starting twice is
    /// BadState.
    pub fn start(&self, pc: usize, sp: usize, arg1: usize, arg2: usize) -> Result<(), KernelError> {
        *self.registers.lock() = RegisterFile { pc, sp, arg1, arg2 };
        self.state
            .compare_exchange(
                ThreadState::Initial,
                ThreadState::Running,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| KernelError::bad_state())?;
        Ok(())
    }

    /// The recorded initial register file.
    pub fn registers(&self) -> RegisterFile {
        *self.registers.lock()
    }

    /// Completes this thread's life: DEAD, SIGNALED, unlink from the
    /// process. Idempotent.
    pub fn exit(self: &Arc<Self>) {
        let previous = self.state.swap(ThreadState::Dead, Ordering::AcqRel);
        if previous == ThreadState::Dead {
            return;
        }
        self.base
            .tracker()
            .expect("threads always carry a tracker")
            .update_satisfied(Signals::empty(), Signals::SIGNALED);
        self.process.on_thread_exit(self);
    }

    /// Asks the thread to stop: marks it dying and converts its
    /// outstanding wait, if any, into an Interrupted outcome.
    ///
    /// A thread that never started has nothing to unwind and exits here;
    /// a running one exits when its execution reaches the next syscall
    /// boundary.
    pub fn kill(self: &Arc<Self>) {
        let previous = self.state.compare_exchange(
            ThreadState::Running,
            ThreadState::Dying,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        match previous {
            Ok(_) => {
                let blocker = self.blocked_on.lock().clone();
                if let Some(event) = blocker {
                    event.signal(crate::event::WaitResult::Interrupted, 0);
                }
            }
            Err(ThreadState::Initial) => {
                self.exit();
            }
            Err(_) => (),
        }
    }

    /// The thread-scope exception port slot.
    pub fn set_exception_port(&self, port: ExceptionPort) -> Result<(), KernelError> {
        let mut slot = self.exception_port.lock();
        if slot.is_some() {
            return Err(KernelError::already_bound());
        }
        *slot = Some(port);
        Ok(())
    }

    /// Clears the exception port slot.
    pub fn clear_exception_port(&self) {
        *self.exception_port.lock() = None;
    }

    /// The registered exception port, if any.
    pub fn exception_port(&self) -> Option<ExceptionPort> {
        self.exception_port.lock().clone()
    }
}

impl Dispatcher for ThreadStruct {
    fn base(&self) -> &KObjectBase {
        &self.base
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::THREAD
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn allowed_user_signals(&self) -> Signals {
        Signals::user_all()
    }

    fn related_koid(&self) -> u64 {
        self.process.pid()
    }
}

impl StaticObjectType for ThreadStruct {
    fn static_object_type() -> ObjectType {
        ObjectType::THREAD
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessState;

    #[test]
    fn start_once() {
        crate::init();
        let process = ProcessStruct::new("p").unwrap();
        let thread = ThreadStruct::new(&process, "t").unwrap();
        assert_eq!(thread.state(), ThreadState::Initial);

        process.start(&thread, 0x1000, 0x2000, 1, 2).unwrap();
        assert_eq!(thread.state(), ThreadState::Running);
        assert_eq!(process.state(), ProcessState::Running);
        let regs = thread.registers();
        assert_eq!((regs.pc, regs.sp, regs.arg1, regs.arg2), (0x1000, 0x2000, 1, 2));

        // Starting again, on either object, is refused.
        assert!(thread.start(0, 0, 0, 0).is_err());
        assert!(process.start(&thread, 0, 0, 0, 0).is_err());
    }

    #[test]
    fn exit_signals_and_kills_process() {
        crate::init();
        let process = ProcessStruct::new("p").unwrap();
        let thread = ThreadStruct::new(&process, "t").unwrap();
        process.start(&thread, 0, 0, 0, 0).unwrap();

        thread.exit();
        assert_eq!(thread.state(), ThreadState::Dead);
        assert!(thread
            .base()
            .tracker()
            .unwrap()
            .state()
            .satisfied()
            .contains(Signals::SIGNALED));
        // Last thread gone: the process died with it.
        assert_eq!(process.state(), ProcessState::Dead);
    }

    #[test]
    fn no_new_threads_once_dying() {
        crate::init();
        let process = ProcessStruct::new("p").unwrap();
        let thread = ThreadStruct::new(&process, "t").unwrap();
        process.start(&thread, 0, 0, 0, 0).unwrap();
        process.exit(0);
        assert!(matches!(
            ThreadStruct::new(&process, "late"),
            Err(KernelError::BadState { .. })
        ));
    }

    #[test]
    fn kill_interrupts_blocker() {
        crate::init();
        let process = ProcessStruct::new("p").unwrap();
        let thread = ThreadStruct::new(&process, "t").unwrap();
        process.start(&thread, 0, 0, 0, 0).unwrap();

        let event = WaitEvent::new();
        *thread.blocked_on.lock() = Some(event.clone());
        thread.kill();
        assert_eq!(event.wait(0).0, crate::event::WaitResult::Interrupted);
        assert!(thread.is_dying());
    }
}
