//! Processes.
//!
//! A [ProcessStruct] owns everything a task can reach: its handle table
//! and value secret, its modeled address space, its futex context, its
//! threads and its exception port slot. The state machine is
//! INITIAL → RUNNING → DYING → DEAD; handle operations stop working at
//! DEAD, thread creation stops at DYING, and the transition to DEAD
//! (last thread gone) drains the table, tears down the address space,
//! raises SIGNALED and reports the exit to the exception ports.

mod thread;

pub use self::thread::{ThreadState, ThreadStruct};

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::any::Any;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use borealis_libkern::{HandlePolicy, HandleValue, ObjectType, Rights, Signals, MAX_NAME_LEN};

use crate::error::KernelError;
use crate::exception::{self, ExceptionPort};
use crate::futex::FutexContext;
use crate::handle::{arena, ProcessHandleTable};
use crate::objects::{Dispatcher, KObjectBase, StaticObjectType};
use crate::sync::SpinLock;
use crate::vmm::ProcessMemory;

/// The process lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Created, never started.
    Initial,
    /// Started and live.
    Running,
    /// Exiting or killed; threads are being stopped.
    Dying,
    /// Fully torn down.
    Dead,
}

/// Everybody with a live [ProcessStruct], for diagnostics.
lazy_static! {
    static ref PROCESS_LIST: SpinLock<Vec<Weak<ProcessStruct>>> = SpinLock::new(Vec::new());
}

/// A process.
pub struct ProcessStruct {
    /// Base with the tracker; SIGNALED fires at DEAD.
    base: KObjectBase,
    /// Process name, for diagnostics and the NAME property.
    name: SpinLock<String>,
    /// The state machine, with the retcode that DYING carries to DEAD.
    pstate: SpinLock<PState>,
    /// Exit code, readable after death without taking pstate.
    retcode: AtomicI32,
    /// The handle table.
    pub phandles: ProcessHandleTable,
    /// The modeled address space.
    pub pmemory: SpinLock<ProcessMemory>,
    /// The futex context.
    pub futex_ctx: FutexContext,
    /// Live threads.
    threads: SpinLock<Vec<Weak<ThreadStruct>>>,
    /// The process-scope exception port slot.
    exception_port: SpinLock<Option<ExceptionPort>>,
    /// Bad-handle policy, a raw [HandlePolicy] word.
    policy: AtomicU32,
}

/// Guarded part of the state machine.
#[derive(Debug)]
struct PState {
    /// Current state.
    state: ProcessState,
}

impl core::fmt::Debug for ProcessStruct {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "ProcessStruct {{ koid: {}, name: {:?} }}",
            self.base.koid(),
            &*self.name.lock()
        )
    }
}

impl ProcessStruct {
    /// Creates a process in INITIAL with a fresh address space, handle
    /// table and value secret.
    pub fn new(name: &str) -> Result<Arc<ProcessStruct>, KernelError> {
        if name.len() > MAX_NAME_LEN {
            return Err(KernelError::invalid_size(name.len()));
        }
        let base = KObjectBase::waitable(Signals::empty(), Signals::SIGNALED);
        let koid = base.koid();
        let process = Arc::new(ProcessStruct {
            base,
            name: SpinLock::new(String::from(name)),
            pstate: SpinLock::new(PState {
                state: ProcessState::Initial,
            }),
            retcode: AtomicI32::new(0),
            phandles: ProcessHandleTable::new(koid),
            pmemory: SpinLock::new(ProcessMemory::new()),
            futex_ctx: FutexContext::new(),
            threads: SpinLock::new(Vec::new()),
            exception_port: SpinLock::new(None),
            policy: AtomicU32::new(HandlePolicy::IGNORE.0),
        });
        let mut list = PROCESS_LIST.lock();
        list.retain(|weak| weak.upgrade().is_some());
        list.push(Arc::downgrade(&process));
        info!("created process {} ({:?})", koid, name);
        Ok(process)
    }

    /// The process koid, which is also the owner id its handles carry.
    pub fn pid(&self) -> u64 {
        self.base.koid()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        self.pstate.lock().state
    }

    /// The exit code. Meaningful once dead.
    pub fn retcode(&self) -> i32 {
        self.retcode.load(Ordering::Acquire)
    }

    /// The process name.
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Renames the process.
    pub fn set_name(&self, name: &str) -> Result<(), KernelError> {
        if name.len() > MAX_NAME_LEN {
            return Err(KernelError::invalid_size(name.len()));
        }
        *self.name.lock() = String::from(name);
        Ok(())
    }

    /// The bad-handle policy.
    pub fn policy(&self) -> HandlePolicy {
        HandlePolicy(self.policy.load(Ordering::Acquire))
    }

    /// Sets the bad-handle policy. An out-of-range word is rejected and
    /// the previous policy stays.
    pub fn set_policy(&self, raw: u32) -> Result<(), KernelError> {
        if raw > HandlePolicy::EXIT.0 {
            return Err(KernelError::invalid_combination());
        }
        self.policy.store(raw, Ordering::Release);
        Ok(())
    }

    /// Starts the process: INITIAL → RUNNING, then starts `thread` at
    /// `(pc, sp)` with two opaque arguments.
    pub fn start(
        self: &Arc<Self>,
        thread: &Arc<ThreadStruct>,
        pc: usize,
        sp: usize,
        arg1: usize,
        arg2: usize,
    ) -> Result<(), KernelError> {
        if !Arc::ptr_eq(&thread.process, self) {
            return Err(KernelError::invalid_combination());
        }
        {
            let mut pstate = self.pstate.lock();
            if pstate.state != ProcessState::Initial {
                return Err(KernelError::bad_state());
            }
            pstate.state = ProcessState::Running;
        }
        thread.start(pc, sp, arg1, arg2)
    }

    /// Requests an orderly exit with `code`: RUNNING/INITIAL → DYING and
    /// every thread is asked to stop. The transition to DEAD happens
    /// when the last thread unlinks.
    pub fn exit(self: &Arc<Self>, code: i32) {
        let threads = {
            let mut pstate = self.pstate.lock();
            if pstate.state == ProcessState::Dying || pstate.state == ProcessState::Dead {
                return;
            }
            self.retcode.store(code, Ordering::Release);
            pstate.state = ProcessState::Dying;
            self.threads.lock().clone()
        };
        info!("process {} exiting with code {}", self.pid(), code);
        // Futex parkers first: they are this process's own threads, and
        // they cannot unlink while parked.
        self.futex_ctx.wake_all();
        let mut any_live = false;
        for weak in threads {
            if let Some(thread) = weak.upgrade() {
                any_live = true;
                thread.kill();
            }
        }
        if !any_live {
            // No thread will ever unlink; finalize here.
            self.finalize_dead();
        }
    }

    /// Kills the process. Same path as [exit](Self::exit) with the
    /// kill retcode.
    pub fn kill(self: &Arc<Self>) {
        self.exit(-1);
    }

    /// Links a new thread. Refused once DYING.
    pub(crate) fn add_thread(&self, thread: &Arc<ThreadStruct>) -> Result<(), KernelError> {
        let pstate = self.pstate.lock();
        match pstate.state {
            ProcessState::Dying | ProcessState::Dead => Err(KernelError::bad_state()),
            _ => {
                self.threads.lock().push(Arc::downgrade(thread));
                Ok(())
            }
        }
    }

    /// Unlinks an exited thread; the last unlink takes the process to
    /// DEAD.
    pub(crate) fn on_thread_exit(self: &Arc<Self>, thread: &ThreadStruct) {
        let now_empty = {
            let mut threads = self.threads.lock();
            threads.retain(|weak| match weak.upgrade() {
                Some(live) => live.tid() != thread.tid(),
                None => false,
            });
            threads.is_empty()
        };
        if !now_empty {
            return;
        }
        let state = self.pstate.lock().state;
        // A process whose last thread exits dies, whether or not exit()
        // was called first. A process still in INITIAL has no threads by
        // definition of started, but guard anyway.
        if state != ProcessState::Dead && state != ProcessState::Initial {
            self.finalize_dead();
        }
    }

    /// The DYING → DEAD edge: drain the handle table, destroy the
    /// address space, release futex parkers, raise SIGNALED, notify the
    /// exception ports.
    fn finalize_dead(self: &Arc<Self>) {
        {
            let mut pstate = self.pstate.lock();
            if pstate.state == ProcessState::Dead {
                return;
            }
            pstate.state = ProcessState::Dead;
        }
        self.futex_ctx.wake_all();
        // Handles are destroyed one by one outside every lock; closing a
        // dispatcher can reach arbitrary other objects.
        for handle in self.phandles.drain() {
            drop(handle);
        }
        self.pmemory.lock().clear();
        self.base
            .tracker()
            .expect("processes always carry a tracker")
            .update_satisfied(Signals::empty(), Signals::SIGNALED);
        exception::notify_process_exit(self);
        info!("process {} is dead", self.pid());
    }

    /// Allocates a handle to `dispatcher` in this process's table.
    pub fn new_handle(
        &self,
        dispatcher: Arc<dyn Dispatcher>,
        rights: Rights,
    ) -> Result<HandleValue, KernelError> {
        if self.state() == ProcessState::Dead {
            return Err(KernelError::bad_state());
        }
        let owned = arena::alloc_handle(dispatcher, rights)?;
        Ok(self.phandles.add_handle(owned))
    }

    /// Routes a bad handle value through the process policy: IGNORE
    /// passes the error along, LOG logs first, EXIT logs and kills the
    /// process.
    pub fn on_bad_handle(self: &Arc<Self>, value: HandleValue) {
        match self.policy() {
            HandlePolicy::IGNORE => (),
            HandlePolicy::LOG => {
                warn!("process {} presented bad handle {:#x}", self.pid(), value);
            }
            HandlePolicy::EXIT => {
                warn!(
                    "process {} presented bad handle {:#x}, killing it",
                    self.pid(),
                    value
                );
                self.kill();
            }
            _ => {
                // set_policy refuses anything else.
                panic!("process {} has corrupt handle policy", self.pid());
            }
        }
        if cfg!(feature = "log-all-bad-handles") {
            debug!("bad handle {:#x} in process {}", value, self.pid());
        }
    }

    /// The process-scope exception port slot.
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

    /// Live threads.
    pub fn thread_count(&self) -> usize {
        self.threads
            .lock()
            .iter()
            .filter(|weak| weak.upgrade().is_some())
            .count()
    }
}

impl Dispatcher for ProcessStruct {
    fn base(&self) -> &KObjectBase {
        &self.base
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::PROCESS
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn allowed_user_signals(&self) -> Signals {
        Signals::user_all()
    }
}

impl StaticObjectType for ProcessStruct {
    fn static_object_type() -> ObjectType {
        ObjectType::PROCESS
    }
}

/// Snapshot of the live process list.
pub fn process_list() -> Vec<Arc<ProcessStruct>> {
    PROCESS_LIST
        .lock()
        .iter()
        .filter_map(Weak::upgrade)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_initial_to_dead_without_threads() {
        crate::init();
        let process = ProcessStruct::new("doomed").unwrap();
        assert_eq!(process.state(), ProcessState::Initial);

        // A threadless process finalizes on the spot when running exit…
        // except from INITIAL, where exit still marks it dying first.
        process.exit(7);
        assert_eq!(process.state(), ProcessState::Dead);
        assert_eq!(process.retcode(), 7);
        assert!(process
            .base()
            .tracker()
            .unwrap()
            .state()
            .satisfied()
            .contains(Signals::SIGNALED));
    }

    #[test]
    fn dead_process_refuses_handles() {
        crate::init();
        let process = ProcessStruct::new("corpse").unwrap();
        process.kill();
        let dispatcher: Arc<dyn Dispatcher> = crate::objects::EventDispatcher::new();
        assert!(matches!(
            process.new_handle(dispatcher, Rights::default_rw()),
            Err(KernelError::BadState { .. })
        ));
    }

    #[test]
    fn policy_validation() {
        crate::init();
        let process = ProcessStruct::new("p").unwrap();
        assert_eq!(process.policy(), HandlePolicy::IGNORE);
        process.set_policy(HandlePolicy::LOG.0).unwrap();
        assert_eq!(process.policy(), HandlePolicy::LOG);
        assert!(process.set_policy(3).is_err());
        assert_eq!(process.policy(), HandlePolicy::LOG);
    }

    #[test]
    fn name_length_capped() {
        crate::init();
        assert!(ProcessStruct::new(core::str::from_utf8(&[b'a'; 33]).unwrap()).is_err());
        let process = ProcessStruct::new("short").unwrap();
        assert!(process.set_name(core::str::from_utf8(&[b'b'; 33]).unwrap()).is_err());
        process.set_name("renamed").unwrap();
        assert_eq!(process.name(), "renamed");
    }

    #[test]
    fn death_drains_handle_table() {
        crate::init();
        let process = ProcessStruct::new("hoarder").unwrap();
        let event = crate::objects::EventDispatcher::new();
        let dispatcher: Arc<dyn Dispatcher> = event.clone();
        process.new_handle(dispatcher, Rights::default_rw()).unwrap();
        assert_eq!(event.base().handle_count(), 1);

        process.kill();
        assert_eq!(event.base().handle_count(), 0);
        assert_eq!(process.phandles.count(), 0);
    }
}
