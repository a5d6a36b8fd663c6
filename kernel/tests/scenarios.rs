//! End-to-end scenarios driven through the syscall surface.
//!
//! Each test builds a process, binds the test thread to one of its
//! threads the way the trap glue would, maps a scratch region to stand
//! in for user memory, and then talks to the kernel exclusively through
//! the functions in `borealis_kernel::syscalls`.

use std::sync::Arc;
use std::time::Duration;

use borealis_kernel::error::UserspaceError;
use borealis_kernel::exception::{self, ExceptionOutcome};
use borealis_kernel::objects::{Dispatcher, VmObject};
use borealis_kernel::process::{ProcessState, ProcessStruct, ThreadStruct};
use borealis_kernel::scheduler;
use borealis_kernel::syscalls;
use borealis_libkern::nr;
use borealis_libkern::object::{exception_type, flags, MemoryPermissions};
use borealis_libkern::wire::{self, ExceptionReport, InfoHandleBasic};
use borealis_libkern::{InfoTopic, ObjectType, Rights, Signals, SignalsState};

/// Bytes of scratch user memory each task gets.
const SCRATCH_SIZE: usize = 0x4000;

/// A bound user task with a scratch mapping.
struct UserTask {
    process: Arc<ProcessStruct>,
    thread: Arc<ThreadStruct>,
    /// Base of the scratch mapping.
    scratch: usize,
    /// Keeps the calling test thread bound; dropped last.
    _binding: scheduler::ThreadBinding,
}

impl UserTask {
    fn new(name: &str) -> UserTask {
        borealis_kernel::init();
        let process = ProcessStruct::new(name).unwrap();
        let thread = ThreadStruct::new(&process, "main").unwrap();
        process.start(&thread, 0x10_0000, 0x20_0000, 0, 0).unwrap();
        let vmo = VmObject::new(SCRATCH_SIZE).unwrap();
        let scratch = process
            .pmemory
            .lock()
            .map_vmo(
                vmo,
                0,
                SCRATCH_SIZE,
                MemoryPermissions::READ | MemoryPermissions::WRITE,
                0,
            )
            .unwrap()
            .addr();
        let binding = scheduler::bind_thread(&thread);
        UserTask {
            process,
            thread,
            scratch,
            _binding: binding,
        }
    }

    /// Seeds scratch memory, as the user program would have.
    fn poke(&self, offset: usize, data: &[u8]) {
        self.process
            .pmemory
            .lock()
            .write_bytes(self.scratch + offset, data)
            .unwrap();
    }

    /// Reads scratch memory back.
    fn peek(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.process
            .pmemory
            .lock()
            .read_bytes(self.scratch + offset, &mut buf)
            .unwrap();
        buf
    }

    fn peek_u32(&self, offset: usize) -> u32 {
        let bytes = self.peek(offset, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Spawns a sibling thread of this process on a host thread.
    fn spawn<F>(&self, name: &str, body: F) -> std::thread::JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread = ThreadStruct::new(&self.process, name).unwrap();
        thread.start(0x10_0000, 0x20_0000, 0, 0).unwrap();
        scheduler::spawn_on_host(thread, body)
    }
}

/// Scenario 1: write "A" into end0, wait READABLE on end1, read it
/// back, and observe the empty queue as BAD_STATE.
#[test]
fn msgpipe_write_wait_read() {
    let task = UserTask::new("scenario1");
    task.poke(0, b"A");
    let (h0, h1) = syscalls::msgpipe_create(0).unwrap();

    syscalls::msgpipe_write(h0, task.scratch, 1, 0, 0, 0).unwrap();

    let state = syscalls::handle_wait_one(
        h1,
        Signals::READABLE.bits(),
        1_000_000_000,
    )
    .unwrap();
    assert!(state.satisfied().contains(Signals::READABLE));

    // Capacities in, sizes out.
    task.poke(0x100, &4u32.to_le_bytes());
    task.poke(0x104, &0u32.to_le_bytes());
    syscalls::msgpipe_read(
        h1,
        task.scratch + 0x200,
        task.scratch + 0x100,
        0,
        task.scratch + 0x104,
        0,
    )
    .unwrap();
    assert_eq!(task.peek_u32(0x100), 1);
    assert_eq!(task.peek_u32(0x104), 0);
    assert_eq!(task.peek(0x200, 1), b"A");

    // Queue drained: the two-phase read has nothing to pin.
    task.poke(0x100, &4u32.to_le_bytes());
    let err = syscalls::msgpipe_read(
        h1,
        task.scratch + 0x200,
        task.scratch + 0x100,
        0,
        task.scratch + 0x104,
        0,
    )
    .unwrap_err();
    assert_eq!(err, UserspaceError::BadState);
}

/// Scenario 2: transfer a pipe end through another pipe, then close the
/// carrier unread. The in-transit end dies with the packet and its
/// surviving peer observes PEER_CLOSED.
#[test]
fn handle_transfer_and_destruction_on_close() {
    let task = UserTask::new("scenario2");
    let (p0, p1) = syscalls::msgpipe_create(0).unwrap();
    let (q0, q1) = syscalls::msgpipe_create(0).unwrap();

    let before = task.process.phandles.count();
    // Write p1 into q0.
    task.poke(0x40, &p1.to_le_bytes());
    syscalls::msgpipe_write(q0, 0, 0, task.scratch + 0x40, 1, 0).unwrap();
    // Handle conservation: the sender's table shrank by one.
    assert_eq!(task.process.phandles.count(), before - 1);
    assert_eq!(
        syscalls::handle_close(p1).unwrap_err(),
        UserspaceError::BadHandle
    );

    // Close the carrier end with the message still queued: the packet
    // dies, taking the in-transit p1 with it, and p0 sees PEER_CLOSED.
    syscalls::handle_close(q1).unwrap();
    let state = syscalls::handle_wait_one(
        p0,
        Signals::PEER_CLOSED.bits(),
        1_000_000_000,
    )
    .unwrap();
    assert!(state.satisfied().contains(Signals::PEER_CLOSED));
}

/// The receiving half of handle conservation: a transferred handle
/// arrives with a fresh value, the same dispatcher identity and the
/// same rights.
#[test]
fn handle_transfer_preserves_identity_and_rights() {
    let task = UserTask::new("transfer-identity");
    let (q0, q1) = syscalls::msgpipe_create(0).unwrap();
    let event = syscalls::event_create().unwrap();

    // Narrow the event handle so the preserved-rights check bites.
    let narrowed = syscalls::handle_replace(
        event,
        (Rights::TRANSFER | Rights::READ).bits(),
    )
    .unwrap();

    let info_len = std::mem::size_of::<InfoHandleBasic>();
    syscalls::object_get_info(narrowed, InfoTopic::HANDLE_BASIC.0, task.scratch, info_len).unwrap();
    let sent: InfoHandleBasic = wire::read_from(&task.peek(0, info_len)).unwrap();

    task.poke(0x40, &narrowed.to_le_bytes());
    syscalls::msgpipe_write(q0, 0, 0, task.scratch + 0x40, 1, 0).unwrap();

    task.poke(0x100, &0u32.to_le_bytes());
    task.poke(0x104, &1u32.to_le_bytes());
    let received_count_before = task.process.phandles.count();
    syscalls::msgpipe_read(
        q1,
        0,
        task.scratch + 0x100,
        task.scratch + 0x80,
        task.scratch + 0x104,
        0,
    )
    .unwrap();
    assert_eq!(task.process.phandles.count(), received_count_before + 1);
    let received = task.peek_u32(0x80);
    assert_ne!(received, narrowed);

    syscalls::object_get_info(received, InfoTopic::HANDLE_BASIC.0, task.scratch, info_len).unwrap();
    let got: InfoHandleBasic = wire::read_from(&task.peek(0, info_len)).unwrap();
    assert_eq!(got.koid, sent.koid);
    assert_eq!(got.rights, sent.rights);
    assert_eq!(got.otype, ObjectType::EVENT.0);
}

/// A write with one bad handle among many leaves the table observably
/// unchanged.
#[test]
fn msgpipe_write_rolls_back_on_bad_handle() {
    let task = UserTask::new("rollback");
    let (q0, _q1) = syscalls::msgpipe_create(0).unwrap();
    let good0 = syscalls::event_create().unwrap();
    let good1 = syscalls::event_create().unwrap();

    task.poke(0x40, &good0.to_le_bytes());
    task.poke(0x44, &good1.to_le_bytes());
    task.poke(0x48, &0xdead_beeeu32.to_le_bytes());
    let before = task.process.phandles.count();
    let err = syscalls::msgpipe_write(q0, 0, 0, task.scratch + 0x40, 3, 0).unwrap_err();
    assert_eq!(err, UserspaceError::BadHandle);
    assert_eq!(task.process.phandles.count(), before);
    // Both good handles still work under their old values.
    syscalls::object_signal(good0, 0, Signals::SIGNALED.bits()).unwrap();
    syscalls::object_signal(good1, 0, Signals::SIGNALED.bits()).unwrap();

    // A handle without TRANSFER right also rolls back.
    let sealed = syscalls::handle_replace(good0, Rights::READ.bits()).unwrap();
    task.poke(0x40, &good1.to_le_bytes());
    task.poke(0x44, &sealed.to_le_bytes());
    let before = task.process.phandles.count();
    let err = syscalls::msgpipe_write(q0, 0, 0, task.scratch + 0x40, 2, 0).unwrap_err();
    assert_eq!(err, UserspaceError::AccessDenied);
    assert_eq!(task.process.phandles.count(), before);
}

/// Scenario 3: duplicate narrowing and the superset refusal.
#[test]
fn duplicate_narrows_and_rejects_supersets() {
    let task = UserTask::new("scenario3");
    let event = syscalls::event_create().unwrap();
    let source = syscalls::handle_replace(event, 0b111).unwrap();

    let narrowed = syscalls::handle_duplicate(source, 0b110).unwrap();
    let info_len = std::mem::size_of::<InfoHandleBasic>();
    syscalls::object_get_info(narrowed, InfoTopic::HANDLE_BASIC.0, task.scratch, info_len).unwrap();
    let info: InfoHandleBasic = wire::read_from(&task.peek(0, info_len)).unwrap();
    assert_eq!(info.rights, 0b110);

    let before = task.process.phandles.count();
    assert_eq!(
        syscalls::handle_duplicate(source, 0b1111).unwrap_err(),
        UserspaceError::InvalidArgs
    );
    assert_eq!(task.process.phandles.count(), before);
}

/// Scenario 4: futex park, cross-thread wake, and the non-parking
/// mismatch case.
#[test]
fn futex_wait_wake_cycle() {
    let task = UserTask::new("scenario4");
    let addr = task.scratch + 0x800;
    task.poke(0x800, &7u32.to_le_bytes());

    let process = task.process.clone();
    let waker = task.spawn("waker", move || {
        // Wait until the main thread is parked, then flip the word and
        // wake.
        while process.futex_ctx.key_count() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        process
            .pmemory
            .lock()
            .write_u32(addr, 8)
            .unwrap();
        let woken = syscalls::futex_wake(addr, 1).unwrap();
        assert_eq!(woken, 1);
    });

    syscalls::futex_wait(addr, 7, 1_000_000_000).unwrap();
    waker.join().unwrap();

    // Word already changed: the compare fails without parking.
    assert_eq!(
        syscalls::futex_wait(addr, 7, 1_000_000_000).unwrap_err(),
        UserspaceError::AlreadyBound
    );
}

/// Scenario 5: fault delivery to a process exception port, NOT_HANDLED
/// propagation, death and SIGNALED.
#[test]
fn exception_port_delivery_and_fallthrough() {
    let task = UserTask::new("scenario5");
    let (kernel_end, handler_end) = syscalls::msgpipe_create(0).unwrap();
    let process_handle = {
        // The test process needs a handle to itself to register a port.
        let dispatcher: Arc<dyn Dispatcher> = task.process.clone();
        task.process
            .new_handle(dispatcher, Rights::default_rw())
            .unwrap()
    };
    syscalls::task_set_exception_port(process_handle, kernel_end, 0x77).unwrap();

    // The faulting thread, with a handle so the handler can resume it.
    let fault_thread = ThreadStruct::new(&task.process, "faulter").unwrap();
    fault_thread.start(0x10_0000, 0x20_0000, 0, 0).unwrap();
    let thread_handle = {
        let dispatcher: Arc<dyn Dispatcher> = fault_thread.clone();
        task.process
            .new_handle(dispatcher, Rights::default_rw())
            .unwrap()
    };
    let faulter = {
        let fault_thread = fault_thread.clone();
        scheduler::spawn_on_host(fault_thread.clone(), move || {
            let outcome = exception::dispatch_user_exception(
                &fault_thread,
                exception_type::PAGE_FAULT,
                0x10_0004,
                0xbad0_0000,
                [0; 8],
            );
            assert_eq!(outcome, ExceptionOutcome::Killed);
        })
    };

    // Pump the report out of the handler end.
    let state = syscalls::handle_wait_one(
        handler_end,
        Signals::READABLE.bits(),
        1_000_000_000,
    )
    .unwrap();
    assert!(state.satisfied().contains(Signals::READABLE));
    let report_len = std::mem::size_of::<ExceptionReport>();
    task.poke(0x100, &(report_len as u32).to_le_bytes());
    task.poke(0x104, &0u32.to_le_bytes());
    syscalls::msgpipe_read(
        handler_end,
        task.scratch + 0x200,
        task.scratch + 0x100,
        0,
        task.scratch + 0x104,
        0,
    )
    .unwrap();
    let report: ExceptionReport = wire::read_from(&task.peek(0x200, report_len)).unwrap();
    assert_eq!(report.header.extype, exception_type::PAGE_FAULT);
    assert_eq!(report.context.pid, task.process.pid());
    assert_eq!(report.context.tid, fault_thread.tid());
    assert_eq!(report.context.fault_address, 0xbad0_0000);

    // NOT_HANDLED with no further scope installed: the process dies and
    // raises SIGNALED.
    syscalls::task_resume(thread_handle, flags::RESUME_NOT_HANDLED).unwrap();
    faulter.join().unwrap();
    // The test harness thread occupies the process's other thread slot;
    // its exit is the last unlink that completes DYING → DEAD.
    task.thread.exit();
    assert_eq!(task.process.state(), ProcessState::Dead);
    assert!(task
        .process
        .base()
        .tracker()
        .unwrap()
        .state()
        .satisfied()
        .contains(Signals::SIGNALED));
}

/// Scenario 6: wait_many over three readable ends with a mid-wait edge
/// on the third.
#[test]
fn wait_many_reports_winning_index() {
    let task = UserTask::new("scenario6");
    let (_a0, a1) = syscalls::msgpipe_create(0).unwrap();
    let (_b0, b1) = syscalls::msgpipe_create(0).unwrap();
    let (c0, c1) = syscalls::msgpipe_create(0).unwrap();

    // handles[] at 0x300, signals[] at 0x340, states[] at 0x380.
    for (i, h) in [a1, b1, c1].iter().enumerate() {
        task.poke(0x300 + 4 * i, &h.to_le_bytes());
        task.poke(0x340 + 4 * i, &Signals::READABLE.bits().to_le_bytes());
    }

    let scratch = task.scratch;
    let signaller = task.spawn("signaller", move || {
        std::thread::sleep(Duration::from_millis(5));
        syscalls::msgpipe_write(c0, scratch, 1, 0, 0, 0).unwrap();
    });

    let index = syscalls::handle_wait_many(
        task.scratch + 0x300,
        task.scratch + 0x340,
        3,
        10_000_000_000,
        task.scratch + 0x380,
    )
    .unwrap();
    signaller.join().unwrap();
    assert_eq!(index, 2);

    let state_size = std::mem::size_of::<SignalsState>();
    let winner: SignalsState =
        wire::read_from(&task.peek(0x380 + 2 * state_size, state_size)).unwrap();
    assert!(winner.satisfied().contains(Signals::READABLE));
    let loser: SignalsState = wire::read_from(&task.peek(0x380, state_size)).unwrap();
    assert!(!loser.satisfied().contains(Signals::READABLE));
    assert!(loser.satisfiable().contains(Signals::READABLE));
}

/// handle_wait_many with a timeout and nothing satisfied times out.
#[test]
fn wait_many_times_out() {
    let task = UserTask::new("wait-timeout");
    let h0 = syscalls::event_create().unwrap();
    task.poke(0x300, &h0.to_le_bytes());
    task.poke(0x340, &Signals::SIGNALED.bits().to_le_bytes());
    let err = syscalls::handle_wait_many(
        task.scratch + 0x300,
        task.scratch + 0x340,
        1,
        5_000_000,
        0,
    )
    .unwrap_err();
    assert_eq!(err, UserspaceError::TimedOut);
}

/// Sockets and data pipes end to end through the syscall layer.
#[test]
fn socket_and_datapipe_flow() {
    let task = UserTask::new("streams");

    let (s0, s1) = syscalls::socket_create().unwrap();
    task.poke(0, b"stream");
    assert_eq!(syscalls::socket_write(s0, task.scratch, 6, 0).unwrap(), 6);
    assert_eq!(syscalls::socket_read(s1, task.scratch + 0x40, 6, 0).unwrap(), 6);
    assert_eq!(task.peek(0x40, 6), b"stream");
    // OOB rides its own lane.
    task.poke(0, b"oob!");
    syscalls::socket_write(s0, task.scratch, 4, flags::SOCKET_CONTROL).unwrap();
    assert_eq!(
        syscalls::socket_read(s1, task.scratch + 0x80, 16, flags::SOCKET_CONTROL).unwrap(),
        4
    );

    let (producer, consumer) = syscalls::datapipe_create(1, 64).unwrap();
    task.poke(0x100, b"ring data");
    assert_eq!(
        syscalls::datapipe_write(producer, task.scratch + 0x100, 9, 0).unwrap(),
        9
    );
    assert_eq!(
        syscalls::datapipe_read(consumer, 0, 0, flags::DATAPIPE_READ_QUERY).unwrap(),
        9
    );
    assert_eq!(
        syscalls::datapipe_read(consumer, task.scratch + 0x140, 9, 0).unwrap(),
        9
    );
    assert_eq!(task.peek(0x140, 9), b"ring data");

    // Two-phase write through a mapped window.
    let (window_addr, window_len) = syscalls::datapipe_begin_write(producer).unwrap();
    assert!(window_len >= 4);
    task.process
        .pmemory
        .lock()
        .write_bytes(window_addr, b"2pha")
        .unwrap();
    syscalls::datapipe_end_write(producer, 4).unwrap();
    assert_eq!(
        syscalls::datapipe_read(consumer, task.scratch + 0x180, 4, 0).unwrap(),
        4
    );
    assert_eq!(task.peek(0x180, 4), b"2pha");
}

/// Port bindings turn signal edges into packets observed via port_wait.
#[test]
fn port_binding_delivers_signal_packets() {
    let task = UserTask::new("ports");
    let port = syscalls::port_create().unwrap();
    let event = syscalls::event_create().unwrap();
    syscalls::port_bind(port, 0xfeed_f00d, event, Signals::SIGNALED.bits()).unwrap();

    syscalls::object_signal(event, 0, Signals::SIGNALED.bits()).unwrap();

    let buf_len = std::mem::size_of::<wire::PacketHeader>() + 128;
    let written = syscalls::port_wait(port, 1_000_000_000, task.scratch, buf_len).unwrap();
    let header: wire::PacketHeader = wire::read_from(&task.peek(0, written)).unwrap();
    assert_eq!(header.key, 0xfeed_f00d);
    assert_eq!(header.ptype, borealis_libkern::object::packet_type::SIGNAL);

    // Double bind is refused; unbind then rebind is fine.
    let port2 = syscalls::port_create().unwrap();
    assert_eq!(
        syscalls::port_bind(port2, 1, event, Signals::SIGNALED.bits()).unwrap_err(),
        UserspaceError::AlreadyBound
    );
    syscalls::port_bind(0, 0, event, 0).unwrap();
    syscalls::port_bind(port2, 2, event, Signals::SIGNALED.bits()).unwrap();
}

/// The bad-handle EXIT policy kills the offender.
#[test]
fn bad_handle_policy_exit_kills() {
    let task = UserTask::new("policy");
    task.process
        .set_policy(borealis_libkern::HandlePolicy::EXIT.0)
        .unwrap();
    let err = syscalls::handle_close(0x7777_7771).unwrap_err();
    assert_eq!(err, UserspaceError::BadHandle);
    assert_ne!(task.process.state(), ProcessState::Running);
}

/// current_time ticks and nanosleep returns.
#[test]
fn time_and_sleep() {
    let _task = UserTask::new("time");
    let before = syscalls::current_time();
    syscalls::nanosleep(2_000_000).unwrap();
    let after = syscalls::current_time();
    assert!(after > before);
}

/// The numeric ABI layer decodes numbers, writes out-params through
/// user pointers and reports unknown numbers.
#[test]
fn numeric_dispatch_roundtrip() {
    let task = UserTask::new("abi");
    let mut args = [0usize; 8];
    args[0] = task.scratch;
    assert_eq!(syscalls::dispatch_syscall(nr::EVENT_CREATE, args), 0);
    let handle = task.peek_u32(0);
    assert_ne!(handle, 0);
    assert_eq!(handle & 1, 1);

    let args = [
        handle as usize,
        0,
        Signals::SIGNALED.bits() as usize,
        0,
        0,
        0,
        0,
        0,
    ];
    assert_eq!(syscalls::dispatch_syscall(nr::OBJECT_SIGNAL, args), 0);

    let args = [handle as usize, 0, 0, 0, 0, 0, 0, 0];
    assert_eq!(syscalls::dispatch_syscall(nr::HANDLE_CLOSE, args), 0);
    assert_eq!(
        syscalls::dispatch_syscall(nr::HANDLE_CLOSE, args),
        UserspaceError::BadHandle.make_ret()
    );

    assert_eq!(
        syscalls::dispatch_syscall(0xffff, [0; 8]),
        UserspaceError::NotSupported.make_ret()
    );
}

/// cprng_draw fills scratch bytes; add_entropy accepts input.
#[test]
fn cprng_syscalls() {
    let task = UserTask::new("entropy");
    assert_eq!(syscalls::cprng_draw(task.scratch, 32).unwrap(), 32);
    let drawn = task.peek(0, 32);
    assert!(drawn.iter().any(|&b| b != 0));
    syscalls::cprng_add_entropy(task.scratch, 32).unwrap();
    assert!(syscalls::cprng_draw(task.scratch, 4096).is_err());
}
