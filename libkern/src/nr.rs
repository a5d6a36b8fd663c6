//! Syscall numbers.
//!
//! The numeric dispatch table. Numbers are ABI and append-only.

#![allow(missing_docs)]

pub const HANDLE_CLOSE: u32 = 0x01;
pub const HANDLE_DUPLICATE: u32 = 0x02;
pub const HANDLE_REPLACE: u32 = 0x03;
pub const HANDLE_WAIT_ONE: u32 = 0x04;
pub const HANDLE_WAIT_MANY: u32 = 0x05;

pub const OBJECT_GET_INFO: u32 = 0x10;
pub const OBJECT_GET_PROPERTY: u32 = 0x11;
pub const OBJECT_SET_PROPERTY: u32 = 0x12;
pub const OBJECT_SIGNAL: u32 = 0x13;
pub const OBJECT_SIGNAL_PEER: u32 = 0x14;

pub const MSGPIPE_CREATE: u32 = 0x20;
pub const MSGPIPE_WRITE: u32 = 0x21;
pub const MSGPIPE_READ: u32 = 0x22;

pub const DATAPIPE_CREATE: u32 = 0x30;
pub const DATAPIPE_WRITE: u32 = 0x31;
pub const DATAPIPE_READ: u32 = 0x32;
pub const DATAPIPE_BEGIN_WRITE: u32 = 0x33;
pub const DATAPIPE_END_WRITE: u32 = 0x34;
pub const DATAPIPE_BEGIN_READ: u32 = 0x35;
pub const DATAPIPE_END_READ: u32 = 0x36;

pub const SOCKET_CREATE: u32 = 0x40;
pub const SOCKET_WRITE: u32 = 0x41;
pub const SOCKET_READ: u32 = 0x42;

pub const PORT_CREATE: u32 = 0x50;
pub const PORT_QUEUE: u32 = 0x51;
pub const PORT_WAIT: u32 = 0x52;
pub const PORT_BIND: u32 = 0x53;

pub const WAITSET_CREATE: u32 = 0x60;
pub const WAITSET_ADD: u32 = 0x61;
pub const WAITSET_REMOVE: u32 = 0x62;
pub const WAITSET_WAIT: u32 = 0x63;

pub const EVENT_CREATE: u32 = 0x70;
pub const EVENTPAIR_CREATE: u32 = 0x71;

pub const VMO_CREATE: u32 = 0x80;
pub const VMO_READ: u32 = 0x81;
pub const VMO_WRITE: u32 = 0x82;
pub const VMO_GET_SIZE: u32 = 0x83;
pub const VMO_SET_SIZE: u32 = 0x84;
pub const VMO_OP_RANGE: u32 = 0x85;

pub const PROCESS_CREATE: u32 = 0x90;
pub const PROCESS_START: u32 = 0x91;
pub const PROCESS_MAP_VM: u32 = 0x92;
pub const PROCESS_UNMAP_VM: u32 = 0x93;
pub const PROCESS_PROTECT_VM: u32 = 0x94;

pub const THREAD_CREATE: u32 = 0xa0;
pub const THREAD_START: u32 = 0xa1;
pub const THREAD_EXIT: u32 = 0xa2;
pub const TASK_KILL: u32 = 0xa3;
pub const TASK_RESUME: u32 = 0xa4;
pub const TASK_SET_EXCEPTION_PORT: u32 = 0xa5;

pub const FUTEX_WAIT: u32 = 0xb0;
pub const FUTEX_WAKE: u32 = 0xb1;
pub const FUTEX_REQUEUE: u32 = 0xb2;

pub const NANOSLEEP: u32 = 0xc0;
pub const CURRENT_TIME: u32 = 0xc1;
pub const CPRNG_DRAW: u32 = 0xc2;
pub const CPRNG_ADD_ENTROPY: u32 = 0xc3;

pub const LOG_CREATE: u32 = 0xd0;
pub const LOG_WRITE: u32 = 0xd1;
pub const LOG_READ: u32 = 0xd2;
