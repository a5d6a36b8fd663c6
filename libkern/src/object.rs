//! Object type tags, properties, info topics and per-call flag words.

use borealis_libutils::enum_with_val;

enum_with_val! {
    /// The type tag of a kernel object.
    ///
    /// Frozen at object construction. Syscalls check it once per entry
    /// point before dispatching to the typed operation.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct ObjectType(pub u32) {
        /// No object. Only found in malformed info records.
        NONE = 0,
        /// A process.
        PROCESS = 1,
        /// A thread.
        THREAD = 2,
        /// A virtual memory object.
        VM_OBJECT = 3,
        /// One end of a message pipe.
        MESSAGE_PIPE = 4,
        /// A plain event.
        EVENT = 5,
        /// An io port.
        IO_PORT = 6,
        /// The producing end of a data pipe.
        DATA_PIPE_PRODUCER = 7,
        /// The consuming end of a data pipe.
        DATA_PIPE_CONSUMER = 8,
        /// An interrupt object.
        INTERRUPT = 9,
        /// An io mapping. Tag reserved for device glue; the core never
        /// constructs one.
        IO_MAPPING = 10,
        /// A pci device. Tag reserved for device glue.
        PCI_DEVICE = 11,
        /// A pci interrupt. Tag reserved for device glue.
        PCI_INTERRUPT = 12,
        /// A kernel log reader/writer.
        LOG = 13,
        /// A wait set.
        WAIT_SET = 14,
        /// One half of a socket.
        SOCKET = 15,
        /// A resource capability node.
        RESOURCE = 16,
        /// One half of an event pair.
        EVENT_PAIR = 17,
    }
}

enum_with_val! {
    /// What a process does when a syscall hands it a bad handle value.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct HandlePolicy(pub u32) {
        /// Return the error to the caller and move on.
        IGNORE = 0,
        /// Log the offending value, then return the error.
        LOG = 1,
        /// Log, then kill the offending process.
        EXIT = 2,
    }
}

enum_with_val! {
    /// Keys accepted by `object_get_property` / `object_set_property`.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Property(pub u32) {
        /// Object name, up to [`crate::MAX_NAME_LEN`] bytes. Processes and
        /// threads only.
        NAME = 1,
        /// Bad-handle policy word, see [`HandlePolicy`]. Processes only.
        BAD_HANDLE_POLICY = 2,
        /// Data-pipe read threshold in bytes. Consumer handles only.
        DATAPIPE_READ_THRESHOLD = 3,
        /// Data-pipe write threshold in bytes. Producer handles only.
        DATAPIPE_WRITE_THRESHOLD = 4,
    }
}

enum_with_val! {
    /// Topics accepted by `object_get_info`.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct InfoTopic(pub u32) {
        /// A [`crate::wire::InfoHandleBasic`] record.
        HANDLE_BASIC = 1,
        /// A [`crate::wire::InfoProcess`] record. Process handles only.
        PROCESS = 2,
        /// Live handle count of the calling process, as a u32.
        PROCESS_HANDLE_COUNT = 3,
        /// Current size in bytes of the vm object, as a u64.
        VMO_SIZE = 4,
    }
}

enum_with_val! {
    /// Operations accepted by `vmo_op_range`.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct VmoOp(pub u32) {
        /// Commit the pages of the range. A no-op in this core: backing
        /// store is always materialized.
        COMMIT = 1,
        /// Decommit the pages of the range.
        DECOMMIT = 2,
        /// Zero-fill the range.
        ZERO = 3,
        /// Clean the cache for the range. Not supported by the core.
        CACHE_CLEAN = 4,
        /// Invalidate the cache for the range. Not supported by the core.
        CACHE_INVALIDATE = 5,
    }
}

bitflags! {
    /// Memory permissions for `process_map_vm` and `process_protect_vm`.
    ///
    /// Accepted combinations are READ, READ|WRITE and READ|EXECUTE.
    /// Write-only mappings are rejected.
    pub struct MemoryPermissions: u32 {
        /// Pages may be read.
        const READ = 1 << 0;
        /// Pages may be written.
        const WRITE = 1 << 1;
        /// Pages may be executed.
        const EXECUTE = 1 << 2;
    }
}

/// Per-call flag words, one namespace per syscall family.
pub mod flags {
    /// `msgpipe_create`: make the pair a reply pipe. Writing the pipe's
    /// own other end through it is then legal, provided it is the last
    /// transferred handle.
    pub const MSGPIPE_CREATE_REPLY_PIPE: u32 = 1 << 0;

    /// `msgpipe_read`: if the supplied buffers are too small, consume and
    /// drop the head message instead of failing with BUFFER_TOO_SMALL.
    pub const MSGPIPE_READ_MAY_DISCARD: u32 = 1 << 0;

    /// `datapipe_write` / `datapipe_read`: transfer everything or nothing.
    pub const DATAPIPE_ALL_OR_NONE: u32 = 1 << 0;
    /// `datapipe_read`: consume without copying out.
    pub const DATAPIPE_READ_DISCARD: u32 = 1 << 1;
    /// `datapipe_read`: copy out without consuming.
    pub const DATAPIPE_READ_PEEK: u32 = 1 << 2;
    /// `datapipe_read`: ignore the buffer, report available bytes.
    pub const DATAPIPE_READ_QUERY: u32 = 1 << 3;

    /// `socket_write` / `socket_read`: use the out-of-band channel.
    pub const SOCKET_CONTROL: u32 = 1 << 0;
    /// `socket_write`: shut down the stream direction after this write.
    pub const SOCKET_SHUTDOWN: u32 = 1 << 1;

    /// `task_resume`: the handler did not handle the exception; deliver
    /// to the next scope instead of resuming.
    pub const RESUME_NOT_HANDLED: u32 = 1 << 0;

    /// `log_create`: the new log handle may read the kernel log stream.
    pub const LOG_READABLE: u32 = 1 << 0;
}

/// The packet type tags found in io-port packet headers.
pub mod packet_type {
    /// A packet queued by userspace through `port_queue`.
    pub const USER: u32 = 0;
    /// A packet synthesized by a signal binding.
    pub const SIGNAL: u32 = 1;
    /// An exception report.
    pub const EXCEPTION: u32 = 2;
}

/// Exception subtypes found in exception reports.
pub mod exception_type {
    /// Memory fault.
    pub const PAGE_FAULT: u32 = 1;
    /// Undefined or privileged instruction.
    pub const UNDEFINED_INSTRUCTION: u32 = 2;
    /// Software breakpoint.
    pub const SW_BREAKPOINT: u32 = 3;
    /// Any other synchronous fault.
    pub const GENERAL: u32 = 4;
    /// Not a fault: the process exited. Delivered to process and system
    /// scopes for observation; the reporting thread does not block.
    pub const PROCESS_EXIT: u32 = 5;
}
