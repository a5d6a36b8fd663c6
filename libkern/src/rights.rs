//! Handle rights.

bitflags! {
    /// The rights mask carried by a handle.
    ///
    /// Rights restrict which operations a handle permits on its object.
    /// They are preserved on transfer and may only be narrowed by
    /// duplicate or replace, never widened.
    pub struct Rights: u32 {
        /// The handle may be duplicated.
        const DUPLICATE = 1 << 0;
        /// The handle may be written into a message.
        const TRANSFER = 1 << 1;
        /// Read operations, including waiting on signals.
        const READ = 1 << 2;
        /// Write operations, including raising user signals.
        const WRITE = 1 << 3;
        /// The object may be mapped executable.
        const EXECUTE = 1 << 4;
        /// The object may be mapped into an address space.
        const MAP = 1 << 5;
        /// Properties may be read.
        const GET_PROPERTY = 1 << 6;
        /// Properties may be written.
        const SET_PROPERTY = 1 << 7;
    }
}

/// Sentinel accepted by duplicate and replace meaning "copy the rights of
/// the source handle". Deliberately outside the `Rights` bit range checked
/// by `from_bits`.
pub const SAME_RIGHTS: u32 = 1 << 31;

impl Rights {
    /// The default rights of a fresh transferable object handle.
    pub fn default_rw() -> Rights {
        Rights::DUPLICATE | Rights::TRANSFER | Rights::READ | Rights::WRITE
            | Rights::GET_PROPERTY | Rights::SET_PROPERTY
    }

    /// Checks that every bit of `required` is present.
    pub fn allows(self, required: Rights) -> bool {
        self.contains(required)
    }
}
