//! Error type shared by the driver, cache, filesystem and handle layers.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Caller violated a precondition: unaligned offset, null/zero-length
    /// buffer, unrecognized control op.
    InvalidArgument,
    /// The resource is already in use (double open, no evictable cache slot
    /// right now).
    Busy,
    /// Name or inode does not exist.
    NotFound,
    /// Name already exists.
    AlreadyExists,
    /// Host allocator exhaustion.
    OutOfMemory,
    /// Device reported an error, or a transfer came back short.
    IoError,
    /// On-disk structure violates a layout invariant (bad magic, impossible
    /// size, corrupt bitmap).
    BadFormat,
    /// The inode bitmap has no clear bit left.
    NoFreeInode,
    /// The data bitmap has no clear bit left.
    NoFreeDataBlock,
    /// Operation not applicable to this backend.
    NotSupported,
}

impl KernelError {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelError::InvalidArgument => "invalid argument",
            KernelError::Busy => "resource busy",
            KernelError::NotFound => "not found",
            KernelError::AlreadyExists => "already exists",
            KernelError::OutOfMemory => "out of memory",
            KernelError::IoError => "i/o error",
            KernelError::BadFormat => "bad on-disk format",
            KernelError::NoFreeInode => "no free inode",
            KernelError::NoFreeDataBlock => "no free data block",
            KernelError::NotSupported => "not supported",
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for KernelError {}

impl From<std::io::Error> for KernelError {
    fn from(_value: std::io::Error) -> Self {
        KernelError::IoError
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;
