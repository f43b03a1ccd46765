//! Error taxonomy for device operations.
//!
//! Every operation crossing a layer boundary reports failure as a
//! [`DeviceError`].  The kinds are POSIX-flavored and map 1:1 onto the NBD
//! wire error codes at the server boundary; filters may convert kinds as
//! requests propagate back up (the retry filter being the main example).

use thiserror::Error;

/// Result alias used throughout the chain.
pub type OpResult<T> = Result<T, DeviceError>;

/// Discriminant-only view of a [`DeviceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Access refused by policy.
    Perm,
    /// Generic I/O failure.
    Io,
    /// Allocation failure.
    NoMem,
    /// Malformed input.
    Inval,
    /// Write beyond the device extent.
    NoSpc,
    /// Arithmetic overflow on offsets or sizes.
    Overflow,
    /// Operation not supported with the given flags.
    NotSup,
    /// Connection being torn down.
    Shutdown,
    /// Write-class operation on a read-only layer.
    Rofs,
    /// Structural violation.
    Range,
}

/// A failed device operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// Access refused by policy (e.g. writes on a read-only export).
    #[error("permission denied: {0}")]
    Perm(String),

    /// Generic I/O failure.
    #[error("input/output error: {0}")]
    Io(String),

    /// Allocation failure.
    #[error("out of memory: {0}")]
    NoMem(String),

    /// Malformed input: bad header, offset alignment, unknown flag.
    #[error("invalid argument: {0}")]
    Inval(String),

    /// Write beyond the device extent.
    #[error("no space left on device: {0}")]
    NoSpc(String),

    /// Arithmetic overflow on offsets or sizes.
    #[error("value too large: {0}")]
    Overflow(String),

    /// Operation not supported with the given flags.
    #[error("operation not supported: {0}")]
    NotSup(String),

    /// Connection being torn down, or permanent data loss on finalize.
    #[error("connection shut down: {0}")]
    Shutdown(String),

    /// Write-class operation on a read-only layer.
    #[error("read-only device: {0}")]
    Rofs(String),

    /// Structural violation: reserved bits set, table outside the file,
    /// partition outside the disk.
    #[error("out of range: {0}")]
    Range(String),
}

impl DeviceError {
    /// The kind of this error, independent of its message.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::Perm(_) => ErrorKind::Perm,
            DeviceError::Io(_) => ErrorKind::Io,
            DeviceError::NoMem(_) => ErrorKind::NoMem,
            DeviceError::Inval(_) => ErrorKind::Inval,
            DeviceError::NoSpc(_) => ErrorKind::NoSpc,
            DeviceError::Overflow(_) => ErrorKind::Overflow,
            DeviceError::NotSup(_) => ErrorKind::NotSup,
            DeviceError::Shutdown(_) => ErrorKind::Shutdown,
            DeviceError::Rofs(_) => ErrorKind::Rofs,
            DeviceError::Range(_) => ErrorKind::Range,
        }
    }

    /// Map to the NBD wire error code.
    ///
    /// The wire protocol has no EROFS or ERANGE, so those collapse onto
    /// EPERM and EINVAL respectively.
    pub fn to_wire(&self) -> u32 {
        match self.kind() {
            ErrorKind::Perm | ErrorKind::Rofs => 1,  // NBD_EPERM
            ErrorKind::Io => 5,                      // NBD_EIO
            ErrorKind::NoMem => 12,                  // NBD_ENOMEM
            ErrorKind::Inval | ErrorKind::Range => 22, // NBD_EINVAL
            ErrorKind::NoSpc => 28,                  // NBD_ENOSPC
            ErrorKind::Overflow => 75,               // NBD_EOVERFLOW
            ErrorKind::NotSup => 95,                 // NBD_ENOTSUP
            ErrorKind::Shutdown => 108,              // NBD_ESHUTDOWN
        }
    }

    /// A [`DeviceError::Perm`] with the given message.
    pub fn perm(msg: impl Into<String>) -> DeviceError {
        DeviceError::Perm(msg.into())
    }

    /// A [`DeviceError::Io`] with the given message.
    pub fn io(msg: impl Into<String>) -> DeviceError {
        DeviceError::Io(msg.into())
    }

    /// A [`DeviceError::NoMem`] with the given message.
    pub fn no_mem(msg: impl Into<String>) -> DeviceError {
        DeviceError::NoMem(msg.into())
    }

    /// A [`DeviceError::Inval`] with the given message.
    pub fn inval(msg: impl Into<String>) -> DeviceError {
        DeviceError::Inval(msg.into())
    }

    /// A [`DeviceError::NoSpc`] with the given message.
    pub fn no_spc(msg: impl Into<String>) -> DeviceError {
        DeviceError::NoSpc(msg.into())
    }

    /// A [`DeviceError::Overflow`] with the given message.
    pub fn overflow(msg: impl Into<String>) -> DeviceError {
        DeviceError::Overflow(msg.into())
    }

    /// A [`DeviceError::NotSup`] with the given message.
    pub fn not_sup(msg: impl Into<String>) -> DeviceError {
        DeviceError::NotSup(msg.into())
    }

    /// A [`DeviceError::Shutdown`] with the given message.
    pub fn shutdown(msg: impl Into<String>) -> DeviceError {
        DeviceError::Shutdown(msg.into())
    }

    /// A [`DeviceError::Rofs`] with the given message.
    pub fn rofs(msg: impl Into<String>) -> DeviceError {
        DeviceError::Rofs(msg.into())
    }

    /// A [`DeviceError::Range`] with the given message.
    pub fn range(msg: impl Into<String>) -> DeviceError {
        DeviceError::Range(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_match_protocol() {
        assert_eq!(DeviceError::perm("x").to_wire(), 1);
        assert_eq!(DeviceError::io("x").to_wire(), 5);
        assert_eq!(DeviceError::no_mem("x").to_wire(), 12);
        assert_eq!(DeviceError::inval("x").to_wire(), 22);
        assert_eq!(DeviceError::no_spc("x").to_wire(), 28);
        assert_eq!(DeviceError::overflow("x").to_wire(), 75);
        assert_eq!(DeviceError::not_sup("x").to_wire(), 95);
        assert_eq!(DeviceError::shutdown("x").to_wire(), 108);
        // No EROFS/ERANGE on the wire.
        assert_eq!(DeviceError::rofs("x").to_wire(), 1);
        assert_eq!(DeviceError::range("x").to_wire(), 22);
    }

    #[test]
    fn kind_strips_message() {
        assert_eq!(DeviceError::io("a").kind(), DeviceError::io("b").kind());
    }
}
