//! Request vocabulary shared by every layer of the chain.
//!
//! Each operation crossing a layer boundary carries a byte count, an
//! absolute offset and a set of [`CmdFlags`]; layers advertise what they
//! support through the capability probes collected in [`Caps`].  The
//! vocabulary maps 1:1 onto the NBD command set at the wire boundary.

pub mod error;
pub mod extent;

pub use error::{DeviceError, ErrorKind, OpResult};
pub use extent::{Extent, ExtentFlags, Extents};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-request flag set.
///
/// Backed by a `u32` so it can round-trip through the wire layer unchanged.
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdFlags(u32);

impl CmdFlags {
    /// Force unit access: the write must be durable before returning.
    pub const FUA: CmdFlags = CmdFlags(1 << 0);
    /// A zero request may deallocate instead of writing zeroes.
    pub const MAY_TRIM: CmdFlags = CmdFlags(1 << 1);
    /// The caller only needs the first extent of an extents reply.
    pub const REQ_ONE: CmdFlags = CmdFlags(1 << 2);
    /// Fail fast if zeroing is not cheaper than an equivalent write.
    pub const FAST_ZERO: CmdFlags = CmdFlags(1 << 3);
    /// The request carries an explicit payload length.
    pub const PAYLOAD_LEN: CmdFlags = CmdFlags(1 << 4);

    /// The empty flag set.
    pub fn empty() -> CmdFlags {
        CmdFlags(0)
    }

    /// Does this set contain every flag in `other`?
    pub fn contains(self, other: CmdFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Remove the flags in `other` from this set.
    pub fn without(self, other: CmdFlags) -> CmdFlags {
        CmdFlags(self.0 & !other.0)
    }

    /// Is this the empty set?
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for CmdFlags {
    type Output = CmdFlags;
    fn bitor(self, rhs: CmdFlags) -> CmdFlags {
        CmdFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for CmdFlags {
    fn bitor_assign(&mut self, rhs: CmdFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for CmdFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (flag, name) in [
            (CmdFlags::FUA, "FUA"),
            (CmdFlags::MAY_TRIM, "MAY_TRIM"),
            (CmdFlags::REQ_ONE, "REQ_ONE"),
            (CmdFlags::FAST_ZERO, "FAST_ZERO"),
            (CmdFlags::PAYLOAD_LEN, "PAYLOAD_LEN"),
        ] {
            if self.contains(flag) {
                names.push(name);
            }
        }
        write!(f, "CmdFlags({})", names.join("|"))
    }
}

/// How a layer supports force-unit-access writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FuaMode {
    /// FUA is not supported at all.
    None,
    /// The layer emulates FUA by following the operation with a flush.
    Emulate,
    /// The layer passes FUA down to storage natively.
    Native,
}

/// How a layer supports cache (prefetch) requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheMode {
    /// Cache requests are rejected.
    None,
    /// The runtime emulates cache by reading into a scratch buffer.
    Emulate,
    /// The layer implements cache itself.
    Native,
}

/// Block-size constraints advertised by a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSize {
    /// Minimum request size; 1..=65536.
    pub minimum: u32,
    /// Preferred request size; typically 512..=32 MiB.
    pub preferred: u32,
    /// Maximum request size, up to `u32::MAX`.
    pub maximum: u32,
}

/// The full capability record of a layer, cached per connection once the
/// context has been prepared.
#[derive(Debug, Clone, Copy)]
pub struct Caps {
    /// Writes are accepted.
    pub can_write: bool,
    /// Flush is implemented.
    pub can_flush: bool,
    /// The layer is backed by rotational media.
    pub is_rotational: bool,
    /// Trim is implemented.
    pub can_trim: bool,
    /// Zero is implemented (natively or by emulation below).
    pub can_zero: bool,
    /// Zeroing is guaranteed cheaper than an equivalent write.
    pub can_fast_zero: bool,
    /// Extent queries are implemented.
    pub can_extents: bool,
    /// How force-unit-access writes are honored.
    pub can_fua: FuaMode,
    /// Multiple connections observe a consistent view.
    pub can_multi_conn: bool,
    /// How cache (prefetch) requests are honored.
    pub can_cache: CacheMode,
    /// Block-size constraints; `None` means unconstrained.
    pub block_size: Option<BlockSize>,
}

/// Concurrency contract declared by a layer.
///
/// Smaller is stricter; the chain runs at the minimum over all layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ThreadModel {
    /// At most one request in flight across the whole process.
    SerializeConnections,
    /// At most one request in flight per connection; connections in parallel.
    SerializeAllRequests,
    /// Historical equivalent of `SerializeAllRequests`, kept distinct so a
    /// layer's declaration survives round-trips unchanged.
    SerializeRequests,
    /// Requests on the same connection may run concurrently.
    Parallel,
}
