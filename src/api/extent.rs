//! Extent lists: the reply type of the extents (block status) operation.
//!
//! An [`Extents`] value is a bounded, monotonic, non-overlapping sequence of
//! `(offset, length, flags)` records.  Layers append records as they descend
//! the chain; records outside the query window are clipped or ignored so the
//! caller-specified bounds are never exceeded, and adjacent records with the
//! same flags coalesce on append.

use std::fmt;

use super::error::{DeviceError, OpResult};

/// Allocation status flags of one extent.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ExtentFlags(u32);

impl ExtentFlags {
    /// The extent is a hole (unallocated in the underlying store).
    pub const HOLE: ExtentFlags = ExtentFlags(1 << 0);
    /// The extent reads as all zeroes.
    pub const ZERO: ExtentFlags = ExtentFlags(1 << 1);

    /// Allocated data: neither hole nor zero.
    pub fn allocated() -> ExtentFlags {
        ExtentFlags(0)
    }

    /// Does this set contain every flag in `other`?
    pub fn contains(self, other: ExtentFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ExtentFlags {
    type Output = ExtentFlags;
    fn bitor(self, rhs: ExtentFlags) -> ExtentFlags {
        ExtentFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for ExtentFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Self::HOLE), self.contains(Self::ZERO)) {
            (false, false) => write!(f, "ExtentFlags(data)"),
            (true, false) => write!(f, "ExtentFlags(HOLE)"),
            (false, true) => write!(f, "ExtentFlags(ZERO)"),
            (true, true) => write!(f, "ExtentFlags(HOLE|ZERO)"),
        }
    }
}

/// One contiguous byte run with a known allocation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Absolute byte offset of the run.
    pub offset: u64,
    /// Length of the run in bytes.
    pub length: u64,
    /// Allocation status of the run.
    pub flags: ExtentFlags,
}

/// An extent list bounded to the window `[start, end)`.
///
/// Constructed per extents query, populated by the chain descending, and
/// handed back to the requester.
#[derive(Debug)]
pub struct Extents {
    start: u64,
    end: u64,
    list: Vec<Extent>,
}

impl Extents {
    /// Create a list covering the window `[start, end)`.
    pub fn new(start: u64, end: u64) -> Extents {
        Extents {
            start,
            end,
            list: Vec::new(),
        }
    }

    /// Query window start.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Query window end (exclusive).
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Append one extent.
    ///
    /// Extents entirely outside the window are ignored; extents straddling
    /// a window edge are truncated to it.  Leaving a gap (offset beyond the
    /// bytes covered so far) is an error.  An extent adjacent to the
    /// previous one with identical flags extends it in place.
    pub fn add(&mut self, offset: u64, length: u64, flags: ExtentFlags) -> OpResult<()> {
        if length == 0 {
            return Ok(());
        }

        let mut offset = offset;
        let mut length = length;

        // Clip to the window.
        if offset >= self.end {
            return Ok(());
        }
        if offset.saturating_add(length) > self.end {
            length = self.end - offset;
        }
        if offset + length <= self.start {
            return Ok(());
        }
        if offset < self.start {
            length -= self.start - offset;
            offset = self.start;
        }

        let next = match self.list.last() {
            Some(last) => last.offset + last.length,
            None => self.start,
        };

        if offset > next {
            return Err(DeviceError::inval(format!(
                "extent list has a gap: expected offset {}, got {}",
                next, offset
            )));
        }
        // Overlap with already-covered bytes: keep only the new tail.
        if offset < next {
            let covered = next - offset;
            if covered >= length {
                return Ok(());
            }
            offset = next;
            length -= covered;
        }

        if let Some(last) = self.list.last_mut() {
            if last.flags == flags && last.offset + last.length == offset {
                last.length += length;
                return Ok(());
            }
        }

        self.list.push(Extent {
            offset,
            length,
            flags,
        });
        Ok(())
    }

    /// Number of records so far.
    pub fn count(&self) -> usize {
        self.list.len()
    }

    /// Fetch record `i`.
    pub fn get(&self, i: usize) -> Extent {
        self.list[i]
    }

    /// Iterate over the records in order.
    pub fn iter(&self) -> impl Iterator<Item = &Extent> {
        self.list.iter()
    }
}
