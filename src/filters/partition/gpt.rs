//! GPT partition table parsing.

use crate::api::{CmdFlags, DeviceError, OpResult};
use crate::backend::NextCtx;

fn le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn le64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

struct GptHeader {
    nr_partition_entries: u32,
    size_partition_entry: u32,
}

fn parse_header(sector: &[u8]) -> OpResult<GptHeader> {
    // Much is deliberately not checked here, but the parser below assumes
    // the entries array starts immediately after the header, so at least
    // verify the header says so.
    if le64(sector, 72) != 2 {
        return Err(DeviceError::inval(
            "non-standard GPT layout: partition entries are not adjacent to the header",
        ));
    }
    Ok(GptHeader {
        nr_partition_entries: le32(sector, 80),
        size_partition_entry: le32(sector, 84),
    })
}

/// Locate partition `partnum` (1-based) and return its byte window
/// `(offset, range)` on the underlying device.
pub(super) fn find_partition(
    next: &NextCtx<'_>,
    size: u64,
    header_sector: &[u8],
    partnum: u32,
    sector_size: u32,
) -> OpResult<(u64, u64)> {
    let header = parse_header(header_sector)?;
    let ss = u64::from(sector_size);

    if partnum > header.nr_partition_entries {
        return Err(DeviceError::inval("GPT partition number out of range"));
    }

    let entry_size = header.size_partition_entry;
    if entry_size < 128 || entry_size > sector_size || sector_size % entry_size != 0 {
        return Err(DeviceError::inval(format!(
            "GPT partition entry size is invalid ({} bytes)",
            entry_size
        )));
    }

    // The disk must hold the partition entry array twice plus the other
    // GPT overheads, otherwise the header is likely bogus.
    if size
        < 3 * ss + 2 * u64::from(header.nr_partition_entries) * u64::from(entry_size)
    {
        return Err(DeviceError::inval(
            "GPT partition table is too large for this disk",
        ));
    }

    let entries_per_sector = sector_size / entry_size;
    let mut sector = vec![0u8; sector_size as usize];

    for i in 0..header.nr_partition_entries {
        // Bounds were checked above; the entries array starts at LBA 2.
        if i % entries_per_sector == 0 {
            let lba = 2 + u64::from(i / entries_per_sector);
            next.pread(&mut sector, ss * lba, CmdFlags::empty())?;
        }
        let entry = &sector[((i % entries_per_sector) * entry_size) as usize..];
        let type_guid = &entry[0..16];
        if type_guid.iter().any(|&b| b != 0) && partnum == i + 1 {
            let first_lba = le64(entry, 32);
            let last_lba = le64(entry, 40);
            return Ok((first_lba * ss, (1 + last_lba - first_lba) * ss));
        }
    }

    Err(DeviceError::inval(format!(
        "GPT partition {} not found",
        partnum
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_sector(entries_lba: u64, nr: u32, entry_size: u32) -> Vec<u8> {
        let mut s = vec![0u8; 512];
        s[0..8].copy_from_slice(b"EFI PART");
        s[72..80].copy_from_slice(&entries_lba.to_le_bytes());
        s[80..84].copy_from_slice(&nr.to_le_bytes());
        s[84..88].copy_from_slice(&entry_size.to_le_bytes());
        s
    }

    #[test]
    fn nonstandard_entries_lba_is_rejected() {
        let s = header_sector(5, 128, 128);
        assert!(parse_header(&s).is_err());
    }

    #[test]
    fn standard_header_parses() {
        let s = header_sector(2, 128, 128);
        let h = parse_header(&s).unwrap();
        assert_eq!(h.nr_partition_entries, 128);
        assert_eq!(h.size_partition_entry, 128);
    }
}
