//! Partition filter: expose a single MBR or GPT partition as the device.
//!
//! At prepare time the first two sectors of the underlying device are read
//! and probed: a GPT signature at the start of LBA 1 wins, then the MBR
//! boot signature.  The chosen parser yields a byte window
//! `(offset, range)` strictly inside the underlying device; every
//! subsequent operation is rebased into that window.

mod gpt;
mod mbr;

use once_cell::sync::OnceCell;

use crate::api::{CmdFlags, DeviceError, Extents, OpResult};
use crate::backend::{ConfigStatus, Filter, Handle, NextCtx, NextOpen};
use crate::config::{human_size_parse, parse_unsigned, ConfigError, ConfigResult};

pub(crate) const SECTOR_SIZE_512: u32 = 512;
pub(crate) const SECTOR_SIZE_4K: u32 = 4096;

/// The partition filter.  Requires the `partition=<N>` config key
/// (1-based); sector size defaults from the underlying block size.
pub struct PartitionFilter {
    partnum: u32,
    /// 0 = auto-detect at prepare time; otherwise 512 or 4096.
    sector_size: u32,
}

/// Resolved at prepare time, immutable afterwards.
struct PartWindow {
    offset: u64,
    range: u64,
    table: &'static str,
    #[allow(dead_code)]
    sector_size: u32,
}

struct PartConn {
    window: OnceCell<PartWindow>,
}

impl Default for PartitionFilter {
    fn default() -> Self {
        PartitionFilter::new()
    }
}

impl PartitionFilter {
    /// A filter with no partition number; configuration must supply one.
    pub fn new() -> PartitionFilter {
        PartitionFilter {
            partnum: 0,
            sector_size: 0,
        }
    }

    /// Construct with the partition number preset.
    pub fn for_partition(partnum: u32) -> PartitionFilter {
        PartitionFilter {
            partnum,
            sector_size: 0,
        }
    }
}

fn conn(handle: &Handle) -> OpResult<&PartConn> {
    handle
        .get::<PartConn>()
        .ok_or_else(|| DeviceError::inval("partition: wrong handle type"))
}

fn window(handle: &Handle) -> OpResult<&PartWindow> {
    conn(handle)?
        .window
        .get()
        .ok_or_else(|| DeviceError::inval("partition: connection was not prepared"))
}

impl Filter for PartitionFilter {
    fn name(&self) -> &str {
        "partition"
    }

    fn longname(&self) -> &str {
        "MBR/GPT partition filter"
    }

    fn config_help(&self) -> &str {
        "partition=<PART>    (required) The partition number (counting from 1).\n\
         partition-sectorsize=<N>  Sector size, 512 or 4096 (default: probe)."
    }

    fn config(&mut self, key: &str, value: &str) -> ConfigResult<ConfigStatus> {
        match key {
            "partition" => {
                self.partnum = parse_unsigned("partition", value)?;
                if self.partnum == 0 {
                    return Err(ConfigError::invalid("invalid partition number"));
                }
                Ok(ConfigStatus::Handled)
            }
            "partition-sectorsize" => {
                let size = human_size_parse(value)?;
                if size != u64::from(SECTOR_SIZE_512) && size != u64::from(SECTOR_SIZE_4K) {
                    return Err(ConfigError::invalid(
                        "invalid partition-sectorsize, it must be '512' or '4096'",
                    ));
                }
                self.sector_size = size as u32;
                Ok(ConfigStatus::Handled)
            }
            _ => Ok(ConfigStatus::Unhandled),
        }
    }

    fn config_complete(&mut self) -> ConfigResult<()> {
        if self.partnum == 0 {
            return Err(ConfigError::invalid(
                "you must supply the partition parameter",
            ));
        }
        Ok(())
    }

    fn open(&self, next: NextOpen<'_>, readonly: bool, exportname: &str) -> OpResult<Handle> {
        next.open(readonly, exportname)?;
        Ok(Handle::new(PartConn {
            window: OnceCell::new(),
        }))
    }

    fn prepare(&self, next: &NextCtx<'_>, handle: &Handle, _readonly: bool) -> OpResult<()> {
        let h = conn(handle)?;

        let sector_size = if self.sector_size != 0 {
            self.sector_size
        } else {
            match next.block_size()? {
                Some(bs) if bs.minimum == SECTOR_SIZE_512 || bs.minimum == SECTOR_SIZE_4K => {
                    log::debug!(
                        "underlying storage has a minimum read blocksize: \
                         setting partition-sectorsize={}",
                        bs.minimum
                    );
                    bs.minimum
                }
                _ => SECTOR_SIZE_512,
            }
        };
        let ss = u64::from(sector_size);

        let size = next.get_size()?;
        if size < 2 * ss {
            return Err(DeviceError::inval(
                "disk is too small to be a partitioned disk",
            ));
        }
        log::debug!("disk size={}", size);

        let mut lba01 = vec![0u8; 2 * sector_size as usize];
        next.pread(&mut lba01, 0, CmdFlags::empty())?;

        let (offset, range, table);
        // The GPT header lives at the start of LBA 1; the minimum size
        // check covers the protective MBR, both headers and both copies of
        // the 16K entry array.
        if size >= 3 * ss + 2 * 128 * 128
            && &lba01[sector_size as usize..sector_size as usize + 8] == b"EFI PART"
        {
            let (o, r) = gpt::find_partition(
                next,
                size,
                &lba01[sector_size as usize..],
                self.partnum,
                sector_size,
            )?;
            offset = o;
            range = r;
            table = "GPT";
        } else if lba01[0x1fe] == 0x55 && lba01[0x1ff] == 0xaa {
            let (o, r) = mbr::find_partition(&lba01, self.partnum, sector_size)?;
            offset = o;
            range = r;
            table = "MBR";
        } else {
            return Err(DeviceError::inval(
                "disk does not contain an MBR or GPT partition table signature",
            ));
        }

        // The parsers return the partition boundaries; additionally check
        // they lie inside the underlying disk.
        if offset.checked_add(range).map_or(true, |end| end > size) {
            return Err(DeviceError::range("partition is outside the disk"));
        }

        log::debug!("partition offset={} range={}", offset, range);

        let _ = h.window.set(PartWindow {
            offset,
            range,
            table,
            sector_size,
        });
        Ok(())
    }

    fn export_description(
        &self,
        next: &NextCtx<'_>,
        handle: &Handle,
    ) -> OpResult<Option<String>> {
        let w = window(handle)?;
        Ok(next.export_description()?.map(|base| {
            format!(
                "partition {} of {} disk: {}",
                self.partnum, w.table, base
            )
        }))
    }

    fn get_size(&self, _next: &NextCtx<'_>, handle: &Handle) -> OpResult<u64> {
        Ok(window(handle)?.range)
    }

    fn pread(
        &self,
        next: &NextCtx<'_>,
        handle: &Handle,
        buf: &mut [u8],
        offset: u64,
        flags: CmdFlags,
    ) -> OpResult<()> {
        next.pread(buf, offset + window(handle)?.offset, flags)
    }

    fn pwrite(
        &self,
        next: &NextCtx<'_>,
        handle: &Handle,
        buf: &[u8],
        offset: u64,
        flags: CmdFlags,
    ) -> OpResult<()> {
        next.pwrite(buf, offset + window(handle)?.offset, flags)
    }

    fn trim(
        &self,
        next: &NextCtx<'_>,
        handle: &Handle,
        count: u32,
        offset: u64,
        flags: CmdFlags,
    ) -> OpResult<()> {
        next.trim(count, offset + window(handle)?.offset, flags)
    }

    fn zero(
        &self,
        next: &NextCtx<'_>,
        handle: &Handle,
        count: u32,
        offset: u64,
        flags: CmdFlags,
    ) -> OpResult<()> {
        next.zero(count, offset + window(handle)?.offset, flags)
    }

    fn cache(
        &self,
        next: &NextCtx<'_>,
        handle: &Handle,
        count: u32,
        offset: u64,
        flags: CmdFlags,
    ) -> OpResult<()> {
        next.cache(count, offset + window(handle)?.offset, flags)
    }

    fn extents(
        &self,
        next: &NextCtx<'_>,
        handle: &Handle,
        count: u32,
        offset: u64,
        flags: CmdFlags,
        extents: &mut Extents,
    ) -> OpResult<()> {
        let w = window(handle)?;
        let mut scratch = Extents::new(offset + w.offset, w.offset + w.range);
        next.extents(count, offset + w.offset, flags, &mut scratch)?;
        for e in scratch.iter() {
            extents.add(e.offset - w.offset, e.length, e.flags)?;
        }
        Ok(())
    }
}
