//! RAM-backed plugin.
//!
//! Serves a byte vector held in memory.  Mostly useful as a substrate for
//! stacking filters in tests and for serving small prebuilt disk images.

use parking_lot::RwLock;

use crate::api::{CacheMode, CmdFlags, DeviceError, FuaMode, OpResult};
use crate::backend::{Handle, Plugin};
use crate::config::{human_size_parse, ConfigResult};

/// An in-memory disk.
pub struct MemPlugin {
    data: RwLock<Vec<u8>>,
}

struct MemConn {
    readonly: bool,
}

impl MemPlugin {
    /// A zero-filled disk of `size` bytes.
    pub fn new(size: u64) -> MemPlugin {
        MemPlugin {
            data: RwLock::new(vec![0u8; size as usize]),
        }
    }

    /// A disk initialized from `data`.
    pub fn with_data(data: Vec<u8>) -> MemPlugin {
        MemPlugin {
            data: RwLock::new(data),
        }
    }

    fn check_range(&self, count: usize, offset: u64) -> OpResult<usize> {
        let len = self.data.read().len();
        let offset = usize::try_from(offset)
            .map_err(|_| DeviceError::overflow("offset does not fit in memory"))?;
        if offset.checked_add(count).map_or(true, |end| end > len) {
            return Err(DeviceError::io("request beyond the end of the disk"));
        }
        Ok(offset)
    }
}

impl Plugin for MemPlugin {
    fn name(&self) -> &str {
        "memory"
    }

    fn longname(&self) -> &str {
        "RAM-backed disk plugin"
    }

    fn config_help(&self) -> &str {
        "size=<SIZE>             Size of the backing disk."
    }

    fn magic_config_key(&self) -> Option<&str> {
        Some("size")
    }

    fn config(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        match key {
            "size" => {
                let size = human_size_parse(value)?;
                self.data.write().resize(size as usize, 0);
                Ok(())
            }
            _ => Err(crate::config::ConfigError::UnknownKey(key.to_string())),
        }
    }

    fn open(&self, readonly: bool) -> OpResult<Handle> {
        Ok(Handle::new(MemConn { readonly }))
    }

    fn get_size(&self, _h: &Handle) -> OpResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn can_write(&self, h: &Handle) -> OpResult<bool> {
        let conn = h
            .get::<MemConn>()
            .ok_or_else(|| DeviceError::inval("memory: wrong handle type"))?;
        Ok(!conn.readonly)
    }

    fn can_flush(&self, _h: &Handle) -> OpResult<bool> {
        Ok(true)
    }

    fn can_trim(&self, _h: &Handle) -> OpResult<bool> {
        Ok(true)
    }

    fn can_fast_zero(&self, _h: &Handle) -> OpResult<bool> {
        Ok(true)
    }

    fn can_extents(&self, _h: &Handle) -> OpResult<bool> {
        Ok(true)
    }

    /// Nothing outlives the process, so FUA is trivially native.
    fn can_fua(&self, _h: &Handle) -> OpResult<FuaMode> {
        Ok(FuaMode::Native)
    }

    fn can_multi_conn(&self, _h: &Handle) -> OpResult<bool> {
        Ok(true)
    }

    fn can_cache(&self, _h: &Handle) -> OpResult<CacheMode> {
        Ok(CacheMode::Native)
    }

    fn pread(&self, _h: &Handle, buf: &mut [u8], offset: u64, _flags: CmdFlags) -> OpResult<()> {
        let offset = self.check_range(buf.len(), offset)?;
        buf.copy_from_slice(&self.data.read()[offset..offset + buf.len()]);
        Ok(())
    }

    fn pwrite(&self, h: &Handle, buf: &[u8], offset: u64, _flags: CmdFlags) -> OpResult<()> {
        if !self.can_write(h)? {
            return Err(DeviceError::rofs("connection is read-only"));
        }
        let offset = self.check_range(buf.len(), offset)?;
        self.data.write()[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self, _h: &Handle, _flags: CmdFlags) -> OpResult<()> {
        Ok(())
    }

    fn zero(&self, h: &Handle, count: u32, offset: u64, _flags: CmdFlags) -> OpResult<()> {
        if !self.can_write(h)? {
            return Err(DeviceError::rofs("connection is read-only"));
        }
        let offset = self.check_range(count as usize, offset)?;
        self.data.write()[offset..offset + count as usize].fill(0);
        Ok(())
    }

    /// Trimmed ranges read back as zeroes.
    fn trim(&self, h: &Handle, count: u32, offset: u64, flags: CmdFlags) -> OpResult<()> {
        self.zero(h, count, offset, flags)
    }

    fn cache(&self, _h: &Handle, _count: u32, _offset: u64, _flags: CmdFlags) -> OpResult<()> {
        Ok(())
    }
}
