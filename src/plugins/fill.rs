//! Constant-byte plugin: a disk where every byte reads the same value.
//!
//! Handy for benchmarking the chain without touching storage, and as a
//! trivially verifiable data source in tests.  Writes, zeroes and trims
//! are accepted and discarded.

use crate::api::{CacheMode, CmdFlags, ExtentFlags, Extents, FuaMode, OpResult};
use crate::backend::{Handle, Plugin};
use crate::config::{human_size_parse, parse_u8, ConfigResult};

/// A disk of `size` bytes that all read as `byte`.
pub struct FillPlugin {
    size: u64,
    byte: u8,
}

impl Default for FillPlugin {
    fn default() -> Self {
        FillPlugin { size: 0, byte: 0xff }
    }
}

impl FillPlugin {
    /// A disk of `size` bytes that all read as `byte`.
    pub fn new(size: u64, byte: u8) -> FillPlugin {
        FillPlugin { size, byte }
    }
}

impl Plugin for FillPlugin {
    fn name(&self) -> &str {
        "fill"
    }

    fn longname(&self) -> &str {
        "constant byte plugin"
    }

    fn config_help(&self) -> &str {
        "byte=<BYTE>             Repeating byte to use (default: 0xff).\n\
         size=<SIZE>             Size of the backing disk."
    }

    fn magic_config_key(&self) -> Option<&str> {
        Some("size")
    }

    fn config(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        match key {
            "size" => {
                self.size = human_size_parse(value)?;
                Ok(())
            }
            "byte" => {
                self.byte = parse_u8("byte", value)?;
                Ok(())
            }
            _ => Err(crate::config::ConfigError::UnknownKey(key.to_string())),
        }
    }

    fn open(&self, _readonly: bool) -> OpResult<Handle> {
        Ok(Handle::not_needed())
    }

    fn get_size(&self, _h: &Handle) -> OpResult<u64> {
        Ok(self.size)
    }

    /// The same bytes come back on every connection.
    fn can_multi_conn(&self, _h: &Handle) -> OpResult<bool> {
        Ok(true)
    }

    /// Everything is already in memory; cache is a no-op.
    fn can_cache(&self, _h: &Handle) -> OpResult<CacheMode> {
        Ok(CacheMode::Native)
    }

    fn can_write(&self, _h: &Handle) -> OpResult<bool> {
        Ok(true)
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

    /// Nothing is persistent, so FUA is trivially native.
    fn can_fua(&self, _h: &Handle) -> OpResult<FuaMode> {
        Ok(FuaMode::Native)
    }

    fn pread(&self, _h: &Handle, buf: &mut [u8], _offset: u64, _flags: CmdFlags) -> OpResult<()> {
        buf.fill(self.byte);
        Ok(())
    }

    fn pwrite(&self, _h: &Handle, _buf: &[u8], _offset: u64, _flags: CmdFlags) -> OpResult<()> {
        Ok(())
    }

    fn flush(&self, _h: &Handle, _flags: CmdFlags) -> OpResult<()> {
        Ok(())
    }

    fn trim(&self, _h: &Handle, _count: u32, _offset: u64, _flags: CmdFlags) -> OpResult<()> {
        Ok(())
    }

    fn zero(&self, _h: &Handle, _count: u32, _offset: u64, _flags: CmdFlags) -> OpResult<()> {
        Ok(())
    }

    fn cache(&self, _h: &Handle, _count: u32, _offset: u64, _flags: CmdFlags) -> OpResult<()> {
        Ok(())
    }

    /// One fully allocated data extent covering the entire disk.
    fn extents(
        &self,
        _h: &Handle,
        _count: u32,
        _offset: u64,
        _flags: CmdFlags,
        extents: &mut Extents,
    ) -> OpResult<()> {
        extents.add(0, self.size, ExtentFlags::allocated())
    }
}
