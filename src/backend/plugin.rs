//! The terminal layer of a chain: the plugin that sources actual bytes.
//!
//! A plugin exposes the same operation surface as a filter but has no
//! `next` layer.  A minimal plugin implements `open`, `get_size` and
//! `pread`; everything else carries a sensible default.  Operations a
//! plugin does not implement natively are emulated by the terminal
//! dispatch in [`Context`](super::Context): zero falls back to writing
//! zeroes, FUA-emulation appends a flush, cache-emulation reads into a
//! scratch buffer.

use crate::api::{
    BlockSize, CacheMode, CmdFlags, DeviceError, ExtentFlags, Extents, FuaMode, OpResult,
    ThreadModel,
};
use crate::config::ConfigResult;

use super::{Export, Handle, API_VERSION};

/// A data source terminating a backend chain.
///
/// All methods other than `name`, `get_size` and `pread` are optional.
pub trait Plugin: Send + Sync + 'static {
    /// Short name of the plugin, used in logs and diagnostics.
    fn name(&self) -> &str;

    /// Human-readable long name.
    fn longname(&self) -> &str {
        self.name()
    }

    /// One-line description.
    fn description(&self) -> &str {
        ""
    }

    /// Version string; must match the runtime's exactly.
    fn version(&self) -> &str {
        crate::VERSION
    }

    /// Layer interface version; must equal [`API_VERSION`].
    fn api_version(&self) -> u32 {
        API_VERSION
    }

    /// Help text for the configuration keys this plugin understands.
    fn config_help(&self) -> &str {
        ""
    }

    /// The key assumed when a bare value is passed on a command line.
    fn magic_config_key(&self) -> Option<&str> {
        None
    }

    /// Called once when the plugin is registered.
    fn load(&mut self) {}

    /// Called once at teardown.  Failures are logged, never propagated.
    fn unload(&self) {}

    /// Receive one configuration key.  Unknown keys are errors at the
    /// terminal: there is no further layer to pass them to.
    fn config(&mut self, key: &str, _value: &str) -> ConfigResult<()> {
        Err(crate::config::ConfigError::UnknownKey(key.to_string()))
    }

    /// Configuration is complete; validate cross-key constraints.
    fn config_complete(&mut self) -> ConfigResult<()> {
        Ok(())
    }

    /// Concurrency contract this plugin can honor.
    fn thread_model(&self) -> ThreadModel {
        ThreadModel::Parallel
    }

    /// Last startup hook before the chain freezes; receives the negotiated
    /// thread model.
    fn get_ready(&mut self, _final_model: ThreadModel) -> ConfigResult<()> {
        Ok(())
    }

    /// Runs after the outer server has forked into the background.
    fn after_fork(&self) -> ConfigResult<()> {
        Ok(())
    }

    /// Teardown hook, runs before unload.
    fn cleanup(&self) {}

    /// Early accept/reject of a connection before open.
    fn preconnect(&self, _readonly: bool) -> OpResult<()> {
        Ok(())
    }

    /// Exports this plugin offers.
    fn list_exports(&self, _readonly: bool) -> OpResult<Vec<Export>> {
        Ok(Vec::new())
    }

    /// The export used when a client requests the empty name.
    fn default_export(&self, _readonly: bool) -> OpResult<String> {
        Ok(String::new())
    }

    /// Extra key=value diagnostics for introspection.
    fn dump_plugin(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Open a per-connection handle.  The handle is passed verbatim to
    /// every subsequent per-connection call.
    fn open(&self, _readonly: bool) -> OpResult<Handle> {
        Ok(Handle::not_needed())
    }

    /// Per-connection teardown.
    fn close(&self, _handle: &Handle) {}

    /// Free-form description of the open export.
    fn export_description(&self, _handle: &Handle) -> OpResult<Option<String>> {
        Ok(None)
    }

    /// Size of the device in bytes.
    fn get_size(&self, handle: &Handle) -> OpResult<u64>;

    /// Block-size constraints; `None` means unconstrained.
    fn block_size(&self, _handle: &Handle) -> OpResult<Option<BlockSize>> {
        Ok(None)
    }

    /// Are writes accepted?  Off unless the plugin implements them.
    fn can_write(&self, _handle: &Handle) -> OpResult<bool> {
        Ok(false)
    }

    /// Is flush implemented?
    fn can_flush(&self, _handle: &Handle) -> OpResult<bool> {
        Ok(false)
    }

    /// Is the data source backed by rotational media?
    fn is_rotational(&self, _handle: &Handle) -> OpResult<bool> {
        Ok(false)
    }

    /// Is trim implemented?
    fn can_trim(&self, _handle: &Handle) -> OpResult<bool> {
        Ok(false)
    }

    /// Writable plugins get zero emulation via `pwrite` for free.
    fn can_zero(&self, handle: &Handle) -> OpResult<bool> {
        self.can_write(handle)
    }

    /// Is zeroing guaranteed cheaper than an equivalent write?
    fn can_fast_zero(&self, _handle: &Handle) -> OpResult<bool> {
        Ok(false)
    }

    /// Are extent queries implemented?
    fn can_extents(&self, _handle: &Handle) -> OpResult<bool> {
        Ok(false)
    }

    /// Flush-capable plugins get FUA emulation for free.
    fn can_fua(&self, handle: &Handle) -> OpResult<FuaMode> {
        Ok(if self.can_flush(handle)? {
            FuaMode::Emulate
        } else {
            FuaMode::None
        })
    }

    /// Do multiple connections observe a consistent view?
    fn can_multi_conn(&self, _handle: &Handle) -> OpResult<bool> {
        Ok(false)
    }

    /// How cache (prefetch) requests are honored.
    fn can_cache(&self, _handle: &Handle) -> OpResult<CacheMode> {
        Ok(CacheMode::None)
    }

    /// Read `buf.len()` bytes at `offset`.
    fn pread(&self, handle: &Handle, buf: &mut [u8], offset: u64, flags: CmdFlags) -> OpResult<()>;

    /// Write `buf` at `offset`.
    fn pwrite(
        &self,
        _handle: &Handle,
        _buf: &[u8],
        _offset: u64,
        _flags: CmdFlags,
    ) -> OpResult<()> {
        Err(DeviceError::rofs("pwrite is not implemented"))
    }

    /// Make acknowledged writes durable.
    fn flush(&self, _handle: &Handle, _flags: CmdFlags) -> OpResult<()> {
        Err(DeviceError::inval("flush is not implemented"))
    }

    /// Advisory deallocation.
    fn trim(&self, _handle: &Handle, _count: u32, _offset: u64, _flags: CmdFlags) -> OpResult<()> {
        Err(DeviceError::inval("trim is not implemented"))
    }

    /// Write zeroes.  The default reports `NotSup`, which the terminal
    /// dispatch turns into a `pwrite` fallback.
    fn zero(&self, _handle: &Handle, _count: u32, _offset: u64, _flags: CmdFlags) -> OpResult<()> {
        Err(DeviceError::not_sup("zero is not implemented"))
    }

    /// Populate `extents` for `[offset, offset+count)`.  The default
    /// reports the whole range as allocated data.
    fn extents(
        &self,
        _handle: &Handle,
        count: u32,
        offset: u64,
        _flags: CmdFlags,
        extents: &mut Extents,
    ) -> OpResult<()> {
        extents.add(offset, u64::from(count), ExtentFlags::allocated())
    }

    /// Advisory prefetch, only called when `can_cache` is `Native`.
    fn cache(&self, _handle: &Handle, _count: u32, _offset: u64, _flags: CmdFlags) -> OpResult<()> {
        Err(DeviceError::inval("cache is not implemented"))
    }
}

/// Zero a range by writing zero buffers through `pwrite`.
pub(crate) fn emulate_zero(
    plugin: &dyn Plugin,
    handle: &Handle,
    count: u32,
    offset: u64,
    flags: CmdFlags,
) -> OpResult<()> {
    const CHUNK: usize = 64 * 1024;
    let zeroes = vec![0u8; CHUNK.min(count as usize)];
    let mut remaining = count as usize;
    let mut offset = offset;
    while remaining > 0 {
        let n = remaining.min(CHUNK);
        plugin.pwrite(handle, &zeroes[..n], offset, flags)?;
        offset += n as u64;
        remaining -= n;
    }
    Ok(())
}

/// Emulate an advisory cache request by reading into a scratch buffer.
pub(crate) fn emulate_cache(
    plugin: &dyn Plugin,
    handle: &Handle,
    count: u32,
    offset: u64,
    flags: CmdFlags,
) -> OpResult<()> {
    const CHUNK: usize = 64 * 1024;
    let mut scratch = vec![0u8; CHUNK.min(count as usize)];
    let mut remaining = count as usize;
    let mut offset = offset;
    while remaining > 0 {
        let n = remaining.min(CHUNK);
        plugin.pread(handle, &mut scratch[..n], offset, flags)?;
        offset += n as u64;
        remaining -= n;
    }
    Ok(())
}
