//! The filter trait: one non-terminal layer of the chain.
//!
//! Every method has a default body that forwards the request to the next
//! layer unchanged, so a filter only implements the operations it actually
//! transforms.  Data operations receive a [`NextCtx`] view of the layer
//! below plus the filter's own per-connection [`Handle`].

use crate::api::{
    BlockSize, CacheMode, CmdFlags, Extents, FuaMode, OpResult, ThreadModel,
};
use crate::config::ConfigResult;

use super::context::{NextCtx, NextOpen};
use super::{ConfigStatus, Export, Handle, API_VERSION};

/// A transforming layer stacked over the next layer down.
pub trait Filter: Send + Sync + 'static {
    /// Short name of the filter, used in logs and diagnostics.
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

    /// Help text for the configuration keys this filter understands.
    fn config_help(&self) -> &str {
        ""
    }

    /// Called once when the filter is registered.
    fn load(&mut self) {}

    /// Called once at teardown.
    fn unload(&self) {}

    /// Receive one configuration key.  Return [`ConfigStatus::Unhandled`]
    /// to pass the key to the next layer inward.
    fn config(&mut self, _key: &str, _value: &str) -> ConfigResult<ConfigStatus> {
        Ok(ConfigStatus::Unhandled)
    }

    /// Configuration is complete; validate cross-key constraints.
    fn config_complete(&mut self) -> ConfigResult<()> {
        Ok(())
    }

    /// Concurrency contract this filter can honor.
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

    /// Teardown hook, runs before unload, outer-to-inner.
    fn cleanup(&self) {}

    /// Early accept/reject of a connection.  `next` descends the chain.
    fn preconnect(&self, next: &dyn Fn(bool) -> OpResult<()>, readonly: bool) -> OpResult<()> {
        next(readonly)
    }

    /// Exports offered through this filter.
    fn list_exports(
        &self,
        next: &dyn Fn(bool) -> OpResult<Vec<Export>>,
        readonly: bool,
    ) -> OpResult<Vec<Export>> {
        next(readonly)
    }

    /// The export used when a client requests the empty name.
    fn default_export(
        &self,
        next: &dyn Fn(bool) -> OpResult<String>,
        readonly: bool,
    ) -> OpResult<String> {
        next(readonly)
    }

    /// Extra key=value diagnostics for introspection.
    fn dump_plugin(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Open a per-connection handle.
    ///
    /// The filter must invoke `next.open(..)` exactly once at the point its
    /// design requires; most filters call it first, giving inner-to-outer
    /// completion.  Returning without having opened the next context is an
    /// open-time error.
    fn open(&self, next: NextOpen<'_>, readonly: bool, exportname: &str) -> OpResult<Handle> {
        next.open(readonly, exportname)?;
        Ok(Handle::not_needed())
    }

    /// Per-connection teardown; the next context is destroyed before this
    /// runs.
    fn close(&self, _handle: &Handle) {}

    /// Runs inner-to-outer after open, before the first data operation.
    fn prepare(&self, _next: &NextCtx<'_>, _handle: &Handle, _readonly: bool) -> OpResult<()> {
        Ok(())
    }

    /// Runs outer-to-inner before close.
    fn finalize(&self, _next: &NextCtx<'_>, _handle: &Handle) -> OpResult<()> {
        Ok(())
    }

    /// Free-form description of the open export.
    fn export_description(
        &self,
        next: &NextCtx<'_>,
        _handle: &Handle,
    ) -> OpResult<Option<String>> {
        next.export_description()
    }

    /// Size of the device as seen through this filter.
    fn get_size(&self, next: &NextCtx<'_>, _handle: &Handle) -> OpResult<u64> {
        next.get_size()
    }

    /// Block-size constraints as seen through this filter.
    fn block_size(&self, next: &NextCtx<'_>, _handle: &Handle) -> OpResult<Option<BlockSize>> {
        next.block_size()
    }

    /// Does this layer accept writes?
    fn can_write(&self, next: &NextCtx<'_>, _handle: &Handle) -> OpResult<bool> {
        next.can_write()
    }

    /// Does this layer implement flush?
    fn can_flush(&self, next: &NextCtx<'_>, _handle: &Handle) -> OpResult<bool> {
        next.can_flush()
    }

    /// Is this layer backed by rotational media?
    fn is_rotational(&self, next: &NextCtx<'_>, _handle: &Handle) -> OpResult<bool> {
        next.is_rotational()
    }

    /// Does this layer implement trim?
    fn can_trim(&self, next: &NextCtx<'_>, _handle: &Handle) -> OpResult<bool> {
        next.can_trim()
    }

    /// Does this layer implement zero?
    fn can_zero(&self, next: &NextCtx<'_>, _handle: &Handle) -> OpResult<bool> {
        next.can_zero()
    }

    /// Can this layer zero faster than an equivalent write?
    fn can_fast_zero(&self, next: &NextCtx<'_>, _handle: &Handle) -> OpResult<bool> {
        next.can_fast_zero()
    }

    /// Does this layer implement extent queries?
    fn can_extents(&self, next: &NextCtx<'_>, _handle: &Handle) -> OpResult<bool> {
        next.can_extents()
    }

    /// How this layer honors force-unit-access writes.
    fn can_fua(&self, next: &NextCtx<'_>, _handle: &Handle) -> OpResult<FuaMode> {
        next.can_fua()
    }

    /// Is this layer consistent across connections?
    fn can_multi_conn(&self, next: &NextCtx<'_>, _handle: &Handle) -> OpResult<bool> {
        next.can_multi_conn()
    }

    /// How this layer honors cache requests.
    fn can_cache(&self, next: &NextCtx<'_>, _handle: &Handle) -> OpResult<CacheMode> {
        next.can_cache()
    }

    /// Read `buf.len()` bytes at `offset`.
    fn pread(
        &self,
        next: &NextCtx<'_>,
        _handle: &Handle,
        buf: &mut [u8],
        offset: u64,
        flags: CmdFlags,
    ) -> OpResult<()> {
        next.pread(buf, offset, flags)
    }

    /// Write `buf` at `offset`.
    fn pwrite(
        &self,
        next: &NextCtx<'_>,
        _handle: &Handle,
        buf: &[u8],
        offset: u64,
        flags: CmdFlags,
    ) -> OpResult<()> {
        next.pwrite(buf, offset, flags)
    }

    /// Make acknowledged writes durable.
    fn flush(&self, next: &NextCtx<'_>, _handle: &Handle, flags: CmdFlags) -> OpResult<()> {
        next.flush(flags)
    }

    /// Advisory deallocation.
    fn trim(
        &self,
        next: &NextCtx<'_>,
        _handle: &Handle,
        count: u32,
        offset: u64,
        flags: CmdFlags,
    ) -> OpResult<()> {
        next.trim(count, offset, flags)
    }

    /// Write zeroes.
    fn zero(
        &self,
        next: &NextCtx<'_>,
        _handle: &Handle,
        count: u32,
        offset: u64,
        flags: CmdFlags,
    ) -> OpResult<()> {
        next.zero(count, offset, flags)
    }

    /// Populate `extents` for `[offset, offset+count)`.
    fn extents(
        &self,
        next: &NextCtx<'_>,
        _handle: &Handle,
        count: u32,
        offset: u64,
        flags: CmdFlags,
        extents: &mut Extents,
    ) -> OpResult<()> {
        next.extents(count, offset, flags, extents)
    }

    /// Advisory prefetch.
    fn cache(
        &self,
        next: &NextCtx<'_>,
        _handle: &Handle,
        count: u32,
        offset: u64,
        flags: CmdFlags,
    ) -> OpResult<()> {
        next.cache(count, offset, flags)
    }
}
