//! Per-connection state: the context stack.
//!
//! A [`Context`] pairs one layer of the chain with the handle that layer's
//! `open` produced, plus an owning pointer to the context of the layer
//! below.  The stack of contexts mirrors the stack of backends one-for-one.
//! Dispatching an operation through a context invokes the layer's filter
//! (or the terminal plugin) with *that* context's handle - never the handle
//! of an adjacent layer.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

use crate::api::{
    BlockSize, CacheMode, Caps, CmdFlags, DeviceError, ErrorKind, Extents, FuaMode, OpResult,
};

use super::plugin::{emulate_cache, emulate_zero};
use super::{Backend, BackendKind, Handle};

/// Per-connection, per-layer state record.
pub struct Context {
    backend: Arc<Backend>,
    handle: Handle,
    /// Context of the layer below; `None` at the plugin terminal.  Swapped
    /// under the write lock by reopening filters (retry).
    next: RwLock<Option<Arc<Context>>>,
    /// Capability cache, filled when the context is prepared.
    caps: OnceCell<Caps>,
    prepared: Mutex<bool>,
}

impl Backend {
    /// Open a connection through this layer and every layer below it.
    pub fn open(self: &Arc<Backend>, readonly: bool, exportname: &str) -> OpResult<Arc<Context>> {
        log::debug!("{}: open readonly={} export={:?}", self.name(), readonly, exportname);
        match &self.kind {
            BackendKind::Terminal { plugin } => {
                let handle = plugin.open(readonly)?;
                Ok(Arc::new(Context {
                    backend: Arc::clone(self),
                    handle,
                    next: RwLock::new(None),
                    caps: OnceCell::new(),
                    prepared: Mutex::new(false),
                }))
            }
            BackendKind::Filter { filter, next } => {
                let slot = Mutex::new(None);
                let handle = filter.open(
                    NextOpen {
                        backend: next,
                        slot: &slot,
                    },
                    readonly,
                    exportname,
                )?;
                let next_ctx = slot.into_inner().ok_or_else(|| {
                    DeviceError::inval(format!(
                        "filter {}: open returned without opening the next context",
                        self.name()
                    ))
                })?;
                Ok(Arc::new(Context {
                    backend: Arc::clone(self),
                    handle,
                    next: RwLock::new(Some(next_ctx)),
                    caps: OnceCell::new(),
                    prepared: Mutex::new(false),
                }))
            }
        }
    }
}

/// Token handed to a filter's `open`, giving it one chance (or several, for
/// reopening filters) to open the context of the layer below.
pub struct NextOpen<'a> {
    backend: &'a Arc<Backend>,
    slot: &'a Mutex<Option<Arc<Context>>>,
}

impl NextOpen<'_> {
    /// Open the next layer's context.  On success the context is installed
    /// into the chain being built; a later successful call replaces it.
    pub fn open(&self, readonly: bool, exportname: &str) -> OpResult<()> {
        let ctx = self.backend.open(readonly, exportname)?;
        *self.slot.lock() = Some(ctx);
        Ok(())
    }
}

/// A filter's view of the layer below its context.
///
/// Exposes the full operation surface of the next context plus the
/// connection-management calls reopening filters need.
pub struct NextCtx<'a> {
    ctx: &'a Context,
}

impl NextCtx<'_> {
    fn next(&self) -> OpResult<Arc<Context>> {
        self.ctx
            .next
            .read()
            .clone()
            .ok_or_else(|| DeviceError::shutdown("next context is closed"))
    }

    /// Size of the next layer's device.
    pub fn get_size(&self) -> OpResult<u64> {
        self.next()?.get_size()
    }

    /// Block-size constraints of the next layer.
    pub fn block_size(&self) -> OpResult<Option<BlockSize>> {
        self.next()?.block_size()
    }

    /// Export description of the next layer.
    pub fn export_description(&self) -> OpResult<Option<String>> {
        self.next()?.export_description()
    }

    /// Does the next layer accept writes?
    pub fn can_write(&self) -> OpResult<bool> {
        self.next()?.can_write()
    }

    /// Does the next layer implement flush?
    pub fn can_flush(&self) -> OpResult<bool> {
        self.next()?.can_flush()
    }

    /// Is the next layer backed by rotational media?
    pub fn is_rotational(&self) -> OpResult<bool> {
        self.next()?.is_rotational()
    }

    /// Does the next layer implement trim?
    pub fn can_trim(&self) -> OpResult<bool> {
        self.next()?.can_trim()
    }

    /// Does the next layer implement zero?
    pub fn can_zero(&self) -> OpResult<bool> {
        self.next()?.can_zero()
    }

    /// Can the next layer zero faster than an equivalent write?
    pub fn can_fast_zero(&self) -> OpResult<bool> {
        self.next()?.can_fast_zero()
    }

    /// Does the next layer implement extent queries?
    pub fn can_extents(&self) -> OpResult<bool> {
        self.next()?.can_extents()
    }

    /// How the next layer honors force-unit-access writes.
    pub fn can_fua(&self) -> OpResult<FuaMode> {
        self.next()?.can_fua()
    }

    /// Is the next layer consistent across connections?
    pub fn can_multi_conn(&self) -> OpResult<bool> {
        self.next()?.can_multi_conn()
    }

    /// How the next layer honors cache requests.
    pub fn can_cache(&self) -> OpResult<CacheMode> {
        self.next()?.can_cache()
    }

    /// Read from the next layer.
    pub fn pread(&self, buf: &mut [u8], offset: u64, flags: CmdFlags) -> OpResult<()> {
        self.next()?.pread(buf, offset, flags)
    }

    /// Write to the next layer.
    pub fn pwrite(&self, buf: &[u8], offset: u64, flags: CmdFlags) -> OpResult<()> {
        self.next()?.pwrite(buf, offset, flags)
    }

    /// Flush the next layer.
    pub fn flush(&self, flags: CmdFlags) -> OpResult<()> {
        self.next()?.flush(flags)
    }

    /// Trim a range of the next layer.
    pub fn trim(&self, count: u32, offset: u64, flags: CmdFlags) -> OpResult<()> {
        self.next()?.trim(count, offset, flags)
    }

    /// Zero a range of the next layer.
    pub fn zero(&self, count: u32, offset: u64, flags: CmdFlags) -> OpResult<()> {
        self.next()?.zero(count, offset, flags)
    }

    /// Query extents of the next layer.
    pub fn extents(
        &self,
        count: u32,
        offset: u64,
        flags: CmdFlags,
        extents: &mut Extents,
    ) -> OpResult<()> {
        self.next()?.extents(count, offset, flags, extents)
    }

    /// Ask the next layer to prefetch a range.
    pub fn cache(&self, count: u32, offset: u64, flags: CmdFlags) -> OpResult<()> {
        self.next()?.cache(count, offset, flags)
    }

    /// Detach and return the next context, leaving the connection without
    /// one.  Used by reopening filters before tearing the old context down.
    pub fn take(&self) -> Option<Arc<Context>> {
        self.ctx.next.write().take()
    }

    /// Install a freshly opened next context.
    pub fn install(&self, new: Arc<Context>) {
        *self.ctx.next.write() = Some(new);
    }

    /// Open a new context below this layer without installing it.
    pub fn reconnect(&self, readonly: bool, exportname: &str) -> OpResult<Arc<Context>> {
        match &self.ctx.backend.kind {
            BackendKind::Filter { next, .. } => next.open(readonly, exportname),
            BackendKind::Terminal { .. } => {
                Err(DeviceError::inval("the plugin terminal has no next layer"))
            }
        }
    }
}

impl Context {
    fn as_next(&self) -> NextCtx<'_> {
        NextCtx { ctx: self }
    }

    /// The layer this context belongs to.
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// This layer's own handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run the prepare hooks, inner-to-outer, then cache this layer's
    /// capabilities.  Idempotent per context.
    pub fn prepare(&self, readonly: bool) -> OpResult<()> {
        {
            let mut prepared = self.prepared.lock();
            if *prepared {
                return Ok(());
            }
            *prepared = true;
        }
        if let Some(next) = self.next.read().clone() {
            next.prepare(readonly)?;
        }
        if let BackendKind::Filter { filter, .. } = &self.backend.kind {
            filter.prepare(&self.as_next(), &self.handle, readonly)?;
        }
        let caps = Caps {
            can_write: self.can_write()?,
            can_flush: self.can_flush()?,
            is_rotational: self.is_rotational()?,
            can_trim: self.can_trim()?,
            can_zero: self.can_zero()?,
            can_fast_zero: self.can_fast_zero()?,
            can_extents: self.can_extents()?,
            can_fua: self.can_fua()?,
            can_multi_conn: self.can_multi_conn()?,
            can_cache: self.can_cache()?,
            block_size: self.block_size()?,
        };
        let _ = self.caps.set(caps);
        Ok(())
    }

    /// Run the finalize hooks, outer-to-inner.
    pub fn finalize(&self) -> OpResult<()> {
        if let BackendKind::Filter { filter, .. } = &self.backend.kind {
            filter.finalize(&self.as_next(), &self.handle)?;
        }
        if let Some(next) = self.next.read().clone() {
            next.finalize()?;
        }
        Ok(())
    }

    /// The cached capability record, available once prepared.
    pub fn caps(&self) -> Option<&Caps> {
        self.caps.get()
    }

    /// Size of the device as seen through this layer.
    pub fn get_size(&self) -> OpResult<u64> {
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => filter.get_size(&self.as_next(), &self.handle),
            BackendKind::Terminal { plugin } => plugin.get_size(&self.handle),
        }
    }

    /// Block-size constraints as seen through this layer.
    pub fn block_size(&self) -> OpResult<Option<BlockSize>> {
        if let Some(c) = self.caps.get() {
            return Ok(c.block_size);
        }
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => filter.block_size(&self.as_next(), &self.handle),
            BackendKind::Terminal { plugin } => plugin.block_size(&self.handle),
        }
    }

    /// Free-form description of the open export.
    pub fn export_description(&self) -> OpResult<Option<String>> {
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => {
                filter.export_description(&self.as_next(), &self.handle)
            }
            BackendKind::Terminal { plugin } => plugin.export_description(&self.handle),
        }
    }

    /// Does this layer accept writes?
    pub fn can_write(&self) -> OpResult<bool> {
        if let Some(c) = self.caps.get() {
            return Ok(c.can_write);
        }
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => filter.can_write(&self.as_next(), &self.handle),
            BackendKind::Terminal { plugin } => plugin.can_write(&self.handle),
        }
    }

    /// Does this layer implement flush?
    pub fn can_flush(&self) -> OpResult<bool> {
        if let Some(c) = self.caps.get() {
            return Ok(c.can_flush);
        }
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => filter.can_flush(&self.as_next(), &self.handle),
            BackendKind::Terminal { plugin } => plugin.can_flush(&self.handle),
        }
    }

    /// Is this layer backed by rotational media?
    pub fn is_rotational(&self) -> OpResult<bool> {
        if let Some(c) = self.caps.get() {
            return Ok(c.is_rotational);
        }
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => {
                filter.is_rotational(&self.as_next(), &self.handle)
            }
            BackendKind::Terminal { plugin } => plugin.is_rotational(&self.handle),
        }
    }

    /// Does this layer implement trim?
    pub fn can_trim(&self) -> OpResult<bool> {
        if let Some(c) = self.caps.get() {
            return Ok(c.can_trim);
        }
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => filter.can_trim(&self.as_next(), &self.handle),
            BackendKind::Terminal { plugin } => plugin.can_trim(&self.handle),
        }
    }

    /// Does this layer implement zero?
    pub fn can_zero(&self) -> OpResult<bool> {
        if let Some(c) = self.caps.get() {
            return Ok(c.can_zero);
        }
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => filter.can_zero(&self.as_next(), &self.handle),
            BackendKind::Terminal { plugin } => plugin.can_zero(&self.handle),
        }
    }

    /// Can this layer zero faster than an equivalent write?
    pub fn can_fast_zero(&self) -> OpResult<bool> {
        if let Some(c) = self.caps.get() {
            return Ok(c.can_fast_zero);
        }
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => {
                filter.can_fast_zero(&self.as_next(), &self.handle)
            }
            BackendKind::Terminal { plugin } => plugin.can_fast_zero(&self.handle),
        }
    }

    /// Does this layer implement extent queries?
    pub fn can_extents(&self) -> OpResult<bool> {
        if let Some(c) = self.caps.get() {
            return Ok(c.can_extents);
        }
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => filter.can_extents(&self.as_next(), &self.handle),
            BackendKind::Terminal { plugin } => plugin.can_extents(&self.handle),
        }
    }

    /// How this layer honors force-unit-access writes.
    pub fn can_fua(&self) -> OpResult<FuaMode> {
        if let Some(c) = self.caps.get() {
            return Ok(c.can_fua);
        }
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => filter.can_fua(&self.as_next(), &self.handle),
            BackendKind::Terminal { plugin } => plugin.can_fua(&self.handle),
        }
    }

    /// Is this layer consistent across connections?
    pub fn can_multi_conn(&self) -> OpResult<bool> {
        if let Some(c) = self.caps.get() {
            return Ok(c.can_multi_conn);
        }
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => {
                filter.can_multi_conn(&self.as_next(), &self.handle)
            }
            BackendKind::Terminal { plugin } => plugin.can_multi_conn(&self.handle),
        }
    }

    /// How this layer honors cache requests.
    pub fn can_cache(&self) -> OpResult<CacheMode> {
        if let Some(c) = self.caps.get() {
            return Ok(c.can_cache);
        }
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => filter.can_cache(&self.as_next(), &self.handle),
            BackendKind::Terminal { plugin } => plugin.can_cache(&self.handle),
        }
    }

    /// Read `buf.len()` bytes at `offset`.  FUA is ignored on reads.
    pub fn pread(&self, buf: &mut [u8], offset: u64, flags: CmdFlags) -> OpResult<()> {
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => {
                filter.pread(&self.as_next(), &self.handle, buf, offset, flags)
            }
            BackendKind::Terminal { plugin } => plugin.pread(&self.handle, buf, offset, flags),
        }
    }

    /// Write `buf` at `offset`.
    pub fn pwrite(&self, buf: &[u8], offset: u64, flags: CmdFlags) -> OpResult<()> {
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => {
                filter.pwrite(&self.as_next(), &self.handle, buf, offset, flags)
            }
            BackendKind::Terminal { plugin } => {
                let emulate_fua = flags.contains(CmdFlags::FUA)
                    && plugin.can_fua(&self.handle)? == FuaMode::Emulate;
                if emulate_fua {
                    plugin.pwrite(&self.handle, buf, offset, flags.without(CmdFlags::FUA))?;
                    plugin.flush(&self.handle, CmdFlags::empty())
                } else {
                    plugin.pwrite(&self.handle, buf, offset, flags)
                }
            }
        }
    }

    /// Make previously acknowledged writes durable.
    pub fn flush(&self, flags: CmdFlags) -> OpResult<()> {
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => {
                filter.flush(&self.as_next(), &self.handle, flags)
            }
            BackendKind::Terminal { plugin } => plugin.flush(&self.handle, flags),
        }
    }

    /// Advisory deallocation of `[offset, offset+count)`.
    pub fn trim(&self, count: u32, offset: u64, flags: CmdFlags) -> OpResult<()> {
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => {
                filter.trim(&self.as_next(), &self.handle, count, offset, flags)
            }
            BackendKind::Terminal { plugin } => {
                let emulate_fua = flags.contains(CmdFlags::FUA)
                    && plugin.can_fua(&self.handle)? == FuaMode::Emulate;
                if emulate_fua {
                    plugin.trim(&self.handle, count, offset, flags.without(CmdFlags::FUA))?;
                    plugin.flush(&self.handle, CmdFlags::empty())
                } else {
                    plugin.trim(&self.handle, count, offset, flags)
                }
            }
        }
    }

    /// Zero `[offset, offset+count)`.
    pub fn zero(&self, count: u32, offset: u64, flags: CmdFlags) -> OpResult<()> {
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => {
                filter.zero(&self.as_next(), &self.handle, count, offset, flags)
            }
            BackendKind::Terminal { plugin } => {
                let fast = flags.contains(CmdFlags::FAST_ZERO);
                if fast && !plugin.can_fast_zero(&self.handle)? {
                    return Err(DeviceError::not_sup(
                        "fast zero is not supported by this plugin",
                    ));
                }
                let emulate_fua = flags.contains(CmdFlags::FUA)
                    && plugin.can_fua(&self.handle)? == FuaMode::Emulate;
                let inner = if emulate_fua {
                    flags.without(CmdFlags::FUA)
                } else {
                    flags
                };
                match plugin.zero(&self.handle, count, offset, inner) {
                    Ok(()) => {}
                    // The plugin has no native zero; writing zeroes is
                    // always a valid fallback, except under FAST_ZERO.
                    Err(e) if e.kind() == ErrorKind::NotSup && !fast => {
                        emulate_zero(
                            &**plugin,
                            &self.handle,
                            count,
                            offset,
                            inner.without(CmdFlags::MAY_TRIM),
                        )?;
                    }
                    Err(e) => return Err(e),
                }
                if emulate_fua {
                    plugin.flush(&self.handle, CmdFlags::empty())?;
                }
                Ok(())
            }
        }
    }

    /// Populate `extents` for `[offset, offset+count)`.
    pub fn extents(
        &self,
        count: u32,
        offset: u64,
        flags: CmdFlags,
        extents: &mut Extents,
    ) -> OpResult<()> {
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => {
                filter.extents(&self.as_next(), &self.handle, count, offset, flags, extents)
            }
            BackendKind::Terminal { plugin } => {
                plugin.extents(&self.handle, count, offset, flags, extents)
            }
        }
    }

    /// Advisory prefetch of `[offset, offset+count)`.
    pub fn cache(&self, count: u32, offset: u64, flags: CmdFlags) -> OpResult<()> {
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => {
                filter.cache(&self.as_next(), &self.handle, count, offset, flags)
            }
            BackendKind::Terminal { plugin } => match plugin.can_cache(&self.handle)? {
                CacheMode::None => Err(DeviceError::not_sup(
                    "cache is not supported by this plugin",
                )),
                CacheMode::Emulate => {
                    emulate_cache(&**plugin, &self.handle, count, offset, flags)
                }
                CacheMode::Native => plugin.cache(&self.handle, count, offset, flags),
            },
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Close runs outer-to-inner: this layer's close first, then the
        // rest of the stack.
        match &self.backend.kind {
            BackendKind::Filter { filter, .. } => filter.close(&self.handle),
            BackendKind::Terminal { plugin } => plugin.close(&self.handle),
        }
        let next = self.next.write().take();
        drop(next);
    }
}
