//! Retry filter: reopen the layers below on failure and retry.
//!
//! Every data operation is intercepted.  On failure the filter waits
//! (exponential backoff by default), tears down the next context
//! (finalize + close), opens and prepares a fresh one, and re-issues the
//! original operation, up to a bounded number of attempts.  Useful over
//! plugins whose transport can drop out underneath a long-lived
//! connection, the HTTP source being the canonical example.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::{CmdFlags, DeviceError, Extents, FuaMode, OpResult, ThreadModel};
use crate::backend::{ConfigStatus, Filter, Handle, NextCtx, NextOpen};
use crate::config::{parse_bool, parse_unsigned, ConfigError, ConfigResult};

/// Tunables of the retry state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Number of retries; 0 disables the filter.
    pub retries: u32,
    /// Seconds to wait before the first retry.  Must be nonzero.
    pub delay: u64,
    /// Double the delay after every failed attempt.
    pub exponential: bool,
    /// Reopen read-only after a failure.
    pub force_readonly: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            retries: 5,
            delay: 2,
            exponential: true,
            force_readonly: false,
        }
    }
}

/// The cancellable sleep used between attempts.
///
/// An error return means the wait was interrupted; the retry loop gives up
/// without overwriting the operation's own error.
pub trait Sleeper: Send + Sync {
    /// Wait for `seconds`, or report interruption.
    fn sleep(&self, seconds: u64) -> Result<(), DeviceError>;
}

struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, seconds: u64) -> Result<(), DeviceError> {
        std::thread::sleep(Duration::from_secs(seconds));
        Ok(())
    }
}

/// The retry filter.
pub struct RetryFilter {
    cfg: RetryConfig,
    sleeper: Box<dyn Sleeper>,
}

impl Default for RetryFilter {
    fn default() -> Self {
        RetryFilter::new()
    }
}

impl RetryFilter {
    /// A filter with the default configuration.
    pub fn new() -> RetryFilter {
        RetryFilter::with_config(RetryConfig::default())
    }

    /// A filter with the given configuration.
    pub fn with_config(cfg: RetryConfig) -> RetryFilter {
        RetryFilter {
            cfg,
            sleeper: Box::new(ThreadSleeper),
        }
    }

    /// Substitute the sleep primitive (tests, cancellable runtimes).
    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> RetryFilter {
        self.sleeper = sleeper;
        self
    }
}

/// Durable per-connection state.
struct RetryConn {
    readonly: bool,
    exportname: String,
    reopens: AtomicU32,
    open: AtomicBool,
}

/// Ephemeral per-command state, reset for every operation.
struct RetryData {
    retry: u32,
    delay: u64,
}

impl RetryData {
    fn new(initial_delay: u64) -> RetryData {
        RetryData {
            retry: 0,
            delay: initial_delay,
        }
    }
}

fn conn(handle: &Handle) -> OpResult<&RetryConn> {
    handle
        .get::<RetryConn>()
        .ok_or_else(|| DeviceError::inval("retry: wrong handle type"))
}

/// Would `[offset, offset+count)` fit the current device?  A failing
/// `get_size` counts as out of range, same as a shrunk device.
fn valid_range(next: &NextCtx<'_>, count: u64, offset: u64, is_write: bool) -> OpResult<()> {
    let size = next.get_size().unwrap_or(0);
    let fits = offset.checked_add(count).map_or(false, |end| end <= size);
    if fits {
        Ok(())
    } else if is_write {
        Err(DeviceError::no_spc("request beyond the end of the device"))
    } else {
        Err(DeviceError::io("request beyond the end of the device"))
    }
}

impl RetryFilter {
    /// The common retry logic of every data command.  Returns true when the
    /// caller should re-issue the operation.  `err` may be rewritten when
    /// the reopen itself fails.
    fn do_retry(
        &self,
        h: &RetryConn,
        data: &mut RetryData,
        next: &NextCtx<'_>,
        method: &str,
        err: &mut DeviceError,
    ) -> bool {
        loop {
            if data.retry >= self.cfg.retries {
                log::debug!("could not recover after {} retries", self.cfg.retries);
                return false;
            }

            // Log the original error now, otherwise it is lost on retry.
            log::debug!("{} failed: {}", method, err);
            log::debug!(
                "retry {}: waiting {} seconds before retrying",
                data.retry + 1,
                data.delay
            );
            if self.sleeper.sleep(data.delay).is_err() {
                // Interrupted; the error from the data call itself is the
                // important one, keep it.
                return false;
            }

            data.retry += 1;
            if self.cfg.exponential {
                data.delay *= 2;
            }

            h.reopens.fetch_add(1, Ordering::Relaxed);
            h.open.store(false, Ordering::Relaxed);

            // Tear down the old connection.  Failure to finalize indicates
            // permanent data loss, treated the same as the original command
            // failing.
            if let Some(old) = next.take() {
                if old.finalize().is_err() {
                    *err = DeviceError::shutdown("finalize failed while reopening");
                    continue;
                }
                drop(old);
            }

            // Open a new one.
            let readonly = h.readonly || self.cfg.force_readonly;
            let new = match next.reconnect(readonly, &h.exportname) {
                Ok(c) => c,
                Err(e) => {
                    log::debug!("reopen failed: {}", e);
                    *err = DeviceError::shutdown("reopen failed");
                    continue;
                }
            };
            if let Err(e) = new.prepare(readonly) {
                log::debug!("prepare failed after reopen: {}", e);
                let _ = new.finalize();
                drop(new);
                *err = DeviceError::shutdown("prepare failed while reopening");
                continue;
            }
            next.install(new);
            h.open.store(true, Ordering::Relaxed);
            return true;
        }
    }
}

impl Filter for RetryFilter {
    fn name(&self) -> &str {
        "retry"
    }

    fn longname(&self) -> &str {
        "reopen-and-retry filter"
    }

    fn config_help(&self) -> &str {
        "retries=<N>              Number of retries (default: 5).\n\
         retry-delay=<N>          Seconds to wait before retry (default: 2).\n\
         retry-exponential=yes|no Exponential back-off (default: yes).\n\
         retry-readonly=yes|no    Force read-only on failure (default: no)."
    }

    /// Reopening mutates the next context of a live connection, so at most
    /// one request may be in flight per connection.
    fn thread_model(&self) -> ThreadModel {
        ThreadModel::SerializeRequests
    }

    fn config(&mut self, key: &str, value: &str) -> ConfigResult<ConfigStatus> {
        match key {
            "retries" => {
                self.cfg.retries = parse_unsigned("retries", value)?;
                Ok(ConfigStatus::Handled)
            }
            "retry-delay" => {
                let delay = parse_unsigned("retry-delay", value)?;
                if delay == 0 {
                    return Err(ConfigError::invalid("retry-delay cannot be 0"));
                }
                self.cfg.delay = u64::from(delay);
                Ok(ConfigStatus::Handled)
            }
            "retry-exponential" => {
                self.cfg.exponential = parse_bool(value)?;
                Ok(ConfigStatus::Handled)
            }
            "retry-readonly" => {
                self.cfg.force_readonly = parse_bool(value)?;
                Ok(ConfigStatus::Handled)
            }
            _ => Ok(ConfigStatus::Unhandled),
        }
    }

    fn open(&self, next: NextOpen<'_>, readonly: bool, exportname: &str) -> OpResult<Handle> {
        let h = RetryConn {
            readonly,
            exportname: exportname.to_string(),
            reopens: AtomicU32::new(0),
            open: AtomicBool::new(false),
        };

        match next.open(readonly, exportname) {
            Ok(()) => h.open.store(true, Ordering::Relaxed),
            Err(first_err) => {
                // Our open must not return a handle unless a later reopen
                // works: the caller's next action is probing get_size and
                // friends, which are not wired into the retry logic.
                log::debug!("open failed: {}", first_err);
                let mut data = RetryData::new(self.cfg.delay);
                loop {
                    if data.retry >= self.cfg.retries {
                        return Err(first_err.clone());
                    }
                    log::debug!(
                        "retry {}: waiting {} seconds before retrying",
                        data.retry + 1,
                        data.delay
                    );
                    self.sleeper.sleep(data.delay)?;
                    data.retry += 1;
                    if self.cfg.exponential {
                        data.delay *= 2;
                    }
                    h.reopens.fetch_add(1, Ordering::Relaxed);
                    let readonly = readonly || self.cfg.force_readonly;
                    if next.open(readonly, exportname).is_ok() {
                        h.open.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            }
        }
        Ok(Handle::new(h))
    }

    fn close(&self, handle: &Handle) {
        if let Some(h) = handle.get::<RetryConn>() {
            log::debug!("reopens needed: {}", h.reopens.load(Ordering::Relaxed));
        }
    }

    fn pread(
        &self,
        next: &NextCtx<'_>,
        handle: &Handle,
        buf: &mut [u8],
        offset: u64,
        flags: CmdFlags,
    ) -> OpResult<()> {
        let h = conn(handle)?;
        let mut data = RetryData::new(self.cfg.delay);
        loop {
            let r = if !h.open.load(Ordering::Relaxed) {
                Err(DeviceError::io("connection is not open"))
            } else {
                valid_range(next, buf.len() as u64, offset, false)
                    .and_then(|_| next.pread(buf, offset, flags))
            };
            match r {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let mut err = e;
                    if !self.do_retry(h, &mut data, next, "pread", &mut err) {
                        return Err(err);
                    }
                }
            }
        }
    }

    fn pwrite(
        &self,
        next: &NextCtx<'_>,
        handle: &Handle,
        buf: &[u8],
        offset: u64,
        flags: CmdFlags,
    ) -> OpResult<()> {
        let h = conn(handle)?;
        let mut data = RetryData::new(self.cfg.delay);
        loop {
            if h.reopens.load(Ordering::Relaxed) > 0 && self.cfg.force_readonly {
                return Err(DeviceError::rofs("connection was reopened read-only"));
            }
            let r = if !h.open.load(Ordering::Relaxed) {
                Err(DeviceError::io("connection is not open"))
            } else if let Err(e) = valid_range(next, buf.len() as u64, offset, true) {
                Err(e)
            } else if !next.can_write().unwrap_or(false) {
                Err(DeviceError::rofs("next layer is not writable"))
            } else if flags.contains(CmdFlags::FUA)
                && next.can_fua().unwrap_or(FuaMode::None) == FuaMode::None
            {
                Err(DeviceError::io("FUA is not supported by the next layer"))
            } else {
                next.pwrite(buf, offset, flags)
            };
            match r {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let mut err = e;
                    if !self.do_retry(h, &mut data, next, "pwrite", &mut err) {
                        return Err(err);
                    }
                }
            }
        }
    }

    fn trim(
        &self,
        next: &NextCtx<'_>,
        handle: &Handle,
        count: u32,
        offset: u64,
        flags: CmdFlags,
    ) -> OpResult<()> {
        let h = conn(handle)?;
        let mut data = RetryData::new(self.cfg.delay);
        loop {
            if h.reopens.load(Ordering::Relaxed) > 0 && self.cfg.force_readonly {
                return Err(DeviceError::rofs("connection was reopened read-only"));
            }
            let r = if !h.open.load(Ordering::Relaxed) {
                Err(DeviceError::io("connection is not open"))
            } else if let Err(e) = valid_range(next, u64::from(count), offset, true) {
                Err(e)
            } else if !next.can_trim().unwrap_or(false) {
                Err(DeviceError::rofs("next layer does not support trim"))
            } else if flags.contains(CmdFlags::FUA)
                && next.can_fua().unwrap_or(FuaMode::None) == FuaMode::None
            {
                Err(DeviceError::io("FUA is not supported by the next layer"))
            } else {
                next.trim(count, offset, flags)
            };
            match r {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let mut err = e;
                    if !self.do_retry(h, &mut data, next, "trim", &mut err) {
                        return Err(err);
                    }
                }
            }
        }
    }

    fn flush(&self, next: &NextCtx<'_>, handle: &Handle, flags: CmdFlags) -> OpResult<()> {
        let h = conn(handle)?;
        let mut data = RetryData::new(self.cfg.delay);
        loop {
            let r = if !h.open.load(Ordering::Relaxed) {
                Err(DeviceError::io("connection is not open"))
            } else if !next.can_flush().unwrap_or(false) {
                Err(DeviceError::io("next layer does not support flush"))
            } else {
                next.flush(flags)
            };
            match r {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let mut err = e;
                    if !self.do_retry(h, &mut data, next, "flush", &mut err) {
                        return Err(err);
                    }
                }
            }
        }
    }

    fn zero(
        &self,
        next: &NextCtx<'_>,
        handle: &Handle,
        count: u32,
        offset: u64,
        flags: CmdFlags,
    ) -> OpResult<()> {
        let h = conn(handle)?;
        let mut data = RetryData::new(self.cfg.delay);
        loop {
            if h.reopens.load(Ordering::Relaxed) > 0 && self.cfg.force_readonly {
                return Err(DeviceError::rofs("connection was reopened read-only"));
            }
            // A FAST_ZERO that cannot be satisfied must fail immediately;
            // retrying cannot make it cheap.
            if flags.contains(CmdFlags::FAST_ZERO)
                && (!h.open.load(Ordering::Relaxed) || !next.can_fast_zero().unwrap_or(false))
            {
                return Err(DeviceError::not_sup("fast zero is not supported"));
            }
            let r = if !h.open.load(Ordering::Relaxed) {
                Err(DeviceError::io("connection is not open"))
            } else if let Err(e) = valid_range(next, u64::from(count), offset, true) {
                Err(e)
            } else if !next.can_zero().unwrap_or(false) {
                Err(DeviceError::rofs("next layer does not support zero"))
            } else if flags.contains(CmdFlags::FUA)
                && next.can_fua().unwrap_or(FuaMode::None) == FuaMode::None
            {
                Err(DeviceError::io("FUA is not supported by the next layer"))
            } else {
                next.zero(count, offset, flags)
            };
            match r {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let mut err = e;
                    if !self.do_retry(h, &mut data, next, "zero", &mut err) {
                        return Err(err);
                    }
                }
            }
        }
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
        let h = conn(handle)?;
        let mut data = RetryData::new(self.cfg.delay);
        loop {
            // Each attempt begins with a scratch list reset to the right
            // starting point, so a half-filled reply never leaks out.
            let r = if !h.open.load(Ordering::Relaxed) {
                Err(DeviceError::io("connection is not open"))
            } else if let Err(e) = valid_range(next, u64::from(count), offset, false) {
                Err(e)
            } else if !next.can_extents().unwrap_or(false) {
                Err(DeviceError::io("next layer does not support extents"))
            } else {
                next.get_size().and_then(|size| {
                    let mut scratch = Extents::new(offset, size);
                    next.extents(count, offset, flags, &mut scratch)
                        .map(|()| scratch)
                })
            };
            match r {
                Ok(scratch) => {
                    for e in scratch.iter() {
                        extents.add(e.offset, e.length, e.flags)?;
                    }
                    return Ok(());
                }
                Err(e) => {
                    let mut err = e;
                    if !self.do_retry(h, &mut data, next, "extents", &mut err) {
                        return Err(err);
                    }
                }
            }
        }
    }

    fn cache(
        &self,
        next: &NextCtx<'_>,
        handle: &Handle,
        count: u32,
        offset: u64,
        flags: CmdFlags,
    ) -> OpResult<()> {
        let h = conn(handle)?;
        let mut data = RetryData::new(self.cfg.delay);
        loop {
            let r = if !h.open.load(Ordering::Relaxed) {
                Err(DeviceError::io("connection is not open"))
            } else if let Err(e) = valid_range(next, u64::from(count), offset, false) {
                Err(e)
            } else if next.can_cache().unwrap_or(crate::api::CacheMode::None)
                == crate::api::CacheMode::None
            {
                Err(DeviceError::io("next layer does not support cache"))
            } else {
                next.cache(count, offset, flags)
            };
            match r {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let mut err = e;
                    if !self.do_retry(h, &mut data, next, "cache", &mut err) {
                        return Err(err);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    use crate::backend::{ChainBuilder, Plugin};
    use crate::plugins::memory::MemPlugin;

    /// Records requested delays instead of sleeping.
    struct FakeSleeper {
        delays: Arc<Mutex<Vec<u64>>>,
    }

    impl Sleeper for FakeSleeper {
        fn sleep(&self, seconds: u64) -> Result<(), DeviceError> {
            self.delays.lock().push(seconds);
            Ok(())
        }
    }

    /// Fails the first `fail_reads` preads, then behaves like a memory disk.
    struct FlakyPlugin {
        inner: MemPlugin,
        fail_reads: AtomicU32,
        opens: Arc<AtomicU32>,
    }

    impl Plugin for FlakyPlugin {
        fn name(&self) -> &str {
            "flaky"
        }

        fn open(&self, readonly: bool) -> OpResult<Handle> {
            self.opens.fetch_add(1, Ordering::Relaxed);
            self.inner.open(readonly)
        }

        fn get_size(&self, h: &Handle) -> OpResult<u64> {
            self.inner.get_size(h)
        }

        fn can_write(&self, h: &Handle) -> OpResult<bool> {
            self.inner.can_write(h)
        }

        fn can_flush(&self, h: &Handle) -> OpResult<bool> {
            self.inner.can_flush(h)
        }

        fn pread(
            &self,
            h: &Handle,
            buf: &mut [u8],
            offset: u64,
            flags: CmdFlags,
        ) -> OpResult<()> {
            let left = self.fail_reads.load(Ordering::Relaxed);
            if left > 0 {
                self.fail_reads.store(left - 1, Ordering::Relaxed);
                return Err(DeviceError::io("injected failure"));
            }
            self.inner.pread(h, buf, offset, flags)
        }

        fn pwrite(&self, h: &Handle, buf: &[u8], offset: u64, flags: CmdFlags) -> OpResult<()> {
            self.inner.pwrite(h, buf, offset, flags)
        }

        fn flush(&self, h: &Handle, flags: CmdFlags) -> OpResult<()> {
            self.inner.flush(h, flags)
        }
    }

    fn flaky_chain(
        fail_reads: u32,
        cfg: RetryConfig,
    ) -> (crate::backend::Chain, Arc<AtomicU32>, Arc<Mutex<Vec<u64>>>) {
        let opens = Arc::new(AtomicU32::new(0));
        let delays = Arc::new(Mutex::new(Vec::new()));
        let plugin = FlakyPlugin {
            inner: MemPlugin::with_data(vec![0x5a; 1 << 20]),
            fail_reads: AtomicU32::new(fail_reads),
            opens: Arc::clone(&opens),
        };
        let filter = RetryFilter::with_config(cfg).with_sleeper(Box::new(FakeSleeper {
            delays: Arc::clone(&delays),
        }));
        let chain = ChainBuilder::new(Box::new(plugin))
            .unwrap()
            .filter(Box::new(filter))
            .unwrap()
            .ready()
            .unwrap();
        (chain, opens, delays)
    }

    #[test]
    fn two_failures_then_success_with_exponential_backoff() {
        let (chain, opens, delays) = flaky_chain(
            2,
            RetryConfig {
                retries: 2,
                delay: 1,
                exponential: true,
                force_readonly: false,
            },
        );
        let conn = chain.connect(false, "").unwrap();
        assert_eq!(opens.load(Ordering::Relaxed), 1);

        let mut buf = [0u8; 512];
        conn.pread(&mut buf, 0, CmdFlags::empty()).unwrap();
        assert!(buf.iter().all(|&b| b == 0x5a));
        // Two reopens, waiting 1 then 2 seconds.
        assert_eq!(&*delays.lock(), &[1, 2]);
        assert_eq!(opens.load(Ordering::Relaxed), 3);
        chain.disconnect(conn).unwrap();
    }

    #[test]
    fn retries_exhausted_surfaces_last_error() {
        let (chain, _opens, delays) = flaky_chain(
            10,
            RetryConfig {
                retries: 2,
                delay: 1,
                exponential: false,
                force_readonly: false,
            },
        );
        let conn = chain.connect(false, "").unwrap();
        let mut buf = [0u8; 512];
        let err = conn.pread(&mut buf, 0, CmdFlags::empty()).unwrap_err();
        assert_eq!(err, DeviceError::io("injected failure"));
        assert_eq!(&*delays.lock(), &[1, 1]);
        chain.disconnect(conn).unwrap();
    }

    #[test]
    fn writes_fail_rofs_after_forced_readonly_reopen() {
        let (chain, _opens, _delays) = flaky_chain(
            1,
            RetryConfig {
                retries: 3,
                delay: 1,
                exponential: false,
                force_readonly: true,
            },
        );
        let conn = chain.connect(false, "").unwrap();
        // Trip the reopen.
        let mut buf = [0u8; 16];
        conn.pread(&mut buf, 0, CmdFlags::empty()).unwrap();
        // All write-class operations now short-circuit.
        assert!(matches!(
            conn.pwrite(&buf, 0, CmdFlags::empty()),
            Err(DeviceError::Rofs(_))
        ));
        assert!(matches!(
            conn.zero(16, 0, CmdFlags::empty()),
            Err(DeviceError::Rofs(_))
        ));
        assert!(matches!(
            conn.trim(16, 0, CmdFlags::empty()),
            Err(DeviceError::Rofs(_))
        ));
        chain.disconnect(conn).unwrap();
    }

    #[test]
    fn out_of_range_read_fails_without_descending() {
        let (chain, _opens, delays) = flaky_chain(
            0,
            RetryConfig {
                retries: 0,
                delay: 1,
                exponential: true,
                force_readonly: false,
            },
        );
        let conn = chain.connect(false, "").unwrap();
        let mut buf = [0u8; 512];
        let err = conn.pread(&mut buf, 1 << 20, CmdFlags::empty()).unwrap_err();
        assert!(matches!(err, DeviceError::Io(_)));
        assert!(delays.lock().is_empty());
        chain.disconnect(conn).unwrap();
    }

    #[test]
    fn fast_zero_without_support_is_notsup_immediately() {
        let (chain, _opens, delays) = flaky_chain(
            0,
            RetryConfig {
                retries: 5,
                delay: 1,
                exponential: true,
                force_readonly: false,
            },
        );
        let conn = chain.connect(false, "").unwrap();
        let err = conn.zero(512, 0, CmdFlags::FAST_ZERO).unwrap_err();
        assert!(matches!(err, DeviceError::NotSup(_)));
        assert!(delays.lock().is_empty());
        chain.disconnect(conn).unwrap();
    }
}
