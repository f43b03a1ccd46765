//! Chain assembly and the startup hook sequence.
//!
//! The [`ChainBuilder`] owns the layers while they are still mutable:
//! registration checks and `load` happen as layers are added, configuration
//! keys are routed outer-to-inner, and `ready()` runs `get_ready`
//! inner-to-outer before freezing everything into an immutable [`Chain`].

use std::sync::Arc;

use crate::api::{OpResult, ThreadModel};
use crate::config::ConfigError;

use super::context::Context;
use super::{Backend, ConfigStatus, Export, Filter, Plugin, StartupError, API_VERSION};

/// Assembles a chain: a plugin wrapped by zero or more filters.
pub struct ChainBuilder {
    plugin: Box<dyn Plugin>,
    /// Innermost first; the last filter added is the outermost layer.
    filters: Vec<Box<dyn Filter>>,
}

impl ChainBuilder {
    /// Start a chain from its terminal plugin.
    pub fn new(mut plugin: Box<dyn Plugin>) -> Result<ChainBuilder, StartupError> {
        if plugin.api_version() != API_VERSION {
            return Err(StartupError::ApiVersion {
                name: plugin.name().to_string(),
                found: plugin.api_version(),
                need: API_VERSION,
            });
        }
        if plugin.version() != crate::VERSION {
            return Err(StartupError::Version {
                name: plugin.name().to_string(),
                found: plugin.version().to_string(),
                need: crate::VERSION.to_string(),
            });
        }
        log::debug!("registered plugin {}", plugin.name());
        plugin.load();
        Ok(ChainBuilder {
            plugin,
            filters: Vec::new(),
        })
    }

    /// Wrap the current top of the chain in another filter.
    pub fn filter(mut self, mut filter: Box<dyn Filter>) -> Result<ChainBuilder, StartupError> {
        if filter.api_version() != API_VERSION {
            return Err(StartupError::ApiVersion {
                name: filter.name().to_string(),
                found: filter.api_version(),
                need: API_VERSION,
            });
        }
        if filter.version() != crate::VERSION {
            return Err(StartupError::Version {
                name: filter.name().to_string(),
                found: filter.version().to_string(),
                need: crate::VERSION.to_string(),
            });
        }
        log::debug!("registered filter {}", filter.name());
        filter.load();
        self.filters.push(filter);
        Ok(self)
    }

    /// Route one configuration key down the chain, outermost layer first,
    /// until some layer consumes it.  The terminal plugin rejects keys
    /// nothing recognized.
    pub fn config(&mut self, key: &str, value: &str) -> Result<(), StartupError> {
        for f in self.filters.iter_mut().rev() {
            log::debug!("{}: config key={} value={}", f.name(), key, value);
            if f.config(key, value)? == ConfigStatus::Handled {
                return Ok(());
            }
        }
        log::debug!("{}: config key={} value={}", self.plugin.name(), key, value);
        self.plugin.config(key, value)?;
        Ok(())
    }

    /// The terminal plugin's magic config key; a bare `value` argument is
    /// treated as `<magic_key>=value`.
    pub fn magic_config_key(&self) -> Option<&str> {
        self.plugin.magic_config_key()
    }

    /// Signal the end of configuration, outermost layer first.
    pub fn config_complete(&mut self) -> Result<(), StartupError> {
        for f in self.filters.iter_mut().rev() {
            log::debug!("{}: config_complete", f.name());
            f.config_complete()?;
        }
        self.plugin.config_complete()?;
        Ok(())
    }

    /// Negotiate the thread model, run `get_ready` inner-to-outer, and
    /// freeze the chain.
    pub fn ready(mut self) -> Result<Chain, StartupError> {
        let mut model = self.plugin.thread_model();
        for f in &self.filters {
            model = model.min(f.thread_model());
        }

        self.plugin
            .get_ready(model)
            .map_err(|e| hook_error(self.plugin.name(), "get_ready", &e))?;
        for f in self.filters.iter_mut() {
            log::debug!("{}: get_ready thread_model={:?}", f.name(), model);
            let name = f.name().to_string();
            f.get_ready(model)
                .map_err(|e| hook_error(&name, "get_ready", &e))?;
        }

        let mut backend = Arc::new(Backend::terminal(self.plugin));
        for f in self.filters {
            backend = Arc::new(Backend::wrap(f, backend));
        }

        log::info!(
            "chain ready: top layer {}, plugin {}, thread model {:?}",
            backend.name(),
            backend.plugin_name(),
            model
        );
        Ok(Chain {
            top: backend,
            thread_model: model,
        })
    }
}

fn hook_error(name: &str, hook: &'static str, e: &ConfigError) -> StartupError {
    StartupError::Hook {
        name: name.to_string(),
        hook,
        message: e.to_string(),
    }
}

/// A frozen chain of layers, ready to accept connections.
///
/// The negotiated thread model tells the outer server how much concurrency
/// it may drive through [`Chain::connect`] handles.
pub struct Chain {
    top: Arc<Backend>,
    thread_model: ThreadModel,
}

impl Chain {
    /// The negotiated thread model: the minimum over every layer.
    pub fn thread_model(&self) -> ThreadModel {
        self.thread_model
    }

    /// The outermost layer.
    pub fn top(&self) -> &Arc<Backend> {
        &self.top
    }

    /// The terminal plugin's name.
    pub fn plugin_name(&self) -> &str {
        self.top.plugin_name()
    }

    /// The terminal plugin's magic config key, used when a bare value is
    /// passed on a command line.
    pub fn magic_config_key(&self) -> Option<&str> {
        self.top.magic_config_key()
    }

    /// Run the after-fork hooks, inner-to-outer.
    pub fn after_fork(&self) -> Result<(), StartupError> {
        self.top.after_fork()
    }

    /// Early accept/reject of a prospective connection.
    pub fn preconnect(&self, readonly: bool) -> OpResult<()> {
        self.top.preconnect(readonly)
    }

    /// List the exports offered by the chain.
    pub fn list_exports(&self, readonly: bool) -> OpResult<Vec<Export>> {
        self.top.list_exports(readonly)
    }

    /// The export served for the empty export name.
    pub fn default_export(&self, readonly: bool) -> OpResult<String> {
        self.top.default_export(readonly)
    }

    /// Collect introspection key=value pairs from every layer.
    pub fn dump_fields(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        self.top.dump_fields(&mut out);
        out
    }

    /// Open a connection: open every layer outer-to-inner (completing
    /// inner-to-outer), then prepare inner-to-outer.
    pub fn connect(&self, readonly: bool, exportname: &str) -> OpResult<Arc<Context>> {
        let ctx = self.top.open(readonly, exportname)?;
        ctx.prepare(readonly)?;
        Ok(ctx)
    }

    /// Close a connection: finalize outer-to-inner, then destroy the
    /// context stack (next context first, then each layer's close).
    pub fn disconnect(&self, ctx: Arc<Context>) -> OpResult<()> {
        ctx.finalize()?;
        drop(ctx);
        Ok(())
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        self.top.cleanup();
        self.top.unload();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CmdFlags, DeviceError};
    use crate::backend::Handle;
    use crate::config::{ConfigError, ConfigResult};

    struct TinyPlugin;

    impl Plugin for TinyPlugin {
        fn name(&self) -> &str {
            "tiny"
        }

        fn get_size(&self, _h: &Handle) -> crate::api::OpResult<u64> {
            Ok(1024)
        }

        fn pread(
            &self,
            _h: &Handle,
            buf: &mut [u8],
            _offset: u64,
            _flags: CmdFlags,
        ) -> crate::api::OpResult<()> {
            buf.fill(0xaa);
            Ok(())
        }
    }

    struct StrictFilter;

    impl Filter for StrictFilter {
        fn name(&self) -> &str {
            "strict"
        }

        fn thread_model(&self) -> ThreadModel {
            ThreadModel::SerializeAllRequests
        }
    }

    struct BadVersionPlugin;

    impl Plugin for BadVersionPlugin {
        fn name(&self) -> &str {
            "bad"
        }

        fn api_version(&self) -> u32 {
            1
        }

        fn get_size(&self, _h: &Handle) -> crate::api::OpResult<u64> {
            Ok(0)
        }

        fn pread(
            &self,
            _h: &Handle,
            _buf: &mut [u8],
            _offset: u64,
            _flags: CmdFlags,
        ) -> crate::api::OpResult<()> {
            Ok(())
        }
    }

    #[test]
    fn minimal_chain_round_trip() {
        let chain = ChainBuilder::new(Box::new(TinyPlugin))
            .unwrap()
            .ready()
            .unwrap();
        let conn = chain.connect(true, "").unwrap();
        assert_eq!(conn.get_size().unwrap(), 1024);
        let mut buf = [0u8; 16];
        conn.pread(&mut buf, 0, CmdFlags::empty()).unwrap();
        assert!(buf.iter().all(|&b| b == 0xaa));
        chain.disconnect(conn).unwrap();
    }

    #[test]
    fn thread_model_negotiated_to_most_restrictive() {
        let chain = ChainBuilder::new(Box::new(TinyPlugin))
            .unwrap()
            .filter(Box::new(StrictFilter))
            .unwrap()
            .ready()
            .unwrap();
        assert_eq!(chain.thread_model(), ThreadModel::SerializeAllRequests);
    }

    #[test]
    fn api_version_mismatch_is_rejected() {
        match ChainBuilder::new(Box::new(BadVersionPlugin)) {
            Err(StartupError::ApiVersion { found, need, .. }) => {
                assert_eq!(found, 1);
                assert_eq!(need, API_VERSION);
            }
            _ => panic!("registration should have failed"),
        }
    }

    #[test]
    fn unknown_config_key_is_an_error_at_the_terminal() {
        let mut builder = ChainBuilder::new(Box::new(TinyPlugin)).unwrap();
        assert!(builder.config("no-such-key", "1").is_err());
    }

    struct PassthroughCaps;

    impl Filter for PassthroughCaps {
        fn name(&self) -> &str {
            "passthrough"
        }
    }

    #[test]
    fn default_filter_inherits_caps_from_next() {
        let chain = ChainBuilder::new(Box::new(TinyPlugin))
            .unwrap()
            .filter(Box::new(PassthroughCaps))
            .unwrap()
            .ready()
            .unwrap();
        let conn = chain.connect(true, "").unwrap();
        assert!(!conn.can_write().unwrap());
        assert!(!conn.can_flush().unwrap());
        assert_eq!(conn.can_fua().unwrap(), crate::api::FuaMode::None);
        chain.disconnect(conn).unwrap();
    }

    struct FailingReady;

    impl Filter for FailingReady {
        fn name(&self) -> &str {
            "failing"
        }

        fn get_ready(&mut self, _m: ThreadModel) -> ConfigResult<()> {
            Err(ConfigError::invalid("resource unavailable"))
        }
    }

    #[test]
    fn get_ready_failure_aborts_startup() {
        let r = ChainBuilder::new(Box::new(TinyPlugin))
            .unwrap()
            .filter(Box::new(FailingReady))
            .unwrap()
            .ready();
        assert!(matches!(r, Err(StartupError::Hook { hook: "get_ready", .. })));
    }

    struct NoNextOpenFilter;

    impl Filter for NoNextOpenFilter {
        fn name(&self) -> &str {
            "no-next-open"
        }

        fn open(
            &self,
            _next: crate::backend::NextOpen<'_>,
            _readonly: bool,
            _exportname: &str,
        ) -> crate::api::OpResult<Handle> {
            // Deliberately skips opening the next context.
            Ok(Handle::not_needed())
        }
    }

    #[test]
    fn filter_must_open_next_context() {
        let chain = ChainBuilder::new(Box::new(TinyPlugin))
            .unwrap()
            .filter(Box::new(NoNextOpenFilter))
            .unwrap()
            .ready()
            .unwrap();
        match chain.connect(true, "") {
            Err(DeviceError::Inval(_)) => {}
            other => panic!("expected Inval, got {:?}", other.map(|_| ())),
        }
    }
}
