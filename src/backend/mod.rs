//! The chain runtime: filters stacked over a terminal plugin.
//!
//! A [`Backend`] is one layer of the chain and owns either a [`Filter`]
//! plus a reference to the layer below it, or the terminal [`Plugin`].
//! Layers are assembled once at startup by a [`ChainBuilder`], which runs
//! the configuration and readiness hooks in their contractual orders and
//! freezes the result into an immutable [`Chain`].  Each connection is then
//! an independent traversal down the chain, represented by a linked stack
//! of [`Context`] values.

pub mod builder;
pub mod context;
pub mod filter;
pub mod plugin;

pub use builder::{Chain, ChainBuilder};
pub use context::{Context, NextCtx, NextOpen};
pub use filter::Filter;
pub use plugin::Plugin;

use std::any::Any;
use std::sync::Arc;

use thiserror::Error;

use crate::api::{OpResult, ThreadModel};
use crate::config::ConfigError;

/// The layer interface version this runtime speaks.
///
/// A layer whose `api_version()` differs cannot be registered.
pub const API_VERSION: u32 = 2;

/// Opaque per-connection handle produced by a layer's `open`.
///
/// The dispatch code passes each layer its own handle and never the handle
/// of an adjacent layer.  Layers with no per-connection state return
/// [`Handle::not_needed`] so the dispatch code still has a non-null handle
/// to hand back on later calls.
pub struct Handle(HandleInner);

enum HandleInner {
    NotNeeded,
    Data(Box<dyn Any + Send + Sync>),
}

impl Handle {
    /// Wrap a layer-specific connection state value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Handle {
        Handle(HandleInner::Data(Box::new(value)))
    }

    /// The reserved sentinel for layers that keep no per-connection state.
    pub fn not_needed() -> Handle {
        Handle(HandleInner::NotNeeded)
    }

    /// Is this the no-state sentinel?
    pub fn is_not_needed(&self) -> bool {
        matches!(self.0, HandleInner::NotNeeded)
    }

    /// Borrow the state as `T`, if this handle holds one.
    pub fn get<T: Any>(&self) -> Option<&T> {
        match &self.0 {
            HandleInner::NotNeeded => None,
            HandleInner::Data(b) => b.downcast_ref::<T>(),
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            HandleInner::NotNeeded => write!(f, "Handle(not needed)"),
            HandleInner::Data(_) => write!(f, "Handle(..)"),
        }
    }
}

/// Reply from a filter's `config` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStatus {
    /// The filter consumed the key.
    Handled,
    /// The key is not for this filter; pass it to the next layer.
    Unhandled,
}

/// One export a plugin offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    /// Export name, as clients request it.
    pub name: String,
    /// Optional human-readable description.
    pub description: Option<String>,
}

/// Errors during chain assembly and startup.
///
/// Startup failures are non-recoverable configuration errors; callers are
/// expected to abort.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The layer was built against a different interface version.
    #[error("layer {name}: incompatible api version {found} (this runtime needs {need})")]
    ApiVersion {
        /// Name of the rejected layer.
        name: String,
        /// The api version the layer declares.
        found: u32,
        /// The api version this runtime needs.
        need: u32,
    },

    /// The layer's version string does not match the runtime's.
    #[error("layer {name}: incompatible version {found:?} (this runtime needs {need:?})")]
    Version {
        /// Name of the rejected layer.
        name: String,
        /// The version string the layer declares.
        found: String,
        /// The version string this runtime needs.
        need: String,
    },

    /// A configuration key or value was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A startup hook reported failure.
    #[error("layer {name}: {hook} failed: {message}")]
    Hook {
        /// Name of the failing layer.
        name: String,
        /// Which hook failed.
        hook: &'static str,
        /// The failure message.
        message: String,
    },
}

pub(crate) enum BackendKind {
    Filter {
        filter: Box<dyn Filter>,
        next: Arc<Backend>,
    },
    Terminal {
        plugin: Box<dyn Plugin>,
    },
}

/// One frozen layer of the chain.
pub struct Backend {
    name: String,
    pub(crate) kind: BackendKind,
}

impl Backend {
    pub(crate) fn terminal(plugin: Box<dyn Plugin>) -> Backend {
        Backend {
            name: plugin.name().to_string(),
            kind: BackendKind::Terminal { plugin },
        }
    }

    pub(crate) fn wrap(filter: Box<dyn Filter>, next: Arc<Backend>) -> Backend {
        Backend {
            name: filter.name().to_string(),
            kind: BackendKind::Filter { filter, next },
        }
    }

    /// The layer's short name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The terminal plugin's name, seen from any layer.
    pub fn plugin_name(&self) -> &str {
        match &self.kind {
            BackendKind::Filter { next, .. } => next.plugin_name(),
            BackendKind::Terminal { plugin } => plugin.name(),
        }
    }

    /// The terminal plugin's magic config key, if it declares one.
    pub fn magic_config_key(&self) -> Option<&str> {
        match &self.kind {
            BackendKind::Filter { next, .. } => next.magic_config_key(),
            BackendKind::Terminal { plugin } => plugin.magic_config_key(),
        }
    }

    /// Negotiated thread model of this layer and everything below it.
    pub fn thread_model(&self) -> ThreadModel {
        match &self.kind {
            BackendKind::Filter { filter, next } => {
                // The more serialized model wins.
                filter.thread_model().min(next.thread_model())
            }
            BackendKind::Terminal { plugin } => plugin.thread_model(),
        }
    }

    pub(crate) fn after_fork(&self) -> Result<(), StartupError> {
        // Runs inner-to-outer: the plugin first.
        match &self.kind {
            BackendKind::Filter { filter, next } => {
                next.after_fork()?;
                log::debug!("{}: after_fork", self.name);
                filter.after_fork().map_err(|e| StartupError::Hook {
                    name: self.name.clone(),
                    hook: "after_fork",
                    message: e.to_string(),
                })
            }
            BackendKind::Terminal { plugin } => {
                log::debug!("{}: after_fork", self.name);
                plugin.after_fork().map_err(|e| StartupError::Hook {
                    name: self.name.clone(),
                    hook: "after_fork",
                    message: e.to_string(),
                })
            }
        }
    }

    /// Runs outer-to-inner on the way down and completes inner-to-outer.
    pub(crate) fn preconnect(&self, readonly: bool) -> OpResult<()> {
        log::debug!("{}: preconnect", self.name);
        match &self.kind {
            BackendKind::Filter { filter, next } => {
                filter.preconnect(&|ro| next.preconnect(ro), readonly)
            }
            BackendKind::Terminal { plugin } => plugin.preconnect(readonly),
        }
    }

    pub(crate) fn list_exports(&self, readonly: bool) -> OpResult<Vec<Export>> {
        match &self.kind {
            BackendKind::Filter { filter, next } => {
                filter.list_exports(&|ro| next.list_exports(ro), readonly)
            }
            BackendKind::Terminal { plugin } => plugin.list_exports(readonly),
        }
    }

    pub(crate) fn default_export(&self, readonly: bool) -> OpResult<String> {
        match &self.kind {
            BackendKind::Filter { filter, next } => {
                filter.default_export(&|ro| next.default_export(ro), readonly)
            }
            BackendKind::Terminal { plugin } => plugin.default_export(readonly),
        }
    }

    /// Extra key=value diagnostics a layer exposes for introspection.
    pub(crate) fn dump_fields(&self, out: &mut Vec<(String, String)>) {
        match &self.kind {
            BackendKind::Filter { filter, next } => {
                next.dump_fields(out);
                log::debug!("{}: dump_plugin", self.name);
                out.extend(filter.dump_plugin());
            }
            BackendKind::Terminal { plugin } => {
                out.extend(plugin.dump_plugin());
            }
        }
    }

    pub(crate) fn cleanup(&self) {
        // Outer-to-inner at teardown.
        log::debug!("{}: cleanup", self.name);
        match &self.kind {
            BackendKind::Filter { filter, next } => {
                filter.cleanup();
                next.cleanup();
            }
            BackendKind::Terminal { plugin } => plugin.cleanup(),
        }
    }

    pub(crate) fn unload(&self) {
        match &self.kind {
            BackendKind::Filter { filter, next } => {
                filter.unload();
                next.unload();
            }
            BackendKind::Terminal { plugin } => plugin.unload(),
        }
    }
}
