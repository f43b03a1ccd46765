//! # nbdstack - Stackable Block-Device Pipeline
//!
//! A user-space framework for building NBD-style block servers out of a
//! chain of *filters* terminating in a *plugin* that sources the actual
//! bytes.  Every request (read, write, zero, trim, flush, cache, extent
//! query) enters the outermost filter and descends layer by layer; each
//! layer may transform, short-circuit, split or re-issue requests against
//! the layer below it.
//!
//! ## Architecture
//!
//! - `api`: the operation vocabulary shared by every layer - flags,
//!   capabilities, the extent list, the error taxonomy, the thread model
//! - `backend`: the chain runtime - `Plugin`/`Filter` traits, per-connection
//!   contexts, the builder that runs the startup hook sequence
//! - `filters`: retry (bounded retry with reopen), partition (MBR/GPT
//!   window rebasing), qcow2 (read-only image decoding), evil
//!   (deterministic bit corruption for fault injection)
//! - `plugins`: fill (constant byte source), memory (RAM-backed source),
//!   http (range-request source behind a background transfer worker)
//! - `config`: human-size and key=value parsers shared by the layers

#![warn(missing_docs)]
#![warn(clippy::all)]

// Operation vocabulary shared across the chain
pub mod api;

// Chain runtime
pub mod backend;

// Built-in filters
pub mod filters;

// Built-in plugins
pub mod plugins;

// Configuration parsers
pub mod config;

// Re-export the types almost every consumer needs
pub use api::{
    BlockSize, CacheMode, CmdFlags, DeviceError, Extent, ExtentFlags, Extents, FuaMode, OpResult,
    ThreadModel,
};
pub use backend::{Chain, ChainBuilder, Context, Filter, Handle, NextCtx, NextOpen, Plugin};

/// Crate version string, also used for layer compatibility checks.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
