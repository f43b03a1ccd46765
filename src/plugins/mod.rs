//! Built-in plugins: the terminal data sources a chain can end in.

pub mod fill;
pub mod http;
pub mod memory;

pub use fill::FillPlugin;
pub use http::HttpPlugin;
pub use memory::MemPlugin;
