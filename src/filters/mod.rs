//! Built-in filters.
//!
//! Each filter is an independent layer implementing
//! [`Filter`](crate::backend::Filter); they can be
//! stacked in any order a deployment needs.  The usual arrangement puts
//! retry outermost (so it can reopen everything below it), then format
//! decoders (qcow2), then windowing filters (partition).

pub mod evil;
pub mod partition;
pub mod qcow2;
pub mod retry;

pub use evil::EvilFilter;
pub use partition::PartitionFilter;
pub use qcow2::Qcow2Filter;
pub use retry::RetryFilter;
