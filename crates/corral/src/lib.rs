pub mod api;
pub mod cache;
pub mod common;
pub mod events;
pub mod metrics;
pub mod queue;
pub mod resources;
pub mod scheduler;
pub mod store;
pub mod workload;

#[cfg(test)]
pub(crate) mod tests;

pub use common::{Map, Set};

// Priority: Bigger number -> Higher priority
pub type Priority = i32;

pub type Error = crate::common::error::CorralError;
pub type Result<T> = std::result::Result<T, Error>;
