#[macro_use]
pub mod metrics;

pub mod config;
pub mod coordinator;
pub mod fetch;
pub mod store;
