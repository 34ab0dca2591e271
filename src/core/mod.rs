pub mod admission;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod model;
pub mod orchestrator;
pub mod process;
pub mod queue;
pub mod store;
pub mod tracker;

#[cfg(all(test, unix))]
pub mod test_support;
