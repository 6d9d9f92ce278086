// Procvisor - Process Orchestrator
// Library root

pub mod advisory;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod signals;
pub mod units;
pub mod version;

pub use orchestrator::Orchestrator;
