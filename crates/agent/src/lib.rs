//! Database telemetry agent.
//!
//! Collections from the monitors are aggregated into one report per
//! window, spooled to disk and delivered to the collection API by the
//! `data` service.

pub mod agent;
pub mod client;
mod error;
pub mod monitor;
pub mod service;
pub mod settings;

pub use agent::Agent;
pub use error::{Error, Result};
