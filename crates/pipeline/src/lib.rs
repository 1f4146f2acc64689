//! Aggregation, spooling and delivery pipeline of the database agent.
//!
//! Samples flow `monitor -> Aggregator -> Spooler -> Sender -> API`. Every
//! long-lived component runs as a [`task::SupervisedTask`], writes its state
//! into a shared [`status::StatusTable`], and is managed through the
//! [`service::Service`] contract.

pub mod aggregator;
pub mod backoff;
pub mod connector;
pub mod error;
pub mod metric;
pub mod report;
pub mod sender;
pub mod service;
pub mod spool;
pub mod stats;
pub mod status;
pub mod task;
pub mod transport;

pub use error::{Error, Result};
