//! At-least-once Kafka consumption loops and a producer client.
//!
//! Each [`kafka::ConsumptionLoop`] owns one consumer connection, delivers every
//! record to a [`sink::DeliverySink`] and commits the offsets it delivered.
//! When a commit is rejected because the group changed, the loop rewinds its
//! read positions to the last delivered offsets instead of skipping ahead.
//!
//! When logging errors with a cause chain use `{e:#}` so root causes stay visible.

pub mod config;
pub mod kafka;
pub mod metrics_consts;
pub mod sink;

pub use config::Config;
pub use sink::{DeliverySink, LoggingSink};
