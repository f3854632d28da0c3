//! Metrics Module
//!
//! Prometheus counters for the supervisor, exported as a text file.

pub mod collector;

pub use collector::{Metrics, MetricsSnapshot};
