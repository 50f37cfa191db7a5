//! Prometheus metrics for the cStor backup operator
//!
//! Served on `/metrics` by [`crate::server`].

mod prometheus;

pub use prometheus::*;
