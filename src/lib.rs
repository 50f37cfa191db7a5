//! cStor Backup Operator
//!
//! Backup and restore controllers for cStor pool volume replicas. Each pool
//! instance runs controllers that turn CStorBackup and CStorRestore records
//! into ZFS snapshot transfers; the control plane serves the HTTP surface
//! that schedules those records and reports their progress.

pub mod api;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod health;
pub mod ledger;
pub mod metrics;
pub mod queue;
pub mod reconcilers;
pub mod server;
pub mod store;
pub mod transfer;
pub mod validation;
pub mod zfs;

pub use error::{Error, Result};
