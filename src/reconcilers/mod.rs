//! Reconcilers for cStor backup records
//!
//! Business logic for each record kind. Reconcilers are responsible for:
//! - Driving job status through the Add/Sync/Destroy state machine
//! - Running snapshot transfers and advancing the completed-backup ledger
//! - Resolving jobs left behind by a restart or a stalled pool
//! - Scheduling jobs for incoming backup and restore requests

pub mod backup;
pub mod restore;
