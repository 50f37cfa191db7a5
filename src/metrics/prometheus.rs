//! Prometheus metrics definitions

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec,
    TextEncoder,
};

lazy_static::lazy_static! {
    /// Total number of processed queue items
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "cstor_backup_operator_reconciliations_total",
        "Total number of processed queue items",
        &["kind", "op"]
    ).unwrap();

    /// Total number of failed queue items
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "cstor_backup_operator_reconciliation_errors_total",
        "Total number of failed queue items",
        &["kind", "retried"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "cstor_backup_operator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Total number of backups
    pub static ref BACKUPS_TOTAL: CounterVec = register_counter_vec!(
        "cstor_backup_operator_backups_total",
        "Total number of backups by outcome",
        &["outcome", "namespace"]
    ).unwrap();

    /// Total number of restores
    pub static ref RESTORES_TOTAL: CounterVec = register_counter_vec!(
        "cstor_backup_operator_restores_total",
        "Total number of restores by outcome",
        &["outcome", "namespace"]
    ).unwrap();

    /// Snapshot transfer duration histogram
    pub static ref TRANSFER_DURATION: HistogramVec = register_histogram_vec!(
        "cstor_backup_operator_transfer_duration_seconds",
        "Duration of snapshot send and receive",
        &["kind"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]
    ).unwrap();

    /// Records rewritten by the startup cleanup pass
    pub static ref CLEANUPS: CounterVec = register_counter_vec!(
        "cstor_backup_operator_cleanups_total",
        "Records resolved by the startup cleanup pass",
        &["kind", "phase"]
    ).unwrap();

    /// Pool health checks that found a stalled pool instance
    pub static ref STALLED_JOBS: Counter = register_counter!(
        "cstor_backup_operator_stalled_jobs_total",
        "Health checks that found a stalled pool instance"
    ).unwrap();

    /// Items waiting in the work queue
    pub static ref QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "cstor_backup_operator_queue_depth",
        "Number of items waiting in the work queue",
        &["kind"]
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: Gauge = register_gauge!(
        "cstor_backup_operator_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Encode every registered metric in the Prometheus text format
pub fn encode_metrics() -> Result<(String, Vec<u8>), prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}
