//! CStorBackup controller
//!
//! Resolves jobs left by a previous run, then watches owned CStorBackup
//! records and drives them through the reconciler.

use std::sync::Arc;

use kube::{runtime::watcher::Config as WatcherConfig, Api};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::watch::watch_records;
use super::{run_workers, Context, ControllerSettings, JobRecord, QueueingHandler};
use crate::crd::CStorBackup;
use crate::queue::WorkQueue;
use crate::reconcilers::backup as backup_reconciler;

/// Run the CStorBackup controller until `shutdown` fires
pub async fn run(
    api: Api<CStorBackup>,
    ctx: Arc<Context>,
    settings: ControllerSettings,
    shutdown: CancellationToken,
) {
    info!(pool = %ctx.identity.pool_id(), "Starting CStorBackup controller");

    match backup_reconciler::cleanup_old_backups(&ctx).await {
        Ok(count) => info!(count, "Cleaned up unfinished backups"),
        Err(e) => error!(error = %e, "Backup cleanup failed"),
    }

    let queue = WorkQueue::default();
    let handler = QueueingHandler::<CStorBackup>::new(
        ctx.identity.clone(),
        queue.clone(),
        Arc::clone(&ctx.recorder),
    );

    let worker_ctx = Arc::clone(&ctx);
    let workers = run_workers(CStorBackup::KIND, queue.clone(), settings.workers, move |item| {
        let ctx = Arc::clone(&worker_ctx);
        async move { backup_reconciler::process_backup(&ctx, &item).await }
    });

    let config = WatcherConfig::default().labels(&ctx.identity.selector());
    let source = async {
        watch_records(api, config, &handler, settings.resync, shutdown.clone()).await;
        queue.shut_down();
    };

    tokio::join!(source, workers);
    info!("CStorBackup controller stopped");
}
