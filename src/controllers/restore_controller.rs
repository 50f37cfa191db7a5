//! CStorRestore controller
//!
//! Fails restore jobs left by a previous run, then watches owned
//! CStorRestore records and drives them through the reconciler.

use std::sync::Arc;

use kube::{runtime::watcher::Config as WatcherConfig, Api};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::watch::watch_records;
use super::{run_workers, Context, ControllerSettings, JobRecord, QueueingHandler};
use crate::crd::CStorRestore;
use crate::queue::WorkQueue;
use crate::reconcilers::restore as restore_reconciler;

/// Run the CStorRestore controller until `shutdown` fires
pub async fn run(
    api: Api<CStorRestore>,
    ctx: Arc<Context>,
    settings: ControllerSettings,
    shutdown: CancellationToken,
) {
    info!(pool = %ctx.identity.pool_id(), "Starting CStorRestore controller");

    match restore_reconciler::cleanup_old_restores(&ctx).await {
        Ok(count) => info!(count, "Cleaned up unfinished restores"),
        Err(e) => error!(error = %e, "Restore cleanup failed"),
    }

    let queue = WorkQueue::default();
    let handler = QueueingHandler::<CStorRestore>::new(
        ctx.identity.clone(),
        queue.clone(),
        Arc::clone(&ctx.recorder),
    );

    let worker_ctx = Arc::clone(&ctx);
    let workers = run_workers(CStorRestore::KIND, queue.clone(), settings.workers, move |item| {
        let ctx = Arc::clone(&worker_ctx);
        async move { restore_reconciler::process_restore(&ctx, &item).await }
    });

    let config = WatcherConfig::default().labels(&ctx.identity.selector());
    let source = async {
        watch_records(api, config, &handler, settings.resync, shutdown.clone()).await;
        queue.shut_down();
    };

    tokio::join!(source, workers);
    info!("CStorRestore controller stopped");
}
