//! cStor Backup Operator
//!
//! Main entry point. Loads configuration, builds the record stores and
//! runs the pool-instance controllers and the HTTP server.

use std::sync::Arc;

use kube::{Api, Client};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cstor_backup_operator::{
    api::ApiContext,
    config::OperatorConfig,
    controllers::{self, events::KubeEventRecorder, Context, ControllerSettings},
    crd::{CStorBackup, CStorBackupCompleted, CStorRestore, CStorVolumeReplica},
    health::{HealthChecker, KubeClusterView},
    ledger::Ledger,
    server,
    store::{JobStore, KubeStore},
    transfer::ZfsVolumeTransfer,
    zfs::ProcessRunner,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting cStor Backup Operator");

    let config = OperatorConfig::from_env()?;
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let backups: Arc<dyn JobStore<CStorBackup>> = Arc::new(KubeStore::new(client.clone()));
    let restores: Arc<dyn JobStore<CStorRestore>> = Arc::new(KubeStore::new(client.clone()));
    let replicas: Arc<dyn JobStore<CStorVolumeReplica>> = Arc::new(KubeStore::new(client.clone()));
    let completed: Arc<dyn JobStore<CStorBackupCompleted>> = Arc::new(KubeStore::new(client.clone()));
    let ledger = Ledger::new(completed);

    let api = if config.enable_api {
        let namespace = config.require_namespace()?;
        let checker = HealthChecker::new(
            Arc::new(KubeClusterView::new(client.clone())),
            namespace,
            config.labels.clone(),
        );
        Some(Arc::new(ApiContext {
            backups: Arc::clone(&backups),
            restores: Arc::clone(&restores),
            replicas,
            ledger: ledger.clone(),
            checker,
            labels: config.labels.clone(),
        }))
    } else {
        None
    };

    let mut server_handle = tokio::spawn(server::serve(config.http_port, api));
    info!("HTTP server starting on port {}", config.http_port);

    let shutdown = CancellationToken::new();
    let settings = ControllerSettings {
        workers: config.workers,
        resync: config.resync_period,
    };

    let controllers_handle = match config.identity() {
        Some(identity) => {
            let transfer = ZfsVolumeTransfer::new(
                Arc::new(ProcessRunner),
                config.pool_dataset_prefix.clone(),
                identity.pool_id(),
            );
            let recorder = KubeEventRecorder::new(client.clone(), Some(identity.pool_id().to_string()));
            let context = Arc::new(Context {
                identity,
                backups,
                restores,
                ledger,
                transfer: Arc::new(transfer),
                recorder: Arc::new(recorder),
            });

            let backup_controller = controllers::run_backup_controller(
                Api::all(client.clone()),
                Arc::clone(&context),
                settings,
                shutdown.clone(),
            );
            let restore_controller = controllers::run_restore_controller(
                Api::all(client.clone()),
                context,
                settings,
                shutdown.clone(),
            );
            tokio::spawn(async move {
                tokio::join!(backup_controller, restore_controller);
            })
        }
        None => {
            warn!("Pool instance id not set, backup and restore controllers disabled");
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.cancelled().await })
        }
    };

    tokio::select! {
        res = &mut server_handle => {
            match res {
                Ok(Err(e)) => error!("HTTP server failed: {}", e),
                _ => error!("HTTP server exited unexpectedly"),
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    // Workers finish their in-flight items before the controllers return.
    shutdown.cancel();
    if let Err(e) = controllers_handle.await {
        error!("Controller task failed: {}", e);
    }
    server_handle.abort();

    info!("cStor Backup Operator stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
