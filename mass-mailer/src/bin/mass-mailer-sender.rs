//! Sender worker process.
//!
//! One process per worker slot. The worker joins the registry, waits until no
//! peer is covering its range, then delivers messages from the operational
//! store while heartbeating and picking up ranges of dead peers.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mass_mailer::config::MailerConfig;
use mass_mailer::coordinator::LivenessCoordinator;
use mass_mailer::database;
use mass_mailer::logging::init_logging;
use mass_mailer::mail::{
    BundleComposer, ChannelThrottle, DryRunTransport, HttpRelayTransport, MailTransport,
};
use mass_mailer::operational::SqlxOperationalStore;
use mass_mailer::registry::{SqlxWorkerRegistry, WorkerRegistry, range_for_worker};
use mass_mailer::sender::SenderLoop;
use mass_mailer::shutdown::wait_for_signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = MailerConfig::from_env().context("invalid configuration")?;
    let worker = config.require_worker()?;
    let file_prefix = format!("mass-mailer-sender-{}.log", worker.worker_id);
    let (logging, _log_guard) = init_logging(config.log_dir.as_deref(), &file_prefix)?;

    let cancel = CancellationToken::new();
    logging.start_retention_cleanup(cancel.clone());
    tokio::spawn(wait_for_signal(cancel.clone()));

    let operational = database::init_pool(&config.operational_database_url)
        .await
        .context("failed to open operational store")?;
    database::run_operational_migrations(&operational).await?;

    let registry = Arc::new(SqlxWorkerRegistry::new(operational.clone()));
    registry
        .bootstrap(worker.max_workers, config.max_range, config.reset_registry)
        .await?;

    let own_range = range_for_worker(worker.worker_id, worker.max_workers, config.max_range)?;
    let coordinator = Arc::new(LivenessCoordinator::new(
        worker.worker_id,
        own_range,
        registry,
        config.coordinator.clone(),
    ));
    info!(
        worker_id = worker.worker_id,
        max_workers = worker.max_workers,
        from = own_range.from,
        to = own_range.to,
        "Sender worker joining"
    );

    if !coordinator.start(&cancel).await? {
        info!("Cancelled before the worker became active");
        operational.close().await;
        return Ok(());
    }

    let throttle = ChannelThrottle::new(config.transport.throttle())?;
    let transport: Arc<dyn MailTransport> = match config.transport.relay() {
        Some(relay) => {
            info!(url = %relay.url, "Delivering through the HTTP relay");
            Arc::new(HttpRelayTransport::new(relay, throttle)?)
        }
        None => {
            info!("No relay configured, using the dry-run transport");
            Arc::new(DryRunTransport::new(throttle))
        }
    };

    let coordinator_handle = tokio::spawn(coordinator.clone().run(cancel.clone()));

    let sender = SenderLoop::new(
        Arc::new(SqlxOperationalStore::new(operational.clone())),
        Arc::new(BundleComposer::new()),
        transport,
        coordinator,
        config.sender.clone(),
    );
    sender.run(cancel.clone()).await;

    cancel.cancel();
    if let Err(e) = coordinator_handle.await {
        error!(error = %e, "Liveness coordinator ended abnormally");
    }

    operational.close().await;
    info!(worker_id = worker.worker_id, "Sender worker stopped");
    Ok(())
}
