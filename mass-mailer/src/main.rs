//! Scheduler and synchronizer process.
//!
//! Runs as a singleton next to the relational store: the scheduler hands due
//! campaigns and queued messages to the synchronizer, which pushes them into
//! the operational store and replays sender outcomes back.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mass_mailer::config::MailerConfig;
use mass_mailer::database::repositories::{
    SqlxCampaignRepository, SqlxQueueRepository, SqlxSendConfigurationRepository,
};
use mass_mailer::database;
use mass_mailer::logging::init_logging;
use mass_mailer::mail::RelationalTaskCollector;
use mass_mailer::operational::SqlxOperationalStore;
use mass_mailer::scheduler::{ChannelStatusTracker, Scheduler};
use mass_mailer::shutdown::wait_for_signal;
use mass_mailer::synchronizer::{SyncInbox, Synchronizer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = MailerConfig::from_env().context("invalid configuration")?;
    let (logging, _log_guard) = init_logging(config.log_dir.as_deref(), "mass-mailer.log")?;

    let cancel = CancellationToken::new();
    logging.start_retention_cleanup(cancel.clone());

    let relational = database::init_pool(&config.database_url)
        .await
        .context("failed to open relational store")?;
    database::run_relational_migrations(&relational).await?;

    let operational = database::init_pool(&config.operational_database_url)
        .await
        .context("failed to open operational store")?;
    database::run_operational_migrations(&operational).await?;

    let campaigns = Arc::new(SqlxCampaignRepository::new(relational.clone()));
    let queue = Arc::new(SqlxQueueRepository::new(relational.clone()));
    let send_configurations = Arc::new(SqlxSendConfigurationRepository::new(relational.clone()));
    let ops = Arc::new(SqlxOperationalStore::new(operational.clone()));
    let collector = Arc::new(RelationalTaskCollector::new(
        campaigns.clone(),
        send_configurations,
    ));

    let tracker = Arc::new(ChannelStatusTracker::new());
    let inbox = Arc::new(SyncInbox::new());

    let synchronizer = Arc::new(Synchronizer::new(
        campaigns.clone(),
        queue.clone(),
        ops,
        collector,
        tracker.clone(),
        inbox.clone(),
        config.synchronizer.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        campaigns,
        queue,
        tracker,
        inbox,
        config.scheduler.clone(),
    ));

    let scheduler_handle = tokio::spawn(scheduler.run(cancel.clone()));
    let synchronizer_handle = tokio::spawn(synchronizer.run(cancel.clone()));

    info!("mass-mailer scheduler started");
    wait_for_signal(cancel.clone()).await;

    for (name, handle) in [
        ("scheduler", scheduler_handle),
        ("synchronizer", synchronizer_handle),
    ] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Task ended abnormally");
        }
    }

    relational.close().await;
    operational.close().await;
    info!("mass-mailer scheduler stopped");
    Ok(())
}
