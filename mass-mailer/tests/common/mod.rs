//! Shared fixtures for the integration tests.
//!
//! Each test gets its own pair of file-backed SQLite stores in a temp
//! directory, so several pools and workers can share them the way separate
//! processes would.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use mass_mailer::coordinator::{CoordinatorConfig, LivenessCoordinator};
use mass_mailer::database::models::{CampaignDbModel, CampaignMessageDbModel};
use mass_mailer::database::repositories::{
    CampaignRepository, SqlxCampaignRepository, SqlxQueueRepository,
    SqlxSendConfigurationRepository,
};
use mass_mailer::database::time::now_ms;
use mass_mailer::database::{
    DbPool, init_pool, run_operational_migrations, run_relational_migrations,
};
use mass_mailer::mail::{
    ChannelSettings, MailTransport, RelationalTaskCollector, RenderedMail, SendError,
    TransportReceipt,
};
use mass_mailer::operational::SqlxOperationalStore;
use mass_mailer::registry::{
    DEFAULT_MAX_RANGE, SqlxWorkerRegistry, WorkerRegistry, hash_email_piece, range_for_worker,
};
use mass_mailer::scheduler::{ChannelStatusTracker, Scheduler, SchedulerConfig};
use mass_mailer::synchronizer::{SyncInbox, Synchronizer, SynchronizerConfig};

/// Channels seeded into every relational store.
pub const MAIN_CHANNEL: i64 = 1;
pub const BACKUP_CHANNEL: i64 = 2;

fn sqlite_url(dir: &TempDir, name: &str) -> String {
    let path = dir.path().join(name);
    format!(
        "sqlite:{}?mode=rwc",
        path.to_string_lossy().replace('\\', "/")
    )
}

/// Both stores of one test.
pub struct TestStores {
    _dir: TempDir,
    pub relational: DbPool,
    pub operational: DbPool,
}

impl TestStores {
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");

        let relational = init_pool(&sqlite_url(&dir, "relational.db"))
            .await
            .expect("relational pool");
        run_relational_migrations(&relational)
            .await
            .expect("relational migrations");

        let operational = init_pool(&sqlite_url(&dir, "operational.db"))
            .await
            .expect("operational pool");
        run_operational_migrations(&operational)
            .await
            .expect("operational migrations");

        sqlx::query(
            r#"
            INSERT INTO send_configurations (id, name, from_email, from_name)
            VALUES (1, 'main', 'news@example.com', 'Newsroom'),
                   (2, 'backup', 'alt@example.com', NULL)
            "#,
        )
        .execute(&relational)
        .await
        .expect("seed channels");

        Self {
            _dir: dir,
            relational,
            operational,
        }
    }

    pub fn campaigns(&self) -> Arc<SqlxCampaignRepository> {
        Arc::new(SqlxCampaignRepository::new(self.relational.clone()))
    }

    pub fn queue(&self) -> Arc<SqlxQueueRepository> {
        Arc::new(SqlxQueueRepository::new(self.relational.clone()))
    }

    pub fn ops(&self) -> Arc<SqlxOperationalStore> {
        Arc::new(SqlxOperationalStore::new(self.operational.clone()))
    }

    pub fn registry(&self) -> Arc<SqlxWorkerRegistry> {
        Arc::new(SqlxWorkerRegistry::new(self.operational.clone()))
    }

    pub async fn add_file(&self, id: i64, filename: &str) {
        sqlx::query("INSERT INTO files (id, filename, mimetype, size) VALUES (?, ?, 'application/pdf', 128)")
            .bind(id)
            .bind(filename)
            .execute(&self.relational)
            .await
            .expect("insert file");
    }

    pub async fn file_locks(&self, id: i64) -> i64 {
        let (locked,): (i64,) = sqlx::query_as("SELECT locked FROM files WHERE id = ?")
            .bind(id)
            .fetch_one(&self.relational)
            .await
            .expect("file row");
        locked
    }

    /// Create a campaign due now with one message per recipient.
    pub async fn seed_campaign(&self, channel: i64, recipients: &[&str]) -> (i64, Vec<i64>) {
        let pieces: Vec<(&str, i64)> = recipients
            .iter()
            .map(|email| (*email, hash_email_piece(email)))
            .collect();
        self.seed_campaign_with_pieces(channel, &pieces).await
    }

    /// Like [`seed_campaign`](Self::seed_campaign) with a fixed hash piece
    /// per recipient, to place messages in a given worker's range.
    pub async fn seed_campaign_with_pieces(
        &self,
        channel: i64,
        recipients: &[(&str, i64)],
    ) -> (i64, Vec<i64>) {
        let campaigns = self.campaigns();
        let mut campaign = CampaignDbModel::new("Launch", channel, now_ms() - 1_000, "Hello");
        campaign.html = Some("<p>Hello</p>".to_string());
        campaign.text = Some("Hello".to_string());
        campaign.lists = "[1]".to_string();
        let campaign_id = campaigns
            .create_campaign(&campaign)
            .await
            .expect("create campaign");

        let mut ids = Vec::with_capacity(recipients.len());
        for (i, (email, piece)) in recipients.iter().enumerate() {
            let mut message = campaign_message(campaign_id, i as i64 + 1, email);
            message.hash_email_piece = *piece;
            ids.push(
                campaigns
                    .add_message(&message)
                    .await
                    .expect("add message"),
            );
        }
        (campaign_id, ids)
    }
}

pub fn campaign_message(campaign_id: i64, subscription_id: i64, email: &str) -> CampaignMessageDbModel {
    CampaignMessageDbModel {
        id: 0,
        campaign_id,
        list_id: Some(1),
        subscription_id: Some(subscription_id),
        email: email.to_string(),
        hash_email_piece: hash_email_piece(email),
        status: "SCHEDULED".to_string(),
        response: None,
        response_id: None,
        updated_at: 0,
    }
}

/// Scheduler and synchronizer wired over the test stores.
pub struct Backend {
    pub scheduler: Arc<Scheduler>,
    pub synchronizer: Arc<Synchronizer>,
    pub tracker: Arc<ChannelStatusTracker>,
    pub inbox: Arc<SyncInbox>,
}

impl Backend {
    pub fn new(stores: &TestStores) -> Self {
        let campaigns = stores.campaigns();
        let queue = stores.queue();
        let collector = Arc::new(RelationalTaskCollector::new(
            campaigns.clone(),
            Arc::new(SqlxSendConfigurationRepository::new(stores.relational.clone())),
        ));
        let tracker = Arc::new(ChannelStatusTracker::new());
        let inbox = Arc::new(SyncInbox::new());

        let synchronizer = Arc::new(Synchronizer::new(
            campaigns.clone(),
            queue.clone(),
            stores.ops(),
            collector,
            tracker.clone(),
            inbox.clone(),
            SynchronizerConfig::default(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            campaigns,
            queue,
            tracker.clone(),
            inbox.clone(),
            SchedulerConfig::default(),
        ));

        Self {
            scheduler,
            synchronizer,
            tracker,
            inbox,
        }
    }
}

pub fn fast_coordinator_config() -> CoordinatorConfig {
    CoordinatorConfig {
        period_ms: 20,
        synchronizing_round: 50,
    }
}

/// A started worker that owns the whole hash space.
pub async fn solo_worker(stores: &TestStores) -> Arc<LivenessCoordinator> {
    let registry = stores.registry();
    registry
        .bootstrap(1, DEFAULT_MAX_RANGE, false)
        .await
        .expect("bootstrap");
    let coordinator = Arc::new(LivenessCoordinator::new(
        0,
        range_for_worker(0, 1, DEFAULT_MAX_RANGE).expect("range"),
        registry,
        fast_coordinator_config(),
    ));
    let started = coordinator
        .start(&tokio_util::sync::CancellationToken::new())
        .await
        .expect("start");
    assert!(started);
    coordinator
}

/// Transport that records every delivery and fails on demand.
#[derive(Default)]
pub struct RecordingTransport {
    delivered: Mutex<Vec<RenderedMail>>,
    transient_channels: Mutex<HashSet<i64>>,
    rejected_recipients: Mutex<HashSet<String>>,
    attempts: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_channel(&self, channel: i64) {
        self.transient_channels.lock().insert(channel);
    }

    pub fn heal_channel(&self, channel: i64) {
        self.transient_channels.lock().remove(&channel);
    }

    pub fn reject(&self, recipient: &str) {
        self.rejected_recipients.lock().insert(recipient.to_string());
    }

    pub fn delivered(&self) -> Vec<RenderedMail> {
        self.delivered.lock().clone()
    }

    pub fn recipients(&self) -> Vec<String> {
        self.delivered.lock().iter().map(|m| m.recipient.clone()).collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn throttle(&self, _channel: &ChannelSettings) {}

    async fn send(&self, mail: &RenderedMail) -> Result<TransportReceipt, SendError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.transient_channels.lock().contains(&mail.send_configuration_id) {
            return Err(SendError::transient("421 service not available"));
        }
        if self.rejected_recipients.lock().contains(&mail.recipient) {
            return Err(SendError::permanent("550 mailbox unavailable"));
        }
        let mut delivered = self.delivered.lock();
        delivered.push(mail.clone());
        Ok(TransportReceipt {
            response: "250 queued".to_string(),
            message_id: Some(format!("relay-{}", delivered.len())),
        })
    }
}
