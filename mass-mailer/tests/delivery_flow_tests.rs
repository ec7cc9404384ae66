//! End-to-end delivery: scheduler hand-off, synchronizer push, sender
//! delivery and outcome replay back into the relational store.

mod common;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use mass_mailer::Error;
use mass_mailer::coordinator::LivenessCoordinator;
use mass_mailer::database::models::{CampaignStatus, QueueType, QueuedMessageDbModel};
use mass_mailer::database::repositories::{CampaignRepository, QueueRepository};
use mass_mailer::database::time::now_ms;
use mass_mailer::mail::BundleComposer;
use mass_mailer::operational::{OperationalStore, SendTaskDbModel, TaskStatus};
use mass_mailer::registry::{DEFAULT_MAX_RANGE, WorkerRegistry, range_for_worker};
use mass_mailer::sender::{SenderConfig, SenderLoop};

use common::{
    Backend, MAIN_CHANNEL, RecordingTransport, TestStores, fast_coordinator_config, solo_worker,
};

async fn sender(stores: &TestStores, transport: Arc<RecordingTransport>) -> SenderLoop {
    SenderLoop::new(
        stores.ops(),
        Arc::new(BundleComposer::new()),
        transport,
        solo_worker(stores).await,
        SenderConfig::default(),
    )
}

#[tokio::test]
async fn test_campaign_is_delivered_and_finished() {
    let stores = TestStores::new().await;
    let backend = Backend::new(&stores);
    let transport = RecordingTransport::new();
    let sender = sender(&stores, transport.clone()).await;
    let campaigns = stores.campaigns();

    let (campaign_id, message_ids) = stores
        .seed_campaign(
            MAIN_CHANNEL,
            &["ann@example.com", "bob@example.com", "gone@example.com"],
        )
        .await;
    transport.reject("gone@example.com");

    let checked = backend.scheduler.check_campaigns(now_ms()).await.unwrap();
    assert_eq!(checked.claimed, 1);
    assert_eq!(
        campaigns.get_campaign(campaign_id).await.unwrap().campaign_status(),
        Some(CampaignStatus::Synchronizing)
    );

    let pushed = backend.synchronizer.sync_once(now_ms()).await.unwrap();
    assert_eq!(pushed.campaigns_pushed, 1);
    assert_eq!(
        campaigns.get_campaign(campaign_id).await.unwrap().campaign_status(),
        Some(CampaignStatus::Sending)
    );
    let task_id = SendTaskDbModel::campaign_task_id(campaign_id);
    assert_eq!(stores.ops().count_task_messages(&task_id).await.unwrap(), 3);

    let stats = sender.run_iteration().await.unwrap();
    assert_eq!(stats.pulled, 3);
    assert_eq!(stats.sent, 2);
    assert_eq!(stats.failed, 1);

    let mut recipients = transport.recipients();
    recipients.sort();
    assert_eq!(recipients, vec!["ann@example.com", "bob@example.com"]);
    let mail = &transport.delivered()[0];
    assert_eq!(mail.from, "Newsroom <news@example.com>");
    assert!(
        mail.headers
            .contains(&("X-Campaign-Id".to_string(), campaign_id.to_string()))
    );

    let replayed = backend.synchronizer.sync_once(now_ms()).await.unwrap();
    assert_eq!(replayed.messages_replayed, 3);
    assert_eq!(replayed.outcomes_applied, 3);
    assert_eq!(replayed.campaigns_finished, 1);

    let campaign = campaigns.get_campaign(campaign_id).await.unwrap();
    assert_eq!(campaign.campaign_status(), Some(CampaignStatus::Finished));
    assert_eq!(campaign.delivered, 2);
    assert_eq!(campaign.failed, 1);

    let sent = campaigns.get_message(message_ids[0]).await.unwrap();
    assert_eq!(sent.status, "SENT");
    assert_eq!(sent.response.as_deref(), Some("250 queued"));
    let rejected = campaigns.get_message(message_ids[2]).await.unwrap();
    assert_eq!(rejected.status, "FAILED");
    assert_eq!(rejected.response.as_deref(), Some("550 mailbox unavailable"));

    assert!(stores.ops().get_task(&task_id).await.unwrap().is_none());

    // Nothing left to do on another pass.
    assert!(backend.synchronizer.sync_once(now_ms()).await.unwrap().is_idle());
}

#[tokio::test]
async fn test_campaign_without_recipients_finishes_on_push() {
    let stores = TestStores::new().await;
    let backend = Backend::new(&stores);
    let (campaign_id, _) = stores.seed_campaign(MAIN_CHANNEL, &[]).await;

    backend.scheduler.check_campaigns(now_ms()).await.unwrap();
    let stats = backend.synchronizer.sync_once(now_ms()).await.unwrap();
    assert_eq!(stats.campaigns_pushed, 1);

    let campaign = stores.campaigns().get_campaign(campaign_id).await.unwrap();
    assert_eq!(campaign.campaign_status(), Some(CampaignStatus::Finished));
    let task_id = SendTaskDbModel::campaign_task_id(campaign_id);
    assert!(stores.ops().get_task(&task_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_paused_campaign_is_not_delivered() {
    let stores = TestStores::new().await;
    let backend = Backend::new(&stores);
    let transport = RecordingTransport::new();
    let sender = sender(&stores, transport.clone()).await;
    let campaigns = stores.campaigns();

    let (campaign_id, _) = stores
        .seed_campaign(MAIN_CHANNEL, &["ann@example.com", "bob@example.com"])
        .await;
    backend.scheduler.check_campaigns(now_ms()).await.unwrap();
    backend.synchronizer.sync_once(now_ms()).await.unwrap();

    assert!(
        campaigns
            .transition(campaign_id, CampaignStatus::Sending, CampaignStatus::Pausing)
            .await
            .unwrap()
    );
    let checked = backend.scheduler.check_campaigns(now_ms()).await.unwrap();
    assert_eq!(checked.pausing, 1);
    let stats = backend.synchronizer.sync_once(now_ms()).await.unwrap();
    assert_eq!(stats.campaigns_paused, 1);

    assert_eq!(
        campaigns.get_campaign(campaign_id).await.unwrap().campaign_status(),
        Some(CampaignStatus::Paused)
    );
    let task = stores
        .ops()
        .get_task(&SendTaskDbModel::campaign_task_id(campaign_id))
        .await
        .unwrap()
        .expect("paused task is kept");
    assert_eq!(task.task_status(), Some(TaskStatus::Paused));

    let iteration = sender.run_iteration().await.unwrap();
    assert_eq!(iteration.pulled, 0);
    assert_eq!(transport.attempts(), 0);
}

#[tokio::test]
async fn test_queued_messages_are_delivered_by_priority_with_attachments() {
    let stores = TestStores::new().await;
    let backend = Backend::new(&stores);
    let transport = RecordingTransport::new();
    let sender = sender(&stores, transport.clone()).await;
    let queue = stores.queue();
    stores.add_file(7, "invoice.pdf").await;

    let mut test_mail = QueuedMessageDbModel::new(MAIN_CHANNEL, QueueType::Test, "dev@example.com");
    test_mail.data = r#"{"subject":"Preview","text":"preview body"}"#.to_string();
    let test_id = queue.enqueue(&test_mail).await.unwrap();

    let mut invoice =
        QueuedMessageDbModel::new(MAIN_CHANNEL, QueueType::ApiTransactional, "cid@example.com");
    invoice.data = r#"{"subject":"Invoice","html":"<p>attached</p>"}"#.to_string();
    invoice.attachments = "[7]".to_string();
    let invoice_id = queue.enqueue(&invoice).await.unwrap();

    let checked = backend.scheduler.check_queue(now_ms()).await.unwrap();
    assert_eq!(checked.handed_off, 2);
    assert_eq!(checked.channels, 1);

    let pushed = backend.synchronizer.sync_once(now_ms()).await.unwrap();
    assert_eq!(pushed.queued_pushed, 2);
    assert!(queue.get_message(invoice_id).await.unwrap().is_processing());
    assert_eq!(stores.file_locks(7).await, 1);

    // Held messages are not handed off twice.
    let again = backend.scheduler.check_queue(now_ms()).await.unwrap();
    assert_eq!(again.handed_off, 0);

    let stats = sender.run_iteration().await.unwrap();
    assert_eq!(stats.sent, 2);
    assert_eq!(
        transport.recipients(),
        vec!["cid@example.com", "dev@example.com"]
    );
    let delivered = transport.delivered();
    assert_eq!(delivered[0].subject, "Invoice");
    assert_eq!(delivered[0].attachments.len(), 1);
    assert_eq!(delivered[0].attachments[0].filename, "invoice.pdf");
    assert_eq!(delivered[1].text.as_deref(), Some("preview body"));

    let replayed = backend.synchronizer.sync_once(now_ms()).await.unwrap();
    assert_eq!(replayed.messages_replayed, 2);
    for id in [test_id, invoice_id] {
        assert!(matches!(
            queue.get_message(id).await,
            Err(Error::NotFound { .. })
        ));
    }
    assert_eq!(stores.file_locks(7).await, 0);
}

#[tokio::test]
async fn test_queued_message_with_missing_attachment_fails() {
    let stores = TestStores::new().await;
    let backend = Backend::new(&stores);
    let transport = RecordingTransport::new();
    let sender = sender(&stores, transport.clone()).await;
    let queue = stores.queue();
    stores.add_file(7, "invoice.pdf").await;

    let mut message =
        QueuedMessageDbModel::new(MAIN_CHANNEL, QueueType::Triggered, "eve@example.com");
    message.data = r#"{"subject":"Welcome","html":"<p>hi</p>"}"#.to_string();
    message.attachments = "[7]".to_string();
    let id = queue.enqueue(&message).await.unwrap();

    backend.scheduler.check_queue(now_ms()).await.unwrap();
    backend.synchronizer.sync_once(now_ms()).await.unwrap();

    // The file disappears from the bundle after the push.
    let task_id = SendTaskDbModel::queued_task_id(MAIN_CHANNEL);
    let ops = stores.ops();
    let task = ops.get_task(&task_id).await.unwrap().unwrap();
    let mut bundle = task.task_bundle().unwrap();
    bundle.attachments.clear();
    sqlx::query("UPDATE send_tasks SET bundle = ? WHERE id = ?")
        .bind(serde_json::to_string(&bundle).unwrap())
        .bind(&task_id)
        .execute(&stores.operational)
        .await
        .unwrap();

    let stats = sender.run_iteration().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(transport.attempts(), 0);

    backend.synchronizer.sync_once(now_ms()).await.unwrap();
    let failed = queue.get_message(id).await.unwrap();
    assert_eq!(failed.status, "FAILED");
    assert!(!failed.is_processing());
    assert_eq!(
        failed.response.as_deref(),
        Some("attachment 7 is not available")
    );
    assert_eq!(stores.file_locks(7).await, 0);
}

#[tokio::test]
async fn test_paused_campaign_finished_by_retention_drops_its_task() {
    let stores = TestStores::new().await;
    let backend = Backend::new(&stores);
    let campaigns = stores.campaigns();
    let ops = stores.ops();

    let (campaign_id, _) = stores
        .seed_campaign(MAIN_CHANNEL, &["ann@example.com", "bob@example.com"])
        .await;
    backend.scheduler.check_campaigns(now_ms()).await.unwrap();
    backend.synchronizer.sync_once(now_ms()).await.unwrap();
    campaigns
        .transition(campaign_id, CampaignStatus::Sending, CampaignStatus::Pausing)
        .await
        .unwrap();
    backend.scheduler.check_campaigns(now_ms()).await.unwrap();
    backend.synchronizer.sync_once(now_ms()).await.unwrap();

    let task_id = SendTaskDbModel::campaign_task_id(campaign_id);
    assert_eq!(ops.count_task_messages(&task_id).await.unwrap(), 2);

    let later = now_ms() + 40 * 24 * 3_600_000;
    let checked = backend.scheduler.check_campaigns(later).await.unwrap();
    assert_eq!(checked.finished, 1);

    backend.synchronizer.sync_once(later).await.unwrap();
    assert_eq!(
        campaigns.get_campaign(campaign_id).await.unwrap().campaign_status(),
        Some(CampaignStatus::Finished)
    );
    assert!(ops.get_task(&task_id).await.unwrap().is_none());
    assert_eq!(ops.count_task_messages(&task_id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_store_error_on_one_message_does_not_abort_the_iteration() {
    let stores = TestStores::new().await;
    let backend = Backend::new(&stores);
    let transport = RecordingTransport::new();
    let registry = stores.registry();

    // Worker 0 still holds the range of worker 1, which is back and waiting.
    registry.bootstrap(2, DEFAULT_MAX_RANGE, false).await.unwrap();
    let coordinator = Arc::new(LivenessCoordinator::new(
        0,
        range_for_worker(0, 2, DEFAULT_MAX_RANGE).unwrap(),
        registry.clone(),
        fast_coordinator_config(),
    ));
    assert!(coordinator.start(&CancellationToken::new()).await.unwrap());
    sqlx::query("UPDATE workers SET substitute = 0, state = 'SYNCHRONIZING' WHERE id = 1")
        .execute(&stores.operational)
        .await
        .unwrap();
    coordinator.reconcile().await.unwrap();
    assert_eq!(coordinator.active_ranges().len(), 2);

    let second_half = DEFAULT_MAX_RANGE / 2 + 10;
    stores
        .seed_campaign_with_pieces(
            MAIN_CHANNEL,
            &[
                ("ann@example.com", 10),
                ("broken@example.com", 20),
                ("carl@example.com", second_half),
            ],
        )
        .await;
    backend.scheduler.check_campaigns(now_ms()).await.unwrap();
    backend.synchronizer.sync_once(now_ms()).await.unwrap();

    sqlx::query(
        r#"
        CREATE TRIGGER fail_delivery_record BEFORE UPDATE OF response ON outgoing_messages
        WHEN NEW.recipient = 'broken@example.com' AND NEW.response IS NOT NULL
        BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END
        "#,
    )
    .execute(&stores.operational)
    .await
    .unwrap();

    let sender = SenderLoop::new(
        stores.ops(),
        Arc::new(BundleComposer::new()),
        transport.clone(),
        coordinator.clone(),
        SenderConfig::default(),
    );
    let stats = sender.run_iteration().await.unwrap();
    assert_eq!(stats.sent, 2);
    assert_eq!(stats.errors, 1);
    assert_eq!(
        transport.recipients(),
        vec!["ann@example.com", "broken@example.com", "carl@example.com"]
    );

    // The failed bookkeeping leaves the message SENT for the stale replay.
    let (status, response): (String, Option<String>) = sqlx::query_as(
        "SELECT status, response FROM outgoing_messages WHERE recipient = 'broken@example.com'",
    )
    .fetch_one(&stores.operational)
    .await
    .unwrap();
    assert_eq!(status, "SENT");
    assert_eq!(response, None);

    // The waiting worker got its range back after the pass.
    assert_eq!(registry.get_worker(1).await.unwrap().substitute, None);
    assert_eq!(coordinator.active_ranges().len(), 1);
}

#[tokio::test]
async fn test_orphaned_campaign_outcome_is_dropped_without_blocking_replay() {
    let stores = TestStores::new().await;
    let backend = Backend::new(&stores);
    let campaigns = stores.campaigns();

    let (campaign_id, message_ids) = stores
        .seed_campaign(MAIN_CHANNEL, &["ann@example.com", "bob@example.com"])
        .await;
    backend.scheduler.check_campaigns(now_ms()).await.unwrap();
    backend.synchronizer.sync_once(now_ms()).await.unwrap();

    sqlx::query("UPDATE outgoing_messages SET status = 'SENT', response = '250 queued'")
        .execute(&stores.operational)
        .await
        .unwrap();
    sqlx::query("UPDATE outgoing_messages SET campaign_id = NULL WHERE recipient = 'bob@example.com'")
        .execute(&stores.operational)
        .await
        .unwrap();

    let stats = backend.synchronizer.sync_once(now_ms()).await.unwrap();
    assert_eq!(stats.messages_replayed, 2);
    assert_eq!(stats.outcomes_applied, 1);

    assert_eq!(campaigns.get_message(message_ids[0]).await.unwrap().status, "SENT");
    assert_eq!(
        campaigns.get_message(message_ids[1]).await.unwrap().status,
        "SCHEDULED"
    );
    let task_id = SendTaskDbModel::campaign_task_id(campaign_id);
    assert_eq!(stores.ops().count_task_messages(&task_id).await.unwrap(), 0);
}
