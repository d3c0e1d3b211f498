//! Email queue driven through the discovered job modules
//!
//! Run with: cargo test -p atcdrill-worker --test email_queue

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use atcdrill_jobs::{
    InMemoryJobStore, JobData, JobOptions, JobRecord, JobState, QueueService, QueueSystem,
};
use atcdrill_worker::jobs::email_job::EmailJobData;
use atcdrill_worker::{
    discovered_modules, EmailMessage, JobContext, Mailer, MailerError, WorkerConfig,
};

/// Mailer that records messages and can be told to fail
#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<EmailMessage>>,
    failure: Mutex<Option<fn() -> MailerError>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, message: EmailMessage) -> Result<String, MailerError> {
        if let Some(failure) = *self.failure.lock() {
            return Err(failure());
        }
        let mut sent = self.sent.lock();
        sent.push(message);
        Ok(format!("msg-{}", sent.len()))
    }
}

fn rejected() -> MailerError {
    MailerError::Rejected("mailbox does not exist".to_string())
}

fn unavailable() -> MailerError {
    MailerError::Unavailable("smtp timeout".to_string())
}

async fn start(mailer: Arc<RecordingMailer>) -> QueueSystem {
    let system = QueueSystem::new(Arc::new(InMemoryJobStore::new()));
    let ctx = JobContext::new(mailer, &WorkerConfig::default());

    let report = system.load_modules(&discovered_modules(), &ctx).await;
    assert!(report.failed.is_empty(), "failed modules: {:?}", report.failed);
    assert!(report.registered.contains(&"email_job"));

    system.initialize().await.unwrap();
    system
}

async fn wait_for_state(service: &QueueService, job_id: &str, state: JobState) -> JobRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(job) = service.get_job("email", job_id).await.unwrap() {
            if job.state == state {
                return job;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "email job {} never reached {:?}",
            job_id,
            state
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn welcome(to: &str) -> EmailJobData {
    EmailJobData {
        to: to.to_string(),
        template: "welcome".to_string(),
        variables: BTreeMap::from([("name".to_string(), json!("Sam"))]),
        cc: None,
        bcc: Some(vec!["audit@example.com".to_string()]),
        attachments: None,
    }
}

#[test_log::test(tokio::test)]
async fn test_email_job_is_delivered() {
    let mailer = Arc::new(RecordingMailer::default());
    let system = start(Arc::clone(&mailer)).await;

    let status = system.status().await;
    assert_eq!(status.registry.queues, vec!["email"]);

    let service = system.service();
    let job = service
        .add(
            JobData::new(welcome("sam@example.com")).with_user_id("user-1"),
            JobOptions::new(),
        )
        .await
        .unwrap();
    // Queue defaults from the email definition
    assert_eq!(job.attempts, 3);

    let done = wait_for_state(&service, &job.id, JobState::Completed).await;
    assert_eq!(
        done.result,
        Some(json!({ "messageId": "msg-1", "to": "sam@example.com" }))
    );

    let sent = mailer.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].template, "welcome");
    assert_eq!(sent[0].variables["name"], json!("Sam"));
    assert_eq!(sent[0].bcc, vec!["audit@example.com"]);
    assert!(sent[0].cc.is_empty());

    system.shutdown().await;
}

#[tokio::test]
async fn test_invalid_recipient_is_not_retried() {
    let mailer = Arc::new(RecordingMailer::default());
    let system = start(Arc::clone(&mailer)).await;

    let service = system.service();
    let job = service
        .add(JobData::new(welcome("not-an-address")), JobOptions::new())
        .await
        .unwrap();

    let failed = wait_for_state(&service, &job.id, JobState::Failed).await;
    assert_eq!(failed.attempts_made, 1);
    assert!(failed
        .failed_reason
        .unwrap_or_default()
        .contains("invalid recipient"));
    assert!(mailer.sent.lock().is_empty());

    system.shutdown().await;
}

#[tokio::test]
async fn test_payload_without_variables_is_not_retried() {
    let mailer = Arc::new(RecordingMailer::default());
    let system = start(Arc::clone(&mailer)).await;

    let service = system.service();
    let job = service
        .add_job(
            "email",
            json!({ "to": "sam@example.com", "template": "welcome" }),
            JobOptions::new(),
        )
        .await
        .unwrap();

    let failed = wait_for_state(&service, &job.id, JobState::Failed).await;
    assert_eq!(failed.attempts_made, 1);
    let reason = failed.failed_reason.unwrap_or_default();
    assert!(reason.starts_with("INVALID_PAYLOAD"), "{}", reason);
    assert!(reason.contains("variables"), "{}", reason);
    assert!(mailer.sent.lock().is_empty());

    system.shutdown().await;
}

#[tokio::test]
async fn test_rejected_message_fails_without_retry() {
    let mailer = Arc::new(RecordingMailer::default());
    *mailer.failure.lock() = Some(rejected);
    let system = start(Arc::clone(&mailer)).await;

    let service = system.service();
    let job = service
        .add(JobData::new(welcome("gone@example.com")), JobOptions::new())
        .await
        .unwrap();

    let failed = wait_for_state(&service, &job.id, JobState::Failed).await;
    assert_eq!(failed.attempts_made, 1);
    assert_eq!(
        failed.failed_reason.as_deref(),
        Some("MAILER: rejected: mailbox does not exist")
    );

    system.shutdown().await;
}

#[tokio::test]
async fn test_unavailable_mailer_schedules_retry() {
    let mailer = Arc::new(RecordingMailer::default());
    *mailer.failure.lock() = Some(unavailable);
    let system = start(Arc::clone(&mailer)).await;

    let service = system.service();
    let job = service
        .add(JobData::new(welcome("sam@example.com")), JobOptions::new())
        .await
        .unwrap();

    // First retry waits the 5s exponential backoff
    let delayed = wait_for_state(&service, &job.id, JobState::Delayed).await;
    assert_eq!(delayed.attempts_made, 1);
    assert_eq!(delayed.error_history, vec!["MAILER: delivery failed: smtp timeout"]);

    system.shutdown().await;
}
