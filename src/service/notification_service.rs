// service/notification_service.rs
use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    config::Config,
    db::escrowdb::EscrowExt,
    models::escrowmodel::{EscrowEvent, OutboxEntry},
    service::error::ServiceError,
};

/// Downstream consumer of outbox events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, entry: &OutboxEntry) -> Result<(), ServiceError>;
}

#[derive(Debug, Serialize)]
struct PushMessage<'a> {
    event_id: Uuid,
    kind: &'static str,
    recipients: Vec<Uuid>,
    title: &'static str,
    body: String,
    data: &'a EscrowEvent,
}

/// Turns escrow events into user notifications. Without a broker URL the
/// messages are only logged.
#[derive(Debug, Clone)]
pub struct NotificationService {
    client: reqwest::Client,
    push_broker_url: Option<String>,
}

impl NotificationService {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            push_broker_url: config.push_broker_url.clone(),
        }
    }

    /// Parties named by the event itself. The broker resolves the rest of
    /// the audience from the milestone id.
    fn recipients(event: &EscrowEvent) -> Vec<Uuid> {
        match event {
            EscrowEvent::MilestoneCreated { client_id, .. } => vec![*client_id],
            EscrowEvent::DeliverableSubmitted { freelancer_id, .. } => vec![*freelancer_id],
            EscrowEvent::FundsReleased { freelancer_id, .. } => vec![*freelancer_id],
            EscrowEvent::EscrowRefunded { client_id, .. } | EscrowEvent::PaymentOverdue { client_id, .. } => {
                vec![*client_id]
            }
            _ => Vec::new(),
        }
    }

    fn title(event: &EscrowEvent) -> &'static str {
        match event {
            EscrowEvent::MilestoneCreated { .. } => "New milestone proposed",
            EscrowEvent::MilestoneStatusChanged { .. } => "Milestone updated",
            EscrowEvent::FundingRequested { .. } => "Escrow funding requested",
            EscrowEvent::EscrowFunded { .. } => "Escrow funded",
            EscrowEvent::DeliverableSubmitted { .. } => "Deliverable submitted",
            EscrowEvent::MilestoneReviewed { approved: true, .. } => "Milestone approved",
            EscrowEvent::MilestoneReviewed { approved: false, .. } => "Changes requested",
            EscrowEvent::FundsReleased { .. } => "Payment released",
            EscrowEvent::DisputeRaised { .. } => "Dispute raised",
            EscrowEvent::DisputeResolved { .. } => "Dispute resolved",
            EscrowEvent::EscrowRefunded { .. } => "Escrow refunded",
            EscrowEvent::PaymentOverdue { .. } => "Milestone payment overdue",
        }
    }

    fn body(event: &EscrowEvent) -> String {
        match event {
            EscrowEvent::MilestoneStatusChanged { from, to, .. } => {
                format!("Milestone moved from {} to {}", from, to)
            }
            EscrowEvent::FundsReleased { amount, .. } => format!("{} has been sent to your account", amount),
            EscrowEvent::EscrowRefunded { amount, .. } => format!("{} has been refunded", amount),
            EscrowEvent::DisputeRaised { reason, .. } => format!("Reason: {}", reason),
            EscrowEvent::DisputeResolved { resolution, .. } => format!("Outcome: {}", resolution.label()),
            EscrowEvent::MilestoneReviewed { notes: Some(notes), .. } => notes.clone(),
            other => Self::title(other).to_string(),
        }
    }
}

#[async_trait]
impl EventSink for NotificationService {
    async fn deliver(&self, entry: &OutboxEntry) -> Result<(), ServiceError> {
        let event = &entry.event.0;
        let message = PushMessage {
            event_id: entry.id,
            kind: event.kind(),
            recipients: Self::recipients(event),
            title: Self::title(event),
            body: Self::body(event),
            data: event,
        };

        let Some(url) = &self.push_broker_url else {
            tracing::info!(
                "Notification {} for milestone {}: {}",
                message.kind,
                entry.milestone_id,
                message.body
            );
            return Ok(());
        };

        let response = self
            .client
            .post(url)
            .json(&message)
            .send()
            .await
            .map_err(|e| ServiceError::Notification(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ServiceError::Notification(format!(
                "push broker answered {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Serialize)]
pub struct RelayReport {
    pub delivered: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

/// Deliver one batch of pending outbox rows in commit order. Once an event
/// for a milestone fails, later events for that milestone wait for the next
/// pass so consumers never see them out of order. A row that fails
/// `max_attempts` times is dead-lettered and no longer fetched.
pub async fn relay_outbox(
    store: &Arc<dyn EscrowExt>,
    sink: &dyn EventSink,
    batch_size: i64,
    max_attempts: i32,
) -> Result<RelayReport, ServiceError> {
    let mut report = RelayReport::default();
    let mut blocked: HashSet<Uuid> = HashSet::new();

    for entry in store.pending_outbox(batch_size, max_attempts).await? {
        if blocked.contains(&entry.milestone_id) {
            continue;
        }

        match sink.deliver(&entry).await {
            Ok(()) => {
                store.mark_outbox_delivered(entry.id).await?;
                report.delivered += 1;
            }
            Err(e) => {
                tracing::warn!(
                    "Outbox event {} ({}) not delivered, attempt {}: {}",
                    entry.id,
                    entry.event.0.kind(),
                    entry.attempts + 1,
                    e
                );
                store.record_outbox_failure(entry.id).await?;
                blocked.insert(entry.milestone_id);
                report.failed += 1;
                if entry.attempts + 1 >= max_attempts {
                    tracing::error!(
                        "Outbox event {} ({}) for milestone {} dead-lettered after {} attempts",
                        entry.id,
                        entry.event.0.kind(),
                        entry.milestone_id,
                        max_attempts
                    );
                    report.dead_lettered += 1;
                }
            }
        }
    }

    Ok(report)
}
