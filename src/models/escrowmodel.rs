use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::milestonemodel::{Milestone, MilestoneStatus};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "escrow_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Pending,
    Active,
    Disputed,
    Released,
    Refunded,
}

impl EscrowStatus {
    pub fn to_str(&self) -> &str {
        match self {
            EscrowStatus::Pending => "pending",
            EscrowStatus::Active => "active",
            EscrowStatus::Disputed => "disputed",
            EscrowStatus::Released => "released",
            EscrowStatus::Refunded => "refunded",
        }
    }

    /// Funds have left custody; nothing may mutate the escrow afterwards.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EscrowStatus::Released | EscrowStatus::Refunded)
    }
}

impl std::fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "client_approval_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ClientApprovalStatus {
    None,
    Approved,
    Rejected,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisputeResolution {
    ReleaseToFreelancer,
    RefundToClient,
    /// Percentage of the freelancer's share paid out; the rest of the
    /// milestone amount goes back to the client.
    Partial { freelancer_percent: u8 },
}

impl DisputeResolution {
    pub fn label(&self) -> String {
        match self {
            DisputeResolution::ReleaseToFreelancer => "release_to_freelancer".to_string(),
            DisputeResolution::RefundToClient => "refund_to_client".to_string(),
            DisputeResolution::Partial { freelancer_percent } => {
                format!("partial:{}", freelancer_percent)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct Escrow {
    pub id: Uuid,
    pub milestone_id: Uuid,
    pub client_id: Uuid,
    pub freelancer_id: Uuid,
    pub currency: String,
    pub milestone_amount: BigDecimal,
    pub service_charge: BigDecimal,
    pub total_amount: BigDecimal,
    pub amount_to_freelancer: BigDecimal,
    pub status: EscrowStatus,
    pub order_id: Option<String>,
    pub payment_reference: Option<String>,
    pub deliverable_submitted: bool,
    pub deliverable_submitted_at: Option<DateTime<Utc>>,
    pub client_approval_status: ClientApprovalStatus,
    pub dispute_raised: bool,
    pub dispute_reason: Option<String>,
    pub dispute_resolution: Option<String>,
    pub resolution_notes: Option<String>,
    pub release_reason: Option<String>,
    pub released_by: Option<String>,
    pub transfer_id: Option<String>,
    pub refund_id: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

/// Fee split produced by the platform fee rule for one milestone amount.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeeQuote {
    pub service_charge: BigDecimal,
    pub total_amount: BigDecimal,
    pub amount_to_freelancer: BigDecimal,
}

impl Escrow {
    pub fn pending_for(milestone: &Milestone, quote: FeeQuote, order_id: String, now: DateTime<Utc>) -> Self {
        Escrow {
            id: Uuid::new_v4(),
            milestone_id: milestone.id,
            client_id: milestone.client_id,
            freelancer_id: milestone.freelancer_id,
            currency: milestone.currency.clone(),
            milestone_amount: milestone.amount.clone(),
            service_charge: quote.service_charge,
            total_amount: quote.total_amount,
            amount_to_freelancer: quote.amount_to_freelancer,
            status: EscrowStatus::Pending,
            order_id: Some(order_id),
            payment_reference: None,
            deliverable_submitted: false,
            deliverable_submitted_at: None,
            client_approval_status: ClientApprovalStatus::None,
            dispute_raised: false,
            dispute_reason: None,
            dispute_resolution: None,
            resolution_notes: None,
            release_reason: None,
            released_by: None,
            transfer_id: None,
            refund_id: None,
            version: 0,
            created_at: now,
            activated_at: None,
            released_at: None,
            refunded_at: None,
        }
    }

    /// Whether the auto-release sweep may pay this escrow out at `now`.
    pub fn auto_release_due(
        &self,
        milestone: &Milestone,
        grace: chrono::Duration,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status != EscrowStatus::Active || self.dispute_raised {
            return false;
        }

        let grace_elapsed = self.deliverable_submitted
            && self
                .deliverable_submitted_at
                .map(|at| now.signed_duration_since(at) >= grace)
                .unwrap_or(false);

        let payment_due = milestone.payment_due(now)
            && self.client_approval_status != ClientApprovalStatus::Rejected;

        grace_elapsed || payment_due
    }
}

/// Domain events appended to the outbox by successful transitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscrowEvent {
    MilestoneCreated {
        milestone_id: Uuid,
        client_id: Uuid,
        freelancer_id: Uuid,
        status: MilestoneStatus,
    },
    MilestoneStatusChanged {
        milestone_id: Uuid,
        from: MilestoneStatus,
        to: MilestoneStatus,
        actor: String,
    },
    FundingRequested {
        escrow_id: Uuid,
        milestone_id: Uuid,
        order_id: String,
        total_amount: BigDecimal,
    },
    EscrowFunded {
        escrow_id: Uuid,
        milestone_id: Uuid,
        total_amount: BigDecimal,
    },
    DeliverableSubmitted {
        escrow_id: Uuid,
        milestone_id: Uuid,
        freelancer_id: Uuid,
    },
    MilestoneReviewed {
        escrow_id: Uuid,
        milestone_id: Uuid,
        approved: bool,
        notes: Option<String>,
    },
    FundsReleased {
        escrow_id: Uuid,
        milestone_id: Uuid,
        freelancer_id: Uuid,
        amount: BigDecimal,
        transfer_id: String,
        actor: String,
    },
    DisputeRaised {
        escrow_id: Uuid,
        milestone_id: Uuid,
        reason: String,
        actor: String,
    },
    DisputeResolved {
        escrow_id: Uuid,
        milestone_id: Uuid,
        resolution: DisputeResolution,
        actor: String,
    },
    EscrowRefunded {
        escrow_id: Uuid,
        milestone_id: Uuid,
        client_id: Uuid,
        amount: BigDecimal,
        refund_id: String,
    },
    PaymentOverdue {
        milestone_id: Uuid,
        client_id: Uuid,
    },
}

impl EscrowEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EscrowEvent::MilestoneCreated { .. } => "milestone_created",
            EscrowEvent::MilestoneStatusChanged { .. } => "milestone_status_changed",
            EscrowEvent::FundingRequested { .. } => "funding_requested",
            EscrowEvent::EscrowFunded { .. } => "escrow_funded",
            EscrowEvent::DeliverableSubmitted { .. } => "deliverable_submitted",
            EscrowEvent::MilestoneReviewed { .. } => "milestone_reviewed",
            EscrowEvent::FundsReleased { .. } => "funds_released",
            EscrowEvent::DisputeRaised { .. } => "dispute_raised",
            EscrowEvent::DisputeResolved { .. } => "dispute_resolved",
            EscrowEvent::EscrowRefunded { .. } => "escrow_refunded",
            EscrowEvent::PaymentOverdue { .. } => "payment_overdue",
        }
    }

    /// Milestone the event belongs to; outbox rows are keyed by it.
    pub fn milestone_id(&self) -> Uuid {
        match self {
            EscrowEvent::MilestoneCreated { milestone_id, .. }
            | EscrowEvent::MilestoneStatusChanged { milestone_id, .. }
            | EscrowEvent::FundingRequested { milestone_id, .. }
            | EscrowEvent::EscrowFunded { milestone_id, .. }
            | EscrowEvent::DeliverableSubmitted { milestone_id, .. }
            | EscrowEvent::MilestoneReviewed { milestone_id, .. }
            | EscrowEvent::FundsReleased { milestone_id, .. }
            | EscrowEvent::DisputeRaised { milestone_id, .. }
            | EscrowEvent::DisputeResolved { milestone_id, .. }
            | EscrowEvent::EscrowRefunded { milestone_id, .. }
            | EscrowEvent::PaymentOverdue { milestone_id, .. } => *milestone_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub milestone_id: Uuid,
    pub event: sqlx::types::Json<EscrowEvent>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}
