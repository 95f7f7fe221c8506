use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "milestone_status", rename_all = "snake_case")]
#[serde(rename_all = "kebab-case")]
pub enum MilestoneStatus {
    Draft,
    Pending,
    Approved,
    InProgress,
    Review,
    Rejected,
    Completed,
    Paid,
    PaymentOverdue,
}

impl MilestoneStatus {
    pub fn to_str(&self) -> &str {
        match self {
            MilestoneStatus::Draft => "draft",
            MilestoneStatus::Pending => "pending",
            MilestoneStatus::Approved => "approved",
            MilestoneStatus::InProgress => "in-progress",
            MilestoneStatus::Review => "review",
            MilestoneStatus::Rejected => "rejected",
            MilestoneStatus::Completed => "completed",
            MilestoneStatus::Paid => "paid",
            MilestoneStatus::PaymentOverdue => "payment-overdue",
        }
    }

    /// A milestone in one of these states accepts a deliverable submission.
    pub fn accepts_submission(&self) -> bool {
        matches!(
            self,
            MilestoneStatus::InProgress | MilestoneStatus::Approved | MilestoneStatus::Rejected
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MilestoneStatus::Paid)
    }
}

impl std::fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct Milestone {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub client_id: Uuid,
    pub freelancer_id: Uuid,
    pub title: String,
    pub description: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub due_date: DateTime<Utc>,
    pub payment_due_date: Option<DateTime<Utc>>,
    pub status: MilestoneStatus,
    /// Gateway-side transfer recipient for the freelancer's payout.
    pub payout_recipient: Option<String>,
    pub submission_notes: Option<String>,
    pub submission_attachments: Vec<String>,
    pub submission_date: Option<DateTime<Utc>>,
    pub review_notes: Option<String>,
    pub review_date: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied by the freelancer when a milestone is proposed.
#[derive(Debug, Clone)]
pub struct NewMilestone {
    pub workspace_id: Uuid,
    pub client_id: Uuid,
    pub title: String,
    pub description: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub due_date: DateTime<Utc>,
    pub payment_due_date: Option<DateTime<Utc>>,
    pub payout_recipient: Option<String>,
    pub submit_for_approval: bool,
}

impl Milestone {
    pub fn from_new(freelancer_id: Uuid, new: NewMilestone, now: DateTime<Utc>) -> Self {
        let status = if new.submit_for_approval {
            MilestoneStatus::Pending
        } else {
            MilestoneStatus::Draft
        };

        Milestone {
            id: Uuid::new_v4(),
            workspace_id: new.workspace_id,
            client_id: new.client_id,
            freelancer_id,
            title: new.title,
            description: new.description,
            amount: new.amount,
            currency: new.currency.to_uppercase(),
            due_date: new.due_date,
            payment_due_date: new.payment_due_date,
            status,
            payout_recipient: new.payout_recipient,
            submission_notes: None,
            submission_attachments: Vec::new(),
            submission_date: None,
            review_notes: None,
            review_date: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn payment_due(&self, now: DateTime<Utc>) -> bool {
        self.payment_due_date.map(|due| due <= now).unwrap_or(false)
    }
}
