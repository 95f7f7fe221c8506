use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::{
    models::{
        escrowmodel::{DisputeResolution, Escrow},
        milestonemodel::{Milestone, NewMilestone},
    },
    service::payment_provider::PaymentProof,
};

//Milestone DTOs
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateMilestoneDto {
    pub workspace_id: Uuid,

    pub client_id: Uuid,

    #[validate(length(min = 1, max = 200, message = "Title must be between 1 and 200 characters"))]
    pub title: String,

    #[validate(length(max = 5000, message = "Description cannot exceed 5000 characters"))]
    #[serde(default)]
    pub description: String,

    pub amount: BigDecimal,

    #[validate(length(equal = 3, message = "Currency must be a 3-letter ISO code"))]
    pub currency: String,

    pub due_date: DateTime<Utc>,

    pub payment_due_date: Option<DateTime<Utc>>,

    #[validate(length(min = 1, message = "Payout recipient cannot be empty"))]
    pub payout_recipient: Option<String>,

    #[serde(default)]
    pub submit_for_approval: bool,
}

impl From<CreateMilestoneDto> for NewMilestone {
    fn from(dto: CreateMilestoneDto) -> Self {
        NewMilestone {
            workspace_id: dto.workspace_id,
            client_id: dto.client_id,
            title: dto.title,
            description: dto.description,
            amount: dto.amount,
            currency: dto.currency,
            due_date: dto.due_date,
            payment_due_date: dto.payment_due_date,
            payout_recipient: dto.payout_recipient,
            submit_for_approval: dto.submit_for_approval,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct SubmitDeliverableDto {
    #[validate(length(min = 1, max = 5000, message = "Submission notes must be between 1 and 5000 characters"))]
    pub notes: String,

    #[serde(default)]
    pub attachments: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ReviewMilestoneDto {
    pub approve: bool,

    #[validate(length(max = 2000, message = "Review notes cannot exceed 2000 characters"))]
    pub notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MilestoneDetailsDto {
    pub milestone: Milestone,
    pub escrow: Option<Escrow>,
}

//Escrow DTOs
#[derive(Debug, Serialize, Deserialize, Validate, Default)]
pub struct InitiateFundingDto {
    #[validate(email(message = "Invalid email address"))]
    pub customer_email: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct FundEscrowDto {
    #[validate(length(min = 1, message = "Order id is required"))]
    pub order_id: String,
}

impl From<FundEscrowDto> for PaymentProof {
    fn from(dto: FundEscrowDto) -> Self {
        PaymentProof { order_id: dto.order_id }
    }
}

/// Paystack webhook envelope. Only the fields the escrow flow reads.
#[derive(Debug, Deserialize)]
pub struct PaymentWebhookEvent {
    pub event: String,
    #[serde(default)]
    pub data: PaymentWebhookData,
}

#[derive(Debug, Deserialize, Default)]
pub struct PaymentWebhookData {
    pub reference: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate, Default)]
pub struct ReleaseFundsDto {
    #[validate(length(max = 500, message = "Release reason cannot exceed 500 characters"))]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct RaiseDisputeDto {
    #[validate(length(min = 1, max = 2000, message = "Dispute reason must be between 1 and 2000 characters"))]
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ResolveDisputeDto {
    pub resolution: DisputeResolution,

    #[validate(length(max = 2000, message = "Resolution notes cannot exceed 2000 characters"))]
    pub notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(message: &str, data: T) -> Self {
        Self {
            status: "success".to_string(),
            message: message.to_string(),
            data: Some(data),
        }
    }
}
