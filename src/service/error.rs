use axum::http::StatusCode;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    error::HttpError,
    models::{escrowmodel::Escrow, milestonemodel::Milestone},
    service::payment_provider::GatewayError,
};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Milestone {0} not found")]
    MilestoneNotFound(Uuid),

    #[error("Escrow {0} not found")]
    EscrowNotFound(Uuid),

    #[error("Cannot {action}: {current}")]
    InvalidTransition { action: &'static str, current: String },

    #[error("{actor} is not authorized to {action}")]
    Unauthorized { actor: String, action: &'static str },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Milestone {0} was modified concurrently, refetch and retry")]
    ConcurrentModification(Uuid),

    #[error("Notification delivery failed: {0}")]
    Notification(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ServiceError {
    /// Rejection carrying the pair's current state back to the caller.
    pub fn invalid(action: &'static str, milestone: &Milestone, escrow: Option<&Escrow>) -> Self {
        let current = match escrow {
            Some(escrow) => format!(
                "milestone is {} and escrow is {}",
                milestone.status, escrow.status
            ),
            None => format!("milestone is {} and has no escrow", milestone.status),
        };

        ServiceError::InvalidTransition { action, current }
    }

    pub fn unauthorized(actor: impl std::fmt::Display, action: &'static str) -> Self {
        ServiceError::Unauthorized {
            actor: actor.to_string(),
            action,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::MilestoneNotFound(_) | ServiceError::EscrowNotFound(_) => {
                StatusCode::NOT_FOUND
            }

            ServiceError::InvalidTransition { .. } | ServiceError::ConcurrentModification(_) => {
                StatusCode::CONFLICT
            }

            // Authenticated but not allowed; 401 is left to the auth middleware.
            ServiceError::Unauthorized { .. } => StatusCode::FORBIDDEN,

            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,

            ServiceError::TransferFailed(_) | ServiceError::Gateway(_) => StatusCode::BAD_GATEWAY,

            ServiceError::Notification(_) | ServiceError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<GatewayError> for ServiceError {
    fn from(error: GatewayError) -> Self {
        match error {
            GatewayError::TransferFailed(message) => ServiceError::TransferFailed(message),
            other => ServiceError::Gateway(other.to_string()),
        }
    }
}

impl From<ServiceError> for HttpError {
    fn from(error: ServiceError) -> Self {
        let status = error.status_code();
        match error {
            // Driver details stay in the logs.
            ServiceError::Database(ref e) => {
                tracing::error!("Database error: {}", e);
                HttpError::server_error(crate::error::ErrorMessage::ServerError.to_string())
            }
            _ => HttpError::new(error.to_string(), status),
        }
    }
}
