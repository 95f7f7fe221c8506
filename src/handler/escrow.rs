use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::Path,
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post, put},
    Extension, Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dtos::escrowdtos::*,
    error::{ErrorMessage, HttpError},
    middleware::AuthActor,
    models::actormodel::Actor,
    service::payment_provider::verify_webhook_signature,
    AppState,
};

pub fn milestone_handler() -> Router {
    Router::new()
        .route("/", post(create_milestone))
        .route("/:milestone_id", get(get_milestone))
        .route("/:milestone_id/submit-plan", put(submit_milestone_plan))
        .route("/:milestone_id/approve-plan", put(approve_milestone_plan))
        .route("/:milestone_id/start", put(start_milestone))

        // Funding
        .route("/:milestone_id/escrow", get(get_escrow_for_milestone))
        .route("/:milestone_id/escrow/order", post(initiate_funding))
        .route("/:milestone_id/escrow/fund", post(fund_escrow))

        // Delivery and review
        .route("/:milestone_id/deliverable", post(submit_deliverable))
        .route("/:milestone_id/review", put(review_milestone))
}

pub fn escrow_handler() -> Router {
    Router::new()
        .route("/:escrow_id", get(get_escrow))
        .route("/:escrow_id/release", post(release_funds))
        .route("/:escrow_id/dispute", post(raise_dispute))
        .route("/:escrow_id/dispute/resolve", put(resolve_dispute))
}

pub fn admin_handler() -> Router {
    Router::new().route("/auto-release/run", post(run_auto_release))
}

pub async fn create_milestone(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<AuthActor>,
    Json(body): Json<CreateMilestoneDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let milestone = app_state
        .escrow_service
        .create_milestone(&auth.actor, body.into())
        .await?;

    Ok(Json(ApiResponse::success("Milestone created successfully", milestone)))
}

pub async fn get_milestone(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<AuthActor>,
    Path(milestone_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let milestone = app_state.escrow_service.get_milestone(milestone_id).await?;
    ensure_party(&auth.actor, milestone.client_id, milestone.freelancer_id)?;

    let escrow = app_state
        .escrow_service
        .get_escrow_for_milestone(milestone_id)
        .await?;

    Ok(Json(ApiResponse::success(
        "Milestone retrieved successfully",
        MilestoneDetailsDto { milestone, escrow },
    )))
}

pub async fn submit_milestone_plan(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<AuthActor>,
    Path(milestone_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let milestone = app_state
        .escrow_service
        .submit_milestone_plan(&auth.actor, milestone_id)
        .await?;

    Ok(Json(ApiResponse::success("Milestone plan submitted for approval", milestone)))
}

pub async fn approve_milestone_plan(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<AuthActor>,
    Path(milestone_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let milestone = app_state
        .escrow_service
        .approve_milestone_plan(&auth.actor, milestone_id)
        .await?;

    Ok(Json(ApiResponse::success("Milestone plan approved", milestone)))
}

pub async fn start_milestone(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<AuthActor>,
    Path(milestone_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let milestone = app_state
        .escrow_service
        .start_milestone(&auth.actor, milestone_id)
        .await?;

    Ok(Json(ApiResponse::success("Milestone started", milestone)))
}

pub async fn get_escrow_for_milestone(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<AuthActor>,
    Path(milestone_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let escrow = app_state
        .escrow_service
        .get_escrow_for_milestone(milestone_id)
        .await?
        .ok_or_else(|| HttpError::not_found(format!("No escrow for milestone {}", milestone_id)))?;
    ensure_party(&auth.actor, escrow.client_id, escrow.freelancer_id)?;

    Ok(Json(ApiResponse::success("Escrow retrieved successfully", escrow)))
}

pub async fn initiate_funding(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<AuthActor>,
    Path(milestone_id): Path<Uuid>,
    body: Option<Json<InitiateFundingDto>>,
) -> Result<impl IntoResponse, HttpError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let funding = app_state
        .escrow_service
        .initiate_funding(&auth.actor, milestone_id, body.customer_email)
        .await?;

    Ok(Json(ApiResponse::success("Funding order created", funding)))
}

pub async fn fund_escrow(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<AuthActor>,
    Path(milestone_id): Path<Uuid>,
    Json(body): Json<FundEscrowDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let escrow = app_state
        .escrow_service
        .fund_escrow(&auth.actor, milestone_id, body.into())
        .await?;

    Ok(Json(ApiResponse::success("Escrow funded successfully", escrow)))
}

/// Paystack callback, authenticated by `x-paystack-signature` over the raw body.
pub async fn payment_webhook(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, HttpError> {
    let signature = headers
        .get("x-paystack-signature")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| HttpError::bad_request("Missing or invalid Paystack signature"))?;

    if !verify_webhook_signature(&body, signature, &app_state.env.paystack_secret_key) {
        tracing::warn!("Invalid Paystack webhook signature received");
        return Err(HttpError::unauthorized("Invalid webhook signature"));
    }

    let event: PaymentWebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| HttpError::bad_request(format!("Invalid webhook payload: {}", e)))?;

    match event.event.as_str() {
        "charge.success" => {
            let reference = event
                .data
                .reference
                .ok_or_else(|| HttpError::bad_request("Missing payment reference"))?;
            app_state.escrow_service.record_gateway_payment(&reference).await?;
        }
        other => {
            tracing::info!("Unhandled Paystack webhook event: {}", other);
        }
    }

    Ok(Json(serde_json::json!({"status": "success"})))
}

pub async fn submit_deliverable(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<AuthActor>,
    Path(milestone_id): Path<Uuid>,
    Json(body): Json<SubmitDeliverableDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let milestone = app_state
        .escrow_service
        .submit_deliverable(&auth.actor, milestone_id, body.notes, body.attachments)
        .await?;

    Ok(Json(ApiResponse::success("Deliverable submitted for review", milestone)))
}

pub async fn review_milestone(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<AuthActor>,
    Path(milestone_id): Path<Uuid>,
    Json(body): Json<ReviewMilestoneDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let milestone = app_state
        .escrow_service
        .review_milestone(&auth.actor, milestone_id, body.approve, body.notes)
        .await?;

    let message = if body.approve {
        "Milestone approved"
    } else {
        "Milestone sent back for changes"
    };
    Ok(Json(ApiResponse::success(message, milestone)))
}

pub async fn get_escrow(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<AuthActor>,
    Path(escrow_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let escrow = app_state.escrow_service.get_escrow(escrow_id).await?;
    ensure_party(&auth.actor, escrow.client_id, escrow.freelancer_id)?;

    Ok(Json(ApiResponse::success("Escrow retrieved successfully", escrow)))
}

pub async fn release_funds(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<AuthActor>,
    Path(escrow_id): Path<Uuid>,
    body: Option<Json<ReleaseFundsDto>>,
) -> Result<impl IntoResponse, HttpError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let escrow = app_state
        .escrow_service
        .release_funds(&auth.actor, escrow_id, body.reason)
        .await?;

    Ok(Json(ApiResponse::success("Funds released to freelancer", escrow)))
}

pub async fn raise_dispute(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<AuthActor>,
    Path(escrow_id): Path<Uuid>,
    Json(body): Json<RaiseDisputeDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let escrow = app_state
        .escrow_service
        .raise_dispute(&auth.actor, escrow_id, body.reason)
        .await?;

    Ok(Json(ApiResponse::success("Dispute raised, escrow frozen", escrow)))
}

pub async fn resolve_dispute(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<AuthActor>,
    Path(escrow_id): Path<Uuid>,
    Json(body): Json<ResolveDisputeDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let escrow = app_state
        .escrow_service
        .resolve_dispute(&auth.actor, escrow_id, body.resolution, body.notes)
        .await?;

    Ok(Json(ApiResponse::success("Dispute resolved", escrow)))
}

pub async fn run_auto_release(
    Extension(app_state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpError> {
    let report = app_state.auto_release.run_auto_release_sweep().await?;

    Ok(Json(ApiResponse::success("Auto-release sweep completed", report)))
}

fn ensure_party(actor: &Actor, client_id: Uuid, freelancer_id: Uuid) -> Result<(), HttpError> {
    if actor.is_client(client_id) || actor.is_freelancer(freelancer_id) || actor.is_admin() {
        Ok(())
    } else {
        Err(HttpError::forbidden(ErrorMessage::PermissionDenied.to_string()))
    }
}
