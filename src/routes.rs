use std::sync::Arc;

use axum::{middleware, routing::{get, post}, Extension, Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{
    handler::escrow::{admin_handler, escrow_handler, milestone_handler, payment_webhook},
    middleware::{admin_only, auth},
    AppState,
};

async fn health_check(Extension(app_state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": "Server is running",
        "cache": app_state.db_client.cache_status()
    }))
}

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_route = Router::new()
        .nest(
            "/milestones",
            milestone_handler()
                .layer(middleware::from_fn(auth))
        )
        .nest(
            "/escrows",
            escrow_handler()
                .layer(middleware::from_fn(auth))
        )
        .nest(
            "/admin",
            admin_handler()
                .layer(middleware::from_fn(admin_only))
                .layer(middleware::from_fn(auth))
        )
        .route("/webhooks/payment", post(payment_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(app_state.clone()));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_route)
        .layer(Extension(app_state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use serde_json::Value;
    use sqlx::postgres::PgPoolOptions;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::{
        config::Config,
        db::{escrowdb::EscrowExt, DBClient},
        models::{
            actormodel::{Actor, ActorRole},
            escrowmodel::EscrowStatus,
        },
        service::{
            auto_release::AutoReleaseScheduler,
            notification_service::NotificationService,
            payment_provider::sign_webhook,
            test_support::{harness, new_milestone, Harness},
        },
        utils::token::create_token,
    };

    const SECRET: &str = "router-test-secret";

    fn test_config() -> Config {
        Config {
            database_url: "postgres://localhost/milestone_escrow_test".to_string(),
            jwt_secret: SECRET.to_string(),
            port: 0,
            log_level: "debug".to_string(),
            redis_url: None,
            paystack_secret_key: "sk_test".to_string(),
            paystack_base_url: "http://localhost:9".to_string(),
            gateway_timeout_secs: 1,
            platform_fee_bps: 500,
            auto_release_grace_hours: 168,
            auto_release_interval_secs: 3600,
            auto_release_batch_size: 100,
            outbox_interval_secs: 30,
            outbox_batch_size: 50,
            outbox_max_attempts: 10,
            push_broker_url: None,
        }
    }

    fn app(h: &Harness) -> Router {
        let config = test_config();
        // Never connected: the escrow service runs on the in-memory store.
        let pool = PgPoolOptions::new().connect_lazy(&config.database_url).unwrap();
        let store: Arc<dyn EscrowExt> = h.store.clone();

        let state = AppState {
            db_client: Arc::new(DBClient::new(pool)),
            escrow_service: h.service.clone(),
            auto_release: Arc::new(AutoReleaseScheduler::new(
                h.service.clone(),
                store,
                config.auto_release_grace(),
                config.auto_release_batch_size,
            )),
            notification_service: Arc::new(NotificationService::new(&config)),
            env: config,
        };
        create_router(Arc::new(state))
    }

    fn bearer(user_id: Uuid, role: ActorRole) -> String {
        format!("Bearer {}", create_token(&user_id.to_string(), role, SECRET.as_bytes(), 3600).unwrap())
    }

    async fn call(app: &Router, method: &str, uri: &str, auth: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(auth) = auth {
            request = request.header(header::AUTHORIZATION, auth);
        }
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn post_webhook(app: &Router, payload: &Value, signature: Option<String>) -> StatusCode {
        let mut request = Request::builder()
            .method("POST")
            .uri("/api/webhooks/payment")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(signature) = signature {
            request = request.header("x-paystack-signature", signature);
        }
        let request = request.body(Body::from(payload.to_string())).unwrap();
        app.clone().oneshot(request).await.unwrap().status()
    }

    fn charge_success(reference: &str) -> Value {
        serde_json::json!({
            "event": "charge.success",
            "data": { "reference": reference, "status": "success" }
        })
    }

    #[tokio::test]
    async fn health_is_public() {
        let h = harness();
        let (status, body) = call(&app(&h), "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cache"], "disabled");
    }

    #[tokio::test]
    async fn escrow_routes_require_a_token() {
        let h = harness();
        let uri = format!("/api/escrows/{}", Uuid::new_v4());
        let (status, body) = call(&app(&h), "GET", &uri, None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["status"], "fail");
    }

    #[tokio::test]
    async fn milestone_paid_through_the_api() {
        let h = harness();
        let app = app(&h);
        let (client_id, freelancer_id) = (Uuid::new_v4(), Uuid::new_v4());
        let client = bearer(client_id, ActorRole::Client);
        let freelancer = bearer(freelancer_id, ActorRole::Freelancer);

        let (status, body) = call(
            &app,
            "POST",
            "/api/milestones",
            Some(&freelancer),
            Some(serde_json::json!({
                "workspace_id": Uuid::new_v4(),
                "client_id": client_id,
                "title": "API integration",
                "description": "Wire the checkout to the payments API",
                "amount": "2000",
                "currency": "NGN",
                "due_date": "2030-01-01T00:00:00Z",
                "submit_for_approval": true
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "pending");
        let milestone_id = body["data"]["id"].as_str().unwrap().to_string();
        let base = format!("/api/milestones/{}", milestone_id);

        let (status, _) = call(&app, "PUT", &format!("{}/approve-plan", base), Some(&client), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, "POST", &format!("{}/escrow/order", base), Some(&client), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["escrow"]["status"], "pending");
        let order_id = body["data"]["order"]["order_id"].as_str().unwrap().to_string();
        let escrow_id = body["data"]["escrow"]["id"].as_str().unwrap().to_string();

        let payload = charge_success(&order_id);
        let signature = sign_webhook(payload.to_string().as_bytes(), "sk_test").unwrap();
        let status = post_webhook(&app, &payload, Some(signature)).await;
        assert_eq!(status, StatusCode::OK);

        let escrow_uri = format!("/api/escrows/{}", escrow_id);
        let (status, body) = call(&app, "GET", &escrow_uri, Some(&client), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "active");

        let (status, _) = call(&app, "PUT", &format!("{}/start", base), Some(&freelancer), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &app,
            "POST",
            &format!("{}/deliverable", base),
            Some(&freelancer),
            Some(serde_json::json!({ "notes": "Integration live on staging", "attachments": ["https://files/pr-42"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "review");

        let (status, _) = call(
            &app,
            "PUT",
            &format!("{}/review", base),
            Some(&client),
            Some(serde_json::json!({ "approve": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let release = format!("/api/escrows/{}/release", escrow_id);
        let (status, _) = call(&app, "POST", &release, Some(&freelancer), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(&app, "POST", &release, Some(&client), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "released");

        let (status, _) = call(&app, "POST", &release, Some(&client), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(h.gateway.transfer_count(), 1);

        let (status, body) = call(&app, "GET", &base, Some(&freelancer), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["milestone"]["status"], "paid");

        let stranger = bearer(Uuid::new_v4(), ActorRole::Client);
        let (status, _) = call(&app, "GET", &base, Some(&stranger), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn webhook_requires_gateway_signature() {
        let h = harness();
        let app = app(&h);
        let (client_id, freelancer_id) = (Uuid::new_v4(), Uuid::new_v4());
        let milestone = h
            .service
            .create_milestone(&Actor::Freelancer(freelancer_id), new_milestone(client_id))
            .await
            .unwrap();
        let client = Actor::Client(client_id);
        h.service.approve_milestone_plan(&client, milestone.id).await.unwrap();
        let funding = h.service.initiate_funding(&client, milestone.id, None).await.unwrap();
        let payload = charge_success(&funding.order.order_id);

        assert_eq!(post_webhook(&app, &payload, None).await, StatusCode::BAD_REQUEST);
        let forged = sign_webhook(payload.to_string().as_bytes(), "sk_live").unwrap();
        assert_eq!(post_webhook(&app, &payload, Some(forged)).await, StatusCode::UNAUTHORIZED);
        assert_eq!(
            h.service.get_escrow(funding.escrow.id).await.unwrap().status,
            EscrowStatus::Pending
        );

        let transfer_event = serde_json::json!({ "event": "transfer.success", "data": {} });
        let signature = sign_webhook(transfer_event.to_string().as_bytes(), "sk_test").unwrap();
        assert_eq!(post_webhook(&app, &transfer_event, Some(signature)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn empty_dispute_reason_is_a_bad_request() {
        let h = harness();
        let uri = format!("/api/escrows/{}/dispute", Uuid::new_v4());
        let client = bearer(Uuid::new_v4(), ActorRole::Client);

        let (status, _) = call(&app(&h), "POST", &uri, Some(&client), Some(serde_json::json!({ "reason": "" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sweep_endpoint_is_admin_only() {
        let h = harness();
        let app = app(&h);

        let client = bearer(Uuid::new_v4(), ActorRole::Client);
        let (status, _) = call(&app, "POST", "/api/admin/auto-release/run", Some(&client), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let admin = bearer(Uuid::new_v4(), ActorRole::Admin);
        let (status, body) = call(&app, "POST", "/api/admin/auto-release/run", Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["released_count"], 0);
    }
}
