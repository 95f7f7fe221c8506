mod config;
mod db;
mod dtos;
mod error;
mod handler;
mod middleware;
mod models;
mod routes;
mod service;
mod utils;

use std::sync::Arc;

use axum::http::{header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE}, HeaderValue, Method};
use config::Config;
use db::{escrowdb::EscrowExt, DBClient};
use dotenv::dotenv;
use routes::create_router;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::filter::LevelFilter;

use service::{
    auto_release::AutoReleaseScheduler,
    escrow_service::EscrowService,
    fee_policy::PercentageFeePolicy,
    notification_service::NotificationService,
    payment_provider::{PaymentGateway, PaystackGateway},
};

#[derive(Debug, Clone)]
pub struct AppState {
    pub env: Config,
    pub db_client: Arc<DBClient>,
    // Services
    pub escrow_service: Arc<EscrowService>,
    pub auto_release: Arc<AutoReleaseScheduler>,
    pub notification_service: Arc<NotificationService>,
}

impl AppState {
    pub fn new(db_client: DBClient, config: Config, gateway: Arc<dyn PaymentGateway>) -> Self {
        let db_client = Arc::new(db_client);
        let store: Arc<dyn EscrowExt> = db_client.clone();

        let escrow_service = Arc::new(EscrowService::new(
            store.clone(),
            gateway,
            Arc::new(PercentageFeePolicy::new(config.platform_fee_bps)),
        ));
        let auto_release = Arc::new(AutoReleaseScheduler::new(
            escrow_service.clone(),
            store,
            config.auto_release_grace(),
            config.auto_release_batch_size,
        ));
        let notification_service = Arc::new(NotificationService::new(&config));

        Self {
            env: config,
            db_client,
            escrow_service,
            auto_release,
            notification_service,
        }
    }
}

#[tokio::main]
async fn main() {
    dotenv().ok();

    let level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| level.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::DEBUG);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .init();

    let config = Config::init();

    let pool = match PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .connect(&config.database_url)
            .await
    {
        Ok(pool) => {
            tracing::info!("Connection to the database is successful");
            pool
        }
        Err(err) => {
            tracing::error!("Failed to connect to the database: {:?}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = sqlx::migrate!("./migrations").run(&pool).await {
        tracing::error!("Failed to run migrations: {}", err);
        std::process::exit(1);
    }

    let db_client = match config.redis_url {
        Some(ref redis_url) => DBClient::with_redis(pool, redis_url).await,
        None => {
            tracing::info!("Redis not configured, running without cache (set REDIS_URL to enable)");
            DBClient::new(pool)
        }
    };

    let gateway: Arc<dyn PaymentGateway> = match PaystackGateway::new(&config) {
        Ok(gateway) => Arc::new(gateway),
        Err(err) => {
            tracing::error!("Failed to build payment gateway client: {}", err);
            std::process::exit(1);
        }
    };

    let allowed_origins = [
        HeaderValue::from_static("http://localhost:5173"),
        HeaderValue::from_static("http://localhost:8000"),
    ];

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_headers([AUTHORIZATION, ACCEPT, CONTENT_TYPE])
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT]);

    let app_state = Arc::new(AppState::new(db_client, config.clone(), gateway));

    let app = create_router(app_state.clone()).layer(cors);

    tracing::info!("Server is running on http://localhost:{}", config.port);
    tracing::info!("Cache status: {}", app_state.db_client.cache_status());

    // Start background jobs
    let app_state_clone = app_state.clone();
    tokio::spawn(async move {
        service::background_jobs::start_auto_release_job(app_state_clone).await;
    });

    let app_state_clone = app_state.clone();
    tokio::spawn(async move {
        service::background_jobs::start_outbox_relay_job(app_state_clone).await;
    });

    let listener = match tokio::net::TcpListener::bind(format!("0.0.0.0:{}", &config.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!("Failed to bind port {}: {}", config.port, err);
            std::process::exit(1);
        }
    };

    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", err);
    }
}
