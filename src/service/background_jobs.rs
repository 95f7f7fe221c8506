// service/background_jobs.rs
use std::sync::Arc;
use chrono::Utc;
use tokio::time::{interval, Duration};

use crate::{
    db::escrowdb::EscrowExt,
    service::notification_service::relay_outbox,
    AppState,
};

/// Release escrows whose review window has lapsed and flag overdue funding.
pub async fn start_auto_release_job(app_state: Arc<AppState>) {
    let mut interval = interval(Duration::from_secs(app_state.env.auto_release_interval_secs));

    loop {
        interval.tick().await;

        tracing::info!("Running auto-release job at {}", Utc::now());

        match app_state.auto_release.run_auto_release_sweep().await {
            Ok(report) => tracing::info!(
                "Auto-release job completed: {} released, {} skipped, {} overdue",
                report.released_count,
                report.skipped.len(),
                report.overdue_marked
            ),
            Err(e) => tracing::error!("Auto-release job failed: {}", e),
        }
    }
}

/// Push committed escrow events to the notification broker.
pub async fn start_outbox_relay_job(app_state: Arc<AppState>) {
    let mut interval = interval(Duration::from_secs(app_state.env.outbox_interval_secs));
    let store: Arc<dyn EscrowExt> = app_state.db_client.clone();

    loop {
        interval.tick().await;

        let relayed = relay_outbox(
            &store,
            app_state.notification_service.as_ref(),
            app_state.env.outbox_batch_size,
            app_state.env.outbox_max_attempts,
        )
        .await;

        match relayed {
            Ok(report) if report.delivered > 0 || report.failed > 0 => tracing::info!(
                "Outbox relay: {} delivered, {} failed",
                report.delivered,
                report.failed
            ),
            Ok(_) => {}
            Err(e) => tracing::error!("Outbox relay failed: {}", e),
        }
    }
}
