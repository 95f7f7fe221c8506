// service/auto_release.rs
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    db::escrowdb::EscrowExt,
    service::{error::ServiceError, escrow_service::EscrowService},
};

#[derive(Debug, Clone, Serialize, Default)]
pub struct SweepReport {
    pub released_count: usize,
    pub skipped: Vec<SkippedEscrow>,
    pub overdue_marked: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedEscrow {
    pub escrow_id: Uuid,
    pub error: String,
}

/// Periodic pass that releases escrows whose review window has lapsed and
/// flags milestones whose funding is overdue.
pub struct AutoReleaseScheduler {
    escrow_service: Arc<EscrowService>,
    store: Arc<dyn EscrowExt>,
    grace: Duration,
    batch_size: i64,
}

impl std::fmt::Debug for AutoReleaseScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoReleaseScheduler")
            .field("grace", &self.grace)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl AutoReleaseScheduler {
    pub fn new(
        escrow_service: Arc<EscrowService>,
        store: Arc<dyn EscrowExt>,
        grace: Duration,
        batch_size: i64,
    ) -> Self {
        Self {
            escrow_service,
            store,
            grace,
            batch_size,
        }
    }

    pub async fn run_auto_release_sweep(&self) -> Result<SweepReport, ServiceError> {
        self.run_auto_release_sweep_at(Utc::now()).await
    }

    pub async fn run_auto_release_sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, ServiceError> {
        let mut report = SweepReport::default();

        let candidates = self
            .store
            .find_auto_release_candidates(now, self.grace, self.batch_size)
            .await?;
        for escrow in candidates {
            match self.escrow_service.auto_release(escrow.id, self.grace, now).await {
                Ok(_) => report.released_count += 1,
                Err(e) => {
                    tracing::warn!("Auto-release skipped escrow {}: {}", escrow.id, e);
                    report.skipped.push(SkippedEscrow {
                        escrow_id: escrow.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        let overdue = self.store.find_overdue_milestones(now, self.batch_size).await?;
        for milestone in overdue {
            match self.escrow_service.mark_payment_overdue(milestone.id, now).await {
                Ok(_) => report.overdue_marked += 1,
                Err(e) => tracing::warn!("Could not flag milestone {} as overdue: {}", milestone.id, e),
            }
        }

        if report.released_count > 0 || !report.skipped.is_empty() || report.overdue_marked > 0 {
            tracing::info!(
                "Auto-release sweep: {} released, {} skipped, {} marked overdue",
                report.released_count,
                report.skipped.len(),
                report.overdue_marked
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{
            actormodel::Actor,
            escrowmodel::{EscrowEvent, EscrowStatus},
            milestonemodel::MilestoneStatus,
        },
        service::test_support::{approved_escrow, escrow, harness, milestone, submitted_at, Harness},
    };

    fn scheduler(h: &Harness) -> AutoReleaseScheduler {
        AutoReleaseScheduler::new(h.service.clone(), h.store.clone(), Duration::hours(168), 50)
    }

    fn seed_submitted(h: &Harness, days_ago: i64) -> Uuid {
        let m = milestone(MilestoneStatus::Review);
        let mut e = escrow(&m, EscrowStatus::Active);
        submitted_at(&mut e, Utc::now() - Duration::days(days_ago));
        let id = e.id;
        h.store.put_milestone(m);
        h.store.put_escrow(e);
        id
    }

    #[tokio::test]
    async fn releases_only_lapsed_escrows() {
        let h = harness();
        let lapsed = seed_submitted(&h, 8);
        let fresh = seed_submitted(&h, 2);

        let report = scheduler(&h).run_auto_release_sweep().await.unwrap();
        assert_eq!(report.released_count, 1);
        assert!(report.skipped.is_empty());

        assert_eq!(h.store.get_escrow(lapsed).await.unwrap().unwrap().status, EscrowStatus::Released);
        assert_eq!(h.store.get_escrow(fresh).await.unwrap().unwrap().status, EscrowStatus::Active);
    }

    #[tokio::test]
    async fn repeated_sweeps_pay_once() {
        let h = harness();
        seed_submitted(&h, 10);
        let scheduler = scheduler(&h);

        let first = scheduler.run_auto_release_sweep().await.unwrap();
        let second = scheduler.run_auto_release_sweep().await.unwrap();
        assert_eq!(first.released_count, 1);
        assert_eq!(second.released_count, 0);
        assert_eq!(h.gateway.transfer_count(), 1);
    }

    #[tokio::test]
    async fn disputed_escrows_are_left_alone() {
        let h = harness();
        let m = milestone(MilestoneStatus::Review);
        let mut e = approved_escrow(&m);
        submitted_at(&mut e, Utc::now() - Duration::days(30));
        e.status = EscrowStatus::Disputed;
        e.dispute_raised = true;
        h.store.put_milestone(m);
        h.store.put_escrow(e);

        let report = scheduler(&h).run_auto_release_sweep().await.unwrap();
        assert_eq!(report.released_count, 0);
        assert_eq!(h.gateway.transfer_count(), 0);
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_sweep() {
        let h = harness();
        let broken = seed_submitted(&h, 9);
        let healthy = seed_submitted(&h, 9);
        h.gateway.failing_escrows.lock().unwrap().push(broken);

        let report = scheduler(&h).run_auto_release_sweep().await.unwrap();
        assert_eq!(report.released_count, 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].escrow_id, broken);

        assert_eq!(h.store.get_escrow(broken).await.unwrap().unwrap().status, EscrowStatus::Active);
        assert_eq!(h.store.get_escrow(healthy).await.unwrap().unwrap().status, EscrowStatus::Released);
    }

    #[tokio::test]
    async fn unfunded_milestones_past_due_are_flagged() {
        let h = harness();
        let mut m = milestone(MilestoneStatus::Approved);
        m.payment_due_date = Some(Utc::now() - Duration::days(1));
        let id = m.id;
        let client_id = m.client_id;
        h.store.put_milestone(m);

        let report = scheduler(&h).run_auto_release_sweep().await.unwrap();
        assert_eq!(report.overdue_marked, 1);
        assert_eq!(
            h.store.get_milestone(id).await.unwrap().unwrap().status,
            MilestoneStatus::PaymentOverdue
        );
        assert!(h
            .store
            .events()
            .iter()
            .any(|e| matches!(e, EscrowEvent::PaymentOverdue { client_id: c, .. } if *c == client_id)));

        let again = scheduler(&h).run_auto_release_sweep().await.unwrap();
        assert_eq!(again.overdue_marked, 0);

        // Funding late brings the milestone back into progress.
        let mut pending = escrow(&h.store.get_milestone(id).await.unwrap().unwrap(), EscrowStatus::Pending);
        pending.client_id = client_id;
        h.store.put_escrow(pending.clone());
        let proof = crate::service::payment_provider::PaymentProof {
            order_id: "ord_1".to_string(),
        };
        h.service.fund_escrow(&Actor::Client(client_id), id, proof).await.unwrap();
        assert_eq!(
            h.store.get_milestone(id).await.unwrap().unwrap().status,
            MilestoneStatus::InProgress
        );
    }
}
