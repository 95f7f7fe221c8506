// db/escrowdb.rs
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{types::Json, Error, Postgres, Transaction};
use uuid::Uuid;

use super::{
    cache::{CacheHelper, ESCROW_CACHE_TTL, MILESTONE_CACHE_TTL},
    DBClient,
};
use crate::models::{
    escrowmodel::{Escrow, EscrowEvent, OutboxEntry},
    milestonemodel::Milestone,
};

/// One atomic write over a (Milestone, Escrow) pair. Both rows are
/// updated only if they still match `before_*` (status and version).
pub struct TransitionWrite<'a> {
    pub before_milestone: &'a Milestone,
    pub before_escrow: &'a Escrow,
    pub milestone: &'a Milestone,
    pub escrow: &'a Escrow,
    pub events: &'a [EscrowEvent],
}

#[async_trait]
pub trait EscrowExt: Send + Sync {
    async fn insert_milestone(&self, milestone: &Milestone, events: &[EscrowEvent]) -> Result<(), Error>;

    async fn get_milestone(&self, milestone_id: Uuid) -> Result<Option<Milestone>, Error>;

    /// Compare-and-swap a milestone-only change. Returns `false` when the
    /// stored row no longer matches `before`.
    async fn commit_milestone(
        &self,
        before: &Milestone,
        milestone: &Milestone,
        events: &[EscrowEvent],
    ) -> Result<bool, Error>;

    /// Insert a new escrow. Returns `false` when the milestone already has one.
    async fn insert_escrow(&self, escrow: &Escrow, events: &[EscrowEvent]) -> Result<bool, Error>;

    async fn get_escrow(&self, escrow_id: Uuid) -> Result<Option<Escrow>, Error>;

    async fn get_escrow_by_milestone(&self, milestone_id: Uuid) -> Result<Option<Escrow>, Error>;

    /// Read both rows straight from the primary store, skipping the cache.
    /// Transitions plan from this so a stale cached row can't drive a payout.
    async fn load_pair(&self, milestone_id: Uuid) -> Result<(Option<Milestone>, Option<Escrow>), Error>;

    async fn get_escrow_by_order(&self, order_id: &str) -> Result<Option<Escrow>, Error>;

    async fn commit_transition(&self, write: &TransitionWrite<'_>) -> Result<bool, Error>;

    async fn find_auto_release_candidates(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
        limit: i64,
    ) -> Result<Vec<Escrow>, Error>;

    async fn find_overdue_milestones(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Milestone>, Error>;

    /// Undelivered entries in commit order. Rows that already failed
    /// `max_attempts` times are dead-lettered and left out.
    async fn pending_outbox(&self, limit: i64, max_attempts: i32) -> Result<Vec<OutboxEntry>, Error>;

    async fn mark_outbox_delivered(&self, entry_id: Uuid) -> Result<(), Error>;

    async fn record_outbox_failure(&self, entry_id: Uuid) -> Result<(), Error>;
}

const MILESTONE_COLUMNS: &str = r#"
    id, workspace_id, client_id, freelancer_id, title, description, amount, currency,
    due_date, payment_due_date, status, payout_recipient, submission_notes,
    submission_attachments, submission_date, review_notes, review_date, version,
    created_at, updated_at
"#;

const ESCROW_COLUMNS: &str = r#"
    id, milestone_id, client_id, freelancer_id, currency, milestone_amount, service_charge,
    total_amount, amount_to_freelancer, status, order_id, payment_reference,
    deliverable_submitted, deliverable_submitted_at, client_approval_status,
    dispute_raised, dispute_reason, dispute_resolution, resolution_notes, release_reason,
    released_by, transfer_id, refund_id, version, created_at, activated_at, released_at,
    refunded_at
"#;

async fn append_events(
    tx: &mut Transaction<'_, Postgres>,
    events: &[EscrowEvent],
) -> Result<(), Error> {
    for event in events {
        sqlx::query(
            r#"
            INSERT INTO escrow_outbox (id, milestone_id, event, attempts, created_at)
            VALUES ($1, $2, $3, 0, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.milestone_id())
        .bind(Json(event))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn update_milestone_cas(
    tx: &mut Transaction<'_, Postgres>,
    before: &Milestone,
    milestone: &Milestone,
) -> Result<bool, Error> {
    let result = sqlx::query(
        r#"
        UPDATE milestones
        SET status = $2,
            submission_notes = $3,
            submission_attachments = $4,
            submission_date = $5,
            review_notes = $6,
            review_date = $7,
            version = $8,
            updated_at = $9
        WHERE id = $1 AND status = $10 AND version = $11
        "#,
    )
    .bind(milestone.id)
    .bind(milestone.status)
    .bind(&milestone.submission_notes)
    .bind(&milestone.submission_attachments)
    .bind(milestone.submission_date)
    .bind(&milestone.review_notes)
    .bind(milestone.review_date)
    .bind(milestone.version)
    .bind(milestone.updated_at)
    .bind(before.status)
    .bind(before.version)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

async fn update_escrow_cas(
    tx: &mut Transaction<'_, Postgres>,
    before: &Escrow,
    escrow: &Escrow,
) -> Result<bool, Error> {
    let result = sqlx::query(
        r#"
        UPDATE escrows
        SET status = $2,
            order_id = $3,
            payment_reference = $4,
            deliverable_submitted = $5,
            deliverable_submitted_at = $6,
            client_approval_status = $7,
            dispute_raised = $8,
            dispute_reason = $9,
            dispute_resolution = $10,
            resolution_notes = $11,
            release_reason = $12,
            released_by = $13,
            transfer_id = $14,
            refund_id = $15,
            version = $16,
            activated_at = $17,
            released_at = $18,
            refunded_at = $19
        WHERE id = $1 AND status = $20 AND version = $21
        "#,
    )
    .bind(escrow.id)
    .bind(escrow.status)
    .bind(&escrow.order_id)
    .bind(&escrow.payment_reference)
    .bind(escrow.deliverable_submitted)
    .bind(escrow.deliverable_submitted_at)
    .bind(escrow.client_approval_status)
    .bind(escrow.dispute_raised)
    .bind(&escrow.dispute_reason)
    .bind(&escrow.dispute_resolution)
    .bind(&escrow.resolution_notes)
    .bind(&escrow.release_reason)
    .bind(&escrow.released_by)
    .bind(&escrow.transfer_id)
    .bind(&escrow.refund_id)
    .bind(escrow.version)
    .bind(escrow.activated_at)
    .bind(escrow.released_at)
    .bind(escrow.refunded_at)
    .bind(before.status)
    .bind(before.version)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

impl DBClient {
    async fn invalidate(&self, milestone_id: Uuid, escrow_id: Option<Uuid>) {
        if let Some(redis) = &self.redis_client {
            if let Err(e) = CacheHelper::invalidate_pair(redis, milestone_id, escrow_id).await {
                tracing::warn!("Failed to invalidate cache for milestone {}: {}", milestone_id, e);
            }
        }
    }
}

#[async_trait]
impl EscrowExt for DBClient {
    async fn insert_milestone(&self, milestone: &Milestone, events: &[EscrowEvent]) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO milestones (
                id, workspace_id, client_id, freelancer_id, title, description, amount, currency,
                due_date, payment_due_date, status, payout_recipient, submission_notes,
                submission_attachments, submission_date, review_notes, review_date, version,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(milestone.id)
        .bind(milestone.workspace_id)
        .bind(milestone.client_id)
        .bind(milestone.freelancer_id)
        .bind(&milestone.title)
        .bind(&milestone.description)
        .bind(&milestone.amount)
        .bind(&milestone.currency)
        .bind(milestone.due_date)
        .bind(milestone.payment_due_date)
        .bind(milestone.status)
        .bind(&milestone.payout_recipient)
        .bind(&milestone.submission_notes)
        .bind(&milestone.submission_attachments)
        .bind(milestone.submission_date)
        .bind(&milestone.review_notes)
        .bind(milestone.review_date)
        .bind(milestone.version)
        .bind(milestone.created_at)
        .bind(milestone.updated_at)
        .execute(&mut *tx)
        .await?;

        append_events(&mut tx, events).await?;
        tx.commit().await
    }

    async fn get_milestone(&self, milestone_id: Uuid) -> Result<Option<Milestone>, Error> {
        let cache_key = CacheHelper::milestone_key(milestone_id);
        if let Some(redis) = &self.redis_client {
            if let Ok(Some(cached)) = CacheHelper::get::<Milestone>(redis, &cache_key).await {
                return Ok(Some(cached));
            }
        }

        let milestone = sqlx::query_as::<_, Milestone>(&format!(
            "SELECT {} FROM milestones WHERE id = $1",
            MILESTONE_COLUMNS
        ))
        .bind(milestone_id)
        .fetch_optional(&self.pool)
        .await?;

        if let (Some(redis), Some(milestone)) = (&self.redis_client, &milestone) {
            let _ = CacheHelper::set(redis, &cache_key, milestone, MILESTONE_CACHE_TTL).await;
        }

        Ok(milestone)
    }

    async fn commit_milestone(
        &self,
        before: &Milestone,
        milestone: &Milestone,
        events: &[EscrowEvent],
    ) -> Result<bool, Error> {
        let mut tx = self.pool.begin().await?;

        if !update_milestone_cas(&mut tx, before, milestone).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        append_events(&mut tx, events).await?;
        tx.commit().await?;

        self.invalidate(milestone.id, None).await;
        Ok(true)
    }

    async fn insert_escrow(&self, escrow: &Escrow, events: &[EscrowEvent]) -> Result<bool, Error> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO escrows (
                id, milestone_id, client_id, freelancer_id, currency, milestone_amount,
                service_charge, total_amount, amount_to_freelancer, status, order_id,
                deliverable_submitted, client_approval_status, dispute_raised, version, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (milestone_id) DO NOTHING
            "#,
        )
        .bind(escrow.id)
        .bind(escrow.milestone_id)
        .bind(escrow.client_id)
        .bind(escrow.freelancer_id)
        .bind(&escrow.currency)
        .bind(&escrow.milestone_amount)
        .bind(&escrow.service_charge)
        .bind(&escrow.total_amount)
        .bind(&escrow.amount_to_freelancer)
        .bind(escrow.status)
        .bind(&escrow.order_id)
        .bind(escrow.deliverable_submitted)
        .bind(escrow.client_approval_status)
        .bind(escrow.dispute_raised)
        .bind(escrow.version)
        .bind(escrow.created_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        append_events(&mut tx, events).await?;
        tx.commit().await?;

        self.invalidate(escrow.milestone_id, Some(escrow.id)).await;
        Ok(true)
    }

    async fn get_escrow(&self, escrow_id: Uuid) -> Result<Option<Escrow>, Error> {
        let cache_key = CacheHelper::escrow_key(escrow_id);
        if let Some(redis) = &self.redis_client {
            if let Ok(Some(cached)) = CacheHelper::get::<Escrow>(redis, &cache_key).await {
                return Ok(Some(cached));
            }
        }

        let escrow = sqlx::query_as::<_, Escrow>(&format!(
            "SELECT {} FROM escrows WHERE id = $1",
            ESCROW_COLUMNS
        ))
        .bind(escrow_id)
        .fetch_optional(&self.pool)
        .await?;

        if let (Some(redis), Some(escrow)) = (&self.redis_client, &escrow) {
            let _ = CacheHelper::set(redis, &cache_key, escrow, ESCROW_CACHE_TTL).await;
        }

        Ok(escrow)
    }

    async fn get_escrow_by_milestone(&self, milestone_id: Uuid) -> Result<Option<Escrow>, Error> {
        let cache_key = CacheHelper::escrow_by_milestone_key(milestone_id);
        if let Some(redis) = &self.redis_client {
            if let Ok(Some(cached)) = CacheHelper::get::<Escrow>(redis, &cache_key).await {
                return Ok(Some(cached));
            }
        }

        let escrow = sqlx::query_as::<_, Escrow>(&format!(
            "SELECT {} FROM escrows WHERE milestone_id = $1",
            ESCROW_COLUMNS
        ))
        .bind(milestone_id)
        .fetch_optional(&self.pool)
        .await?;

        if let (Some(redis), Some(escrow)) = (&self.redis_client, &escrow) {
            let _ = CacheHelper::set(redis, &cache_key, escrow, ESCROW_CACHE_TTL).await;
        }

        Ok(escrow)
    }

    async fn load_pair(&self, milestone_id: Uuid) -> Result<(Option<Milestone>, Option<Escrow>), Error> {
        let milestone = sqlx::query_as::<_, Milestone>(&format!(
            "SELECT {} FROM milestones WHERE id = $1",
            MILESTONE_COLUMNS
        ))
        .bind(milestone_id)
        .fetch_optional(&self.pool)
        .await?;

        let escrow = sqlx::query_as::<_, Escrow>(&format!(
            "SELECT {} FROM escrows WHERE milestone_id = $1",
            ESCROW_COLUMNS
        ))
        .bind(milestone_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok((milestone, escrow))
    }

    async fn get_escrow_by_order(&self, order_id: &str) -> Result<Option<Escrow>, Error> {
        sqlx::query_as::<_, Escrow>(&format!(
            "SELECT {} FROM escrows WHERE order_id = $1",
            ESCROW_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn commit_transition(&self, write: &TransitionWrite<'_>) -> Result<bool, Error> {
        let mut tx = self.pool.begin().await?;

        // Escrow first: it carries the status the money invariants hang on.
        if !update_escrow_cas(&mut tx, write.before_escrow, write.escrow).await?
            || !update_milestone_cas(&mut tx, write.before_milestone, write.milestone).await?
        {
            tx.rollback().await?;
            return Ok(false);
        }

        append_events(&mut tx, write.events).await?;
        tx.commit().await?;

        self.invalidate(write.milestone.id, Some(write.escrow.id)).await;
        Ok(true)
    }

    async fn find_auto_release_candidates(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
        limit: i64,
    ) -> Result<Vec<Escrow>, Error> {
        let columns = ESCROW_COLUMNS
            .split(',')
            .map(|column| format!("e.{}", column.trim()))
            .collect::<Vec<_>>()
            .join(", ");

        sqlx::query_as::<_, Escrow>(&format!(
            r#"
            SELECT {}
            FROM escrows e
            JOIN milestones m ON m.id = e.milestone_id
            WHERE e.status = 'active'::escrow_status
            AND e.dispute_raised = FALSE
            AND (
                (e.deliverable_submitted AND e.deliverable_submitted_at <= $2)
                OR (
                    m.payment_due_date IS NOT NULL
                    AND m.payment_due_date <= $1
                    AND e.client_approval_status <> 'rejected'::client_approval_status
                )
            )
            ORDER BY e.activated_at ASC
            LIMIT $3
            "#,
            columns
        ))
        .bind(now)
        .bind(now - grace)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn find_overdue_milestones(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Milestone>, Error> {
        let columns = MILESTONE_COLUMNS
            .split(',')
            .map(|column| format!("m.{}", column.trim()))
            .collect::<Vec<_>>()
            .join(", ");

        sqlx::query_as::<_, Milestone>(&format!(
            r#"
            SELECT {}
            FROM milestones m
            LEFT JOIN escrows e ON e.milestone_id = m.id
            WHERE m.status IN ('approved'::milestone_status, 'in_progress'::milestone_status)
            AND m.payment_due_date IS NOT NULL
            AND m.payment_due_date <= $1
            AND (e.id IS NULL OR e.status = 'pending'::escrow_status)
            ORDER BY m.payment_due_date ASC
            LIMIT $2
            "#,
            columns
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn pending_outbox(&self, limit: i64, max_attempts: i32) -> Result<Vec<OutboxEntry>, Error> {
        sqlx::query_as::<_, OutboxEntry>(
            r#"
            SELECT id, milestone_id, event, attempts, created_at, delivered_at
            FROM escrow_outbox
            WHERE delivered_at IS NULL
            AND attempts < $2
            ORDER BY seq ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .bind(max_attempts)
        .fetch_all(&self.pool)
        .await
    }

    async fn mark_outbox_delivered(&self, entry_id: Uuid) -> Result<(), Error> {
        sqlx::query("UPDATE escrow_outbox SET delivered_at = NOW() WHERE id = $1")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_outbox_failure(&self, entry_id: Uuid) -> Result<(), Error> {
        sqlx::query("UPDATE escrow_outbox SET attempts = attempts + 1 WHERE id = $1")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
