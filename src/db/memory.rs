// db/memory.rs
//! In-process `EscrowExt` used by the service tests. Mirrors the Postgres
//! semantics: one lock per write, CAS on (status, version), events appended
//! in the same critical section as the rows they describe.
use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{types::Json, Error};
use uuid::Uuid;

use super::escrowdb::{EscrowExt, TransitionWrite};
use crate::models::{
    escrowmodel::{Escrow, EscrowEvent, EscrowStatus, OutboxEntry},
    milestonemodel::{Milestone, MilestoneStatus},
};

#[derive(Default)]
struct MemoryState {
    milestones: HashMap<Uuid, Milestone>,
    escrows: HashMap<Uuid, Escrow>,
    outbox: Vec<OutboxEntry>,
    // Stand-in for the Redis read cache, keyed by milestone id.
    cached: HashMap<Uuid, Escrow>,
}

impl MemoryState {
    fn append(&mut self, events: &[EscrowEvent]) {
        for event in events {
            self.outbox.push(OutboxEntry {
                id: Uuid::new_v4(),
                milestone_id: event.milestone_id(),
                event: Json(event.clone()),
                attempts: 0,
                created_at: Utc::now(),
                delivered_at: None,
            });
        }
    }

    fn cached_escrow(&self, milestone_id: Uuid) -> Option<Escrow> {
        self.cached
            .get(&milestone_id)
            .cloned()
            .or_else(|| self.escrows.values().find(|e| e.milestone_id == milestone_id).cloned())
    }

    fn milestone_matches(&self, before: &Milestone) -> bool {
        self.milestones
            .get(&before.id)
            .map(|stored| stored.status == before.status && stored.version == before.version)
            .unwrap_or(false)
    }

    fn escrow_matches(&self, before: &Escrow) -> bool {
        self.escrows
            .get(&before.id)
            .map(|stored| stored.status == before.status && stored.version == before.version)
            .unwrap_or(false)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every event ever appended, delivered or not.
    pub fn events(&self) -> Vec<EscrowEvent> {
        self.state().outbox.iter().map(|entry| entry.event.0.clone()).collect()
    }

    pub fn outbox(&self) -> Vec<OutboxEntry> {
        self.state().outbox.clone()
    }

    /// Overwrite an escrow row, bypassing CAS. Test setup only.
    pub fn put_escrow(&self, escrow: Escrow) {
        self.state().escrows.insert(escrow.id, escrow);
    }

    pub fn put_milestone(&self, milestone: Milestone) {
        self.state().milestones.insert(milestone.id, milestone);
    }

    /// Make cached reads serve `escrow` until the next write to its
    /// milestone, the way a late cache fill would.
    pub fn cache_escrow(&self, escrow: Escrow) {
        self.state().cached.insert(escrow.milestone_id, escrow);
    }
}

#[async_trait]
impl EscrowExt for MemoryStore {
    async fn insert_milestone(&self, milestone: &Milestone, events: &[EscrowEvent]) -> Result<(), Error> {
        let mut state = self.state();
        state.milestones.insert(milestone.id, milestone.clone());
        state.append(events);
        Ok(())
    }

    async fn get_milestone(&self, milestone_id: Uuid) -> Result<Option<Milestone>, Error> {
        Ok(self.state().milestones.get(&milestone_id).cloned())
    }

    async fn commit_milestone(
        &self,
        before: &Milestone,
        milestone: &Milestone,
        events: &[EscrowEvent],
    ) -> Result<bool, Error> {
        let mut state = self.state();
        if !state.milestone_matches(before) {
            return Ok(false);
        }
        state.milestones.insert(milestone.id, milestone.clone());
        state.cached.remove(&milestone.id);
        state.append(events);
        Ok(true)
    }

    async fn insert_escrow(&self, escrow: &Escrow, events: &[EscrowEvent]) -> Result<bool, Error> {
        let mut state = self.state();
        if state.escrows.values().any(|e| e.milestone_id == escrow.milestone_id) {
            return Ok(false);
        }
        state.escrows.insert(escrow.id, escrow.clone());
        state.append(events);
        Ok(true)
    }

    async fn get_escrow(&self, escrow_id: Uuid) -> Result<Option<Escrow>, Error> {
        let state = self.state();
        Ok(state
            .escrows
            .get(&escrow_id)
            .and_then(|escrow| state.cached_escrow(escrow.milestone_id)))
    }

    async fn get_escrow_by_milestone(&self, milestone_id: Uuid) -> Result<Option<Escrow>, Error> {
        Ok(self.state().cached_escrow(milestone_id))
    }

    async fn load_pair(&self, milestone_id: Uuid) -> Result<(Option<Milestone>, Option<Escrow>), Error> {
        let state = self.state();
        let milestone = state.milestones.get(&milestone_id).cloned();
        let escrow = state.escrows.values().find(|e| e.milestone_id == milestone_id).cloned();
        Ok((milestone, escrow))
    }

    async fn get_escrow_by_order(&self, order_id: &str) -> Result<Option<Escrow>, Error> {
        Ok(self
            .state()
            .escrows
            .values()
            .find(|e| e.order_id.as_deref() == Some(order_id))
            .cloned())
    }

    async fn commit_transition(&self, write: &TransitionWrite<'_>) -> Result<bool, Error> {
        let mut state = self.state();
        if !state.escrow_matches(write.before_escrow) || !state.milestone_matches(write.before_milestone) {
            return Ok(false);
        }
        state.escrows.insert(write.escrow.id, write.escrow.clone());
        state.milestones.insert(write.milestone.id, write.milestone.clone());
        state.cached.remove(&write.milestone.id);
        state.append(write.events);
        Ok(true)
    }

    async fn find_auto_release_candidates(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
        limit: i64,
    ) -> Result<Vec<Escrow>, Error> {
        let state = self.state();
        let mut due: Vec<Escrow> = state
            .escrows
            .values()
            .filter(|escrow| {
                state
                    .milestones
                    .get(&escrow.milestone_id)
                    .map(|milestone| escrow.auto_release_due(milestone, grace, now))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        due.sort_by_key(|escrow| escrow.activated_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn find_overdue_milestones(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Milestone>, Error> {
        let state = self.state();
        let mut overdue: Vec<Milestone> = state
            .milestones
            .values()
            .filter(|milestone| {
                matches!(milestone.status, MilestoneStatus::Approved | MilestoneStatus::InProgress)
                    && milestone.payment_due(now)
                    && state
                        .escrows
                        .values()
                        .find(|e| e.milestone_id == milestone.id)
                        .map(|e| e.status == EscrowStatus::Pending)
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        overdue.sort_by_key(|milestone| milestone.payment_due_date);
        overdue.truncate(limit.max(0) as usize);
        Ok(overdue)
    }

    async fn pending_outbox(&self, limit: i64, max_attempts: i32) -> Result<Vec<OutboxEntry>, Error> {
        Ok(self
            .state()
            .outbox
            .iter()
            .filter(|entry| entry.delivered_at.is_none() && entry.attempts < max_attempts)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_outbox_delivered(&self, entry_id: Uuid) -> Result<(), Error> {
        if let Some(entry) = self.state().outbox.iter_mut().find(|e| e.id == entry_id) {
            entry.delivered_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_outbox_failure(&self, entry_id: Uuid) -> Result<(), Error> {
        if let Some(entry) = self.state().outbox.iter_mut().find(|e| e.id == entry_id) {
            entry.attempts += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::{escrow, milestone};

    #[tokio::test]
    async fn commit_transition_rejects_stale_version() {
        let store = MemoryStore::default();
        let m = milestone(MilestoneStatus::InProgress);
        let e = escrow(&m, EscrowStatus::Active);
        store.put_milestone(m.clone());
        store.put_escrow(e.clone());

        let mut next_e = e.clone();
        next_e.status = EscrowStatus::Disputed;
        next_e.version += 1;
        let mut next_m = m.clone();
        next_m.version += 1;

        let write = TransitionWrite {
            before_milestone: &m,
            before_escrow: &e,
            milestone: &next_m,
            escrow: &next_e,
            events: &[],
        };
        assert!(store.commit_transition(&write).await.unwrap());
        // Same expectation a second time: the row has moved on.
        assert!(!store.commit_transition(&write).await.unwrap());

        let stored = store.get_escrow(e.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EscrowStatus::Disputed);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn failed_cas_leaves_both_rows_untouched() {
        let store = MemoryStore::default();
        let m = milestone(MilestoneStatus::Approved);
        let e = escrow(&m, EscrowStatus::Active);
        store.put_milestone(m.clone());
        store.put_escrow(e.clone());

        let mut stale_m = m.clone();
        stale_m.version = 7;
        let mut next_m = m.clone();
        next_m.status = MilestoneStatus::Paid;
        let mut next_e = e.clone();
        next_e.status = EscrowStatus::Released;

        let write = TransitionWrite {
            before_milestone: &stale_m,
            before_escrow: &e,
            milestone: &next_m,
            escrow: &next_e,
            events: &[],
        };
        assert!(!store.commit_transition(&write).await.unwrap());
        assert_eq!(store.get_escrow(e.id).await.unwrap().unwrap().status, EscrowStatus::Active);
        assert_eq!(store.get_milestone(m.id).await.unwrap().unwrap().status, MilestoneStatus::Approved);
    }

    #[tokio::test]
    async fn one_escrow_per_milestone() {
        let store = MemoryStore::default();
        let m = milestone(MilestoneStatus::Approved);
        assert!(store.insert_escrow(&escrow(&m, EscrowStatus::Pending), &[]).await.unwrap());
        assert!(!store.insert_escrow(&escrow(&m, EscrowStatus::Pending), &[]).await.unwrap());
    }

    #[tokio::test]
    async fn load_pair_ignores_cached_rows() {
        let store = MemoryStore::default();
        let m = milestone(MilestoneStatus::InProgress);
        let e = escrow(&m, EscrowStatus::Active);
        store.put_milestone(m.clone());
        let mut released = e.clone();
        released.status = EscrowStatus::Released;
        store.put_escrow(released);
        store.cache_escrow(e.clone());

        let cached = store.get_escrow_by_milestone(m.id).await.unwrap().unwrap();
        assert_eq!(cached.status, EscrowStatus::Active);
        let (_, fresh) = store.load_pair(m.id).await.unwrap();
        assert_eq!(fresh.unwrap().status, EscrowStatus::Released);
    }

    #[tokio::test]
    async fn exhausted_outbox_rows_are_skipped() {
        let store = MemoryStore::default();
        let m = milestone(MilestoneStatus::Approved);
        let created = EscrowEvent::MilestoneCreated {
            milestone_id: m.id,
            client_id: m.client_id,
            freelancer_id: m.freelancer_id,
            status: m.status,
        };
        let events = [created.clone(), created];
        store.insert_milestone(&m, &events).await.unwrap();
        let first = store.outbox()[0].id;
        for _ in 0..3 {
            store.record_outbox_failure(first).await.unwrap();
        }

        let pending = store.pending_outbox(10, 3).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_ne!(pending[0].id, first);
        assert_eq!(store.outbox()[0].attempts, 3);
    }
}
