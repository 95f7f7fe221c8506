// service/escrow_service.rs
use std::sync::Arc;

use bigdecimal::BigDecimal;
use num_traits::Zero;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::{
    db::escrowdb::{EscrowExt, TransitionWrite},
    models::{
        actormodel::{Actor, SystemActor},
        escrowmodel::{DisputeResolution, Escrow, EscrowEvent, EscrowStatus},
        milestonemodel::{Milestone, MilestoneStatus, NewMilestone},
    },
    service::{
        error::ServiceError,
        escrow_machine::{self, EscrowCommand, MilestoneCommand, Payout, PayoutReceipts, TransitionPlan},
        fee_policy::FeePolicy,
        pair_lock::PairLocks,
        payment_provider::{FundingOrder, OrderRequest, PaymentGateway, PaymentProof, RefundRequest, TransferRequest},
    },
    utils::currency::is_currency_code,
};

#[derive(Debug, Clone, Serialize)]
pub struct FundingInitiation {
    pub escrow: Escrow,
    pub order: FundingOrder,
}

enum Target {
    Milestone(Uuid),
    Escrow(Uuid),
}

/// A planned transition holding the pair lock, waiting for its payout and
/// commit. `milestone`/`escrow` are the rows the commit is conditioned on.
struct Prepared {
    _guard: OwnedMutexGuard<()>,
    milestone: Milestone,
    escrow: Escrow,
    plan: TransitionPlan,
}

/// Sole writer of milestones and escrows. Each command validates its input,
/// takes the pair lock, plans the transition, performs any gateway call and
/// only then commits both rows in one conditional write.
#[derive(Clone)]
pub struct EscrowService {
    store: Arc<dyn EscrowExt>,
    gateway: Arc<dyn PaymentGateway>,
    fee_policy: Arc<dyn FeePolicy>,
    locks: PairLocks,
}

impl std::fmt::Debug for EscrowService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowService").field("locks", &self.locks).finish()
    }
}

impl EscrowService {
    pub fn new(
        store: Arc<dyn EscrowExt>,
        gateway: Arc<dyn PaymentGateway>,
        fee_policy: Arc<dyn FeePolicy>,
    ) -> Self {
        Self {
            store,
            gateway,
            fee_policy,
            locks: PairLocks::default(),
        }
    }

    pub async fn get_milestone(&self, milestone_id: Uuid) -> Result<Milestone, ServiceError> {
        self.store
            .get_milestone(milestone_id)
            .await?
            .ok_or(ServiceError::MilestoneNotFound(milestone_id))
    }

    pub async fn get_escrow(&self, escrow_id: Uuid) -> Result<Escrow, ServiceError> {
        self.store
            .get_escrow(escrow_id)
            .await?
            .ok_or(ServiceError::EscrowNotFound(escrow_id))
    }

    pub async fn get_escrow_for_milestone(&self, milestone_id: Uuid) -> Result<Option<Escrow>, ServiceError> {
        Ok(self.store.get_escrow_by_milestone(milestone_id).await?)
    }

    pub async fn create_milestone(&self, actor: &Actor, new: NewMilestone) -> Result<Milestone, ServiceError> {
        if new.title.trim().is_empty() {
            return Err(ServiceError::Validation("milestone title is required".to_string()));
        }
        if new.amount <= BigDecimal::zero() {
            return Err(ServiceError::Validation("milestone amount must be positive".to_string()));
        }
        if !is_currency_code(&new.currency) {
            return Err(ServiceError::Validation(format!("invalid currency code {:?}", new.currency)));
        }

        let freelancer_id = match actor {
            Actor::Freelancer(id) => *id,
            _ => return Err(ServiceError::unauthorized(actor, "create milestone")),
        };
        if freelancer_id == new.client_id {
            return Err(ServiceError::Validation("client and freelancer must differ".to_string()));
        }

        let milestone = Milestone::from_new(freelancer_id, new, Utc::now());
        let events = [EscrowEvent::MilestoneCreated {
            milestone_id: milestone.id,
            client_id: milestone.client_id,
            freelancer_id,
            status: milestone.status,
        }];
        self.store.insert_milestone(&milestone, &events).await?;

        tracing::info!("Milestone {} created by {} ({})", milestone.id, actor, milestone.status);
        Ok(milestone)
    }

    pub async fn submit_milestone_plan(&self, actor: &Actor, milestone_id: Uuid) -> Result<Milestone, ServiceError> {
        self.apply_milestone_command(actor, milestone_id, MilestoneCommand::SubmitPlan, Utc::now())
            .await
    }

    pub async fn approve_milestone_plan(&self, actor: &Actor, milestone_id: Uuid) -> Result<Milestone, ServiceError> {
        self.apply_milestone_command(actor, milestone_id, MilestoneCommand::ApprovePlan, Utc::now())
            .await
    }

    pub async fn start_milestone(&self, actor: &Actor, milestone_id: Uuid) -> Result<Milestone, ServiceError> {
        self.apply_milestone_command(actor, milestone_id, MilestoneCommand::Start, Utc::now())
            .await
    }

    pub async fn mark_payment_overdue(&self, milestone_id: Uuid, now: DateTime<Utc>) -> Result<Milestone, ServiceError> {
        self.apply_milestone_command(
            &Actor::System(SystemActor::Scheduler),
            milestone_id,
            MilestoneCommand::MarkPaymentOverdue,
            now,
        )
        .await
    }

    /// Open (or re-issue) the gateway order the client pays into escrow.
    pub async fn initiate_funding(
        &self,
        actor: &Actor,
        milestone_id: Uuid,
        customer_email: Option<String>,
    ) -> Result<FundingInitiation, ServiceError> {
        const ACTION: &str = "initiate funding";

        let _guard = self.locks.acquire(milestone_id).await;
        let (milestone, existing) = self.load_for_write(milestone_id).await?;
        if !actor.is_client(milestone.client_id) {
            return Err(ServiceError::unauthorized(actor, ACTION));
        }

        let fundable = matches!(
            milestone.status,
            MilestoneStatus::Approved | MilestoneStatus::InProgress | MilestoneStatus::PaymentOverdue
        );
        if !fundable || existing.as_ref().map(|e| e.status != EscrowStatus::Pending).unwrap_or(false) {
            return Err(ServiceError::invalid(ACTION, &milestone, existing.as_ref()));
        }

        let quote = self.fee_policy.quote(&milestone.amount);
        let order = self
            .gateway
            .create_order(&OrderRequest {
                milestone_id,
                amount: quote.total_amount.clone(),
                currency: milestone.currency.clone(),
                customer_email,
            })
            .await
            .map_err(|e| {
                tracing::error!("Order creation failed for milestone {}: {}", milestone_id, e);
                ServiceError::from(e)
            })?;

        let now = Utc::now();
        let escrow = match existing {
            None => {
                let escrow = Escrow::pending_for(&milestone, quote, order.order_id.clone(), now);
                let events = [funding_requested(&escrow)];
                if !self.store.insert_escrow(&escrow, &events).await? {
                    return Err(ServiceError::ConcurrentModification(milestone_id));
                }
                escrow
            }
            Some(pending) => {
                let mut next = pending.clone();
                next.order_id = Some(order.order_id.clone());
                next.version += 1;
                let mut next_milestone = milestone.clone();
                next_milestone.version += 1;
                next_milestone.updated_at = now;
                let events = [funding_requested(&next)];

                let write = TransitionWrite {
                    before_milestone: &milestone,
                    before_escrow: &pending,
                    milestone: &next_milestone,
                    escrow: &next,
                    events: &events,
                };
                if !self.store.commit_transition(&write).await? {
                    return Err(ServiceError::ConcurrentModification(milestone_id));
                }
                next
            }
        };

        tracing::info!(
            "Funding order {} issued for escrow {} (milestone {}, total {} {})",
            order.order_id,
            escrow.id,
            milestone_id,
            escrow.total_amount,
            escrow.currency
        );
        Ok(FundingInitiation { escrow, order })
    }

    /// `pending -> active` once the gateway confirms the client's payment.
    /// The gateway's own transaction lookup is the only proof accepted.
    pub async fn fund_escrow(
        &self,
        actor: &Actor,
        milestone_id: Uuid,
        proof: PaymentProof,
    ) -> Result<Escrow, ServiceError> {
        let command = EscrowCommand::Activate {
            payment_reference: proof.order_id.clone(),
        };
        let prepared = self
            .prepare(actor, Target::Milestone(milestone_id), command, Utc::now())
            .await?;

        if prepared.escrow.order_id.as_deref() != Some(proof.order_id.as_str()) {
            return Err(ServiceError::Validation(
                "payment proof does not match the escrow's order".to_string(),
            ));
        }

        let verified = self
            .gateway
            .verify_payment(&proof, &prepared.escrow.total_amount)
            .await
            .map_err(|e| {
                tracing::error!("Payment verification failed for order {}: {}", proof.order_id, e);
                ServiceError::from(e)
            })?;
        if !verified {
            tracing::warn!("Payment for order {} could not be verified", proof.order_id);
            return Err(ServiceError::Gateway(format!(
                "payment for order {} could not be verified",
                proof.order_id
            )));
        }

        let (_, escrow) = self.finish(actor, prepared).await?;
        Ok(escrow)
    }

    /// Apply a verified `charge.success` callback. Returns `None` when the
    /// reference belongs to no escrow; replays of an applied charge return
    /// the escrow unchanged.
    pub async fn record_gateway_payment(&self, order_id: &str) -> Result<Option<Escrow>, ServiceError> {
        let escrow = match self.store.get_escrow_by_order(order_id).await? {
            Some(escrow) => escrow,
            None => {
                tracing::warn!("Payment callback for unknown order {}", order_id);
                return Ok(None);
            }
        };

        if escrow.payment_reference.as_deref() == Some(order_id) {
            tracing::info!("Payment for order {} already applied to escrow {}", order_id, escrow.id);
            return Ok(Some(escrow));
        }

        let proof = PaymentProof {
            order_id: order_id.to_string(),
        };
        let actor = Actor::System(SystemActor::PaymentGateway);
        self.fund_escrow(&actor, escrow.milestone_id, proof).await.map(Some)
    }

    pub async fn submit_deliverable(
        &self,
        actor: &Actor,
        milestone_id: Uuid,
        notes: String,
        attachments: Vec<String>,
    ) -> Result<Milestone, ServiceError> {
        let command = EscrowCommand::SubmitDeliverable { notes, attachments };
        let (milestone, _) = self.execute(actor, Target::Milestone(milestone_id), command, Utc::now()).await?;
        Ok(milestone)
    }

    pub async fn review_milestone(
        &self,
        actor: &Actor,
        milestone_id: Uuid,
        approve: bool,
        notes: Option<String>,
    ) -> Result<Milestone, ServiceError> {
        let command = EscrowCommand::Review { approve, notes };
        let (milestone, _) = self.execute(actor, Target::Milestone(milestone_id), command, Utc::now()).await?;
        Ok(milestone)
    }

    pub async fn release_funds(
        &self,
        actor: &Actor,
        escrow_id: Uuid,
        reason: Option<String>,
    ) -> Result<Escrow, ServiceError> {
        let command = EscrowCommand::Release { reason };
        let (_, escrow) = self.execute(actor, Target::Escrow(escrow_id), command, Utc::now()).await?;
        Ok(escrow)
    }

    pub async fn raise_dispute(&self, actor: &Actor, escrow_id: Uuid, reason: String) -> Result<Escrow, ServiceError> {
        let command = EscrowCommand::RaiseDispute { reason };
        let (_, escrow) = self.execute(actor, Target::Escrow(escrow_id), command, Utc::now()).await?;
        Ok(escrow)
    }

    pub async fn resolve_dispute(
        &self,
        actor: &Actor,
        escrow_id: Uuid,
        resolution: DisputeResolution,
        notes: Option<String>,
    ) -> Result<Escrow, ServiceError> {
        let command = EscrowCommand::ResolveDispute { resolution, notes };
        let (_, escrow) = self.execute(actor, Target::Escrow(escrow_id), command, Utc::now()).await?;
        Ok(escrow)
    }

    /// Release issued by the scheduler; re-checks eligibility under the lock.
    pub async fn auto_release(
        &self,
        escrow_id: Uuid,
        grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<Escrow, ServiceError> {
        let actor = Actor::System(SystemActor::AutoRelease);
        let command = EscrowCommand::AutoRelease { grace };
        let (_, escrow) = self.execute(&actor, Target::Escrow(escrow_id), command, now).await?;
        Ok(escrow)
    }

    async fn apply_milestone_command(
        &self,
        actor: &Actor,
        milestone_id: Uuid,
        command: MilestoneCommand,
        now: DateTime<Utc>,
    ) -> Result<Milestone, ServiceError> {
        let _guard = self.locks.acquire(milestone_id).await;
        let (milestone, escrow) = self.load_for_write(milestone_id).await?;

        let plan = escrow_machine::plan_milestone(&milestone, escrow.as_ref(), actor, command, now)
            .map_err(|e| {
                tracing::warn!("{} rejected for milestone {}: {}", command.action(), milestone_id, e);
                e
            })?;

        if !self.store.commit_milestone(&milestone, &plan.milestone, &plan.events).await? {
            return Err(ServiceError::ConcurrentModification(milestone_id));
        }

        tracing::info!(
            "Milestone {} moved {} -> {} by {}",
            milestone_id,
            milestone.status,
            plan.milestone.status,
            actor
        );
        Ok(plan.milestone)
    }

    async fn execute(
        &self,
        actor: &Actor,
        target: Target,
        command: EscrowCommand,
        now: DateTime<Utc>,
    ) -> Result<(Milestone, Escrow), ServiceError> {
        let prepared = self.prepare(actor, target, command, now).await?;
        self.finish(actor, prepared).await
    }

    async fn prepare(
        &self,
        actor: &Actor,
        target: Target,
        command: EscrowCommand,
        now: DateTime<Utc>,
    ) -> Result<Prepared, ServiceError> {
        command.validate()?;

        let milestone_id = match target {
            Target::Milestone(id) => id,
            Target::Escrow(id) => self.get_escrow(id).await?.milestone_id,
        };

        let guard = self.locks.acquire(milestone_id).await;
        // Re-read under the lock: a transition that just finished must be seen.
        let (milestone, escrow) = self.load_for_write(milestone_id).await?;
        let escrow = match escrow {
            Some(escrow) => escrow,
            None => return Err(ServiceError::invalid(command.action(), &milestone, None)),
        };

        let plan = escrow_machine::plan(&milestone, &escrow, actor, &command, now).map_err(|e| {
            tracing::warn!("{} rejected for escrow {}: {}", command.action(), escrow.id, e);
            e
        })?;

        Ok(Prepared {
            _guard: guard,
            milestone,
            escrow,
            plan,
        })
    }

    async fn finish(&self, actor: &Actor, prepared: Prepared) -> Result<(Milestone, Escrow), ServiceError> {
        let Prepared {
            _guard,
            mut milestone,
            mut escrow,
            mut plan,
        } = prepared;

        let moves_money = plan.payout != Payout::None;
        let receipts = match plan.payout.clone() {
            Payout::None => PayoutReceipts::default(),
            Payout::Transfer { amount } => PayoutReceipts {
                transfer_id: Some(self.transfer(&milestone, &escrow, amount).await?),
                refund_id: None,
            },
            Payout::Refund { amount } => PayoutReceipts {
                transfer_id: None,
                refund_id: Some(self.refund(&escrow, amount).await?),
            },
            Payout::Split { transfer, refund } => {
                let transfer_id = match escrow.transfer_id.clone() {
                    Some(transfer_id) => transfer_id,
                    None => {
                        let transfer_id = self.transfer(&milestone, &escrow, transfer).await?;
                        let (checkpoint_m, checkpoint_e) = self
                            .checkpoint_transfer(&milestone, &escrow, &transfer_id, plan.escrow.dispute_resolution.clone())
                            .await?;
                        plan.milestone.version = checkpoint_m.version + 1;
                        plan.escrow.version = checkpoint_e.version + 1;
                        milestone = checkpoint_m;
                        escrow = checkpoint_e;
                        transfer_id
                    }
                };
                PayoutReceipts {
                    transfer_id: Some(transfer_id),
                    refund_id: Some(self.refund(&escrow, refund).await?),
                }
            }
        };
        let plan = plan.settle(receipts);

        let write = TransitionWrite {
            before_milestone: &milestone,
            before_escrow: &escrow,
            milestone: &plan.milestone,
            escrow: &plan.escrow,
            events: &plan.events,
        };
        if !self.store.commit_transition(&write).await? {
            if moves_money {
                tracing::error!(
                    "Escrow {} lost a concurrent write after the gateway moved funds; payout {:?}/{:?} needs reconciliation",
                    escrow.id,
                    plan.escrow.transfer_id,
                    plan.escrow.refund_id
                );
            }
            return Err(ServiceError::ConcurrentModification(milestone.id));
        }

        tracing::info!(
            "Escrow {} {} -> {}, milestone {} {} -> {} by {}",
            escrow.id,
            escrow.status,
            plan.escrow.status,
            milestone.id,
            milestone.status,
            plan.milestone.status,
            actor
        );
        Ok((plan.milestone, plan.escrow))
    }

    /// Uncached read of the pair; the caller holds the pair lock.
    async fn load_for_write(&self, milestone_id: Uuid) -> Result<(Milestone, Option<Escrow>), ServiceError> {
        let (milestone, escrow) = self.store.load_pair(milestone_id).await?;
        let milestone = milestone.ok_or(ServiceError::MilestoneNotFound(milestone_id))?;
        Ok((milestone, escrow))
    }

    async fn transfer(&self, milestone: &Milestone, escrow: &Escrow, amount: BigDecimal) -> Result<String, ServiceError> {
        let request = TransferRequest {
            escrow_id: escrow.id,
            amount,
            currency: escrow.currency.clone(),
            recipient: milestone.payout_recipient.clone(),
            reason: format!("Milestone payout: {}", milestone.title),
        };

        self.gateway.transfer_to_freelancer(&request).await.map_err(|e| {
            tracing::error!("Transfer for escrow {} failed: {}", escrow.id, e);
            ServiceError::from(e)
        })
    }

    async fn refund(&self, escrow: &Escrow, amount: BigDecimal) -> Result<String, ServiceError> {
        let payment_reference = escrow
            .payment_reference
            .clone()
            .or_else(|| escrow.order_id.clone())
            .ok_or_else(|| ServiceError::Gateway(format!("escrow {} has no payment to refund", escrow.id)))?;
        let request = RefundRequest {
            escrow_id: escrow.id,
            amount,
            currency: escrow.currency.clone(),
            payment_reference,
        };

        self.gateway.refund_to_client(&request).await.map_err(|e| {
            tracing::error!("Refund for escrow {} failed: {}", escrow.id, e);
            ServiceError::from(e)
        })
    }

    /// Persist a completed transfer of a split payout before the refund
    /// leg runs, so a retry after a failed refund does not pay twice. The
    /// resolution is stored with it; only that resolution may finish.
    async fn checkpoint_transfer(
        &self,
        milestone: &Milestone,
        escrow: &Escrow,
        transfer_id: &str,
        resolution: Option<String>,
    ) -> Result<(Milestone, Escrow), ServiceError> {
        let mut next_escrow = escrow.clone();
        next_escrow.transfer_id = Some(transfer_id.to_string());
        next_escrow.dispute_resolution = resolution;
        next_escrow.version += 1;
        let mut next_milestone = milestone.clone();
        next_milestone.version += 1;

        let write = TransitionWrite {
            before_milestone: milestone,
            before_escrow: escrow,
            milestone: &next_milestone,
            escrow: &next_escrow,
            events: &[],
        };
        if !self.store.commit_transition(&write).await? {
            tracing::error!(
                "Escrow {} changed while recording transfer {}; needs reconciliation",
                escrow.id,
                transfer_id
            );
            return Err(ServiceError::ConcurrentModification(milestone.id));
        }

        Ok((next_milestone, next_escrow))
    }
}

fn funding_requested(escrow: &Escrow) -> EscrowEvent {
    EscrowEvent::FundingRequested {
        escrow_id: escrow.id,
        milestone_id: escrow.milestone_id,
        order_id: escrow.order_id.clone().unwrap_or_default(),
        total_amount: escrow.total_amount.clone(),
    }
}
