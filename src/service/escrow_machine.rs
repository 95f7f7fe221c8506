// service/escrow_machine.rs
//! Transition table for a (Milestone, Escrow) pair.
//!
//! Everything here is pure: a plan is computed from the current records,
//! the acting party and the command, and nothing is persisted. The escrow
//! service executes the plan's payout and commits the resulting pair.
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};

use crate::{
    models::{
        actormodel::{Actor, SystemActor},
        escrowmodel::{ClientApprovalStatus, DisputeResolution, Escrow, EscrowEvent, EscrowStatus},
        milestonemodel::{Milestone, MilestoneStatus},
    },
    service::error::ServiceError,
    utils::currency::percent_of,
};

#[derive(Debug, Clone)]
pub enum EscrowCommand {
    Activate { payment_reference: String },
    SubmitDeliverable { notes: String, attachments: Vec<String> },
    Review { approve: bool, notes: Option<String> },
    Release { reason: Option<String> },
    AutoRelease { grace: Duration },
    RaiseDispute { reason: String },
    ResolveDispute { resolution: DisputeResolution, notes: Option<String> },
}

impl EscrowCommand {
    pub fn action(&self) -> &'static str {
        match self {
            EscrowCommand::Activate { .. } => "fund escrow",
            EscrowCommand::SubmitDeliverable { .. } => "submit deliverable",
            EscrowCommand::Review { .. } => "review milestone",
            EscrowCommand::Release { .. } => "release funds",
            EscrowCommand::AutoRelease { .. } => "auto-release funds",
            EscrowCommand::RaiseDispute { .. } => "raise dispute",
            EscrowCommand::ResolveDispute { .. } => "resolve dispute",
        }
    }

    /// Field checks that need no stored state.
    pub fn validate(&self) -> Result<(), ServiceError> {
        match self {
            EscrowCommand::Activate { payment_reference } if is_blank(payment_reference) => {
                Err(ServiceError::Validation("payment reference is required".to_string()))
            }
            EscrowCommand::SubmitDeliverable { notes, .. } if is_blank(notes) => {
                Err(ServiceError::Validation("submission notes are required".to_string()))
            }
            EscrowCommand::SubmitDeliverable { attachments, .. }
                if attachments.iter().any(|a| is_blank(a)) =>
            {
                Err(ServiceError::Validation("attachment references cannot be empty".to_string()))
            }
            EscrowCommand::Review { approve: false, notes }
                if notes.as_deref().map(is_blank).unwrap_or(true) =>
            {
                Err(ServiceError::Validation("review notes are required when rejecting".to_string()))
            }
            EscrowCommand::RaiseDispute { reason } if is_blank(reason) => {
                Err(ServiceError::Validation("dispute reason is required".to_string()))
            }
            EscrowCommand::ResolveDispute {
                resolution: DisputeResolution::Partial { freelancer_percent },
                ..
            } if !(1..=99).contains(freelancer_percent) => Err(ServiceError::Validation(
                "partial resolution percentage must be between 1 and 99".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

/// Money movement a transition needs before it may be committed.
#[derive(Debug, Clone, PartialEq)]
pub enum Payout {
    None,
    Transfer { amount: BigDecimal },
    Refund { amount: BigDecimal },
    Split { transfer: BigDecimal, refund: BigDecimal },
}

/// Gateway ids returned by a completed payout.
#[derive(Debug, Clone, Default)]
pub struct PayoutReceipts {
    pub transfer_id: Option<String>,
    pub refund_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransitionPlan {
    pub milestone: Milestone,
    pub escrow: Escrow,
    pub payout: Payout,
    pub events: Vec<EscrowEvent>,
}

impl TransitionPlan {
    /// Record payout ids on the escrow and emit the money-movement events.
    pub fn settle(mut self, receipts: PayoutReceipts) -> Self {
        let actor = self.escrow.released_by.clone().unwrap_or_default();

        if let Some(transfer_id) = receipts.transfer_id {
            let amount = match &self.payout {
                Payout::Transfer { amount } => amount.clone(),
                Payout::Split { transfer, .. } => transfer.clone(),
                _ => self.escrow.amount_to_freelancer.clone(),
            };
            self.escrow.transfer_id = Some(transfer_id.clone());
            self.events.push(EscrowEvent::FundsReleased {
                escrow_id: self.escrow.id,
                milestone_id: self.milestone.id,
                freelancer_id: self.escrow.freelancer_id,
                amount,
                transfer_id,
                actor,
            });
        }

        if let Some(refund_id) = receipts.refund_id {
            let amount = match &self.payout {
                Payout::Refund { amount } => amount.clone(),
                Payout::Split { refund, .. } => refund.clone(),
                _ => self.escrow.total_amount.clone(),
            };
            self.escrow.refund_id = Some(refund_id.clone());
            self.events.push(EscrowEvent::EscrowRefunded {
                escrow_id: self.escrow.id,
                milestone_id: self.milestone.id,
                client_id: self.escrow.client_id,
                amount,
                refund_id,
            });
        }

        self
    }
}

fn authorize(actor: &Actor, milestone: &Milestone, escrow: &Escrow, command: &EscrowCommand) -> Result<(), ServiceError> {
    let allowed = match command {
        EscrowCommand::Activate { .. } => {
            matches!(actor, Actor::System(SystemActor::PaymentGateway)) || actor.is_client(escrow.client_id)
        }
        EscrowCommand::SubmitDeliverable { .. } => {
            actor.is_freelancer(escrow.freelancer_id) && actor.is_freelancer(milestone.freelancer_id)
        }
        EscrowCommand::Review { .. } => actor.is_client(escrow.client_id),
        EscrowCommand::Release { .. } => actor.is_client(escrow.client_id) || actor.is_admin(),
        EscrowCommand::AutoRelease { .. } => matches!(actor, Actor::System(SystemActor::AutoRelease)),
        EscrowCommand::RaiseDispute { .. } => {
            actor.is_client(escrow.client_id) || actor.is_freelancer(escrow.freelancer_id)
        }
        EscrowCommand::ResolveDispute { .. } => actor.is_admin(),
    };

    if allowed {
        Ok(())
    } else {
        Err(ServiceError::unauthorized(actor, command.action()))
    }
}

fn move_milestone(milestone: &mut Milestone, to: MilestoneStatus, actor: &Actor, events: &mut Vec<EscrowEvent>) {
    if milestone.status != to {
        events.push(EscrowEvent::MilestoneStatusChanged {
            milestone_id: milestone.id,
            from: milestone.status,
            to,
            actor: actor.to_string(),
        });
        milestone.status = to;
    }
}

fn release(
    milestone: &mut Milestone,
    escrow: &mut Escrow,
    actor: &Actor,
    reason: Option<String>,
    now: DateTime<Utc>,
    events: &mut Vec<EscrowEvent>,
) -> Payout {
    escrow.status = EscrowStatus::Released;
    escrow.released_at = Some(now);
    escrow.release_reason = reason;
    escrow.released_by = Some(actor.to_string());
    move_milestone(milestone, MilestoneStatus::Paid, actor, events);

    Payout::Transfer {
        amount: escrow.amount_to_freelancer.clone(),
    }
}

/// Compute the next (Milestone, Escrow) pair for `command`.
///
/// Authorization is checked before state so a caller without the role
/// never learns more than `Unauthorized`.
pub fn plan(
    milestone: &Milestone,
    escrow: &Escrow,
    actor: &Actor,
    command: &EscrowCommand,
    now: DateTime<Utc>,
) -> Result<TransitionPlan, ServiceError> {
    authorize(actor, milestone, escrow, command)?;

    let invalid = || ServiceError::invalid(command.action(), milestone, Some(escrow));

    if escrow.milestone_id != milestone.id || escrow.status.is_terminal() {
        return Err(invalid());
    }

    let mut next_milestone = milestone.clone();
    let mut next_escrow = escrow.clone();
    let mut events = Vec::new();
    let mut payout = Payout::None;

    match command {
        EscrowCommand::Activate { payment_reference } => {
            if escrow.status != EscrowStatus::Pending {
                return Err(invalid());
            }
            next_escrow.status = EscrowStatus::Active;
            next_escrow.activated_at = Some(now);
            next_escrow.payment_reference = Some(payment_reference.clone());
            events.push(EscrowEvent::EscrowFunded {
                escrow_id: escrow.id,
                milestone_id: milestone.id,
                total_amount: escrow.total_amount.clone(),
            });
            if milestone.status == MilestoneStatus::PaymentOverdue {
                move_milestone(&mut next_milestone, MilestoneStatus::InProgress, actor, &mut events);
            }
        }

        EscrowCommand::SubmitDeliverable { notes, attachments } => {
            if escrow.status != EscrowStatus::Active
                || escrow.client_approval_status == ClientApprovalStatus::Approved
                || !milestone.status.accepts_submission()
            {
                return Err(invalid());
            }
            next_escrow.deliverable_submitted = true;
            next_escrow.deliverable_submitted_at = Some(now);
            next_escrow.client_approval_status = ClientApprovalStatus::None;
            next_milestone.submission_notes = Some(notes.trim().to_string());
            next_milestone.submission_attachments = attachments.clone();
            next_milestone.submission_date = Some(now);
            events.push(EscrowEvent::DeliverableSubmitted {
                escrow_id: escrow.id,
                milestone_id: milestone.id,
                freelancer_id: escrow.freelancer_id,
            });
            move_milestone(&mut next_milestone, MilestoneStatus::Review, actor, &mut events);
        }

        EscrowCommand::Review { approve, notes } => {
            if escrow.status != EscrowStatus::Active || milestone.status != MilestoneStatus::Review {
                return Err(invalid());
            }
            let notes = notes.as_ref().map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
            next_milestone.review_notes = notes.clone();
            next_milestone.review_date = Some(now);

            if *approve {
                next_escrow.client_approval_status = ClientApprovalStatus::Approved;
                move_milestone(&mut next_milestone, MilestoneStatus::Approved, actor, &mut events);
            } else {
                // A rejected deliverable must not age into an auto-release.
                next_escrow.client_approval_status = ClientApprovalStatus::Rejected;
                next_escrow.deliverable_submitted = false;
                move_milestone(&mut next_milestone, MilestoneStatus::Rejected, actor, &mut events);
            }
            events.push(EscrowEvent::MilestoneReviewed {
                escrow_id: escrow.id,
                milestone_id: milestone.id,
                approved: *approve,
                notes,
            });
        }

        EscrowCommand::Release { reason } => {
            if escrow.status != EscrowStatus::Active
                || escrow.dispute_raised
                || escrow.client_approval_status != ClientApprovalStatus::Approved
            {
                return Err(invalid());
            }
            payout = release(&mut next_milestone, &mut next_escrow, actor, reason.clone(), now, &mut events);
        }

        EscrowCommand::AutoRelease { grace } => {
            if !escrow.auto_release_due(milestone, *grace, now) {
                return Err(invalid());
            }
            payout = release(
                &mut next_milestone,
                &mut next_escrow,
                actor,
                Some("auto-release".to_string()),
                now,
                &mut events,
            );
        }

        EscrowCommand::RaiseDispute { reason } => {
            if escrow.status != EscrowStatus::Active {
                return Err(invalid());
            }
            next_escrow.status = EscrowStatus::Disputed;
            next_escrow.dispute_raised = true;
            next_escrow.dispute_reason = Some(reason.trim().to_string());
            events.push(EscrowEvent::DisputeRaised {
                escrow_id: escrow.id,
                milestone_id: milestone.id,
                reason: reason.trim().to_string(),
                actor: actor.to_string(),
            });
        }

        EscrowCommand::ResolveDispute { resolution, notes } => {
            if escrow.status != EscrowStatus::Disputed {
                return Err(invalid());
            }
            // Once a split has paid its transfer leg only that same split may finish.
            if escrow.transfer_id.is_some()
                && escrow.dispute_resolution.as_deref() != Some(resolution.label().as_str())
            {
                return Err(invalid());
            }
            next_escrow.dispute_resolution = Some(resolution.label());
            next_escrow.resolution_notes = notes.clone();
            events.push(EscrowEvent::DisputeResolved {
                escrow_id: escrow.id,
                milestone_id: milestone.id,
                resolution: *resolution,
                actor: actor.to_string(),
            });

            payout = match resolution {
                DisputeResolution::ReleaseToFreelancer => release(
                    &mut next_milestone,
                    &mut next_escrow,
                    actor,
                    Some("dispute resolved in favour of freelancer".to_string()),
                    now,
                    &mut events,
                ),
                DisputeResolution::RefundToClient => {
                    next_escrow.status = EscrowStatus::Refunded;
                    next_escrow.refunded_at = Some(now);
                    next_escrow.released_by = Some(actor.to_string());
                    move_milestone(&mut next_milestone, MilestoneStatus::Rejected, actor, &mut events);
                    Payout::Refund {
                        amount: escrow.total_amount.clone(),
                    }
                }
                DisputeResolution::Partial { freelancer_percent } => {
                    release(
                        &mut next_milestone,
                        &mut next_escrow,
                        actor,
                        Some(format!("partial dispute resolution ({}%)", freelancer_percent)),
                        now,
                        &mut events,
                    );
                    Payout::Split {
                        transfer: percent_of(&escrow.amount_to_freelancer, *freelancer_percent),
                        refund: percent_of(&escrow.milestone_amount, 100 - *freelancer_percent),
                    }
                }
            };
        }
    }

    next_milestone.version = milestone.version + 1;
    next_milestone.updated_at = now;
    next_escrow.version = escrow.version + 1;

    Ok(TransitionPlan {
        milestone: next_milestone,
        escrow: next_escrow,
        payout,
        events,
    })
}

/// Transitions that touch only the milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MilestoneCommand {
    SubmitPlan,
    ApprovePlan,
    Start,
    MarkPaymentOverdue,
}

impl MilestoneCommand {
    pub fn action(&self) -> &'static str {
        match self {
            MilestoneCommand::SubmitPlan => "submit milestone plan",
            MilestoneCommand::ApprovePlan => "approve milestone plan",
            MilestoneCommand::Start => "start milestone",
            MilestoneCommand::MarkPaymentOverdue => "mark payment overdue",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MilestonePlan {
    pub milestone: Milestone,
    pub events: Vec<EscrowEvent>,
}

pub fn plan_milestone(
    milestone: &Milestone,
    escrow: Option<&Escrow>,
    actor: &Actor,
    command: MilestoneCommand,
    now: DateTime<Utc>,
) -> Result<MilestonePlan, ServiceError> {
    let allowed = match command {
        MilestoneCommand::SubmitPlan | MilestoneCommand::Start => actor.is_freelancer(milestone.freelancer_id),
        MilestoneCommand::ApprovePlan => actor.is_client(milestone.client_id),
        MilestoneCommand::MarkPaymentOverdue => matches!(actor, Actor::System(SystemActor::Scheduler)),
    };
    if !allowed {
        return Err(ServiceError::unauthorized(actor, command.action()));
    }

    let escrow_status = escrow.map(|e| e.status);
    let target = match (command, milestone.status) {
        (MilestoneCommand::SubmitPlan, MilestoneStatus::Draft) => MilestoneStatus::Pending,
        (MilestoneCommand::ApprovePlan, MilestoneStatus::Pending) => MilestoneStatus::Approved,
        (MilestoneCommand::Start, MilestoneStatus::Approved)
            if escrow_status == Some(EscrowStatus::Active) =>
        {
            MilestoneStatus::InProgress
        }
        (MilestoneCommand::MarkPaymentOverdue, MilestoneStatus::Approved | MilestoneStatus::InProgress)
            if milestone.payment_due(now)
                && matches!(escrow_status, None | Some(EscrowStatus::Pending)) =>
        {
            MilestoneStatus::PaymentOverdue
        }
        _ => return Err(ServiceError::invalid(command.action(), milestone, escrow)),
    };

    let mut next = milestone.clone();
    let mut events = Vec::new();
    move_milestone(&mut next, target, actor, &mut events);
    if target == MilestoneStatus::PaymentOverdue {
        events.push(EscrowEvent::PaymentOverdue {
            milestone_id: milestone.id,
            client_id: milestone.client_id,
        });
    }
    next.version = milestone.version + 1;
    next.updated_at = now;

    Ok(MilestonePlan { milestone: next, events })
}
