//! Fixtures shared by the service tests.
use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::{
    db::memory::MemoryStore,
    models::{
        escrowmodel::{ClientApprovalStatus, Escrow, EscrowStatus, FeeQuote},
        milestonemodel::{Milestone, MilestoneStatus, NewMilestone},
    },
    service::{
        escrow_service::EscrowService,
        fee_policy::PercentageFeePolicy,
        payment_provider::{
            FundingOrder, GatewayError, OrderRequest, PaymentGateway, PaymentProof, RefundRequest,
            TransferRequest,
        },
    },
};

pub fn dec(value: &str) -> BigDecimal {
    BigDecimal::from_str(value).unwrap()
}

pub fn new_milestone(client_id: Uuid) -> NewMilestone {
    NewMilestone {
        workspace_id: Uuid::new_v4(),
        client_id,
        title: "Landing page".to_string(),
        description: "Responsive landing page with contact form".to_string(),
        amount: dec("1000"),
        currency: "NGN".to_string(),
        due_date: Utc::now() + Duration::days(14),
        payment_due_date: None,
        payout_recipient: Some("RCP_freelancer".to_string()),
        submit_for_approval: true,
    }
}

pub fn milestone(status: MilestoneStatus) -> Milestone {
    let mut milestone = Milestone::from_new(Uuid::new_v4(), new_milestone(Uuid::new_v4()), Utc::now());
    milestone.status = status;
    milestone
}

/// Escrow for `milestone` with the 5% quote on 1000.
pub fn escrow(milestone: &Milestone, status: EscrowStatus) -> Escrow {
    let quote = FeeQuote {
        service_charge: dec("50"),
        total_amount: dec("1050"),
        amount_to_freelancer: dec("950"),
    };
    let mut escrow = Escrow::pending_for(milestone, quote, "ord_1".to_string(), Utc::now());
    escrow.status = status;
    if status != EscrowStatus::Pending {
        escrow.activated_at = Some(Utc::now());
        escrow.payment_reference = Some("ord_1".to_string());
    }
    escrow
}

pub fn approved_escrow(milestone: &Milestone) -> Escrow {
    let mut escrow = escrow(milestone, EscrowStatus::Active);
    escrow.deliverable_submitted = true;
    escrow.deliverable_submitted_at = Some(Utc::now());
    escrow.client_approval_status = ClientApprovalStatus::Approved;
    escrow
}

pub fn submitted_at(escrow: &mut Escrow, at: DateTime<Utc>) {
    escrow.deliverable_submitted = true;
    escrow.deliverable_submitted_at = Some(at);
}

/// Gateway double that records every call and can be told to fail.
#[derive(Default)]
pub struct MockGateway {
    pub orders: AtomicUsize,
    pub transfers: Mutex<Vec<TransferRequest>>,
    pub refunds: Mutex<Vec<RefundRequest>>,
    pub fail_transfers: AtomicBool,
    pub fail_refunds: AtomicBool,
    pub reject_payments: AtomicBool,
    /// Transfers for these escrows fail regardless of `fail_transfers`.
    pub failing_escrows: Mutex<Vec<Uuid>>,
}

impl MockGateway {
    pub fn transfer_count(&self) -> usize {
        self.transfers.lock().unwrap().len()
    }

    pub fn refund_count(&self) -> usize {
        self.refunds.lock().unwrap().len()
    }

    pub fn fail_transfers(&self, fail: bool) {
        self.fail_transfers.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_order(&self, request: &OrderRequest) -> Result<FundingOrder, GatewayError> {
        let n = self.orders.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FundingOrder {
            order_id: format!("ord_{}_{}", request.milestone_id.simple(), n),
            authorization_url: Some("https://checkout.test/pay".to_string()),
        })
    }

    async fn verify_payment(&self, _proof: &PaymentProof, _expected: &BigDecimal) -> Result<bool, GatewayError> {
        Ok(!self.reject_payments.load(Ordering::SeqCst))
    }

    async fn transfer_to_freelancer(&self, request: &TransferRequest) -> Result<String, GatewayError> {
        // Yield so concurrent callers interleave around the gateway call.
        tokio::task::yield_now().await;
        if self.fail_transfers.load(Ordering::SeqCst)
            || self.failing_escrows.lock().unwrap().contains(&request.escrow_id)
        {
            return Err(GatewayError::TransferFailed("provider unavailable".to_string()));
        }
        let mut transfers = self.transfers.lock().unwrap();
        transfers.push(request.clone());
        Ok(format!("TRF_{}", transfers.len()))
    }

    async fn refund_to_client(&self, request: &RefundRequest) -> Result<String, GatewayError> {
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected("refund window closed".to_string()));
        }
        let mut refunds = self.refunds.lock().unwrap();
        refunds.push(request.clone());
        Ok(format!("RFD_{}", refunds.len()))
    }
}

pub struct Harness {
    pub service: Arc<EscrowService>,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<MockGateway>,
}

pub fn harness() -> Harness {
    let store = Arc::new(MemoryStore::default());
    let gateway = Arc::new(MockGateway::default());
    let service = Arc::new(EscrowService::new(
        store.clone(),
        gateway.clone(),
        Arc::new(PercentageFeePolicy::new(500)),
    ));

    Harness { service, store, gateway }
}
