use bigdecimal::BigDecimal;

use crate::{
    models::escrowmodel::FeeQuote,
    utils::currency::{basis_points_of, round2},
};

/// Platform fee rule applied when an escrow is opened for a milestone.
pub trait FeePolicy: Send + Sync {
    fn quote(&self, milestone_amount: &BigDecimal) -> FeeQuote;
}

/// Flat percentage (in basis points) charged to the client on top of the
/// milestone amount and withheld from the freelancer's payout.
#[derive(Debug, Clone, Copy)]
pub struct PercentageFeePolicy {
    pub bps: u32,
}

impl PercentageFeePolicy {
    pub fn new(bps: u32) -> Self {
        Self { bps }
    }
}

impl FeePolicy for PercentageFeePolicy {
    fn quote(&self, milestone_amount: &BigDecimal) -> FeeQuote {
        let amount = round2(milestone_amount);
        let service_charge = basis_points_of(&amount, self.bps);

        FeeQuote {
            total_amount: &amount + &service_charge,
            amount_to_freelancer: &amount - &service_charge,
            service_charge,
        }
    }
}
