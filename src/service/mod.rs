pub mod auto_release;
pub mod background_jobs;
pub mod error;
pub mod escrow_machine;
pub mod escrow_service;
pub mod fee_policy;
pub mod notification_service;
pub mod pair_lock;
pub mod payment_provider;
#[cfg(test)]
pub mod test_support;
