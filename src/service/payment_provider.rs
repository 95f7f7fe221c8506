// service/payment_provider.rs
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha512;
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

use crate::{config::Config, utils::currency::to_minor_units};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway rejected the request: {0}")]
    Rejected(String),

    #[error("{0}")]
    TransferFailed(String),

    #[error("unexpected gateway response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub milestone_id: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
    pub customer_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FundingOrder {
    pub order_id: String,
    pub authorization_url: Option<String>,
}

/// The order a payment is claimed against. Only the gateway's transaction
/// lookup decides whether it was paid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentProof {
    pub order_id: String,
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub escrow_id: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
    pub recipient: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub escrow_id: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
    pub payment_reference: String,
}

/// Boundary to the payment provider. Every call is fallible I/O; callers
/// must not persist anything until the call has returned `Ok`.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(&self, request: &OrderRequest) -> Result<FundingOrder, GatewayError>;

    async fn verify_payment(
        &self,
        proof: &PaymentProof,
        expected_amount: &BigDecimal,
    ) -> Result<bool, GatewayError>;

    async fn transfer_to_freelancer(&self, request: &TransferRequest) -> Result<String, GatewayError>;

    async fn refund_to_client(&self, request: &RefundRequest) -> Result<String, GatewayError>;
}

pub struct PaystackGateway {
    client: reqwest::Client,
    secret_key: String,
    base_url: String,
}

impl PaystackGateway {
    pub fn new(config: &Config) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.gateway_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            secret_key: config.paystack_secret_key.clone(),
            base_url: config.paystack_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn amount_in_minor_units(amount: &BigDecimal) -> Result<i64, GatewayError> {
        to_minor_units(amount).map_err(GatewayError::Rejected)
    }

    async fn post(&self, path: &str, payload: &Value) -> Result<Value, GatewayError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Bearer {}", self.secret_key))
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await?;

        Ok(response.json().await?)
    }

    async fn get(&self, path: &str) -> Result<Value, GatewayError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Bearer {}", self.secret_key))
            .send()
            .await?;

        Ok(response.json().await?)
    }
}

fn paystack_ok(body: &Value) -> bool {
    body["status"].as_bool().unwrap_or(false)
}

fn paystack_message(body: &Value, fallback: &str) -> String {
    body["message"].as_str().unwrap_or(fallback).to_string()
}

/// Transfer references are derived from the escrow so a replayed payout is
/// deduplicated by the provider.
pub fn payout_reference(escrow_id: Uuid, kind: &str) -> String {
    format!("escrow-{}-{}", escrow_id.simple(), kind)
}

/// Hex HMAC-SHA512 of a webhook body under the merchant secret, as Paystack
/// sends it in `x-paystack-signature`.
pub fn sign_webhook(payload: &[u8], secret: &str) -> Result<String, GatewayError> {
    let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::Rejected(e.to_string()))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checked against the raw bytes; re-serialized JSON would not match.
pub fn verify_webhook_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    match sign_webhook(payload, secret) {
        // Compare signatures in constant time to prevent timing attacks
        Ok(expected) => ConstantTimeEq::ct_eq(signature.as_bytes(), expected.as_bytes()).into(),
        Err(_) => false,
    }
}

#[async_trait]
impl PaymentGateway for PaystackGateway {
    async fn create_order(&self, request: &OrderRequest) -> Result<FundingOrder, GatewayError> {
        let email = request
            .customer_email
            .as_deref()
            .ok_or_else(|| GatewayError::Rejected("customer email is required".to_string()))?;

        let reference = format!("ms-{}-{}", request.milestone_id.simple(), Uuid::new_v4().simple());
        let payload = serde_json::json!({
            "email": email,
            "amount": Self::amount_in_minor_units(&request.amount)?,
            "reference": reference,
            "currency": request.currency,
            "metadata": { "milestone_id": request.milestone_id },
        });

        let body = self.post("/transaction/initialize", &payload).await?;
        if !paystack_ok(&body) {
            return Err(GatewayError::Rejected(paystack_message(&body, "Payment initialization failed")));
        }

        let data = &body["data"];
        let order_id = data["reference"]
            .as_str()
            .ok_or_else(|| GatewayError::InvalidResponse("missing reference".to_string()))?
            .to_string();

        Ok(FundingOrder {
            order_id,
            authorization_url: data["authorization_url"].as_str().map(str::to_string),
        })
    }

    async fn verify_payment(
        &self,
        proof: &PaymentProof,
        expected_amount: &BigDecimal,
    ) -> Result<bool, GatewayError> {
        let body = self.get(&format!("/transaction/verify/{}", proof.order_id)).await?;
        if !paystack_ok(&body) {
            return Err(GatewayError::Rejected(paystack_message(&body, "Payment verification failed")));
        }

        let data = &body["data"];
        let paid = data["status"].as_str() == Some("success");
        let amount_matches =
            data["amount"].as_i64() == Some(Self::amount_in_minor_units(expected_amount)?);

        if paid && !amount_matches {
            tracing::warn!(
                "Order {} paid {:?} minor units, expected {}",
                proof.order_id,
                data["amount"].as_i64(),
                expected_amount
            );
        }

        Ok(paid && amount_matches)
    }

    async fn transfer_to_freelancer(&self, request: &TransferRequest) -> Result<String, GatewayError> {
        let recipient = request.recipient.as_deref().ok_or_else(|| {
            GatewayError::TransferFailed(format!("escrow {} has no payout recipient", request.escrow_id))
        })?;

        let payload = serde_json::json!({
            "source": "balance",
            "amount": Self::amount_in_minor_units(&request.amount)?,
            "currency": request.currency,
            "recipient": recipient,
            "reason": request.reason,
            "reference": payout_reference(request.escrow_id, "transfer"),
        });

        let body = self
            .post("/transfer", &payload)
            .await
            .map_err(|e| GatewayError::TransferFailed(e.to_string()))?;

        if !paystack_ok(&body) {
            return Err(GatewayError::TransferFailed(paystack_message(&body, "Transfer failed")));
        }

        body["data"]["transfer_code"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| GatewayError::InvalidResponse("missing transfer_code".to_string()))
    }

    async fn refund_to_client(&self, request: &RefundRequest) -> Result<String, GatewayError> {
        let payload = serde_json::json!({
            "transaction": request.payment_reference,
            "amount": Self::amount_in_minor_units(&request.amount)?,
            "currency": request.currency,
            "merchant_note": format!("Escrow {} refund", request.escrow_id),
        });

        let body = self.post("/refund", &payload).await?;
        if !paystack_ok(&body) {
            return Err(GatewayError::Rejected(paystack_message(&body, "Refund failed")));
        }

        body["data"]["id"]
            .as_i64()
            .map(|id| id.to_string())
            .or_else(|| body["data"]["id"].as_str().map(str::to_string))
            .ok_or_else(|| GatewayError::InvalidResponse("missing refund id".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_signature_covers_raw_body() {
        let body = br#"{"event":"charge.success","data":{"reference":"ms-abc"}}"#;
        let signature = sign_webhook(body, "sk_test").unwrap();
        assert_eq!(signature.len(), 128);
        assert!(verify_webhook_signature(body, &signature, "sk_test"));
        assert!(!verify_webhook_signature(body, &signature, "sk_live"));

        let spaced = br#"{"event": "charge.success","data":{"reference":"ms-abc"}}"#;
        assert!(!verify_webhook_signature(spaced, &signature, "sk_test"));
        assert!(!verify_webhook_signature(body, "", "sk_test"));
    }

    #[test]
    fn payout_reference_is_stable_per_escrow() {
        let id = Uuid::new_v4();
        assert_eq!(payout_reference(id, "transfer"), payout_reference(id, "transfer"));
        assert_ne!(payout_reference(id, "transfer"), payout_reference(id, "refund"));
    }

    #[test]
    fn paystack_envelope_helpers() {
        let ok = serde_json::json!({ "status": true, "message": "Transfer queued" });
        let failed = serde_json::json!({ "status": false });
        assert!(paystack_ok(&ok));
        assert!(!paystack_ok(&failed));
        assert_eq!(paystack_message(&failed, "Transfer failed"), "Transfer failed");
    }
}
