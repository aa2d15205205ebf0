//! Inbound rail webhooks.
//!
//! The signature is checked against the raw body before anything is parsed,
//! so a forged delivery can never reach the saga.

use crate::application::saga::{CallbackOutcome, ConversionSaga};
use crate::domain::deposit::DepositStatus;
use crate::domain::money::Amount;
use crate::error::{RailError, Result};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const TRANSFER_EVENT_PREFIX: &str = "transfer.";
const DEPOSIT_RECEIVED: &str = "deposit.received";
const DEPOSIT_CONFIRMED: &str = "deposit.confirmed";

/// HMAC-SHA256 over the raw body with a shared secret, hex encoded.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Vec<u8>,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(RailError::Validation(
                "webhook secret must not be empty".to_string(),
            ));
        }
        Ok(Self {
            secret: secret.into_bytes(),
        })
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| RailError::Validation(format!("invalid webhook secret: {e}")))
    }

    /// Hex signature the sender is expected to attach to `body`.
    pub fn sign(&self, body: &[u8]) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time check of `signature` against `body`.
    pub fn verify(&self, body: &[u8], signature: &str) -> Result<()> {
        let provided = hex::decode(signature.trim()).map_err(|_| RailError::SignatureInvalid)?;
        let mut mac = self.mac()?;
        mac.update(body);
        mac.verify_slice(&provided)
            .map_err(|_| RailError::SignatureInvalid)
    }
}

/// Envelope shared by every vendor event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub data: serde_json::Value,
}

/// Payload of `transfer.*` events. Only `id` is trusted; the saga re-reads
/// the authoritative status from the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEventData {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub source_amount: Option<Decimal>,
    #[serde(default)]
    pub dest_amount: Option<Decimal>,
    #[serde(default)]
    pub fx_rate: Option<Decimal>,
}

/// Payload of `deposit.received` and `deposit.confirmed`: funds landed on a
/// user's virtual account. `tx_ref` becomes the deposit reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositEventData {
    pub virtual_account_id: String,
    pub amount: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    pub tx_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed(CallbackOutcome),
    /// A deposit event started a conversion.
    DepositStarted {
        deposit_id: Uuid,
        status: DepositStatus,
    },
    /// A deposit event whose `tx_ref` already has a deposit.
    DuplicateDeposit { reference: String },
    /// Acknowledged without any state change.
    Ignored { event_type: String },
}

pub struct WebhookProcessor {
    verifier: WebhookVerifier,
    saga: Arc<ConversionSaga>,
}

impl WebhookProcessor {
    pub fn new(verifier: WebhookVerifier, saga: Arc<ConversionSaga>) -> Self {
        Self { verifier, saga }
    }

    /// Verifies, parses and routes one delivery.
    ///
    /// # Arguments
    ///
    /// * `raw_body` - The request body exactly as received.
    /// * `signature` - Hex HMAC from the signature header.
    pub async fn handle(&self, raw_body: &[u8], signature: &str) -> Result<WebhookOutcome> {
        if let Err(err) = self.verifier.verify(raw_body, signature) {
            warn!("rejected webhook with invalid signature");
            return Err(err);
        }

        let envelope: WebhookEnvelope = serde_json::from_slice(raw_body)?;
        info!(event_type = %envelope.event_type, "received webhook");

        match envelope.event_type.as_str() {
            t if t.starts_with(TRANSFER_EVENT_PREFIX) => self.on_transfer(envelope.data).await,
            DEPOSIT_RECEIVED | DEPOSIT_CONFIRMED => self.on_deposit(envelope.data).await,
            _ => {
                debug!(event_type = %envelope.event_type, "unhandled webhook event type");
                Ok(WebhookOutcome::Ignored {
                    event_type: envelope.event_type,
                })
            }
        }
    }

    async fn on_transfer(&self, data: serde_json::Value) -> Result<WebhookOutcome> {
        let data: TransferEventData = serde_json::from_value(data)?;
        debug!(
            provider_tx_id = %data.id,
            reported_status = data.status.as_deref().unwrap_or("unknown"),
            "routing transfer event"
        );
        let outcome = self.saga.handle_provider_callback(&data.id).await?;
        Ok(WebhookOutcome::Processed(outcome))
    }

    /// Both deposit events carry the same `tx_ref`, so whichever arrives
    /// second, like any redelivery, hits `DuplicateReference`.
    async fn on_deposit(&self, data: serde_json::Value) -> Result<WebhookOutcome> {
        let data: DepositEventData = serde_json::from_value(data)?;
        debug!(
            virtual_account_id = %data.virtual_account_id,
            tx_ref = %data.tx_ref,
            amount = %data.amount,
            "routing deposit event"
        );
        match self
            .saga
            .initiate_for_rail_account(&data.virtual_account_id, data.amount, &data.tx_ref)
            .await
        {
            Ok(deposit) => Ok(WebhookOutcome::DepositStarted {
                deposit_id: deposit.id,
                status: deposit.status,
            }),
            Err(RailError::DuplicateReference(reference)) => {
                debug!(%reference, "deposit event already handled");
                Ok(WebhookOutcome::DuplicateDeposit { reference })
            }
            Err(err) => Err(err),
        }
    }
}
