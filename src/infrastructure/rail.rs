//! Conversion provider adapter over a vendor transfer API.
//!
//! The vendor exposes transfers, not conversions: a conversion is a transfer
//! between two treasury accounts in different currencies. Status is looked up
//! by listing recent transfers and matching on id, since the API has no
//! get-by-id endpoint.

use crate::config::ProviderSettings;
use crate::domain::conversion::{
    ConversionDirection, ConversionRequest, ConversionResponse, ConversionStatus, FeeEstimate,
};
use crate::domain::ports::ConversionProvider;
use crate::error::{RailError, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Transfer states reported by the vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    PaymentProcessed,
    Completed,
    Failed,
    /// Any value this adapter does not know about.
    #[serde(other)]
    Unknown,
}

impl TransferState {
    /// Fixed vendor-to-unified mapping. Unknown values fail closed.
    pub fn to_conversion_status(self) -> ConversionStatus {
        match self {
            Self::Pending => ConversionStatus::Pending,
            Self::PaymentProcessed => ConversionStatus::Processing,
            Self::Completed => ConversionStatus::Completed,
            Self::Failed | Self::Unknown => ConversionStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferLeg {
    pub amount: Option<Decimal>,
    pub currency: String,
    pub fee: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransferRequest {
    pub source_id: String,
    pub destination_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub destination_currency: String,
    /// Forwarded as the vendor's idempotency key.
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: String,
    pub status: TransferState,
    pub source: TransferLeg,
    pub destination: TransferLeg,
    pub fx_rate: Option<Decimal>,
    pub reference: String,
}

/// Transport-level failures of the vendor API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RailApiError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
}

impl RailApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
        }
    }
}

impl From<RailApiError> for RailError {
    fn from(err: RailApiError) -> Self {
        if err.is_retryable() {
            RailError::RetryableProvider(err.to_string())
        } else {
            RailError::NonRetryableProvider(err.to_string())
        }
    }
}

/// The two vendor endpoints this adapter needs.
#[async_trait]
pub trait RailClient: Send + Sync {
    async fn create_transfer(
        &self,
        request: &CreateTransferRequest,
    ) -> std::result::Result<Transfer, RailApiError>;
    /// Most recent transfers first, skipping the newest `offset`.
    async fn list_transfers(
        &self,
        limit: usize,
        offset: usize,
    ) -> std::result::Result<Vec<Transfer>, RailApiError>;
}

pub type RailClientRef = Arc<dyn RailClient>;

pub struct RailConversionProvider {
    client: RailClientRef,
    settings: ProviderSettings,
}

impl RailConversionProvider {
    pub fn new(client: RailClientRef, settings: ProviderSettings) -> Self {
        Self { client, settings }
    }

    fn transfer_request(&self, request: &ConversionRequest) -> CreateTransferRequest {
        // Off-ramp debits the treasury's stablecoin wallet and credits its
        // fiat account; on-ramp is the mirror image.
        let (source_id, destination_id) = match request.direction {
            ConversionDirection::StablecoinToFiat => {
                (&self.settings.sender_id, &self.settings.recipient_id)
            }
            ConversionDirection::FiatToStablecoin => {
                (&self.settings.recipient_id, &self.settings.sender_id)
            }
        };
        CreateTransferRequest {
            source_id: source_id.clone(),
            destination_id: destination_id.clone(),
            amount: request.source_amount.value(),
            currency: request.source_currency.clone(),
            destination_currency: request.destination_currency.clone(),
            reference: request.idempotency_key.clone(),
        }
    }

    fn response(&self, transfer: &Transfer, direction: ConversionDirection) -> ConversionResponse {
        let status = transfer.status.to_conversion_status();
        ConversionResponse {
            provider_tx_id: transfer.id.clone(),
            direction,
            status,
            source_amount: transfer.source.amount.unwrap_or_default(),
            destination_amount: transfer.destination.amount,
            exchange_rate: transfer.fx_rate.filter(|rate| *rate > Decimal::ZERO),
            fees: transfer.source.fee,
            failure_reason: (status == ConversionStatus::Failed)
                .then(|| format!("transfer reported as {:?}", transfer.status)),
        }
    }

    fn direction_of(transfer: &Transfer, fallback: ConversionDirection) -> ConversionDirection {
        match transfer.destination.currency.as_str() {
            "USD" | "EUR" | "GBP" => ConversionDirection::StablecoinToFiat,
            "USDC" | "USDT" | "EURC" => ConversionDirection::FiatToStablecoin,
            _ => fallback,
        }
    }
}

#[async_trait]
impl ConversionProvider for RailConversionProvider {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn provider_type(&self) -> &str {
        &self.settings.provider_type
    }

    async fn initiate_conversion(&self, request: &ConversionRequest) -> Result<ConversionResponse> {
        request.validate()?;
        self.validate_amount(request.source_amount.value(), request.direction)?;

        info!(
            provider = %self.settings.name,
            direction = %request.direction,
            amount = %request.source_amount,
            idempotency_key = %request.idempotency_key,
            "initiating conversion"
        );

        let transfer = self
            .client
            .create_transfer(&self.transfer_request(request))
            .await
            .inspect_err(|e| warn!(error = %e, "failed to create transfer"))?;

        info!(provider_tx_id = %transfer.id, status = ?transfer.status, "conversion initiated");
        Ok(self.response(&transfer, request.direction))
    }

    async fn get_conversion_status(&self, provider_tx_id: &str) -> Result<ConversionResponse> {
        debug!(provider_tx_id, "checking conversion status");
        let page_size = self.settings.list_page_size;
        let mut offset = 0;
        // New transfers push older ones to higher offsets, so paging never skips one.
        loop {
            let page = self.client.list_transfers(page_size, offset).await?;
            if let Some(transfer) = page.iter().find(|t| t.id == provider_tx_id) {
                let direction =
                    Self::direction_of(transfer, ConversionDirection::StablecoinToFiat);
                return Ok(self.response(transfer, direction));
            }
            offset += page.len();
            if page.len() < page_size {
                break;
            }
            debug!(provider_tx_id, offset, "transfer not on this page, fetching next");
        }

        warn!(provider_tx_id, scanned = offset, "provider transaction not found in transfer history");
        Err(RailError::not_found("provider transaction", provider_tx_id))
    }

    async fn cancel_conversion(&self, provider_tx_id: &str) -> Result<()> {
        info!(provider_tx_id, "conversion cancellation requested");
        Err(RailError::NonRetryableProvider(format!(
            "conversion cancellation is not supported by {}",
            self.settings.name
        )))
    }

    fn supports_direction(&self, direction: ConversionDirection) -> bool {
        match direction {
            ConversionDirection::StablecoinToFiat => self.settings.supports_offramp,
            ConversionDirection::FiatToStablecoin => self.settings.supports_onramp,
        }
    }

    fn validate_amount(&self, amount: Decimal, direction: ConversionDirection) -> Result<()> {
        if !self.supports_direction(direction) {
            return Err(RailError::NonRetryableProvider(format!(
                "direction not supported: {direction}"
            )));
        }
        if amount < self.settings.min_amount {
            return Err(RailError::Validation(format!(
                "amount {amount} is below minimum {}",
                self.settings.min_amount
            )));
        }
        if let Some(max) = self.settings.max_amount
            && amount > max
        {
            return Err(RailError::Validation(format!(
                "amount {amount} exceeds maximum {max}"
            )));
        }
        Ok(())
    }

    /// Flat-rate estimate at a 1:1 rate. The vendor only prices through
    /// quotes, which this adapter does not request.
    fn estimate_fees(&self, amount: Decimal, direction: ConversionDirection) -> Result<FeeEstimate> {
        if amount <= Decimal::ZERO {
            return Err(RailError::Validation(format!(
                "amount must be positive, got {amount}"
            )));
        }
        if !self.supports_direction(direction) {
            return Err(RailError::NonRetryableProvider(format!(
                "direction not supported: {direction}"
            )));
        }
        let total_fee = amount * self.settings.fee_rate;
        Ok(FeeEstimate {
            total_fee,
            network_fee: None,
            provider_fee: Some(total_fee),
            estimated_rate: Decimal::ONE,
            estimated_output: amount - total_fee,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Amount;
    use crate::infrastructure::sandbox::SandboxRailClient;
    use rust_decimal_macros::dec;

    fn request(key: &str, amount: Decimal) -> ConversionRequest {
        ConversionRequest {
            direction: ConversionDirection::StablecoinToFiat,
            source_amount: Amount::new(amount).unwrap(),
            source_currency: "USDC".to_string(),
            destination_currency: "USD".to_string(),
            idempotency_key: key.to_string(),
        }
    }

    fn provider(client: &SandboxRailClient) -> RailConversionProvider {
        RailConversionProvider::new(Arc::new(client.clone()), ProviderSettings::default())
    }

    #[test]
    fn test_status_mapping_fails_closed() {
        assert_eq!(
            TransferState::PaymentProcessed.to_conversion_status(),
            ConversionStatus::Processing
        );
        let unknown: TransferState = serde_json::from_str("\"awaiting_funds\"").unwrap();
        assert_eq!(unknown, TransferState::Unknown);
        assert_eq!(unknown.to_conversion_status(), ConversionStatus::Failed);
    }

    #[test]
    fn test_api_error_classification() {
        let retryable = [
            RailApiError::Timeout,
            RailApiError::Network("reset".into()),
            RailApiError::Http { status: 502, message: "bad gateway".into() },
            RailApiError::Http { status: 429, message: "slow down".into() },
        ];
        for err in retryable {
            assert!(RailError::from(err).is_retryable());
        }
        let err = RailError::from(RailApiError::Http {
            status: 400,
            message: "bad request".into(),
        });
        assert!(matches!(err, RailError::NonRetryableProvider(_)));
    }

    #[tokio::test]
    async fn test_initiate_returns_pending_correlation_id() {
        let client = SandboxRailClient::new();
        let provider = provider(&client);

        let resp = provider
            .initiate_conversion(&request("dep-1", dec!(250)))
            .await
            .unwrap();
        assert_eq!(resp.status, ConversionStatus::Pending);
        assert_eq!(resp.source_amount, dec!(250));
        assert!(resp.destination_amount.is_none());

        let status = provider.get_conversion_status(&resp.provider_tx_id).await.unwrap();
        assert_eq!(status.provider_tx_id, resp.provider_tx_id);
        assert_eq!(status.status, ConversionStatus::Pending);
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_client() {
        let client = SandboxRailClient::new();
        let provider = provider(&client);

        let err = provider
            .initiate_conversion(&request("", dec!(10)))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());

        let err = provider
            .initiate_conversion(&request("dep-2", dec!(0.5)))
            .await
            .unwrap_err();
        assert!(matches!(err, RailError::Validation(_)));
        assert_eq!(client.create_calls().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_transfer_is_not_found() {
        let client = SandboxRailClient::new();
        let err = provider(&client)
            .get_conversion_status("tr_missing")
            .await
            .unwrap_err();
        assert!(matches!(err, RailError::NotFound { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_status_lookup_pages_past_recent_transfers() {
        let client = SandboxRailClient::new();
        let settings = ProviderSettings {
            list_page_size: 2,
            ..ProviderSettings::default()
        };
        let provider = RailConversionProvider::new(Arc::new(client.clone()), settings);

        let oldest = provider
            .initiate_conversion(&request("dep-old", dec!(10)))
            .await
            .unwrap();
        for i in 0..4 {
            provider
                .initiate_conversion(&request(&format!("dep-{i}"), dec!(10)))
                .await
                .unwrap();
        }

        let status = provider.get_conversion_status(&oldest.provider_tx_id).await.unwrap();
        assert_eq!(status.provider_tx_id, oldest.provider_tx_id);
        assert_eq!(client.list_calls().await, 3);

        let err = provider.get_conversion_status("tr_missing").await.unwrap_err();
        assert!(matches!(err, RailError::NotFound { .. }));
        // Five transfers in pages of two: the third page is short and ends the scan.
        assert_eq!(client.list_calls().await, 6);
    }

    #[tokio::test]
    async fn test_completed_transfer_reports_settlement() {
        let client = SandboxRailClient::new().with_fee_rate(dec!(0.01));
        let provider = provider(&client);
        let resp = provider
            .initiate_conversion(&request("dep-3", dec!(100)))
            .await
            .unwrap();

        client.complete(&resp.provider_tx_id).await.unwrap();

        let status = provider.get_conversion_status(&resp.provider_tx_id).await.unwrap();
        assert_eq!(status.status, ConversionStatus::Completed);
        assert_eq!(status.destination_amount, Some(dec!(99.00)));
        assert_eq!(status.fees, Some(dec!(1.00)));
        assert_eq!(status.exchange_rate, Some(Decimal::ONE));
    }

    #[tokio::test]
    async fn test_cancel_is_never_retryable() {
        let client = SandboxRailClient::new();
        let err = provider(&client).cancel_conversion("tr_1").await.unwrap_err();
        assert!(matches!(err, RailError::NonRetryableProvider(_)));
    }

    #[test]
    fn test_fee_estimate_and_amount_bounds() {
        let settings = ProviderSettings {
            max_amount: Some(dec!(1000)),
            supports_onramp: false,
            ..ProviderSettings::default()
        };
        let provider = RailConversionProvider::new(Arc::new(SandboxRailClient::new()), settings);

        let estimate = provider
            .estimate_fees(dec!(200), ConversionDirection::StablecoinToFiat)
            .unwrap();
        assert_eq!(estimate.total_fee, dec!(1.000));
        assert_eq!(estimate.estimated_output, dec!(199.000));
        assert_eq!(estimate.estimated_rate, Decimal::ONE);

        assert!(provider
            .validate_amount(dec!(1000), ConversionDirection::StablecoinToFiat)
            .is_ok());
        assert!(provider
            .validate_amount(dec!(1000.01), ConversionDirection::StablecoinToFiat)
            .is_err());
        assert!(matches!(
            provider.validate_amount(dec!(10), ConversionDirection::FiatToStablecoin),
            Err(RailError::NonRetryableProvider(_))
        ));
    }
}
