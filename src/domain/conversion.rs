use crate::domain::money::Amount;
use crate::error::RailError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionDirection {
    /// Off-ramp.
    StablecoinToFiat,
    /// On-ramp.
    FiatToStablecoin,
}

impl fmt::Display for ConversionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StablecoinToFiat => f.write_str("stablecoin_to_fiat"),
            Self::FiatToStablecoin => f.write_str("fiat_to_stablecoin"),
        }
    }
}

/// Provider-agnostic conversion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for ConversionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionRequest {
    pub direction: ConversionDirection,
    pub source_amount: Amount,
    pub source_currency: String,
    pub destination_currency: String,
    /// One key maps to at most one transfer created at the provider.
    pub idempotency_key: String,
}

impl ConversionRequest {
    pub fn validate(&self) -> Result<(), RailError> {
        if self.idempotency_key.trim().is_empty() {
            return Err(RailError::Validation(
                "idempotency key is required".to_string(),
            ));
        }
        if self.source_currency.is_empty() || self.destination_currency.is_empty() {
            return Err(RailError::Validation(
                "source and destination currencies are required".to_string(),
            ));
        }
        if self.source_currency.eq_ignore_ascii_case(&self.destination_currency) {
            return Err(RailError::Validation(format!(
                "cannot convert {} into itself",
                self.source_currency
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionResponse {
    pub provider_tx_id: String,
    pub direction: ConversionDirection,
    pub status: ConversionStatus,
    pub source_amount: Decimal,
    /// Unknown until the provider settles.
    pub destination_amount: Option<Decimal>,
    pub exchange_rate: Option<Decimal>,
    pub fees: Option<Decimal>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeEstimate {
    pub total_fee: Decimal,
    pub network_fee: Option<Decimal>,
    pub provider_fee: Option<Decimal>,
    pub estimated_rate: Decimal,
    pub estimated_output: Decimal,
}
