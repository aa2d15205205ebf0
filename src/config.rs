//! Runtime settings.
//!
//! Every field has a default so an empty JSON object (or no file at all) is a
//! valid configuration. The CLI layers flag/env overrides on top.

use crate::domain::conversion::ConversionDirection;
use crate::error::{RailError, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub name: String,
    pub provider_type: String,
    pub supports_offramp: bool,
    pub supports_onramp: bool,
    pub min_amount: Decimal,
    pub max_amount: Option<Decimal>,
    pub fee_rate: Decimal,
    pub list_page_size: usize,
    /// Treasury-side account the rail debits for outbound transfers.
    pub sender_id: String,
    /// Treasury-side account the rail credits for outbound transfers.
    pub recipient_id: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: "sandbox-rail".to_string(),
            provider_type: "rail".to_string(),
            supports_offramp: true,
            supports_onramp: true,
            min_amount: dec!(1),
            max_amount: None,
            fee_rate: dec!(0.005),
            list_page_size: 100,
            sender_id: "treasury-sender".to_string(),
            recipient_id: "treasury-recipient".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SagaSettings {
    pub direction: ConversionDirection,
    pub source_currency: String,
    pub destination_currency: String,
    /// Age after which a deposit still in `created` is resumed by the sweep.
    pub stale_after_secs: u64,
}

impl Default for SagaSettings {
    fn default() -> Self {
        Self {
            direction: ConversionDirection::StablecoinToFiat,
            source_currency: "USDC".to_string(),
            destination_currency: "USD".to_string(),
            stale_after_secs: 900,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub retry: RetrySettings,
    pub provider: ProviderSettings,
    pub saga: SagaSettings,
    pub webhook_secret: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            provider: ProviderSettings::default(),
            saga: SagaSettings::default(),
            webhook_secret: "sandbox-webhook-secret".to_string(),
        }
    }
}

impl Settings {
    /// Reads settings from a JSON file. Missing fields keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&raw)?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(RailError::Validation(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(RailError::Validation(
                "retry.multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(RailError::Validation(
                "retry.max_delay_ms must be >= retry.base_delay_ms".to_string(),
            ));
        }
        if self.provider.fee_rate < Decimal::ZERO || self.provider.fee_rate >= Decimal::ONE {
            return Err(RailError::Validation(
                "provider.fee_rate must be in [0, 1)".to_string(),
            ));
        }
        if let Some(max) = self.provider.max_amount
            && max < self.provider.min_amount
        {
            return Err(RailError::Validation(
                "provider.max_amount must be >= provider.min_amount".to_string(),
            ));
        }
        if self.provider.list_page_size == 0 {
            return Err(RailError::Validation(
                "provider.list_page_size must be positive".to_string(),
            ));
        }
        if self.webhook_secret.is_empty() {
            return Err(RailError::Validation(
                "webhook_secret must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.retry.base_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{ "retry": {{ "max_attempts": 5 }}, "webhook_secret": "s3cret" }}"#
        )
        .unwrap();

        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.retry.base_delay_ms, 500);
        assert_eq!(settings.webhook_secret, "s3cret");
        assert_eq!(settings.saga.direction, ConversionDirection::StablecoinToFiat);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut settings = Settings::default();
        settings.retry.max_attempts = 0;
        assert!(matches!(settings.validate(), Err(RailError::Validation(_))));

        let mut settings = Settings::default();
        settings.webhook_secret.clear();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.provider.max_amount = Some(Decimal::ZERO);
        assert!(settings.validate().is_err());
    }
}
