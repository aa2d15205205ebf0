use super::account::{UserProfile, VirtualAccount};
use super::conversion::{
    ConversionDirection, ConversionRequest, ConversionResponse, FeeEstimate,
};
use super::deposit::{Deposit, DepositStatus};
use super::limits::UserTransactionUsage;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait DepositRepository: Send + Sync {
    /// Inserts a new deposit. Fails with `DuplicateReference` when another
    /// deposit already owns the same reference.
    async fn create(&self, deposit: &Deposit) -> Result<()>;
    /// Compare-and-set: persists `deposit` only if the stored status still
    /// equals `expected`, otherwise fails with `StaleState`.
    async fn update(&self, deposit: &Deposit, expected: DepositStatus) -> Result<()>;
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Deposit>>;
    async fn get_by_provider_tx_id(&self, provider_tx_id: &str) -> Result<Option<Deposit>>;
    async fn list_by_user_id(&self, user_id: Uuid) -> Result<Vec<Deposit>>;
    async fn list_by_status(&self, status: DepositStatus) -> Result<Vec<Deposit>>;
}

#[async_trait]
pub trait VirtualAccountRepository: Send + Sync {
    async fn get_by_rail_account_id(&self, rail_account_id: &str)
    -> Result<Option<VirtualAccount>>;
    async fn get_by_id(&self, id: Uuid) -> Result<Option<VirtualAccount>>;
}

/// Storage for quota counters. Every mutation happens inside the store so
/// concurrent writers for one user never lose updates.
#[async_trait]
pub trait UsageRepository: Send + Sync {
    async fn get_or_create(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<UserTransactionUsage>;
    async fn increment_deposit_usage(
        &self,
        user_id: Uuid,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()>;
    async fn increment_withdrawal_usage(
        &self,
        user_id: Uuid,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()>;
    /// Adds a funded deposit to the deposit counters at most once per
    /// `deposit_id`. Returns false, changing nothing, when that deposit was
    /// already applied.
    async fn apply_deposit_usage(
        &self,
        user_id: Uuid,
        deposit_id: Uuid,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<bool>;
    /// Zeroes expired periods and returns the resulting snapshot in the same
    /// atomic step, so the caller evaluates against post-reset counters.
    async fn reset_expired_periods(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UserTransactionUsage>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<UserProfile>>;
}

/// Direction-aware facade over an external rail provider.
#[async_trait]
pub trait ConversionProvider: Send + Sync {
    fn name(&self) -> &str;
    fn provider_type(&self) -> &str;
    async fn initiate_conversion(&self, request: &ConversionRequest) -> Result<ConversionResponse>;
    async fn get_conversion_status(&self, provider_tx_id: &str) -> Result<ConversionResponse>;
    async fn cancel_conversion(&self, provider_tx_id: &str) -> Result<()>;
    fn supports_direction(&self, direction: ConversionDirection) -> bool;
    fn validate_amount(&self, amount: Decimal, direction: ConversionDirection) -> Result<()>;
    fn estimate_fees(&self, amount: Decimal, direction: ConversionDirection) -> Result<FeeEstimate>;
}

/// Funds a brokerage account once the rail leg has settled.
#[async_trait]
pub trait BrokerageFunding: Send + Sync {
    /// Returns the brokerage's reference for the funding transfer.
    ///
    /// Calls repeating an `idempotency_key` return the original reference
    /// and move no money.
    async fn initiate_funding(
        &self,
        idempotency_key: &str,
        brokerage_account_id: &str,
        amount: Decimal,
    ) -> Result<String>;
}

pub type DepositRepositoryRef = Arc<dyn DepositRepository>;
pub type VirtualAccountRepositoryRef = Arc<dyn VirtualAccountRepository>;
pub type UsageRepositoryRef = Arc<dyn UsageRepository>;
pub type UserRepositoryRef = Arc<dyn UserRepository>;
pub type ConversionProviderRef = Arc<dyn ConversionProvider>;
pub type BrokerageFundingRef = Arc<dyn BrokerageFunding>;
