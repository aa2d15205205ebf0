use crate::domain::limits::{
    self, KycTier, LimitCheckResult, LimitConfig, TransferKind, UserLimits,
    UserTransactionUsage,
};
use crate::domain::money::Amount;
use crate::domain::ports::{UsageRepositoryRef, UserRepositoryRef};
use crate::error::{RailError, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Owns every mutation of a user's quota counters.
///
/// Counters only move through the repository's atomic increment and reset
/// operations; nothing here reads a snapshot, edits it and writes it back.
pub struct UsageLedger {
    usage: UsageRepositoryRef,
}

impl UsageLedger {
    pub fn new(usage: UsageRepositoryRef) -> Self {
        Self { usage }
    }

    /// Resets expired periods and returns the post-reset counters.
    pub async fn current(&self, user_id: Uuid) -> Result<UserTransactionUsage> {
        self.usage
            .reset_expired_periods(user_id, Utc::now())
            .await
            .inspect_err(|e| {
                warn!(user_id = %user_id, error = %e, "failed to reset expired usage periods")
            })
    }

    pub async fn record_deposit(&self, user_id: Uuid, amount: Amount) -> Result<()> {
        self.usage
            .increment_deposit_usage(user_id, amount.value(), Utc::now())
            .await?;
        debug!(user_id = %user_id, amount = %amount, "deposit usage recorded");
        Ok(())
    }

    /// Counts a funded deposit against the user's quota at most once.
    ///
    /// Returns false when `deposit_id` had already been counted.
    pub async fn record_funded_deposit(
        &self,
        user_id: Uuid,
        deposit_id: Uuid,
        amount: Amount,
    ) -> Result<bool> {
        let applied = self
            .usage
            .apply_deposit_usage(user_id, deposit_id, amount.value(), Utc::now())
            .await?;
        if applied {
            debug!(user_id = %user_id, %deposit_id, amount = %amount, "deposit usage recorded");
        } else {
            debug!(user_id = %user_id, %deposit_id, "deposit usage already recorded");
        }
        Ok(applied)
    }

    pub async fn record_withdrawal(&self, user_id: Uuid, amount: Amount) -> Result<()> {
        self.usage
            .increment_withdrawal_usage(user_id, amount.value(), Utc::now())
            .await?;
        debug!(user_id = %user_id, amount = %amount, "withdrawal usage recorded");
        Ok(())
    }
}

/// Validates proposed amounts against the user's tier limits and usage.
///
/// Validation never consumes quota. Usage is recorded separately, once the
/// external transfer is confirmed, so two concurrent validations for the same
/// user can both pass before either is recorded.
pub struct LimitGate {
    users: UserRepositoryRef,
    ledger: Arc<UsageLedger>,
}

impl LimitGate {
    pub fn new(users: UserRepositoryRef, ledger: Arc<UsageLedger>) -> Self {
        Self { users, ledger }
    }

    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    pub async fn validate_deposit(&self, user_id: Uuid, amount: Decimal) -> Result<LimitCheckResult> {
        self.validate(TransferKind::Deposit, user_id, amount).await
    }

    pub async fn validate_withdrawal(
        &self,
        user_id: Uuid,
        amount: Decimal,
    ) -> Result<LimitCheckResult> {
        self.validate(TransferKind::Withdrawal, user_id, amount).await
    }

    pub async fn record_deposit(&self, user_id: Uuid, amount: Amount) -> Result<()> {
        self.ledger.record_deposit(user_id, amount).await
    }

    pub async fn record_withdrawal(&self, user_id: Uuid, amount: Amount) -> Result<()> {
        self.ledger.record_withdrawal(user_id, amount).await
    }

    /// Current limits, usage and reset instants for both directions.
    pub async fn user_limits(&self, user_id: Uuid) -> Result<UserLimits> {
        let config = LimitConfig::for_tier(self.tier(user_id).await?);
        let usage = self.ledger.current(user_id).await?;
        Ok(UserLimits::from_usage(&config, &usage))
    }

    async fn validate(
        &self,
        kind: TransferKind,
        user_id: Uuid,
        amount: Decimal,
    ) -> Result<LimitCheckResult> {
        let config = LimitConfig::for_tier(self.tier(user_id).await?);

        // Rejected before the usage counters are read or reset.
        limits::check_minimum(&config, kind, amount)?;

        let usage = self.ledger.current(user_id).await?;
        let result = limits::evaluate(&config, &usage, kind, amount);
        if let Err(RailError::Limit { violation, check }) = &result {
            debug!(
                user_id = %user_id,
                kind = %kind,
                %violation,
                remaining = %check.remaining_capacity,
                "limit check denied"
            );
        }
        result
    }

    async fn tier(&self, user_id: Uuid) -> Result<KycTier> {
        let user = self
            .users
            .get_by_id(user_id)
            .await?
            .ok_or_else(|| RailError::not_found("user", user_id))?;
        Ok(user.tier())
    }
}
