use crate::error::RailError;
use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Verification level of a user, used to size transaction limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KycTier {
    Unverified,
    Basic,
    Advanced,
}

impl KycTier {
    /// Derives the tier from the raw KYC status string stored on the user.
    /// Anything that is not an explicit approval is treated as unverified.
    pub fn from_kyc_status(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "approved" | "verified" => Self::Basic,
            "advanced_approved" | "advanced_verified" => Self::Advanced,
            _ => Self::Unverified,
        }
    }
}

impl fmt::Display for KycTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unverified => "unverified",
            Self::Basic => "basic",
            Self::Advanced => "advanced",
        };
        f.write_str(name)
    }
}

/// Which side of the quota a movement of funds counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Deposit,
    Withdrawal,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deposit => f.write_str("deposit"),
            Self::Withdrawal => f.write_str("withdrawal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitType {
    Daily,
    Monthly,
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily => f.write_str("daily"),
            Self::Monthly => f.write_str("monthly"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitViolation {
    BelowMinimum,
    DailyExceeded,
    MonthlyExceeded,
}

impl fmt::Display for LimitViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BelowMinimum => f.write_str("below minimum"),
            Self::DailyExceeded => f.write_str("daily limit exceeded"),
            Self::MonthlyExceeded => f.write_str("monthly limit exceeded"),
        }
    }
}

/// Static per-tier limits, in USD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimitConfig {
    pub tier: KycTier,
    pub min_deposit: Decimal,
    pub daily_deposit_limit: Decimal,
    pub monthly_deposit_limit: Decimal,
    pub min_withdrawal: Decimal,
    pub daily_withdrawal_limit: Decimal,
    pub monthly_withdrawal_limit: Decimal,
}

impl LimitConfig {
    pub fn for_tier(tier: KycTier) -> Self {
        match tier {
            KycTier::Unverified => Self {
                tier,
                min_deposit: dec!(1.00),
                daily_deposit_limit: dec!(100.00),
                monthly_deposit_limit: dec!(500.00),
                min_withdrawal: dec!(10.00),
                daily_withdrawal_limit: dec!(50.00),
                monthly_withdrawal_limit: dec!(200.00),
            },
            KycTier::Basic => Self {
                tier,
                min_deposit: dec!(1.00),
                daily_deposit_limit: dec!(5000.00),
                monthly_deposit_limit: dec!(25000.00),
                min_withdrawal: dec!(10.00),
                daily_withdrawal_limit: dec!(2500.00),
                monthly_withdrawal_limit: dec!(25000.00),
            },
            KycTier::Advanced => Self {
                tier,
                min_deposit: dec!(1.00),
                daily_deposit_limit: dec!(50000.00),
                monthly_deposit_limit: dec!(250000.00),
                min_withdrawal: dec!(10.00),
                daily_withdrawal_limit: dec!(10000.00),
                monthly_withdrawal_limit: dec!(150000.00),
            },
        }
    }

    pub fn minimum(&self, kind: TransferKind) -> Decimal {
        match kind {
            TransferKind::Deposit => self.min_deposit,
            TransferKind::Withdrawal => self.min_withdrawal,
        }
    }

    pub fn daily(&self, kind: TransferKind) -> Decimal {
        match kind {
            TransferKind::Deposit => self.daily_deposit_limit,
            TransferKind::Withdrawal => self.daily_withdrawal_limit,
        }
    }

    pub fn monthly(&self, kind: TransferKind) -> Decimal {
        match kind {
            TransferKind::Deposit => self.monthly_deposit_limit,
            TransferKind::Withdrawal => self.monthly_withdrawal_limit,
        }
    }
}

/// Next UTC midnight strictly after `now`.
pub fn next_daily_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .checked_add_days(Days::new(1))
        .map(|day| day.and_time(NaiveTime::MIN).and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// First instant of the next UTC calendar month.
pub fn next_monthly_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .and_then(|first| first.checked_add_months(Months::new(1)))
        .map(|day| day.and_time(NaiveTime::MIN).and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A rolling counter that is zeroed once its reset instant has passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub used: Decimal,
    pub reset_at: DateTime<Utc>,
}

impl UsageCounter {
    fn new(reset_at: DateTime<Utc>) -> Self {
        Self {
            used: Decimal::ZERO,
            reset_at,
        }
    }

    /// Returns true when the counter was reset.
    fn roll(&mut self, now: DateTime<Utc>, next_reset: fn(DateTime<Utc>) -> DateTime<Utc>) -> bool {
        if now >= self.reset_at {
            self.used = Decimal::ZERO;
            self.reset_at = next_reset(now);
            true
        } else {
            false
        }
    }

    fn remaining(&self, limit: Decimal) -> Decimal {
        (limit - self.used).max(Decimal::ZERO)
    }
}

/// Per-user quota usage. Owned by the usage repository; only mutated through
/// [`UserTransactionUsage::roll_expired`] and [`UserTransactionUsage::add`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTransactionUsage {
    pub user_id: Uuid,
    pub daily_deposit: UsageCounter,
    pub monthly_deposit: UsageCounter,
    pub daily_withdrawal: UsageCounter,
    pub monthly_withdrawal: UsageCounter,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserTransactionUsage {
    pub fn new(user_id: Uuid, now: DateTime<Utc>) -> Self {
        let daily = next_daily_reset(now);
        let monthly = next_monthly_reset(now);
        Self {
            user_id,
            daily_deposit: UsageCounter::new(daily),
            monthly_deposit: UsageCounter::new(monthly),
            daily_withdrawal: UsageCounter::new(daily),
            monthly_withdrawal: UsageCounter::new(monthly),
            created_at: now,
            updated_at: now,
        }
    }

    /// Zeroes every counter whose period has ended. Returns true if any did.
    pub fn roll_expired(&mut self, now: DateTime<Utc>) -> bool {
        let mut rolled = false;
        rolled |= self.daily_deposit.roll(now, next_daily_reset);
        rolled |= self.monthly_deposit.roll(now, next_monthly_reset);
        rolled |= self.daily_withdrawal.roll(now, next_daily_reset);
        rolled |= self.monthly_withdrawal.roll(now, next_monthly_reset);
        if rolled {
            self.updated_at = now;
        }
        rolled
    }

    /// Adds `amount` to both periods of `kind`, rolling expired periods first
    /// so a stale counter never absorbs usage from a new period.
    pub fn add(&mut self, kind: TransferKind, amount: Decimal, now: DateTime<Utc>) {
        self.roll_expired(now);
        let (daily, monthly) = self.counters_mut(kind);
        daily.used += amount;
        monthly.used += amount;
        self.updated_at = now;
    }

    pub fn daily(&self, kind: TransferKind) -> &UsageCounter {
        match kind {
            TransferKind::Deposit => &self.daily_deposit,
            TransferKind::Withdrawal => &self.daily_withdrawal,
        }
    }

    pub fn monthly(&self, kind: TransferKind) -> &UsageCounter {
        match kind {
            TransferKind::Deposit => &self.monthly_deposit,
            TransferKind::Withdrawal => &self.monthly_withdrawal,
        }
    }

    fn counters_mut(&mut self, kind: TransferKind) -> (&mut UsageCounter, &mut UsageCounter) {
        match kind {
            TransferKind::Deposit => (&mut self.daily_deposit, &mut self.monthly_deposit),
            TransferKind::Withdrawal => (&mut self.daily_withdrawal, &mut self.monthly_withdrawal),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitCheckResult {
    pub allowed: bool,
    pub reason: String,
    pub current_usage: Decimal,
    pub limit: Decimal,
    pub remaining_capacity: Decimal,
    pub resets_at: Option<DateTime<Utc>>,
    pub limit_type: Option<LimitType>,
}

/// Rejects `amount` when it is below the tier minimum. Needs no usage.
pub fn check_minimum(
    config: &LimitConfig,
    kind: TransferKind,
    amount: Decimal,
) -> Result<(), RailError> {
    let minimum = config.minimum(kind);
    if amount >= minimum {
        return Ok(());
    }
    Err(RailError::Limit {
        violation: LimitViolation::BelowMinimum,
        check: Box::new(LimitCheckResult {
            allowed: false,
            reason: format!("amount {amount} is below minimum {kind} of {minimum}"),
            current_usage: Decimal::ZERO,
            limit: minimum,
            remaining_capacity: Decimal::ZERO,
            resets_at: None,
            limit_type: None,
        }),
    })
}

/// Evaluates `amount` against an already-rolled usage snapshot.
///
/// The minimum is checked first, then the daily cap, then the monthly cap, so
/// a daily violation is reported even when both caps would be exceeded.
pub fn evaluate(
    config: &LimitConfig,
    usage: &UserTransactionUsage,
    kind: TransferKind,
    amount: Decimal,
) -> Result<LimitCheckResult, RailError> {
    check_minimum(config, kind, amount)?;

    let daily = usage.daily(kind);
    let daily_limit = config.daily(kind);
    if daily.used + amount > daily_limit {
        return Err(RailError::Limit {
            violation: LimitViolation::DailyExceeded,
            check: Box::new(LimitCheckResult {
                allowed: false,
                reason: format!("daily {kind} limit exceeded"),
                current_usage: daily.used,
                limit: daily_limit,
                remaining_capacity: daily.remaining(daily_limit),
                resets_at: Some(daily.reset_at),
                limit_type: Some(LimitType::Daily),
            }),
        });
    }

    let monthly = usage.monthly(kind);
    let monthly_limit = config.monthly(kind);
    if monthly.used + amount > monthly_limit {
        return Err(RailError::Limit {
            violation: LimitViolation::MonthlyExceeded,
            check: Box::new(LimitCheckResult {
                allowed: false,
                reason: format!("monthly {kind} limit exceeded"),
                current_usage: monthly.used,
                limit: monthly_limit,
                remaining_capacity: monthly.remaining(monthly_limit),
                resets_at: Some(monthly.reset_at),
                limit_type: Some(LimitType::Monthly),
            }),
        });
    }

    let daily_remaining = daily.remaining(daily_limit);
    let monthly_remaining = monthly.remaining(monthly_limit);
    let (current_usage, limit, remaining_capacity, resets_at, limit_type) =
        if monthly_remaining < daily_remaining {
            (monthly.used, monthly_limit, monthly_remaining, monthly.reset_at, LimitType::Monthly)
        } else {
            (daily.used, daily_limit, daily_remaining, daily.reset_at, LimitType::Daily)
        };

    Ok(LimitCheckResult {
        allowed: true,
        reason: String::new(),
        current_usage,
        limit,
        remaining_capacity,
        resets_at: Some(resets_at),
        limit_type: Some(limit_type),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodLimit {
    pub limit: Decimal,
    pub used: Decimal,
    pub remaining: Decimal,
    pub resets_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitDetails {
    pub minimum: Decimal,
    pub daily: PeriodLimit,
    pub monthly: PeriodLimit,
}

/// Snapshot of a user's limits and usage for both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLimits {
    pub kyc_tier: KycTier,
    pub deposit: LimitDetails,
    pub withdrawal: LimitDetails,
}

impl UserLimits {
    pub fn from_usage(config: &LimitConfig, usage: &UserTransactionUsage) -> Self {
        let details = |kind: TransferKind| {
            let daily = usage.daily(kind);
            let monthly = usage.monthly(kind);
            LimitDetails {
                minimum: config.minimum(kind),
                daily: PeriodLimit {
                    limit: config.daily(kind),
                    used: daily.used,
                    remaining: daily.remaining(config.daily(kind)),
                    resets_at: daily.reset_at,
                },
                monthly: PeriodLimit {
                    limit: config.monthly(kind),
                    used: monthly.used,
                    remaining: monthly.remaining(config.monthly(kind)),
                    resets_at: monthly.reset_at,
                },
            }
        };
        Self {
            kyc_tier: config.tier,
            deposit: details(TransferKind::Deposit),
            withdrawal: details(TransferKind::Withdrawal),
        }
    }
}
