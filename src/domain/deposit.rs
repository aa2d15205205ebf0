use crate::domain::money::Amount;
use crate::error::RailError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of a deposit as it crosses the rail and then the brokerage.
///
/// The state machine only moves forward:
///
/// ```text
/// Created -> RailInitiated -> RailCompleted -> BrokerFunded
///    \______________\_______________\________> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Created,
    RailInitiated,
    RailCompleted,
    BrokerFunded,
    Failed,
}

impl DepositStatus {
    pub fn can_transition_to(self, next: DepositStatus) -> bool {
        use DepositStatus::*;
        matches!(
            (self, next),
            (Created, RailInitiated)
                | (RailInitiated, RailCompleted)
                | (RailCompleted, BrokerFunded)
                | (Created | RailInitiated | RailCompleted, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::BrokerFunded | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::RailInitiated => "rail_initiated",
            Self::RailCompleted => "rail_completed",
            Self::BrokerFunded => "broker_funded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: Uuid,
    pub user_id: Uuid,
    pub virtual_account_id: Uuid,
    /// Caller-supplied reference; unique across all deposits.
    pub reference: String,
    pub amount: Amount,
    pub currency: String,
    pub status: DepositStatus,
    pub provider_tx_id: Option<String>,
    pub destination_amount: Option<Decimal>,
    pub funding_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub rail_initiated_at: Option<DateTime<Utc>>,
    pub rail_completed_at: Option<DateTime<Utc>>,
    pub broker_funded_at: Option<DateTime<Utc>>,
    /// Set once the funded amount has been counted against the user's quota.
    #[serde(default)]
    pub usage_recorded_at: Option<DateTime<Utc>>,
}

impl Deposit {
    pub fn new(
        user_id: Uuid,
        virtual_account_id: Uuid,
        reference: impl Into<String>,
        amount: Amount,
        currency: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            virtual_account_id,
            reference: reference.into(),
            amount,
            currency: currency.into(),
            status: DepositStatus::Created,
            provider_tx_id: None,
            destination_amount: None,
            funding_ref: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            rail_initiated_at: None,
            rail_completed_at: None,
            broker_funded_at: None,
            usage_recorded_at: None,
        }
    }

    fn transition(&mut self, next: DepositStatus, now: DateTime<Utc>) -> Result<(), RailError> {
        if !self.status.can_transition_to(next) {
            return Err(RailError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_rail_initiated(
        &mut self,
        provider_tx_id: String,
        now: DateTime<Utc>,
    ) -> Result<(), RailError> {
        self.transition(DepositStatus::RailInitiated, now)?;
        self.provider_tx_id = Some(provider_tx_id);
        self.rail_initiated_at = Some(now);
        Ok(())
    }

    pub fn mark_rail_completed(
        &mut self,
        destination_amount: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<(), RailError> {
        self.transition(DepositStatus::RailCompleted, now)?;
        self.destination_amount = destination_amount;
        self.rail_completed_at = Some(now);
        Ok(())
    }

    pub fn mark_broker_funded(
        &mut self,
        funding_ref: String,
        now: DateTime<Utc>,
    ) -> Result<(), RailError> {
        self.transition(DepositStatus::BrokerFunded, now)?;
        self.funding_ref = Some(funding_ref);
        self.broker_funded_at = Some(now);
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), RailError> {
        self.transition(DepositStatus::Failed, now)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    pub fn mark_usage_recorded(&mut self, now: DateTime<Utc>) -> Result<(), RailError> {
        if self.status != DepositStatus::BrokerFunded {
            return Err(RailError::Validation(format!(
                "usage is recorded for funded deposits only, deposit {} is {}",
                self.id, self.status
            )));
        }
        self.usage_recorded_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Amount the brokerage leg should be funded with: the settled rail
    /// output when known, otherwise the source amount.
    pub fn settled_amount(&self) -> Decimal {
        self.destination_amount
            .unwrap_or_else(|| self.amount.value())
    }
}
