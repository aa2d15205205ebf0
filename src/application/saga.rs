use crate::application::limits::UsageLedger;
use crate::application::retry::RetryExecutor;
use crate::config::SagaSettings;
use crate::domain::conversion::{ConversionRequest, ConversionStatus};
use crate::domain::deposit::{Deposit, DepositStatus};
use crate::domain::money::Amount;
use crate::domain::ports::{
    BrokerageFundingRef, ConversionProviderRef, DepositRepositoryRef, VirtualAccountRepositoryRef,
};
use crate::error::{RailError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Collaborators the saga drives.
#[derive(Clone)]
pub struct SagaPorts {
    pub deposits: DepositRepositoryRef,
    pub accounts: VirtualAccountRepositoryRef,
    pub provider: ConversionProviderRef,
    pub brokerage: BrokerageFundingRef,
    pub ledger: Arc<UsageLedger>,
}

/// What a provider callback did to the linked deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// No deposit is linked to the provider transaction.
    Unmatched,
    /// The deposit was left as it was.
    Unchanged(DepositStatus),
    Advanced {
        from: DepositStatus,
        to: DepositStatus,
    },
}

/// Counts from one reconciliation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Stale `created` deposits whose rail leg was started.
    pub resumed: usize,
    /// `rail_initiated` deposits whose provider status was re-queried.
    pub polled: usize,
    pub funded: usize,
    /// Funded deposits whose quota usage was recorded by the sweep.
    pub usage_recorded: usize,
    pub failed: usize,
    pub errors: usize,
}

/// Drives a deposit across the rail and then the brokerage.
///
/// Every persisted transition is a compare-and-set on the previous status, so
/// webhook deliveries, polling and the reconciliation sweep can race without
/// moving a deposit backwards or funding it twice.
pub struct ConversionSaga {
    ports: SagaPorts,
    retry: RetryExecutor,
    settings: SagaSettings,
    funding_in_flight: Mutex<HashSet<Uuid>>,
}

impl ConversionSaga {
    /// Creates a new saga.
    ///
    /// # Arguments
    ///
    /// * `ports` - Repositories and external providers.
    /// * `retry` - Executor wrapping every outbound provider call.
    /// * `settings` - Conversion direction, currencies and the stale threshold.
    pub fn new(ports: SagaPorts, retry: RetryExecutor, settings: SagaSettings) -> Self {
        Self {
            ports,
            retry,
            settings,
            funding_in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Starts a conversion for `amount` and returns the persisted deposit.
    ///
    /// The deposit is stored as `created` before any outbound call, so a
    /// second call with the same `reference` fails with `DuplicateReference`
    /// without reaching the provider.
    ///
    /// # Arguments
    ///
    /// * `user_id` - Owner of the virtual account.
    /// * `rail_account_id` - Rail-side key of the user's virtual account.
    /// * `amount` - Source amount.
    /// * `reference` - Caller-supplied identifier, also the provider idempotency key.
    pub async fn initiate(
        &self,
        user_id: Uuid,
        rail_account_id: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<Deposit> {
        if reference.trim().is_empty() {
            return Err(RailError::Validation("reference is required".to_string()));
        }

        let account = self
            .ports
            .accounts
            .get_by_rail_account_id(rail_account_id)
            .await?
            .ok_or_else(|| RailError::not_found("virtual account", rail_account_id))?;
        if account.user_id != user_id {
            return Err(RailError::Validation(format!(
                "virtual account {rail_account_id} does not belong to user {user_id}"
            )));
        }

        let deposit = Deposit::new(
            user_id,
            account.id,
            reference,
            amount,
            self.settings.source_currency.clone(),
            Utc::now(),
        );
        self.ports.deposits.create(&deposit).await?;
        info!(deposit_id = %deposit.id, user_id = %user_id, %amount, reference, "deposit created");

        self.start_rail(deposit).await
    }

    /// Starts a conversion for funds that arrived on the virtual account
    /// keyed `rail_account_id`, on behalf of its owner.
    pub async fn initiate_for_rail_account(
        &self,
        rail_account_id: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<Deposit> {
        let account = self
            .ports
            .accounts
            .get_by_rail_account_id(rail_account_id)
            .await?
            .ok_or_else(|| RailError::not_found("virtual account", rail_account_id))?;
        self.initiate(account.user_id, rail_account_id, amount, reference)
            .await
    }

    async fn start_rail(&self, mut deposit: Deposit) -> Result<Deposit> {
        let request = ConversionRequest {
            direction: self.settings.direction,
            source_amount: deposit.amount,
            source_currency: self.settings.source_currency.clone(),
            destination_currency: self.settings.destination_currency.clone(),
            idempotency_key: deposit.reference.clone(),
        };

        let result = self
            .retry
            .execute(
                "initiate_conversion",
                |_| {
                    let provider = self.ports.provider.clone();
                    let request = request.clone();
                    async move { provider.initiate_conversion(&request).await }
                },
                RailError::is_retryable,
            )
            .await;

        match result {
            Ok(response) => {
                deposit.mark_rail_initiated(response.provider_tx_id, Utc::now())?;
                self.ports
                    .deposits
                    .update(&deposit, DepositStatus::Created)
                    .await?;
                info!(
                    deposit_id = %deposit.id,
                    provider_tx_id = deposit.provider_tx_id.as_deref().unwrap_or_default(),
                    "rail leg initiated"
                );
                Ok(deposit)
            }
            Err(err) if matches!(err, RailError::Cancelled) || self.retry.is_aborted() => {
                // The provider may already have created the transfer. Leave the
                // deposit for the sweep, which resumes with the same key.
                warn!(deposit_id = %deposit.id, error = %err, "rail initiation aborted");
                Err(err)
            }
            Err(err) => {
                warn!(deposit_id = %deposit.id, error = %err, "rail initiation failed");
                deposit.mark_failed(err.to_string(), Utc::now())?;
                if let Err(persist_err) = self
                    .ports
                    .deposits
                    .update(&deposit, DepositStatus::Created)
                    .await
                {
                    warn!(deposit_id = %deposit.id, error = %persist_err, "failed to persist failed deposit");
                }
                Err(err)
            }
        }
    }

    /// Applies the provider's current view of `provider_tx_id` to its deposit.
    ///
    /// Safe to call any number of times, in any order, from webhooks and
    /// polling alike.
    pub async fn handle_provider_callback(&self, provider_tx_id: &str) -> Result<CallbackOutcome> {
        let Some(mut deposit) = self
            .ports
            .deposits
            .get_by_provider_tx_id(provider_tx_id)
            .await?
        else {
            warn!(provider_tx_id, "no deposit for provider transaction, dropping callback");
            return Ok(CallbackOutcome::Unmatched);
        };

        // Funding of `rail_completed` deposits belongs to the sweep.
        if deposit.status != DepositStatus::RailInitiated {
            debug!(deposit_id = %deposit.id, status = %deposit.status, "callback ignored");
            return Ok(CallbackOutcome::Unchanged(deposit.status));
        }

        let response = self
            .retry
            .execute(
                "get_conversion_status",
                |_| {
                    let provider = self.ports.provider.clone();
                    let id = provider_tx_id.to_string();
                    async move { provider.get_conversion_status(&id).await }
                },
                RailError::is_retryable,
            )
            .await?;

        let from = deposit.status;
        match response.status {
            ConversionStatus::Completed => {
                deposit.mark_rail_completed(response.destination_amount, Utc::now())?;
                if !self.persist(&deposit, from).await? {
                    return self.current_outcome(deposit.id).await;
                }
                info!(
                    deposit_id = %deposit.id,
                    provider_tx_id,
                    destination_amount = ?deposit.destination_amount,
                    "rail leg completed"
                );

                let to = match self.fund_broker(deposit).await {
                    Ok(funded) => funded.status,
                    Err(err) => {
                        warn!(provider_tx_id, error = %err, "brokerage funding failed, left for reconciliation");
                        DepositStatus::RailCompleted
                    }
                };
                Ok(CallbackOutcome::Advanced { from, to })
            }
            ConversionStatus::Failed => {
                let reason = response
                    .failure_reason
                    .unwrap_or_else(|| "provider reported failure".to_string());
                deposit.mark_failed(reason, Utc::now())?;
                if !self.persist(&deposit, from).await? {
                    return self.current_outcome(deposit.id).await;
                }
                info!(deposit_id = %deposit.id, provider_tx_id, "rail leg failed");
                Ok(CallbackOutcome::Advanced {
                    from,
                    to: DepositStatus::Failed,
                })
            }
            ConversionStatus::Pending | ConversionStatus::Processing => {
                debug!(deposit_id = %deposit.id, status = %response.status, "rail leg still in flight");
                Ok(CallbackOutcome::Unchanged(from))
            }
        }
    }

    /// Funds the brokerage leg of a `rail_completed` deposit with its settled
    /// amount, then records the deposit against the user's quota.
    ///
    /// On failure the deposit stays `rail_completed` so the funding can be
    /// retried on its own.
    pub async fn fund_broker(&self, deposit: Deposit) -> Result<Deposit> {
        if deposit.status != DepositStatus::RailCompleted {
            return Err(RailError::InvalidTransition {
                from: deposit.status,
                to: DepositStatus::BrokerFunded,
            });
        }
        if !self.funding_in_flight.lock().await.insert(deposit.id) {
            return Err(RailError::StaleState(deposit.id.to_string()));
        }
        let id = deposit.id;
        let result = self.fund_claimed(deposit).await;
        self.funding_in_flight.lock().await.remove(&id);
        result
    }

    async fn fund_claimed(&self, deposit: Deposit) -> Result<Deposit> {
        // Re-read under the claim: a concurrent funder may have finished.
        let mut deposit = self
            .ports
            .deposits
            .get_by_id(deposit.id)
            .await?
            .ok_or_else(|| RailError::not_found("deposit", deposit.id))?;
        if deposit.status != DepositStatus::RailCompleted {
            return Err(RailError::StaleState(deposit.id.to_string()));
        }

        let account = self
            .ports
            .accounts
            .get_by_id(deposit.virtual_account_id)
            .await?
            .ok_or_else(|| RailError::not_found("virtual account", deposit.virtual_account_id))?;
        let amount = deposit.settled_amount();

        let funding_ref = self
            .retry
            .execute(
                "initiate_funding",
                |_| {
                    let brokerage = self.ports.brokerage.clone();
                    let account_id = account.brokerage_account_id.clone();
                    let key = deposit.id.to_string();
                    async move { brokerage.initiate_funding(&key, &account_id, amount).await }
                },
                RailError::is_retryable,
            )
            .await?;

        deposit.mark_broker_funded(funding_ref, Utc::now())?;
        self.ports
            .deposits
            .update(&deposit, DepositStatus::RailCompleted)
            .await?;
        info!(
            deposit_id = %deposit.id,
            brokerage_account_id = %account.brokerage_account_id,
            %amount,
            "brokerage funded"
        );

        match self.record_usage(deposit.clone()).await {
            Ok(recorded) => Ok(recorded),
            Err(err) => {
                warn!(deposit_id = %deposit.id, error = %err, "failed to record deposit usage, left for reconciliation");
                Ok(deposit)
            }
        }
    }

    /// Counts a funded deposit against the user's quota and marks it.
    ///
    /// The ledger dedupes on the deposit id, so a retry after the marker
    /// write failed does not count the amount twice.
    async fn record_usage(&self, mut deposit: Deposit) -> Result<Deposit> {
        self.ports
            .ledger
            .record_funded_deposit(deposit.user_id, deposit.id, deposit.amount)
            .await?;
        deposit.mark_usage_recorded(Utc::now())?;
        self.ports
            .deposits
            .update(&deposit, DepositStatus::BrokerFunded)
            .await?;
        Ok(deposit)
    }

    /// Requests cancellation of a `rail_initiated` deposit at the provider.
    ///
    /// The deposit is marked `failed` only when the provider accepts.
    pub async fn cancel(&self, deposit_id: Uuid) -> Result<Deposit> {
        let mut deposit = self
            .ports
            .deposits
            .get_by_id(deposit_id)
            .await?
            .ok_or_else(|| RailError::not_found("deposit", deposit_id))?;
        let Some(provider_tx_id) = deposit.provider_tx_id.clone() else {
            return Err(RailError::Validation(format!(
                "deposit {deposit_id} has no provider transaction to cancel"
            )));
        };
        if deposit.status != DepositStatus::RailInitiated {
            return Err(RailError::InvalidTransition {
                from: deposit.status,
                to: DepositStatus::Failed,
            });
        }

        self.ports
            .provider
            .cancel_conversion(&provider_tx_id)
            .await
            .inspect_err(|e| warn!(%deposit_id, error = %e, "provider rejected cancellation"))?;

        deposit.mark_failed("cancelled", Utc::now())?;
        self.ports
            .deposits
            .update(&deposit, DepositStatus::RailInitiated)
            .await?;
        info!(%deposit_id, provider_tx_id = %provider_tx_id, "deposit cancelled");
        Ok(deposit)
    }

    /// Background sweep over deposits that stopped short of a terminal state.
    ///
    /// Retries brokerage funding, resumes stale `created` deposits with their
    /// original idempotency key, polls `rail_initiated` deposits and records
    /// quota usage for funded deposits that lack it. Failures are logged and
    /// counted, never surfaced.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let cancel = self.retry.cancellation_token();

        for deposit in self
            .ports
            .deposits
            .list_by_status(DepositStatus::RailCompleted)
            .await?
        {
            if cancel.is_cancelled() {
                return Ok(report);
            }
            let deposit_id = deposit.id;
            match self.fund_broker(deposit).await {
                Ok(_) => report.funded += 1,
                Err(err) => {
                    warn!(%deposit_id, error = %err, "funding retry failed");
                    report.errors += 1;
                }
            }
        }

        let stale_after = i64::try_from(self.settings.stale_after_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        for deposit in self
            .ports
            .deposits
            .list_by_status(DepositStatus::Created)
            .await?
        {
            if cancel.is_cancelled() {
                return Ok(report);
            }
            if now.signed_duration_since(deposit.created_at) < stale_after {
                continue;
            }
            let deposit_id = deposit.id;
            match self.start_rail(deposit).await {
                Ok(_) => report.resumed += 1,
                Err(err) => {
                    warn!(%deposit_id, error = %err, "resuming rail initiation failed");
                    report.errors += 1;
                }
            }
        }

        for deposit in self
            .ports
            .deposits
            .list_by_status(DepositStatus::RailInitiated)
            .await?
        {
            if cancel.is_cancelled() {
                return Ok(report);
            }
            let Some(provider_tx_id) = deposit.provider_tx_id else {
                continue;
            };
            report.polled += 1;
            match self.handle_provider_callback(&provider_tx_id).await {
                Ok(CallbackOutcome::Advanced { to, .. }) => match to {
                    DepositStatus::BrokerFunded => report.funded += 1,
                    DepositStatus::Failed => report.failed += 1,
                    _ => {}
                },
                Ok(_) => {}
                Err(err) => {
                    warn!(%provider_tx_id, error = %err, "status poll failed");
                    report.errors += 1;
                }
            }
        }

        for deposit in self
            .ports
            .deposits
            .list_by_status(DepositStatus::BrokerFunded)
            .await?
            .into_iter()
            .filter(|d| d.usage_recorded_at.is_none())
        {
            if cancel.is_cancelled() {
                return Ok(report);
            }
            let deposit_id = deposit.id;
            match self.record_usage(deposit).await {
                Ok(_) => report.usage_recorded += 1,
                Err(err) => {
                    warn!(%deposit_id, error = %err, "recording deposit usage failed");
                    report.errors += 1;
                }
            }
        }

        info!(
            resumed = report.resumed,
            polled = report.polled,
            funded = report.funded,
            usage_recorded = report.usage_recorded,
            failed = report.failed,
            errors = report.errors,
            "reconciliation sweep finished"
        );
        Ok(report)
    }

    pub async fn deposit(&self, deposit_id: Uuid) -> Result<Option<Deposit>> {
        self.ports.deposits.get_by_id(deposit_id).await
    }

    /// Returns false when another writer moved the deposit first.
    async fn persist(&self, deposit: &Deposit, expected: DepositStatus) -> Result<bool> {
        match self.ports.deposits.update(deposit, expected).await {
            Ok(()) => Ok(true),
            Err(RailError::StaleState(_)) => {
                debug!(deposit_id = %deposit.id, %expected, "lost transition race");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn current_outcome(&self, deposit_id: Uuid) -> Result<CallbackOutcome> {
        let current = self
            .ports
            .deposits
            .get_by_id(deposit_id)
            .await?
            .ok_or_else(|| RailError::not_found("deposit", deposit_id))?;
        Ok(CallbackOutcome::Unchanged(current.status))
    }
}
