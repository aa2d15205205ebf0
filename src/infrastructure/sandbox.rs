//! In-process stand-ins for the rail vendor and the brokerage.
//!
//! Both honor the same contracts as the real services (idempotent transfer
//! creation, asynchronous settlement) and can be scripted to fail, which is
//! what the CLI replay and the integration tests drive.

use super::rail::{
    CreateTransferRequest, RailApiError, RailClient, Transfer, TransferLeg, TransferState,
};
use crate::domain::ports::BrokerageFunding;
use crate::error::{RailError, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct RailState {
    /// Oldest first.
    transfers: Vec<Transfer>,
    by_reference: HashMap<String, usize>,
    create_failures: VecDeque<RailApiError>,
    list_failures: VecDeque<RailApiError>,
    create_calls: u32,
    list_calls: u32,
}

/// A vendor transfer API kept in memory.
///
/// Creating a transfer twice with the same reference returns the first
/// transfer, as the vendor's idempotency keys do.
#[derive(Clone, Default)]
pub struct SandboxRailClient {
    state: Arc<Mutex<RailState>>,
    fee_rate: Decimal,
}

impl SandboxRailClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fee the rail deducts from the source amount on settlement.
    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    /// Makes the next `create_transfer` call fail with `err`.
    pub async fn fail_next_create(&self, err: RailApiError) {
        self.state.lock().await.create_failures.push_back(err);
    }

    /// Makes the next `list_transfers` call fail with `err`.
    pub async fn fail_next_list(&self, err: RailApiError) {
        self.state.lock().await.list_failures.push_back(err);
    }

    pub async fn create_calls(&self) -> u32 {
        self.state.lock().await.create_calls
    }

    pub async fn list_calls(&self) -> u32 {
        self.state.lock().await.list_calls
    }

    pub async fn transfer_count(&self) -> usize {
        self.state.lock().await.transfers.len()
    }

    pub async fn transfer(&self, id: &str) -> Option<Transfer> {
        let state = self.state.lock().await;
        state.transfers.iter().find(|t| t.id == id).cloned()
    }

    /// Settles the transfer: the destination leg receives the source amount
    /// minus the rail fee at a 1:1 rate.
    pub async fn complete(&self, id: &str) -> Result<Transfer> {
        let fee_rate = self.fee_rate;
        self.update(id, |transfer| {
            let amount = transfer.source.amount.unwrap_or_default();
            let fee = amount * fee_rate;
            transfer.status = TransferState::Completed;
            transfer.source.fee = Some(fee);
            transfer.destination.amount = Some(amount - fee);
            transfer.fx_rate = Some(Decimal::ONE);
        })
        .await
    }

    pub async fn fail(&self, id: &str) -> Result<Transfer> {
        self.set_state(id, TransferState::Failed).await
    }

    pub async fn set_state(&self, id: &str, state: TransferState) -> Result<Transfer> {
        self.update(id, |transfer| transfer.status = state).await
    }

    async fn update(&self, id: &str, apply: impl FnOnce(&mut Transfer)) -> Result<Transfer> {
        let mut state = self.state.lock().await;
        let transfer = state
            .transfers
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| RailError::not_found("provider transaction", id))?;
        apply(transfer);
        debug!(transfer_id = id, status = ?transfer.status, "sandbox transfer updated");
        Ok(transfer.clone())
    }
}

#[async_trait]
impl RailClient for SandboxRailClient {
    async fn create_transfer(
        &self,
        request: &CreateTransferRequest,
    ) -> std::result::Result<Transfer, RailApiError> {
        let mut state = self.state.lock().await;
        state.create_calls += 1;
        if let Some(err) = state.create_failures.pop_front() {
            return Err(err);
        }
        if request.amount <= Decimal::ZERO {
            return Err(RailApiError::Http {
                status: 422,
                message: "amount must be positive".to_string(),
            });
        }
        if let Some(&index) = state.by_reference.get(&request.reference) {
            return Ok(state.transfers[index].clone());
        }

        let transfer = Transfer {
            id: format!("tr_{}", Uuid::new_v4().simple()),
            status: TransferState::Pending,
            source: TransferLeg {
                amount: Some(request.amount),
                currency: request.currency.clone(),
                fee: None,
            },
            destination: TransferLeg {
                amount: None,
                currency: request.destination_currency.clone(),
                fee: None,
            },
            fx_rate: None,
            reference: request.reference.clone(),
        };
        let index = state.transfers.len();
        state.by_reference.insert(request.reference.clone(), index);
        state.transfers.push(transfer.clone());
        Ok(transfer)
    }

    async fn list_transfers(
        &self,
        limit: usize,
        offset: usize,
    ) -> std::result::Result<Vec<Transfer>, RailApiError> {
        let mut state = self.state.lock().await;
        state.list_calls += 1;
        if let Some(err) = state.list_failures.pop_front() {
            return Err(err);
        }
        Ok(state
            .transfers
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Funding {
    pub funding_ref: String,
    pub brokerage_account_id: String,
    pub amount: Decimal,
}

#[derive(Default)]
struct BrokerageState {
    fundings: Vec<Funding>,
    by_key: HashMap<String, String>,
    failures: VecDeque<RailError>,
    calls: u32,
}

/// Brokerage funding endpoint kept in memory.
#[derive(Clone, Default)]
pub struct SandboxBrokerage {
    state: Arc<Mutex<BrokerageState>>,
}

impl SandboxBrokerage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next funding call fail with `err`.
    pub async fn fail_next(&self, err: RailError) {
        self.state.lock().await.failures.push_back(err);
    }

    pub async fn calls(&self) -> u32 {
        self.state.lock().await.calls
    }

    pub async fn fundings(&self) -> Vec<Funding> {
        self.state.lock().await.fundings.clone()
    }
}

#[async_trait]
impl BrokerageFunding for SandboxBrokerage {
    async fn initiate_funding(
        &self,
        idempotency_key: &str,
        brokerage_account_id: &str,
        amount: Decimal,
    ) -> Result<String> {
        let mut state = self.state.lock().await;
        state.calls += 1;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        if let Some(existing) = state.by_key.get(idempotency_key) {
            debug!(idempotency_key, funding_ref = %existing, "funding replayed");
            return Ok(existing.clone());
        }
        if amount <= Decimal::ZERO {
            return Err(RailError::Validation(format!(
                "funding amount must be positive, got {amount}"
            )));
        }
        let funding_ref = format!("fund_{}", Uuid::new_v4().simple());
        state.fundings.push(Funding {
            funding_ref: funding_ref.clone(),
            brokerage_account_id: brokerage_account_id.to_string(),
            amount,
        });
        state
            .by_key
            .insert(idempotency_key.to_string(), funding_ref.clone());
        Ok(funding_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(reference: &str) -> CreateTransferRequest {
        CreateTransferRequest {
            source_id: "src".to_string(),
            destination_id: "dst".to_string(),
            amount: dec!(50),
            currency: "USDC".to_string(),
            destination_currency: "USD".to_string(),
            reference: reference.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_reference() {
        let client = SandboxRailClient::new();
        let first = client.create_transfer(&request("k1")).await.unwrap();
        let again = client.create_transfer(&request("k1")).await.unwrap();
        let other = client.create_transfer(&request("k2")).await.unwrap();

        assert_eq!(first.id, again.id);
        assert_ne!(first.id, other.id);
        assert_eq!(client.transfer_count().await, 2);
        assert_eq!(client.create_calls().await, 3);
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let client = SandboxRailClient::new();
        client.fail_next_create(RailApiError::Timeout).await;

        assert_eq!(
            client.create_transfer(&request("k")).await.unwrap_err(),
            RailApiError::Timeout
        );
        assert!(client.create_transfer(&request("k")).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_limited() {
        let client = SandboxRailClient::new();
        for i in 0..3 {
            client.create_transfer(&request(&format!("k{i}"))).await.unwrap();
        }
        let listed = client.list_transfers(2, 0).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].reference, "k2");

        let rest = client.list_transfers(2, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].reference, "k0");
    }

    #[tokio::test]
    async fn test_brokerage_records_fundings() {
        let brokerage = SandboxBrokerage::new();
        brokerage
            .fail_next(RailError::RetryableProvider("503".into()))
            .await;

        assert!(brokerage.initiate_funding("dep-1", "acct", dec!(10)).await.is_err());
        let funding_ref = brokerage
            .initiate_funding("dep-1", "acct", dec!(10))
            .await
            .unwrap();

        let fundings = brokerage.fundings().await;
        assert_eq!(fundings.len(), 1);
        assert_eq!(fundings[0].funding_ref, funding_ref);
        assert_eq!(brokerage.calls().await, 2);
    }

    #[tokio::test]
    async fn test_brokerage_replays_funding_per_key() {
        let brokerage = SandboxBrokerage::new();
        let first = brokerage
            .initiate_funding("dep-1", "acct", dec!(10))
            .await
            .unwrap();
        let again = brokerage
            .initiate_funding("dep-1", "acct", dec!(10))
            .await
            .unwrap();
        let other = brokerage
            .initiate_funding("dep-2", "acct", dec!(10))
            .await
            .unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(brokerage.fundings().await.len(), 2);
    }
}
