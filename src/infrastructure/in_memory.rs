use crate::domain::account::{UserProfile, VirtualAccount};
use crate::domain::deposit::{Deposit, DepositStatus};
use crate::domain::limits::{TransferKind, UserTransactionUsage};
use crate::domain::ports::{
    DepositRepository, UsageRepository, UserRepository, VirtualAccountRepository,
};
use crate::error::{RailError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

#[derive(Default)]
struct DepositTables {
    by_id: HashMap<Uuid, Deposit>,
    by_reference: HashMap<String, Uuid>,
    by_provider_tx_id: HashMap<String, Uuid>,
}

/// A thread-safe in-memory deposit store.
///
/// Keeps unique indexes on `reference` and `provider_tx_id` alongside the
/// primary map, all behind one lock so index checks and writes are atomic.
#[derive(Default, Clone)]
pub struct InMemoryDepositRepository {
    tables: Arc<RwLock<DepositTables>>,
}

impl InMemoryDepositRepository {
    /// Creates a new, empty deposit store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DepositRepository for InMemoryDepositRepository {
    async fn create(&self, deposit: &Deposit) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.by_reference.contains_key(&deposit.reference) {
            return Err(RailError::DuplicateReference(deposit.reference.clone()));
        }
        if tables.by_id.contains_key(&deposit.id) {
            return Err(RailError::Storage(format!(
                "deposit {} already exists",
                deposit.id
            )));
        }
        tables
            .by_reference
            .insert(deposit.reference.clone(), deposit.id);
        if let Some(provider_tx_id) = &deposit.provider_tx_id {
            tables
                .by_provider_tx_id
                .insert(provider_tx_id.clone(), deposit.id);
        }
        tables.by_id.insert(deposit.id, deposit.clone());
        Ok(())
    }

    async fn update(&self, deposit: &Deposit, expected: DepositStatus) -> Result<()> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .by_id
            .get(&deposit.id)
            .ok_or_else(|| RailError::not_found("deposit", deposit.id))?;
        if stored.status != expected {
            return Err(RailError::StaleState(deposit.id.to_string()));
        }
        if stored.reference != deposit.reference {
            return Err(RailError::Storage(format!(
                "reference of deposit {} is immutable",
                deposit.id
            )));
        }
        if let Some(provider_tx_id) = &deposit.provider_tx_id {
            match tables.by_provider_tx_id.get(provider_tx_id) {
                Some(owner) if *owner != deposit.id => {
                    return Err(RailError::Storage(format!(
                        "provider transaction {provider_tx_id} is already linked to deposit {owner}"
                    )));
                }
                Some(_) => {}
                None => {
                    tables
                        .by_provider_tx_id
                        .insert(provider_tx_id.clone(), deposit.id);
                }
            }
        }
        tables.by_id.insert(deposit.id, deposit.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Deposit>> {
        let tables = self.tables.read().await;
        Ok(tables.by_id.get(&id).cloned())
    }

    async fn get_by_provider_tx_id(&self, provider_tx_id: &str) -> Result<Option<Deposit>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_provider_tx_id
            .get(provider_tx_id)
            .and_then(|id| tables.by_id.get(id))
            .cloned())
    }

    async fn list_by_user_id(&self, user_id: Uuid) -> Result<Vec<Deposit>> {
        let tables = self.tables.read().await;
        let mut deposits: Vec<Deposit> = tables
            .by_id
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        deposits.sort_by_key(|d| d.created_at);
        Ok(deposits)
    }

    async fn list_by_status(&self, status: DepositStatus) -> Result<Vec<Deposit>> {
        let tables = self.tables.read().await;
        let mut deposits: Vec<Deposit> = tables
            .by_id
            .values()
            .filter(|d| d.status == status)
            .cloned()
            .collect();
        deposits.sort_by_key(|d| d.created_at);
        Ok(deposits)
    }
}

/// A thread-safe in-memory virtual account store.
#[derive(Default, Clone)]
pub struct InMemoryVirtualAccountRepository {
    accounts: Arc<RwLock<HashMap<Uuid, VirtualAccount>>>,
}

impl InMemoryVirtualAccountRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, account: VirtualAccount) {
        self.accounts.write().await.insert(account.id, account);
    }
}

#[async_trait]
impl VirtualAccountRepository for InMemoryVirtualAccountRepository {
    async fn get_by_rail_account_id(
        &self,
        rail_account_id: &str,
    ) -> Result<Option<VirtualAccount>> {
        let accounts = self.accounts.read().await;
        Ok(accounts
            .values()
            .find(|a| a.rail_account_id == rail_account_id)
            .cloned())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<VirtualAccount>> {
        let accounts = self.accounts.read().await;
        Ok(accounts.get(&id).cloned())
    }
}

/// A thread-safe in-memory usage store.
///
/// Every operation holds the map's mutex for its whole read-roll-write, which
/// is the in-process equivalent of a row lock.
#[derive(Default, Clone)]
pub struct InMemoryUsageRepository {
    usage: Arc<Mutex<UsageTables>>,
}

#[derive(Default)]
struct UsageTables {
    by_user: HashMap<Uuid, UserTransactionUsage>,
    /// Deposits already counted by `apply_deposit_usage`.
    applied: HashSet<Uuid>,
}

impl UsageTables {
    fn entry(&mut self, user_id: Uuid, now: DateTime<Utc>) -> &mut UserTransactionUsage {
        self.by_user
            .entry(user_id)
            .or_insert_with(|| UserTransactionUsage::new(user_id, now))
    }
}

fn ensure_positive(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(RailError::Validation(format!(
            "usage increment must be positive, got {amount}"
        )));
    }
    Ok(())
}

impl InMemoryUsageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the stored counters for a user. Used to seed state.
    pub async fn insert(&self, usage: UserTransactionUsage) {
        self.usage.lock().await.by_user.insert(usage.user_id, usage);
    }

    async fn increment(
        &self,
        kind: TransferKind,
        user_id: Uuid,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        ensure_positive(amount)?;
        self.usage.lock().await.entry(user_id, now).add(kind, amount, now);
        Ok(())
    }
}

#[async_trait]
impl UsageRepository for InMemoryUsageRepository {
    async fn get_or_create(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<UserTransactionUsage> {
        Ok(self.usage.lock().await.entry(user_id, now).clone())
    }

    async fn increment_deposit_usage(
        &self,
        user_id: Uuid,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.increment(TransferKind::Deposit, user_id, amount, now)
            .await
    }

    async fn increment_withdrawal_usage(
        &self,
        user_id: Uuid,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.increment(TransferKind::Withdrawal, user_id, amount, now)
            .await
    }

    async fn apply_deposit_usage(
        &self,
        user_id: Uuid,
        deposit_id: Uuid,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        ensure_positive(amount)?;
        let mut tables = self.usage.lock().await;
        if !tables.applied.insert(deposit_id) {
            return Ok(false);
        }
        tables.entry(user_id, now).add(TransferKind::Deposit, amount, now);
        Ok(true)
    }

    async fn reset_expired_periods(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UserTransactionUsage> {
        let mut tables = self.usage.lock().await;
        let entry = tables.entry(user_id, now);
        entry.roll_expired(now);
        Ok(entry.clone())
    }
}

/// A thread-safe in-memory user store.
#[derive(Default, Clone)]
pub struct InMemoryUserRepository {
    users: Arc<RwLock<HashMap<Uuid, UserProfile>>>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user: UserProfile) {
        self.users.write().await.insert(user.id, user);
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<UserProfile>> {
        let users = self.users.read().await;
        Ok(users.get(&id).cloned())
    }
}
