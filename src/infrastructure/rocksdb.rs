use crate::domain::deposit::{Deposit, DepositStatus};
use crate::domain::limits::{TransferKind, UserTransactionUsage};
use crate::domain::ports::{DepositRepository, UsageRepository};
use crate::error::{RailError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use rust_decimal::Decimal;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Column Family for deposits, keyed by deposit id.
pub const CF_DEPOSITS: &str = "deposits";
/// Unique index: reference -> deposit id.
pub const CF_DEPOSIT_REFS: &str = "deposit_refs";
/// Unique index: provider transaction id -> deposit id.
pub const CF_DEPOSIT_PROVIDER_IDS: &str = "deposit_provider_ids";
/// Column Family for quota usage, keyed by user id.
pub const CF_USAGE: &str = "usage";
/// Deposits already counted against usage, keyed by deposit id.
pub const CF_USAGE_APPLIED: &str = "usage_applied";

/// A persistent store implementation using RocksDB.
///
/// Stores deposits (with their unique indexes) and usage counters in separate
/// Column Families so saga state and quotas survive restarts. Multi-key
/// writes go through a `WriteBatch`, and every read-modify-write runs under
/// one store-wide mutex.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// # Arguments
    ///
    /// * `path` - The filesystem path where the database will be stored.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = [
            CF_DEPOSITS,
            CF_DEPOSIT_REFS,
            CF_DEPOSIT_PROVIDER_IDS,
            CF_USAGE,
            CF_USAGE_APPLIED,
        ]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, families)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| RailError::Storage(format!("column family {name} not found")))
    }

    fn get_json<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf)?;
        match self.db.get_cf(&cf, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.cf(cf)?;
        self.db.put_cf(&cf, key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn index_lookup(&self, cf: &str, key: &str) -> Result<Option<Uuid>> {
        let cf = self.cf(cf)?;
        match self.db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => Uuid::from_slice(&bytes)
                .map(Some)
                .map_err(|e| RailError::Storage(format!("corrupt index entry: {e}"))),
            None => Ok(None),
        }
    }

    fn scan_deposits(&self, keep: impl Fn(&Deposit) -> bool) -> Result<Vec<Deposit>> {
        let cf = self.cf(CF_DEPOSITS)?;
        let mut deposits = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_key, value) = item?;
            let deposit: Deposit = serde_json::from_slice(&value)?;
            if keep(&deposit) {
                deposits.push(deposit);
            }
        }
        deposits.sort_by_key(|d| d.created_at);
        Ok(deposits)
    }

    async fn mutate_usage(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        apply: impl FnOnce(&mut UserTransactionUsage),
    ) -> Result<UserTransactionUsage> {
        let _guard = self.write_lock.lock().await;
        let mut usage = self
            .get_json(CF_USAGE, user_id.as_bytes())?
            .unwrap_or_else(|| UserTransactionUsage::new(user_id, now));
        apply(&mut usage);
        self.put_json(CF_USAGE, user_id.as_bytes(), &usage)?;
        Ok(usage)
    }

    async fn increment(
        &self,
        kind: TransferKind,
        user_id: Uuid,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(RailError::Validation(format!(
                "usage increment must be positive, got {amount}"
            )));
        }
        self.mutate_usage(user_id, now, |usage| usage.add(kind, amount, now))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DepositRepository for RocksDBStore {
    async fn create(&self, deposit: &Deposit) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self
            .index_lookup(CF_DEPOSIT_REFS, &deposit.reference)?
            .is_some()
        {
            return Err(RailError::DuplicateReference(deposit.reference.clone()));
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &self.cf(CF_DEPOSITS)?,
            deposit.id.as_bytes(),
            serde_json::to_vec(deposit)?,
        );
        batch.put_cf(
            &self.cf(CF_DEPOSIT_REFS)?,
            deposit.reference.as_bytes(),
            deposit.id.as_bytes(),
        );
        if let Some(provider_tx_id) = &deposit.provider_tx_id {
            batch.put_cf(
                &self.cf(CF_DEPOSIT_PROVIDER_IDS)?,
                provider_tx_id.as_bytes(),
                deposit.id.as_bytes(),
            );
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn update(&self, deposit: &Deposit, expected: DepositStatus) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let stored: Deposit = self
            .get_json(CF_DEPOSITS, deposit.id.as_bytes())?
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

        let mut batch = WriteBatch::default();
        if let Some(provider_tx_id) = &deposit.provider_tx_id {
            match self.index_lookup(CF_DEPOSIT_PROVIDER_IDS, provider_tx_id)? {
                Some(owner) if owner != deposit.id => {
                    return Err(RailError::Storage(format!(
                        "provider transaction {provider_tx_id} is already linked to deposit {owner}"
                    )));
                }
                Some(_) => {}
                None => batch.put_cf(
                    &self.cf(CF_DEPOSIT_PROVIDER_IDS)?,
                    provider_tx_id.as_bytes(),
                    deposit.id.as_bytes(),
                ),
            }
        }
        batch.put_cf(
            &self.cf(CF_DEPOSITS)?,
            deposit.id.as_bytes(),
            serde_json::to_vec(deposit)?,
        );
        self.db.write(batch)?;
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Deposit>> {
        self.get_json(CF_DEPOSITS, id.as_bytes())
    }

    async fn get_by_provider_tx_id(&self, provider_tx_id: &str) -> Result<Option<Deposit>> {
        match self.index_lookup(CF_DEPOSIT_PROVIDER_IDS, provider_tx_id)? {
            Some(id) => self.get_json(CF_DEPOSITS, id.as_bytes()),
            None => Ok(None),
        }
    }

    async fn list_by_user_id(&self, user_id: Uuid) -> Result<Vec<Deposit>> {
        self.scan_deposits(|d| d.user_id == user_id)
    }

    async fn list_by_status(&self, status: DepositStatus) -> Result<Vec<Deposit>> {
        self.scan_deposits(|d| d.status == status)
    }
}

#[async_trait]
impl UsageRepository for RocksDBStore {
    async fn get_or_create(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<UserTransactionUsage> {
        if let Some(usage) = self.get_json(CF_USAGE, user_id.as_bytes())? {
            return Ok(usage);
        }
        self.mutate_usage(user_id, now, |_| {}).await
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
        if amount <= Decimal::ZERO {
            return Err(RailError::Validation(format!(
                "usage increment must be positive, got {amount}"
            )));
        }
        let _guard = self.write_lock.lock().await;
        let applied = self.cf(CF_USAGE_APPLIED)?;
        if self.db.get_cf(&applied, deposit_id.as_bytes())?.is_some() {
            return Ok(false);
        }
        let mut usage = self
            .get_json(CF_USAGE, user_id.as_bytes())?
            .unwrap_or_else(|| UserTransactionUsage::new(user_id, now));
        usage.add(TransferKind::Deposit, amount, now);

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &self.cf(CF_USAGE)?,
            user_id.as_bytes(),
            serde_json::to_vec(&usage)?,
        );
        batch.put_cf(&applied, deposit_id.as_bytes(), user_id.as_bytes());
        self.db.write(batch)?;
        Ok(true)
    }

    async fn reset_expired_periods(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UserTransactionUsage> {
        self.mutate_usage(user_id, now, |usage| {
            usage.roll_expired(now);
        })
        .await
    }
}
