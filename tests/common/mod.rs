#![allow(dead_code)]

use fundrail::application::limits::{LimitGate, UsageLedger};
use fundrail::application::retry::{RetryExecutor, RetryPolicy};
use fundrail::application::saga::{ConversionSaga, SagaPorts};
use fundrail::config::{ProviderSettings, SagaSettings};
use fundrail::domain::account::{UserProfile, VirtualAccount};
use fundrail::infrastructure::in_memory::{
    InMemoryDepositRepository, InMemoryUsageRepository, InMemoryUserRepository,
    InMemoryVirtualAccountRepository,
};
use fundrail::infrastructure::rail::RailConversionProvider;
use fundrail::infrastructure::sandbox::{SandboxBrokerage, SandboxRailClient};
use rust_decimal_macros::dec;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use uuid::Uuid;

pub const HEADER: &str =
    "user, kyc_status, rail_account, brokerage_account, reference, amount, outcome";

/// Writes a replay file with the standard header followed by `rows`.
pub fn instruction_file<S: AsRef<str>>(rows: &[S]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{HEADER}").unwrap();
    for row in rows {
        writeln!(file, "{}", row.as_ref()).unwrap();
    }
    file.flush().unwrap();
    file
}

/// Finds the report line for `reference` and splits it into fields.
pub fn report_row(stdout: &str, reference: &str) -> Option<Vec<String>> {
    stdout
        .lines()
        .find(|line| line.starts_with(&format!("{reference},")))
        .map(|line| line.split(',').map(str::to_string).collect())
}

/// The whole pipeline wired against in-memory adapters and the sandbox rail.
pub struct Harness {
    pub rail: SandboxRailClient,
    pub brokerage: SandboxBrokerage,
    pub deposits: Arc<InMemoryDepositRepository>,
    pub accounts: Arc<InMemoryVirtualAccountRepository>,
    pub users: Arc<InMemoryUserRepository>,
    pub usage: Arc<InMemoryUsageRepository>,
    pub ledger: Arc<UsageLedger>,
    pub gate: LimitGate,
    pub saga: Arc<ConversionSaga>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_retry(RetryExecutor::new(RetryPolicy::default()))
    }

    pub fn with_retry(retry: RetryExecutor) -> Self {
        let rail = SandboxRailClient::new().with_fee_rate(dec!(0.005));
        let brokerage = SandboxBrokerage::new();
        let deposits = Arc::new(InMemoryDepositRepository::new());
        let accounts = Arc::new(InMemoryVirtualAccountRepository::new());
        let users = Arc::new(InMemoryUserRepository::new());
        let usage = Arc::new(InMemoryUsageRepository::new());
        let ledger = Arc::new(UsageLedger::new(usage.clone()));

        let saga = Arc::new(ConversionSaga::new(
            SagaPorts {
                deposits: deposits.clone(),
                accounts: accounts.clone(),
                provider: Arc::new(RailConversionProvider::new(
                    Arc::new(rail.clone()),
                    ProviderSettings::default(),
                )),
                brokerage: Arc::new(brokerage.clone()),
                ledger: ledger.clone(),
            },
            retry,
            SagaSettings::default(),
        ));

        Self {
            gate: LimitGate::new(users.clone(), ledger.clone()),
            rail,
            brokerage,
            deposits,
            accounts,
            users,
            usage,
            ledger,
            saga,
        }
    }

    /// Registers a user with `kyc_status` and a virtual account on `rail_account`.
    pub async fn register(&self, kyc_status: &str, rail_account: &str) -> Uuid {
        let user_id = Uuid::new_v4();
        self.users.insert(UserProfile::new(user_id, kyc_status)).await;
        self.accounts
            .insert(VirtualAccount::new(
                user_id,
                rail_account,
                format!("brk-{rail_account}"),
            ))
            .await;
        user_id
    }
}
