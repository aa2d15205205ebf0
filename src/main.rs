use chrono::Utc;
use clap::Parser;
use fundrail::application::limits::{LimitGate, UsageLedger};
use fundrail::application::retry::{RetryExecutor, RetryPolicy};
use fundrail::application::saga::{ConversionSaga, SagaPorts};
use fundrail::application::webhook::{
    TransferEventData, WebhookEnvelope, WebhookProcessor, WebhookVerifier,
};
use fundrail::config::Settings;
use fundrail::domain::account::{UserProfile, VirtualAccount};
use fundrail::domain::deposit::Deposit;
use fundrail::domain::ports::{
    DepositRepository, DepositRepositoryRef, UsageRepositoryRef, VirtualAccountRepository,
};
use fundrail::error::RailError;
use fundrail::infrastructure::in_memory::{
    InMemoryDepositRepository, InMemoryUsageRepository, InMemoryUserRepository,
    InMemoryVirtualAccountRepository,
};
use fundrail::infrastructure::rail::{RailConversionProvider, Transfer, TransferState};
use fundrail::infrastructure::sandbox::{SandboxBrokerage, SandboxRailClient};
use fundrail::interfaces::csv::deposit_writer::DepositWriter;
use fundrail::interfaces::csv::instruction_reader::{
    DepositInstruction, InstructionReader, SettlementOutcome,
};
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input CSV of deposit instructions
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, env = "FUNDRAIL_DB_PATH")]
    db_path: Option<PathBuf>,

    /// JSON settings file (optional). Missing fields keep their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Shared secret used to sign and verify rail webhooks.
    #[arg(long, env = "FUNDRAIL_WEBHOOK_SECRET")]
    webhook_secret: Option<String>,
}

/// Everything one replay run needs.
struct Replay {
    users: InMemoryUserRepository,
    accounts: InMemoryVirtualAccountRepository,
    gate: LimitGate,
    saga: Arc<ConversionSaga>,
    webhooks: WebhookProcessor,
    verifier: WebhookVerifier,
    rail: SandboxRailClient,
}

impl Replay {
    async fn process(&self, row: DepositInstruction) -> fundrail::error::Result<()> {
        self.users
            .insert(UserProfile::new(row.user, row.kyc_status.clone()))
            .await;
        if self
            .accounts
            .get_by_rail_account_id(&row.rail_account)
            .await?
            .is_none()
        {
            self.accounts
                .insert(VirtualAccount::new(
                    row.user,
                    row.rail_account.clone(),
                    row.brokerage_account.clone(),
                ))
                .await;
        }

        self.gate.validate_deposit(row.user, row.amount.value()).await?;

        let deposit = self
            .saga
            .initiate(row.user, &row.rail_account, row.amount, &row.reference)
            .await?;
        let Some(provider_tx_id) = deposit.provider_tx_id else {
            return Ok(());
        };

        let (event_type, transfer) = match row.outcome {
            SettlementOutcome::Completed => {
                ("transfer.completed", self.rail.complete(&provider_tx_id).await?)
            }
            SettlementOutcome::Failed => ("transfer.failed", self.rail.fail(&provider_tx_id).await?),
            SettlementOutcome::Pending => return Ok(()),
        };

        let body = webhook_body(event_type, &transfer)?;
        let signature = self.verifier.sign(&body)?;
        let outcome = self.webhooks.handle(&body, &signature).await?;
        info!(reference = %row.reference, ?outcome, "webhook delivered");
        Ok(())
    }
}

fn webhook_body(event_type: &str, transfer: &Transfer) -> fundrail::error::Result<Vec<u8>> {
    let status = match transfer.status {
        TransferState::Completed => "completed",
        TransferState::Failed => "failed",
        TransferState::Pending => "pending",
        TransferState::PaymentProcessed => "payment_processed",
        TransferState::Unknown => "unknown",
    };
    let envelope = WebhookEnvelope {
        event_type: event_type.to_string(),
        timestamp: Some(Utc::now().to_rfc3339()),
        data: serde_json::to_value(TransferEventData {
            id: transfer.id.clone(),
            status: Some(status.to_string()),
            source_amount: transfer.source.amount,
            dest_amount: transfer.destination.amount,
            fx_rate: transfer.fx_rate,
        })?,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

fn in_memory_storage() -> (DepositRepositoryRef, UsageRepositoryRef) {
    (
        Arc::new(InMemoryDepositRepository::new()),
        Arc::new(InMemoryUsageRepository::new()),
    )
}

#[cfg(feature = "storage-rocksdb")]
fn open_storage(db_path: Option<&Path>) -> Result<(DepositRepositoryRef, UsageRepositoryRef)> {
    use fundrail::infrastructure::rocksdb::RocksDBStore;

    match db_path {
        Some(path) => {
            let store = RocksDBStore::open(path).into_diagnostic()?;
            Ok((Arc::new(store.clone()), Arc::new(store)))
        }
        None => Ok(in_memory_storage()),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_storage(db_path: Option<&Path>) -> Result<(DepositRepositoryRef, UsageRepositoryRef)> {
    if db_path.is_some() {
        warn!(
            "persistent storage requested via --db-path, but the 'storage-rocksdb' feature is not enabled; falling back to in-memory storage"
        );
    }
    Ok(in_memory_storage())
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => Settings::from_file(path).into_diagnostic()?,
        None => Settings::default(),
    };
    if let Some(secret) = &cli.webhook_secret {
        settings.webhook_secret = secret.clone();
    }
    settings.validate().into_diagnostic()?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(false),
        )
        .init();

    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    let (deposits, usage) = open_storage(cli.db_path.as_deref())?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting in-flight retries");
            on_signal.cancel();
        }
    });

    let users = InMemoryUserRepository::new();
    let accounts = InMemoryVirtualAccountRepository::new();
    let rail = SandboxRailClient::new().with_fee_rate(settings.provider.fee_rate);
    let ledger = Arc::new(UsageLedger::new(usage));
    let saga = Arc::new(ConversionSaga::new(
        SagaPorts {
            deposits: deposits.clone(),
            accounts: Arc::new(accounts.clone()),
            provider: Arc::new(RailConversionProvider::new(
                Arc::new(rail.clone()),
                settings.provider.clone(),
            )),
            brokerage: Arc::new(SandboxBrokerage::new()),
            ledger: ledger.clone(),
        },
        RetryExecutor::new(RetryPolicy::from_settings(&settings.retry)).with_cancellation(cancel),
        settings.saga.clone(),
    ));
    let verifier = WebhookVerifier::new(settings.webhook_secret.clone()).into_diagnostic()?;
    let replay = Replay {
        users: users.clone(),
        accounts,
        gate: LimitGate::new(Arc::new(users), ledger),
        saga: saga.clone(),
        webhooks: WebhookProcessor::new(verifier.clone(), saga.clone()),
        verifier,
        rail,
    };

    // Process instructions
    let file = File::open(&cli.input).into_diagnostic()?;
    let reader = InstructionReader::new(file);
    let mut seen_users: Vec<Uuid> = Vec::new();
    for row_result in reader.instructions() {
        match row_result {
            Ok(row) => {
                if !seen_users.contains(&row.user) {
                    seen_users.push(row.user);
                }
                let reference = row.reference.clone();
                if let Err(e) = replay.process(row).await {
                    match &e {
                        RailError::Limit { .. } | RailError::DuplicateReference(_) => {
                            warn!(%reference, error = %e, "instruction rejected")
                        }
                        _ => warn!(%reference, error = %e, "error processing instruction"),
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "error reading instruction");
            }
        }
    }

    let report = saga.reconcile(Utc::now()).await.into_diagnostic()?;
    info!(?report, "final reconciliation");

    // Collect final state
    let mut results: Vec<Deposit> = Vec::new();
    for user_id in seen_users {
        results.extend(deposits.list_by_user_id(user_id).await.into_diagnostic()?);
    }
    results.sort_by_key(|d| d.created_at);

    // Output final state
    let stdout = io::stdout();
    let mut writer = DepositWriter::new(stdout.lock());
    writer.write_deposits(&results).into_diagnostic()?;

    Ok(())
}
