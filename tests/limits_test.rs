mod common;

use chrono::{Duration, Utc};
use common::Harness;
use fundrail::domain::limits::{LimitViolation, TransferKind, UserTransactionUsage};
use fundrail::domain::money::Amount;
use fundrail::domain::ports::UsageRepository;
use fundrail::error::RailError;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[tokio::test]
async fn test_concurrent_increments_are_not_lost() {
    let harness = Harness::new();
    let user_id = harness.register("approved", "rail-1").await;

    let cents: Vec<i64> = {
        let mut rng = rand::thread_rng();
        (0..64).map(|_| rng.gen_range(1..=5_000)).collect()
    };
    let expected: Decimal = cents.iter().map(|c| Decimal::new(*c, 2)).sum();

    let mut handles = Vec::new();
    for c in cents {
        let ledger = harness.ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .record_deposit(user_id, Amount::new(Decimal::new(c, 2)).unwrap())
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let usage = harness.usage.get_or_create(user_id, Utc::now()).await.unwrap();
    assert_eq!(usage.daily(TransferKind::Deposit).used, expected);
    assert_eq!(usage.monthly(TransferKind::Deposit).used, expected);
}

#[tokio::test]
async fn test_daily_limit_blocks_then_resets() {
    let harness = Harness::new();
    let user_id = harness.register("approved", "rail-1").await;

    harness
        .gate
        .record_deposit(user_id, Amount::new(dec!(4500)).unwrap())
        .await
        .unwrap();
    let err = harness
        .gate
        .validate_deposit(user_id, dec!(1000))
        .await
        .unwrap_err();
    match err {
        RailError::Limit { violation, check } => {
            assert_eq!(violation, LimitViolation::DailyExceeded);
            assert_eq!(check.remaining_capacity, dec!(500));
        }
        other => panic!("expected a limit error, got {other:?}"),
    }

    // Pretend the day rolled over.
    let mut usage = harness.usage.get_or_create(user_id, Utc::now()).await.unwrap();
    usage.daily_deposit.reset_at = Utc::now() - Duration::minutes(1);
    harness.usage.insert(usage).await;

    let check = harness
        .gate
        .validate_deposit(user_id, dec!(1000))
        .await
        .unwrap();
    assert!(check.allowed);
    let usage = harness.usage.get_or_create(user_id, Utc::now()).await.unwrap();
    assert_eq!(usage.daily(TransferKind::Deposit).used, dec!(0));
    assert_eq!(usage.monthly(TransferKind::Deposit).used, dec!(4500));
}

#[tokio::test]
async fn test_unverified_tier_is_tighter() {
    let harness = Harness::new();
    let user_id = harness.register("pending", "rail-1").await;

    assert!(harness.gate.validate_deposit(user_id, dec!(100)).await.is_ok());
    assert!(matches!(
        harness.gate.validate_deposit(user_id, dec!(100.01)).await,
        Err(RailError::Limit {
            violation: LimitViolation::DailyExceeded,
            ..
        })
    ));

    let limits = harness.gate.user_limits(user_id).await.unwrap();
    assert_eq!(limits.deposit.daily.limit, dec!(100));
    assert_eq!(limits.withdrawal.monthly.limit, dec!(200));
}

#[tokio::test]
async fn test_fresh_usage_starts_empty() {
    let harness = Harness::new();
    let user_id = harness.register("advanced_approved", "rail-1").await;
    let usage: UserTransactionUsage = harness.usage.get_or_create(user_id, Utc::now()).await.unwrap();
    assert_eq!(usage.user_id, user_id);
    assert_eq!(usage.daily(TransferKind::Withdrawal).used, dec!(0));
    assert!(usage.daily_deposit.reset_at > Utc::now());
}
