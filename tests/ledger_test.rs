//! Reward ledger integration tests: hold protocol, coupon lifecycle and
//! wallet summaries over the in-memory store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use bookvine::db::rewarddb::RewardLedgerExt;
use bookvine::db::MemStore;
use bookvine::models::rewardmodels::{
    DiscountType, NewCoupon, RewardKind, RewardTransactionStatus, RewardTransactionType,
};
use bookvine::models::TenantScope;
use bookvine::service::error::ServiceError;
use bookvine::service::reward_ledger::{IssuedReward, RewardLedger};

fn scope() -> TenantScope {
    TenantScope::new(Uuid::new_v4(), Uuid::new_v4())
}

fn ledger() -> (Arc<MemStore>, RewardLedger<MemStore>) {
    let store = Arc::new(MemStore::new());
    let ledger = RewardLedger::new(store.clone());
    (store, ledger)
}

async fn credit(ledger: &RewardLedger<MemStore>, scope: TenantScope, user: Uuid, amount: i64) {
    ledger
        .issue_reward(
            scope,
            user,
            None,
            &RewardKind::WalletCredit { amount },
            "test credit",
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn confirmed_hold_debits_exactly_once() {
    let scope = scope();
    let (store, ledger) = ledger();
    let user = Uuid::new_v4();
    let appointment = Uuid::new_v4();

    credit(&ledger, scope, user, 1000).await;

    let hold = ledger
        .reserve_hold(scope, user, appointment, 400, "apply wallet credit")
        .await
        .unwrap()
        .expect("hold written");
    assert_eq!(hold.status, RewardTransactionStatus::Pending);

    // The hold reserves spendable funds without moving the balance.
    let summary = ledger.wallet_summary(scope, user).await.unwrap();
    assert_eq!(summary.balance, 1000);
    assert_eq!(summary.pending_hold_total, 400);
    assert_eq!(summary.available_balance, 600);

    let debited = ledger.confirm_hold(scope, appointment).await.unwrap();
    assert_eq!(debited, 400);

    let summary = ledger.wallet_summary(scope, user).await.unwrap();
    assert_eq!(summary.balance, 600);
    assert_eq!(summary.pending_hold_total, 0);
    assert_eq!(summary.available_balance, 600);

    // Replay finds no pending holds and debits nothing.
    let debited = ledger.confirm_hold(scope, appointment).await.unwrap();
    assert_eq!(debited, 0);
    let summary = ledger.wallet_summary(scope, user).await.unwrap();
    assert_eq!(summary.balance, 600);

    let txns = store.transactions().await;
    let debits = txns
        .iter()
        .filter(|t| t.txn_type == RewardTransactionType::Debit)
        .count();
    assert_eq!(debits, 1);
}

#[tokio::test]
async fn released_hold_leaves_the_balance_alone() {
    let scope = scope();
    let (store, ledger) = ledger();
    let user = Uuid::new_v4();
    let appointment = Uuid::new_v4();

    credit(&ledger, scope, user, 1000).await;
    ledger
        .reserve_hold(scope, user, appointment, 400, "apply wallet credit")
        .await
        .unwrap();

    let released = ledger.release_hold(scope, appointment).await.unwrap();
    assert_eq!(released, 1);

    let summary = ledger.wallet_summary(scope, user).await.unwrap();
    assert_eq!(summary.balance, 1000);
    assert_eq!(summary.pending_hold_total, 0);

    let txns = store.transactions().await;
    assert!(txns
        .iter()
        .any(|t| t.txn_type == RewardTransactionType::Release));
    assert!(txns.iter().all(|t| t.txn_type != RewardTransactionType::Debit));
}

#[tokio::test]
async fn non_positive_hold_is_a_noop() {
    let scope = scope();
    let (store, ledger) = ledger();
    let user = Uuid::new_v4();

    let hold = ledger
        .reserve_hold(scope, user, Uuid::new_v4(), 0, "nothing")
        .await
        .unwrap();
    assert!(hold.is_none());
    assert!(store.transactions().await.is_empty());
}

#[tokio::test]
async fn coupon_usage_round_trip() {
    let scope = scope();
    let (store, ledger) = ledger();
    let user = Uuid::new_v4();
    let appointment = Uuid::new_v4();

    let issued = ledger
        .issue_reward(
            scope,
            user,
            None,
            &RewardKind::PercentDiscount { percent: 20 },
            "referral reward",
        )
        .await
        .unwrap()
        .expect("coupon issued");
    let coupon = match issued {
        IssuedReward::Coupon(coupon, _) => coupon,
        IssuedReward::Credit(_) => panic!("expected a coupon"),
    };

    ledger
        .validate_coupon(scope, user, coupon.id, None, Utc::now())
        .await
        .unwrap();

    ledger
        .reserve_coupon_usage(scope, user, coupon.id, appointment, None)
        .await
        .unwrap();

    // Single-use: a second booking cannot reserve it while the first holds it.
    let err = ledger
        .reserve_coupon_usage(scope, user, coupon.id, Uuid::new_v4(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::CouponExhausted(_)));

    // Cancelling gives the use back...
    ledger.cancel_coupon_usage(scope, appointment).await.unwrap();
    let refreshed = store.get_coupon(scope, coupon.id).await.unwrap().unwrap();
    assert_eq!(refreshed.used_count, 0);

    // ...and a reserve/confirm cycle consumes it for good.
    ledger
        .reserve_coupon_usage(scope, user, coupon.id, appointment, None)
        .await
        .unwrap();
    let confirmed = ledger.confirm_coupon_usage(scope, appointment).await.unwrap();
    assert_eq!(confirmed, 1);

    let spent = store.get_coupon(scope, coupon.id).await.unwrap().unwrap();
    assert_eq!(spent.remaining_uses(), 0);
    let err = ledger
        .validate_coupon(scope, user, coupon.id, None, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::CouponExhausted(_)));
}

#[tokio::test]
async fn coupon_validation_reports_each_violation_distinctly() {
    let scope = scope();
    let (store, ledger) = ledger();
    let owner = Uuid::new_v4();
    let stranger = Uuid::new_v4();
    let service = Uuid::new_v4();
    let now = Utc::now();

    let err = ledger
        .validate_coupon(scope, owner, Uuid::new_v4(), None, now)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));

    let (free_service, _) = store
        .issue_coupon(
            scope,
            owner,
            NewCoupon {
                owner_user_id: Some(owner),
                discount_type: DiscountType::FreeService,
                discount_value: None,
                service_id: Some(service),
                max_uses: 1,
                valid_from: None,
                valid_to: None,
            },
            None,
            "free service reward",
        )
        .await
        .unwrap();

    let err = ledger
        .validate_coupon(scope, stranger, free_service.id, Some(service), now)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::CouponNotOwned(_)));

    let err = ledger
        .validate_coupon(scope, owner, free_service.id, Some(Uuid::new_v4()), now)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::CouponServiceMismatch(_)));

    let err = ledger
        .validate_coupon(scope, owner, free_service.id, None, now)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::CouponServiceMismatch(_)));

    let (not_yet, _) = store
        .issue_coupon(
            scope,
            owner,
            NewCoupon {
                owner_user_id: Some(owner),
                discount_type: DiscountType::Fixed,
                discount_value: Some(500),
                service_id: None,
                max_uses: 1,
                valid_from: Some(now + Duration::days(1)),
                valid_to: None,
            },
            None,
            "scheduled promo",
        )
        .await
        .unwrap();
    let err = ledger
        .validate_coupon(scope, owner, not_yet.id, None, now)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::CouponNotStarted(_)));

    let (lapsed, _) = store
        .issue_coupon(
            scope,
            owner,
            NewCoupon {
                owner_user_id: Some(owner),
                discount_type: DiscountType::Fixed,
                discount_value: Some(500),
                service_id: None,
                max_uses: 1,
                valid_from: None,
                valid_to: Some(now - Duration::days(1)),
            },
            None,
            "lapsed promo",
        )
        .await
        .unwrap();
    let err = ledger
        .validate_coupon(scope, owner, lapsed.id, None, now)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::CouponExpired(_)));
}

#[tokio::test]
async fn wallet_summary_includes_recent_activity_and_coupons() {
    let scope = scope();
    let (_store, ledger) = ledger();
    let user = Uuid::new_v4();

    credit(&ledger, scope, user, 250).await;
    credit(&ledger, scope, user, 750).await;
    ledger
        .issue_reward(
            scope,
            user,
            None,
            &RewardKind::FixedDiscount { amount: 500 },
            "welcome coupon",
        )
        .await
        .unwrap();

    let summary = ledger.wallet_summary(scope, user).await.unwrap();
    assert_eq!(summary.balance, 1000);
    assert_eq!(summary.available_balance, 1000);
    assert_eq!(summary.recent_transactions.len(), 3);
    assert_eq!(summary.active_coupons.len(), 1);
    assert_eq!(summary.active_coupons[0].discount_type, DiscountType::Fixed);
}

#[tokio::test]
async fn zero_value_wallet_reward_is_skipped() {
    let scope = scope();
    let (store, ledger) = ledger();
    let user = Uuid::new_v4();

    let issued = ledger
        .issue_reward(
            scope,
            user,
            None,
            &RewardKind::WalletCredit { amount: 0 },
            "nothing",
        )
        .await
        .unwrap();
    assert!(issued.is_none());
    assert!(store.transactions().await.is_empty());
}

#[tokio::test]
async fn wallets_are_isolated_per_tenant_scope() {
    let scope_a = scope();
    let scope_b = scope();
    let (store, ledger) = ledger();
    let user = Uuid::new_v4();

    credit(&ledger, scope_a, user, 900).await;

    // The sibling scope has no wallet row at all until someone touches it.
    assert!(store.get_wallet(scope_b, user).await.unwrap().is_none());

    let wallet_a = ledger.ensure_wallet(scope_a, user).await.unwrap();
    let wallet_b = ledger.ensure_wallet(scope_b, user).await.unwrap();
    assert_eq!(wallet_a.balance, 900);
    assert_eq!(wallet_b.balance, 0);
}
