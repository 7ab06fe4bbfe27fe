//! Attribution state machine integration tests over the in-memory store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use bookvine::db::referraldb::ReferralExt;
use bookvine::db::MemStore;
use bookvine::dtos::referraldtos::{AttachBookingDto, AttributeReferralDto, BookingCompletionDto};
use bookvine::models::referralmodel::{
    AttributionStatus, NewAttribution, ReferredIdentity, VoidReason,
};
use bookvine::models::usermodel::UserProfile;
use bookvine::models::TenantScope;
use bookvine::service::attribution_service::CompletionOutcome;
use bookvine::service::error::ServiceError;
use bookvine::service::program::{ReferralProgramConfig, RewardSpec, StaticProgramSource};
use bookvine::ReferralModule;

fn scope() -> TenantScope {
    TenantScope::new(Uuid::new_v4(), Uuid::new_v4())
}

fn module(config: ReferralProgramConfig) -> (Arc<MemStore>, ReferralModule<MemStore>) {
    let store = Arc::new(MemStore::new());
    let source = Arc::new(StaticProgramSource::new(config));
    let module = ReferralModule::new(
        store.clone(),
        source,
        "https://book.example.com".to_string(),
    );
    (store, module)
}

fn both_wallet_rewards() -> ReferralProgramConfig {
    ReferralProgramConfig {
        reward_referrer: Some(RewardSpec::wallet(500)),
        reward_referred: Some(RewardSpec::wallet(500)),
        ..Default::default()
    }
}

async fn seed_referrer(store: &MemStore, scope: TenantScope) -> UserProfile {
    let referrer = UserProfile {
        id: Uuid::new_v4(),
        name: "Rita Referrer".to_string(),
        email: Some("rita@example.com".to_string()),
        phone: Some("15550100200".to_string()),
    };
    store.add_user(scope, referrer.clone()).await;
    referrer
}

fn attribute_dto(code: &str, email: &str) -> AttributeReferralDto {
    AttributeReferralDto {
        code: code.to_string(),
        referred_email: Some(email.to_string()),
        ..Default::default()
    }
}

fn attach_dto(appointment_id: Uuid, email: &str, user_id: Option<Uuid>) -> AttachBookingDto {
    AttachBookingDto {
        appointment_id,
        customer_email: Some(email.to_string()),
        customer_user_id: user_id,
        ..Default::default()
    }
}

fn completion_dto(appointment_id: Uuid, amount: i64) -> BookingCompletionDto {
    BookingCompletionDto {
        appointment_id,
        service_id: None,
        amount,
    }
}

#[tokio::test]
async fn full_referral_flow_rewards_both_parties() {
    let scope = scope();
    let (store, module) = module(both_wallet_rewards());
    let referrer = seed_referrer(&store, scope).await;
    let referred_user = Uuid::new_v4();
    let appointment = Uuid::new_v4();

    let code = module.registry.get_or_create(scope, referrer.id).await.unwrap();
    assert!(module.registry.referral_link(&code).contains(&code.code));

    let attribution = module
        .engine
        .attribute(scope, attribute_dto(&code.code, "jane@example.com"))
        .await
        .unwrap();
    assert_eq!(attribution.status, AttributionStatus::Attributed);

    let booked = module
        .engine
        .attach_to_booking(scope, attach_dto(appointment, "jane@example.com", Some(referred_user)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(booked.status, AttributionStatus::Booked);
    // The contact-based attribution picked up the real user at booking time.
    assert_eq!(booked.referred_user_id, Some(referred_user));

    let outcome = module
        .engine
        .on_booking_completed(scope, completion_dto(appointment, 7500))
        .await
        .unwrap();
    let issued = match outcome {
        CompletionOutcome::Rewarded { issued } => issued,
        other => panic!("expected Rewarded, got {:?}", other),
    };
    assert_eq!(issued.attribution.status, AttributionStatus::Rewarded);
    assert!(issued.referrer_txn.is_some());
    assert!(issued.referred_txn.is_some());

    let referrer_wallet = module.ledger.ensure_wallet(scope, referrer.id).await.unwrap();
    let referred_wallet = module.ledger.ensure_wallet(scope, referred_user).await.unwrap();
    assert_eq!(referrer_wallet.balance, 500);
    assert_eq!(referred_wallet.balance, 500);

    let notifications = store.notifications().await;
    assert_eq!(notifications.len(), 2);

    let overview = module.engine.get_overview(scope).await.unwrap();
    assert_eq!(overview.total, 1);
    assert_eq!(overview.rewarded, 1);
    assert_eq!(overview.attributed_revenue, 7500);
    assert_eq!(overview.total_rewards_paid, 1000);
    assert_eq!(overview.top_referrers[0].user_id, referrer.id);

    let listed = module.engine.list_referrals(scope, referrer.id, 10, 0).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, AttributionStatus::Rewarded);
    assert_eq!(listed[0].first_appointment_id, Some(appointment));
    assert_eq!(listed[0].void_reason, None);
}

#[tokio::test]
async fn completing_the_same_booking_twice_pays_once() {
    let scope = scope();
    let (store, module) = module(both_wallet_rewards());
    let referrer = seed_referrer(&store, scope).await;
    let referred_user = Uuid::new_v4();
    let appointment = Uuid::new_v4();

    let code = module.registry.get_or_create(scope, referrer.id).await.unwrap();
    module
        .engine
        .attribute(scope, attribute_dto(&code.code, "jane@example.com"))
        .await
        .unwrap();
    module
        .engine
        .attach_to_booking(scope, attach_dto(appointment, "jane@example.com", Some(referred_user)))
        .await
        .unwrap();

    let first = module
        .engine
        .on_booking_completed(scope, completion_dto(appointment, 7500))
        .await
        .unwrap();
    assert!(matches!(first, CompletionOutcome::Rewarded { .. }));

    let replay = module
        .engine
        .on_booking_completed(scope, completion_dto(appointment, 7500))
        .await
        .unwrap();
    assert!(matches!(replay, CompletionOutcome::NoAttribution));

    let wallet = module.ledger.ensure_wallet(scope, referrer.id).await.unwrap();
    assert_eq!(wallet.balance, 500);
}

#[tokio::test]
async fn voiding_reverses_rewards_and_keeps_original_rows() {
    let scope = scope();
    let config = ReferralProgramConfig {
        reward_referrer: Some(RewardSpec::wallet(500)),
        reward_referred: Some(RewardSpec {
            reward_type: bookvine::service::program::RewardType::PercentDiscount,
            value: 20,
            service_id: None,
        }),
        ..Default::default()
    };
    let (store, module) = module(config);
    let referrer = seed_referrer(&store, scope).await;
    let referred_user = Uuid::new_v4();
    let appointment = Uuid::new_v4();

    let code = module.registry.get_or_create(scope, referrer.id).await.unwrap();
    module
        .engine
        .attribute(scope, attribute_dto(&code.code, "jane@example.com"))
        .await
        .unwrap();
    module
        .engine
        .attach_to_booking(scope, attach_dto(appointment, "jane@example.com", Some(referred_user)))
        .await
        .unwrap();
    let outcome = module
        .engine
        .on_booking_completed(scope, completion_dto(appointment, 7500))
        .await
        .unwrap();
    let issued = match outcome {
        CompletionOutcome::Rewarded { issued } => issued,
        other => panic!("expected Rewarded, got {:?}", other),
    };
    let coupon = issued.referred_coupon.expect("referred coupon issued");

    let (voided, summary) = module
        .engine
        .void_attribution(scope, issued.attribution.id, VoidReason::Manual)
        .await
        .unwrap();
    assert_eq!(voided.status, AttributionStatus::Voided);
    assert_eq!(voided.void_reason(), Some("manual"));
    assert_eq!(summary.reversed_amount, 500);
    assert_eq!(summary.coupons_deactivated, 1);

    // Wallet back to baseline, coupon dead, originals untouched.
    let wallet = module.ledger.ensure_wallet(scope, referrer.id).await.unwrap();
    assert_eq!(wallet.balance, 0);
    let err = module
        .ledger
        .validate_coupon(scope, referred_user, coupon.id, None, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::CouponInactive(_)));

    let txns = store.transactions().await;
    assert!(txns.iter().any(|t| {
        t.txn_type == bookvine::models::rewardmodels::RewardTransactionType::Credit
            && t.status == bookvine::models::rewardmodels::RewardTransactionStatus::Confirmed
    }));
    assert_eq!(
        txns.iter()
            .filter(|t| t.txn_type == bookvine::models::rewardmodels::RewardTransactionType::Adjustment)
            .count(),
        2
    );

    // Voiding again is an idempotent success that reverses nothing more.
    let (again, summary) = module
        .engine
        .void_attribution(scope, voided.id, VoidReason::Manual)
        .await
        .unwrap();
    assert_eq!(again.status, AttributionStatus::Voided);
    assert_eq!(summary.reversed_amount, 0);
    let wallet = module.ledger.ensure_wallet(scope, referrer.id).await.unwrap();
    assert_eq!(wallet.balance, 0);
}

#[tokio::test]
async fn cancelled_booking_reopens_the_attribution() {
    let scope = scope();
    let (store, module) = module(both_wallet_rewards());
    let referrer = seed_referrer(&store, scope).await;
    let first_appointment = Uuid::new_v4();
    let second_appointment = Uuid::new_v4();

    let code = module.registry.get_or_create(scope, referrer.id).await.unwrap();
    module
        .engine
        .attribute(scope, attribute_dto(&code.code, "jane@example.com"))
        .await
        .unwrap();
    module
        .engine
        .attach_to_booking(scope, attach_dto(first_appointment, "jane@example.com", None))
        .await
        .unwrap();

    let reopened = module
        .engine
        .on_booking_cancelled(scope, first_appointment)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reopened.status, AttributionStatus::Attributed);
    assert_eq!(reopened.first_appointment_id, None);

    // Cancelling an appointment with no referral in play is a quiet no-op.
    assert!(module
        .engine
        .on_booking_cancelled(scope, first_appointment)
        .await
        .unwrap()
        .is_none());

    let rebooked = module
        .engine
        .attach_to_booking(scope, attach_dto(second_appointment, "jane@example.com", None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rebooked.first_appointment_id, Some(second_appointment));
}

#[tokio::test]
async fn reattaching_the_same_appointment_is_idempotent() {
    let scope = scope();
    let (store, module) = module(both_wallet_rewards());
    let referrer = seed_referrer(&store, scope).await;
    let appointment = Uuid::new_v4();

    let code = module.registry.get_or_create(scope, referrer.id).await.unwrap();
    let attribution = module
        .engine
        .attribute(scope, attribute_dto(&code.code, "jane@example.com"))
        .await
        .unwrap();
    module
        .engine
        .attach_to_booking(scope, attach_dto(appointment, "jane@example.com", None))
        .await
        .unwrap();

    let again = module
        .engine
        .attach_to_booking(scope, attach_dto(appointment, "jane@example.com", None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.id, attribution.id);

    // A different appointment cannot steal a booked attribution by id.
    let err = module
        .engine
        .attach_to_booking(
            scope,
            AttachBookingDto {
                appointment_id: Uuid::new_v4(),
                attribution_id: Some(attribution.id),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotEligible(_)));
}

#[tokio::test]
async fn self_referral_is_blocked_by_policy() {
    let scope = scope();
    let (store, module) = module(both_wallet_rewards());
    let referrer = seed_referrer(&store, scope).await;

    let code = module.registry.get_or_create(scope, referrer.id).await.unwrap();

    let err = module
        .engine
        .attribute(scope, attribute_dto(&code.code, "RITA@example.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::SelfReferral));

    let by_user = AttributeReferralDto {
        code: code.code.clone(),
        referred_user_id: Some(referrer.id),
        ..Default::default()
    };
    let err = module.engine.attribute(scope, by_user).await.unwrap_err();
    assert!(matches!(err, ServiceError::SelfReferral));
}

#[tokio::test]
async fn self_referral_allowed_when_flags_are_off() {
    let scope = scope();
    let mut config = both_wallet_rewards();
    config.anti_fraud.block_self_by_contact = false;
    let (store, module) = module(config);
    let referrer = seed_referrer(&store, scope).await;

    let code = module.registry.get_or_create(scope, referrer.id).await.unwrap();
    let attribution = module
        .engine
        .attribute(scope, attribute_dto(&code.code, "rita@example.com"))
        .await
        .unwrap();
    assert_eq!(attribution.status, AttributionStatus::Attributed);
}

#[tokio::test]
async fn duplicate_open_referral_for_a_contact_is_blocked() {
    let scope = scope();
    let (store, module) = module(both_wallet_rewards());
    let referrer = seed_referrer(&store, scope).await;
    let other_referrer = seed_referrer(&store, scope).await;

    let code = module.registry.get_or_create(scope, referrer.id).await.unwrap();
    let other_code = module
        .registry
        .get_or_create(scope, other_referrer.id)
        .await
        .unwrap();

    module
        .engine
        .attribute(scope, attribute_dto(&code.code, "jane@example.com"))
        .await
        .unwrap();

    // Same contact through a different referrer's code.
    let err = module
        .engine
        .attribute(scope, attribute_dto(&other_code.code, "jane@example.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::DuplicateReferral));
}

#[tokio::test]
async fn expired_attribution_cannot_be_attached_and_flips_lazily() {
    let scope = scope();
    let config = ReferralProgramConfig {
        attribution_expiry_days: 0,
        ..both_wallet_rewards()
    };
    let (store, module) = module(config);
    let referrer = seed_referrer(&store, scope).await;

    let code = module.registry.get_or_create(scope, referrer.id).await.unwrap();
    let attribution = module
        .engine
        .attribute(scope, attribute_dto(&code.code, "jane@example.com"))
        .await
        .unwrap();

    let err = module
        .engine
        .attach_to_booking(
            scope,
            AttachBookingDto {
                appointment_id: Uuid::new_v4(),
                attribution_id: Some(attribution.id),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Expired));

    let stored = store
        .get_attribution(scope, attribution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, AttributionStatus::Expired);

    // The expired row no longer blocks a fresh attribution for the contact.
    let fresh = module
        .engine
        .attribute(scope, attribute_dto(&code.code, "jane@example.com"))
        .await
        .unwrap();
    assert_eq!(fresh.status, AttributionStatus::Attributed);
}

#[tokio::test]
async fn attribution_expired_by_completion_time_pays_nothing() {
    let scope = scope();
    let (store, module) = module(both_wallet_rewards());
    let referrer = seed_referrer(&store, scope).await;
    let appointment = Uuid::new_v4();

    let code = module.registry.get_or_create(scope, referrer.id).await.unwrap();
    let attribution = store
        .insert_attribution(NewAttribution {
            scope,
            code_id: code.id,
            referrer_user_id: referrer.id,
            referred_user_id: None,
            referred_email: Some("jane@example.com".to_string()),
            referred_phone: None,
            attributed_at: Utc::now() - Duration::days(40),
            expires_at: Utc::now() - Duration::days(10),
            metadata: None,
        })
        .await
        .unwrap();
    store
        .set_attribution_booked(scope, attribution.id, appointment, None)
        .await
        .unwrap();

    let outcome = module
        .engine
        .on_booking_completed(scope, completion_dto(appointment, 5000))
        .await
        .unwrap();
    assert!(matches!(outcome, CompletionOutcome::Expired));

    let wallet = module.ledger.ensure_wallet(scope, referrer.id).await.unwrap();
    assert_eq!(wallet.balance, 0);

    // Expired rows cannot be voided.
    let err = module
        .engine
        .void_attribution(scope, attribution.id, VoidReason::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotEligible(_)));
}

#[tokio::test]
async fn cancelling_an_expired_booking_always_yields_expired() {
    let scope = scope();
    let (store, module) = module(both_wallet_rewards());
    let referrer = seed_referrer(&store, scope).await;
    let appointment = Uuid::new_v4();

    let code = module.registry.get_or_create(scope, referrer.id).await.unwrap();
    let attribution = store
        .insert_attribution(NewAttribution {
            scope,
            code_id: code.id,
            referrer_user_id: referrer.id,
            referred_user_id: None,
            referred_email: Some("jane@example.com".to_string()),
            referred_phone: None,
            attributed_at: Utc::now() - Duration::days(40),
            expires_at: Utc::now() - Duration::days(10),
            metadata: None,
        })
        .await
        .unwrap();
    store
        .set_attribution_booked(scope, attribution.id, appointment, None)
        .await
        .unwrap();

    let cancelled = module
        .engine
        .on_booking_cancelled(scope, appointment)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cancelled.status, AttributionStatus::Expired);
}

#[tokio::test]
async fn referrer_cannot_consume_their_own_referral_at_booking() {
    let scope = scope();
    let (store, module) = module(both_wallet_rewards());
    let referrer = seed_referrer(&store, scope).await;

    let code = module.registry.get_or_create(scope, referrer.id).await.unwrap();
    module
        .engine
        .attribute(scope, attribute_dto(&code.code, "jane@example.com"))
        .await
        .unwrap();

    let err = module
        .engine
        .attach_to_booking(
            scope,
            attach_dto(Uuid::new_v4(), "jane@example.com", Some(referrer.id)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::SelfReferral));
}

#[tokio::test]
async fn attaching_with_the_referrers_own_contact_is_blocked() {
    let scope = scope();
    let (store, module) = module(both_wallet_rewards());
    let referrer = seed_referrer(&store, scope).await;

    let code = module.registry.get_or_create(scope, referrer.id).await.unwrap();
    let attribution = module
        .engine
        .attribute(scope, attribute_dto(&code.code, "jane@example.com"))
        .await
        .unwrap();

    // Explicit attribution id, the referrer's own email, no platform user id.
    let err = module
        .engine
        .attach_to_booking(
            scope,
            AttachBookingDto {
                appointment_id: Uuid::new_v4(),
                attribution_id: Some(attribution.id),
                customer_email: Some("rita@example.com".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::SelfReferral));

    // Same by phone, in a display format that normalizes to the referrer's.
    let err = module
        .engine
        .attach_to_booking(
            scope,
            AttachBookingDto {
                appointment_id: Uuid::new_v4(),
                attribution_id: Some(attribution.id),
                customer_phone: Some("+1 (555) 010-0200".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::SelfReferral));

    // The attribution stays open for the genuine referred customer.
    let booked = module
        .engine
        .attach_to_booking(scope, attach_dto(Uuid::new_v4(), "jane@example.com", None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(booked.id, attribution.id);
    assert_eq!(booked.status, AttributionStatus::Booked);
}

#[tokio::test]
async fn coupon_reward_for_the_referrer_is_surfaced() {
    let scope = scope();
    let config = ReferralProgramConfig {
        reward_referrer: Some(RewardSpec {
            reward_type: bookvine::service::program::RewardType::PercentDiscount,
            value: 15,
            service_id: None,
        }),
        ..Default::default()
    };
    let (store, module) = module(config);
    let referrer = seed_referrer(&store, scope).await;
    let appointment = Uuid::new_v4();

    let code = module.registry.get_or_create(scope, referrer.id).await.unwrap();
    module
        .engine
        .attribute(scope, attribute_dto(&code.code, "jane@example.com"))
        .await
        .unwrap();
    module
        .engine
        .attach_to_booking(scope, attach_dto(appointment, "jane@example.com", None))
        .await
        .unwrap();

    let outcome = module
        .engine
        .on_booking_completed(scope, completion_dto(appointment, 5000))
        .await
        .unwrap();
    let issued = match outcome {
        CompletionOutcome::Rewarded { issued } => issued,
        other => panic!("expected Rewarded, got {:?}", other),
    };

    let coupon = issued.referrer_coupon.expect("referrer coupon issued");
    assert_eq!(coupon.owner_user_id, Some(referrer.id));
    assert!(issued.referrer_txn.is_some());
    assert!(issued.referred_txn.is_none());

    // The coupon alone is enough to trigger the referrer's notification.
    let notifications = store.notifications().await;
    assert_eq!(notifications.len(), 1);
}

#[tokio::test]
async fn disallowed_service_voids_at_completion() {
    let scope = scope();
    let allowed = Uuid::new_v4();
    let config = ReferralProgramConfig {
        allowed_service_ids: vec![allowed],
        ..both_wallet_rewards()
    };
    let (store, module) = module(config);
    let referrer = seed_referrer(&store, scope).await;
    let appointment = Uuid::new_v4();

    let code = module.registry.get_or_create(scope, referrer.id).await.unwrap();
    module
        .engine
        .attribute(scope, attribute_dto(&code.code, "jane@example.com"))
        .await
        .unwrap();
    module
        .engine
        .attach_to_booking(scope, attach_dto(appointment, "jane@example.com", None))
        .await
        .unwrap();

    let outcome = module
        .engine
        .on_booking_completed(
            scope,
            BookingCompletionDto {
                appointment_id: appointment,
                service_id: Some(Uuid::new_v4()),
                amount: 5000,
            },
        )
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        CompletionOutcome::Voided {
            reason: VoidReason::ServiceNotAllowed
        }
    ));

    let wallet = module.ledger.ensure_wallet(scope, referrer.id).await.unwrap();
    assert_eq!(wallet.balance, 0);
}

#[tokio::test]
async fn monthly_reward_cap_voids_the_overflow() {
    let scope = scope();
    let config = ReferralProgramConfig {
        monthly_max_rewards_per_referrer: 1,
        ..both_wallet_rewards()
    };
    let (store, module) = module(config);
    let referrer = seed_referrer(&store, scope).await;
    let code = module.registry.get_or_create(scope, referrer.id).await.unwrap();

    for (email, expect_reward) in [("a@example.com", true), ("b@example.com", false)] {
        let appointment = Uuid::new_v4();
        module
            .engine
            .attribute(scope, attribute_dto(&code.code, email))
            .await
            .unwrap();
        module
            .engine
            .attach_to_booking(scope, attach_dto(appointment, email, None))
            .await
            .unwrap();
        let outcome = module
            .engine
            .on_booking_completed(scope, completion_dto(appointment, 5000))
            .await
            .unwrap();
        if expect_reward {
            assert!(matches!(outcome, CompletionOutcome::Rewarded { .. }));
        } else {
            assert!(matches!(
                outcome,
                CompletionOutcome::Voided {
                    reason: VoidReason::MonthlyLimit
                }
            ));
        }
    }

    let wallet = module.ledger.ensure_wallet(scope, referrer.id).await.unwrap();
    assert_eq!(wallet.balance, 500);
}

#[tokio::test]
async fn new_customer_policy_applies_at_both_ends() {
    let scope = scope();
    let config = ReferralProgramConfig {
        new_customer_only: true,
        ..both_wallet_rewards()
    };
    let (store, module) = module(config);
    let referrer = seed_referrer(&store, scope).await;
    let code = module.registry.get_or_create(scope, referrer.id).await.unwrap();

    store
        .mark_prior_customer(
            scope,
            ReferredIdentity {
                email: Some("regular@example.com".to_string()),
                ..Default::default()
            },
        )
        .await;

    // Known at attribution time: rejected up front.
    let err = module
        .engine
        .attribute(scope, attribute_dto(&code.code, "regular@example.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotEligible(_)));

    // Discovered only at completion time: voided, not an error.
    let appointment = Uuid::new_v4();
    module
        .engine
        .attribute(scope, attribute_dto(&code.code, "sneaky@example.com"))
        .await
        .unwrap();
    module
        .engine
        .attach_to_booking(scope, attach_dto(appointment, "sneaky@example.com", None))
        .await
        .unwrap();
    store
        .mark_prior_customer(
            scope,
            ReferredIdentity {
                email: Some("sneaky@example.com".to_string()),
                ..Default::default()
            },
        )
        .await;

    let outcome = module
        .engine
        .on_booking_completed(scope, completion_dto(appointment, 5000))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        CompletionOutcome::Voided {
            reason: VoidReason::NotNewCustomer
        }
    ));
}

#[tokio::test]
async fn disabled_program_rejects_attribution_but_swallows_events() {
    let scope = scope();
    let config = ReferralProgramConfig {
        enabled: false,
        ..both_wallet_rewards()
    };
    let (store, module) = module(config);
    let referrer = seed_referrer(&store, scope).await;

    let dto = AttributeReferralDto {
        code: "ABC123X9".to_string(),
        referred_email: Some("jane@example.com".to_string()),
        ..Default::default()
    };
    let err = module.engine.attribute(scope, dto).await.unwrap_err();
    assert!(matches!(err, ServiceError::ProgramDisabled));
    let _ = referrer;

    let outcome = module
        .engine
        .on_booking_completed(scope, completion_dto(Uuid::new_v4(), 5000))
        .await
        .unwrap();
    assert!(matches!(outcome, CompletionOutcome::NoAttribution));
}

#[tokio::test]
async fn contact_only_referral_skips_the_referred_reward() {
    let scope = scope();
    let (store, module) = module(both_wallet_rewards());
    let referrer = seed_referrer(&store, scope).await;
    let appointment = Uuid::new_v4();

    let code = module.registry.get_or_create(scope, referrer.id).await.unwrap();
    let dto = AttributeReferralDto {
        code: code.code.clone(),
        contact: Some("Jane Doe <jane@example.com> +1 555 010 0300".to_string()),
        ..Default::default()
    };
    let attribution = module.engine.attribute(scope, dto).await.unwrap();
    assert_eq!(attribution.referred_email.as_deref(), Some("jane@example.com"));
    assert_eq!(attribution.referred_phone.as_deref(), Some("15550100300"));

    // Booking arrives with the phone only; never resolves to a platform user.
    let attach = AttachBookingDto {
        appointment_id: appointment,
        customer_phone: Some("+1 (555) 010-0300".to_string()),
        ..Default::default()
    };
    module.engine.attach_to_booking(scope, attach).await.unwrap().unwrap();

    let outcome = module
        .engine
        .on_booking_completed(scope, completion_dto(appointment, 5000))
        .await
        .unwrap();
    let issued = match outcome {
        CompletionOutcome::Rewarded { issued } => issued,
        other => panic!("expected Rewarded, got {:?}", other),
    };
    assert!(issued.referrer_txn.is_some());
    assert!(issued.referred_txn.is_none());
    assert!(issued.referred_coupon.is_none());
}

#[tokio::test]
async fn unknown_or_inactive_codes_do_not_resolve() {
    let scope = scope();
    let (store, module) = module(both_wallet_rewards());
    seed_referrer(&store, scope).await;

    let err = module
        .engine
        .attribute(scope, attribute_dto("NOPE1234", "jane@example.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn referral_codes_are_stable_per_referrer() {
    let scope = scope();
    let (store, module) = module(both_wallet_rewards());
    let referrer = seed_referrer(&store, scope).await;

    let first = module.registry.get_or_create(scope, referrer.id).await.unwrap();
    let second = module.registry.get_or_create(scope, referrer.id).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(first.code, second.code);

    // Resolution is case- and whitespace-insensitive.
    let (resolved, profile) = module
        .registry
        .resolve(scope, &format!("  {} ", first.code.to_lowercase()))
        .await
        .unwrap();
    assert_eq!(resolved.id, first.id);
    assert_eq!(profile.id, referrer.id);
}
