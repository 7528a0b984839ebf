mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{charge, ingress, paid_account, InterceptingStore, PREMIUM_PRICE, SECRET};
use marketplace_entitlements::entitlements::webhook::sign;
use marketplace_entitlements::entitlements::{
    spawn_expiry_scheduler, Account, EntitlementStore, ExpiryReconciler, MemoryStore, Plan,
    StoreError, SweepReport,
};

async fn wait_for_plan(store: &MemoryStore, account_id: &str, plan: Plan) -> Account {
    for _ in 0..200 {
        let account = store.get(account_id).await.unwrap();
        if account.plan == plan {
            return account;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("{account_id} never reached {plan}");
}

// key: expiry-sweep-tests -> downgrade,race,skip-and-continue
#[tokio::test]
async fn sweep_downgrades_only_expired_paid_accounts() {
    let now = Utc::now();
    let store = Arc::new(MemoryStore::new());
    store
        .put_account(paid_account(
            "lapsed",
            Plan::Basic,
            now - Duration::hours(1),
            now,
        ))
        .await;
    let current = paid_account("current", Plan::Premium, now + Duration::days(3), now);
    store.put_account(current.clone()).await;
    let free = store.register("free").await.unwrap();

    let reconciler = ExpiryReconciler::new(store.clone());
    let report = reconciler.sweep_at(now).await.unwrap();
    assert_eq!(
        report,
        SweepReport {
            downgraded: 1,
            skipped: 0,
            failed: 0
        }
    );

    let lapsed = store.get("lapsed").await.unwrap();
    assert_eq!(lapsed.plan, Plan::Free);
    assert_eq!(lapsed.plan_expires_at, None);
    assert_eq!(store.get("current").await.unwrap(), current);
    assert_eq!(store.get("free").await.unwrap(), free);

    let again = reconciler.sweep_at(now).await.unwrap();
    assert_eq!(again.downgraded, 0);
}

#[tokio::test]
async fn expiry_exactly_now_is_not_yet_expired() {
    let now = Utc::now();
    let store = Arc::new(MemoryStore::new());
    store
        .put_account(paid_account("edge", Plan::Basic, now, now))
        .await;

    let report = ExpiryReconciler::new(store.clone())
        .sweep_at(now)
        .await
        .unwrap();
    assert_eq!(report.downgraded, 0);
    assert_eq!(store.get("edge").await.unwrap().plan, Plan::Basic);
}

#[tokio::test]
async fn renewal_during_sweep_is_not_downgraded() {
    let now = Utc::now();
    let memory = Arc::new(MemoryStore::new());
    for account_id in ["expired-a", "expired-b", "expired-c"] {
        memory
            .put_account(paid_account(
                account_id,
                Plan::Basic,
                now - Duration::days(1),
                now,
            ))
            .await;
    }
    let store = Arc::new(InterceptingStore::new(memory.clone()));
    let renewed_until = now + Duration::days(30);
    store.renew_during_sweep("expired-b", renewed_until);

    let report = ExpiryReconciler::new(store.clone())
        .sweep_at(now)
        .await
        .unwrap();

    assert_eq!(report.downgraded, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(memory.get("expired-a").await.unwrap().plan, Plan::Free);
    assert_eq!(memory.get("expired-c").await.unwrap().plan, Plan::Free);
    let renewed = memory.get("expired-b").await.unwrap();
    assert_eq!(renewed.plan, Plan::Premium);
    assert_eq!(renewed.plan_expires_at, Some(renewed_until));
}

#[tokio::test]
async fn upgrade_committed_before_sweep_is_kept() {
    let now = Utc::now();
    let store = Arc::new(MemoryStore::new());
    store
        .put_account(paid_account(
            "provider-1",
            Plan::Basic,
            now - Duration::days(2),
            now,
        ))
        .await;

    let body = charge("ref-renewal", "provider-1", PREMIUM_PRICE);
    ingress(store.clone())
        .handle_at(&body, Some(&sign(SECRET, &body)), now)
        .await
        .unwrap();

    let report = ExpiryReconciler::new(store.clone())
        .sweep_at(now + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(report.downgraded, 0);

    let account = store.get("provider-1").await.unwrap();
    assert_eq!(account.plan, Plan::Premium);
    assert_eq!(account.plan_expires_at, Some(now + Duration::days(30)));
}

#[tokio::test]
async fn failing_row_is_skipped_and_retried_next_sweep() {
    let now = Utc::now();
    let memory = Arc::new(MemoryStore::new());
    for account_id in ["a", "b", "c"] {
        memory
            .put_account(paid_account(
                account_id,
                Plan::Premium,
                now - Duration::hours(5),
                now,
            ))
            .await;
    }
    let store = Arc::new(InterceptingStore::new(memory.clone()));
    store.fail_downgrade_of("b");
    let reconciler = ExpiryReconciler::new(store.clone());

    let first = reconciler.sweep_at(now).await.unwrap();
    assert_eq!(first.downgraded, 2);
    assert_eq!(first.failed, 1);
    assert_eq!(memory.get("b").await.unwrap().plan, Plan::Premium);

    store.heal();
    let second = reconciler.sweep_at(now).await.unwrap();
    assert_eq!(second.downgraded, 1);
    assert_eq!(memory.get("b").await.unwrap().plan, Plan::Free);
}

#[tokio::test]
async fn sweep_batch_is_bounded() {
    let now = Utc::now();
    let store = Arc::new(MemoryStore::new());
    for index in 0..5 {
        store
            .put_account(paid_account(
                &format!("lapsed-{index}"),
                Plan::Basic,
                now - Duration::hours(index + 1),
                now,
            ))
            .await;
    }

    let reconciler = ExpiryReconciler::with_batch_size(store.clone(), 2);
    assert_eq!(reconciler.sweep_at(now).await.unwrap().downgraded, 2);
    // Oldest expiries go first.
    assert_eq!(store.get("lapsed-4").await.unwrap().plan, Plan::Free);
    assert_eq!(store.get("lapsed-3").await.unwrap().plan, Plan::Free);
    assert_eq!(store.get("lapsed-0").await.unwrap().plan, Plan::Basic);
    assert_eq!(reconciler.sweep_at(now).await.unwrap().downgraded, 2);
    assert_eq!(reconciler.sweep_at(now).await.unwrap().downgraded, 1);
}

#[tokio::test]
async fn unavailable_listing_fails_the_sweep() {
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(InterceptingStore::new(memory));
    store.fail_reads();

    let err = ExpiryReconciler::new(store)
        .sweep()
        .await
        .expect_err("listing failure must surface");
    assert!(matches!(err, StoreError::Unavailable(_)));
}

#[tokio::test]
async fn scheduler_sweeps_on_start_and_after_upgrades() {
    let now = Utc::now();
    let store = Arc::new(MemoryStore::new());
    store
        .put_account(paid_account(
            "lapsed-at-boot",
            Plan::Basic,
            now - Duration::days(1),
            now,
        ))
        .await;

    let reconciler = Arc::new(ExpiryReconciler::new(store.clone()));
    let trigger = spawn_expiry_scheduler(reconciler, std::time::Duration::from_secs(3600));
    wait_for_plan(&store, "lapsed-at-boot", Plan::Free).await;

    store
        .put_account(paid_account(
            "lapsed-later",
            Plan::Premium,
            now - Duration::days(1),
            now,
        ))
        .await;
    store.register("buyer").await.unwrap();
    let body = charge("ref-buyer", "buyer", PREMIUM_PRICE);
    ingress(store.clone())
        .with_sweep_trigger(trigger)
        .handle(&body, Some(&sign(SECRET, &body)))
        .await
        .unwrap();

    wait_for_plan(&store, "lapsed-later", Plan::Free).await;
    assert_eq!(store.get("buyer").await.unwrap().plan, Plan::Premium);
}
