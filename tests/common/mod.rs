#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use marketplace_entitlements::entitlements::{
    Account, AccountMutation, EntitlementStore, MemoryStore, PaidTier, PaymentApplication, Plan,
    PlanResolver, PriceTable, StoreError, UnresolvedPayment, WebhookIngress,
};
use serde_json::json;

pub const SECRET: &[u8] = b"test-webhook-secret";
pub const ACTIVATION_FEE: i64 = 100_000;
pub const BASIC_PRICE: i64 = 250_000;
pub const PREMIUM_PRICE: i64 = 500_000;

pub fn resolver() -> PlanResolver {
    PlanResolver::new(PriceTable {
        activation_fee: ACTIVATION_FEE,
        basic: BASIC_PRICE,
        premium: PREMIUM_PRICE,
    })
    .unwrap()
}

pub fn ingress(store: Arc<dyn EntitlementStore>) -> WebhookIngress {
    WebhookIngress::new(store, resolver(), SECRET.to_vec())
}

pub fn charge(reference: &str, account_id: &str, amount: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "event": "charge.success",
        "data": {
            "reference": reference,
            "amount": amount,
            "currency": "NGN",
            "metadata": { "account_id": account_id }
        }
    }))
    .unwrap()
}

pub fn paid_account(
    account_id: &str,
    plan: Plan,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Account {
    let mut account = Account::new_free(account_id, now - Duration::days(60));
    account.plan = plan;
    account.plan_expires_at = Some(expires_at);
    account.version = 3;
    account
}

/// Memory store with hooks for racing writers and transient failures.
pub struct InterceptingStore {
    pub inner: Arc<MemoryStore>,
    renew_on_downgrade: Mutex<Option<(String, DateTime<Utc>)>>,
    failing_downgrades: Mutex<HashSet<String>>,
    fail_reads: AtomicBool,
    fail_payments: AtomicBool,
}

impl InterceptingStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            renew_on_downgrade: Mutex::new(None),
            failing_downgrades: Mutex::new(HashSet::new()),
            fail_reads: AtomicBool::new(false),
            fail_payments: AtomicBool::new(false),
        }
    }

    /// Renews `account_id` to premium right before the sweep's write for it.
    pub fn renew_during_sweep(&self, account_id: &str, expires_at: DateTime<Utc>) {
        *self.renew_on_downgrade.lock().unwrap() = Some((account_id.to_string(), expires_at));
    }

    pub fn fail_downgrade_of(&self, account_id: &str) {
        self.failing_downgrades
            .lock()
            .unwrap()
            .insert(account_id.to_string());
    }

    pub fn heal(&self) {
        self.failing_downgrades.lock().unwrap().clear();
        self.fail_reads.store(false, Ordering::SeqCst);
        self.fail_payments.store(false, Ordering::SeqCst);
    }

    pub fn fail_reads(&self) {
        self.fail_reads.store(true, Ordering::SeqCst);
    }

    /// `apply_payment` fails before touching the ledger or the account.
    pub fn fail_payments(&self) {
        self.fail_payments.store(true, Ordering::SeqCst);
    }

    fn check_reads(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EntitlementStore for InterceptingStore {
    async fn register(&self, account_id: &str) -> Result<Account, StoreError> {
        self.inner.register(account_id).await
    }

    async fn get(&self, account_id: &str) -> Result<Account, StoreError> {
        self.check_reads()?;
        self.inner.get(account_id).await
    }

    async fn get_many(&self, account_ids: &[String]) -> Result<Vec<Account>, StoreError> {
        self.check_reads()?;
        self.inner.get_many(account_ids).await
    }

    async fn update(
        &self,
        account_id: &str,
        mutation: AccountMutation,
        expected_version: Option<i64>,
    ) -> Result<Account, StoreError> {
        if matches!(mutation, AccountMutation::ExpireToFree { .. }) {
            if self.failing_downgrades.lock().unwrap().contains(account_id) {
                return Err(StoreError::Unavailable(format!("{account_id} write timed out")));
            }
            let renewal = {
                let mut slot = self.renew_on_downgrade.lock().unwrap();
                match slot.as_ref() {
                    Some((target, _)) if target == account_id => slot.take(),
                    _ => None,
                }
            };
            if let Some((_, expires_at)) = renewal {
                self.inner
                    .update(
                        account_id,
                        AccountMutation::UpgradePlan {
                            tier: PaidTier::Premium,
                            expires_at,
                        },
                        None,
                    )
                    .await?;
            }
        }
        self.inner
            .update(account_id, mutation, expected_version)
            .await
    }

    async fn is_processed(&self, event_reference: &str) -> Result<bool, StoreError> {
        self.check_reads()?;
        self.inner.is_processed(event_reference).await
    }

    async fn apply_payment(
        &self,
        event_reference: &str,
        account_id: &str,
        amount: i64,
        outcome: &str,
        mutation: AccountMutation,
    ) -> Result<PaymentApplication, StoreError> {
        if self.fail_payments.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("payment transaction aborted".into()));
        }
        self.inner
            .apply_payment(event_reference, account_id, amount, outcome, mutation)
            .await
    }

    async fn expired_accounts(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Account>, StoreError> {
        self.check_reads()?;
        self.inner.expired_accounts(now, limit).await
    }

    async fn record_unresolved_payment(
        &self,
        payment: &UnresolvedPayment,
    ) -> Result<(), StoreError> {
        self.inner.record_unresolved_payment(payment).await
    }

    async fn unresolved_payments(&self) -> Result<Vec<UnresolvedPayment>, StoreError> {
        self.inner.unresolved_payments().await
    }
}
