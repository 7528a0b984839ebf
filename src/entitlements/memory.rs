use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::{
    Account, AccountMutation, PaymentApplication, Plan, ProcessedPayment, QuotaUnit,
    UnresolvedPayment,
};
use super::store::{EntitlementStore, StoreError, UsageLedger};

/// key: entitlement-store-memory -> single-process backend
///
/// One lock guards accounts and the payment ledger together, so the
/// processed marker and the entitlement write land atomically.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<String, Account>,
    processed: HashMap<String, ProcessedPayment>,
    unresolved: BTreeMap<String, UnresolvedPayment>,
    quota_units: Vec<QuotaUnit>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an account verbatim.
    pub async fn put_account(&self, account: Account) {
        let mut state = self.state.lock().await;
        state.accounts.insert(account.account_id.clone(), account);
    }

    pub async fn processed_payments(&self) -> Vec<ProcessedPayment> {
        let state = self.state.lock().await;
        let mut payments: Vec<_> = state.processed.values().cloned().collect();
        payments.sort_by(|a, b| a.event_reference.cmp(&b.event_reference));
        payments
    }
}

fn apply_mutation(
    account: &mut Account,
    mutation: &AccountMutation,
    expected_version: Option<i64>,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    if let Some(expected) = expected_version {
        if account.version != expected {
            return Err(StoreError::Conflict(account.account_id.clone()));
        }
    }

    match mutation {
        AccountMutation::Activate => {
            account.activated = true;
        }
        AccountMutation::UpgradePlan { tier, expires_at } => {
            account.plan = tier.plan();
            account.plan_expires_at = Some(*expires_at);
        }
        AccountMutation::ExpireToFree { now: cutoff } => {
            let expired = account.plan != Plan::Free
                && account
                    .plan_expires_at
                    .map(|expires_at| expires_at < *cutoff)
                    .unwrap_or(false);
            if !expired {
                return Err(StoreError::Conflict(account.account_id.clone()));
            }
            account.plan = Plan::Free;
            account.plan_expires_at = None;
        }
    }

    account.version += 1;
    account.updated_at = now;
    Ok(())
}

#[async_trait]
impl EntitlementStore for MemoryStore {
    async fn register(&self, account_id: &str) -> Result<Account, StoreError> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .entry(account_id.to_string())
            .or_insert_with(|| Account::new_free(account_id, Utc::now()));
        Ok(account.clone())
    }

    async fn get(&self, account_id: &str) -> Result<Account, StoreError> {
        let state = self.state.lock().await;
        state
            .accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(account_id.to_string()))
    }

    async fn get_many(&self, account_ids: &[String]) -> Result<Vec<Account>, StoreError> {
        let state = self.state.lock().await;
        Ok(account_ids
            .iter()
            .filter_map(|account_id| state.accounts.get(account_id).cloned())
            .collect())
    }

    async fn update(
        &self,
        account_id: &str,
        mutation: AccountMutation,
        expected_version: Option<i64>,
    ) -> Result<Account, StoreError> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| StoreError::NotFound(account_id.to_string()))?;
        let mut next = account.clone();
        apply_mutation(&mut next, &mutation, expected_version, Utc::now())?;
        *account = next.clone();
        Ok(next)
    }

    async fn is_processed(&self, event_reference: &str) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state.processed.contains_key(event_reference))
    }

    async fn apply_payment(
        &self,
        event_reference: &str,
        account_id: &str,
        amount: i64,
        outcome: &str,
        mutation: AccountMutation,
    ) -> Result<PaymentApplication, StoreError> {
        let mut state = self.state.lock().await;
        if state.processed.contains_key(event_reference) {
            return Ok(PaymentApplication::AlreadyProcessed);
        }

        let now = Utc::now();
        let account = state
            .accounts
            .get(account_id)
            .ok_or_else(|| StoreError::NotFound(account_id.to_string()))?;
        let mut next = account.clone();
        apply_mutation(&mut next, &mutation, None, now)?;

        state.accounts.insert(account_id.to_string(), next.clone());
        state.processed.insert(
            event_reference.to_string(),
            ProcessedPayment {
                event_reference: event_reference.to_string(),
                account_id: account_id.to_string(),
                amount,
                outcome: outcome.to_string(),
                processed_at: now,
            },
        );
        Ok(PaymentApplication::Applied(next))
    }

    async fn expired_accounts(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Account>, StoreError> {
        let state = self.state.lock().await;
        let mut expired: Vec<Account> = state
            .accounts
            .values()
            .filter(|account| {
                account.plan != Plan::Free
                    && account
                        .plan_expires_at
                        .map(|expires_at| expires_at < now)
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        expired.sort_by(|a, b| {
            a.plan_expires_at
                .cmp(&b.plan_expires_at)
                .then_with(|| a.account_id.cmp(&b.account_id))
        });
        expired.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(expired)
    }

    async fn record_unresolved_payment(
        &self,
        payment: &UnresolvedPayment,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .unresolved
            .entry(payment.event_reference.clone())
            .or_insert_with(|| payment.clone());
        Ok(())
    }

    async fn unresolved_payments(&self) -> Result<Vec<UnresolvedPayment>, StoreError> {
        let state = self.state.lock().await;
        let mut payments: Vec<_> = state.unresolved.values().cloned().collect();
        payments.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        Ok(payments)
    }
}

#[async_trait]
impl UsageLedger for MemoryStore {
    async fn record_unit(
        &self,
        account_id: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<QuotaUnit, StoreError> {
        let mut state = self.state.lock().await;
        if !state.accounts.contains_key(account_id) {
            return Err(StoreError::NotFound(account_id.to_string()));
        }
        let unit = QuotaUnit {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            occurred_at,
        };
        state.quota_units.push(unit.clone());
        Ok(unit)
    }

    async fn count_units(
        &self,
        account_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        let count = state
            .quota_units
            .iter()
            .filter(|unit| {
                unit.account_id == account_id && unit.occurred_at >= from && unit.occurred_at <= to
            })
            .count();
        Ok(count as i64)
    }
}
