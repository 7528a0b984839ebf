use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::models::{
    Account, AccountMutation, PaymentApplication, QuotaUnit, UnresolvedPayment, UnknownPlan,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("account `{0}` not found")]
    NotFound(String),
    #[error("account `{0}` changed since it was read")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored account is corrupt: {0}")]
    Corrupt(#[from] UnknownPlan),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Failures worth retrying on the next delivery or sweep. The sweep logs
    /// anything else as needing repair.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Unavailable(_))
    }
}

/// key: entitlement-store -> sole writer of plan/activation/expiry
///
/// Every write touches exactly one account and is atomic. A write that
/// returns `Ok` is visible to the next `get` for that account.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Creates a free, inactive account if none exists; returns the stored row.
    async fn register(&self, account_id: &str) -> Result<Account, StoreError>;

    async fn get(&self, account_id: &str) -> Result<Account, StoreError>;

    /// Missing ids are absent from the result rather than an error.
    async fn get_many(&self, account_ids: &[String]) -> Result<Vec<Account>, StoreError> {
        let mut accounts = Vec::with_capacity(account_ids.len());
        for account_id in account_ids {
            match self.get(account_id).await {
                Ok(account) => accounts.push(account),
                Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(accounts)
    }

    /// Applies `mutation`. With `expected_version`, fails with `Conflict` when
    /// the stored version differs. `ExpireToFree` also fails with `Conflict`
    /// when the account is no longer expired at write time.
    async fn update(
        &self,
        account_id: &str,
        mutation: AccountMutation,
        expected_version: Option<i64>,
    ) -> Result<Account, StoreError>;

    async fn is_processed(&self, event_reference: &str) -> Result<bool, StoreError>;

    /// Marks `event_reference` processed and applies `mutation` in one
    /// transaction. A reference seen before yields `AlreadyProcessed` and no write.
    async fn apply_payment(
        &self,
        event_reference: &str,
        account_id: &str,
        amount: i64,
        outcome: &str,
        mutation: AccountMutation,
    ) -> Result<PaymentApplication, StoreError>;

    /// Paid accounts whose expiry is before `now`, oldest expiry first.
    async fn expired_accounts(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Account>, StoreError>;

    /// Records at most one row per event reference.
    async fn record_unresolved_payment(&self, payment: &UnresolvedPayment)
        -> Result<(), StoreError>;

    async fn unresolved_payments(&self) -> Result<Vec<UnresolvedPayment>, StoreError>;
}

/// key: usage-ledger -> append-only accepted jobs
#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn record_unit(
        &self,
        account_id: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<QuotaUnit, StoreError>;

    /// Units with `from <= occurred_at <= to`.
    async fn count_units(
        &self,
        account_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    async fn count_units_many(
        &self,
        account_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HashMap<String, i64>, StoreError> {
        let mut counts = HashMap::with_capacity(account_ids.len());
        for account_id in account_ids {
            let count = self.count_units(account_id, from, to).await?;
            counts.insert(account_id.clone(), count);
        }
        Ok(counts)
    }
}
