use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::models::{Account, Plan};
use super::store::{EntitlementStore, StoreError, UsageLedger};

pub const DEFAULT_USAGE_WINDOW_DAYS: i64 = 30;

/// key: usage-limits -> accepted jobs per rolling window; `None` is unbounded
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaLimits {
    pub free: Option<i64>,
    pub basic: Option<i64>,
    pub premium: Option<i64>,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            free: Some(1),
            basic: Some(10),
            premium: None,
        }
    }
}

impl QuotaLimits {
    pub fn limit(&self, plan: Plan) -> Option<i64> {
        match plan {
            Plan::Free => self.free,
            Plan::Basic => self.basic,
            Plan::Premium => self.premium,
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct QuotaStatus {
    pub plan: Plan,
    pub used: i64,
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub at_limit: bool,
}

impl QuotaStatus {
    pub fn evaluate(plan: Plan, used: i64, limit: Option<i64>) -> Self {
        Self {
            plan,
            used,
            limit,
            remaining: limit.map(|limit| limit.saturating_sub(used).max(0)),
            at_limit: limit.map(|limit| used >= limit).unwrap_or(false),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct JobAcceptance {
    pub accepted: bool,
    pub status: QuotaStatus,
    pub notes: Vec<String>,
}

/// key: usage-counter -> rolling window over the quota ledger
pub struct UsageCounter {
    ledger: Arc<dyn UsageLedger>,
    limits: QuotaLimits,
    window: Duration,
}

impl UsageCounter {
    pub fn new(ledger: Arc<dyn UsageLedger>, limits: QuotaLimits) -> Self {
        Self::with_window(ledger, limits, Duration::days(DEFAULT_USAGE_WINDOW_DAYS))
    }

    pub fn with_window(ledger: Arc<dyn UsageLedger>, limits: QuotaLimits, window: Duration) -> Self {
        Self {
            ledger,
            limits,
            window,
        }
    }

    fn window_bounds(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (now - self.window, now)
    }

    /// Units recorded for `account_id` in `[now - window, now]`.
    pub async fn count(&self, account_id: &str, now: DateTime<Utc>) -> Result<i64, StoreError> {
        let (from, to) = self.window_bounds(now);
        self.ledger.count_units(account_id, from, to).await
    }

    pub async fn count_many(
        &self,
        account_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<HashMap<String, i64>, StoreError> {
        let (from, to) = self.window_bounds(now);
        self.ledger.count_units_many(account_ids, from, to).await
    }

    pub fn status_for(&self, account: &Account, used: i64, now: DateTime<Utc>) -> QuotaStatus {
        let plan = account.effective_plan(now);
        QuotaStatus::evaluate(plan, used, self.limits.limit(plan))
    }

    pub async fn status(
        &self,
        account: &Account,
        now: DateTime<Utc>,
    ) -> Result<QuotaStatus, StoreError> {
        let used = self.count(&account.account_id, now).await?;
        Ok(self.status_for(account, used, now))
    }

    /// Quota gate for a provider accepting a job. The check and the insert
    /// are not serialized, so concurrent accepts may overshoot the limit.
    pub async fn accept_job(
        &self,
        store: &dyn EntitlementStore,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<JobAcceptance, StoreError> {
        let account = store.get(account_id).await?;
        let status = self.status(&account, now).await?;

        if status.at_limit {
            info!(
                account_id,
                plan = %status.plan,
                used = status.used,
                limit = ?status.limit,
                "job acceptance refused at quota"
            );
            return Ok(JobAcceptance {
                accepted: false,
                status,
                notes: vec!["quota-exceeded:jobs".to_string()],
            });
        }

        self.ledger.record_unit(account_id, now).await?;
        let status = QuotaStatus::evaluate(status.plan, status.used + 1, status.limit);
        let note = match status.limit {
            Some(limit) => format!("quota:jobs:{}/{limit}", status.used),
            None => "quota:jobs:unlimited".to_string(),
        };
        debug!(account_id, used = status.used, "job acceptance recorded");

        Ok(JobAcceptance {
            accepted: true,
            status,
            notes: vec![note],
        })
    }
}
