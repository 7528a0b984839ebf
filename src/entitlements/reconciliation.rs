use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::models::AccountMutation;
use super::store::{EntitlementStore, StoreError};

pub const DEFAULT_SWEEP_BATCH_SIZE: i64 = 500;

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    pub downgraded: usize,
    /// Rows that changed between read and write, e.g. renewed in the gap.
    pub skipped: usize,
    /// Rows left for the next run after a store failure.
    pub failed: usize,
}

/// key: expiry-reconciler -> downgrade lapsed paid plans
///
/// Holds no lock. Each downgrade is a conditional write on the version read
/// plus a write-time expiry check, so it is safe against itself and against
/// concurrent upgrades.
pub struct ExpiryReconciler {
    store: Arc<dyn EntitlementStore>,
    batch_size: i64,
}

impl ExpiryReconciler {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self::with_batch_size(store, DEFAULT_SWEEP_BATCH_SIZE)
    }

    pub fn with_batch_size(store: Arc<dyn EntitlementStore>, batch_size: i64) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let candidates = self.store.expired_accounts(now, self.batch_size).await?;
        let mut report = SweepReport::default();

        for account in candidates {
            let result = self
                .store
                .update(
                    &account.account_id,
                    AccountMutation::ExpireToFree { now },
                    Some(account.version),
                )
                .await;

            match result {
                Ok(updated) => {
                    report.downgraded += 1;
                    info!(
                        account_id = %updated.account_id,
                        previous_plan = %account.plan,
                        expired_at = ?account.plan_expires_at,
                        "downgraded expired plan to free"
                    );
                }
                Err(StoreError::Conflict(_)) | Err(StoreError::NotFound(_)) => {
                    report.skipped += 1;
                    debug!(
                        account_id = %account.account_id,
                        "account changed during sweep; leaving as is"
                    );
                }
                Err(err) if err.is_transient() => {
                    report.failed += 1;
                    warn!(
                        ?err,
                        account_id = %account.account_id,
                        "failed to downgrade expired plan; will retry next sweep"
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    error!(
                        ?err,
                        account_id = %account.account_id,
                        "expired plan cannot be downgraded until the row is repaired"
                    );
                }
            }
        }

        Ok(report)
    }
}
