use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Executor, PgPool, Postgres, Row};
use uuid::Uuid;

use super::models::{
    Account, AccountMutation, PaymentApplication, QuotaUnit, UnresolvedPayment,
};
use super::store::{EntitlementStore, StoreError, UsageLedger};

const FOREIGN_KEY_VIOLATION: &str = "23503";

const ACCOUNT_COLUMNS: &str =
    "account_id, plan, activated, plan_expires_at, version, created_at, updated_at";

/// key: entitlement-store-postgres -> provider_accounts + payment ledger
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn exists(&self, account_id: &str) -> Result<bool, StoreError> {
        let found: Option<String> =
            sqlx::query_scalar("SELECT account_id FROM provider_accounts WHERE account_id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }
}

fn account_from_row(row: &PgRow) -> Result<Account, StoreError> {
    let plan: String = row.try_get("plan")?;
    Ok(Account {
        account_id: row.try_get("account_id")?,
        plan: plan.parse()?,
        activated: row.try_get("activated")?,
        plan_expires_at: row.try_get("plan_expires_at")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(FOREIGN_KEY_VIOLATION)
    )
}

/// Issues the conditional UPDATE for `mutation`. `None` means the row was
/// missing or a precondition failed.
async fn write_mutation<'e, E>(
    executor: E,
    account_id: &str,
    mutation: &AccountMutation,
    expected_version: Option<i64>,
) -> Result<Option<PgRow>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    match mutation {
        AccountMutation::Activate => {
            sqlx::query(&format!(
                r#"
                UPDATE provider_accounts
                SET activated = TRUE,
                    version = version + 1,
                    updated_at = NOW()
                WHERE account_id = $1
                  AND ($2::BIGINT IS NULL OR version = $2)
                RETURNING {ACCOUNT_COLUMNS}
                "#
            ))
            .bind(account_id)
            .bind(expected_version)
            .fetch_optional(executor)
            .await
        }
        AccountMutation::UpgradePlan { tier, expires_at } => {
            sqlx::query(&format!(
                r#"
                UPDATE provider_accounts
                SET plan = $3,
                    plan_expires_at = $4,
                    version = version + 1,
                    updated_at = NOW()
                WHERE account_id = $1
                  AND ($2::BIGINT IS NULL OR version = $2)
                RETURNING {ACCOUNT_COLUMNS}
                "#
            ))
            .bind(account_id)
            .bind(expected_version)
            .bind(tier.plan().as_str())
            .bind(*expires_at)
            .fetch_optional(executor)
            .await
        }
        AccountMutation::ExpireToFree { now } => {
            sqlx::query(&format!(
                r#"
                UPDATE provider_accounts
                SET plan = 'free',
                    plan_expires_at = NULL,
                    version = version + 1,
                    updated_at = NOW()
                WHERE account_id = $1
                  AND ($2::BIGINT IS NULL OR version = $2)
                  AND plan <> 'free'
                  AND plan_expires_at < $3
                RETURNING {ACCOUNT_COLUMNS}
                "#
            ))
            .bind(account_id)
            .bind(expected_version)
            .bind(*now)
            .fetch_optional(executor)
            .await
        }
    }
}

#[async_trait]
impl EntitlementStore for PgStore {
    async fn register(&self, account_id: &str) -> Result<Account, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO provider_accounts (account_id)
            VALUES ($1)
            ON CONFLICT (account_id) DO NOTHING
            "#,
        )
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        self.get(account_id).await
    }

    async fn get(&self, account_id: &str) -> Result<Account, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM provider_accounts WHERE account_id = $1"
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(StoreError::NotFound(account_id.to_string()));
        };
        account_from_row(&row)
    }

    async fn get_many(&self, account_ids: &[String]) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM provider_accounts WHERE account_id = ANY($1)"
        ))
        .bind(account_ids.to_vec())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(account_from_row).collect()
    }

    async fn update(
        &self,
        account_id: &str,
        mutation: AccountMutation,
        expected_version: Option<i64>,
    ) -> Result<Account, StoreError> {
        let row = write_mutation(&self.pool, account_id, &mutation, expected_version).await?;
        match row {
            Some(row) => account_from_row(&row),
            None if self.exists(account_id).await? => {
                Err(StoreError::Conflict(account_id.to_string()))
            }
            None => Err(StoreError::NotFound(account_id.to_string())),
        }
    }

    async fn is_processed(&self, event_reference: &str) -> Result<bool, StoreError> {
        let found: Option<String> = sqlx::query_scalar(
            "SELECT event_reference FROM processed_payment_events WHERE event_reference = $1",
        )
        .bind(event_reference)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn apply_payment(
        &self,
        event_reference: &str,
        account_id: &str,
        amount: i64,
        outcome: &str,
        mutation: AccountMutation,
    ) -> Result<PaymentApplication, StoreError> {
        let mut tx = self.pool.begin().await?;

        // The primary key serializes concurrent deliveries of the same
        // reference; the loser blocks here until the winner commits.
        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO processed_payment_events (event_reference, account_id, amount, outcome)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (event_reference) DO NOTHING
            RETURNING event_reference
            "#,
        )
        .bind(event_reference)
        .bind(account_id)
        .bind(amount)
        .bind(outcome)
        .fetch_optional(&mut tx)
        .await?;

        if claimed.is_none() {
            tx.rollback().await?;
            return Ok(PaymentApplication::AlreadyProcessed);
        }

        let row = write_mutation(&mut tx, account_id, &mutation, None).await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Err(StoreError::NotFound(account_id.to_string()));
        };
        let account = account_from_row(&row)?;
        tx.commit().await?;

        Ok(PaymentApplication::Applied(account))
    }

    async fn expired_accounts(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ACCOUNT_COLUMNS}
            FROM provider_accounts
            WHERE plan <> 'free'
              AND plan_expires_at < $1
            ORDER BY plan_expires_at ASC, account_id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(account_from_row).collect()
    }

    async fn record_unresolved_payment(
        &self,
        payment: &UnresolvedPayment,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO unresolved_payments (event_reference, account_id, amount, reason, received_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_reference) DO NOTHING
            "#,
        )
        .bind(&payment.event_reference)
        .bind(&payment.account_id)
        .bind(payment.amount)
        .bind(&payment.reason)
        .bind(payment.received_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unresolved_payments(&self) -> Result<Vec<UnresolvedPayment>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_reference, account_id, amount, reason, received_at
            FROM unresolved_payments
            ORDER BY received_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<UnresolvedPayment, StoreError> {
                Ok(UnresolvedPayment {
                    event_reference: row.try_get("event_reference")?,
                    account_id: row.try_get("account_id")?,
                    amount: row.try_get("amount")?,
                    reason: row.try_get("reason")?,
                    received_at: row.try_get("received_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl UsageLedger for PgStore {
    async fn record_unit(
        &self,
        account_id: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<QuotaUnit, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO quota_units (id, account_id, occurred_at) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(account_id)
            .bind(occurred_at)
            .execute(&self.pool)
            .await
            .map_err(|err| {
                if is_foreign_key_violation(&err) {
                    StoreError::NotFound(account_id.to_string())
                } else {
                    StoreError::from(err)
                }
            })?;
        Ok(QuotaUnit {
            id,
            account_id: account_id.to_string(),
            occurred_at,
        })
    }

    async fn count_units(
        &self,
        account_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM quota_units
            WHERE account_id = $1
              AND occurred_at >= $2
              AND occurred_at <= $3
            "#,
        )
        .bind(account_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn count_units_many(
        &self,
        account_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HashMap<String, i64>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT account_id, COUNT(*) AS used
            FROM quota_units
            WHERE account_id = ANY($1)
              AND occurred_at >= $2
              AND occurred_at <= $3
            GROUP BY account_id
            "#,
        )
        .bind(account_ids.to_vec())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let mut counts: HashMap<String, i64> =
            account_ids.iter().map(|id| (id.clone(), 0)).collect();
        for row in rows {
            counts.insert(row.try_get("account_id")?, row.try_get("used")?);
        }
        Ok(counts)
    }
}
