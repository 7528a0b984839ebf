use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// key: entitlement-plan -> free,basic,premium
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Free,
    Basic,
    Premium,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Basic => "basic",
            Plan::Premium => "premium",
        }
    }

    /// Position in search results; lower sorts first.
    pub fn tier_rank(&self) -> u8 {
        match self {
            Plan::Premium => 0,
            Plan::Basic => 1,
            Plan::Free => 2,
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown plan `{0}`")]
pub struct UnknownPlan(pub String);

impl FromStr for Plan {
    type Err = UnknownPlan;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "free" => Ok(Plan::Free),
            "basic" => Ok(Plan::Basic),
            "premium" => Ok(Plan::Premium),
            other => Err(UnknownPlan(other.to_string())),
        }
    }
}

/// Plans that can be purchased. Keeps a "free upgrade" unrepresentable.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaidTier {
    Basic,
    Premium,
}

impl PaidTier {
    pub fn plan(&self) -> Plan {
        match self {
            PaidTier::Basic => Plan::Basic,
            PaidTier::Premium => Plan::Premium,
        }
    }
}

/// key: entitlement-account -> durable per-provider record
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub account_id: String,
    pub plan: Plan,
    pub activated: bool,
    pub plan_expires_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new_free(account_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            account_id: account_id.into(),
            plan: Plan::Free,
            activated: false,
            plan_expires_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// A paid plan whose expiry has passed but which the sweep has not
    /// downgraded yet.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.plan != Plan::Free
            && self
                .plan_expires_at
                .map(|expires_at| expires_at < now)
                .unwrap_or(true)
    }

    /// The plan the account is entitled to at `now`.
    pub fn effective_plan(&self, now: DateTime<Utc>) -> Plan {
        if self.is_expired(now) {
            Plan::Free
        } else {
            self.plan
        }
    }
}

/// key: entitlement-mutation -> the only writes the store accepts
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccountMutation {
    Activate,
    UpgradePlan {
        tier: PaidTier,
        expires_at: DateTime<Utc>,
    },
    /// Applied only if the account is still on a paid plan that expired
    /// before `now` when the write lands.
    ExpireToFree { now: DateTime<Utc> },
}

/// key: payment-ledger -> processed event references
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessedPayment {
    pub event_reference: String,
    pub account_id: String,
    pub amount: i64,
    pub outcome: String,
    pub processed_at: DateTime<Utc>,
}

/// key: payment-ledger -> money received without entitlement
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnresolvedPayment {
    pub event_reference: String,
    pub account_id: Option<String>,
    pub amount: i64,
    pub reason: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaymentApplication {
    Applied(Account),
    AlreadyProcessed,
}

/// key: usage-ledger -> one accepted job
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaUnit {
    pub id: Uuid,
    pub account_id: String,
    pub occurred_at: DateTime<Utc>,
}

/// Provider as supplied by the category/location index.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProviderListing {
    pub account_id: String,
    #[serde(default)]
    pub rating: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RankingCandidate {
    pub account_id: String,
    pub plan: Plan,
    pub rating: f64,
    pub quota_used_30d: i64,
    pub quota_limit: Option<i64>,
    pub at_limit: bool,
}
