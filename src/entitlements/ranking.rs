use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use super::models::{ProviderListing, RankingCandidate};
use super::store::{EntitlementStore, StoreError};
use super::usage::UsageCounter;

#[derive(Debug, Error)]
pub enum RankingError {
    #[error("candidate `{0}` has no entitlement record")]
    UnknownAccount(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Total order for search results: tier, then rating descending, then
/// account id ascending.
pub fn compare_candidates(a: &RankingCandidate, b: &RankingCandidate) -> Ordering {
    a.plan
        .tier_rank()
        .cmp(&b.plan.tier_rank())
        .then_with(|| b.rating.total_cmp(&a.rating))
        .then_with(|| a.account_id.cmp(&b.account_id))
}

pub fn order_candidates(candidates: &mut [RankingCandidate]) {
    candidates.sort_by(compare_candidates);
}

/// key: ranking-engine -> read-only discovery ordering
pub struct RankingEngine {
    store: Arc<dyn EntitlementStore>,
    usage: Arc<UsageCounter>,
}

impl RankingEngine {
    pub fn new(store: Arc<dyn EntitlementStore>, usage: Arc<UsageCounter>) -> Self {
        Self { store, usage }
    }

    pub async fn rank(
        &self,
        listings: &[ProviderListing],
        now: DateTime<Utc>,
    ) -> Result<Vec<RankingCandidate>, RankingError> {
        let mut seen = HashSet::with_capacity(listings.len());
        let listings: Vec<&ProviderListing> = listings
            .iter()
            .filter(|listing| seen.insert(listing.account_id.as_str()))
            .collect();
        if listings.is_empty() {
            return Ok(Vec::new());
        }

        let account_ids: Vec<String> = listings
            .iter()
            .map(|listing| listing.account_id.clone())
            .collect();
        let accounts: HashMap<String, _> = self
            .store
            .get_many(&account_ids)
            .await?
            .into_iter()
            .map(|account| (account.account_id.clone(), account))
            .collect();
        let usage = self.usage.count_many(&account_ids, now).await?;

        let mut candidates = Vec::with_capacity(listings.len());
        for listing in listings {
            let account = accounts
                .get(&listing.account_id)
                .ok_or_else(|| RankingError::UnknownAccount(listing.account_id.clone()))?;
            let used = usage.get(&listing.account_id).copied().unwrap_or(0);
            let status = self.usage.status_for(account, used, now);
            let rating = if listing.rating.is_finite() {
                listing.rating
            } else {
                0.0
            };

            candidates.push(RankingCandidate {
                account_id: listing.account_id.clone(),
                plan: status.plan,
                rating,
                quota_used_30d: status.used,
                quota_limit: status.limit,
                at_limit: status.at_limit,
            });
        }

        order_candidates(&mut candidates);
        debug!(candidates = candidates.len(), "ranked provider candidates");
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlements::models::Plan;

    fn candidate(account_id: &str, plan: Plan, rating: f64) -> RankingCandidate {
        RankingCandidate {
            account_id: account_id.to_string(),
            plan,
            rating,
            quota_used_30d: 0,
            quota_limit: None,
            at_limit: false,
        }
    }

    fn ids(candidates: &[RankingCandidate]) -> Vec<&str> {
        candidates.iter().map(|c| c.account_id.as_str()).collect()
    }

    #[test]
    fn tier_outranks_rating() {
        let mut candidates = vec![
            candidate("free-star", Plan::Free, 5.0),
            candidate("basic-mid", Plan::Basic, 3.0),
            candidate("premium-low", Plan::Premium, 1.0),
        ];
        order_candidates(&mut candidates);
        assert_eq!(ids(&candidates), ["premium-low", "basic-mid", "free-star"]);
    }

    #[test]
    fn rating_descends_within_tier_and_id_breaks_ties() {
        let mut candidates = vec![
            candidate("c", Plan::Basic, 4.0),
            candidate("b", Plan::Basic, 4.5),
            candidate("a", Plan::Basic, 4.0),
        ];
        order_candidates(&mut candidates);
        assert_eq!(ids(&candidates), ["b", "a", "c"]);
    }

    #[test]
    fn ordering_ignores_input_order() {
        let base = vec![
            candidate("p2", Plan::Premium, 4.0),
            candidate("f1", Plan::Free, 4.0),
            candidate("p1", Plan::Premium, 4.0),
            candidate("b1", Plan::Basic, 2.0),
        ];
        let mut forward = base.clone();
        let mut reversed: Vec<_> = base.into_iter().rev().collect();
        order_candidates(&mut forward);
        order_candidates(&mut reversed);
        assert_eq!(forward, reversed);
        assert_eq!(ids(&forward), ["p1", "p2", "b1", "f1"]);
    }
}
