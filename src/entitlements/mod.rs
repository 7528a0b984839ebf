pub mod api;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod pricing;
pub mod ranking;
pub mod reconciliation;
pub mod scheduler;
pub mod store;
pub mod usage;
pub mod webhook;

use std::sync::Arc;

pub use memory::MemoryStore;
pub use models::{
    Account, AccountMutation, PaidTier, PaymentApplication, Plan, ProviderListing, QuotaUnit,
    RankingCandidate, UnresolvedPayment,
};
pub use postgres::PgStore;
pub use pricing::{PaymentResolution, PlanResolver, PriceTable, PricingError};
pub use ranking::{RankingEngine, RankingError};
pub use reconciliation::{ExpiryReconciler, SweepReport};
pub use scheduler::{spawn as spawn_expiry_scheduler, SweepTrigger};
pub use store::{EntitlementStore, StoreError, UsageLedger};
pub use usage::{JobAcceptance, QuotaLimits, QuotaStatus, UsageCounter};
pub use webhook::{WebhookError, WebhookIngress, WebhookOutcome};

pub const DEFAULT_SIGNATURE_HEADER: &str = "x-gateway-signature";

/// key: entitlement-engine -> shared handles for request handlers
#[derive(Clone)]
pub struct EntitlementEngine {
    pub store: Arc<dyn EntitlementStore>,
    pub ingress: Arc<WebhookIngress>,
    pub usage: Arc<UsageCounter>,
    pub ranking: Arc<RankingEngine>,
    pub signature_header: String,
}

impl EntitlementEngine {
    /// Wires the components over one store/ledger pair. `ingress` is built by
    /// the caller so it can carry a sweep trigger.
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        ledger: Arc<dyn UsageLedger>,
        ingress: WebhookIngress,
        limits: QuotaLimits,
    ) -> Self {
        let usage = Arc::new(UsageCounter::new(ledger, limits));
        Self::from_parts(store, Arc::new(ingress), usage)
    }

    pub fn from_parts(
        store: Arc<dyn EntitlementStore>,
        ingress: Arc<WebhookIngress>,
        usage: Arc<UsageCounter>,
    ) -> Self {
        let ranking = Arc::new(RankingEngine::new(store.clone(), usage.clone()));
        Self {
            store,
            ingress,
            usage,
            ranking,
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
        }
    }

    pub fn with_signature_header(mut self, header: impl Into<String>) -> Self {
        self.signature_header = header.into().to_ascii_lowercase();
        self
    }
}
