use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha512;
use thiserror::Error;
use tracing::{error, info, warn};

use super::models::{Account, AccountMutation, PaymentApplication, UnresolvedPayment};
use super::pricing::{PaymentResolution, PlanResolver};
use super::scheduler::SweepTrigger;
use super::store::{EntitlementStore, StoreError};

type HmacSha512 = Hmac<Sha512>;

pub const CHARGE_SUCCESS_EVENT: &str = "charge.success";
pub const DEFAULT_PLAN_DURATION_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("unrecognized amount {amount}")]
    UnrecognizedAmount { amount: i64 },
    #[error("payment does not reference a known account")]
    MissingAccount,
    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Granted {
        account: Account,
        resolution: PaymentResolution,
    },
    /// The event reference was processed by an earlier delivery.
    Duplicate,
    /// Verified, but not an event that grants anything.
    Ignored { event: String },
}

#[derive(Debug, Deserialize)]
struct GatewayEnvelope {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct ChargeData {
    reference: Option<String>,
    amount: Option<i64>,
    #[serde(default)]
    metadata: Value,
}

impl ChargeData {
    fn account_id(&self) -> Option<String> {
        let value = self.metadata.get("account_id")?;
        let account_id = match value {
            Value::String(text) => text.trim().to_string(),
            Value::Number(number) => number.to_string(),
            _ => return None,
        };
        (!account_id.is_empty()).then_some(account_id)
    }
}

/// Hex HMAC-SHA-512 of `payload`, as the gateway sends it.
pub fn sign(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha512::new_from_slice(secret).expect("HMAC can use any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex signature header over the raw body.
pub fn verify_signature(secret: &[u8], payload: &[u8], header: Option<&str>) -> bool {
    let Some(header) = header else {
        return false;
    };
    let Ok(signature) = hex::decode(header.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha512::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

/// key: webhook-ingress -> signed payment events into entitlements
pub struct WebhookIngress {
    store: Arc<dyn EntitlementStore>,
    resolver: PlanResolver,
    secret: Vec<u8>,
    plan_duration: Duration,
    sweep: Option<SweepTrigger>,
}

impl WebhookIngress {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        resolver: PlanResolver,
        secret: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            store,
            resolver,
            secret: secret.into(),
            plan_duration: Duration::days(DEFAULT_PLAN_DURATION_DAYS),
            sweep: None,
        }
    }

    pub fn with_plan_duration(mut self, plan_duration: Duration) -> Self {
        self.plan_duration = plan_duration;
        self
    }

    pub fn with_sweep_trigger(mut self, sweep: SweepTrigger) -> Self {
        self.sweep = Some(sweep);
        self
    }

    pub async fn handle(
        &self,
        raw_payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, WebhookError> {
        self.handle_at(raw_payload, signature, Utc::now()).await
    }

    pub async fn handle_at(
        &self,
        raw_payload: &[u8],
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, WebhookError> {
        if !verify_signature(&self.secret, raw_payload, signature) {
            warn!(
                payload_len = raw_payload.len(),
                has_signature = signature.is_some(),
                "rejected payment webhook with invalid signature"
            );
            return Err(WebhookError::InvalidSignature);
        }

        let envelope: GatewayEnvelope = serde_json::from_slice(raw_payload).map_err(|err| {
            warn!(?err, "payment webhook body is not a gateway envelope");
            WebhookError::MalformedPayload(err.to_string())
        })?;
        if envelope.event != CHARGE_SUCCESS_EVENT {
            info!(event = %envelope.event, "ignoring non-charge payment webhook");
            return Ok(WebhookOutcome::Ignored {
                event: envelope.event,
            });
        }

        let charge: ChargeData = serde_json::from_value(envelope.data).map_err(|err| {
            warn!(?err, "charge webhook data could not be parsed");
            WebhookError::MalformedPayload(err.to_string())
        })?;
        let reference = charge
            .reference
            .as_deref()
            .map(str::trim)
            .filter(|reference| !reference.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                warn!(amount = ?charge.amount, "charge webhook without reference");
                WebhookError::MalformedPayload("missing reference".to_string())
            })?;
        let amount = charge.amount.ok_or_else(|| {
            warn!(%reference, "charge webhook without amount");
            WebhookError::MalformedPayload("missing amount".to_string())
        })?;
        let account_id = charge.account_id().ok_or_else(|| {
            warn!(%reference, amount, "charge webhook without account");
            WebhookError::MissingAccount
        })?;

        if self.store.is_processed(&reference).await? {
            info!(%reference, %account_id, "duplicate payment webhook acknowledged");
            return Ok(WebhookOutcome::Duplicate);
        }

        let resolution = self.resolver.resolve(amount);
        let mutation = match resolution {
            PaymentResolution::ActivationFee => AccountMutation::Activate,
            PaymentResolution::PlanUpgrade(tier) => AccountMutation::UpgradePlan {
                tier,
                expires_at: now + self.plan_duration,
            },
            PaymentResolution::Rejected => {
                self.record_unresolved(&reference, &account_id, amount, now)
                    .await;
                return Err(WebhookError::UnrecognizedAmount { amount });
            }
        };

        let applied = self
            .store
            .apply_payment(
                &reference,
                &account_id,
                amount,
                resolution.ledger_outcome(),
                mutation,
            )
            .await;

        match applied {
            Ok(PaymentApplication::Applied(account)) => {
                info!(
                    %reference,
                    %account_id,
                    amount,
                    outcome = resolution.ledger_outcome(),
                    plan = %account.plan,
                    activated = account.activated,
                    expires_at = ?account.plan_expires_at,
                    "payment applied to entitlements"
                );
                if matches!(resolution, PaymentResolution::PlanUpgrade(_)) {
                    if let Some(sweep) = &self.sweep {
                        sweep.request_sweep();
                    }
                }
                Ok(WebhookOutcome::Granted {
                    account,
                    resolution,
                })
            }
            Ok(PaymentApplication::AlreadyProcessed) => {
                info!(%reference, %account_id, "payment webhook lost the race to a duplicate");
                Ok(WebhookOutcome::Duplicate)
            }
            Err(StoreError::NotFound(_)) => {
                warn!(%reference, %account_id, amount, "payment for unknown account");
                Err(WebhookError::MissingAccount)
            }
            Err(err) => {
                error!(?err, %reference, %account_id, amount, "failed to persist payment");
                Err(WebhookError::PersistenceFailure(err))
            }
        }
    }

    async fn record_unresolved(
        &self,
        reference: &str,
        account_id: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) {
        error!(
            alert = "payment_without_entitlement",
            %reference,
            %account_id,
            amount,
            "payment amount does not match any price; no entitlement granted"
        );
        let payment = UnresolvedPayment {
            event_reference: reference.to_string(),
            account_id: Some(account_id.to_string()),
            amount,
            reason: "unrecognized amount".to_string(),
            received_at: now,
        };
        if let Err(err) = self.store.record_unresolved_payment(&payment).await {
            warn!(?err, %reference, "failed to record unresolved payment");
        }
    }
}
