use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::models::PaidTier;

/// key: plan-resolver -> amount table
/// Exact minor-unit prices. Amounts never match by range or rounding.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PriceTable {
    pub activation_fee: i64,
    pub basic: i64,
    pub premium: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "tier", rename_all = "snake_case")]
pub enum PaymentResolution {
    ActivationFee,
    PlanUpgrade(PaidTier),
    Rejected,
}

impl PaymentResolution {
    pub fn ledger_outcome(&self) -> &'static str {
        match self {
            PaymentResolution::ActivationFee => "activation",
            PaymentResolution::PlanUpgrade(PaidTier::Basic) => "basic",
            PaymentResolution::PlanUpgrade(PaidTier::Premium) => "premium",
            PaymentResolution::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("price for `{name}` must be positive, got {amount}")]
    NonPositive { name: &'static str, amount: i64 },
    #[error("`{first}` and `{second}` share the amount {amount}")]
    Duplicate {
        first: &'static str,
        second: &'static str,
        amount: i64,
    },
}

#[derive(Clone, Debug)]
pub struct PlanResolver {
    table: PriceTable,
}

impl PlanResolver {
    pub fn new(table: PriceTable) -> Result<Self, PricingError> {
        let entries = [
            ("activation_fee", table.activation_fee),
            ("basic", table.basic),
            ("premium", table.premium),
        ];
        for (name, amount) in entries {
            if amount <= 0 {
                return Err(PricingError::NonPositive { name, amount });
            }
        }
        for (index, &(first, amount)) in entries.iter().enumerate() {
            if let Some(&(second, _)) = entries[index + 1..]
                .iter()
                .find(|(_, other)| *other == amount)
            {
                return Err(PricingError::Duplicate {
                    first,
                    second,
                    amount,
                });
            }
        }
        Ok(Self { table })
    }

    pub fn resolve(&self, amount: i64) -> PaymentResolution {
        if amount == self.table.activation_fee {
            PaymentResolution::ActivationFee
        } else if amount == self.table.basic {
            PaymentResolution::PlanUpgrade(PaidTier::Basic)
        } else if amount == self.table.premium {
            PaymentResolution::PlanUpgrade(PaidTier::Premium)
        } else {
            PaymentResolution::Rejected
        }
    }
}
