use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vault_core::{AccountId, MAX_LINE_QUANTITY, ProductId};

use crate::error::RedemptionError;

/// One requested (product, quantity) pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemLine {
    pub product_id: ProductId,
    pub quantity: u32,
}

impl RedeemLine {
    pub fn new(product_id: ProductId, quantity: u32) -> Self {
        Self {
            product_id,
            quantity,
        }
    }
}

/// A validated redemption request.
///
/// Always holds at least one line, at most one line per product, and every
/// quantity within `1..=MAX_LINE_QUANTITY`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedeemRequest {
    account_id: AccountId,
    lines: Vec<RedeemLine>,
    occurred_at: DateTime<Utc>,
}

impl RedeemRequest {
    /// Validate and normalize raw lines. Duplicate products are merged in
    /// first-seen order.
    pub fn new(
        account_id: AccountId,
        lines: impl IntoIterator<Item = RedeemLine>,
        occurred_at: DateTime<Utc>,
    ) -> Result<Self, RedemptionError> {
        let mut merged: Vec<RedeemLine> = Vec::new();

        for line in lines {
            if line.quantity == 0 {
                return Err(RedemptionError::validation("quantity must be at least 1"));
            }
            match merged.iter_mut().find(|l| l.product_id == line.product_id) {
                Some(existing) => {
                    existing.quantity = existing.quantity.saturating_add(line.quantity);
                }
                None => merged.push(line),
            }
        }

        if merged.is_empty() {
            return Err(RedemptionError::validation(
                "a redemption needs at least one item",
            ));
        }

        if let Some(line) = merged.iter().find(|l| l.quantity > MAX_LINE_QUANTITY) {
            return Err(RedemptionError::validation(format!(
                "quantity {} for product {} exceeds the limit of {MAX_LINE_QUANTITY}",
                line.quantity, line.product_id
            )));
        }

        Ok(Self {
            account_id,
            lines: merged,
            occurred_at,
        })
    }

    /// Shorthand for the common single-product redemption.
    pub fn single(
        account_id: AccountId,
        product_id: ProductId,
        quantity: u32,
        occurred_at: DateTime<Utc>,
    ) -> Result<Self, RedemptionError> {
        Self::new(
            account_id,
            [RedeemLine::new(product_id, quantity)],
            occurred_at,
        )
    }

    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    pub fn lines(&self) -> &[RedeemLine] {
        &self.lines
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn product_ids(&self) -> impl Iterator<Item = ProductId> + '_ {
        self.lines.iter().map(|l| l.product_id)
    }
}

/// How a saved cart is checked out.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutMode {
    /// The whole cart is one atomic redemption.
    #[default]
    AllOrNothing,
    /// Each cart line is redeemed on its own; earlier successes stand.
    PerLine,
}

impl core::str::FromStr for CheckoutMode {
    type Err = RedemptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all_or_nothing" | "atomic" => Ok(CheckoutMode::AllOrNothing),
            "per_line" => Ok(CheckoutMode::PerLine),
            other => Err(RedemptionError::validation(format!(
                "unknown checkout mode: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_products_are_merged() {
        let p = ProductId::new();
        let q = ProductId::new();
        let request = RedeemRequest::new(
            AccountId::new(),
            [
                RedeemLine::new(p, 2),
                RedeemLine::new(q, 1),
                RedeemLine::new(p, 3),
            ],
            Utc::now(),
        )
        .unwrap();
        assert_eq!(
            request.lines(),
            &[RedeemLine::new(p, 5), RedeemLine::new(q, 1)]
        );
    }

    #[test]
    fn empty_request_is_rejected() {
        let err = RedeemRequest::new(AccountId::new(), [], Utc::now()).unwrap_err();
        assert!(matches!(err, RedemptionError::Validation(_)));
    }

    #[test]
    fn zero_quantity_is_rejected() {
        let err =
            RedeemRequest::single(AccountId::new(), ProductId::new(), 0, Utc::now()).unwrap_err();
        assert!(matches!(err, RedemptionError::Validation(_)));
    }

    #[test]
    fn merged_quantity_above_limit_is_rejected() {
        let p = ProductId::new();
        let err = RedeemRequest::new(
            AccountId::new(),
            [RedeemLine::new(p, 60), RedeemLine::new(p, 40)],
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, RedemptionError::Validation(_)));
    }

    #[test]
    fn checkout_mode_parses_config_values() {
        assert_eq!(
            "per_line".parse::<CheckoutMode>().unwrap(),
            CheckoutMode::PerLine
        );
        assert_eq!(
            " ALL_OR_NOTHING ".parse::<CheckoutMode>().unwrap(),
            CheckoutMode::AllOrNothing
        );
        assert!("sometimes".parse::<CheckoutMode>().is_err());
    }
}
