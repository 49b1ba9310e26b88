//! Redemption error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use vault_core::{Credits, DomainError, OrderId, ProductId};

pub type RedemptionResult<T> = Result<T, RedemptionError>;

/// Which record a `NotFound` refers to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "id", rename_all = "snake_case")]
pub enum Entity {
    Account,
    Product(ProductId),
    Order(OrderId),
}

impl core::fmt::Display for Entity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Entity::Account => f.write_str("account"),
            Entity::Product(id) => write!(f, "product {id}"),
            Entity::Order(id) => write!(f, "order {id}"),
        }
    }
}

/// Every way a redemption engine call can fail.
///
/// A failed call never leaves a partial mutation behind, so every variant
/// except `Unavailable` is final for the given inputs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RedemptionError {
    #[error("{0} not found")]
    NotFound(Entity),

    #[error("forbidden")]
    Forbidden,

    #[error("product {product_id} out of stock: requested {requested}, available {available}")]
    OutOfStock {
        product_id: ProductId,
        requested: u32,
        available: u32,
    },

    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Credits, available: Credits },

    #[error("validation failed: {0}")]
    Validation(String),

    /// Price changed between quote and commit, stale version, or an invalid
    /// status transition.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage failure. Retrying the same call may succeed.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl RedemptionError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RedemptionError::Unavailable(_))
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            RedemptionError::NotFound(_) => "not_found",
            RedemptionError::Forbidden => "forbidden",
            RedemptionError::OutOfStock { .. } => "out_of_stock",
            RedemptionError::InsufficientFunds { .. } => "insufficient_funds",
            RedemptionError::Validation(_) => "validation",
            RedemptionError::Conflict(_) => "conflict",
            RedemptionError::Unavailable(_) => "unavailable",
        }
    }

    /// Short message suitable for showing to a student or admin.
    pub fn user_message(&self) -> String {
        match self {
            RedemptionError::NotFound(Entity::Account) => "Account not found.".to_string(),
            RedemptionError::NotFound(Entity::Product(_)) => {
                "This product is no longer available.".to_string()
            }
            RedemptionError::NotFound(Entity::Order(_)) => "Order not found.".to_string(),
            RedemptionError::Forbidden => {
                "Your account is not allowed to perform this action.".to_string()
            }
            RedemptionError::OutOfStock { available: 0, .. } => {
                "Sorry, this product is out of stock.".to_string()
            }
            RedemptionError::OutOfStock { available, .. } => {
                format!("Only {available} left in stock.")
            }
            RedemptionError::InsufficientFunds {
                required,
                available,
            } => format!("Not enough credits: this costs {required}, you have {available}."),
            RedemptionError::Validation(msg) => format!("Invalid request: {msg}."),
            RedemptionError::Conflict(_) => {
                "Something changed while you were checking out. Please review and try again."
                    .to_string()
            }
            RedemptionError::Unavailable(_) => {
                "The store is temporarily unavailable. Please try again.".to_string()
            }
        }
    }
}

impl From<DomainError> for RedemptionError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                RedemptionError::Validation(msg)
            }
            DomainError::InvariantViolation(msg) | DomainError::Conflict(msg) => {
                RedemptionError::Conflict(msg)
            }
            // Callers that know the entity map NotFound themselves.
            DomainError::NotFound => RedemptionError::NotFound(Entity::Account),
            DomainError::Forbidden => RedemptionError::Forbidden,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(RedemptionError::unavailable("pool timed out").is_retryable());
        assert!(!RedemptionError::Forbidden.is_retryable());
        assert!(!RedemptionError::conflict("stale").is_retryable());
    }

    #[test]
    fn user_messages_mention_amounts() {
        let msg = RedemptionError::InsufficientFunds {
            required: Credits::new(500),
            available: Credits::new(100),
        }
        .user_message();
        assert!(msg.contains("500 VC"));
        assert!(msg.contains("100 VC"));

        let msg = RedemptionError::OutOfStock {
            product_id: ProductId::new(),
            requested: 3,
            available: 2,
        }
        .user_message();
        assert_eq!(msg, "Only 2 left in stock.");
    }

    #[test]
    fn domain_errors_map_to_redemption_kinds() {
        assert_eq!(
            RedemptionError::from(DomainError::validation("bad")),
            RedemptionError::Validation("bad".to_string())
        );
        assert_eq!(
            RedemptionError::from(DomainError::Forbidden),
            RedemptionError::Forbidden
        );
        assert_eq!(RedemptionError::Forbidden.code(), "forbidden");
    }
}
