//! Venture Credits (VC): the storefront's internal point currency.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::value_object::ValueObject;

/// A non-negative amount of Venture Credits.
///
/// All arithmetic is checked; a balance or price below zero cannot be
/// represented.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Credits(u64);

impl Credits {
    pub const ZERO: Credits = Credits(0);

    pub const fn new(amount: u64) -> Self {
        Self(amount)
    }

    pub const fn amount(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Credits) -> Option<Credits> {
        self.0.checked_add(other.0).map(Credits)
    }

    pub fn checked_sub(self, other: Credits) -> Option<Credits> {
        self.0.checked_sub(other.0).map(Credits)
    }

    pub fn saturating_add(self, other: Credits) -> Credits {
        Credits(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Credits) -> Credits {
        Credits(self.0.saturating_sub(other.0))
    }

    /// Unit price times quantity.
    pub fn checked_mul(self, quantity: u32) -> Option<Credits> {
        self.0.checked_mul(u64::from(quantity)).map(Credits)
    }

    /// Apply a signed adjustment (admin grant or removal).
    ///
    /// Returns `None` when the result would be negative or overflow.
    pub fn apply_delta(self, delta: i64) -> Option<Credits> {
        if delta >= 0 {
            self.0.checked_add(delta.unsigned_abs()).map(Credits)
        } else {
            self.0.checked_sub(delta.unsigned_abs()).map(Credits)
        }
    }
}

impl ValueObject for Credits {}

impl core::fmt::Display for Credits {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} VC", self.0)
    }
}

impl From<u64> for Credits {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Database columns are signed `BIGINT`.
impl TryFrom<i64> for Credits {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u64::try_from(value)
            .map(Credits)
            .map_err(|_| DomainError::invariant(format!("negative credit amount: {value}")))
    }
}

impl TryFrom<Credits> for i64 {
    type Error = DomainError;

    fn try_from(value: Credits) -> Result<Self, Self::Error> {
        i64::try_from(value.0)
            .map_err(|_| DomainError::invariant(format!("credit amount too large: {}", value.0)))
    }
}
