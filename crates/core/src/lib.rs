//! `vault-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the credit amount type, the domain error model and the aggregate
//! traits shared by accounts, catalog and redemption.

pub mod aggregate;
pub mod credits;
pub mod error;
pub mod id;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use credits::Credits;
pub use error::{DomainError, DomainResult};
pub use id::{AccountId, OrderId, ProductId};
pub use value_object::ValueObject;

/// Upper bound for a single cart or order line quantity.
pub const MAX_LINE_QUANTITY: u32 = 99;
