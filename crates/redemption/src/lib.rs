//! Redemption domain module.
//!
//! The pure half of the redemption engine: validated requests, quoting against
//! account and product state, the Order aggregate with its status machine, and
//! the typed error taxonomy. Committing a plan is the ledger's job (see
//! `vault-infra`).

pub mod cancellation;
pub mod error;
pub mod order;
pub mod quote;
pub mod request;

pub use cancellation::CancellationPlan;
pub use error::{Entity, RedemptionError, RedemptionResult};
pub use order::{
    ChangeStatus, Order, OrderCommand, OrderEvent, OrderLine, OrderPlaced, OrderRecord,
    OrderStatus, OrderStatusChanged, PlaceOrder, StatusChange,
};
pub use quote::{PlannedStock, Quote, QuotedLine, RedemptionPlan};
pub use request::{CheckoutMode, RedeemLine, RedeemRequest};
