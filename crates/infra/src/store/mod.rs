//! Storage collaborators.
//!
//! Accounts, products and orders are stored as current state with a `version`
//! column. Single-aggregate changes go through [`AggregateStore::save`] with an
//! [`ExpectedVersion`]; a redemption or cancellation touches several aggregates
//! at once and goes through the [`Ledger`], which is the only transactional
//! boundary that spans them.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use vault_accounts::Account;
use vault_catalog::Product;
use vault_core::{AccountId, AggregateRoot, ExpectedVersion};
use vault_redemption::{
    CancellationPlan, Order, OrderStatus, RedemptionError, RedemptionPlan,
};

pub use in_memory::InMemoryVaultStore;
pub use postgres::PostgresVaultStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    /// Stale version on save.
    #[error("concurrency conflict: {0}")]
    Conflict(String),

    /// Unique constraint (e.g. email already registered).
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// Check constraint or other integrity rule rejected the write.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// A stored row could not be decoded into a domain value.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Connectivity, pool or driver failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for RedemptionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) | StoreError::Duplicate(msg) => {
                RedemptionError::Conflict(msg)
            }
            // The store does not know which entity vanished; callers that do
            // map their own NotFound before reaching this conversion.
            StoreError::NotFound => RedemptionError::conflict("record no longer exists"),
            StoreError::Integrity(msg) | StoreError::Corrupt(msg) | StoreError::Backend(msg) => {
                RedemptionError::Unavailable(msg)
            }
        }
    }
}

/// Load/save of one aggregate type with optimistic concurrency.
#[async_trait]
pub trait AggregateStore<A>: Send + Sync
where
    A: AggregateRoot + Send + Sync,
{
    async fn load(&self, id: A::Id) -> Result<Option<A>, StoreError>;

    /// Persist the aggregate's current state.
    ///
    /// `expected` is the version the caller loaded: `NoRecord` inserts, `Exact`
    /// updates only when the stored version still matches.
    async fn save(&self, aggregate: &A, expected: ExpectedVersion) -> Result<(), StoreError>;

    /// Hard delete. Returns `false` when nothing was stored under `id`.
    async fn delete(&self, id: A::Id) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait AccountStore: AggregateStore<Account> {
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, StoreError>;

    /// All accounts ordered by email.
    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError>;
}

/// Catalog listing filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductFilter {
    pub category: Option<String>,
    pub visible_only: bool,
}

impl ProductFilter {
    pub fn matches(&self, product: &Product) -> bool {
        (!self.visible_only || product.is_visible())
            && self
                .category
                .as_deref()
                .is_none_or(|c| product.details().category == c)
    }
}

#[async_trait]
pub trait ProductStore: AggregateStore<Product> {
    /// Products matching `filter`, ordered by title.
    async fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, StoreError>;
}

/// Back-office order listing filter.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
}

#[async_trait]
pub trait OrderStore: AggregateStore<Order> {
    /// Orders owned by `account_id`, newest first.
    async fn list_for_account(&self, account_id: AccountId) -> Result<Vec<Order>, StoreError>;

    /// Orders matching `filter`, newest first.
    async fn list_orders(&self, filter: OrderFilter) -> Result<Vec<Order>, StoreError>;
}

/// State of every aggregate touched by a committed redemption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedRedemption {
    pub order: Order,
    pub account: Account,
    pub products: Vec<Product>,
}

/// State of every aggregate touched by a committed cancellation.
///
/// `products` omits products deleted since the order was placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedCancellation {
    pub order: Order,
    pub account: Account,
    pub products: Vec<Product>,
}

/// The transactional boundary for multi-aggregate changes.
///
/// Both operations either apply every change or none of them. Failures are
/// classified into the redemption error taxonomy.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Debit the account, decrement every product's stock and insert the order.
    ///
    /// The debit only applies while access is allowed and the balance covers
    /// the total; each decrement only applies while the product is visible,
    /// has enough stock and still carries the quoted unit price.
    async fn commit_redemption(
        &self,
        plan: &RedemptionPlan,
    ) -> Result<CommittedRedemption, RedemptionError>;

    /// Cancel the order, refund its total and restock its lines.
    async fn commit_cancellation(
        &self,
        plan: &CancellationPlan,
    ) -> Result<CommittedCancellation, RedemptionError>;
}

/// Everything the services need from storage.
pub trait VaultStore: AccountStore + ProductStore + OrderStore + Ledger {}

impl<T> VaultStore for T where T: AccountStore + ProductStore + OrderStore + Ledger + ?Sized {}

pub type SharedStore = Arc<dyn VaultStore>;
