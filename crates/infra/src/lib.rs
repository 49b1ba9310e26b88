//! Infrastructure layer: storage, services, configuration.
//!
//! - [`store`]: the storage traits, the in-memory store and the Postgres store
//! - [`command_dispatcher`]: load → handle → apply → save → publish
//! - [`services`]: accounts, catalog and the redemption engine
//! - [`config`]: environment-driven configuration

pub mod command_dispatcher;
pub mod config;
pub mod services;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use command_dispatcher::{CommandDispatcher, Dispatched, ServiceError};
pub use config::{ConfigError, StoreBackend, VaultConfig};
pub use services::{
    AccountService, Cancellation, CartCheckout, CartLineOutcome, CatalogService, NewProduct,
    RedemptionEngine, RedemptionReceipt, VaultServices,
};
pub use store::{
    AccountStore, AggregateStore, CommittedCancellation, CommittedRedemption,
    InMemoryVaultStore, Ledger, OrderFilter, OrderStore, PostgresVaultStore, ProductFilter,
    ProductStore, SharedStore, StoreError, VaultStore,
};
