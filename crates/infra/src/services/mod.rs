//! Application services over the store and bus.
//!
//! Each service wraps a [`CommandDispatcher`](crate::command_dispatcher::CommandDispatcher)
//! and takes the acting identity explicitly on every admin call.

pub mod accounts;
pub mod catalog;
pub mod redemption;

use std::sync::Arc;

use serde_json::Value as JsonValue;

use vault_accounts::Account;
use vault_core::AccountId;
use vault_events::{EventBus, EventEnvelope};

use crate::command_dispatcher::CommandDispatcher;
use crate::store::{AggregateStore, StoreError, VaultStore};

pub use accounts::AccountService;
pub use catalog::{CatalogService, NewProduct};
pub use redemption::{
    Cancellation, CartCheckout, CartLineOutcome, RedemptionEngine, RedemptionReceipt,
};

/// The three services wired to one store and one bus.
#[derive(Debug)]
pub struct VaultServices<S: ?Sized, B> {
    pub accounts: AccountService<S, B>,
    pub catalog: CatalogService<S, B>,
    pub redemption: RedemptionEngine<S, B>,
}

impl<S: ?Sized, B: Clone> Clone for VaultServices<S, B> {
    fn clone(&self) -> Self {
        Self {
            accounts: self.accounts.clone(),
            catalog: self.catalog.clone(),
            redemption: self.redemption.clone(),
        }
    }
}

impl<S, B> VaultServices<S, B>
where
    S: VaultStore + ?Sized,
    B: EventBus<EventEnvelope<JsonValue>> + Clone,
{
    pub fn new(store: Arc<S>, bus: B) -> Self {
        let dispatcher = CommandDispatcher::new(store, bus);
        Self {
            accounts: AccountService::new(dispatcher.clone()),
            catalog: CatalogService::new(dispatcher.clone()),
            redemption: RedemptionEngine::new(dispatcher),
        }
    }
}

pub(crate) const ACCOUNT: &str = "accounts.account";
pub(crate) const PRODUCT: &str = "catalog.product";
pub(crate) const ORDER: &str = "redemption.order";

/// Load `admin_id` and return it if it may perform admin operations.
///
/// `Ok(None)` covers both an unknown account and one without the admin flag
/// or access; callers turn that into their own `Forbidden`.
pub(crate) async fn load_admin<S>(
    store: &S,
    admin_id: AccountId,
) -> Result<Option<Account>, StoreError>
where
    S: AggregateStore<Account> + ?Sized,
{
    Ok(store
        .load(admin_id)
        .await?
        .filter(|account| account.can_administer()))
}
