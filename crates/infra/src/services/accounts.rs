use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{info, instrument};

use vault_accounts::{
    Account, AccountCommand, AddToCart, AdjustBalance, ClearCart, Credential, EnrollAccount,
    RegisterAccount, RemoveFromCart, SetAccess, SetAdmin, SetCredential, ToggleWishlist,
    UpdateCartLine, normalize_email,
};
use vault_catalog::Product;
use vault_core::{AccountId, Credits, ProductId};
use vault_events::{EventBus, EventEnvelope};

use super::{ACCOUNT, load_admin};
use crate::command_dispatcher::{CommandDispatcher, ServiceError};
use crate::store::{AggregateStore, VaultStore};

/// Enrollment, balances, flags, cart and wishlist.
#[derive(Debug)]
pub struct AccountService<S: ?Sized, B> {
    dispatcher: CommandDispatcher<S, B>,
}

impl<S: ?Sized, B: Clone> Clone for AccountService<S, B> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<S, B> AccountService<S, B>
where
    S: VaultStore + ?Sized,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(dispatcher: CommandDispatcher<S, B>) -> Self {
        Self { dispatcher }
    }

    async fn require_admin(&self, admin_id: AccountId) -> Result<Account, ServiceError> {
        load_admin(&**self.dispatcher.store(), admin_id)
            .await?
            .ok_or(ServiceError::Forbidden)
    }

    async fn execute(
        &self,
        account_id: AccountId,
        command: AccountCommand,
    ) -> Result<Account, ServiceError> {
        let dispatched = self
            .dispatcher
            .dispatch(account_id, ACCOUNT, command, Account::empty)
            .await?;
        Ok(dispatched.aggregate)
    }

    /// Admin enrollment of a new account with an opening balance.
    #[instrument(skip(self, email, display_name), fields(admin_id = %admin_id), err)]
    pub async fn enroll(
        &self,
        admin_id: AccountId,
        email: &str,
        display_name: &str,
        initial_balance: Credits,
        is_admin: bool,
    ) -> Result<Account, ServiceError> {
        self.require_admin(admin_id).await?;
        let account_id = AccountId::new();
        let account = self
            .execute(
                account_id,
                AccountCommand::EnrollAccount(EnrollAccount {
                    account_id,
                    email: email.to_string(),
                    display_name: display_name.to_string(),
                    initial_balance,
                    is_admin,
                    occurred_at: Utc::now(),
                }),
            )
            .await?;
        info!(account_id = %account_id, balance = %account.balance(), "account enrolled");
        Ok(account)
    }

    /// Self-registration: zero balance, not an admin, access allowed.
    #[instrument(skip(self, email, display_name, credential), err)]
    pub async fn register(
        &self,
        email: &str,
        display_name: &str,
        credential: Option<String>,
    ) -> Result<Account, ServiceError> {
        let credential = credential.map(Credential::new).transpose()?;
        let account_id = AccountId::new();
        let account = self
            .execute(
                account_id,
                AccountCommand::RegisterAccount(RegisterAccount {
                    account_id,
                    email: email.to_string(),
                    display_name: display_name.to_string(),
                    credential,
                    occurred_at: Utc::now(),
                }),
            )
            .await?;
        info!(account_id = %account_id, "account registered");
        Ok(account)
    }

    #[instrument(skip(self, reason), fields(admin_id = %admin_id, account_id = %account_id), err)]
    pub async fn adjust_balance(
        &self,
        admin_id: AccountId,
        account_id: AccountId,
        delta: i64,
        reason: &str,
    ) -> Result<Account, ServiceError> {
        self.require_admin(admin_id).await?;
        let account = self
            .execute(
                account_id,
                AccountCommand::AdjustBalance(AdjustBalance {
                    account_id,
                    delta,
                    reason: reason.to_string(),
                    occurred_at: Utc::now(),
                }),
            )
            .await?;
        info!(delta, balance = %account.balance(), "balance adjusted");
        Ok(account)
    }

    #[instrument(skip(self), fields(admin_id = %admin_id, account_id = %account_id), err)]
    pub async fn set_access(
        &self,
        admin_id: AccountId,
        account_id: AccountId,
        allowed: bool,
    ) -> Result<Account, ServiceError> {
        self.require_admin(admin_id).await?;
        if admin_id == account_id && !allowed {
            return Err(ServiceError::Validation(
                "admins cannot revoke their own access".to_string(),
            ));
        }
        self.execute(
            account_id,
            AccountCommand::SetAccess(SetAccess {
                account_id,
                allowed,
                occurred_at: Utc::now(),
            }),
        )
        .await
    }

    #[instrument(skip(self), fields(admin_id = %admin_id, account_id = %account_id), err)]
    pub async fn set_admin(
        &self,
        admin_id: AccountId,
        account_id: AccountId,
        is_admin: bool,
    ) -> Result<Account, ServiceError> {
        self.require_admin(admin_id).await?;
        if admin_id == account_id && !is_admin {
            return Err(ServiceError::Validation(
                "admins cannot revoke their own admin flag".to_string(),
            ));
        }
        self.execute(
            account_id,
            AccountCommand::SetAdmin(SetAdmin {
                account_id,
                is_admin,
                occurred_at: Utc::now(),
            }),
        )
        .await
    }

    /// Replace or clear the opaque login credential.
    #[instrument(skip(self, credential), fields(account_id = %account_id), err)]
    pub async fn set_credential(
        &self,
        account_id: AccountId,
        credential: Option<String>,
    ) -> Result<Account, ServiceError> {
        let credential = credential.map(Credential::new).transpose()?;
        self.execute(
            account_id,
            AccountCommand::SetCredential(SetCredential {
                account_id,
                credential,
                occurred_at: Utc::now(),
            }),
        )
        .await
    }

    async fn require_redeemable(&self, product_id: ProductId) -> Result<Product, ServiceError> {
        AggregateStore::<Product>::load(&**self.dispatcher.store(), product_id)
            .await?
            .filter(Product::is_redeemable)
            .ok_or(ServiceError::NotFound)
    }

    /// Add `quantity` units to the cart line for `product_id`.
    #[instrument(skip(self), fields(account_id = %account_id, product_id = %product_id), err)]
    pub async fn add_to_cart(
        &self,
        account_id: AccountId,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<Account, ServiceError> {
        self.require_redeemable(product_id).await?;
        self.execute(
            account_id,
            AccountCommand::AddToCart(AddToCart {
                account_id,
                product_id,
                quantity,
                occurred_at: Utc::now(),
            }),
        )
        .await
    }

    /// Set a cart line's quantity; `0` removes the line.
    #[instrument(skip(self), fields(account_id = %account_id, product_id = %product_id), err)]
    pub async fn update_cart_line(
        &self,
        account_id: AccountId,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<Account, ServiceError> {
        self.execute(
            account_id,
            AccountCommand::UpdateCartLine(UpdateCartLine {
                account_id,
                product_id,
                quantity,
                occurred_at: Utc::now(),
            }),
        )
        .await
    }

    pub async fn remove_from_cart(
        &self,
        account_id: AccountId,
        product_id: ProductId,
    ) -> Result<Account, ServiceError> {
        self.execute(
            account_id,
            AccountCommand::RemoveFromCart(RemoveFromCart {
                account_id,
                product_id,
                occurred_at: Utc::now(),
            }),
        )
        .await
    }

    pub async fn clear_cart(&self, account_id: AccountId) -> Result<Account, ServiceError> {
        self.execute(
            account_id,
            AccountCommand::ClearCart(ClearCart {
                account_id,
                occurred_at: Utc::now(),
            }),
        )
        .await
    }

    /// Add the product to the wishlist, or remove it when already present.
    ///
    /// Adding requires the product to exist; removing works for deleted
    /// products too.
    #[instrument(skip(self), fields(account_id = %account_id, product_id = %product_id), err)]
    pub async fn toggle_wishlist(
        &self,
        account_id: AccountId,
        product_id: ProductId,
    ) -> Result<Account, ServiceError> {
        let account = self.get(account_id).await?;
        if !account.wishlist().contains(&product_id) {
            AggregateStore::<Product>::load(&**self.dispatcher.store(), product_id)
                .await?
                .ok_or(ServiceError::NotFound)?;
        }
        self.execute(
            account_id,
            AccountCommand::ToggleWishlist(ToggleWishlist {
                account_id,
                product_id,
                occurred_at: Utc::now(),
            }),
        )
        .await
    }

    /// Hard delete. Orders placed by the account are kept.
    #[instrument(skip(self), fields(admin_id = %admin_id, account_id = %account_id), err)]
    pub async fn delete(&self, admin_id: AccountId, account_id: AccountId) -> Result<(), ServiceError> {
        self.require_admin(admin_id).await?;
        if admin_id == account_id {
            return Err(ServiceError::Validation(
                "admins cannot delete their own account".to_string(),
            ));
        }
        let removed = AggregateStore::<Account>::delete(&**self.dispatcher.store(), account_id).await?;
        if !removed {
            return Err(ServiceError::NotFound);
        }
        info!("account deleted");
        Ok(())
    }

    pub async fn get(&self, account_id: AccountId) -> Result<Account, ServiceError> {
        AggregateStore::<Account>::load(&**self.dispatcher.store(), account_id)
            .await?
            .ok_or(ServiceError::NotFound)
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<Account>, ServiceError> {
        let email = normalize_email(email)?;
        Ok(self.dispatcher.store().find_by_email(&email).await?)
    }

    pub async fn list(&self) -> Result<Vec<Account>, ServiceError> {
        Ok(self.dispatcher.store().list_accounts().await?)
    }
}
