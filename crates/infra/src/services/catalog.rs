use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{info, instrument};

use vault_catalog::{
    ChangePrice, CreateProduct, Product, ProductCommand, ProductDetails, Restock, SetVisibility,
    UpdateDetails,
};
use vault_core::{AccountId, Credits, ProductId};
use vault_events::{EventBus, EventEnvelope};

use super::{PRODUCT, load_admin};
use crate::command_dispatcher::{CommandDispatcher, ServiceError};
use crate::store::{AggregateStore, ProductFilter, VaultStore};

/// Input for [`CatalogService::create_product`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProduct {
    pub details: ProductDetails,
    pub price: Credits,
    pub initial_stock: u32,
    pub visible: bool,
}

/// Admin-only catalog maintenance plus public reads.
///
/// Stock only goes down through the redemption ledger; here it can only be
/// raised with [`restock`](Self::restock).
#[derive(Debug)]
pub struct CatalogService<S: ?Sized, B> {
    dispatcher: CommandDispatcher<S, B>,
}

impl<S: ?Sized, B: Clone> Clone for CatalogService<S, B> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<S, B> CatalogService<S, B>
where
    S: VaultStore + ?Sized,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(dispatcher: CommandDispatcher<S, B>) -> Self {
        Self { dispatcher }
    }

    async fn execute(
        &self,
        admin_id: AccountId,
        product_id: ProductId,
        command: ProductCommand,
    ) -> Result<Product, ServiceError> {
        load_admin(&**self.dispatcher.store(), admin_id)
            .await?
            .ok_or(ServiceError::Forbidden)?;
        let dispatched = self
            .dispatcher
            .dispatch(product_id, PRODUCT, command, Product::empty)
            .await?;
        Ok(dispatched.aggregate)
    }

    #[instrument(skip(self, product), fields(admin_id = %admin_id), err)]
    pub async fn create_product(
        &self,
        admin_id: AccountId,
        product: NewProduct,
    ) -> Result<Product, ServiceError> {
        let product_id = ProductId::new();
        let created = self
            .execute(
                admin_id,
                product_id,
                ProductCommand::CreateProduct(CreateProduct {
                    product_id,
                    details: product.details,
                    price: product.price,
                    initial_stock: product.initial_stock,
                    visible: product.visible,
                    occurred_at: Utc::now(),
                }),
            )
            .await?;
        info!(product_id = %product_id, title = created.title(), "product created");
        Ok(created)
    }

    #[instrument(skip(self, details), fields(admin_id = %admin_id, product_id = %product_id), err)]
    pub async fn update_details(
        &self,
        admin_id: AccountId,
        product_id: ProductId,
        details: ProductDetails,
    ) -> Result<Product, ServiceError> {
        self.execute(
            admin_id,
            product_id,
            ProductCommand::UpdateDetails(UpdateDetails {
                product_id,
                details,
                occurred_at: Utc::now(),
            }),
        )
        .await
    }

    /// Orders already placed keep the unit price they captured.
    #[instrument(skip(self), fields(admin_id = %admin_id, product_id = %product_id), err)]
    pub async fn change_price(
        &self,
        admin_id: AccountId,
        product_id: ProductId,
        price: Credits,
    ) -> Result<Product, ServiceError> {
        let product = self
            .execute(
                admin_id,
                product_id,
                ProductCommand::ChangePrice(ChangePrice {
                    product_id,
                    price,
                    occurred_at: Utc::now(),
                }),
            )
            .await?;
        info!(price = %product.price(), "price changed");
        Ok(product)
    }

    #[instrument(skip(self), fields(admin_id = %admin_id, product_id = %product_id), err)]
    pub async fn restock(
        &self,
        admin_id: AccountId,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<Product, ServiceError> {
        let product = self
            .execute(
                admin_id,
                product_id,
                ProductCommand::Restock(Restock {
                    product_id,
                    quantity,
                    occurred_at: Utc::now(),
                }),
            )
            .await?;
        info!(quantity, stock = product.stock(), "product restocked");
        Ok(product)
    }

    #[instrument(skip(self), fields(admin_id = %admin_id, product_id = %product_id), err)]
    pub async fn set_visibility(
        &self,
        admin_id: AccountId,
        product_id: ProductId,
        visible: bool,
    ) -> Result<Product, ServiceError> {
        self.execute(
            admin_id,
            product_id,
            ProductCommand::SetVisibility(SetVisibility {
                product_id,
                visible,
                occurred_at: Utc::now(),
            }),
        )
        .await
    }

    /// Hard delete. Orders keep their captured title and price.
    #[instrument(skip(self), fields(admin_id = %admin_id, product_id = %product_id), err)]
    pub async fn delete(&self, admin_id: AccountId, product_id: ProductId) -> Result<(), ServiceError> {
        let store = self.dispatcher.store();
        load_admin(&**store, admin_id)
            .await?
            .ok_or(ServiceError::Forbidden)?;
        if !AggregateStore::<Product>::delete(&**store, product_id).await? {
            return Err(ServiceError::NotFound);
        }
        info!("product deleted");
        Ok(())
    }

    pub async fn get(&self, product_id: ProductId) -> Result<Product, ServiceError> {
        AggregateStore::<Product>::load(&**self.dispatcher.store(), product_id)
            .await?
            .ok_or(ServiceError::NotFound)
    }

    /// Products matching `filter`, sorted by title.
    pub async fn list(&self, filter: &ProductFilter) -> Result<Vec<Product>, ServiceError> {
        Ok(self.dispatcher.store().list_products(filter).await?)
    }
}
