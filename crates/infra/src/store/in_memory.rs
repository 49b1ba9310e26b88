use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use vault_accounts::Account;
use vault_catalog::Product;
use vault_core::{AccountId, Aggregate, AggregateRoot, ExpectedVersion, OrderId, ProductId};
use vault_redemption::{CancellationPlan, Entity, Order, RedemptionError, RedemptionPlan};

use super::{
    AccountStore, AggregateStore, CommittedCancellation, CommittedRedemption, Ledger, OrderFilter,
    OrderStore, ProductFilter, ProductStore, StoreError,
};

#[derive(Debug, Default)]
struct Tables {
    accounts: HashMap<AccountId, Account>,
    products: HashMap<ProductId, Product>,
    orders: HashMap<OrderId, Order>,
}

/// In-memory store for tests/dev.
///
/// One lock guards every table, so a ledger commit observes and mutates
/// accounts, products and orders as a single step.
#[derive(Debug, Default)]
pub struct InMemoryVaultStore {
    tables: RwLock<Tables>,
}

impl InMemoryVaultStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }
}

fn check_version<A: AggregateRoot>(
    existing: Option<&A>,
    expected: ExpectedVersion,
) -> Result<(), StoreError> {
    let current = existing.map(|a| a.version());
    if expected.matches(current) {
        return Ok(());
    }
    match (expected, current) {
        (ExpectedVersion::Exact(_), None) => Err(StoreError::NotFound),
        _ => Err(StoreError::Conflict(format!(
            "expected {expected:?}, found {current:?}"
        ))),
    }
}

#[async_trait]
impl AggregateStore<Account> for InMemoryVaultStore {
    async fn load(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        Ok(self.read()?.accounts.get(&id).cloned())
    }

    async fn save(&self, account: &Account, expected: ExpectedVersion) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let id = account.id_typed();
        check_version(tables.accounts.get(&id), expected)?;

        if tables
            .accounts
            .values()
            .any(|a| a.id_typed() != id && a.email() == account.email())
        {
            return Err(StoreError::Duplicate(format!(
                "email already registered: {}",
                account.email()
            )));
        }

        tables.accounts.insert(id, account.clone());
        Ok(())
    }

    async fn delete(&self, id: AccountId) -> Result<bool, StoreError> {
        Ok(self.write()?.accounts.remove(&id).is_some())
    }
}

#[async_trait]
impl AccountStore for InMemoryVaultStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, StoreError> {
        Ok(self
            .read()?
            .accounts
            .values()
            .find(|a| a.email() == email)
            .cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let mut accounts: Vec<Account> = self.read()?.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.email().cmp(b.email()));
        Ok(accounts)
    }
}

#[async_trait]
impl AggregateStore<Product> for InMemoryVaultStore {
    async fn load(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.read()?.products.get(&id).cloned())
    }

    async fn save(&self, product: &Product, expected: ExpectedVersion) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        check_version(tables.products.get(&product.id_typed()), expected)?;
        tables.products.insert(product.id_typed(), product.clone());
        Ok(())
    }

    async fn delete(&self, id: ProductId) -> Result<bool, StoreError> {
        Ok(self.write()?.products.remove(&id).is_some())
    }
}

#[async_trait]
impl ProductStore for InMemoryVaultStore {
    async fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, StoreError> {
        let mut products: Vec<Product> = self
            .read()?
            .products
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        products.sort_by(|a, b| a.title().cmp(b.title()).then(a.id_typed().cmp(&b.id_typed())));
        Ok(products)
    }
}

#[async_trait]
impl AggregateStore<Order> for InMemoryVaultStore {
    async fn load(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.read()?.orders.get(&id).cloned())
    }

    async fn save(&self, order: &Order, expected: ExpectedVersion) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        check_version(tables.orders.get(&order.id_typed()), expected)?;
        tables.orders.insert(order.id_typed(), order.clone());
        Ok(())
    }

    async fn delete(&self, id: OrderId) -> Result<bool, StoreError> {
        Ok(self.write()?.orders.remove(&id).is_some())
    }
}

fn newest_first(mut orders: Vec<Order>) -> Vec<Order> {
    orders.sort_by(|a, b| {
        let at = |o: &Order| o.history().first().map(|h| h.at);
        at(b).cmp(&at(a)).then(b.id_typed().cmp(&a.id_typed()))
    });
    orders
}

#[async_trait]
impl OrderStore for InMemoryVaultStore {
    async fn list_for_account(&self, account_id: AccountId) -> Result<Vec<Order>, StoreError> {
        let orders = self
            .read()?
            .orders
            .values()
            .filter(|o| o.account_id() == Some(account_id))
            .cloned()
            .collect();
        Ok(newest_first(orders))
    }

    async fn list_orders(&self, filter: OrderFilter) -> Result<Vec<Order>, StoreError> {
        let orders = self
            .read()?
            .orders
            .values()
            .filter(|o| filter.status.is_none_or(|s| o.status() == s))
            .cloned()
            .collect();
        Ok(newest_first(orders))
    }
}

#[async_trait]
impl Ledger for InMemoryVaultStore {
    async fn commit_redemption(
        &self,
        plan: &RedemptionPlan,
    ) -> Result<CommittedRedemption, RedemptionError> {
        let mut tables = self.write()?;

        if tables.orders.contains_key(&plan.order_id) {
            return Err(RedemptionError::conflict("order id already used"));
        }

        // Check every condition before touching anything.
        let mut products = Vec::with_capacity(plan.stock.len());
        for line in &plan.stock {
            let product = tables
                .products
                .get(&line.product_id)
                .filter(|p| p.is_visible())
                .ok_or(RedemptionError::NotFound(Entity::Product(line.product_id)))?;
            if product.stock() < line.quantity {
                return Err(RedemptionError::OutOfStock {
                    product_id: line.product_id,
                    requested: line.quantity,
                    available: product.stock(),
                });
            }
            if product.price() != line.unit_price {
                return Err(RedemptionError::conflict(format!(
                    "price of product {} changed",
                    line.product_id
                )));
            }
            products.push(product.clone());
        }

        let mut account = tables
            .accounts
            .get(&plan.account_id)
            .cloned()
            .ok_or(RedemptionError::NotFound(Entity::Account))?;
        if !account.access_allowed() {
            return Err(RedemptionError::Forbidden);
        }
        if account.balance() < plan.total {
            return Err(RedemptionError::InsufficientFunds {
                required: plan.total,
                available: account.balance(),
            });
        }

        account.apply(&plan.account_event);
        for product in products.iter_mut() {
            if let Some(event) = plan
                .product_events
                .iter()
                .find(|e| e.product_id() == product.id_typed())
            {
                product.apply(event);
            }
        }
        let order = Order::from_record(plan.order.clone());

        tables.accounts.insert(account.id_typed(), account.clone());
        for product in &products {
            tables.products.insert(product.id_typed(), product.clone());
        }
        tables.orders.insert(order.id_typed(), order.clone());

        Ok(CommittedRedemption {
            order,
            account,
            products,
        })
    }

    async fn commit_cancellation(
        &self,
        plan: &CancellationPlan,
    ) -> Result<CommittedCancellation, RedemptionError> {
        let mut tables = self.write()?;

        let stored = tables
            .orders
            .get(&plan.order_id)
            .ok_or(RedemptionError::NotFound(Entity::Order(plan.order_id)))?;
        if stored.version() != plan.expected_order_version {
            return Err(RedemptionError::conflict("order changed concurrently"));
        }

        let mut account = tables
            .accounts
            .get(&plan.account_id)
            .cloned()
            .ok_or(RedemptionError::NotFound(Entity::Account))?;
        account.apply(&plan.account_event);

        let mut products = Vec::new();
        for event in &plan.product_events {
            if let Some(product) = tables.products.get(&event.product_id()) {
                let mut product = product.clone();
                product.apply(event);
                products.push(product);
            }
        }

        tables.accounts.insert(account.id_typed(), account.clone());
        for product in &products {
            tables.products.insert(product.id_typed(), product.clone());
        }
        tables.orders.insert(plan.order_id, plan.order.clone());

        Ok(CommittedCancellation {
            order: plan.order.clone(),
            account,
            products,
        })
    }
}
