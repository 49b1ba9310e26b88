//! Postgres-backed vault store.
//!
//! ## Error Mapping
//!
//! | SQLx error | SQLSTATE | StoreError |
//! |------------|----------|------------|
//! | Database (unique violation) | `23505` | `Duplicate` (or `Conflict` on a primary key) |
//! | Database (foreign key / check violation) | `23503` / `23514` | `Integrity` |
//! | Database (other) | any other | `Backend` |
//! | PoolClosed / PoolTimedOut / Io | n/a | `Backend` |
//! | RowNotFound | n/a | `NotFound` |
//!
//! Ledger operations classify failures further into `RedemptionError`; a
//! `Backend` failure surfaces as the retryable `Unavailable`.
//!
//! ## Ledger transactions
//!
//! A redemption runs in one transaction of conditional updates:
//!
//! ```text
//! UPDATE products SET stock = stock - qty ... WHERE visible AND stock >= qty AND price = unit_price
//! UPDATE accounts SET balance = balance - total ... WHERE access_allowed AND balance >= total
//! INSERT INTO orders ...
//! ```
//!
//! Row locks taken by the updates serialize concurrent redemptions of the same
//! product. A loser re-evaluates the `WHERE` clause after the winner commits, sees
//! the reduced stock, matches zero rows and is classified as `OutOfStock`. Rows are
//! always locked products first (by id), then the account, so redemptions and
//! cancellations cannot deadlock each other.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument, warn};
use uuid::Uuid;

use vault_accounts::{Account, AccountRecord, CartLine, Credential};
use vault_catalog::{Product, ProductDetails, ProductRecord};
use vault_core::{AccountId, AggregateRoot, Credits, ExpectedVersion, OrderId, ProductId};
use vault_redemption::{
    CancellationPlan, Entity, Order, OrderLine, OrderRecord, OrderStatus, PlannedStock,
    RedemptionError, RedemptionPlan, StatusChange,
};

use super::{
    AccountStore, AggregateStore, CommittedCancellation, CommittedRedemption, Ledger, OrderFilter,
    OrderStore, ProductFilter, ProductStore, StoreError,
};

const SCHEMA: &str = include_str!("schema.sql");

macro_rules! account_columns {
    () => {
        "id, email, display_name, credential, balance, is_admin, access_allowed, cart, wishlist, created_at, version"
    };
}

macro_rules! product_columns {
    () => {
        "id, title, description, image_ref, category, price, stock, visible, created_at, version"
    };
}

macro_rules! order_columns {
    () => {
        "id, account_id, lines, total, status, history, created_at, version"
    };
}

/// Postgres implementation of every store trait plus the ledger.
///
/// `Send + Sync`; clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct PostgresVaultStore {
    pool: Arc<PgPool>,
}

impl PostgresVaultStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[instrument(skip(database_url), err)]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the embedded schema. Safe to run repeatedly.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Distinguish "row is gone" from "row moved on" after a guarded update
    /// matched nothing.
    async fn missed_update(&self, table: &'static str, id: Uuid) -> StoreError {
        let sql = match table {
            "accounts" => "SELECT version FROM accounts WHERE id = $1",
            "products" => "SELECT version FROM products WHERE id = $1",
            _ => "SELECT version FROM orders WHERE id = $1",
        };
        match sqlx::query(sql).bind(id).fetch_optional(&*self.pool).await {
            Ok(Some(row)) => {
                let version: i64 = row.try_get("version").unwrap_or_default();
                StoreError::Conflict(format!(
                    "{table} row {id} is at version {version}"
                ))
            }
            Ok(None) => StoreError::NotFound,
            Err(e) => map_sqlx_error("check_version", e),
        }
    }
}

fn to_i64(value: u64, field: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Integrity(format!("{field} out of range")))
}

fn credits_to_i64(value: Credits, field: &str) -> Result<i64, StoreError> {
    to_i64(value.amount(), field)
}

/// `Exact(v)` becomes a version guard; `Any` disables it.
fn version_guard(expected: ExpectedVersion) -> Result<Option<i64>, StoreError> {
    match expected {
        ExpectedVersion::Exact(v) => to_i64(v, "version").map(Some),
        ExpectedVersion::Any => Ok(None),
        ExpectedVersion::NoRecord => Err(StoreError::Integrity(
            "NoRecord is an insert, not an update".to_string(),
        )),
    }
}

#[async_trait]
impl AggregateStore<Account> for PostgresVaultStore {
    #[instrument(skip(self), fields(account_id = %id), err)]
    async fn load(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            account_columns!(),
            " FROM accounts WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_account", e))?;

        row.map(|r| decode_account(&r)).transpose()
    }

    #[instrument(
        skip(self, account),
        fields(
            account_id = %account.id_typed(),
            version = account.version(),
            expected = ?expected,
            operation = tracing::field::Empty
        ),
        err
    )]
    async fn save(&self, account: &Account, expected: ExpectedVersion) -> Result<(), StoreError> {
        let span = Span::current();
        let record = account.to_record().map_err(|_| StoreError::NotFound)?;
        let balance = credits_to_i64(record.balance, "balance")?;
        let version = to_i64(record.version, "version")?;
        let credential = record.credential.as_ref().map(|c| c.expose().to_string());

        if expected == ExpectedVersion::NoRecord {
            span.record("operation", "insert_account");
            sqlx::query(
                r#"
                INSERT INTO accounts (
                    id, email, display_name, credential, balance, is_admin,
                    access_allowed, cart, wishlist, created_at, version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(record.id.as_uuid())
            .bind(&record.email)
            .bind(&record.display_name)
            .bind(credential)
            .bind(balance)
            .bind(record.is_admin)
            .bind(record.access_allowed)
            .bind(Json(&record.cart))
            .bind(Json(&record.wishlist))
            .bind(record.created_at)
            .bind(version)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_insert_error("insert_account", "accounts_pkey", e))?;
            return Ok(());
        }

        span.record("operation", "update_account");
        let result = sqlx::query(
            r#"
            UPDATE accounts SET
                email = $2,
                display_name = $3,
                credential = $4,
                balance = $5,
                is_admin = $6,
                access_allowed = $7,
                cart = $8,
                wishlist = $9,
                version = $10
            WHERE id = $1 AND ($11::bigint IS NULL OR version = $11)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(&record.email)
        .bind(&record.display_name)
        .bind(credential)
        .bind(balance)
        .bind(record.is_admin)
        .bind(record.access_allowed)
        .bind(Json(&record.cart))
        .bind(Json(&record.wishlist))
        .bind(version)
        .bind(version_guard(expected)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_account", e))?;

        if result.rows_affected() == 0 {
            return Err(self.missed_update("accounts", *record.id.as_uuid()).await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(account_id = %id), err)]
    async fn delete(&self, id: AccountId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_account", e))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl AccountStore for PostgresVaultStore {
    #[instrument(skip(self), err)]
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            account_columns!(),
            " FROM accounts WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_account_by_email", e))?;

        row.map(|r| decode_account(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            account_columns!(),
            " FROM accounts ORDER BY email ASC"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_accounts", e))?;

        rows.iter().map(decode_account).collect()
    }
}

#[async_trait]
impl AggregateStore<Product> for PostgresVaultStore {
    #[instrument(skip(self), fields(product_id = %id), err)]
    async fn load(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            product_columns!(),
            " FROM products WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_product", e))?;

        row.map(|r| decode_product(&r)).transpose()
    }

    #[instrument(
        skip(self, product),
        fields(product_id = %product.id_typed(), version = product.version(), expected = ?expected),
        err
    )]
    async fn save(&self, product: &Product, expected: ExpectedVersion) -> Result<(), StoreError> {
        let record = product.to_record().map_err(|_| StoreError::NotFound)?;
        let price = credits_to_i64(record.price, "price")?;
        let version = to_i64(record.version, "version")?;

        if expected == ExpectedVersion::NoRecord {
            sqlx::query(
                r#"
                INSERT INTO products (
                    id, title, description, image_ref, category, price, stock,
                    visible, created_at, version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(record.id.as_uuid())
            .bind(&record.details.title)
            .bind(&record.details.description)
            .bind(&record.details.image_ref)
            .bind(&record.details.category)
            .bind(price)
            .bind(i64::from(record.stock))
            .bind(record.visible)
            .bind(record.created_at)
            .bind(version)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_insert_error("insert_product", "products_pkey", e))?;
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            UPDATE products SET
                title = $2,
                description = $3,
                image_ref = $4,
                category = $5,
                price = $6,
                stock = $7,
                visible = $8,
                version = $9
            WHERE id = $1 AND ($10::bigint IS NULL OR version = $10)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(&record.details.title)
        .bind(&record.details.description)
        .bind(&record.details.image_ref)
        .bind(&record.details.category)
        .bind(price)
        .bind(i64::from(record.stock))
        .bind(record.visible)
        .bind(version)
        .bind(version_guard(expected)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_product", e))?;

        if result.rows_affected() == 0 {
            return Err(self.missed_update("products", *record.id.as_uuid()).await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(product_id = %id), err)]
    async fn delete(&self, id: ProductId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM products WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_product", e))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ProductStore for PostgresVaultStore {
    #[instrument(skip(self), err)]
    async fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            product_columns!(),
            " FROM products",
            " WHERE ($1::text IS NULL OR category = $1) AND (NOT $2 OR visible)",
            " ORDER BY title ASC, id ASC"
        ))
        .bind(filter.category.as_deref())
        .bind(filter.visible_only)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_products", e))?;

        rows.iter().map(decode_product).collect()
    }
}

#[async_trait]
impl AggregateStore<Order> for PostgresVaultStore {
    #[instrument(skip(self), fields(order_id = %id), err)]
    async fn load(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            order_columns!(),
            " FROM orders WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_order", e))?;

        row.map(|r| decode_order(&r)).transpose()
    }

    #[instrument(
        skip(self, order),
        fields(order_id = %order.id_typed(), version = order.version(), expected = ?expected),
        err
    )]
    async fn save(&self, order: &Order, expected: ExpectedVersion) -> Result<(), StoreError> {
        let record = order.to_record().map_err(|_| StoreError::NotFound)?;

        if expected == ExpectedVersion::NoRecord {
            return insert_order(&*self.pool, &record)
                .await
                .map_err(|e| map_insert_error("insert_order", "orders_pkey", e));
        }

        // Lines and totals never change after placement.
        let result = sqlx::query(
            r#"
            UPDATE orders SET
                status = $2,
                history = $3,
                version = $4
            WHERE id = $1 AND ($5::bigint IS NULL OR version = $5)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.status.as_str())
        .bind(Json(&record.history))
        .bind(to_i64(record.version, "version")?)
        .bind(version_guard(expected)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_order", e))?;

        if result.rows_affected() == 0 {
            return Err(self.missed_update("orders", *record.id.as_uuid()).await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(order_id = %id), err)]
    async fn delete(&self, id: OrderId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM orders WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_order", e))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl OrderStore for PostgresVaultStore {
    #[instrument(skip(self), fields(account_id = %account_id), err)]
    async fn list_for_account(&self, account_id: AccountId) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            order_columns!(),
            " FROM orders WHERE account_id = $1 ORDER BY created_at DESC, id DESC"
        ))
        .bind(account_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_orders_for_account", e))?;

        rows.iter().map(decode_order).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_orders(&self, filter: OrderFilter) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            order_columns!(),
            " FROM orders WHERE ($1::text IS NULL OR status = $1)",
            " ORDER BY created_at DESC, id DESC"
        ))
        .bind(filter.status.map(OrderStatus::as_str))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_orders", e))?;

        rows.iter().map(decode_order).collect()
    }
}

#[async_trait]
impl Ledger for PostgresVaultStore {
    #[instrument(
        skip(self, plan),
        fields(
            order_id = %plan.order_id,
            account_id = %plan.account_id,
            total = plan.total.amount(),
            lines = plan.stock.len()
        ),
        err
    )]
    async fn commit_redemption(
        &self,
        plan: &RedemptionPlan,
    ) -> Result<CommittedRedemption, RedemptionError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        match redeem_in_tx(&mut tx, plan).await {
            Ok(committed) => {
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("commit_transaction", e))?;
                Ok(committed)
            }
            Err(err) => {
                rollback(tx).await;
                Err(err)
            }
        }
    }

    #[instrument(
        skip(self, plan),
        fields(order_id = %plan.order_id, refund = plan.refund.amount()),
        err
    )]
    async fn commit_cancellation(
        &self,
        plan: &CancellationPlan,
    ) -> Result<CommittedCancellation, RedemptionError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        match cancel_in_tx(&mut tx, plan).await {
            Ok(committed) => {
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("commit_transaction", e))?;
                Ok(committed)
            }
            Err(err) => {
                rollback(tx).await;
                Err(err)
            }
        }
    }
}

async fn rollback(tx: Transaction<'_, Postgres>) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "rollback failed; the connection drop will abort the transaction");
    }
}

async fn redeem_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    plan: &RedemptionPlan,
) -> Result<CommittedRedemption, RedemptionError> {
    let mut stock: Vec<&PlannedStock> = plan.stock.iter().collect();
    stock.sort_by_key(|s| s.product_id);

    let mut products = Vec::with_capacity(stock.len());
    for line in stock {
        let row = sqlx::query(concat!(
            "UPDATE products SET stock = stock - $2, version = version + 1",
            " WHERE id = $1 AND visible AND stock >= $2 AND price = $3",
            " RETURNING ",
            product_columns!()
        ))
        .bind(line.product_id.as_uuid())
        .bind(i64::from(line.quantity))
        .bind(credits_to_i64(line.unit_price, "price")?)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("decrement_stock", e))?;

        match row {
            Some(row) => products.push(decode_product(&row)?),
            None => return Err(classify_stock_miss(tx, line).await),
        }
    }

    let total = credits_to_i64(plan.total, "total")?;
    let row = sqlx::query(concat!(
        "UPDATE accounts SET balance = balance - $2, version = version + 1",
        " WHERE id = $1 AND access_allowed AND balance >= $2",
        " RETURNING ",
        account_columns!()
    ))
    .bind(plan.account_id.as_uuid())
    .bind(total)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("debit_account", e))?;

    let account = match row {
        Some(row) => decode_account(&row)?,
        None => return Err(classify_debit_miss(tx, plan).await),
    };

    insert_order(&mut **tx, &plan.order).await.map_err(|e| {
        if is_unique_violation(&e) {
            RedemptionError::conflict(format!("order {} already exists", plan.order_id))
        } else {
            map_sqlx_error("insert_order", e).into()
        }
    })?;

    Ok(CommittedRedemption {
        order: Order::from_record(plan.order.clone()),
        account,
        products,
    })
}

async fn classify_stock_miss(
    tx: &mut Transaction<'_, Postgres>,
    line: &PlannedStock,
) -> RedemptionError {
    let row = sqlx::query("SELECT stock, visible, price FROM products WHERE id = $1")
        .bind(line.product_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await;

    let row = match row {
        Ok(Some(row)) => row,
        Ok(None) => return RedemptionError::NotFound(Entity::Product(line.product_id)),
        Err(e) => return map_sqlx_error("classify_stock", e).into(),
    };

    let (stock, visible, price) = match stock_state(&row) {
        Ok(values) => values,
        Err(e) => return StoreError::Corrupt(e.to_string()).into(),
    };

    if !visible {
        return RedemptionError::NotFound(Entity::Product(line.product_id));
    }
    if stock < i64::from(line.quantity) {
        return RedemptionError::OutOfStock {
            product_id: line.product_id,
            requested: line.quantity,
            available: u32::try_from(stock).unwrap_or(0),
        };
    }
    if Credits::try_from(price).ok() != Some(line.unit_price) {
        return RedemptionError::conflict(format!(
            "price of product {} changed",
            line.product_id
        ));
    }
    RedemptionError::conflict(format!(
        "product {} changed concurrently",
        line.product_id
    ))
}

fn stock_state(row: &PgRow) -> Result<(i64, bool, i64), sqlx::Error> {
    Ok((
        row.try_get("stock")?,
        row.try_get("visible")?,
        row.try_get("price")?,
    ))
}

fn balance_state(row: &PgRow) -> Result<(i64, bool), sqlx::Error> {
    Ok((row.try_get("balance")?, row.try_get("access_allowed")?))
}

async fn classify_debit_miss(
    tx: &mut Transaction<'_, Postgres>,
    plan: &RedemptionPlan,
) -> RedemptionError {
    let row = sqlx::query("SELECT balance, access_allowed FROM accounts WHERE id = $1")
        .bind(plan.account_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await;

    let row = match row {
        Ok(Some(row)) => row,
        Ok(None) => return RedemptionError::NotFound(Entity::Account),
        Err(e) => return map_sqlx_error("classify_debit", e).into(),
    };

    match balance_state(&row) {
        Ok((_, false)) => RedemptionError::Forbidden,
        Ok((balance, true)) => RedemptionError::InsufficientFunds {
            required: plan.total,
            available: Credits::try_from(balance).unwrap_or(Credits::ZERO),
        },
        Err(e) => StoreError::Corrupt(e.to_string()).into(),
    }
}

async fn cancel_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    plan: &CancellationPlan,
) -> Result<CommittedCancellation, RedemptionError> {
    let order = plan.order.to_record()?;
    let result = sqlx::query(
        r#"
        UPDATE orders SET status = $2, history = $3, version = $4
        WHERE id = $1 AND version = $5 AND status = 'pending'
        "#,
    )
    .bind(order.id.as_uuid())
    .bind(order.status.as_str())
    .bind(Json(&order.history))
    .bind(to_i64(order.version, "version")?)
    .bind(to_i64(plan.expected_order_version, "version")?)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("cancel_order", e))?;

    if result.rows_affected() == 0 {
        let exists = sqlx::query("SELECT 1 FROM orders WHERE id = $1")
            .bind(order.id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("check_order", e))?;
        return Err(match exists {
            Some(_) => RedemptionError::conflict("order changed concurrently"),
            None => RedemptionError::NotFound(Entity::Order(plan.order_id)),
        });
    }

    let mut restock = plan.restock.clone();
    restock.sort_by_key(|(product_id, _)| *product_id);

    let mut products = Vec::with_capacity(restock.len());
    for (product_id, quantity) in restock {
        let row = sqlx::query(concat!(
            "UPDATE products SET stock = LEAST(stock + $2, 4294967295), version = version + 1",
            " WHERE id = $1 RETURNING ",
            product_columns!()
        ))
        .bind(product_id.as_uuid())
        .bind(i64::from(quantity))
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("restock_product", e))?;

        // Deleted products have nothing to restock.
        if let Some(row) = row {
            products.push(decode_product(&row)?);
        }
    }

    let row = sqlx::query(concat!(
        "UPDATE accounts SET balance = balance + $2, version = version + 1",
        " WHERE id = $1 RETURNING ",
        account_columns!()
    ))
    .bind(plan.account_id.as_uuid())
    .bind(credits_to_i64(plan.refund, "refund")?)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("refund_account", e))?;

    let account = match row {
        Some(row) => decode_account(&row)?,
        None => return Err(RedemptionError::NotFound(Entity::Account)),
    };

    Ok(CommittedCancellation {
        order: plan.order.clone(),
        account,
        products,
    })
}

async fn insert_order<'e, E>(executor: E, record: &OrderRecord) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let total = i64::try_from(record.total.amount())
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    let version =
        i64::try_from(record.version).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query(
        r#"
        INSERT INTO orders (id, account_id, lines, total, status, history, created_at, version)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(record.id.as_uuid())
    .bind(record.account_id.as_uuid())
    .bind(Json(&record.lines))
    .bind(total)
    .bind(record.status.as_str())
    .bind(Json(&record.history))
    .bind(record.created_at)
    .bind(version)
    .execute(executor)
    .await?;
    Ok(())
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Duplicate(msg),
                Some("23503") | Some("23514") => StoreError::Integrity(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Backend(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(format!("decode error in {}: {}", operation, err))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// A primary key collision means the aggregate already exists; any other unique
/// violation is a duplicate business key.
fn map_insert_error(operation: &str, pkey: &str, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") && db_err.constraint() == Some(pkey) {
            return StoreError::Conflict(format!("{operation}: record already exists"));
        }
    }
    map_sqlx_error(operation, err)
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct AccountRow {
    id: Uuid,
    email: String,
    display_name: String,
    credential: Option<String>,
    balance: i64,
    is_admin: bool,
    access_allowed: bool,
    cart: Json<Vec<CartLine>>,
    wishlist: Json<Vec<ProductId>>,
    created_at: DateTime<Utc>,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for AccountRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AccountRow {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            display_name: row.try_get("display_name")?,
            credential: row.try_get("credential")?,
            balance: row.try_get("balance")?,
            is_admin: row.try_get("is_admin")?,
            access_allowed: row.try_get("access_allowed")?,
            cart: row.try_get("cart")?,
            wishlist: row.try_get("wishlist")?,
            created_at: row.try_get("created_at")?,
            version: row.try_get("version")?,
        })
    }
}

impl TryFrom<AccountRow> for AccountRecord {
    type Error = StoreError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(AccountRecord {
            id: AccountId::from_uuid(row.id),
            email: row.email,
            display_name: row.display_name,
            credential: row
                .credential
                .map(Credential::new)
                .transpose()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            balance: Credits::try_from(row.balance)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            is_admin: row.is_admin,
            access_allowed: row.access_allowed,
            cart: row.cart.0,
            wishlist: row.wishlist.0,
            created_at: row.created_at,
            version: decode_version(row.version)?,
        })
    }
}

#[derive(Debug)]
struct ProductRow {
    id: Uuid,
    title: String,
    description: String,
    image_ref: Option<String>,
    category: String,
    price: i64,
    stock: i64,
    visible: bool,
    created_at: DateTime<Utc>,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for ProductRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ProductRow {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            image_ref: row.try_get("image_ref")?,
            category: row.try_get("category")?,
            price: row.try_get("price")?,
            stock: row.try_get("stock")?,
            visible: row.try_get("visible")?,
            created_at: row.try_get("created_at")?,
            version: row.try_get("version")?,
        })
    }
}

impl TryFrom<ProductRow> for ProductRecord {
    type Error = StoreError;

    fn try_from(row: ProductRow) -> Result<Self, Self::Error> {
        Ok(ProductRecord {
            id: ProductId::from_uuid(row.id),
            details: ProductDetails {
                title: row.title,
                description: row.description,
                image_ref: row.image_ref,
                category: row.category,
            },
            price: Credits::try_from(row.price).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            stock: u32::try_from(row.stock)
                .map_err(|_| StoreError::Corrupt(format!("stock out of range: {}", row.stock)))?,
            visible: row.visible,
            created_at: row.created_at,
            version: decode_version(row.version)?,
        })
    }
}

#[derive(Debug)]
struct OrderRow {
    id: Uuid,
    account_id: Uuid,
    lines: Json<Vec<OrderLine>>,
    total: i64,
    status: String,
    history: Json<Vec<StatusChange>>,
    created_at: DateTime<Utc>,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for OrderRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OrderRow {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            lines: row.try_get("lines")?,
            total: row.try_get("total")?,
            status: row.try_get("status")?,
            history: row.try_get("history")?,
            created_at: row.try_get("created_at")?,
            version: row.try_get("version")?,
        })
    }
}

impl TryFrom<OrderRow> for OrderRecord {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(OrderRecord {
            id: OrderId::from_uuid(row.id),
            account_id: AccountId::from_uuid(row.account_id),
            lines: row.lines.0,
            total: Credits::try_from(row.total).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            status: OrderStatus::from_str(&row.status)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            history: row.history.0,
            created_at: row.created_at,
            version: decode_version(row.version)?,
        })
    }
}

fn decode_version(version: i64) -> Result<u64, StoreError> {
    u64::try_from(version).map_err(|_| StoreError::Corrupt(format!("negative version {version}")))
}

fn decode_account(row: &PgRow) -> Result<Account, StoreError> {
    let row = AccountRow::from_row(row)
        .map_err(|e| StoreError::Corrupt(format!("failed to decode account row: {e}")))?;
    Ok(Account::from_record(AccountRecord::try_from(row)?))
}

fn decode_product(row: &PgRow) -> Result<Product, StoreError> {
    let row = ProductRow::from_row(row)
        .map_err(|e| StoreError::Corrupt(format!("failed to decode product row: {e}")))?;
    Ok(Product::from_record(ProductRecord::try_from(row)?))
}

fn decode_order(row: &PgRow) -> Result<Order, StoreError> {
    let row = OrderRow::from_row(row)
        .map_err(|e| StoreError::Corrupt(format!("failed to decode order row: {e}")))?;
    Ok(Order::from_record(OrderRecord::try_from(row)?))
}
