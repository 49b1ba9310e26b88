//! Redemption engine: quote, commit through the ledger, publish.
//!
//! ```text
//! RedeemRequest
//!   ↓
//! 1. Load account + requested products
//!   ↓
//! 2. Quote::build (pure precondition checks, price snapshot)
//!   ↓
//! 3. Ledger::commit_redemption (one transaction, conditional updates)
//!   ↓
//! 4. Publish account, product and order events
//! ```

use std::collections::HashMap;
use std::slice;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{info, instrument, warn};

use vault_accounts::{Account, AccountCommand, RemoveFromCart};
use vault_catalog::Product;
use vault_core::{AccountId, AggregateRoot, Credits, OrderId, ProductId};
use vault_events::{EventBus, EventEnvelope};
use vault_redemption::{
    CancellationPlan, ChangeStatus, CheckoutMode, Entity, Order, OrderCommand, OrderStatus, Quote,
    RedeemLine, RedeemRequest, RedemptionError, RedemptionPlan, RedemptionResult,
};

use super::{ACCOUNT, ORDER, PRODUCT, load_admin};
use crate::command_dispatcher::{CommandDispatcher, ServiceError};
use crate::store::{AggregateStore, CommittedRedemption, OrderFilter, VaultStore};

/// Result of a committed redemption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionReceipt {
    pub order: Order,
    pub new_balance: Credits,
}

/// Outcome of one cart line in [`CheckoutMode::PerLine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartLineOutcome {
    pub product_id: ProductId,
    pub quantity: u32,
    pub result: Result<RedemptionReceipt, RedemptionError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CartCheckout {
    /// The whole cart became one order.
    AllOrNothing(RedemptionReceipt),
    /// One independent redemption per cart line, in cart order.
    PerLine(Vec<CartLineOutcome>),
}

impl CartCheckout {
    pub fn receipts(&self) -> Vec<&RedemptionReceipt> {
        match self {
            CartCheckout::AllOrNothing(receipt) => vec![receipt],
            CartCheckout::PerLine(outcomes) => {
                outcomes.iter().filter_map(|o| o.result.as_ref().ok()).collect()
            }
        }
    }
}

/// Result of a committed cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    pub order: Order,
    pub refunded: Credits,
    pub new_balance: Credits,
}

/// Exchanges credits for products and drives the order lifecycle.
///
/// The acting identity is passed into every call; nothing is read from
/// ambient session state.
#[derive(Debug)]
pub struct RedemptionEngine<S: ?Sized, B> {
    dispatcher: CommandDispatcher<S, B>,
}

impl<S: ?Sized, B: Clone> Clone for RedemptionEngine<S, B> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
        }
    }
}

fn order_error(err: ServiceError, order_id: OrderId) -> RedemptionError {
    match err {
        ServiceError::NotFound => RedemptionError::NotFound(Entity::Order(order_id)),
        ServiceError::Forbidden => RedemptionError::Forbidden,
        ServiceError::Validation(msg) => RedemptionError::Validation(msg),
        ServiceError::InvariantViolation(msg)
        | ServiceError::Conflict(msg)
        | ServiceError::Duplicate(msg) => RedemptionError::Conflict(msg),
        ServiceError::Store(e) => e.into(),
    }
}

impl<S, B> RedemptionEngine<S, B>
where
    S: VaultStore + ?Sized,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(dispatcher: CommandDispatcher<S, B>) -> Self {
        Self { dispatcher }
    }

    async fn require_admin(&self, admin_id: AccountId) -> RedemptionResult<Account> {
        load_admin(&**self.dispatcher.store(), admin_id)
            .await?
            .ok_or(RedemptionError::Forbidden)
    }

    /// Dry run: every precondition is checked, nothing is written.
    pub async fn quote(&self, request: &RedeemRequest) -> RedemptionResult<Quote> {
        let store = self.dispatcher.store();
        let account = AggregateStore::<Account>::load(&**store, request.account_id()).await?;

        let mut products = HashMap::with_capacity(request.lines().len());
        for product_id in request.product_ids() {
            if let Some(product) = AggregateStore::<Product>::load(&**store, product_id).await? {
                products.insert(product_id, product);
            }
        }

        Quote::build(request, account.as_ref(), &products)
    }

    /// Redeem every line of `request` or none of them.
    #[instrument(
        skip(self, request),
        fields(account_id = %request.account_id(), lines = request.lines().len())
    )]
    pub async fn redeem(&self, request: &RedeemRequest) -> RedemptionResult<RedemptionReceipt> {
        let result = self.commit(request).await;
        match &result {
            Ok(receipt) => info!(
                order_id = %receipt.order.id_typed(),
                total = %receipt.order.total(),
                new_balance = %receipt.new_balance,
                "redemption committed"
            ),
            Err(e) => warn!(code = e.code(), error = %e, "redemption rejected"),
        }
        result
    }

    async fn commit(&self, request: &RedeemRequest) -> RedemptionResult<RedemptionReceipt> {
        let plan = self.quote(request).await?.into_plan(OrderId::new())?;
        let committed = self.dispatcher.store().commit_redemption(&plan).await?;
        self.publish_redemption(&plan, &committed);

        Ok(RedemptionReceipt {
            new_balance: committed.account.balance(),
            order: committed.order,
        })
    }

    fn publish_redemption(&self, plan: &RedemptionPlan, committed: &CommittedRedemption) {
        self.dispatcher.publish(
            plan.account_id.into(),
            ACCOUNT,
            committed.account.version(),
            slice::from_ref(&plan.account_event),
        );
        for product in &committed.products {
            let events: Vec<_> = plan
                .product_events
                .iter()
                .filter(|e| e.product_id() == product.id_typed())
                .cloned()
                .collect();
            self.dispatcher
                .publish(product.id_typed().into(), PRODUCT, product.version(), &events);
        }
        self.dispatcher.publish(
            plan.order_id.into(),
            ORDER,
            committed.order.version(),
            slice::from_ref(&plan.order_event),
        );
    }

    /// Redeem the account's saved cart.
    ///
    /// Redeemed lines are removed from the cart afterwards. That cleanup runs
    /// after the redemption committed, so a failure there is logged and does
    /// not fail the checkout.
    #[instrument(skip(self), fields(account_id = %account_id, mode = ?mode))]
    pub async fn checkout_cart(
        &self,
        account_id: AccountId,
        mode: CheckoutMode,
    ) -> RedemptionResult<CartCheckout> {
        let account = AggregateStore::<Account>::load(&**self.dispatcher.store(), account_id)
            .await?
            .ok_or(RedemptionError::NotFound(Entity::Account))?;
        let cart = account.cart().to_vec();
        if cart.is_empty() {
            return Err(RedemptionError::validation("cart is empty"));
        }
        let now = Utc::now();

        match mode {
            CheckoutMode::AllOrNothing => {
                let request = RedeemRequest::new(
                    account_id,
                    cart.iter()
                        .map(|line| RedeemLine::new(line.product_id, line.quantity)),
                    now,
                )?;
                let receipt = self.redeem(&request).await?;
                for line in &cart {
                    self.remove_cart_line(account_id, line.product_id, now).await;
                }
                Ok(CartCheckout::AllOrNothing(receipt))
            }
            CheckoutMode::PerLine => {
                let mut outcomes = Vec::with_capacity(cart.len());
                for line in cart {
                    let result = match RedeemRequest::single(
                        account_id,
                        line.product_id,
                        line.quantity,
                        now,
                    ) {
                        Ok(request) => self.redeem(&request).await,
                        Err(e) => Err(e),
                    };
                    if result.is_ok() {
                        self.remove_cart_line(account_id, line.product_id, now).await;
                    }
                    outcomes.push(CartLineOutcome {
                        product_id: line.product_id,
                        quantity: line.quantity,
                        result,
                    });
                }
                Ok(CartCheckout::PerLine(outcomes))
            }
        }
    }

    async fn remove_cart_line(
        &self,
        account_id: AccountId,
        product_id: ProductId,
        occurred_at: DateTime<Utc>,
    ) {
        let command = AccountCommand::RemoveFromCart(RemoveFromCart {
            account_id,
            product_id,
            occurred_at,
        });
        if let Err(e) = self
            .dispatcher
            .dispatch(account_id, ACCOUNT, command, Account::empty)
            .await
        {
            warn!(error = %e, %product_id, "failed to remove redeemed line from cart");
        }
    }

    /// Admin-only status change. `Cancelled` is routed to [`cancel`](Self::cancel)
    /// so the refund and restock happen with it.
    #[instrument(skip(self), fields(admin_id = %admin_id, order_id = %order_id, status = %status), err)]
    pub async fn transition_status(
        &self,
        admin_id: AccountId,
        order_id: OrderId,
        status: OrderStatus,
    ) -> RedemptionResult<Order> {
        if status == OrderStatus::Cancelled {
            return Ok(self.cancel(admin_id, order_id).await?.order);
        }
        self.require_admin(admin_id).await?;

        let command = OrderCommand::ChangeStatus(ChangeStatus {
            order_id,
            status,
            changed_by: admin_id,
            occurred_at: Utc::now(),
        });
        let dispatched = self
            .dispatcher
            .dispatch(order_id, ORDER, command, Order::empty)
            .await
            .map_err(|e| order_error(e, order_id))?;
        info!("order status changed");
        Ok(dispatched.aggregate)
    }

    /// Cancel a pending order, refunding its total and restocking its lines
    /// in the same transaction.
    #[instrument(skip(self), fields(admin_id = %admin_id, order_id = %order_id), err)]
    pub async fn cancel(
        &self,
        admin_id: AccountId,
        order_id: OrderId,
    ) -> RedemptionResult<Cancellation> {
        self.require_admin(admin_id).await?;
        let store = self.dispatcher.store();
        let order = AggregateStore::<Order>::load(&**store, order_id)
            .await?
            .ok_or(RedemptionError::NotFound(Entity::Order(order_id)))?;

        let plan = CancellationPlan::build(&order, admin_id, Utc::now())?;
        let committed = store.commit_cancellation(&plan).await?;

        self.dispatcher.publish(
            plan.order_id.into(),
            ORDER,
            committed.order.version(),
            slice::from_ref(&plan.order_event),
        );
        self.dispatcher.publish(
            plan.account_id.into(),
            ACCOUNT,
            committed.account.version(),
            slice::from_ref(&plan.account_event),
        );
        for product in &committed.products {
            let events: Vec<_> = plan
                .product_events
                .iter()
                .filter(|e| e.product_id() == product.id_typed())
                .cloned()
                .collect();
            self.dispatcher
                .publish(product.id_typed().into(), PRODUCT, product.version(), &events);
        }

        info!(refunded = %plan.refund, "order cancelled");
        Ok(Cancellation {
            order: committed.order,
            refunded: plan.refund,
            new_balance: committed.account.balance(),
        })
    }

    pub async fn order(&self, order_id: OrderId) -> RedemptionResult<Order> {
        AggregateStore::<Order>::load(&**self.dispatcher.store(), order_id)
            .await?
            .ok_or(RedemptionError::NotFound(Entity::Order(order_id)))
    }

    /// Orders placed by `account_id`, newest first.
    pub async fn orders_for_account(&self, account_id: AccountId) -> RedemptionResult<Vec<Order>> {
        Ok(self.dispatcher.store().list_for_account(account_id).await?)
    }

    /// Back-office listing, newest first.
    pub async fn orders(&self, filter: OrderFilter) -> RedemptionResult<Vec<Order>> {
        Ok(self.dispatcher.store().list_orders(filter).await?)
    }
}
