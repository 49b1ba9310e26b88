//! Pure redemption quoting.
//!
//! `Quote::build` runs every precondition against a snapshot of account and
//! product state without touching storage. The ledger re-checks the same
//! conditions atomically when it commits the resulting plan.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use vault_accounts::{Account, AccountEvent, CreditsDebited};
use vault_catalog::{Product, ProductEvent, StockDecremented};
use vault_core::{AccountId, Aggregate, Credits, OrderId, ProductId};

use crate::error::{Entity, RedemptionError, RedemptionResult};
use crate::order::{Order, OrderCommand, OrderEvent, OrderLine, OrderRecord, PlaceOrder};
use crate::request::RedeemRequest;

/// A priced line of a quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotedLine {
    pub product_id: ProductId,
    pub title: String,
    pub quantity: u32,
    pub unit_price: Credits,
    pub line_total: Credits,
    pub available_stock: u32,
}

/// Result of a successful dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub account_id: AccountId,
    pub lines: Vec<QuotedLine>,
    pub total: Credits,
    pub balance: Credits,
    pub balance_after: Credits,
    pub occurred_at: DateTime<Utc>,
}

/// Stock decrement the ledger must apply, guarded by the captured price.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PlannedStock {
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price: Credits,
}

/// Everything the ledger needs to commit one redemption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionPlan {
    pub order_id: OrderId,
    pub account_id: AccountId,
    pub total: Credits,
    pub stock: Vec<PlannedStock>,
    /// The order as it will be stored (status `Pending`, version 1).
    pub order: OrderRecord,
    pub account_event: AccountEvent,
    pub product_events: Vec<ProductEvent>,
    pub order_event: OrderEvent,
    pub occurred_at: DateTime<Utc>,
}

impl Quote {
    /// Check preconditions in order: account exists, access allowed, each
    /// product exists and is visible, stock covers each line, balance covers
    /// the total.
    pub fn build(
        request: &RedeemRequest,
        account: Option<&Account>,
        products: &HashMap<ProductId, Product>,
    ) -> RedemptionResult<Quote> {
        let account = account
            .filter(|a| a.is_created() && a.id_typed() == request.account_id())
            .ok_or(RedemptionError::NotFound(Entity::Account))?;

        if !account.can_redeem() {
            return Err(RedemptionError::Forbidden);
        }

        let mut lines = Vec::with_capacity(request.lines().len());
        let mut total = Credits::ZERO;

        for line in request.lines() {
            let product = products
                .get(&line.product_id)
                .filter(|p| p.is_redeemable())
                .ok_or(RedemptionError::NotFound(Entity::Product(line.product_id)))?;

            if product.stock() < line.quantity {
                return Err(RedemptionError::OutOfStock {
                    product_id: line.product_id,
                    requested: line.quantity,
                    available: product.stock(),
                });
            }

            let line_total = product
                .price()
                .checked_mul(line.quantity)
                .ok_or_else(|| RedemptionError::validation("line total overflows"))?;
            total = total
                .checked_add(line_total)
                .ok_or_else(|| RedemptionError::validation("order total overflows"))?;

            lines.push(QuotedLine {
                product_id: line.product_id,
                title: product.title().to_string(),
                quantity: line.quantity,
                unit_price: product.price(),
                line_total,
                available_stock: product.stock(),
            });
        }

        let balance = account.balance();
        let balance_after =
            balance
                .checked_sub(total)
                .ok_or(RedemptionError::InsufficientFunds {
                    required: total,
                    available: balance,
                })?;

        Ok(Quote {
            account_id: account.id_typed(),
            lines,
            total,
            balance,
            balance_after,
            occurred_at: request.occurred_at(),
        })
    }

    /// Turn the quote into a commit plan for a new order.
    pub fn into_plan(self, order_id: OrderId) -> RedemptionResult<RedemptionPlan> {
        let order_lines: Vec<OrderLine> = self
            .lines
            .iter()
            .map(|l| OrderLine {
                product_id: l.product_id,
                title: l.title.clone(),
                quantity: l.quantity,
                unit_price: l.unit_price,
            })
            .collect();

        let mut order = Order::empty(order_id);
        let events = order.handle(&OrderCommand::PlaceOrder(PlaceOrder {
            order_id,
            account_id: self.account_id,
            lines: order_lines,
            occurred_at: self.occurred_at,
        }))?;
        for e in &events {
            order.apply(e);
        }
        let order_event = events
            .into_iter()
            .next()
            .ok_or_else(|| RedemptionError::conflict("order placement produced no event"))?;
        let order = order.to_record()?;

        let stock: Vec<PlannedStock> = self
            .lines
            .iter()
            .map(|l| PlannedStock {
                product_id: l.product_id,
                quantity: l.quantity,
                unit_price: l.unit_price,
            })
            .collect();

        let product_events = stock
            .iter()
            .map(|s| {
                ProductEvent::StockDecremented(StockDecremented {
                    product_id: s.product_id,
                    order_id,
                    quantity: s.quantity,
                    occurred_at: self.occurred_at,
                })
            })
            .collect();

        Ok(RedemptionPlan {
            order_id,
            account_id: self.account_id,
            total: self.total,
            stock,
            order,
            account_event: AccountEvent::CreditsDebited(CreditsDebited {
                account_id: self.account_id,
                order_id,
                amount: self.total,
                occurred_at: self.occurred_at,
            }),
            product_events,
            order_event,
            occurred_at: self.occurred_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RedeemLine;
    use proptest::prelude::*;
    use vault_accounts::{AccountCommand, EnrollAccount, SetAccess};
    use vault_catalog::{CreateProduct, ProductCommand, ProductDetails};

    fn account_with(balance: u64) -> Account {
        let id = AccountId::new();
        let mut account = Account::empty(id);
        let events = account
            .handle(&AccountCommand::EnrollAccount(EnrollAccount {
                account_id: id,
                email: "student@example.edu".to_string(),
                display_name: "Student".to_string(),
                initial_balance: Credits::new(balance),
                is_admin: false,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        for e in &events {
            account.apply(e);
        }
        account
    }

    fn product_with(price: u64, stock: u32, visible: bool) -> Product {
        let id = ProductId::new();
        let mut product = Product::empty(id);
        let events = product
            .handle(&ProductCommand::CreateProduct(CreateProduct {
                product_id: id,
                details: ProductDetails {
                    title: "Water bottle".to_string(),
                    description: String::new(),
                    image_ref: None,
                    category: "gear".to_string(),
                },
                price: Credits::new(price),
                initial_stock: stock,
                visible,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        for e in &events {
            product.apply(e);
        }
        product
    }

    fn catalog(products: &[&Product]) -> HashMap<ProductId, Product> {
        products
            .iter()
            .map(|p| (p.id_typed(), (*p).clone()))
            .collect()
    }

    fn request(account: &Account, lines: &[(ProductId, u32)]) -> RedeemRequest {
        RedeemRequest::new(
            account.id_typed(),
            lines.iter().map(|(p, q)| RedeemLine::new(*p, *q)),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn successful_quote_computes_totals() {
        let account = account_with(1000);
        let product = product_with(500, 10, true);
        let quote = Quote::build(
            &request(&account, &[(product.id_typed(), 1)]),
            Some(&account),
            &catalog(&[&product]),
        )
        .unwrap();

        assert_eq!(quote.total, Credits::new(500));
        assert_eq!(quote.balance_after, Credits::new(500));
        assert_eq!(quote.lines[0].unit_price, Credits::new(500));
    }

    #[test]
    fn insufficient_funds_reports_required_and_available() {
        let account = account_with(100);
        let product = product_with(500, 10, true);
        let err = Quote::build(
            &request(&account, &[(product.id_typed(), 1)]),
            Some(&account),
            &catalog(&[&product]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            RedemptionError::InsufficientFunds {
                required: Credits::new(500),
                available: Credits::new(100),
            }
        );
    }

    #[test]
    fn out_of_stock_is_checked_before_funds() {
        let account = account_with(0);
        let product = product_with(50, 2, true);
        let err = Quote::build(
            &request(&account, &[(product.id_typed(), 3)]),
            Some(&account),
            &catalog(&[&product]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            RedemptionError::OutOfStock {
                product_id: product.id_typed(),
                requested: 3,
                available: 2,
            }
        );
    }

    #[test]
    fn hidden_or_missing_products_are_not_found() {
        let account = account_with(1000);
        let hidden = product_with(1, 1, false);
        let err = Quote::build(
            &request(&account, &[(hidden.id_typed(), 1)]),
            Some(&account),
            &catalog(&[&hidden]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            RedemptionError::NotFound(Entity::Product(hidden.id_typed()))
        );

        let missing = ProductId::new();
        let err = Quote::build(
            &request(&account, &[(missing, 1)]),
            Some(&account),
            &HashMap::new(),
        )
        .unwrap_err();
        assert_eq!(err, RedemptionError::NotFound(Entity::Product(missing)));
    }

    #[test]
    fn missing_or_blocked_account_is_rejected() {
        let account = account_with(1000);
        let product = product_with(1, 1, true);
        let req = request(&account, &[(product.id_typed(), 1)]);

        let err = Quote::build(&req, None, &catalog(&[&product])).unwrap_err();
        assert_eq!(err, RedemptionError::NotFound(Entity::Account));

        let mut blocked = account.clone();
        let events = blocked
            .handle(&AccountCommand::SetAccess(SetAccess {
                account_id: blocked.id_typed(),
                allowed: false,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        for e in &events {
            blocked.apply(e);
        }
        let err = Quote::build(&req, Some(&blocked), &catalog(&[&product])).unwrap_err();
        assert_eq!(err, RedemptionError::Forbidden);
    }

    #[test]
    fn plan_captures_prices_and_emits_one_event_per_product() {
        let account = account_with(1000);
        let a = product_with(50, 10, true);
        let b = product_with(200, 10, true);
        let quote = Quote::build(
            &request(&account, &[(a.id_typed(), 3), (b.id_typed(), 1)]),
            Some(&account),
            &catalog(&[&a, &b]),
        )
        .unwrap();

        let order_id = OrderId::new();
        let plan = quote.into_plan(order_id).unwrap();
        assert_eq!(plan.total, Credits::new(350));
        assert_eq!(plan.order.total, Credits::new(350));
        assert_eq!(plan.order.version, 1);
        assert_eq!(plan.product_events.len(), 2);
        assert_eq!(plan.order.lines[0].unit_price, Credits::new(50));
        match &plan.account_event {
            AccountEvent::CreditsDebited(e) => {
                assert_eq!(e.amount, Credits::new(350));
                assert_eq!(e.order_id, order_id);
            }
            _ => panic!("Expected CreditsDebited event"),
        }
    }

    proptest! {
        #[test]
        fn quote_succeeds_iff_balance_covers_total(
            balance in 0u64..100_000,
            price in 0u64..10_000,
            quantity in 1u32..=99,
        ) {
            let account = account_with(balance);
            let product = product_with(price, 99, true);
            let result = Quote::build(
                &request(&account, &[(product.id_typed(), quantity)]),
                Some(&account),
                &catalog(&[&product]),
            );

            let total = price * u64::from(quantity);
            if total <= balance {
                let quote = result.unwrap();
                prop_assert_eq!(quote.total, Credits::new(total));
                prop_assert_eq!(quote.balance_after, Credits::new(balance - total));
            } else {
                let is_insufficient =
                    matches!(result, Err(RedemptionError::InsufficientFunds { .. }));
                prop_assert!(is_insufficient);
            }
        }

        #[test]
        fn quote_succeeds_iff_stock_covers_quantity(stock in 0u32..50, quantity in 1u32..=99) {
            let account = account_with(u64::MAX / 2);
            let product = product_with(1, stock, true);
            let result = Quote::build(
                &request(&account, &[(product.id_typed(), quantity)]),
                Some(&account),
                &catalog(&[&product]),
            );
            prop_assert_eq!(result.is_ok(), quantity <= stock);
        }
    }
}
