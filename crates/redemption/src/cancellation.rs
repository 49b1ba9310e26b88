use chrono::{DateTime, Utc};

use vault_accounts::{AccountEvent, CreditsRefunded};
use vault_catalog::{ProductEvent, StockRestored};
use vault_core::{AccountId, Aggregate, AggregateRoot, Credits, OrderId, ProductId};

use crate::error::{Entity, RedemptionError, RedemptionResult};
use crate::order::{ChangeStatus, Order, OrderCommand, OrderEvent, OrderStatus};

/// Everything the ledger needs to cancel a pending order in one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationPlan {
    pub order_id: OrderId,
    pub account_id: AccountId,
    pub refund: Credits,
    /// Per-product quantities to put back, one entry per product.
    pub restock: Vec<(ProductId, u32)>,
    /// Order version the plan was built from.
    pub expected_order_version: u64,
    /// The order after the status change has been applied.
    pub order: Order,
    pub order_event: OrderEvent,
    pub account_event: AccountEvent,
    pub product_events: Vec<ProductEvent>,
    pub occurred_at: DateTime<Utc>,
}

impl CancellationPlan {
    pub fn build(
        order: &Order,
        admin_id: AccountId,
        occurred_at: DateTime<Utc>,
    ) -> RedemptionResult<CancellationPlan> {
        let order_id = order.id_typed();
        let account_id = order
            .account_id()
            .filter(|_| order.is_created())
            .ok_or(RedemptionError::NotFound(Entity::Order(order_id)))?;

        let events = order.handle(&OrderCommand::ChangeStatus(ChangeStatus {
            order_id,
            status: OrderStatus::Cancelled,
            changed_by: admin_id,
            occurred_at,
        }))?;

        let mut cancelled = order.clone();
        for e in &events {
            cancelled.apply(e);
        }
        let order_event = events
            .into_iter()
            .next()
            .ok_or_else(|| RedemptionError::conflict("cancellation produced no event"))?;

        let restock = order.lines().iter().fold(
            Vec::<(ProductId, u32)>::new(),
            |mut acc, line| {
                match acc.iter_mut().find(|(p, _)| *p == line.product_id) {
                    Some((_, qty)) => *qty = qty.saturating_add(line.quantity),
                    None => acc.push((line.product_id, line.quantity)),
                }
                acc
            },
        );

        let product_events = restock
            .iter()
            .map(|(product_id, quantity)| {
                ProductEvent::StockRestored(StockRestored {
                    product_id: *product_id,
                    order_id,
                    quantity: *quantity,
                    occurred_at,
                })
            })
            .collect();

        Ok(CancellationPlan {
            order_id,
            account_id,
            refund: order.total(),
            restock,
            expected_order_version: order.version(),
            order: cancelled,
            order_event,
            account_event: AccountEvent::CreditsRefunded(CreditsRefunded {
                account_id,
                order_id,
                amount: order.total(),
                occurred_at,
            }),
            product_events,
            occurred_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{OrderLine, PlaceOrder};

    fn pending_order(lines: Vec<OrderLine>) -> Order {
        let id = OrderId::new();
        let mut order = Order::empty(id);
        let events = order
            .handle(&OrderCommand::PlaceOrder(PlaceOrder {
                order_id: id,
                account_id: AccountId::new(),
                lines,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        for e in &events {
            order.apply(e);
        }
        order
    }

    #[test]
    fn plan_refunds_total_and_restocks_every_line() {
        let product_id = ProductId::new();
        let order = pending_order(vec![OrderLine {
            product_id,
            title: "Mug".to_string(),
            quantity: 2,
            unit_price: Credits::new(150),
        }]);

        let plan = CancellationPlan::build(&order, AccountId::new(), Utc::now()).unwrap();
        assert_eq!(plan.refund, Credits::new(300));
        assert_eq!(plan.restock, vec![(product_id, 2)]);
        assert_eq!(plan.expected_order_version, 1);
        assert_eq!(plan.order.status(), OrderStatus::Cancelled);
        assert_eq!(plan.order.version(), 2);
    }

    #[test]
    fn terminal_order_cannot_be_cancelled() {
        let order = pending_order(vec![OrderLine {
            product_id: ProductId::new(),
            title: "Mug".to_string(),
            quantity: 1,
            unit_price: Credits::new(1),
        }]);
        let mut delivered = order.clone();
        let events = delivered
            .handle(&OrderCommand::ChangeStatus(ChangeStatus {
                order_id: order.id_typed(),
                status: OrderStatus::Delivered,
                changed_by: AccountId::new(),
                occurred_at: Utc::now(),
            }))
            .unwrap();
        for e in &events {
            delivered.apply(e);
        }

        let err = CancellationPlan::build(&delivered, AccountId::new(), Utc::now()).unwrap_err();
        assert!(matches!(err, RedemptionError::Conflict(_)));
    }

    #[test]
    fn missing_order_is_not_found() {
        let order = Order::empty(OrderId::new());
        let err = CancellationPlan::build(&order, AccountId::new(), Utc::now()).unwrap_err();
        assert_eq!(err, RedemptionError::NotFound(Entity::Order(order.id_typed())));
    }
}
