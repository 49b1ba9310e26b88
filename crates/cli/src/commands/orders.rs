//! Order administration.

use vault_core::{AccountId, OrderId};
use vault_redemption::OrderStatus;

use super::{Context, print_order, redemption_failed};

pub async fn set_status(
    ctx: &Context,
    admin_id: AccountId,
    order_id: OrderId,
    status: OrderStatus,
) -> anyhow::Result<()> {
    let order = ctx
        .services
        .redemption
        .transition_status(admin_id, order_id, status)
        .await
        .map_err(redemption_failed)?;
    print_order(&order);
    Ok(())
}

pub async fn cancel(ctx: &Context, admin_id: AccountId, order_id: OrderId) -> anyhow::Result<()> {
    let cancellation = ctx
        .services
        .redemption
        .cancel(admin_id, order_id)
        .await
        .map_err(redemption_failed)?;
    print_order(&cancellation.order);
    println!(
        "refunded {}; account balance now {}",
        cancellation.refunded, cancellation.new_balance
    );
    Ok(())
}
