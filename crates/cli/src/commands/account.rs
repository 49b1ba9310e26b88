use vault_core::AccountId;

use super::{Context, print_order, redemption_failed};

pub async fn show(ctx: &Context, account_id: AccountId) -> anyhow::Result<()> {
    let account = ctx.services.accounts.get(account_id).await?;
    println!(
        "{} <{}> balance={} admin={} access={}",
        account.display_name(),
        account.email(),
        account.balance(),
        account.is_admin(),
        account.access_allowed()
    );
    for line in account.cart() {
        println!("  cart: {} x{}", line.product_id, line.quantity);
    }

    let orders = ctx
        .services
        .redemption
        .orders_for_account(account_id)
        .await
        .map_err(redemption_failed)?;
    for order in &orders {
        print_order(order);
    }
    Ok(())
}
