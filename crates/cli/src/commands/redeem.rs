//! Redemption and cart checkout.

use chrono::Utc;

use vault_core::{AccountId, ProductId};
use vault_infra::CartCheckout;
use vault_redemption::{CheckoutMode, RedeemLine, RedeemRequest};

use super::{Context, print_order, redemption_failed};

/// Parse `<product-id>:<quantity>`.
pub fn parse_item(raw: &str) -> Result<RedeemLine, String> {
    let (product, quantity) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected <product-id>:<quantity>, got {raw:?}"))?;
    let product_id: ProductId = product
        .trim()
        .parse()
        .map_err(|e| format!("invalid product id {product:?}: {e}"))?;
    let quantity: u32 = quantity
        .trim()
        .parse()
        .map_err(|e| format!("invalid quantity {quantity:?}: {e}"))?;
    Ok(RedeemLine::new(product_id, quantity))
}

pub async fn redeem(
    ctx: &Context,
    account_id: AccountId,
    items: Vec<RedeemLine>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let request = RedeemRequest::new(account_id, items, Utc::now()).map_err(redemption_failed)?;
    let engine = &ctx.services.redemption;

    if dry_run {
        let quote = engine.quote(&request).await.map_err(redemption_failed)?;
        for line in &quote.lines {
            println!(
                "  {} x{} @ {} = {} (stock {})",
                line.title, line.quantity, line.unit_price, line.line_total, line.available_stock
            );
        }
        println!(
            "total={} balance={} balance_after={}",
            quote.total, quote.balance, quote.balance_after
        );
        return Ok(());
    }

    let receipt = engine.redeem(&request).await.map_err(redemption_failed)?;
    print_order(&receipt.order);
    println!("new balance: {}", receipt.new_balance);
    Ok(())
}

pub async fn checkout(ctx: &Context, account_id: AccountId, mode: CheckoutMode) -> anyhow::Result<()> {
    let checkout = ctx
        .services
        .redemption
        .checkout_cart(account_id, mode)
        .await
        .map_err(redemption_failed)?;

    match checkout {
        CartCheckout::AllOrNothing(receipt) => {
            print_order(&receipt.order);
            println!("new balance: {}", receipt.new_balance);
        }
        CartCheckout::PerLine(outcomes) => {
            for outcome in outcomes {
                match outcome.result {
                    Ok(receipt) => print_order(&receipt.order),
                    Err(e) => println!(
                        "  {} x{} failed: {}",
                        outcome.product_id,
                        outcome.quantity,
                        e.user_message()
                    ),
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_product_and_quantity() {
        let id = ProductId::new();
        let line = parse_item(&format!("{id}:3")).unwrap();
        assert_eq!(line, RedeemLine::new(id, 3));
    }

    #[test]
    fn rejects_malformed_items() {
        assert!(parse_item("no-colon").is_err());
        assert!(parse_item("not-a-uuid:1").is_err());
        assert!(parse_item(&format!("{}:-1", ProductId::new())).is_err());
    }
}
