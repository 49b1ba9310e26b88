use serde::{Deserialize, Serialize};

use vault_core::{DomainError, DomainResult, MAX_LINE_QUANTITY, ProductId, ValueObject};

/// A saved cart line. At most one line per product.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: ProductId,
    pub quantity: u32,
}

impl ValueObject for CartLine {}

pub(crate) fn find(lines: &[CartLine], product_id: ProductId) -> Option<&CartLine> {
    lines.iter().find(|l| l.product_id == product_id)
}

/// Quantity the line would hold after adding `quantity` more units.
pub(crate) fn merged_quantity(
    lines: &[CartLine],
    product_id: ProductId,
    quantity: u32,
) -> DomainResult<u32> {
    ensure_quantity(quantity)?;
    let current = find(lines, product_id).map(|l| l.quantity).unwrap_or(0);
    let merged = current.saturating_add(quantity);
    if merged > MAX_LINE_QUANTITY {
        return Err(DomainError::validation(format!(
            "cart line cannot exceed {MAX_LINE_QUANTITY} units"
        )));
    }
    Ok(merged)
}

pub(crate) fn ensure_quantity(quantity: u32) -> DomainResult<()> {
    if quantity == 0 {
        return Err(DomainError::validation("quantity must be positive"));
    }
    if quantity > MAX_LINE_QUANTITY {
        return Err(DomainError::validation(format!(
            "quantity cannot exceed {MAX_LINE_QUANTITY}"
        )));
    }
    Ok(())
}

pub(crate) fn set(lines: &mut Vec<CartLine>, product_id: ProductId, quantity: u32) {
    match lines.iter_mut().find(|l| l.product_id == product_id) {
        Some(line) => line.quantity = quantity,
        None => lines.push(CartLine {
            product_id,
            quantity,
        }),
    }
}

pub(crate) fn remove(lines: &mut Vec<CartLine>, product_id: ProductId) {
    lines.retain(|l| l.product_id != product_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merging_adds_to_existing_line() {
        let product_id = ProductId::new();
        let lines = vec![CartLine {
            product_id,
            quantity: 2,
        }];
        assert_eq!(merged_quantity(&lines, product_id, 3).unwrap(), 5);
        assert_eq!(merged_quantity(&lines, ProductId::new(), 3).unwrap(), 3);
    }

    #[test]
    fn merging_past_the_line_cap_is_rejected() {
        let product_id = ProductId::new();
        let lines = vec![CartLine {
            product_id,
            quantity: MAX_LINE_QUANTITY,
        }];
        let err = merged_quantity(&lines, product_id, 1).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn set_replaces_or_appends() {
        let a = ProductId::new();
        let b = ProductId::new();
        let mut lines = Vec::new();
        set(&mut lines, a, 1);
        set(&mut lines, b, 4);
        set(&mut lines, a, 7);
        assert_eq!(lines.len(), 2);
        assert_eq!(find(&lines, a).map(|l| l.quantity), Some(7));

        remove(&mut lines, a);
        assert!(find(&lines, a).is_none());
    }
}
