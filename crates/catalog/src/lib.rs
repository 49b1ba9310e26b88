//! Catalog domain module.
//!
//! Redeemable products: details, credit price, stock and visibility. Stock is
//! changed by admins through `Restock` and by the redemption ledger through
//! `StockDecremented`/`StockRestored`.

pub mod product;

pub use product::{
    ChangePrice, CreateProduct, DetailsUpdated, PriceChanged, Product, ProductCommand,
    ProductCreated, ProductDetails, ProductEvent, ProductRecord, Restock, Restocked,
    SetVisibility, StockDecremented, StockRestored, UpdateDetails, VisibilityChanged,
};
