//! Accounts domain module.
//!
//! Student and admin accounts: enrollment and self-registration, credit balance,
//! access and admin flags, the saved cart and the wishlist. Pure domain logic
//! (no IO, no storage).

pub mod account;
pub mod cart;

pub use account::{
    Account, AccountCommand, AccountEvent, AccountOpened, AccountOrigin, AccountRecord,
    AccessChanged, AddToCart, AdjustBalance, AdminFlagChanged, BalanceAdjusted, CartCleared,
    CartLineRemoved, CartLineSet, ClearCart, Credential, CredentialChanged, CreditsDebited,
    CreditsRefunded, EnrollAccount, RegisterAccount, RemoveFromCart, SetAccess, SetAdmin,
    SetCredential, ToggleWishlist, UpdateCartLine, WishlistToggled, normalize_email,
};
pub use cart::CartLine;
