use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vault_core::{
    AccountId, Aggregate, AggregateRoot, Credits, DomainError, DomainResult, OrderId, ProductId,
};
use vault_events::Event;

use crate::cart::{self, CartLine};

/// Opaque credential (already hashed by the caller).
///
/// Verification is the identity provider's job; the account only remembers
/// whether one is set. Accounts without a credential use passwordless access.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::validation("credential cannot be blank"));
        }
        Ok(Self(value))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Debug for Credential {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// How the account came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountOrigin {
    /// Created by an administrator.
    Enrollment,
    /// Created by the student themselves.
    Registration,
}

/// Trim and lowercase an email, rejecting obviously malformed values.
pub fn normalize_email(raw: &str) -> DomainResult<String> {
    let email = raw.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(DomainError::validation(format!("invalid email: {raw:?}"))),
    }
}

/// Aggregate root: Account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    id: AccountId,
    email: String,
    display_name: String,
    credential: Option<Credential>,
    balance: Credits,
    is_admin: bool,
    access_allowed: bool,
    cart: Vec<CartLine>,
    wishlist: Vec<ProductId>,
    created_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

/// Persisted form of an account (one row per account).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: AccountId,
    pub email: String,
    pub display_name: String,
    pub credential: Option<Credential>,
    pub balance: Credits,
    pub is_admin: bool,
    pub access_allowed: bool,
    pub cart: Vec<CartLine>,
    pub wishlist: Vec<ProductId>,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

impl Account {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: AccountId) -> Self {
        Self {
            id,
            email: String::new(),
            display_name: String::new(),
            credential: None,
            balance: Credits::ZERO,
            is_admin: false,
            access_allowed: false,
            cart: Vec::new(),
            wishlist: Vec::new(),
            created_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn from_record(record: AccountRecord) -> Self {
        Self {
            id: record.id,
            email: record.email,
            display_name: record.display_name,
            credential: record.credential,
            balance: record.balance,
            is_admin: record.is_admin,
            access_allowed: record.access_allowed,
            cart: record.cart,
            wishlist: record.wishlist,
            created_at: Some(record.created_at),
            version: record.version,
            created: true,
        }
    }

    pub fn to_record(&self) -> DomainResult<AccountRecord> {
        let created_at = match (self.created, self.created_at) {
            (true, Some(at)) => at,
            _ => return Err(DomainError::not_found()),
        };
        Ok(AccountRecord {
            id: self.id,
            email: self.email.clone(),
            display_name: self.display_name.clone(),
            credential: self.credential.clone(),
            balance: self.balance,
            is_admin: self.is_admin,
            access_allowed: self.access_allowed,
            cart: self.cart.clone(),
            wishlist: self.wishlist.clone(),
            created_at,
            version: self.version,
        })
    }

    pub fn id_typed(&self) -> AccountId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    pub fn balance(&self) -> Credits {
        self.balance
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    pub fn access_allowed(&self) -> bool {
        self.access_allowed
    }

    pub fn cart(&self) -> &[CartLine] {
        &self.cart
    }

    pub fn wishlist(&self) -> &[ProductId] {
        &self.wishlist
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// An account may redeem only while access is allowed.
    pub fn can_redeem(&self) -> bool {
        self.created && self.access_allowed
    }

    /// An admin action requires both the admin flag and allowed access.
    pub fn can_administer(&self) -> bool {
        self.created && self.access_allowed && self.is_admin
    }
}

impl AggregateRoot for Account {
    type Id = AccountId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: EnrollAccount (admin-created account).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollAccount {
    pub account_id: AccountId,
    pub email: String,
    pub display_name: String,
    pub initial_balance: Credits,
    pub is_admin: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RegisterAccount (self-registration).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAccount {
    pub account_id: AccountId,
    pub email: String,
    pub display_name: String,
    pub credential: Option<Credential>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AdjustBalance (admin grant or removal).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustBalance {
    pub account_id: AccountId,
    pub delta: i64,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAccess {
    pub account_id: AccountId,
    pub allowed: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAdmin {
    pub account_id: AccountId,
    pub is_admin: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetCredential {
    pub account_id: AccountId,
    pub credential: Option<Credential>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddToCart {
    pub account_id: AccountId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateCartLine. A quantity of zero removes the line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCartLine {
    pub account_id: AccountId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveFromCart {
    pub account_id: AccountId,
    pub product_id: ProductId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearCart {
    pub account_id: AccountId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleWishlist {
    pub account_id: AccountId,
    pub product_id: ProductId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountCommand {
    EnrollAccount(EnrollAccount),
    RegisterAccount(RegisterAccount),
    AdjustBalance(AdjustBalance),
    SetAccess(SetAccess),
    SetAdmin(SetAdmin),
    SetCredential(SetCredential),
    AddToCart(AddToCart),
    UpdateCartLine(UpdateCartLine),
    RemoveFromCart(RemoveFromCart),
    ClearCart(ClearCart),
    ToggleWishlist(ToggleWishlist),
}

/// Event: AccountOpened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountOpened {
    pub account_id: AccountId,
    pub email: String,
    pub display_name: String,
    #[serde(skip)]
    pub credential: Option<Credential>,
    pub initial_balance: Credits,
    pub is_admin: bool,
    pub origin: AccountOrigin,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BalanceAdjusted (admin grant/removal).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceAdjusted {
    pub account_id: AccountId,
    pub delta: i64,
    pub new_balance: Credits,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CreditsDebited. Emitted only by a committed redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditsDebited {
    pub account_id: AccountId,
    pub order_id: OrderId,
    pub amount: Credits,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CreditsRefunded. Emitted only by an order cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditsRefunded {
    pub account_id: AccountId,
    pub order_id: OrderId,
    pub amount: Credits,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessChanged {
    pub account_id: AccountId,
    pub allowed: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminFlagChanged {
    pub account_id: AccountId,
    pub is_admin: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialChanged {
    pub account_id: AccountId,
    #[serde(skip)]
    pub credential: Option<Credential>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLineSet {
    pub account_id: AccountId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLineRemoved {
    pub account_id: AccountId,
    pub product_id: ProductId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartCleared {
    pub account_id: AccountId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WishlistToggled {
    pub account_id: AccountId,
    pub product_id: ProductId,
    pub added: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountEvent {
    AccountOpened(AccountOpened),
    BalanceAdjusted(BalanceAdjusted),
    CreditsDebited(CreditsDebited),
    CreditsRefunded(CreditsRefunded),
    AccessChanged(AccessChanged),
    AdminFlagChanged(AdminFlagChanged),
    CredentialChanged(CredentialChanged),
    CartLineSet(CartLineSet),
    CartLineRemoved(CartLineRemoved),
    CartCleared(CartCleared),
    WishlistToggled(WishlistToggled),
}

impl Event for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::AccountOpened(_) => "accounts.account.opened",
            AccountEvent::BalanceAdjusted(_) => "accounts.account.balance_adjusted",
            AccountEvent::CreditsDebited(_) => "accounts.account.credits_debited",
            AccountEvent::CreditsRefunded(_) => "accounts.account.credits_refunded",
            AccountEvent::AccessChanged(_) => "accounts.account.access_changed",
            AccountEvent::AdminFlagChanged(_) => "accounts.account.admin_flag_changed",
            AccountEvent::CredentialChanged(_) => "accounts.account.credential_changed",
            AccountEvent::CartLineSet(_) => "accounts.cart.line_set",
            AccountEvent::CartLineRemoved(_) => "accounts.cart.line_removed",
            AccountEvent::CartCleared(_) => "accounts.cart.cleared",
            AccountEvent::WishlistToggled(_) => "accounts.wishlist.toggled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            AccountEvent::AccountOpened(e) => e.occurred_at,
            AccountEvent::BalanceAdjusted(e) => e.occurred_at,
            AccountEvent::CreditsDebited(e) => e.occurred_at,
            AccountEvent::CreditsRefunded(e) => e.occurred_at,
            AccountEvent::AccessChanged(e) => e.occurred_at,
            AccountEvent::AdminFlagChanged(e) => e.occurred_at,
            AccountEvent::CredentialChanged(e) => e.occurred_at,
            AccountEvent::CartLineSet(e) => e.occurred_at,
            AccountEvent::CartLineRemoved(e) => e.occurred_at,
            AccountEvent::CartCleared(e) => e.occurred_at,
            AccountEvent::WishlistToggled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Account {
    type Command = AccountCommand;
    type Event = AccountEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AccountEvent::AccountOpened(e) => {
                self.id = e.account_id;
                self.email = e.email.clone();
                self.display_name = e.display_name.clone();
                self.credential = e.credential.clone();
                self.balance = e.initial_balance;
                self.is_admin = e.is_admin;
                self.access_allowed = true;
                self.cart.clear();
                self.wishlist.clear();
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            AccountEvent::BalanceAdjusted(e) => {
                self.balance = e.new_balance;
            }
            AccountEvent::CreditsDebited(e) => {
                // The ledger only emits this after checking the balance covers it.
                self.balance = self.balance.saturating_sub(e.amount);
            }
            AccountEvent::CreditsRefunded(e) => {
                self.balance = self.balance.saturating_add(e.amount);
            }
            AccountEvent::AccessChanged(e) => {
                self.access_allowed = e.allowed;
            }
            AccountEvent::AdminFlagChanged(e) => {
                self.is_admin = e.is_admin;
            }
            AccountEvent::CredentialChanged(e) => {
                self.credential = e.credential.clone();
            }
            AccountEvent::CartLineSet(e) => {
                cart::set(&mut self.cart, e.product_id, e.quantity);
            }
            AccountEvent::CartLineRemoved(e) => {
                cart::remove(&mut self.cart, e.product_id);
            }
            AccountEvent::CartCleared(_) => {
                self.cart.clear();
            }
            AccountEvent::WishlistToggled(e) => {
                if e.added {
                    if !self.wishlist.contains(&e.product_id) {
                        self.wishlist.push(e.product_id);
                    }
                } else {
                    self.wishlist.retain(|p| *p != e.product_id);
                }
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            AccountCommand::EnrollAccount(cmd) => self.handle_enroll(cmd),
            AccountCommand::RegisterAccount(cmd) => self.handle_register(cmd),
            AccountCommand::AdjustBalance(cmd) => self.handle_adjust_balance(cmd),
            AccountCommand::SetAccess(cmd) => self.handle_set_access(cmd),
            AccountCommand::SetAdmin(cmd) => self.handle_set_admin(cmd),
            AccountCommand::SetCredential(cmd) => self.handle_set_credential(cmd),
            AccountCommand::AddToCart(cmd) => self.handle_add_to_cart(cmd),
            AccountCommand::UpdateCartLine(cmd) => self.handle_update_cart_line(cmd),
            AccountCommand::RemoveFromCart(cmd) => self.handle_remove_from_cart(cmd),
            AccountCommand::ClearCart(cmd) => self.handle_clear_cart(cmd),
            AccountCommand::ToggleWishlist(cmd) => self.handle_toggle_wishlist(cmd),
        }
    }
}

impl Account {
    fn ensure_exists(&self, account_id: AccountId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.id != account_id {
            return Err(DomainError::invariant("account_id mismatch"));
        }
        Ok(())
    }

    fn ensure_new(&self) -> Result<(), DomainError> {
        if self.created {
            return Err(DomainError::conflict("account already exists"));
        }
        Ok(())
    }

    fn validate_display_name(name: &str) -> Result<String, DomainError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("display name cannot be empty"));
        }
        Ok(trimmed.to_string())
    }

    fn handle_enroll(&self, cmd: &EnrollAccount) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_new()?;
        Ok(vec![AccountEvent::AccountOpened(AccountOpened {
            account_id: cmd.account_id,
            email: normalize_email(&cmd.email)?,
            display_name: Self::validate_display_name(&cmd.display_name)?,
            credential: None,
            initial_balance: cmd.initial_balance,
            is_admin: cmd.is_admin,
            origin: AccountOrigin::Enrollment,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_register(&self, cmd: &RegisterAccount) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_new()?;
        Ok(vec![AccountEvent::AccountOpened(AccountOpened {
            account_id: cmd.account_id,
            email: normalize_email(&cmd.email)?,
            display_name: Self::validate_display_name(&cmd.display_name)?,
            credential: cmd.credential.clone(),
            initial_balance: Credits::ZERO,
            is_admin: false,
            origin: AccountOrigin::Registration,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_adjust_balance(
        &self,
        cmd: &AdjustBalance,
    ) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_exists(cmd.account_id)?;

        if cmd.delta == 0 {
            return Err(DomainError::validation("delta cannot be zero"));
        }

        let new_balance = self
            .balance
            .apply_delta(cmd.delta)
            .ok_or_else(|| DomainError::invariant("balance cannot go negative"))?;

        Ok(vec![AccountEvent::BalanceAdjusted(BalanceAdjusted {
            account_id: cmd.account_id,
            delta: cmd.delta,
            new_balance,
            reason: cmd.reason.trim().to_string(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_access(&self, cmd: &SetAccess) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_exists(cmd.account_id)?;
        if self.access_allowed == cmd.allowed {
            return Ok(vec![]);
        }
        Ok(vec![AccountEvent::AccessChanged(AccessChanged {
            account_id: cmd.account_id,
            allowed: cmd.allowed,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_admin(&self, cmd: &SetAdmin) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_exists(cmd.account_id)?;
        if self.is_admin == cmd.is_admin {
            return Ok(vec![]);
        }
        Ok(vec![AccountEvent::AdminFlagChanged(AdminFlagChanged {
            account_id: cmd.account_id,
            is_admin: cmd.is_admin,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_credential(
        &self,
        cmd: &SetCredential,
    ) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_exists(cmd.account_id)?;
        Ok(vec![AccountEvent::CredentialChanged(CredentialChanged {
            account_id: cmd.account_id,
            credential: cmd.credential.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_add_to_cart(&self, cmd: &AddToCart) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_exists(cmd.account_id)?;
        let quantity = cart::merged_quantity(&self.cart, cmd.product_id, cmd.quantity)?;
        Ok(vec![AccountEvent::CartLineSet(CartLineSet {
            account_id: cmd.account_id,
            product_id: cmd.product_id,
            quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update_cart_line(
        &self,
        cmd: &UpdateCartLine,
    ) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_exists(cmd.account_id)?;

        if cart::find(&self.cart, cmd.product_id).is_none() {
            return Err(DomainError::validation("product is not in the cart"));
        }

        if cmd.quantity == 0 {
            return Ok(vec![AccountEvent::CartLineRemoved(CartLineRemoved {
                account_id: cmd.account_id,
                product_id: cmd.product_id,
                occurred_at: cmd.occurred_at,
            })]);
        }

        cart::ensure_quantity(cmd.quantity)?;
        Ok(vec![AccountEvent::CartLineSet(CartLineSet {
            account_id: cmd.account_id,
            product_id: cmd.product_id,
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_remove_from_cart(
        &self,
        cmd: &RemoveFromCart,
    ) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_exists(cmd.account_id)?;
        if cart::find(&self.cart, cmd.product_id).is_none() {
            return Ok(vec![]);
        }
        Ok(vec![AccountEvent::CartLineRemoved(CartLineRemoved {
            account_id: cmd.account_id,
            product_id: cmd.product_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_clear_cart(&self, cmd: &ClearCart) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_exists(cmd.account_id)?;
        if self.cart.is_empty() {
            return Ok(vec![]);
        }
        Ok(vec![AccountEvent::CartCleared(CartCleared {
            account_id: cmd.account_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_toggle_wishlist(
        &self,
        cmd: &ToggleWishlist,
    ) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_exists(cmd.account_id)?;
        Ok(vec![AccountEvent::WishlistToggled(WishlistToggled {
            account_id: cmd.account_id,
            product_id: cmd.product_id,
            added: !self.wishlist.contains(&cmd.product_id),
            occurred_at: cmd.occurred_at,
        })])
    }
}
