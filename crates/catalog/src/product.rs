use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vault_core::{
    Aggregate, AggregateRoot, Credits, DomainError, DomainResult, OrderId, ProductId, ValueObject,
};
use vault_events::Event;

/// Descriptive product fields editable by admins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDetails {
    pub title: String,
    pub description: String,
    pub image_ref: Option<String>,
    pub category: String,
}

impl ProductDetails {
    fn normalized(&self) -> DomainResult<Self> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(DomainError::validation("product title cannot be empty"));
        }
        let category = self.category.trim();
        if category.is_empty() {
            return Err(DomainError::validation("product category cannot be empty"));
        }
        Ok(Self {
            title: title.to_string(),
            description: self.description.trim().to_string(),
            image_ref: self
                .image_ref
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            category: category.to_string(),
        })
    }
}

impl ValueObject for ProductDetails {}

/// Aggregate root: Product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    id: ProductId,
    details: ProductDetails,
    price: Credits,
    stock: u32,
    visible: bool,
    created_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

/// Persisted form of a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: ProductId,
    pub details: ProductDetails,
    pub price: Credits,
    pub stock: u32,
    pub visible: bool,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

impl Product {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: ProductId) -> Self {
        Self {
            id,
            details: ProductDetails::default(),
            price: Credits::ZERO,
            stock: 0,
            visible: false,
            created_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn from_record(record: ProductRecord) -> Self {
        Self {
            id: record.id,
            details: record.details,
            price: record.price,
            stock: record.stock,
            visible: record.visible,
            created_at: Some(record.created_at),
            version: record.version,
            created: true,
        }
    }

    pub fn to_record(&self) -> DomainResult<ProductRecord> {
        let created_at = match (self.created, self.created_at) {
            (true, Some(at)) => at,
            _ => return Err(DomainError::not_found()),
        };
        Ok(ProductRecord {
            id: self.id,
            details: self.details.clone(),
            price: self.price,
            stock: self.stock,
            visible: self.visible,
            created_at,
            version: self.version,
        })
    }

    pub fn id_typed(&self) -> ProductId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn details(&self) -> &ProductDetails {
        &self.details
    }

    pub fn title(&self) -> &str {
        &self.details.title
    }

    pub fn price(&self) -> Credits {
        self.price
    }

    pub fn stock(&self) -> u32 {
        self.stock
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Hidden or missing products cannot be redeemed or added to a cart.
    pub fn is_redeemable(&self) -> bool {
        self.created && self.visible
    }
}

impl AggregateRoot for Product {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateProduct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateProduct {
    pub product_id: ProductId,
    pub details: ProductDetails,
    pub price: Credits,
    pub initial_stock: u32,
    pub visible: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateDetails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDetails {
    pub product_id: ProductId,
    pub details: ProductDetails,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ChangePrice. Existing orders keep the price they captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePrice {
    pub product_id: ProductId,
    pub price: Credits,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Restock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restock {
    pub product_id: ProductId,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetVisibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetVisibility {
    pub product_id: ProductId,
    pub visible: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductCommand {
    CreateProduct(CreateProduct),
    UpdateDetails(UpdateDetails),
    ChangePrice(ChangePrice),
    Restock(Restock),
    SetVisibility(SetVisibility),
}

/// Event: ProductCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductCreated {
    pub product_id: ProductId,
    pub details: ProductDetails,
    pub price: Credits,
    pub initial_stock: u32,
    pub visible: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailsUpdated {
    pub product_id: ProductId,
    pub details: ProductDetails,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceChanged {
    pub product_id: ProductId,
    pub previous: Credits,
    pub price: Credits,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restocked {
    pub product_id: ProductId,
    pub quantity: u32,
    pub new_stock: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibilityChanged {
    pub product_id: ProductId,
    pub visible: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockDecremented. Emitted only by a committed redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockDecremented {
    pub product_id: ProductId,
    pub order_id: OrderId,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockRestored. Emitted only by an order cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRestored {
    pub product_id: ProductId,
    pub order_id: OrderId,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductEvent {
    ProductCreated(ProductCreated),
    DetailsUpdated(DetailsUpdated),
    PriceChanged(PriceChanged),
    Restocked(Restocked),
    VisibilityChanged(VisibilityChanged),
    StockDecremented(StockDecremented),
    StockRestored(StockRestored),
}

impl ProductEvent {
    pub fn product_id(&self) -> ProductId {
        match self {
            ProductEvent::ProductCreated(e) => e.product_id,
            ProductEvent::DetailsUpdated(e) => e.product_id,
            ProductEvent::PriceChanged(e) => e.product_id,
            ProductEvent::Restocked(e) => e.product_id,
            ProductEvent::VisibilityChanged(e) => e.product_id,
            ProductEvent::StockDecremented(e) => e.product_id,
            ProductEvent::StockRestored(e) => e.product_id,
        }
    }
}

impl Event for ProductEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ProductEvent::ProductCreated(_) => "catalog.product.created",
            ProductEvent::DetailsUpdated(_) => "catalog.product.details_updated",
            ProductEvent::PriceChanged(_) => "catalog.product.price_changed",
            ProductEvent::Restocked(_) => "catalog.product.restocked",
            ProductEvent::VisibilityChanged(_) => "catalog.product.visibility_changed",
            ProductEvent::StockDecremented(_) => "catalog.product.stock_decremented",
            ProductEvent::StockRestored(_) => "catalog.product.stock_restored",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ProductEvent::ProductCreated(e) => e.occurred_at,
            ProductEvent::DetailsUpdated(e) => e.occurred_at,
            ProductEvent::PriceChanged(e) => e.occurred_at,
            ProductEvent::Restocked(e) => e.occurred_at,
            ProductEvent::VisibilityChanged(e) => e.occurred_at,
            ProductEvent::StockDecremented(e) => e.occurred_at,
            ProductEvent::StockRestored(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Product {
    type Command = ProductCommand;
    type Event = ProductEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ProductEvent::ProductCreated(e) => {
                self.id = e.product_id;
                self.details = e.details.clone();
                self.price = e.price;
                self.stock = e.initial_stock;
                self.visible = e.visible;
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            ProductEvent::DetailsUpdated(e) => {
                self.details = e.details.clone();
            }
            ProductEvent::PriceChanged(e) => {
                self.price = e.price;
            }
            ProductEvent::Restocked(e) => {
                self.stock = e.new_stock;
            }
            ProductEvent::VisibilityChanged(e) => {
                self.visible = e.visible;
            }
            ProductEvent::StockDecremented(e) => {
                self.stock = self.stock.saturating_sub(e.quantity);
            }
            ProductEvent::StockRestored(e) => {
                self.stock = self.stock.saturating_add(e.quantity);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ProductCommand::CreateProduct(cmd) => self.handle_create(cmd),
            ProductCommand::UpdateDetails(cmd) => self.handle_update_details(cmd),
            ProductCommand::ChangePrice(cmd) => self.handle_change_price(cmd),
            ProductCommand::Restock(cmd) => self.handle_restock(cmd),
            ProductCommand::SetVisibility(cmd) => self.handle_set_visibility(cmd),
        }
    }
}

impl Product {
    fn ensure_product_id(&self, product_id: ProductId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.id != product_id {
            return Err(DomainError::invariant("product_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateProduct) -> Result<Vec<ProductEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("product already exists"));
        }

        Ok(vec![ProductEvent::ProductCreated(ProductCreated {
            product_id: cmd.product_id,
            details: cmd.details.normalized()?,
            price: cmd.price,
            initial_stock: cmd.initial_stock,
            visible: cmd.visible,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update_details(
        &self,
        cmd: &UpdateDetails,
    ) -> Result<Vec<ProductEvent>, DomainError> {
        self.ensure_product_id(cmd.product_id)?;
        let details = cmd.details.normalized()?;
        if details == self.details {
            return Ok(vec![]);
        }
        Ok(vec![ProductEvent::DetailsUpdated(DetailsUpdated {
            product_id: cmd.product_id,
            details,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_change_price(&self, cmd: &ChangePrice) -> Result<Vec<ProductEvent>, DomainError> {
        self.ensure_product_id(cmd.product_id)?;
        if cmd.price == self.price {
            return Ok(vec![]);
        }
        Ok(vec![ProductEvent::PriceChanged(PriceChanged {
            product_id: cmd.product_id,
            previous: self.price,
            price: cmd.price,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_restock(&self, cmd: &Restock) -> Result<Vec<ProductEvent>, DomainError> {
        self.ensure_product_id(cmd.product_id)?;

        if cmd.quantity == 0 {
            return Err(DomainError::validation("restock quantity must be positive"));
        }

        let new_stock = self
            .stock
            .checked_add(cmd.quantity)
            .ok_or_else(|| DomainError::invariant("stock overflow"))?;

        Ok(vec![ProductEvent::Restocked(Restocked {
            product_id: cmd.product_id,
            quantity: cmd.quantity,
            new_stock,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_visibility(
        &self,
        cmd: &SetVisibility,
    ) -> Result<Vec<ProductEvent>, DomainError> {
        self.ensure_product_id(cmd.product_id)?;
        if cmd.visible == self.visible {
            return Ok(vec![]);
        }
        Ok(vec![ProductEvent::VisibilityChanged(VisibilityChanged {
            product_id: cmd.product_id,
            visible: cmd.visible,
            occurred_at: cmd.occurred_at,
        })])
    }
}
