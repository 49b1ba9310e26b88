use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vault_core::{
    AccountId, Aggregate, AggregateRoot, Credits, DomainError, DomainResult, MAX_LINE_QUANTITY,
    OrderId, ProductId, ValueObject,
};
use vault_events::Event;

/// Order status lifecycle.
///
/// `Pending` is the only non-terminal state; admins move it to exactly one of
/// the other three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Fulfilled,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Fulfilled => "fulfilled",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (
                OrderStatus::Pending,
                OrderStatus::Fulfilled | OrderStatus::Delivered | OrderStatus::Cancelled
            )
        )
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "fulfilled" => Ok(OrderStatus::Fulfilled),
            "delivered" => Ok(OrderStatus::Delivered),
            "cancelled" | "canceled" => Ok(OrderStatus::Cancelled),
            other => Err(DomainError::validation(format!(
                "unknown order status: {other}"
            ))),
        }
    }
}

/// A redeemed line. Title and unit price are captured at redemption time and
/// never change afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub title: String,
    pub quantity: u32,
    pub unit_price: Credits,
}

impl ValueObject for OrderLine {}

impl OrderLine {
    pub fn line_total(&self) -> Option<Credits> {
        self.unit_price.checked_mul(self.quantity)
    }
}

/// One entry of the order's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: Option<OrderStatus>,
    pub to: OrderStatus,
    /// `None` for the initial placement by the owning account.
    pub changed_by: Option<AccountId>,
    pub at: DateTime<Utc>,
}

/// Aggregate root: Order (a committed redemption).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    id: OrderId,
    account_id: Option<AccountId>,
    lines: Vec<OrderLine>,
    total: Credits,
    status: OrderStatus,
    history: Vec<StatusChange>,
    created_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

/// Persisted form of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: OrderId,
    pub account_id: AccountId,
    pub lines: Vec<OrderLine>,
    pub total: Credits,
    pub status: OrderStatus,
    pub history: Vec<StatusChange>,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

impl Order {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: OrderId) -> Self {
        Self {
            id,
            account_id: None,
            lines: Vec::new(),
            total: Credits::ZERO,
            status: OrderStatus::Pending,
            history: Vec::new(),
            created_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn from_record(record: OrderRecord) -> Self {
        Self {
            id: record.id,
            account_id: Some(record.account_id),
            lines: record.lines,
            total: record.total,
            status: record.status,
            history: record.history,
            created_at: Some(record.created_at),
            version: record.version,
            created: true,
        }
    }

    pub fn to_record(&self) -> DomainResult<OrderRecord> {
        match (self.created, self.account_id, self.created_at) {
            (true, Some(account_id), Some(created_at)) => Ok(OrderRecord {
                id: self.id,
                account_id,
                lines: self.lines.clone(),
                total: self.total,
                status: self.status,
                history: self.history.clone(),
                created_at,
                version: self.version,
            }),
            _ => Err(DomainError::not_found()),
        }
    }

    pub fn id_typed(&self) -> OrderId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn account_id(&self) -> Option<AccountId> {
        self.account_id
    }

    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    pub fn total(&self) -> Credits {
        self.total
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn history(&self) -> &[StatusChange] {
        &self.history
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: PlaceOrder. Issued by the redemption plan, never directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub order_id: OrderId,
    pub account_id: AccountId,
    pub lines: Vec<OrderLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ChangeStatus (admin).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStatus {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub changed_by: AccountId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCommand {
    PlaceOrder(PlaceOrder),
    ChangeStatus(ChangeStatus),
}

/// Event: OrderPlaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: OrderId,
    pub account_id: AccountId,
    pub lines: Vec<OrderLine>,
    pub total: Credits,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderStatusChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusChanged {
    pub order_id: OrderId,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub changed_by: AccountId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    OrderPlaced(OrderPlaced),
    OrderStatusChanged(OrderStatusChanged),
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderPlaced(_) => "redemption.order.placed",
            OrderEvent::OrderStatusChanged(_) => "redemption.order.status_changed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderPlaced(e) => e.occurred_at,
            OrderEvent::OrderStatusChanged(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::OrderPlaced(e) => {
                self.id = e.order_id;
                self.account_id = Some(e.account_id);
                self.lines = e.lines.clone();
                self.total = e.total;
                self.status = OrderStatus::Pending;
                self.history = vec![StatusChange {
                    from: None,
                    to: OrderStatus::Pending,
                    changed_by: None,
                    at: e.occurred_at,
                }];
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            OrderEvent::OrderStatusChanged(e) => {
                self.status = e.to;
                self.history.push(StatusChange {
                    from: Some(e.from),
                    to: e.to,
                    changed_by: Some(e.changed_by),
                    at: e.occurred_at,
                });
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::PlaceOrder(cmd) => self.handle_place(cmd),
            OrderCommand::ChangeStatus(cmd) => self.handle_change_status(cmd),
        }
    }
}

impl Order {
    fn ensure_order_id(&self, order_id: OrderId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn handle_place(&self, cmd: &PlaceOrder) -> Result<Vec<OrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("order already exists"));
        }
        if cmd.lines.is_empty() {
            return Err(DomainError::validation("an order needs at least one line"));
        }

        let mut total = Credits::ZERO;
        for line in &cmd.lines {
            if line.quantity == 0 || line.quantity > MAX_LINE_QUANTITY {
                return Err(DomainError::validation(format!(
                    "quantity must be within 1..={MAX_LINE_QUANTITY}"
                )));
            }
            total = line
                .line_total()
                .and_then(|t| total.checked_add(t))
                .ok_or_else(|| DomainError::validation("order total overflows"))?;
        }

        Ok(vec![OrderEvent::OrderPlaced(OrderPlaced {
            order_id: cmd.order_id,
            account_id: cmd.account_id,
            lines: cmd.lines.clone(),
            total,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_change_status(&self, cmd: &ChangeStatus) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_order_id(cmd.order_id)?;

        if !self.status.can_transition_to(cmd.status) {
            return Err(DomainError::conflict(format!(
                "cannot move order from {} to {}",
                self.status, cmd.status
            )));
        }

        Ok(vec![OrderEvent::OrderStatusChanged(OrderStatusChanged {
            order_id: cmd.order_id,
            from: self.status,
            to: cmd.status,
            changed_by: cmd.changed_by,
            occurred_at: cmd.occurred_at,
        })])
    }
}
