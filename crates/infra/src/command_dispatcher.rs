//! Command execution pipeline (application-level orchestration).
//!
//! ```text
//! Command
//!   ↓
//! 1. Load current state (or start from an empty aggregate)
//!   ↓
//! 2. Handle command (pure decision logic, produces events)
//!   ↓
//! 3. Apply events (+1 version per event)
//!   ↓
//! 4. Save with optimistic concurrency (NoRecord on create, Exact(loaded) otherwise)
//!   ↓
//! 5. Publish events to the bus (after the save committed)
//! ```
//!
//! Multi-aggregate changes (redemptions, cancellations) bypass step 4 and go
//! through the `Ledger`; they still publish through [`CommandDispatcher::publish`].
//!
//! This module contains no IO itself; it composes the store and bus traits.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use vault_core::{Aggregate, DomainError, ExpectedVersion};
use vault_events::{Event, EventBus, EventEnvelope};

use crate::store::{AggregateStore, StoreError};

/// Failure of an account or catalog service call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("not found")]
    NotFound,

    /// The acting account lacks the admin flag or access.
    #[error("forbidden")]
    Forbidden,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Stale version or an already existing record.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound => ServiceError::NotFound,
            StoreError::Conflict(msg) => ServiceError::Conflict(msg),
            StoreError::Duplicate(msg) => ServiceError::Duplicate(msg),
            other => ServiceError::Store(other),
        }
    }
}

impl From<DomainError> for ServiceError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                ServiceError::Validation(msg)
            }
            DomainError::InvariantViolation(msg) => ServiceError::InvariantViolation(msg),
            DomainError::Conflict(msg) => ServiceError::Conflict(msg),
            DomainError::NotFound => ServiceError::NotFound,
            DomainError::Forbidden => ServiceError::Forbidden,
        }
    }
}

/// The aggregate after a dispatched command, plus the events it produced.
///
/// `events` is empty when the command was a no-op; nothing was saved then.
#[derive(Debug, Clone)]
pub struct Dispatched<A: Aggregate> {
    pub aggregate: A,
    pub events: Vec<A::Event>,
}

/// Reusable command execution engine for state-stored aggregates.
///
/// - `S`: store implementation (`AggregateStore<A>` for each aggregate used)
/// - `B`: event bus carrying JSON envelopes
///
/// Events are published only after the save succeeded. Publication is
/// best-effort: the change is already durable, so a bus failure is logged and
/// the call still succeeds. Retrying it would apply the change twice.
#[derive(Debug)]
pub struct CommandDispatcher<S: ?Sized, B> {
    store: Arc<S>,
    bus: B,
}

impl<S: ?Sized, B: Clone> Clone for CommandDispatcher<S, B> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            bus: self.bus.clone(),
        }
    }
}

impl<S: ?Sized, B> CommandDispatcher<S, B> {
    pub fn new(store: Arc<S>, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: ?Sized + Send + Sync,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Dispatch a command through load → handle → apply → save → publish.
    ///
    /// `make_aggregate` builds the empty instance used when nothing is stored
    /// under `id` (e.g. `Account::empty`).
    pub async fn dispatch<A>(
        &self,
        id: A::Id,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl FnOnce(A::Id) -> A + Send,
    ) -> Result<Dispatched<A>, ServiceError>
    where
        S: AggregateStore<A>,
        A: Aggregate<Error = DomainError> + Send + Sync,
        A::Id: Copy + Into<Uuid> + Send,
        A::Command: Send,
        A::Event: Event + Serialize + Send,
    {
        // 1) Load
        let loaded = self.store.load(id).await?;
        let expected = match &loaded {
            Some(existing) => ExpectedVersion::Exact(existing.version()),
            None => ExpectedVersion::NoRecord,
        };
        let mut aggregate = loaded.unwrap_or_else(|| make_aggregate(id));

        // 2) Decide events (no mutation)
        let events = aggregate.handle(&command)?;
        if events.is_empty() {
            return Ok(Dispatched {
                aggregate,
                events: vec![],
            });
        }

        // 3) Apply
        for event in &events {
            aggregate.apply(event);
        }

        // 4) Save (optimistic)
        self.store.save(&aggregate, expected).await?;

        // 5) Publish committed events
        self.publish(id.into(), aggregate_type, aggregate.version(), &events);

        Ok(Dispatched { aggregate, events })
    }

    /// Publish events that are already committed.
    ///
    /// `version_after` is the aggregate version after the last event; each
    /// envelope's sequence number is the version that event produced.
    pub fn publish<E>(
        &self,
        aggregate_id: Uuid,
        aggregate_type: &str,
        version_after: u64,
        events: &[E],
    ) where
        E: Event + Serialize,
    {
        let first = version_after.saturating_sub(events.len() as u64);
        for (idx, event) in events.iter().enumerate() {
            let sequence_number = first + idx as u64 + 1;
            let envelope = match EventEnvelope::from_typed(
                aggregate_id,
                aggregate_type,
                sequence_number,
                event,
            ) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(
                        error = %e,
                        event_type = event.event_type(),
                        "failed to serialize committed event"
                    );
                    continue;
                }
            };
            if let Err(e) = self.bus.publish(envelope) {
                warn!(
                    error = ?e,
                    event_type = event.event_type(),
                    %aggregate_id,
                    "failed to publish committed event"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vault_catalog::{
        ChangePrice, CreateProduct, Product, ProductCommand, ProductDetails,
    };
    use vault_core::{AggregateRoot, Credits, ProductId};
    use vault_events::InMemoryEventBus;

    use crate::store::InMemoryVaultStore;

    type TestDispatcher =
        CommandDispatcher<InMemoryVaultStore, Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>>;

    fn setup() -> TestDispatcher {
        CommandDispatcher::new(
            Arc::new(InMemoryVaultStore::new()),
            Arc::new(InMemoryEventBus::new()),
        )
    }

    fn create(product_id: ProductId) -> ProductCommand {
        ProductCommand::CreateProduct(CreateProduct {
            product_id,
            details: ProductDetails {
                title: "Notebook".to_string(),
                description: String::new(),
                image_ref: None,
                category: "stationery".to_string(),
            },
            price: Credits::new(75),
            initial_stock: 5,
            visible: true,
            occurred_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn dispatch_saves_and_publishes_after_commit() {
        let dispatcher = setup();
        let subscription = dispatcher.bus().subscribe();
        let product_id = ProductId::new();

        let dispatched = dispatcher
            .dispatch(product_id, "catalog.product", create(product_id), Product::empty)
            .await
            .unwrap();
        assert_eq!(dispatched.aggregate.version(), 1);

        let stored = AggregateStore::<Product>::load(&**dispatcher.store(), product_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.price(), Credits::new(75));

        let envelopes = subscription.drain();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].event_type(), "catalog.product.created");
        assert_eq!(envelopes[0].sequence_number(), 1);
    }

    #[tokio::test]
    async fn creating_twice_is_a_conflict() {
        let dispatcher = setup();
        let product_id = ProductId::new();
        dispatcher
            .dispatch(product_id, "catalog.product", create(product_id), Product::empty)
            .await
            .unwrap();

        let err = dispatcher
            .dispatch(product_id, "catalog.product", create(product_id), Product::empty)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[tokio::test]
    async fn no_op_command_saves_nothing() {
        let dispatcher = setup();
        let subscription = dispatcher.bus().subscribe();
        let product_id = ProductId::new();
        dispatcher
            .dispatch(product_id, "catalog.product", create(product_id), Product::empty)
            .await
            .unwrap();

        let dispatched = dispatcher
            .dispatch(
                product_id,
                "catalog.product",
                ProductCommand::ChangePrice(ChangePrice {
                    product_id,
                    price: Credits::new(75),
                    occurred_at: Utc::now(),
                }),
                Product::empty,
            )
            .await
            .unwrap();

        assert!(dispatched.events.is_empty());
        assert_eq!(dispatched.aggregate.version(), 1);
        assert_eq!(subscription.drain().len(), 1);
    }

    #[tokio::test]
    async fn command_on_missing_aggregate_is_not_found() {
        let dispatcher = setup();
        let product_id = ProductId::new();
        let err = dispatcher
            .dispatch(
                product_id,
                "catalog.product",
                ProductCommand::ChangePrice(ChangePrice {
                    product_id,
                    price: Credits::new(1),
                    occurred_at: Utc::now(),
                }),
                Product::empty,
            )
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::NotFound);
    }
}
