//! Domain events and their publication.
//!
//! Accounts, products and orders describe every state change as an event. Once a
//! change is committed, the infrastructure layer wraps the event in an
//! [`EventEnvelope`] and publishes it on an [`EventBus`] for auditing and other
//! downstream consumers.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
