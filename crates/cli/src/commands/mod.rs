//! Subcommand implementations.

pub mod account;
pub mod migrate;
pub mod orders;
pub mod redeem;

use std::sync::Arc;

use serde_json::Value as JsonValue;

use vault_events::{EventEnvelope, InMemoryEventBus};
use vault_infra::{VaultConfig, VaultServices, VaultStore};
use vault_redemption::{Order, RedemptionError};

pub type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

/// Services wired to the configured store.
pub struct Context {
    pub services: VaultServices<dyn VaultStore, Bus>,
}

impl Context {
    pub async fn open(config: &VaultConfig) -> anyhow::Result<Self> {
        let store = config.open_store().await?;
        Ok(Self {
            services: VaultServices::new(store, Arc::new(InMemoryEventBus::new())),
        })
    }
}

/// Turn a redemption failure into an operator-facing error.
pub fn redemption_failed(err: RedemptionError) -> anyhow::Error {
    anyhow::anyhow!("{} [{}] ({err})", err.user_message(), err.code())
}

pub fn print_order(order: &Order) {
    println!(
        "order {} status={} total={}",
        order.id_typed(),
        order.status(),
        order.total()
    );
    for line in order.lines() {
        println!(
            "  {} x{} @ {} ({})",
            line.title, line.quantity, line.unit_price, line.product_id
        );
    }
}
