//! Process configuration read from the environment.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use vault_redemption::CheckoutMode;

use crate::store::{InMemoryVaultStore, PostgresVaultStore, SharedStore, StoreError};

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set when VAULT_STORE=postgres")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultConfig {
    pub store: StoreBackend,
    pub checkout_mode: CheckoutMode,
}

impl VaultConfig {
    /// Read `VAULT_STORE`, `DATABASE_URL`, `VAULT_DB_MAX_CONNECTIONS` and
    /// `VAULT_CHECKOUT_MODE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let store = match get("VAULT_STORE").as_deref().map(str::trim) {
            None | Some("memory") => StoreBackend::Memory,
            Some("postgres") => {
                let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
                let max_connections = match get("VAULT_DB_MAX_CONNECTIONS") {
                    None => DEFAULT_MAX_CONNECTIONS,
                    Some(raw) => raw
                        .trim()
                        .parse::<u32>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or(ConfigError::Invalid {
                            name: "VAULT_DB_MAX_CONNECTIONS",
                            value: raw,
                        })?,
                };
                StoreBackend::Postgres {
                    database_url,
                    max_connections,
                }
            }
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "VAULT_STORE",
                    value: other.to_string(),
                });
            }
        };

        let checkout_mode = match get("VAULT_CHECKOUT_MODE") {
            None => CheckoutMode::default(),
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                name: "VAULT_CHECKOUT_MODE",
                value: raw,
            })?,
        };

        Ok(Self {
            store,
            checkout_mode,
        })
    }

    /// Open the configured store. Postgres stores are migrated before use.
    pub async fn open_store(&self) -> Result<SharedStore, StoreError> {
        match &self.store {
            StoreBackend::Memory => {
                info!("using in-memory store");
                Ok(Arc::new(InMemoryVaultStore::new()))
            }
            StoreBackend::Postgres {
                database_url,
                max_connections,
            } => {
                let store = PostgresVaultStore::connect(database_url, *max_connections).await?;
                store.migrate().await?;
                info!(max_connections, "using postgres store");
                Ok(Arc::new(store))
            }
        }
    }
}
