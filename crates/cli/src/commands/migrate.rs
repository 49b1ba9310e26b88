//! Schema migration.

use vault_infra::{PostgresVaultStore, StoreBackend, VaultConfig};

pub async fn run(config: &VaultConfig) -> anyhow::Result<()> {
    match &config.store {
        StoreBackend::Memory => {
            tracing::info!("in-memory store selected; nothing to migrate");
        }
        StoreBackend::Postgres {
            database_url,
            max_connections,
        } => {
            tracing::info!("connecting to database...");
            let store = PostgresVaultStore::connect(database_url, *max_connections).await?;
            tracing::info!("applying schema...");
            store.migrate().await?;
            tracing::info!("schema up to date");
        }
    }
    Ok(())
}
