//! Founders Vault operator CLI.
//!
//! # Usage
//!
//! ```bash
//! # Apply the Postgres schema
//! vault migrate
//!
//! # Redeem two hoodies and a mug for an account
//! vault redeem --account <uuid> --item <product-uuid>:2 --item <product-uuid>:1
//!
//! # Preview the same redemption without committing it
//! vault redeem --account <uuid> --item <product-uuid>:2 --dry-run
//!
//! # Check out the account's saved cart
//! vault checkout --account <uuid> --mode per_line
//!
//! # Order administration
//! vault set-status --admin <uuid> --order <uuid> --status fulfilled
//! vault cancel --admin <uuid> --order <uuid>
//!
//! # Inspect an account and its orders
//! vault account --id <uuid>
//! ```
//!
//! Configuration comes from the environment (`VAULT_STORE`, `DATABASE_URL`,
//! `VAULT_DB_MAX_CONNECTIONS`, `VAULT_CHECKOUT_MODE`). The in-memory store
//! starts empty on every run, so the commands are meant for the Postgres store.

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};

use vault_core::{AccountId, OrderId};
use vault_infra::VaultConfig;
use vault_redemption::{CheckoutMode, OrderStatus, RedeemLine};

mod commands;

#[derive(Parser)]
#[command(name = "vault")]
#[command(author, version, about = "Founders Vault operator tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the database schema
    Migrate,
    /// Redeem products for an account
    Redeem {
        #[arg(long)]
        account: AccountId,

        /// `<product-id>:<quantity>`, repeatable
        #[arg(long = "item", required = true, value_parser = commands::redeem::parse_item)]
        items: Vec<RedeemLine>,

        /// Quote only; nothing is written
        #[arg(long)]
        dry_run: bool,
    },
    /// Redeem the account's saved cart
    Checkout {
        #[arg(long)]
        account: AccountId,

        /// `all_or_nothing` or `per_line`; defaults to `VAULT_CHECKOUT_MODE`
        #[arg(long)]
        mode: Option<CheckoutMode>,
    },
    /// Move a pending order to fulfilled, delivered or cancelled
    SetStatus {
        #[arg(long)]
        admin: AccountId,

        #[arg(long)]
        order: OrderId,

        #[arg(long)]
        status: OrderStatus,
    },
    /// Cancel a pending order, refunding credits and restocking products
    Cancel {
        #[arg(long)]
        admin: AccountId,

        #[arg(long)]
        order: OrderId,
    },
    /// Show an account with its orders
    Account {
        #[arg(long)]
        id: AccountId,
    },
}

#[tokio::main]
async fn main() {
    vault_observability::init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        tracing::error!("command failed: {e:#}");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = VaultConfig::from_env()?;

    if let Commands::Migrate = cli.command {
        return commands::migrate::run(&config).await;
    }

    let ctx = commands::Context::open(&config).await?;
    match cli.command {
        Commands::Migrate => {}
        Commands::Redeem {
            account,
            items,
            dry_run,
        } => commands::redeem::redeem(&ctx, account, items, dry_run).await?,
        Commands::Checkout { account, mode } => {
            let mode = mode.unwrap_or(config.checkout_mode);
            commands::redeem::checkout(&ctx, account, mode).await?;
        }
        Commands::SetStatus {
            admin,
            order,
            status,
        } => commands::orders::set_status(&ctx, admin, order, status).await?,
        Commands::Cancel { admin, order } => commands::orders::cancel(&ctx, admin, order).await?,
        Commands::Account { id } => commands::account::show(&ctx, id).await?,
    }
    Ok(())
}
