//! Shopgauge CLI - Shopify API usage governor
//!
//! A command-line interface for inspecting plan limits, usage analytics and
//! notifications, and for running governed Admin API queries.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use shopgauge_core::services::governor::GovernorConfig;

#[derive(Parser)]
#[command(name = "shopgauge")]
#[command(author, version, about = "Shopify API usage governor CLI", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format: table (default) or json
    #[arg(long, global = true, default_value = "table")]
    format: output::OutputFormat,

    /// Suppress progress messages
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Enable debug-level logging
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Override database path (or set SHOPGAUGE_DB_PATH env var)
    #[arg(long, env = "SHOPGAUGE_DB_PATH", global = true)]
    db: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show and switch the Shopify plan
    Plan {
        #[command(subcommand)]
        action: commands::plan::PlanAction,
    },

    /// Usage analytics (summary, records, aggregates)
    Usage {
        #[command(subcommand)]
        action: commands::usage::UsageAction,
    },

    /// List and manage notifications
    Notifications {
        #[command(subcommand)]
        action: commands::notifications::NotificationsAction,
    },

    /// Run a GraphQL query through the governor
    Query(commands::query::QueryArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    // Set up database path if provided
    if let Some(db_path) = &cli.db {
        std::env::set_var(shopgauge_core::db::DB_PATH_ENV, db_path);
    }

    let db = shopgauge_core::Database::new().await?;

    let ctx = commands::Context {
        db,
        config: GovernorConfig::from_env().validate(),
        format: cli.format,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Plan { action } => commands::plan::execute(&ctx, action).await,
        Commands::Usage { action } => commands::usage::execute(&ctx, action).await,
        Commands::Notifications { action } => commands::notifications::execute(&ctx, action).await,
        Commands::Query(args) => commands::query::execute(&ctx, args).await,
    }
}
