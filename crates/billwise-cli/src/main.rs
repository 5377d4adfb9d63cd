//! BillWise CLI - Recurring-charge detection
//!
//! Usage:
//!   billwise import --file CSV...     Import statements and detect subscriptions
//!   billwise subscriptions            List detected subscriptions
//!   billwise savings                  Monthly cost and potential savings
//!   billwise analyze                  Anomalies, savings and recommendations

mod cli;
mod commands;


use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::*;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    let engine = commands::open_engine(&cli.db, cli.config.as_deref())?;
    let account = cli.account.as_str();
    let json = cli.json;

    match cli.command {
        Commands::Import { file, sign, as_of } => {
            let sign = commands::parse_sign(&sign)?;
            let as_of = commands::parse_as_of(as_of.as_deref())?;
            commands::cmd_import(Arc::new(engine), account, &file, sign, as_of, json).await
        }
        Commands::Subscriptions { action } => match action {
            None | Some(SubscriptionsAction::List) => {
                commands::cmd_subscriptions_list(&engine, account, json)
            }
            Some(SubscriptionsAction::Show { id, as_of }) => {
                let as_of = commands::parse_as_of(as_of.as_deref())?;
                commands::cmd_subscriptions_show(&engine, account, id, as_of, json)
            }
            Some(SubscriptionsAction::Cancel { id, date }) => {
                let on = commands::parse_as_of(date.as_deref())?;
                commands::cmd_subscriptions_cancel(&engine, account, id, on, json)
            }
        },
        Commands::Savings => commands::cmd_savings(&engine, account, json),
        Commands::Recommendations { as_of } => {
            let as_of = commands::parse_as_of(as_of.as_deref())?;
            commands::cmd_recommendations(&engine, account, as_of, json)
        }
        Commands::Anomalies => commands::cmd_anomalies(&engine, account, json),
        Commands::Refresh { as_of } => {
            let as_of = commands::parse_as_of(as_of.as_deref())?;
            commands::cmd_refresh(&engine, account, as_of, json)
        }
        Commands::Analyze { as_of } => {
            let as_of = commands::parse_as_of(as_of.as_deref())?;
            commands::cmd_analyze(&engine, account, as_of, json)
        }
    }
}
