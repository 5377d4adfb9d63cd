//! CLI argument definitions using clap
//!
//! This module contains all the clap structs and enums for parsing CLI arguments.
//! The actual command implementations are in the `commands` module.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// BillWise - Find the subscriptions hiding in your bank statements
#[derive(Parser)]
#[command(name = "billwise")]
#[command(about = "Recurring-charge detection for bank statement exports", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Database path
    #[arg(long, default_value = "billwise.db", global = true)]
    pub db: PathBuf,

    /// Account the command operates on
    #[arg(short, long, default_value = "default", global = true)]
    pub account: String,

    /// Detection policy file (overrides BILLWISE_CONFIG and the data-dir config)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Import one or more CSV or Excel statements
    Import {
        /// Statement files to import (imported concurrently); .xlsx/.xls are
        /// read as spreadsheets, anything else as CSV
        #[arg(short, long, required = true, num_args = 1..)]
        file: Vec<PathBuf>,

        /// How the export signs payments: debits-negative or debits-positive
        #[arg(short, long, default_value = "debits-negative")]
        sign: String,

        /// Date to evaluate renewals against (YYYY-MM-DD, default today)
        #[arg(long)]
        as_of: Option<String>,
    },

    /// List, show or cancel detected subscriptions
    Subscriptions {
        #[command(subcommand)]
        action: Option<SubscriptionsAction>,
    },

    /// Monthly cost, avoidable spend and potential savings
    Savings,

    /// Ranked advice for subscriptions worth acting on
    Recommendations {
        /// Date to evaluate against (YYYY-MM-DD, default today)
        #[arg(long)]
        as_of: Option<String>,
    },

    /// Price jumps, duplicates and other irregular charges
    Anomalies,

    /// Re-project renewal dates and lapse probabilities
    Refresh {
        /// Date to evaluate against (YYYY-MM-DD, default today)
        #[arg(long)]
        as_of: Option<String>,
    },

    /// Anomalies, savings and recommendations from one consistent snapshot
    Analyze {
        /// Date to evaluate against (YYYY-MM-DD, default today)
        #[arg(long)]
        as_of: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum SubscriptionsAction {
    /// List subscriptions, active first
    List,

    /// Show one subscription with its charges
    Show {
        /// Subscription ID
        id: i64,

        /// Date to evaluate the insight against (YYYY-MM-DD, default today)
        #[arg(long)]
        as_of: Option<String>,
    },

    /// Mark a subscription as cancelled
    Cancel {
        /// Subscription ID
        id: i64,

        /// Cancellation date (YYYY-MM-DD, default today)
        #[arg(long)]
        date: Option<String>,
    },
}
