//! BillWise Core Library
//!
//! Recurring-charge detection over bank statement exports:
//! - Transaction normalization and CSV column discovery
//! - Merchant grouping with a per-account key registry
//! - Recurrence detection and the subscription ledger
//! - Anomaly scoring, savings metrics and recommendations
//! - SQLite persistence with connection pooling

pub mod anomaly;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod merchant;
pub mod models;
pub mod normalize;
pub mod recurrence;
pub mod savings;

pub use config::DetectionConfig;
pub use db::Database;
pub use engine::{AnalysisReport, Engine};
pub use error::{Error, FieldError, Result};
pub use ledger::{AccountState, Ledger, LedgerStore};
pub use merchant::{MerchantMatch, MerchantRegistry};
pub use models::*;
