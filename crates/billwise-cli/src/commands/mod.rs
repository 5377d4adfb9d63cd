//! CLI command implementations
//!
//! Commands are organized by domain:
//! - `core` - Shared utilities (open_engine, argument parsing, JSON output)
//! - `import` - Concurrent CSV statement import
//! - `subscriptions` - Subscription list, detail and cancellation
//! - `reports` - Savings, recommendations, anomalies, refresh and analyze

pub mod core;
pub mod import;
pub mod reports;
pub mod subscriptions;

// Re-export command functions for main.rs
pub use core::*;
pub use import::*;
pub use reports::*;
pub use subscriptions::*;

/// Truncate a string to a maximum number of characters, adding "..." if truncated
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
