//! Subscription command implementations

use anyhow::{Context, Result};
use billwise_core::{Engine, SubscriptionStatus};
use chrono::NaiveDate;

use super::{print_json, truncate};

fn status_icon(status: SubscriptionStatus) -> &'static str {
    match status {
        SubscriptionStatus::Active => "✅",
        SubscriptionStatus::Cancelled => "❌",
    }
}

pub fn cmd_subscriptions_list(engine: &Engine, account: &str, json: bool) -> Result<()> {
    let subscriptions = engine.list_subscriptions(account)?;
    if json {
        return print_json(&subscriptions);
    }

    if subscriptions.is_empty() {
        println!("No subscriptions detected yet. Run:");
        println!("  billwise import --file statement.csv");
        return Ok(());
    }

    println!();
    println!("📋 Subscriptions for '{}'", account);
    println!("   ─────────────────────────────────────────────────────────────");

    for sub in subscriptions {
        println!(
            "   {} {:>4} {:24} │ {:>9}/{:<9} │ last {} │ next {}",
            status_icon(sub.status),
            sub.id,
            truncate(&sub.name, 24),
            format!("{:.2}", sub.amount),
            sub.frequency.as_str(),
            sub.last_seen,
            sub.next_renewal
        );
    }

    Ok(())
}

pub fn cmd_subscriptions_show(
    engine: &Engine,
    account: &str,
    id: i64,
    as_of: NaiveDate,
    json: bool,
) -> Result<()> {
    let detail = engine
        .get_subscription(account, id, as_of)
        .with_context(|| format!("Subscription {} not found in '{}'", id, account))?;
    if json {
        return print_json(&detail);
    }

    let sub = &detail.subscription;
    println!();
    println!("{} {} (ID: {})", status_icon(sub.status), sub.name, sub.id);
    println!("   Amount:       {:.2} {}", sub.amount, sub.frequency);
    println!("   Account:      {}", sub.bank_account);
    println!("   First seen:   {}", sub.first_seen);
    println!("   Last seen:    {}", sub.last_seen);
    println!("   Next renewal: {}", sub.next_renewal);
    if let Some(p) = sub.cancellation_probability {
        println!("   Lapse risk:   {:.0}%", p * 100.0);
    }
    if sub.weak_signal {
        println!("   Detected from only two charges");
    }
    if let Some(on) = sub.cancelled_on {
        println!("   Cancelled on: {}", on);
    }

    println!();
    println!("   Charges:");
    for tx in &detail.charges {
        println!(
            "     {} {:>10} {}",
            tx.date,
            format!("{:.2}", tx.amount),
            truncate(&tx.description, 40)
        );
    }

    if let Some(insight) = &detail.insight {
        println!();
        for line in insight.lines() {
            println!("   💡 {}", line);
        }
    }

    Ok(())
}

pub fn cmd_subscriptions_cancel(
    engine: &Engine,
    account: &str,
    id: i64,
    on: NaiveDate,
    json: bool,
) -> Result<()> {
    let sub = engine
        .cancel_subscription(account, id, on)
        .with_context(|| format!("Failed to cancel subscription {}", id))?;
    if json {
        return print_json(&sub);
    }

    println!("✅ Subscription cancelled (ID: {}) as of {}", sub.id, on);
    println!("   Any further {} charge will be flagged", sub.name);
    Ok(())
}
