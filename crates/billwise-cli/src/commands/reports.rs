//! Report command implementations (savings, recommendations, anomalies, analyze)

use anyhow::Result;
use billwise_core::{Anomaly, Engine, Recommendation, RiskTier, SavingsSummary};
use chrono::NaiveDate;
use serde_json::json;

use super::{print_json, truncate};

fn tier_icon(tier: RiskTier) -> &'static str {
    match tier {
        RiskTier::High => "🔴",
        RiskTier::Medium => "🟠",
        RiskTier::Low => "🟢",
    }
}

fn print_savings(summary: &SavingsSummary) {
    println!();
    println!("💰 Monthly Subscription Spend");
    println!("   ─────────────────────────────────────");
    println!("   Total:             {:>10.2}", summary.total_monthly_cost);
    println!("   Avoidable:         {:>10.2}", summary.avoidable_spend);
    println!("   Potential savings: {:>10.2}", summary.potential_savings);
}

fn print_recommendations(recommendations: &[Recommendation]) {
    println!();
    if recommendations.is_empty() {
        println!("✨ Nothing to act on right now.");
        return;
    }
    println!("💡 Recommendations");
    println!("   ─────────────────────────────────────────────────────────────");
    for rec in recommendations {
        println!(
            "   {} [{:.2}] #{} {}",
            tier_icon(rec.risk_tier),
            rec.risk_score,
            rec.subscription_id,
            rec.recommendation_text
        );
    }
}

fn print_anomalies(anomalies: &[Anomaly]) {
    println!();
    if anomalies.is_empty() {
        println!("✨ No anomalies found.");
        return;
    }
    println!("⚠️  Anomalies");
    println!("   ─────────────────────────────────────────────────────────────");
    for anomaly in anomalies {
        println!(
            "   [{:.2}] {:18} {}",
            anomaly.risk_score,
            anomaly.anomaly_type.as_str(),
            truncate(&anomaly.description, 80)
        );
    }
}

pub fn cmd_savings(engine: &Engine, account: &str, json: bool) -> Result<()> {
    let summary = engine.savings_summary(account)?;
    if json {
        return print_json(&summary);
    }
    print_savings(&summary);
    Ok(())
}

pub fn cmd_recommendations(
    engine: &Engine,
    account: &str,
    as_of: NaiveDate,
    json: bool,
) -> Result<()> {
    let recommendations = engine.recommendations(account, as_of)?;
    if json {
        return print_json(&recommendations);
    }
    print_recommendations(&recommendations);
    Ok(())
}

pub fn cmd_anomalies(engine: &Engine, account: &str, json: bool) -> Result<()> {
    let anomalies = engine.anomalies(account)?;
    if json {
        return print_json(&anomalies);
    }
    print_anomalies(&anomalies);
    Ok(())
}

pub fn cmd_refresh(engine: &Engine, account: &str, as_of: NaiveDate, json: bool) -> Result<()> {
    let refreshed = engine.refresh(account, as_of)?;
    if json {
        return print_json(&json!({ "account": account, "as_of": as_of, "refreshed": refreshed }));
    }
    println!("🔄 Refreshed {} active subscription(s) as of {}", refreshed, as_of);
    Ok(())
}

pub fn cmd_analyze(engine: &Engine, account: &str, as_of: NaiveDate, json: bool) -> Result<()> {
    let report = engine.analyze(account, as_of)?;
    if json {
        return print_json(&report);
    }

    println!("📊 Analysis of '{}' (version {})", report.account, report.version);
    print_savings(&report.savings);
    print_anomalies(&report.anomalies);
    print_recommendations(&report.recommendations);
    Ok(())
}
