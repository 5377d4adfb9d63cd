//! Savings analysis
//!
//! Portfolio-level spend metrics and per-subscription recommendations, derived
//! from the ledger's subscriptions and the anomaly detector's output.

use chrono::NaiveDate;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::config::DetectionConfig;
use crate::models::{
    Anomaly, AnomalyType, Recommendation, RiskTier, SavingsSummary, Subscription,
};
use crate::recurrence::round_to;

impl RiskTier {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.7 {
            Self::High
        } else if score >= 0.4 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Self::High => "Action needed: ",
            Self::Medium => "Worth a look: ",
            Self::Low => "",
        }
    }
}

fn anomalies_for<'a>(id: i64, anomalies: &'a [Anomaly]) -> impl Iterator<Item = &'a Anomaly> {
    anomalies
        .iter()
        .filter(move |a| a.subscription_id == Some(id))
}

/// Whether an active subscription counts towards avoidable spend
pub fn is_avoidable(
    subscription: &Subscription,
    anomalies: &[Anomaly],
    config: &DetectionConfig,
) -> bool {
    if !subscription.is_active() {
        return false;
    }
    let lapsed = subscription
        .cancellation_probability
        .is_some_and(|p| p >= config.avoidable_probability_threshold);
    lapsed
        || anomalies_for(subscription.id, anomalies)
            .any(|a| a.risk_score >= config.avoidable_risk_threshold)
}

/// Monthly totals over active subscriptions
///
/// Always `potential_savings <= avoidable_spend <= total_monthly_cost`.
pub fn savings_summary(
    subscriptions: &[Subscription],
    anomalies: &[Anomaly],
    config: &DetectionConfig,
) -> SavingsSummary {
    let mut total = Decimal::ZERO;
    let mut avoidable = Decimal::ZERO;

    for sub in subscriptions.iter().filter(|s| s.is_active()) {
        let monthly = sub.monthly_cost();
        total += monthly;
        if is_avoidable(sub, anomalies, config) {
            avoidable += monthly;
        }
    }

    let discount = Decimal::from_f64(config.savings_discount).unwrap_or(Decimal::ZERO);
    SavingsSummary {
        total_monthly_cost: total.round_dp(2),
        avoidable_spend: avoidable.round_dp(2),
        potential_savings: (avoidable * discount).round_dp(2),
    }
}

fn money(amount: Decimal) -> String {
    format!("{:.2}", amount.round_dp(2))
}

fn recommendation(subscription: &Subscription, risk: f64, text: String) -> Recommendation {
    let risk_score = round_to(risk.clamp(0.0, 1.0), 4);
    let risk_tier = RiskTier::from_score(risk_score);
    Recommendation {
        subscription_id: subscription.id,
        recommendation_text: format!("{}{}", risk_tier.prefix(), text),
        risk_score,
        risk_tier,
    }
}

fn anomaly_text(subscription: &Subscription, anomaly: &Anomaly) -> String {
    let name = &subscription.name;
    match anomaly.anomaly_type {
        AnomalyType::PriceIncrease => format!(
            "{}. Check whether your plan changed or move to a cheaper tier.",
            anomaly.description
        ),
        AnomalyType::DuplicateCharge => format!(
            "{}. Ask {} to refund the duplicate.",
            anomaly.description, name
        ),
        AnomalyType::UnexpectedCharge => format!(
            "{}. Dispute the charge with your bank if you did not authorize it.",
            anomaly.description
        ),
        AnomalyType::MissedThenResumed => format!(
            "{}. Make sure you meant to restart it.",
            anomaly.description
        ),
    }
}

/// Templated advice for every subscription with something to act on
///
/// Ordered by risk (highest first), then subscription id.
pub fn recommendations(
    subscriptions: &[Subscription],
    anomalies: &[Anomaly],
    as_of: NaiveDate,
    config: &DetectionConfig,
) -> Vec<Recommendation> {
    let total: Decimal = subscriptions
        .iter()
        .filter(|s| s.is_active())
        .map(Subscription::monthly_cost)
        .sum();

    let mut out = Vec::new();
    for sub in subscriptions {
        if sub.is_active() {
            if let Some(p) = sub
                .cancellation_probability
                .filter(|p| *p >= config.avoidable_probability_threshold)
            {
                let idle = (as_of - sub.last_seen).num_days().max(0);
                out.push(recommendation(
                    sub,
                    p,
                    format!(
                        "No {} charge for {} days (last on {}). If you no longer use it, cancel before {} to save {} a month.",
                        sub.name,
                        idle,
                        sub.last_seen,
                        sub.next_renewal,
                        money(sub.monthly_cost())
                    ),
                ));
            }
        }

        for anomaly in anomalies_for(sub.id, anomalies) {
            out.push(recommendation(sub, anomaly.risk_score, anomaly_text(sub, anomaly)));
        }

        if sub.is_active() && !total.is_zero() {
            let share = (sub.monthly_cost() / total).to_f64().unwrap_or(0.0);
            if share >= config.cost_share_threshold && share < 1.0 {
                out.push(recommendation(
                    sub,
                    share,
                    format!(
                        "{} is {:.0}% of your subscription spend ({} a month). Look for a cheaper plan or a bundle.",
                        sub.name,
                        share * 100.0,
                        money(sub.monthly_cost())
                    ),
                ));
            }
        }
    }

    out.sort_by(|a, b| {
        b.risk_score
            .total_cmp(&a.risk_score)
            .then_with(|| a.subscription_id.cmp(&b.subscription_id))
            .then_with(|| a.recommendation_text.cmp(&b.recommendation_text))
    });
    out
}

/// Advisory text for one subscription, if any recommendation targets it
pub fn insight_for(subscription_id: i64, recommendations: &[Recommendation]) -> Option<String> {
    let texts: Vec<&str> = recommendations
        .iter()
        .filter(|r| r.subscription_id == subscription_id)
        .map(|r| r.recommendation_text.as_str())
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    }
}
