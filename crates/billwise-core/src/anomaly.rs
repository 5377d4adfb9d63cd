//! Anomaly detection
//!
//! Scans each merchant group of an account snapshot for price jumps,
//! duplicate charges, charges that should not be there and resumed billing
//! after a gap. Anomalies are recomputed on every run.

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::DetectionConfig;
use crate::ledger::AccountState;
use crate::merchant::display_name;
use crate::models::{Anomaly, AnomalyType, Subscription, Transaction};
use crate::recurrence::{median, periods_between, round_to, tolerance_days, within_tolerance};

/// Map a non-negative deviation onto [0, 1)
///
/// Monotonic, and exactly 0.5 at the configured half point.
pub fn risk_score(deviation: f64, config: &DetectionConfig) -> f64 {
    if !deviation.is_finite() || deviation <= 0.0 {
        return 0.0;
    }
    round_to(deviation / (deviation + config.risk_half_point), 4)
}

fn ratio(numerator: Decimal, denominator: Decimal) -> f64 {
    if denominator.is_zero() {
        return 0.0;
    }
    (numerator / denominator).to_f64().unwrap_or(0.0)
}

/// One merchant group with the subscription it is tied to, if any
struct GroupView<'a> {
    bank_account: &'a str,
    merchant_key: &'a str,
    charges: Vec<&'a Transaction>,
    subscription: Option<&'a Subscription>,
}

impl GroupView<'_> {
    fn name(&self) -> String {
        self.subscription
            .map(|s| s.name.clone())
            .unwrap_or_else(|| display_name(self.merchant_key))
    }

    fn anomaly(
        &self,
        anomaly_type: AnomalyType,
        description: String,
        risk_score: f64,
        detected_on: NaiveDate,
        transaction_ids: Vec<String>,
    ) -> Anomaly {
        Anomaly {
            subscription_id: self.subscription.map(|s| s.id),
            anomaly_type,
            description,
            risk_score,
            merchant_key: self.merchant_key.to_string(),
            bank_account: self.bank_account.to_string(),
            detected_on,
            transaction_ids,
        }
    }
}

/// Latest price step in a chronological series
///
/// Returns the baseline the series held before the step and the charges at
/// the new price. `full_window` requires the baseline to be steady across the
/// whole lookback window rather than just the run right before the step.
fn price_step<'a>(
    series: &[&'a Transaction],
    full_window: bool,
    config: &DetectionConfig,
) -> Option<(Decimal, Vec<&'a Transaction>)> {
    let latest = series.last()?;
    let split = series
        .iter()
        .rposition(|tx| !within_tolerance(tx.charge(), latest.charge(), config.amount_tolerance))?;
    let (before, after) = series.split_at(split + 1);
    let anchor = before.last()?;

    let window = before.len().min(config.baseline_window);
    let prior: Vec<Decimal> = before
        .iter()
        .rev()
        .take(window)
        .take_while(|tx| within_tolerance(tx.charge(), anchor.charge(), config.amount_tolerance))
        .map(|tx| tx.charge())
        .collect();
    if full_window && prior.len() < window {
        return None;
    }

    let baseline = median(&prior)?;
    Some((baseline, after.to_vec()))
}

/// A subscription's charges plus anything from the merchant that arrived
/// after it and is not yet attributed
fn subscription_series<'a>(
    state: &'a AccountState,
    group: &GroupView<'a>,
    subscription: &Subscription,
) -> Vec<&'a Transaction> {
    let attributed = state.attributed_ids();
    let mut series = state.charges_of(subscription);
    series.extend(
        group
            .charges
            .iter()
            .copied()
            .filter(|tx| tx.date > subscription.last_seen && !attributed.contains(&tx.id)),
    );
    series.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
    series
}

fn price_increase(
    group: &GroupView,
    series: &[&Transaction],
    full_window: bool,
    config: &DetectionConfig,
) -> Option<Anomaly> {
    let (baseline, changed) = price_step(series, full_window, config)?;
    let (first, latest) = (changed.first()?, changed.last()?);

    let increase = ratio(latest.charge() - baseline, baseline);
    if increase <= config.price_increase_threshold {
        return None;
    }

    Some(group.anomaly(
        AnomalyType::PriceIncrease,
        format!(
            "{} charged {} on {}, up {:.0}% from a usual {}",
            group.name(),
            first.charge().round_dp(2),
            first.date,
            increase * 100.0,
            baseline.round_dp(2)
        ),
        risk_score(increase, config),
        first.date,
        changed.iter().map(|tx| tx.id.clone()).collect(),
    ))
}

fn duplicate_charges(group: &GroupView, config: &DetectionConfig) -> Vec<Anomaly> {
    let window = config.duplicate_window_days;
    let mut found = Vec::new();
    let mut flagged: Vec<&str> = Vec::new();

    for (j, later) in group.charges.iter().enumerate() {
        let earlier = group.charges[..j].iter().rev().find(|tx| {
            tx.charge() == later.charge()
                && (later.date - tx.date).num_days() <= window
                && !flagged.contains(&tx.id.as_str())
        });
        let Some(earlier) = earlier else {
            continue;
        };

        let gap = (later.date - earlier.date).num_days();
        let deviation = 1.0 + (window - gap) as f64 / (window + 1) as f64;
        flagged.push(later.id.as_str());
        found.push(group.anomaly(
            AnomalyType::DuplicateCharge,
            format!(
                "{} charged {} twice within {} day(s) ({} and {})",
                group.name(),
                later.charge().round_dp(2),
                gap,
                earlier.date,
                later.date
            ),
            risk_score(deviation, config),
            later.date,
            vec![earlier.id.clone(), later.id.clone()],
        ));
    }
    found
}

/// Charges arriving after the user cancelled
fn charges_after_cancellation(
    group: &GroupView,
    cancelled: &[&Subscription],
    config: &DetectionConfig,
) -> Vec<Anomaly> {
    cancelled
        .iter()
        .filter_map(|sub| {
            let charge = group.charges.iter().find(|tx| tx.date > sub.last_seen)?;
            let deviation = ratio(charge.charge(), sub.amount);
            Some(group.anomaly(
                AnomalyType::UnexpectedCharge,
                format!(
                    "{} charged {} on {} after you cancelled it",
                    sub.name,
                    charge.charge().round_dp(2),
                    charge.date
                ),
                risk_score(deviation, config),
                charge.date,
                vec![charge.id.clone()],
            ))
        })
        .collect()
}

/// A large first charge from a merchant with no recurring history
fn large_first_charge(
    group: &GroupView,
    account_median: Decimal,
    config: &DetectionConfig,
) -> Option<Anomaly> {
    let first = group.charges.first()?;
    let multiple = ratio(first.charge(), account_median);
    if multiple < config.unexpected_charge_ratio {
        return None;
    }

    Some(group.anomaly(
        AnomalyType::UnexpectedCharge,
        format!(
            "First charge of {} from {} is {:.1}x your typical payment",
            first.charge().round_dp(2),
            group.name(),
            multiple
        ),
        risk_score(multiple - 1.0, config),
        first.date,
        vec![first.id.clone()],
    ))
}

/// Gaps of two or more periods between a subscription's charges
fn missed_periods(
    group: &GroupView,
    subscription: &Subscription,
    charges: &[&Transaction],
    config: &DetectionConfig,
) -> Vec<Anomaly> {
    let Some(period) = subscription.frequency.period_days() else {
        return Vec::new();
    };
    let limit = period + tolerance_days(period, config);

    charges
        .windows(2)
        .filter_map(|pair| {
            let (before, after) = (pair[0], pair[1]);
            let gap = (after.date - before.date).num_days();
            let periods = periods_between(before.date, after.date, subscription.frequency)?;
            if (gap as f64) <= limit || periods < 2 {
                return None;
            }

            let skipped = periods - 1;
            Some(Anomaly {
                subscription_id: Some(subscription.id),
                ..group.anomaly(
                    AnomalyType::MissedThenResumed,
                    format!(
                        "{} skipped {} {} charge(s) after {} and resumed on {}",
                        subscription.name, skipped, subscription.frequency, before.date, after.date
                    ),
                    risk_score(skipped as f64, config),
                    after.date,
                    vec![before.id.clone(), after.id.clone()],
                )
            })
        })
        .collect()
}

/// Detect anomalies across every merchant group of an account
///
/// Ordered by risk (highest first), then most recent, then type and merchant.
pub fn detect_anomalies(state: &AccountState, config: &DetectionConfig) -> Vec<Anomaly> {
    let outgoing: Vec<Decimal> = state
        .transactions
        .values()
        .filter(|tx| tx.is_outgoing())
        .map(|tx| tx.charge())
        .collect();
    let account_median = median(&outgoing).unwrap_or(Decimal::ZERO);

    let mut anomalies = Vec::new();
    for ((bank_account, merchant_key), txs) in state.groups() {
        let charges: Vec<&Transaction> = txs.into_iter().filter(|tx| tx.is_outgoing()).collect();
        if charges.is_empty() {
            continue;
        }

        let subs: Vec<&Subscription> = state
            .subscriptions
            .iter()
            .filter(|s| s.bank_account == bank_account && s.merchant_key == merchant_key)
            .collect();
        let active = subs.iter().copied().find(|s| s.is_active());
        let cancelled: Vec<&Subscription> =
            subs.iter().copied().filter(|s| !s.is_active()).collect();

        let group = GroupView {
            bank_account,
            merchant_key,
            charges,
            subscription: active.or_else(|| cancelled.last().copied()),
        };

        // An active subscription is judged against its own steady charges
        match active {
            Some(sub) => {
                let series = subscription_series(state, &group, sub);
                anomalies.extend(price_increase(&group, &series, false, config));
            }
            None => anomalies.extend(price_increase(&group, &group.charges, true, config)),
        }
        anomalies.extend(duplicate_charges(&group, config));

        if subs.is_empty() {
            anomalies.extend(large_first_charge(&group, account_median, config));
        } else {
            anomalies.extend(charges_after_cancellation(&group, &cancelled, config));
        }

        for sub in &subs {
            let sub_charges = state.charges_of(sub);
            anomalies.extend(missed_periods(&group, sub, &sub_charges, config));
        }
    }

    anomalies.sort_by(|a, b| {
        b.risk_score
            .total_cmp(&a.risk_score)
            .then_with(|| b.detected_on.cmp(&a.detected_on))
            .then_with(|| a.anomaly_type.cmp(&b.anomaly_type))
            .then_with(|| a.merchant_key.cmp(&b.merchant_key))
    });

    debug!(
        "Detected {} anomalies for '{}' at version {}",
        anomalies.len(),
        state.account,
        state.version
    );
    anomalies
}
