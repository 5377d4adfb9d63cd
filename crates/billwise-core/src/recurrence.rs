//! Recurrence detection
//!
//! Decides whether one merchant group's charges recur on a canonical period
//! (weekly, monthly, quarterly, yearly) with a stable amount.

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::DetectionConfig;
use crate::models::{Frequency, Transaction};

/// A confirmed recurring pattern
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrencePattern {
    pub frequency: Frequency,
    /// Latest stable charge (positive magnitude)
    pub amount: Decimal,
    pub first_seen: NaiveDate,
    pub last_seen: NaiveDate,
    pub next_renewal: NaiveDate,
    /// Contributing transactions, oldest first
    pub transaction_ids: Vec<String>,
    /// Backed by a single gap between two charges
    pub weak_signal: bool,
    /// Mean relative distance of the in-band gaps from the period
    pub mean_deviation: f64,
}

/// Allowed distance in days from a canonical period
pub fn tolerance_days(period: f64, config: &DetectionConfig) -> f64 {
    (period * config.period_tolerance_fraction).max(config.period_tolerance_min_days)
}

/// Whether a day gap is one period of `frequency`
pub fn gap_matches(gap_days: i64, frequency: Frequency, config: &DetectionConfig) -> bool {
    match frequency.period_days() {
        Some(period) => (gap_days as f64 - period).abs() <= tolerance_days(period, config),
        None => false,
    }
}

/// Whether a day distance is a whole number (k >= 1) of periods
pub fn matches_period_multiple(
    distance_days: i64,
    frequency: Frequency,
    config: &DetectionConfig,
) -> bool {
    let Some(period) = frequency.period_days() else {
        return false;
    };
    let distance = distance_days.abs() as f64;
    let k = (distance / period).round().max(1.0);
    (distance - k * period).abs() <= tolerance_days(period, config)
}

/// Whole periods between two dates, rounded
pub fn periods_between(from: NaiveDate, to: NaiveDate, frequency: Frequency) -> Option<i64> {
    let period = frequency.period_days()?;
    Some(((to - from).num_days() as f64 / period).round() as i64)
}

/// Next renewal after `last_seen`, skipped forward past `as_of`
///
/// Unknown frequencies renew monthly.
pub fn project_renewal(frequency: Frequency, last_seen: NaiveDate, as_of: NaiveDate) -> NaiveDate {
    let frequency = match frequency {
        Frequency::Unknown => Frequency::Monthly,
        known => known,
    };

    let mut periods = 1;
    let mut next = frequency.advance_by(last_seen, periods).unwrap_or(last_seen);
    while next < as_of {
        periods += 1;
        match frequency.advance_by(last_seen, periods) {
            Some(date) => next = date,
            None => break,
        }
    }
    next
}

/// Median of decimal values
pub fn median(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort();

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / Decimal::TWO)
    } else {
        Some(sorted[mid])
    }
}

/// Round a score to a fixed number of decimal places
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Whether `amount` lies within the relative tolerance of `baseline`
pub fn within_tolerance(amount: Decimal, baseline: Decimal, tolerance: f64) -> bool {
    if baseline.is_zero() {
        return amount.is_zero();
    }
    let drift = ((amount - baseline) / baseline).abs();
    drift.to_f64().is_some_and(|d| d <= tolerance + f64::EPSILON)
}

/// Drop same-amount repeats inside the duplicate window, keeping the first
fn collapse_duplicates<'a>(
    charges: &[&'a Transaction],
    config: &DetectionConfig,
) -> Vec<&'a Transaction> {
    let mut kept: Vec<&Transaction> = Vec::with_capacity(charges.len());
    for &tx in charges {
        let repeat = kept.last().is_some_and(|prev| {
            prev.charge() == tx.charge()
                && (tx.date - prev.date).num_days() <= config.duplicate_window_days
        });
        if !repeat {
            kept.push(tx);
        }
    }
    kept
}

/// Split chronological charges into runs at a steady price
fn price_runs<'a>(charges: &[&'a Transaction], config: &DetectionConfig) -> Vec<Vec<&'a Transaction>> {
    let mut runs: Vec<Vec<&Transaction>> = Vec::new();
    for &tx in charges {
        let steady = runs
            .last()
            .is_some_and(|run| within_tolerance(tx.charge(), run[0].charge(), config.amount_tolerance));
        match runs.last_mut() {
            Some(run) if steady => run.push(tx),
            _ => runs.push(vec![tx]),
        }
    }
    runs
}

/// Keep charges within tolerance of the median, allowing one stray
///
/// A history made of steady runs (a price change) is kept whole when every
/// run has at least two charges.
fn stable_charges<'a>(
    charges: Vec<&'a Transaction>,
    config: &DetectionConfig,
) -> Option<Vec<&'a Transaction>> {
    let amounts: Vec<Decimal> = charges.iter().map(|tx| tx.charge()).collect();
    let baseline = median(&amounts)?;

    let (stable, outliers): (Vec<&Transaction>, Vec<&Transaction>) = charges
        .iter()
        .copied()
        .partition(|tx| within_tolerance(tx.charge(), baseline, config.amount_tolerance));

    match outliers.len() {
        0 => return Some(stable),
        1 if stable.len() >= 2 => {
            debug!(
                "Dropping stray charge {} of {} from '{}'",
                outliers[0].id,
                outliers[0].charge(),
                outliers[0].merchant_key
            );
            return Some(stable);
        }
        _ => {}
    }

    let runs = price_runs(&charges, config);
    if runs.len() >= 2 && runs.iter().all(|run| run.len() >= 2) {
        debug!(
            "Charges at '{}' changed price {} time(s)",
            charges[0].merchant_key,
            runs.len() - 1
        );
        return Some(charges);
    }
    None
}

struct Candidate {
    frequency: Frequency,
    mean_deviation: f64,
}

fn evaluate(gaps: &[i64], frequency: Frequency, config: &DetectionConfig) -> Option<Candidate> {
    let period = frequency.period_days()?;
    let in_band: Vec<bool> = gaps
        .iter()
        .map(|gap| gap_matches(*gap, frequency, config))
        .collect();

    let accepted = if gaps.len() == 1 {
        in_band[0]
    } else {
        let consecutive = in_band.windows(2).any(|w| w[0] && w[1]);
        let share = in_band.iter().filter(|b| **b).count() as f64 / gaps.len() as f64;
        consecutive && share >= config.min_gap_consistency
    };
    if !accepted {
        return None;
    }

    let deviations: Vec<f64> = gaps
        .iter()
        .zip(&in_band)
        .filter(|(_, ok)| **ok)
        .map(|(gap, _)| (*gap as f64 - period).abs() / period)
        .collect();
    Some(Candidate {
        frequency,
        mean_deviation: deviations.iter().sum::<f64>() / deviations.len() as f64,
    })
}

/// Detect a recurring pattern in one merchant group
///
/// `charges` may be in any order and may include credits; only outgoing
/// payments are considered. Returns `None` for non-recurring groups.
pub fn detect(
    charges: &[&Transaction],
    as_of: NaiveDate,
    config: &DetectionConfig,
) -> Option<RecurrencePattern> {
    let mut outgoing: Vec<&Transaction> = charges
        .iter()
        .copied()
        .filter(|tx| tx.is_outgoing())
        .collect();
    outgoing.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));

    let collapsed = collapse_duplicates(&outgoing, config);
    if collapsed.len() < 2 {
        return None;
    }

    let stable = stable_charges(collapsed, config)?;
    let gaps: Vec<i64> = stable
        .windows(2)
        .map(|w| (w[1].date - w[0].date).num_days())
        .collect();

    let best = Frequency::CANONICAL
        .iter()
        .filter_map(|freq| evaluate(&gaps, *freq, config))
        .min_by(|a, b| a.mean_deviation.total_cmp(&b.mean_deviation))?;

    let first = stable.first()?;
    let last = stable.last()?;
    let pattern = RecurrencePattern {
        frequency: best.frequency,
        amount: last.charge(),
        first_seen: first.date,
        last_seen: last.date,
        next_renewal: project_renewal(best.frequency, last.date, as_of),
        transaction_ids: stable.iter().map(|tx| tx.id.clone()).collect(),
        weak_signal: stable.len() == 2,
        mean_deviation: best.mean_deviation,
    };

    debug!(
        "Recurring {} charge of {} at '{}' ({} charges{})",
        pattern.frequency,
        pattern.amount,
        last.merchant_key,
        stable.len(),
        if pattern.weak_signal { ", weak" } else { "" }
    );
    Some(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn charge(id: &str, on: NaiveDate, amount: Decimal) -> Transaction {
        Transaction {
            id: id.to_string(),
            bank_account: "Primary Account".to_string(),
            date: on,
            amount: -amount,
            description: "NETFLIX".to_string(),
            merchant_key: "netflix".to_string(),
            reference: None,
            row: 0,
        }
    }

    fn detect_all(txs: &[Transaction], as_of: NaiveDate) -> Option<RecurrencePattern> {
        let refs: Vec<&Transaction> = txs.iter().collect();
        detect(&refs, as_of, &DetectionConfig::default())
    }

    #[test]
    fn test_monthly_on_the_first() {
        let txs = vec![
            charge("a", date(2024, 1, 1), dec!(499)),
            charge("b", date(2024, 2, 1), dec!(499)),
            charge("c", date(2024, 3, 1), dec!(499)),
        ];

        let pattern = detect_all(&txs, date(2024, 3, 1)).unwrap();
        assert_eq!(pattern.frequency, Frequency::Monthly);
        assert_eq!(pattern.amount, dec!(499));
        assert_eq!(pattern.first_seen, date(2024, 1, 1));
        assert_eq!(pattern.last_seen, date(2024, 3, 1));
        assert_eq!(pattern.next_renewal, date(2024, 4, 1));
        assert!(!pattern.weak_signal);
        assert_eq!(pattern.transaction_ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_weekly_exact_period() {
        let txs: Vec<Transaction> = (0..4)
            .map(|i| {
                let on = date(2024, 1, 1) + chrono::Duration::days(7 * i);
                charge(&format!("w{}", i), on, dec!(50))
            })
            .collect();

        let pattern = detect_all(&txs, date(2024, 1, 22)).unwrap();
        assert_eq!(pattern.frequency, Frequency::Weekly);
        assert_eq!(pattern.next_renewal, date(2024, 1, 29));
        assert_eq!(pattern.mean_deviation, 0.0);
    }

    #[test]
    fn test_two_charges_are_a_weak_signal() {
        let txs = vec![
            charge("a", date(2023, 3, 10), dec!(1200)),
            charge("b", date(2024, 3, 9), dec!(1200)),
        ];

        let pattern = detect_all(&txs, date(2024, 3, 9)).unwrap();
        assert_eq!(pattern.frequency, Frequency::Yearly);
        assert!(pattern.weak_signal);
    }

    #[test]
    fn test_renewal_skips_past_periods() {
        let txs = vec![
            charge("a", date(2024, 1, 15), dec!(10)),
            charge("b", date(2024, 2, 15), dec!(10)),
            charge("c", date(2024, 3, 15), dec!(10)),
        ];

        let pattern = detect_all(&txs, date(2024, 6, 1)).unwrap();
        assert_eq!(pattern.next_renewal, date(2024, 6, 15));
        assert!(pattern.last_seen <= pattern.next_renewal);
    }

    #[test]
    fn test_unstable_amounts_disqualify() {
        let txs = vec![
            charge("a", date(2024, 1, 1), dec!(40)),
            charge("b", date(2024, 2, 1), dec!(55)),
            charge("c", date(2024, 3, 1), dec!(72)),
        ];
        assert!(detect_all(&txs, date(2024, 3, 1)).is_none());
    }

    #[test]
    fn test_single_stray_amount_is_tolerated() {
        let txs = vec![
            charge("a", date(2024, 1, 1), dec!(499)),
            charge("b", date(2024, 2, 1), dec!(499)),
            charge("x", date(2024, 2, 14), dec!(35)),
            charge("c", date(2024, 3, 1), dec!(499)),
        ];

        let pattern = detect_all(&txs, date(2024, 3, 1)).unwrap();
        assert_eq!(pattern.frequency, Frequency::Monthly);
        assert_eq!(pattern.transaction_ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_irregular_gaps_are_not_recurring() {
        let txs = vec![
            charge("a", date(2024, 1, 1), dec!(20)),
            charge("b", date(2024, 1, 19), dec!(20)),
            charge("c", date(2024, 3, 30), dec!(20)),
        ];
        assert!(detect_all(&txs, date(2024, 3, 30)).is_none());
    }

    #[test]
    fn test_duplicates_inside_window_do_not_form_a_pattern() {
        let txs = vec![
            charge("a", date(2024, 1, 1), dec!(199)),
            charge("b", date(2024, 1, 2), dec!(199)),
        ];
        assert!(detect_all(&txs, date(2024, 1, 2)).is_none());
    }

    #[test]
    fn test_credits_are_ignored() {
        let mut refund = charge("r", date(2024, 1, 20), dec!(499));
        refund.amount = dec!(499);
        let txs = vec![
            charge("a", date(2024, 1, 1), dec!(499)),
            refund,
            charge("b", date(2024, 2, 1), dec!(499)),
            charge("c", date(2024, 3, 1), dec!(499)),
        ];

        let pattern = detect_all(&txs, date(2024, 3, 1)).unwrap();
        assert_eq!(pattern.transaction_ids.len(), 3);
    }

    #[test]
    fn test_matches_period_multiple() {
        let config = DetectionConfig::default();
        assert!(matches_period_multiple(31, Frequency::Monthly, &config));
        assert!(matches_period_multiple(61, Frequency::Monthly, &config));
        assert!(matches_period_multiple(-29, Frequency::Monthly, &config));
        assert!(!matches_period_multiple(45, Frequency::Monthly, &config));
        assert!(!matches_period_multiple(1, Frequency::Monthly, &config));
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[dec!(3), dec!(1), dec!(2)]), Some(dec!(2)));
        assert_eq!(median(&[dec!(1), dec!(2), dec!(3), dec!(4)]), Some(dec!(2.5)));
    }

    fn series(dates: &[NaiveDate], amount: Decimal) -> Vec<Transaction> {
        dates
            .iter()
            .enumerate()
            .map(|(i, on)| charge(&format!("t{}", i), *on, amount))
            .collect()
    }

    #[test]
    fn test_quarterly_exact_periods() {
        // 91 days apart
        let txs = series(&[date(2024, 1, 15), date(2024, 4, 15), date(2024, 7, 15)], dec!(45));
        let pattern = detect_all(&txs, date(2024, 7, 15)).unwrap();
        assert_eq!(pattern.frequency, Frequency::Quarterly);
        assert_eq!(pattern.next_renewal, date(2024, 10, 15));
        assert!(!pattern.weak_signal);

        // 90 days apart
        let start = date(2024, 1, 1);
        let dates: Vec<NaiveDate> = (0..3).map(|i| start + chrono::Duration::days(90 * i)).collect();
        let pattern = detect_all(&series(&dates, dec!(45)), dates[2]).unwrap();
        assert_eq!(pattern.frequency, Frequency::Quarterly);
        assert_eq!(pattern.last_seen, date(2024, 6, 29));
        assert_eq!(pattern.next_renewal, date(2024, 9, 29));
    }

    #[test]
    fn test_quarterly_renewal_clamps_to_month_end() {
        let txs = series(&[date(2023, 8, 31), date(2023, 11, 30), date(2024, 2, 29)], dec!(30));
        let pattern = detect_all(&txs, date(2024, 2, 29)).unwrap();
        assert_eq!(pattern.frequency, Frequency::Quarterly);
        assert_eq!(pattern.next_renewal, date(2024, 5, 29));

        let late = date(2023, 11, 30);
        assert_eq!(project_renewal(Frequency::Quarterly, late, late), date(2024, 2, 29));
    }

    #[test]
    fn test_yearly_with_three_charges() {
        let txs = series(&[date(2021, 6, 10), date(2022, 6, 10), date(2023, 6, 10)], dec!(99));
        let pattern = detect_all(&txs, date(2023, 6, 10)).unwrap();
        assert_eq!(pattern.frequency, Frequency::Yearly);
        assert_eq!(pattern.next_renewal, date(2024, 6, 10));
        assert!(!pattern.weak_signal);

        let pattern = detect_all(&txs, date(2024, 7, 1)).unwrap();
        assert_eq!(pattern.next_renewal, date(2025, 6, 10));
    }

    #[test]
    fn test_yearly_renewal_after_leap_day() {
        let txs = series(&[date(2022, 2, 28), date(2023, 2, 28), date(2024, 2, 29)], dec!(120));
        let pattern = detect_all(&txs, date(2024, 2, 29)).unwrap();
        assert_eq!(pattern.frequency, Frequency::Yearly);
        assert_eq!(pattern.next_renewal, date(2025, 2, 28));
    }

    #[test]
    fn test_monthly_renewal_clamps_to_month_end() {
        let txs = series(&[date(2023, 11, 30), date(2023, 12, 31), date(2024, 1, 31)], dec!(12));
        let pattern = detect_all(&txs, date(2024, 1, 31)).unwrap();
        assert_eq!(pattern.frequency, Frequency::Monthly);
        assert_eq!(pattern.next_renewal, date(2024, 2, 29));
    }

    #[test]
    fn test_price_step_keeps_whole_history() {
        let mut txs = series(&[date(2024, 1, 1), date(2024, 2, 1), date(2024, 3, 1)], dec!(499));
        txs.extend(vec![
            charge("n1", date(2024, 4, 1), dec!(599)),
            charge("n2", date(2024, 5, 1), dec!(599)),
            charge("n3", date(2024, 6, 1), dec!(599)),
        ]);

        let pattern = detect_all(&txs, date(2024, 6, 1)).unwrap();
        assert_eq!(pattern.frequency, Frequency::Monthly);
        assert_eq!(pattern.amount, dec!(599));
        assert_eq!(pattern.first_seen, date(2024, 1, 1));
        assert_eq!(pattern.transaction_ids.len(), 6);
    }
}
