//! Detection policy configuration
//!
//! Every tolerance and threshold the engine uses lives here so it can be tuned
//! without a rebuild.
//!
//! ## Configuration Resolution
//!
//! 1. Explicit path (CLI `--config`)
//! 2. `BILLWISE_CONFIG` environment variable
//! 3. Override in data dir (~/.local/share/billwise/config/detection.toml)
//! 4. Embedded defaults (compiled into binary)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Embedded default config (compiled into binary)
const DEFAULT_CONFIG: &str = include_str!("../../../config/detection.toml");

/// Environment variable pointing at a config override
pub const CONFIG_ENV: &str = "BILLWISE_CONFIG";

/// Detection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionConfig {
    /// Minimum similarity for a description to join a known merchant key
    pub merchant_similarity_threshold: f64,
    /// Runner-up candidates this close to the best score make a match ambiguous
    pub merchant_ambiguity_margin: f64,

    /// Relative tolerance around a canonical period
    pub period_tolerance_fraction: f64,
    /// Absolute tolerance floor in days
    pub period_tolerance_min_days: f64,
    /// Share of gaps that must fall inside the tolerance band
    pub min_gap_consistency: f64,
    /// Allowed relative drift of a recurring amount (0.05 = 5%)
    pub amount_tolerance: f64,
    /// On-period charges at a new stable amount that confirm a price change
    pub price_change_confirmations: usize,

    pub duplicate_window_days: i64,
    /// Latest charge above baseline by more than this fraction is flagged
    pub price_increase_threshold: f64,
    /// Charges before the latest one that form the baseline
    pub baseline_window: usize,
    /// First charge this many times the account median is unexpected
    pub unexpected_charge_ratio: f64,
    /// Deviation at which the risk score reaches 0.5
    pub risk_half_point: f64,

    pub cancellation_midpoint: f64,
    pub cancellation_steepness: f64,
    pub avoidable_probability_threshold: f64,
    pub avoidable_risk_threshold: f64,
    /// Fraction of avoidable spend counted as potential savings
    pub savings_discount: f64,
    pub cost_share_threshold: f64,

    /// Writer lock wait before `ConcurrentMutationConflict`
    pub lock_timeout: Duration,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            merchant_similarity_threshold: 0.8,
            merchant_ambiguity_margin: 0.05,
            period_tolerance_fraction: 0.15,
            period_tolerance_min_days: 3.0,
            min_gap_consistency: 0.6,
            amount_tolerance: 0.05,
            price_change_confirmations: 2,
            duplicate_window_days: 2,
            price_increase_threshold: 0.20,
            baseline_window: 6,
            unexpected_charge_ratio: 3.0,
            risk_half_point: 0.5,
            cancellation_midpoint: 1.5,
            cancellation_steepness: 4.0,
            avoidable_probability_threshold: 0.5,
            avoidable_risk_threshold: 0.6,
            savings_discount: 0.85,
            cost_share_threshold: 0.25,
            lock_timeout: Duration::from_millis(5000),
        }
    }
}

impl DetectionConfig {
    /// Load using the standard resolution order
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let path = explicit
            .map(Path::to_path_buf)
            .or(env_path)
            .or_else(|| default_config_path().filter(|p| p.exists()));

        match path {
            Some(path) => {
                debug!("Loading detection config from {}", path.display());
                let content = fs::read_to_string(&path).map_err(|e| {
                    Error::Config(format!("Failed to read {}: {}", path.display(), e))
                })?;
                Self::from_toml_str(&content)
            }
            None => Self::from_toml_str(DEFAULT_CONFIG),
        }
    }

    /// Parse a TOML document, layering it over the built-in defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(content)?;
        let mut config = Self::default();
        raw.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break the engine's invariants
    pub fn validate(&self) -> Result<()> {
        let fractions = [
            ("merchant.similarity_threshold", self.merchant_similarity_threshold),
            ("merchant.ambiguity_margin", self.merchant_ambiguity_margin),
            ("recurrence.period_tolerance_fraction", self.period_tolerance_fraction),
            ("recurrence.min_gap_consistency", self.min_gap_consistency),
            ("recurrence.amount_tolerance", self.amount_tolerance),
            ("savings.avoidable_probability_threshold", self.avoidable_probability_threshold),
            ("savings.avoidable_risk_threshold", self.avoidable_risk_threshold),
            ("savings.savings_discount", self.savings_discount),
            ("savings.cost_share_threshold", self.cost_share_threshold),
        ];
        for (name, value) in fractions {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "{} must be between 0 and 1 (got {})",
                    name, value
                )));
            }
        }

        let positives = [
            ("recurrence.period_tolerance_min_days", self.period_tolerance_min_days),
            ("anomaly.price_increase_threshold", self.price_increase_threshold),
            ("anomaly.unexpected_charge_ratio", self.unexpected_charge_ratio),
            ("anomaly.risk_half_point", self.risk_half_point),
            ("savings.cancellation_midpoint", self.cancellation_midpoint),
            ("savings.cancellation_steepness", self.cancellation_steepness),
        ];
        for (name, value) in positives {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::Config(format!(
                    "{} must be positive (got {})",
                    name, value
                )));
            }
        }

        if self.duplicate_window_days < 0 {
            return Err(Error::Config(
                "anomaly.duplicate_window_days must not be negative".to_string(),
            ));
        }
        if self.price_change_confirmations == 0 {
            return Err(Error::Config(
                "recurrence.price_change_confirmations must be at least 1".to_string(),
            ));
        }
        if self.baseline_window == 0 {
            return Err(Error::Config(
                "anomaly.baseline_window must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Get the default config override path
pub fn default_config_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("billwise").join("config").join("detection.toml"))
}

/// Raw config structure for TOML parsing
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    merchant: Option<RawMerchant>,
    recurrence: Option<RawRecurrence>,
    anomaly: Option<RawAnomaly>,
    savings: Option<RawSavings>,
    ledger: Option<RawLedger>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMerchant {
    similarity_threshold: Option<f64>,
    ambiguity_margin: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRecurrence {
    period_tolerance_fraction: Option<f64>,
    period_tolerance_min_days: Option<f64>,
    min_gap_consistency: Option<f64>,
    amount_tolerance: Option<f64>,
    price_change_confirmations: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAnomaly {
    duplicate_window_days: Option<i64>,
    price_increase_threshold: Option<f64>,
    baseline_window: Option<usize>,
    unexpected_charge_ratio: Option<f64>,
    risk_half_point: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSavings {
    cancellation_midpoint: Option<f64>,
    cancellation_steepness: Option<f64>,
    avoidable_probability_threshold: Option<f64>,
    avoidable_risk_threshold: Option<f64>,
    savings_discount: Option<f64>,
    cost_share_threshold: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLedger {
    lock_timeout_ms: Option<u64>,
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *target = v;
    }
}

impl RawConfig {
    fn apply(self, config: &mut DetectionConfig) {
        if let Some(m) = self.merchant {
            set(&mut config.merchant_similarity_threshold, m.similarity_threshold);
            set(&mut config.merchant_ambiguity_margin, m.ambiguity_margin);
        }
        if let Some(r) = self.recurrence {
            set(&mut config.period_tolerance_fraction, r.period_tolerance_fraction);
            set(&mut config.period_tolerance_min_days, r.period_tolerance_min_days);
            set(&mut config.min_gap_consistency, r.min_gap_consistency);
            set(&mut config.amount_tolerance, r.amount_tolerance);
            set(&mut config.price_change_confirmations, r.price_change_confirmations);
        }
        if let Some(a) = self.anomaly {
            set(&mut config.duplicate_window_days, a.duplicate_window_days);
            set(&mut config.price_increase_threshold, a.price_increase_threshold);
            set(&mut config.baseline_window, a.baseline_window);
            set(&mut config.unexpected_charge_ratio, a.unexpected_charge_ratio);
            set(&mut config.risk_half_point, a.risk_half_point);
        }
        if let Some(s) = self.savings {
            set(&mut config.cancellation_midpoint, s.cancellation_midpoint);
            set(&mut config.cancellation_steepness, s.cancellation_steepness);
            set(
                &mut config.avoidable_probability_threshold,
                s.avoidable_probability_threshold,
            );
            set(&mut config.avoidable_risk_threshold, s.avoidable_risk_threshold);
            set(&mut config.savings_discount, s.savings_discount);
            set(&mut config.cost_share_threshold, s.cost_share_threshold);
        }
        if let Some(l) = self.ledger {
            if let Some(ms) = l.lock_timeout_ms {
                config.lock_timeout = Duration::from_millis(ms);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_embedded_defaults_match_code_defaults() {
        let config = DetectionConfig::from_toml_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config, DetectionConfig::default());
    }

    #[test]
    fn test_partial_override_keeps_other_defaults() {
        let config = DetectionConfig::from_toml_str(
            r#"
            [anomaly]
            price_increase_threshold = 0.5

            [ledger]
            lock_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.price_increase_threshold, 0.5);
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.amount_tolerance, 0.05);
        assert_eq!(config.duplicate_window_days, 2);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = DetectionConfig::from_toml_str("[savings]\nsavings_discount = 1.5\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("savings_discount"));

        let err = DetectionConfig::from_toml_str("[anomaly]\nbaseline_window = 0\n").unwrap_err();
        assert!(err.to_string().contains("baseline_window"));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let result = DetectionConfig::from_toml_str("[merchant]\nthreshold = 0.9\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_load_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[merchant]\nsimilarity_threshold = 0.9").unwrap();

        let config = DetectionConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.merchant_similarity_threshold, 0.9);
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let result = DetectionConfig::load(Some(Path::new("/nonexistent/billwise.toml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
