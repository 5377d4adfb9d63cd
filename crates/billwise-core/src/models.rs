//! Domain models for BillWise

use chrono::{DateTime, Months, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FieldError;

/// Bank account label used when an upload has no account column
pub const DEFAULT_BANK_ACCOUNT: &str = "Primary Account";

/// A raw uploaded row, before normalization
///
/// Values are kept exactly as they appeared in the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// 1-based data row number in the source file
    pub row: usize,
    pub date: Option<String>,
    pub amount: Option<String>,
    pub description: Option<String>,
    pub bank_account: Option<String>,
    /// Debit/credit marker column, if the statement has one
    pub transaction_type: Option<String>,
    /// Bank reference number, if the statement has one
    pub reference: Option<String>,
}

/// How a bank export signs outgoing payments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignConvention {
    /// Payments are negative (most checking account exports)
    #[default]
    DebitsNegative,
    /// Payments are positive (most credit card exports)
    DebitsPositive,
}

impl SignConvention {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DebitsNegative => "debits-negative",
            Self::DebitsPositive => "debits-positive",
        }
    }
}

impl std::str::FromStr for SignConvention {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debits-negative" | "negative" => Ok(Self::DebitsNegative),
            "debits-positive" | "positive" => Ok(Self::DebitsPositive),
            _ => Err(format!("Unknown sign convention: {}", s)),
        }
    }
}

impl std::fmt::Display for SignConvention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A normalized financial transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Content hash, stable across re-uploads
    pub id: String,
    pub bank_account: String,
    pub date: NaiveDate,
    /// Negative = outgoing payment, positive = incoming credit
    pub amount: Decimal,
    pub description: String,
    /// Filled in by the merchant grouper
    pub merchant_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Source row of the upload this transaction came from
    pub row: usize,
}

impl Transaction {
    pub fn is_outgoing(&self) -> bool {
        self.amount.is_sign_negative() && !self.amount.is_zero()
    }

    /// Magnitude of the charge
    pub fn charge(&self) -> Decimal {
        self.amount.abs()
    }
}

/// Subscription billing frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
    Unknown,
}

impl Frequency {
    /// Canonical periods, shortest first
    pub const CANONICAL: [Frequency; 4] = [
        Frequency::Weekly,
        Frequency::Monthly,
        Frequency::Quarterly,
        Frequency::Yearly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Yearly => "yearly",
            Self::Unknown => "unknown",
        }
    }

    /// Average length of one period in days (None for unknown)
    pub fn period_days(&self) -> Option<f64> {
        match self {
            Self::Weekly => Some(7.0),
            Self::Monthly => Some(30.44),
            Self::Quarterly => Some(91.31),
            Self::Yearly => Some(365.25),
            Self::Unknown => None,
        }
    }

    /// Advance a date by one billing period
    pub fn advance(&self, date: NaiveDate) -> Option<NaiveDate> {
        self.advance_by(date, 1)
    }

    /// Advance a date by whole billing periods
    ///
    /// Month-based periods use calendar months, clamped to the month end.
    /// Counting from the same anchor keeps a charge on the 31st from
    /// drifting to the 28th after February.
    pub fn advance_by(&self, date: NaiveDate, periods: u32) -> Option<NaiveDate> {
        match self {
            Self::Weekly => date.checked_add_signed(chrono::Duration::days(7 * i64::from(periods))),
            Self::Monthly => date.checked_add_months(Months::new(periods)),
            Self::Quarterly => date.checked_add_months(Months::new(3 * periods)),
            Self::Yearly => date.checked_add_months(Months::new(12 * periods)),
            Self::Unknown => None,
        }
    }

    /// Multiplier turning one charge into a monthly-equivalent cost
    pub fn monthly_factor(&self) -> Decimal {
        match self {
            Self::Weekly => Decimal::from(52) / Decimal::from(12),
            Self::Monthly | Self::Unknown => Decimal::ONE,
            Self::Quarterly => Decimal::ONE / Decimal::from(3),
            Self::Yearly => Decimal::ONE / Decimal::from(12),
        }
    }
}

impl std::str::FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            "yearly" | "annual" => Ok(Self::Yearly),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Unknown frequency: {}", s)),
        }
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subscription lifecycle status
///
/// `Cancelled` is terminal; transitions are checked by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown subscription status: {}", s)),
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A detected subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    /// Display name of the merchant
    pub name: String,
    pub merchant_key: String,
    pub bank_account: String,
    /// Latest recurring charge (positive magnitude)
    pub amount: Decimal,
    pub frequency: Frequency,
    pub status: SubscriptionStatus,
    pub first_seen: NaiveDate,
    pub last_seen: NaiveDate,
    pub next_renewal: NaiveDate,
    pub cancellation_probability: Option<f64>,
    /// Contributing transaction ids, oldest first
    pub transactions: Vec<String>,
    /// Detected from a single gap between two charges
    pub weak_signal: bool,
    pub cancelled_on: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Charge expressed as a monthly cost
    pub fn monthly_cost(&self) -> Decimal {
        self.amount * self.frequency.monthly_factor()
    }

    pub fn summary(&self) -> SubscriptionSummary {
        SubscriptionSummary {
            id: self.id,
            name: self.name.clone(),
            amount: self.amount,
            frequency: self.frequency,
            status: self.status,
            last_seen: self.last_seen,
            next_renewal: self.next_renewal,
        }
    }
}

/// List projection of a subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSummary {
    pub id: i64,
    pub name: String,
    pub amount: Decimal,
    pub frequency: Frequency,
    pub status: SubscriptionStatus,
    pub last_seen: NaiveDate,
    pub next_renewal: NaiveDate,
}

/// Full subscription view with its charges and advisory text
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionDetail {
    #[serde(flatten)]
    pub subscription: Subscription,
    /// Charges resolved from `subscription.transactions`
    #[serde(rename = "transaction_details")]
    pub charges: Vec<Transaction>,
    pub insight: Option<String>,
}

/// Types of anomalies
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    PriceIncrease,
    DuplicateCharge,
    UnexpectedCharge,
    MissedThenResumed,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PriceIncrease => "price_increase",
            Self::DuplicateCharge => "duplicate_charge",
            Self::UnexpectedCharge => "unexpected_charge",
            Self::MissedThenResumed => "missed_then_resumed",
        }
    }
}

impl std::fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A scored irregularity in a merchant's charges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    /// Weak reference; the subscription may since have been cancelled
    pub subscription_id: Option<i64>,
    pub anomaly_type: AnomalyType,
    pub description: String,
    pub risk_score: f64,
    pub merchant_key: String,
    pub bank_account: String,
    pub detected_on: NaiveDate,
    pub transaction_ids: Vec<String>,
}

/// Portfolio-level savings metrics (monthly amounts)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SavingsSummary {
    pub total_monthly_cost: Decimal,
    pub avoidable_spend: Decimal,
    pub potential_savings: Decimal,
}

/// Risk tier used by recommendation templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Advisory output for one subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub subscription_id: i64,
    pub recommendation_text: String,
    pub risk_score: f64,
    pub risk_tier: RiskTier,
}

/// A row the normalizer refused, with the reasons
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRecord {
    pub row: usize,
    pub errors: Vec<FieldError>,
}

/// Rows read from one statement file
///
/// Rows that could not even be decoded are already rejected here; the rest
/// still go through normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statement {
    pub records: Vec<RawRecord>,
    pub rejected: Vec<RejectedRecord>,
}

/// A row that was ingested but deserves a second look
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowWarning {
    pub row: usize,
    pub message: String,
}

/// Outcome of ingesting one upload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestResult {
    pub transactions_added: usize,
    pub duplicates_skipped: usize,
    /// Subscriptions created or extended by this batch
    pub subscriptions_detected: usize,
    pub new_subscriptions: usize,
    pub ambiguous_merchants: usize,
    pub warnings: Vec<RowWarning>,
    pub rejected: Vec<RejectedRecord>,
}
