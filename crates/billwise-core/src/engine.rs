//! Engine facade
//!
//! The single entry point the CLI (or any other surface) talks to. It owns a
//! [`Ledger`] and derives every analytics view from one published snapshot,
//! so a report never mixes two versions of an account.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::debug;

use crate::anomaly::detect_anomalies;
use crate::config::DetectionConfig;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::ledger::{AccountState, Ledger};
use crate::models::{
    Anomaly, IngestResult, RawRecord, Recommendation, SavingsSummary, SignConvention,
    Subscription, SubscriptionDetail, SubscriptionSummary,
};
use crate::normalize::{read_csv, read_excel};
use crate::savings::{insight_for, recommendations, savings_summary};

/// Everything derived from one account snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub account: String,
    /// Ledger version the report was computed from
    pub version: u64,
    pub anomalies: Vec<Anomaly>,
    pub savings: SavingsSummary,
    pub recommendations: Vec<Recommendation>,
}

pub struct Engine {
    ledger: Ledger,
}

impl Engine {
    /// Engine with in-memory state only
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            ledger: Ledger::new(config),
        }
    }

    /// Engine persisting every committed mutation to SQLite
    pub fn open(db: Database, config: DetectionConfig) -> Self {
        debug!("Opening engine on {}", db.path());
        Self {
            ledger: Ledger::with_store(config, Arc::new(db)),
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        self.ledger.config()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn ingest_records(
        &self,
        account: &str,
        records: &[RawRecord],
        sign: SignConvention,
        as_of: NaiveDate,
    ) -> Result<IngestResult> {
        self.ledger.ingest(account, records, sign, as_of)
    }

    /// Parse a bank CSV export and ingest it as one upload
    pub fn ingest_csv<R: Read>(
        &self,
        account: &str,
        reader: R,
        sign: SignConvention,
        as_of: NaiveDate,
    ) -> Result<IngestResult> {
        let statement = read_csv(reader)?;
        self.ledger.ingest_statement(account, &statement, sign, as_of)
    }

    /// Read the first sheet of an Excel export and ingest it as one upload
    pub fn ingest_excel(
        &self,
        account: &str,
        path: &Path,
        sign: SignConvention,
        as_of: NaiveDate,
    ) -> Result<IngestResult> {
        let statement = read_excel(path)?;
        self.ledger.ingest_statement(account, &statement, sign, as_of)
    }

    pub fn list_subscriptions(&self, account: &str) -> Result<Vec<SubscriptionSummary>> {
        self.ledger.list(account)
    }

    /// Full subscription with its charges and advisory text
    pub fn get_subscription(
        &self,
        account: &str,
        id: i64,
        as_of: NaiveDate,
    ) -> Result<SubscriptionDetail> {
        let state = self.ledger.snapshot(account)?;
        let subscription = state
            .subscription(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("subscription {}", id)))?;
        let charges = state.charges_of(&subscription).into_iter().cloned().collect();
        let recs = self.recommendations_for(&state, as_of);

        Ok(SubscriptionDetail {
            insight: insight_for(id, &recs),
            subscription,
            charges,
        })
    }

    pub fn cancel_subscription(&self, account: &str, id: i64, on: NaiveDate) -> Result<Subscription> {
        self.ledger.cancel(account, id, on)
    }

    pub fn refresh(&self, account: &str, as_of: NaiveDate) -> Result<usize> {
        self.ledger.refresh(account, as_of)
    }

    pub fn anomalies(&self, account: &str) -> Result<Vec<Anomaly>> {
        let state = self.ledger.snapshot(account)?;
        Ok(detect_anomalies(&state, self.config()))
    }

    pub fn savings_summary(&self, account: &str) -> Result<SavingsSummary> {
        let state = self.ledger.snapshot(account)?;
        let anomalies = detect_anomalies(&state, self.config());
        Ok(savings_summary(&state.subscriptions, &anomalies, self.config()))
    }

    pub fn recommendations(&self, account: &str, as_of: NaiveDate) -> Result<Vec<Recommendation>> {
        let state = self.ledger.snapshot(account)?;
        Ok(self.recommendations_for(&state, as_of))
    }

    /// Anomalies, savings and recommendations from a single snapshot
    pub fn analyze(&self, account: &str, as_of: NaiveDate) -> Result<AnalysisReport> {
        let state = self.ledger.snapshot(account)?;
        let config = self.config();
        let anomalies = detect_anomalies(&state, config);
        let savings = savings_summary(&state.subscriptions, &anomalies, config);
        let recommendations = recommendations(&state.subscriptions, &anomalies, as_of, config);

        Ok(AnalysisReport {
            account: state.account.clone(),
            version: state.version,
            anomalies,
            savings,
            recommendations,
        })
    }

    fn recommendations_for(&self, state: &AccountState, as_of: NaiveDate) -> Vec<Recommendation> {
        let anomalies = detect_anomalies(state, self.config());
        recommendations(&state.subscriptions, &anomalies, as_of, self.config())
    }
}
