//! Subscription ledger
//!
//! Owns the per-account state (transactions, merchant registry, subscriptions)
//! and every subscription lifecycle transition. Each account has its own
//! writer lock; readers take the last published `Arc<AccountState>` snapshot
//! and never block writers.
//!
//! Writers work on a clone of the current snapshot, persist it through the
//! [`LedgerStore`] if one is configured, and only then swap it in. A failed
//! mutation publishes nothing.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::DetectionConfig;
use crate::error::{Error, FieldError, Result};
use crate::merchant::{display_name, MerchantRegistry};
use crate::models::{
    Frequency, IngestResult, RawRecord, RejectedRecord, RowWarning, SignConvention, Statement,
    Subscription, SubscriptionStatus, SubscriptionSummary, Transaction,
};
use crate::normalize::normalize_batch;
use crate::recurrence::{
    self, gap_matches, matches_period_multiple, project_renewal, round_to, within_tolerance,
};

/// Everything the engine knows about one account
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountState {
    pub account: String,
    /// Incremented by every committed mutation
    pub version: u64,
    /// Keyed by transaction id
    pub transactions: BTreeMap<String, Transaction>,
    pub registry: MerchantRegistry,
    /// Ordered by id
    pub subscriptions: Vec<Subscription>,
}

impl AccountState {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            ..Default::default()
        }
    }

    pub fn transaction(&self, id: &str) -> Option<&Transaction> {
        self.transactions.get(id)
    }

    /// All transactions, oldest first
    pub fn chronological(&self) -> Vec<&Transaction> {
        let mut txs: Vec<&Transaction> = self.transactions.values().collect();
        txs.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        txs
    }

    /// Transactions grouped by (bank account, merchant key), oldest first
    pub fn groups(&self) -> BTreeMap<(&str, &str), Vec<&Transaction>> {
        let mut groups: BTreeMap<(&str, &str), Vec<&Transaction>> = BTreeMap::new();
        for tx in self.chronological() {
            groups
                .entry((tx.bank_account.as_str(), tx.merchant_key.as_str()))
                .or_default()
                .push(tx);
        }
        groups
    }

    pub fn group(&self, bank_account: &str, merchant_key: &str) -> Vec<&Transaction> {
        self.chronological()
            .into_iter()
            .filter(|tx| tx.bank_account == bank_account && tx.merchant_key == merchant_key)
            .collect()
    }

    pub fn subscription(&self, id: i64) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.id == id)
    }

    fn subscription_index(&self, id: i64) -> Option<usize> {
        self.subscriptions.iter().position(|s| s.id == id)
    }

    fn active_index(&self, bank_account: &str, merchant_key: &str) -> Option<usize> {
        self.subscriptions.iter().position(|s| {
            s.is_active() && s.bank_account == bank_account && s.merchant_key == merchant_key
        })
    }

    pub fn active_subscription(&self, bank_account: &str, merchant_key: &str) -> Option<&Subscription> {
        self.active_index(bank_account, merchant_key)
            .map(|idx| &self.subscriptions[idx])
    }

    /// Most recently seen cancelled subscription for a merchant
    pub fn latest_cancelled(&self, bank_account: &str, merchant_key: &str) -> Option<&Subscription> {
        self.subscriptions
            .iter()
            .filter(|s| {
                !s.is_active() && s.bank_account == bank_account && s.merchant_key == merchant_key
            })
            .max_by(|a, b| a.last_seen.cmp(&b.last_seen).then_with(|| a.id.cmp(&b.id)))
    }

    /// Active first, then by upcoming renewal, then id
    pub fn sorted_subscriptions(&self) -> Vec<&Subscription> {
        let mut subs: Vec<&Subscription> = self.subscriptions.iter().collect();
        subs.sort_by(|a, b| {
            b.is_active()
                .cmp(&a.is_active())
                .then_with(|| a.next_renewal.cmp(&b.next_renewal))
                .then_with(|| a.id.cmp(&b.id))
        });
        subs
    }

    /// Ids of transactions already attributed to some subscription
    pub fn attributed_ids(&self) -> HashSet<String> {
        self.subscriptions
            .iter()
            .flat_map(|s| s.transactions.iter().cloned())
            .collect()
    }

    /// Charges of a subscription, oldest first
    pub fn charges_of(&self, subscription: &Subscription) -> Vec<&Transaction> {
        subscription
            .transactions
            .iter()
            .filter_map(|id| self.transactions.get(id))
            .collect()
    }

    /// Attach a charge to an active subscription if it fits the amount and
    /// lands a whole number of periods from an existing charge
    fn try_extend(&mut self, idx: usize, tx: &Transaction, config: &DetectionConfig) -> bool {
        let sub = &self.subscriptions[idx];
        if !within_tolerance(tx.charge(), sub.amount, config.amount_tolerance) {
            return false;
        }

        let nearest = sub
            .transactions
            .iter()
            .filter_map(|id| self.transactions.get(id))
            .map(|existing| (tx.date - existing.date).num_days().abs())
            .min();
        let Some(distance) = nearest else {
            return false;
        };
        if !matches_period_multiple(distance, sub.frequency, config) {
            return false;
        }

        let transactions = &self.transactions;
        let sub = &mut self.subscriptions[idx];
        sub.transactions.push(tx.id.clone());
        sub.transactions.sort_by(|a, b| {
            let date_a = transactions.get(a).map(|t| t.date);
            let date_b = transactions.get(b).map(|t| t.date);
            date_a.cmp(&date_b).then_with(|| a.cmp(b))
        });
        if tx.date >= sub.last_seen {
            sub.last_seen = tx.date;
            sub.amount = tx.charge();
        }
        if tx.date < sub.first_seen {
            sub.first_seen = tx.date;
        }
        debug!(
            "Extended subscription {} ({}) with charge on {}",
            sub.id, sub.name, tx.date
        );
        true
    }

    /// Move an active subscription to a new price once enough charges at
    /// that price follow its last charge, one period apart
    fn try_price_change(
        &mut self,
        idx: usize,
        pending: &[Transaction],
        config: &DetectionConfig,
    ) -> bool {
        let chain: Vec<&Transaction> = {
            let sub = &self.subscriptions[idx];
            let mut previous = sub.last_seen;
            let mut chain: Vec<&Transaction> = Vec::new();
            for tx in pending {
                if tx.date <= sub.last_seen
                    || sub.transactions.contains(&tx.id)
                    || within_tolerance(tx.charge(), sub.amount, config.amount_tolerance)
                {
                    continue;
                }
                let on_period = gap_matches((tx.date - previous).num_days(), sub.frequency, config);
                let same_price = chain.first().map_or(true, |first| {
                    within_tolerance(tx.charge(), first.charge(), config.amount_tolerance)
                });
                if on_period && same_price {
                    previous = tx.date;
                    chain.push(tx);
                }
            }
            chain
        };

        if chain.len() < config.price_change_confirmations {
            return false;
        }
        let (Some(first), Some(latest)) = (chain.first(), chain.last()) else {
            return false;
        };

        let sub = &mut self.subscriptions[idx];
        let previous_amount = sub.amount;
        sub.transactions.extend(chain.iter().map(|tx| tx.id.clone()));
        sub.last_seen = latest.date;
        sub.amount = latest.charge();
        info!(
            "Subscription {} ({}) moved from {} to {} on {}",
            sub.id, sub.name, previous_amount, sub.amount, first.date
        );
        true
    }

    /// Bring one merchant group's subscriptions up to date
    ///
    /// Returns the ids of subscriptions created or extended.
    fn reconcile_group(
        &mut self,
        bank_account: &str,
        merchant_key: &str,
        as_of: NaiveDate,
        config: &DetectionConfig,
        ids: &dyn Fn() -> Result<i64>,
    ) -> Result<(Vec<i64>, usize)> {
        let attributed = self.attributed_ids();
        let mut pending: Vec<Transaction> = self
            .group(bank_account, merchant_key)
            .into_iter()
            .filter(|tx| tx.is_outgoing() && !attributed.contains(&tx.id))
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok((Vec::new(), 0));
        }

        let mut touched = Vec::new();
        let mut created = 0;

        // A matching charge after a cancellation starts a fresh subscription
        if self.active_index(bank_account, merchant_key).is_none() {
            if let Some(cancelled) = self.latest_cancelled(bank_account, merchant_key).cloned() {
                let resumed = pending
                    .iter()
                    .find(|tx| {
                        tx.date > cancelled.last_seen
                            && within_tolerance(tx.charge(), cancelled.amount, config.amount_tolerance)
                    })
                    .cloned();
                if let Some(tx) = resumed {
                    let sub = Subscription {
                        id: ids()?,
                        name: cancelled.name.clone(),
                        merchant_key: merchant_key.to_string(),
                        bank_account: bank_account.to_string(),
                        amount: tx.charge(),
                        frequency: cancelled.frequency,
                        status: SubscriptionStatus::Active,
                        first_seen: tx.date,
                        last_seen: tx.date,
                        next_renewal: project_renewal(cancelled.frequency, tx.date, as_of),
                        cancellation_probability: None,
                        transactions: vec![tx.id.clone()],
                        weak_signal: true,
                        cancelled_on: None,
                        created_at: Utc::now(),
                    };
                    info!(
                        "Subscription {} ({}) resumed after cancellation of {}",
                        sub.id, sub.name, cancelled.id
                    );
                    touched.push(sub.id);
                    created += 1;
                    self.subscriptions.push(sub);
                    pending.retain(|p| p.id != tx.id);
                }
            }
        }

        if let Some(idx) = self.active_index(bank_account, merchant_key) {
            let mut extended = false;
            for tx in &pending {
                extended |= self.try_extend(idx, tx, config);
            }
            extended |= self.try_price_change(idx, &pending, config);
            let id = self.subscriptions[idx].id;
            if extended && !touched.contains(&id) {
                touched.push(id);
            }
            return Ok((touched, created));
        }

        // Charges before a cancellation never revive it
        let floor = self
            .latest_cancelled(bank_account, merchant_key)
            .map(|s| s.last_seen);
        let candidates: Vec<&Transaction> = pending
            .iter()
            .filter(|tx| floor.map_or(true, |f| tx.date > f))
            .collect();

        if let Some(pattern) = recurrence::detect(&candidates, as_of, config) {
            let sub = Subscription {
                id: ids()?,
                name: display_name(merchant_key),
                merchant_key: merchant_key.to_string(),
                bank_account: bank_account.to_string(),
                amount: pattern.amount,
                frequency: pattern.frequency,
                status: SubscriptionStatus::Active,
                first_seen: pattern.first_seen,
                last_seen: pattern.last_seen,
                next_renewal: pattern.next_renewal,
                cancellation_probability: None,
                transactions: pattern.transaction_ids,
                weak_signal: pattern.weak_signal,
                cancelled_on: None,
                created_at: Utc::now(),
            };
            info!(
                "Detected {} subscription {} ({}) at {}",
                sub.frequency, sub.id, sub.name, sub.amount
            );
            touched.push(sub.id);
            created += 1;
            self.subscriptions.push(sub);
        }

        Ok((touched, created))
    }

    /// Re-project renewals and lapse probabilities of active subscriptions
    fn refresh_active(&mut self, as_of: NaiveDate, config: &DetectionConfig) -> usize {
        let mut refreshed = 0;
        for sub in self.subscriptions.iter_mut().filter(|s| s.is_active()) {
            let projected = project_renewal(sub.frequency, sub.last_seen, as_of);
            sub.next_renewal = sub.next_renewal.max(projected);
            sub.cancellation_probability = Some(cancellation_probability(sub, as_of, config));
            refreshed += 1;
        }
        refreshed
    }
}

/// Likelihood that a subscription lapsed silently
///
/// Logistic in the number of periods since the last charge: about 0.12 right
/// after a charge is due, 0.5 at one and a half periods, near 1 after three.
pub fn cancellation_probability(
    subscription: &Subscription,
    as_of: NaiveDate,
    config: &DetectionConfig,
) -> f64 {
    let frequency = match subscription.frequency {
        Frequency::Unknown => Frequency::Monthly,
        known => known,
    };
    let period = frequency.period_days().unwrap_or(30.44);
    let idle_days = (as_of - subscription.last_seen).num_days().max(0) as f64;
    let periods = idle_days / period;
    let p = 1.0
        / (1.0
            + (-config.cancellation_steepness * (periods - config.cancellation_midpoint)).exp());
    round_to(p, 3)
}

/// Persistence boundary for committed account states
pub trait LedgerStore: Send + Sync {
    /// Load an account, or `None` if it was never saved
    fn load_account(&self, account: &str) -> Result<Option<AccountState>>;

    /// Durably write a full account state; all or nothing
    ///
    /// Fails with `ConcurrentMutationConflict` when the stored version is
    /// already at or past `state.version`, or when a subscription id in
    /// `state` belongs to another account.
    fn save_account(&self, state: &AccountState) -> Result<()>;

    /// Reserve a subscription id that no other handle on the store will reuse
    fn allocate_subscription_id(&self, account: &str) -> Result<i64>;
}

struct AccountSlot {
    writer: Mutex<()>,
    snapshot: RwLock<Arc<AccountState>>,
}

impl AccountSlot {
    fn new(state: AccountState) -> Self {
        Self {
            writer: Mutex::new(()),
            snapshot: RwLock::new(Arc::new(state)),
        }
    }
}

/// Durable set of detected subscriptions, partitioned by account
pub struct Ledger {
    config: DetectionConfig,
    store: Option<Arc<dyn LedgerStore>>,
    accounts: RwLock<HashMap<String, Arc<AccountSlot>>>,
    /// Id source when there is no store
    next_id: AtomicI64,
}

impl Ledger {
    /// In-memory ledger
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            config,
            store: None,
            accounts: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Ledger backed by a store; accounts load lazily on first touch
    pub fn with_store(config: DetectionConfig, store: Arc<dyn LedgerStore>) -> Self {
        Self {
            config,
            store: Some(store),
            accounts: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    fn allocate_id(&self, account: &str) -> Result<i64> {
        match &self.store {
            Some(store) => store.allocate_subscription_id(account),
            None => Ok(self.next_id.fetch_add(1, Ordering::SeqCst)),
        }
    }

    fn cached(&self, account: &str) -> Option<Arc<AccountSlot>> {
        self.accounts.read().get(account).cloned()
    }

    fn load(&self, account: &str) -> Result<Option<AccountState>> {
        match &self.store {
            Some(store) => store.load_account(account),
            None => Ok(None),
        }
    }

    /// Cache a loaded state unless another thread got there first
    fn install(&self, state: AccountState) -> Arc<AccountSlot> {
        let mut accounts = self.accounts.write();
        if let Some(slot) = accounts.get(&state.account) {
            return slot.clone();
        }
        debug!(
            "Loaded account '{}' at version {} ({} subscriptions)",
            state.account,
            state.version,
            state.subscriptions.len()
        );
        let account = state.account.clone();
        let slot = Arc::new(AccountSlot::new(state));
        accounts.insert(account, slot.clone());
        slot
    }

    /// Slot for a writer, created on first use
    ///
    /// The store is read outside the map lock so a slow load for one account
    /// never stalls the others.
    fn slot(&self, account: &str) -> Result<Arc<AccountSlot>> {
        if let Some(slot) = self.cached(account) {
            return Ok(slot);
        }
        let state = self
            .load(account)?
            .unwrap_or_else(|| AccountState::new(account));
        Ok(self.install(state))
    }

    /// Current published state of an account
    ///
    /// Reading an account that was never written leaves no trace behind.
    pub fn snapshot(&self, account: &str) -> Result<Arc<AccountState>> {
        if let Some(slot) = self.cached(account) {
            let snapshot = slot.snapshot.read().clone();
            return Ok(snapshot);
        }
        match self.load(account)? {
            Some(state) => {
                let slot = self.install(state);
                let snapshot = slot.snapshot.read().clone();
                Ok(snapshot)
            }
            None => Ok(Arc::new(AccountState::new(account))),
        }
    }

    /// Run a mutation under the account's writer lock and publish the result
    fn mutate<T>(
        &self,
        account: &str,
        f: impl FnOnce(&mut AccountState) -> Result<T>,
    ) -> Result<T> {
        let slot = self.slot(account)?;
        let _guard = slot
            .writer
            .try_lock_for(self.config.lock_timeout)
            .ok_or_else(|| Error::ConcurrentMutationConflict(account.to_string()))?;

        let current = slot.snapshot.read().clone();
        let mut next = (*current).clone();
        let out = f(&mut next)?;
        next.version = current.version + 1;

        if let Some(store) = &self.store {
            if let Err(e) = store.save_account(&next) {
                if e.is_retryable() {
                    // Another handle on the store committed first; pick up
                    // its state so the caller's retry starts from there
                    if let Some(fresh) = store.load_account(account)? {
                        warn!(
                            "Account '{}' moved to version {} elsewhere; reloaded",
                            account, fresh.version
                        );
                        *slot.snapshot.write() = Arc::new(fresh);
                    }
                }
                return Err(e);
            }
        }
        *slot.snapshot.write() = Arc::new(next);
        Ok(out)
    }

    /// Ingest one upload: normalize, group, detect and extend subscriptions
    ///
    /// Rejected rows are returned in the result; an upload with no usable
    /// rows at all is a validation error and changes nothing.
    pub fn ingest(
        &self,
        account: &str,
        records: &[RawRecord],
        sign: SignConvention,
        as_of: NaiveDate,
    ) -> Result<IngestResult> {
        self.ingest_rows(account, records, Vec::new(), sign, as_of)
    }

    /// Ingest a statement file, keeping the rows its reader already rejected
    pub fn ingest_statement(
        &self,
        account: &str,
        statement: &Statement,
        sign: SignConvention,
        as_of: NaiveDate,
    ) -> Result<IngestResult> {
        self.ingest_rows(
            account,
            &statement.records,
            statement.rejected.clone(),
            sign,
            as_of,
        )
    }

    fn ingest_rows(
        &self,
        account: &str,
        records: &[RawRecord],
        unreadable: Vec<RejectedRecord>,
        sign: SignConvention,
        as_of: NaiveDate,
    ) -> Result<IngestResult> {
        if records.is_empty() && unreadable.is_empty() {
            return Err(Error::Validation(vec![FieldError::new(
                "file",
                "upload contains no data rows",
            )]));
        }

        let mut batch = normalize_batch(account, records, sign);
        batch.rejected.extend(unreadable);
        batch.rejected.sort_by_key(|r| r.row);
        if batch.transactions.is_empty() {
            return Err(Error::Validation(
                batch
                    .rejected
                    .iter()
                    .flat_map(|r| {
                        r.errors.iter().map(move |e| {
                            FieldError::new(e.field.clone(), format!("row {}: {}", r.row, e.message))
                        })
                    })
                    .collect(),
            ));
        }

        let config = &self.config;
        let ids = || self.allocate_id(account);
        self.mutate(account, move |state| {
            let mut result = IngestResult {
                rejected: batch.rejected,
                ..Default::default()
            };
            let mut touched_groups: BTreeSet<(String, String)> = BTreeSet::new();

            for mut tx in batch.transactions {
                if state.transactions.contains_key(&tx.id) {
                    result.duplicates_skipped += 1;
                    continue;
                }
                let found = state.registry.resolve(&tx.bank_account, &tx.description, config);
                if found.is_ambiguous() {
                    result.ambiguous_merchants += 1;
                    let ambiguity = Error::AmbiguousMerchant {
                        description: tx.description.clone(),
                        candidates: found.ambiguous_with.clone(),
                    };
                    result.warnings.push(RowWarning {
                        row: tx.row,
                        message: format!("{} (using '{}')", ambiguity, found.key),
                    });
                }
                tx.merchant_key = found.key;
                touched_groups.insert((tx.bank_account.clone(), tx.merchant_key.clone()));
                state.transactions.insert(tx.id.clone(), tx);
                result.transactions_added += 1;
            }

            let mut touched_subs: BTreeSet<i64> = BTreeSet::new();
            for (bank_account, merchant_key) in &touched_groups {
                let (touched, created) =
                    state.reconcile_group(bank_account, merchant_key, as_of, config, &ids)?;
                touched_subs.extend(touched);
                result.new_subscriptions += created;
            }
            result.subscriptions_detected = touched_subs.len();
            state.refresh_active(as_of, config);

            info!(
                "Ingested {} transactions for '{}' ({} duplicates, {} rejected, {} new subscriptions)",
                result.transactions_added,
                state.account,
                result.duplicates_skipped,
                result.rejected.len(),
                result.new_subscriptions
            );
            Ok(result)
        })
    }

    /// All subscriptions of an account, active first
    pub fn list(&self, account: &str) -> Result<Vec<SubscriptionSummary>> {
        let state = self.snapshot(account)?;
        Ok(state
            .sorted_subscriptions()
            .into_iter()
            .map(Subscription::summary)
            .collect())
    }

    pub fn get(&self, account: &str, id: i64) -> Result<Subscription> {
        let state = self.snapshot(account)?;
        state
            .subscription(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("subscription {}", id)))
    }

    /// Cancel a subscription; cancellation is terminal
    pub fn cancel(&self, account: &str, id: i64, on: NaiveDate) -> Result<Subscription> {
        self.mutate(account, |state| {
            let idx = state
                .subscription_index(id)
                .ok_or_else(|| Error::NotFound(format!("subscription {}", id)))?;
            let sub = &mut state.subscriptions[idx];
            if !sub.is_active() {
                return Err(Error::AlreadyCancelled(id));
            }
            sub.status = SubscriptionStatus::Cancelled;
            sub.cancelled_on = Some(on);
            info!("Cancelled subscription {} ({})", sub.id, sub.name);
            Ok(sub.clone())
        })
    }

    /// Re-project renewals and lapse probabilities without ingesting anything
    pub fn refresh(&self, account: &str, as_of: NaiveDate) -> Result<usize> {
        let config = &self.config;
        self.mutate(account, |state| {
            let refreshed = state.refresh_active(as_of, config);
            debug!("Refreshed {} subscriptions for '{}'", refreshed, state.account);
            Ok(refreshed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(row: usize, d: &str, amount: &str, desc: &str) -> RawRecord {
        RawRecord {
            row,
            date: Some(d.to_string()),
            amount: Some(amount.to_string()),
            description: Some(desc.to_string()),
            ..Default::default()
        }
    }

    fn netflix_quarter() -> Vec<RawRecord> {
        vec![
            record(1, "2024-01-01", "-499", "NETFLIX 1234"),
            record(2, "2024-02-01", "-499", "NETFLIX 1234"),
            record(3, "2024-03-01", "-499", "NETFLIX 1234"),
        ]
    }

    #[test]
    fn test_ingest_detects_subscription() {
        let ledger = Ledger::new(DetectionConfig::default());
        let result = ledger
            .ingest("alice", &netflix_quarter(), SignConvention::DebitsNegative, date(2024, 3, 1))
            .unwrap();

        assert_eq!(result.transactions_added, 3);
        assert_eq!(result.new_subscriptions, 1);
        assert_eq!(result.subscriptions_detected, 1);

        let subs = ledger.list("alice").unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].name, "Netflix");
        assert_eq!(subs[0].frequency, Frequency::Monthly);
        assert_eq!(subs[0].next_renewal, date(2024, 4, 1));
    }

    #[test]
    fn test_next_charge_extends_existing_subscription() {
        let ledger = Ledger::new(DetectionConfig::default());
        ledger
            .ingest("alice", &netflix_quarter(), SignConvention::DebitsNegative, date(2024, 3, 1))
            .unwrap();

        let april = vec![record(1, "2024-04-01", "-499", "NETFLIX.COM 9876")];
        let result = ledger
            .ingest("alice", &april, SignConvention::DebitsNegative, date(2024, 4, 1))
            .unwrap();
        assert_eq!(result.new_subscriptions, 0);
        assert_eq!(result.subscriptions_detected, 1);

        let state = ledger.snapshot("alice").unwrap();
        assert_eq!(state.subscriptions.len(), 1);
        let sub = &state.subscriptions[0];
        assert_eq!(sub.transactions.len(), 4);
        assert_eq!(sub.last_seen, date(2024, 4, 1));
        assert_eq!(sub.next_renewal, date(2024, 5, 1));
        assert_eq!(state.version, 2);
    }

    #[test]
    fn test_backfilled_charge_extends_backwards() {
        let ledger = Ledger::new(DetectionConfig::default());
        ledger
            .ingest("alice", &netflix_quarter(), SignConvention::DebitsNegative, date(2024, 3, 1))
            .unwrap();

        let december = vec![record(1, "2023-12-01", "-499", "NETFLIX 1234")];
        ledger
            .ingest("alice", &december, SignConvention::DebitsNegative, date(2024, 3, 1))
            .unwrap();

        let sub = ledger.snapshot("alice").unwrap().subscriptions[0].clone();
        assert_eq!(sub.first_seen, date(2023, 12, 1));
        assert_eq!(sub.last_seen, date(2024, 3, 1));
        assert_eq!(sub.transactions.len(), 4);
    }

    #[test]
    fn test_cancel_is_terminal() {
        let ledger = Ledger::new(DetectionConfig::default());
        ledger
            .ingest("alice", &netflix_quarter(), SignConvention::DebitsNegative, date(2024, 3, 1))
            .unwrap();
        let id = ledger.list("alice").unwrap()[0].id;

        let cancelled = ledger.cancel("alice", id, date(2024, 3, 5)).unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
        assert_eq!(cancelled.cancelled_on, Some(date(2024, 3, 5)));

        assert!(matches!(
            ledger.cancel("alice", id, date(2024, 3, 6)),
            Err(Error::AlreadyCancelled(_))
        ));

        ledger.refresh("alice", date(2024, 9, 1)).unwrap();
        let after = ledger.get("alice", id).unwrap();
        assert_eq!(after.next_renewal, cancelled.next_renewal);
    }

    #[test]
    fn test_other_accounts_cannot_see_subscription() {
        let ledger = Ledger::new(DetectionConfig::default());
        ledger
            .ingest("alice", &netflix_quarter(), SignConvention::DebitsNegative, date(2024, 3, 1))
            .unwrap();
        let id = ledger.list("alice").unwrap()[0].id;

        assert!(matches!(ledger.get("bob", id), Err(Error::NotFound(_))));
        assert!(matches!(
            ledger.cancel("bob", id, date(2024, 3, 5)),
            Err(Error::NotFound(_))
        ));
        assert_eq!(ledger.snapshot("bob").unwrap().version, 0);
    }

    #[test]
    fn test_all_rows_rejected_is_validation_error() {
        let ledger = Ledger::new(DetectionConfig::default());
        let records = vec![record(1, "someday", "-499", "NETFLIX")];

        match ledger.ingest("alice", &records, SignConvention::DebitsNegative, date(2024, 3, 1)) {
            Err(Error::Validation(errors)) => {
                assert_eq!(errors[0].field, "date");
                assert!(errors[0].message.starts_with("row 1:"));
            }
            other => panic!("expected Validation, got {:?}", other),
        }
        assert_eq!(ledger.snapshot("alice").unwrap().version, 0);
    }

    #[test]
    fn test_cancellation_probability_curve() {
        let config = DetectionConfig::default();
        let ledger = Ledger::new(config.clone());
        ledger
            .ingest("alice", &netflix_quarter(), SignConvention::DebitsNegative, date(2024, 3, 1))
            .unwrap();
        let sub = ledger.snapshot("alice").unwrap().subscriptions[0].clone();

        assert_eq!(cancellation_probability(&sub, date(2024, 3, 1), &config), 0.002);
        let lapsed = cancellation_probability(&sub, date(2024, 4, 16), &config);
        assert!((lapsed - 0.5).abs() < 0.05);
        assert!(cancellation_probability(&sub, date(2024, 9, 1), &config) > 0.99);
    }

    #[test]
    fn test_writer_lock_timeout_is_conflict() {
        let config = DetectionConfig {
            lock_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let ledger = Ledger::new(config);
        let slot = ledger.slot("alice").unwrap();
        let _held = slot.writer.lock();

        let err = ledger.refresh("alice", date(2024, 3, 1)).unwrap_err();
        assert!(matches!(err, Error::ConcurrentMutationConflict(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_refresh_skips_renewal_forward() {
        let ledger = Ledger::new(DetectionConfig::default());
        ledger
            .ingest("alice", &netflix_quarter(), SignConvention::DebitsNegative, date(2024, 3, 1))
            .unwrap();

        assert_eq!(ledger.refresh("alice", date(2024, 6, 10)).unwrap(), 1);
        let sub = &ledger.snapshot("alice").unwrap().subscriptions[0];
        assert_eq!(sub.next_renewal, date(2024, 7, 1));
        assert!(sub.cancellation_probability.unwrap() > 0.9);
        assert_eq!(sub.amount, dec!(499));
    }

    #[test]
    fn test_reading_unknown_account_caches_nothing() {
        let ledger = Ledger::new(DetectionConfig::default());
        assert_eq!(ledger.snapshot("ghost").unwrap().version, 0);
        assert!(ledger.list("ghost").unwrap().is_empty());
        assert!(matches!(ledger.get("ghost", 1), Err(Error::NotFound(_))));
        assert!(ledger.accounts.read().is_empty());

        ledger
            .ingest("alice", &netflix_quarter(), SignConvention::DebitsNegative, date(2024, 3, 1))
            .unwrap();
        assert_eq!(ledger.accounts.read().len(), 1);
    }

    #[test]
    fn test_confirmed_price_change_moves_subscription() {
        let ledger = Ledger::new(DetectionConfig::default());
        ledger
            .ingest("alice", &netflix_quarter(), SignConvention::DebitsNegative, date(2024, 3, 1))
            .unwrap();

        // One charge at the new price is not enough on its own
        let april = vec![record(1, "2024-04-01", "-599", "NETFLIX 1234")];
        let result = ledger
            .ingest("alice", &april, SignConvention::DebitsNegative, date(2024, 4, 1))
            .unwrap();
        assert_eq!(result.subscriptions_detected, 0);
        let sub = ledger.snapshot("alice").unwrap().subscriptions[0].clone();
        assert_eq!(sub.amount, dec!(499));
        assert_eq!(sub.last_seen, date(2024, 3, 1));

        let may = vec![record(1, "2024-05-01", "-599", "NETFLIX 1234")];
        let result = ledger
            .ingest("alice", &may, SignConvention::DebitsNegative, date(2024, 5, 1))
            .unwrap();
        assert_eq!(result.subscriptions_detected, 1);
        assert_eq!(result.new_subscriptions, 0);

        let state = ledger.snapshot("alice").unwrap();
        assert_eq!(state.subscriptions.len(), 1);
        let sub = &state.subscriptions[0];
        assert_eq!(sub.amount, dec!(599));
        assert_eq!(sub.last_seen, date(2024, 5, 1));
        assert_eq!(sub.next_renewal, date(2024, 6, 1));
        assert_eq!(sub.transactions.len(), 5);

        let june = vec![record(1, "2024-06-01", "-599", "NETFLIX 1234")];
        ledger
            .ingest("alice", &june, SignConvention::DebitsNegative, date(2024, 6, 1))
            .unwrap();
        let sub = ledger.snapshot("alice").unwrap().subscriptions[0].clone();
        assert_eq!(sub.last_seen, date(2024, 6, 1));
        assert_eq!(sub.transactions.len(), 6);
    }

    #[test]
    fn test_off_period_charges_do_not_change_price() {
        let ledger = Ledger::new(DetectionConfig::default());
        ledger
            .ingest("alice", &netflix_quarter(), SignConvention::DebitsNegative, date(2024, 3, 1))
            .unwrap();

        let extras = vec![
            record(1, "2024-03-12", "-25", "NETFLIX 1234"),
            record(2, "2024-03-20", "-25", "NETFLIX 1234"),
        ];
        ledger
            .ingest("alice", &extras, SignConvention::DebitsNegative, date(2024, 3, 20))
            .unwrap();
        let sub = ledger.snapshot("alice").unwrap().subscriptions[0].clone();
        assert_eq!(sub.amount, dec!(499));
        assert_eq!(sub.transactions.len(), 3);
    }

    /// Store holding one pre-built account
    struct SeededStore(AccountState);

    impl LedgerStore for SeededStore {
        fn load_account(&self, account: &str) -> Result<Option<AccountState>> {
            Ok((account == self.0.account).then(|| self.0.clone()))
        }

        fn save_account(&self, _state: &AccountState) -> Result<()> {
            Ok(())
        }

        fn allocate_subscription_id(&self, _account: &str) -> Result<i64> {
            Ok(1)
        }
    }

    #[test]
    fn test_ambiguous_merchant_is_a_row_warning() {
        let mut seeded = AccountState::new("alice");
        seeded.version = 4;
        seeded.registry.insert(crate::models::DEFAULT_BANK_ACCOUNT, "spotify ab", 1);
        seeded.registry.insert(crate::models::DEFAULT_BANK_ACCOUNT, "spotify ac", 3);
        let ledger = Ledger::with_store(DetectionConfig::default(), Arc::new(SeededStore(seeded)));

        let records = vec![
            record(1, "2024-03-01", "-9.99", "SPOTIFY AD 1234"),
            record(2, "2024-03-02", "-12.00", "CORNER DELI"),
        ];
        let result = ledger
            .ingest("alice", &records, SignConvention::DebitsNegative, date(2024, 3, 2))
            .unwrap();

        assert_eq!(result.transactions_added, 2);
        assert_eq!(result.ambiguous_merchants, 1);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].row, 1);
        assert!(result.warnings[0].message.starts_with("Ambiguous merchant 'SPOTIFY AD 1234'"));
        assert!(result.warnings[0].message.ends_with("(using 'spotify ac')"));
        assert_eq!(ledger.snapshot("alice").unwrap().version, 5);
    }

    #[test]
    fn test_unreadable_rows_join_rejects() {
        let ledger = Ledger::new(DetectionConfig::default());
        let statement = Statement {
            records: vec![record(1, "2024-03-01", "-499", "NETFLIX 1234"), record(3, "soon", "-1", "X")],
            rejected: vec![RejectedRecord {
                row: 2,
                errors: vec![FieldError::new("encoding", "column 'description' is not valid UTF-8")],
            }],
        };

        let result = ledger
            .ingest_statement("alice", &statement, SignConvention::DebitsNegative, date(2024, 3, 1))
            .unwrap();
        assert_eq!(result.transactions_added, 1);
        let rows: Vec<usize> = result.rejected.iter().map(|r| r.row).collect();
        assert_eq!(rows, vec![2, 3]);
        assert_eq!(result.rejected[0].errors[0].field, "encoding");

        let unreadable = Statement {
            records: Vec::new(),
            rejected: statement.rejected.clone(),
        };
        assert!(matches!(
            ledger.ingest_statement("bob", &unreadable, SignConvention::DebitsNegative, date(2024, 3, 1)),
            Err(Error::Validation(_))
        ));
    }
}
