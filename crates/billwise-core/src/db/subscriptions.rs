//! Subscription persistence

use std::collections::HashMap;

use rusqlite::{params, Connection};
use tracing::warn;

use super::{parse_datetime, parse_stored_amount, parse_stored_date};
use crate::error::{Error, Result};
use crate::models::Subscription;

/// Upsert every subscription of an account and rewrite its charge links
pub(super) fn save_subscriptions(
    conn: &Connection,
    account: &str,
    subscriptions: &[Subscription],
) -> Result<()> {
    let mut upsert = conn.prepare_cached(
        r#"
        INSERT INTO subscriptions
            (id, account, name, merchant_key, bank_account, amount, frequency, status,
             first_seen, last_seen, next_renewal, cancellation_probability, weak_signal,
             cancelled_on, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            amount = excluded.amount,
            frequency = excluded.frequency,
            status = excluded.status,
            first_seen = excluded.first_seen,
            last_seen = excluded.last_seen,
            next_renewal = excluded.next_renewal,
            cancellation_probability = excluded.cancellation_probability,
            weak_signal = excluded.weak_signal,
            cancelled_on = excluded.cancelled_on
        WHERE subscriptions.account = excluded.account
        "#,
    )?;
    let mut clear_links =
        conn.prepare_cached("DELETE FROM subscription_transactions WHERE subscription_id = ?")?;
    let mut link = conn.prepare_cached(
        r#"
        INSERT INTO subscription_transactions (subscription_id, account, transaction_id, position)
        VALUES (?, ?, ?, ?)
        "#,
    )?;

    for sub in subscriptions {
        let written = upsert.execute(params![
            sub.id,
            account,
            sub.name,
            sub.merchant_key,
            sub.bank_account,
            sub.amount.to_string(),
            sub.frequency.as_str(),
            sub.status.as_str(),
            sub.first_seen.to_string(),
            sub.last_seen.to_string(),
            sub.next_renewal.to_string(),
            sub.cancellation_probability,
            sub.weak_signal,
            sub.cancelled_on.map(|d| d.to_string()),
            sub.created_at.to_rfc3339(),
        ])?;
        // The id is already held by another account's subscription
        if written == 0 {
            warn!(
                "Subscription id {} belongs to another account; refusing to save '{}'",
                sub.id, account
            );
            return Err(Error::ConcurrentMutationConflict(account.to_string()));
        }

        clear_links.execute(params![sub.id])?;
        for (position, tx_id) in sub.transactions.iter().enumerate() {
            link.execute(params![sub.id, account, tx_id, position as i64])?;
        }
    }
    Ok(())
}

struct SubscriptionRow {
    id: i64,
    name: String,
    merchant_key: String,
    bank_account: String,
    amount: String,
    frequency: String,
    status: String,
    first_seen: String,
    last_seen: String,
    next_renewal: String,
    cancellation_probability: Option<f64>,
    weak_signal: bool,
    cancelled_on: Option<String>,
    created_at: String,
}

impl SubscriptionRow {
    fn into_subscription(self, transactions: Vec<String>) -> Result<Subscription> {
        Ok(Subscription {
            id: self.id,
            name: self.name,
            merchant_key: self.merchant_key,
            bank_account: self.bank_account,
            amount: parse_stored_amount(&self.amount)?,
            frequency: self.frequency.parse().map_err(Error::InvalidData)?,
            status: self.status.parse().map_err(Error::InvalidData)?,
            first_seen: parse_stored_date(&self.first_seen)?,
            last_seen: parse_stored_date(&self.last_seen)?,
            next_renewal: parse_stored_date(&self.next_renewal)?,
            cancellation_probability: self.cancellation_probability,
            transactions,
            weak_signal: self.weak_signal,
            cancelled_on: self
                .cancelled_on
                .as_deref()
                .map(parse_stored_date)
                .transpose()?,
            created_at: parse_datetime(&self.created_at),
        })
    }
}

/// All subscriptions of an account, ordered by id
pub(super) fn load_subscriptions(conn: &Connection, account: &str) -> Result<Vec<Subscription>> {
    let mut links: HashMap<i64, Vec<String>> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            r#"
            SELECT subscription_id, transaction_id
            FROM subscription_transactions
            WHERE account = ?
            ORDER BY subscription_id, position
            "#,
        )?;
        let rows = stmt.query_map(params![account], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (sub_id, tx_id) = row?;
            links.entry(sub_id).or_default().push(tx_id);
        }
    }

    let mut stmt = conn.prepare(
        r#"
        SELECT id, name, merchant_key, bank_account, amount, frequency, status, first_seen,
               last_seen, next_renewal, cancellation_probability, weak_signal, cancelled_on,
               created_at
        FROM subscriptions
        WHERE account = ?
        ORDER BY id
        "#,
    )?;
    let rows = stmt
        .query_map(params![account], |row| {
            Ok(SubscriptionRow {
                id: row.get(0)?,
                name: row.get(1)?,
                merchant_key: row.get(2)?,
                bank_account: row.get(3)?,
                amount: row.get(4)?,
                frequency: row.get(5)?,
                status: row.get(6)?,
                first_seen: row.get(7)?,
                last_seen: row.get(8)?,
                next_renewal: row.get(9)?,
                cancellation_probability: row.get(10)?,
                weak_signal: row.get(11)?,
                cancelled_on: row.get(12)?,
                created_at: row.get(13)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|row| {
            let transactions = links.remove(&row.id).unwrap_or_default();
            row.into_subscription(transactions)
        })
        .collect()
}
