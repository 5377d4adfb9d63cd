//! Transaction persistence

use rusqlite::{params, Connection};

use super::{parse_stored_amount, parse_stored_date};
use crate::error::Result;
use crate::models::Transaction;

/// Insert transactions not yet stored; returns how many were new
///
/// Transactions are immutable once committed, so existing rows are left alone.
pub(super) fn save_transactions<'a>(
    conn: &Connection,
    account: &str,
    transactions: impl Iterator<Item = &'a Transaction>,
) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        r#"
        INSERT OR IGNORE INTO transactions
            (account, id, bank_account, date, amount, description, merchant_key, reference, source_row)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )?;

    let mut added = 0;
    for tx in transactions {
        added += stmt.execute(params![
            account,
            tx.id,
            tx.bank_account,
            tx.date.to_string(),
            tx.amount.to_string(),
            tx.description,
            tx.merchant_key,
            tx.reference,
            tx.row as i64,
        ])?;
    }
    Ok(added)
}

/// All transactions of an account, oldest first
pub(super) fn load_transactions(conn: &Connection, account: &str) -> Result<Vec<Transaction>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, bank_account, date, amount, description, merchant_key, reference, source_row
        FROM transactions
        WHERE account = ?
        ORDER BY date, id
        "#,
    )?;

    let rows = stmt
        .query_map(params![account], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(
            |(id, bank_account, date, amount, description, merchant_key, reference, source_row)| {
                Ok(Transaction {
                    id,
                    bank_account,
                    date: parse_stored_date(&date)?,
                    amount: parse_stored_amount(&amount)?,
                    description,
                    merchant_key,
                    reference,
                    row: source_row as usize,
                })
            },
        )
        .collect()
}
