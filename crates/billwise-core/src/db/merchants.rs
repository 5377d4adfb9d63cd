//! Merchant registry persistence

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::merchant::MerchantRegistry;

pub(super) fn save_registry(
    conn: &Connection,
    account: &str,
    registry: &MerchantRegistry,
) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        r#"
        INSERT INTO merchant_keys (account, bank_account, merchant_key, usage_count)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(account, bank_account, merchant_key) DO UPDATE SET
            usage_count = excluded.usage_count
        "#,
    )?;

    for (bank_account, key, count) in registry.entries() {
        stmt.execute(params![account, bank_account, key, count as i64])?;
    }
    Ok(())
}

pub(super) fn load_registry(conn: &Connection, account: &str) -> Result<MerchantRegistry> {
    let mut stmt = conn.prepare(
        "SELECT bank_account, merchant_key, usage_count FROM merchant_keys WHERE account = ?",
    )?;

    let mut registry = MerchantRegistry::new();
    let rows = stmt.query_map(params![account], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;
    for row in rows {
        let (bank_account, key, count) = row?;
        registry.insert(&bank_account, &key, count.max(0) as u64);
    }
    Ok(registry)
}
