//! Database tests

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal_macros::dec;

use super::*;
use crate::config::DetectionConfig;
use crate::ledger::Ledger;
use crate::models::*;

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

fn spotify_quarter() -> Vec<RawRecord> {
    vec![
        record(1, "2024-01-05", "-10.99", "SPOTIFY 1234567"),
        record(2, "2024-02-05", "-10.99", "SPOTIFY 7654321"),
        record(3, "2024-03-05", "-10.99", "SPOTIFY 1111111"),
        record(4, "2024-03-09", "-42.00", "CORNER DELI"),
    ]
}

#[test]
fn test_in_memory_db() {
    let db = Database::in_memory().unwrap();
    assert!(db.list_accounts().unwrap().is_empty());
    assert!(db.load_account("alice").unwrap().is_none());
}

#[test]
fn test_subscription_ids_are_never_reused() {
    let db = Database::in_memory().unwrap();
    assert_eq!(db.allocate_subscription_id("alice").unwrap(), 1);
    assert_eq!(db.allocate_subscription_id("bob").unwrap(), 2);

    let reopened = Database::new(db.path()).unwrap();
    assert_eq!(reopened.allocate_subscription_id("alice").unwrap(), 3);
}

#[test]
fn test_schema_tables_exist() {
    let db = Database::in_memory().unwrap();
    let conn = db.conn().unwrap();

    for table in [
        "account_versions",
        "transactions",
        "subscriptions",
        "subscription_transactions",
        "merchant_keys",
        "subscription_ids",
    ] {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
                params![table],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1, "missing table {}", table);
    }
}

#[test]
fn test_account_state_round_trip() {
    let db = Arc::new(Database::in_memory().unwrap());
    let ledger = Ledger::with_store(DetectionConfig::default(), db.clone());
    ledger
        .ingest("alice", &spotify_quarter(), SignConvention::DebitsNegative, date(2024, 3, 10))
        .unwrap();
    let id = ledger.list("alice").unwrap()[0].id;
    ledger.cancel("alice", id, date(2024, 3, 12)).unwrap();

    let expected = ledger.snapshot("alice").unwrap();
    let loaded = db.load_account("alice").unwrap().unwrap();

    assert_eq!(loaded, *expected);
    assert_eq!(loaded.version, 2);
    assert_eq!(db.account_version("alice").unwrap(), Some(2));
    assert_eq!(db.list_accounts().unwrap(), vec!["alice".to_string()]);
}

#[test]
fn test_reopened_ledger_continues_ids() {
    let db = Arc::new(Database::in_memory().unwrap());
    {
        let ledger = Ledger::with_store(DetectionConfig::default(), db.clone());
        ledger
            .ingest("alice", &spotify_quarter(), SignConvention::DebitsNegative, date(2024, 3, 10))
            .unwrap();
    }

    let reopened = Ledger::with_store(DetectionConfig::default(), db.clone());
    let alice = reopened.list("alice").unwrap();
    assert_eq!(alice.len(), 1);
    assert_eq!(alice[0].name, "Spotify");

    reopened
        .ingest("bob", &spotify_quarter(), SignConvention::DebitsNegative, date(2024, 3, 10))
        .unwrap();
    let bob = reopened.list("bob").unwrap();
    assert_eq!(bob[0].id, alice[0].id + 1);
}

#[test]
fn test_reupload_stores_nothing_new() {
    let db = Arc::new(Database::in_memory().unwrap());
    let ledger = Ledger::with_store(DetectionConfig::default(), db.clone());
    ledger
        .ingest("alice", &spotify_quarter(), SignConvention::DebitsNegative, date(2024, 3, 10))
        .unwrap();
    let again = ledger
        .ingest("alice", &spotify_quarter(), SignConvention::DebitsNegative, date(2024, 3, 10))
        .unwrap();
    assert_eq!(again.transactions_added, 0);
    assert_eq!(again.duplicates_skipped, 4);

    let conn = db.conn().unwrap();
    let stored: i64 = conn
        .query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))
        .unwrap();
    assert_eq!(stored, 4);
}

#[test]
fn test_stale_save_is_conflict() {
    let db = Arc::new(Database::in_memory().unwrap());
    let ledger = Ledger::with_store(DetectionConfig::default(), db.clone());
    ledger
        .ingest("alice", &spotify_quarter(), SignConvention::DebitsNegative, date(2024, 3, 10))
        .unwrap();

    let stale = ledger.snapshot("alice").unwrap();
    let err = db.save_account(&stale).unwrap_err();
    assert!(matches!(err, Error::ConcurrentMutationConflict(_)));
}

fn monthly(desc: &str, amount: &str) -> Vec<RawRecord> {
    ["2024-01-01", "2024-02-01", "2024-03-01"]
        .iter()
        .enumerate()
        .map(|(i, d)| record(i + 1, d, amount, desc))
        .collect()
}

#[test]
fn test_two_handles_on_one_file_keep_accounts_apart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let path = path.to_str().unwrap();

    let first = Ledger::with_store(DetectionConfig::default(), Arc::new(Database::new(path).unwrap()));
    let second = Ledger::with_store(DetectionConfig::default(), Arc::new(Database::new(path).unwrap()));
    first
        .ingest("alice", &monthly("NETFLIX 1234", "-499"), SignConvention::DebitsNegative, date(2024, 3, 10))
        .unwrap();
    second
        .ingest("bob", &monthly("GYM PASS", "-30"), SignConvention::DebitsNegative, date(2024, 3, 10))
        .unwrap();

    let reopened = Ledger::with_store(DetectionConfig::default(), Arc::new(Database::new(path).unwrap()));
    let alice = reopened.list("alice").unwrap();
    let bob = reopened.list("bob").unwrap();
    assert_eq!(alice.len(), 1);
    assert_eq!(bob.len(), 1);
    assert_eq!(alice[0].name, "Netflix");
    assert_eq!(alice[0].amount, dec!(499));
    assert_eq!(alice[0].last_seen, date(2024, 3, 1));
    assert_eq!(bob[0].name, "Gym Pass");
    assert_eq!(bob[0].amount, dec!(30));
    assert_ne!(alice[0].id, bob[0].id);

    let alice_charges = reopened.get("alice", alice[0].id).unwrap().transactions;
    assert_eq!(alice_charges.len(), 3);
}

#[test]
fn test_stale_handle_reloads_after_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let path = path.to_str().unwrap();

    let first = Ledger::with_store(DetectionConfig::default(), Arc::new(Database::new(path).unwrap()));
    let second = Ledger::with_store(DetectionConfig::default(), Arc::new(Database::new(path).unwrap()));
    let sign = SignConvention::DebitsNegative;

    first
        .ingest("alice", &[record(1, "2024-01-01", "-499", "NETFLIX 1234")], sign, date(2024, 1, 1))
        .unwrap();
    second
        .ingest("alice", &[record(1, "2024-02-01", "-499", "NETFLIX 1234")], sign, date(2024, 2, 1))
        .unwrap();

    let march = [record(1, "2024-03-01", "-499", "NETFLIX 1234")];
    let err = first.ingest("alice", &march, sign, date(2024, 3, 1)).unwrap_err();
    assert!(err.is_retryable());

    first.ingest("alice", &march, sign, date(2024, 3, 1)).unwrap();
    let state = first.snapshot("alice").unwrap();
    assert_eq!(state.version, 3);
    assert_eq!(state.transactions.len(), 3);
    assert_eq!(state.subscriptions.len(), 1);
    assert_eq!(state.subscriptions[0].transactions.len(), 3);
    assert_eq!(db_version(path, "alice"), Some(3));
}

fn db_version(path: &str, account: &str) -> Option<u64> {
    Database::new(path).unwrap().account_version(account).unwrap()
}

#[test]
fn test_foreign_subscription_id_is_conflict() {
    let db = Arc::new(Database::in_memory().unwrap());
    let ledger = Ledger::with_store(DetectionConfig::default(), db.clone());
    ledger
        .ingest("alice", &spotify_quarter(), SignConvention::DebitsNegative, date(2024, 3, 10))
        .unwrap();

    let mut forged = (*ledger.snapshot("alice").unwrap()).clone();
    forged.account = "bob".to_string();
    forged.version = 1;
    let err = db.save_account(&forged).unwrap_err();
    assert!(matches!(err, Error::ConcurrentMutationConflict(_)));

    assert_eq!(db.account_version("bob").unwrap(), None);
    assert_eq!(db.load_account("alice").unwrap().unwrap().subscriptions.len(), 1);
}
