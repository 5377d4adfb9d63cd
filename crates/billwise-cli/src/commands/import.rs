//! Import command implementation

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use billwise_core::normalize::is_spreadsheet;
use billwise_core::{Engine, IngestResult, SignConvention};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::warn;

use super::print_json;

/// Attempts per file when another import holds the account lock
const MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Serialize)]
pub struct FileImport {
    pub file: PathBuf,
    #[serde(flatten)]
    pub result: IngestResult,
}

fn import_file(
    engine: &Engine,
    account: &str,
    file: &Path,
    sign: SignConvention,
    as_of: NaiveDate,
) -> Result<IngestResult> {
    let mut attempt = 1;
    loop {
        let outcome = if is_spreadsheet(file) {
            engine.ingest_excel(account, file, sign, as_of)
        } else {
            let csv_file = File::open(file)
                .with_context(|| format!("Failed to open file: {}", file.display()))?;
            engine.ingest_csv(account, BufReader::new(csv_file), sign, as_of)
        };
        match outcome {
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                warn!("{} (attempt {} of {})", e, attempt, MAX_ATTEMPTS);
                attempt += 1;
            }
            other => {
                return other.with_context(|| format!("Failed to import {}", file.display()))
            }
        }
    }
}

/// Import statements concurrently; the ledger serializes writes per account
pub async fn cmd_import(
    engine: Arc<Engine>,
    account: &str,
    files: &[PathBuf],
    sign: SignConvention,
    as_of: NaiveDate,
    json: bool,
) -> Result<()> {
    if !json {
        println!(
            "📥 Importing {} file(s) into '{}' ({})...",
            files.len(),
            account,
            sign
        );
    }

    let handles: Vec<_> = files
        .iter()
        .cloned()
        .map(|file| {
            let engine = engine.clone();
            let account = account.to_string();
            tokio::task::spawn_blocking(move || {
                let result = import_file(&engine, &account, &file, sign, as_of);
                (file, result)
            })
        })
        .collect();

    let mut imported = Vec::new();
    let mut failures = 0;
    for handle in handles {
        let (file, result) = handle.await.context("Import task failed")?;
        match result {
            Ok(result) => imported.push(FileImport { file, result }),
            Err(e) => {
                failures += 1;
                eprintln!("❌ {:#}", e);
            }
        }
    }

    if json {
        print_json(&imported)?;
    } else {
        for FileImport { file, result } in &imported {
            println!();
            println!("✅ {}", file.display());
            println!("   Imported: {}", result.transactions_added);
            println!("   Skipped (duplicates): {}", result.duplicates_skipped);
            println!(
                "   Subscriptions: {} detected ({} new)",
                result.subscriptions_detected, result.new_subscriptions
            );
            if result.ambiguous_merchants > 0 {
                println!("   Ambiguous merchants: {}", result.ambiguous_merchants);
                for warning in &result.warnings {
                    println!("     row {}: {}", warning.row, warning.message);
                }
            }
            if !result.rejected.is_empty() {
                println!("   Rejected rows: {}", result.rejected.len());
                for rejected in &result.rejected {
                    let reasons: Vec<String> =
                        rejected.errors.iter().map(|e| e.to_string()).collect();
                    println!("     row {}: {}", rejected.row, reasons.join("; "));
                }
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} file(s) failed to import", failures, files.len());
    }
    Ok(())
}
