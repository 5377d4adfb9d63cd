//! Transaction normalization
//!
//! Turns raw statement rows into canonical [`Transaction`]s. Bank exports differ
//! in date layout, currency decoration and how they sign payments; everything
//! downstream sees negative = outgoing.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use calamine::{open_workbook_auto, Data, DataType, Reader};
use chrono::{Datelike, NaiveDate};
use csv::ReaderBuilder;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Error, FieldError, Result};
use crate::models::{
    RawRecord, RejectedRecord, SignConvention, Statement, Transaction, DEFAULT_BANK_ACCOUNT,
};

/// Date layouts tried in order; day-first wins over month-first
const DATE_FORMATS: [&str; 10] = [
    "%Y-%m-%d",  // 2024-01-15
    "%d-%m-%Y",  // 15-01-2024
    "%d/%m/%Y",  // 15/01/2024
    "%m/%d/%Y",  // 01/15/2024
    "%d-%m-%y",  // 15-01-24
    "%d/%m/%y",  // 15/01/24
    "%m/%d/%y",  // 01/15/24
    "%d %b %Y",  // 15 Jan 2024
    "%d-%b-%Y",  // 15-Jan-2024
    "%b %d, %Y", // Jan 15, 2024
];

/// Currency decorations removed before parsing, longest first
const CURRENCY_TOKENS: [&str; 7] = ["INR", "Rs.", "Rs", "$", "₹", "€", "£"];

const DESCRIPTION_KEYWORDS: [&str; 7] = [
    "raw_description",
    "raw_desc",
    "description",
    "desc",
    "merchant",
    "narration",
    "details",
];

/// Parse a date string in any of the supported statement layouts
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            // %Y happily reads two digits; "15-01-24" is not year 15
            if date.year() >= 1900 {
                return Some(date);
            }
        }
    }

    // ISO timestamps: keep the date part
    match (s.get(..10), s.get(10..11)) {
        (Some(day), Some("T" | " ")) => NaiveDate::parse_from_str(day, "%Y-%m-%d").ok(),
        _ => None,
    }
}

/// How an amount cell marked itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Debit,
    Credit,
}

fn parse_marker(s: &str) -> Option<Marker> {
    match s.trim().to_lowercase().as_str() {
        "debit" | "dr" | "withdrawal" | "d" => Some(Marker::Debit),
        "credit" | "cr" | "deposit" | "c" => Some(Marker::Credit),
        _ => None,
    }
}

/// Parse an amount cell, returning the written value and any CR/DR marker
fn parse_amount_cell(s: &str) -> Option<(Decimal, Option<Marker>)> {
    let mut cleaned = s.trim().to_string();
    for token in CURRENCY_TOKENS {
        cleaned = cleaned.replace(token, "");
    }
    cleaned.retain(|c| c != ',' && !c.is_whitespace());

    let upper = cleaned.to_ascii_uppercase();
    let marker = if upper.ends_with("CR") {
        Some(Marker::Credit)
    } else if upper.ends_with("DR") {
        Some(Marker::Debit)
    } else {
        None
    };
    if marker.is_some() {
        cleaned.truncate(cleaned.len() - 2);
    }

    let negative_parens = cleaned.starts_with('(') && cleaned.ends_with(')');
    if negative_parens {
        cleaned = format!("-{}", &cleaned[1..cleaned.len() - 1]);
    }

    let value = Decimal::from_str(&cleaned).ok()?;
    Some((value, marker))
}

/// Parse an amount string, handling currency symbols, separators and markers
///
/// The result follows the statement's own sign; see [`normalize_record`] for
/// the account-level convention.
pub fn parse_amount(s: &str) -> Option<Decimal> {
    parse_amount_cell(s).map(|(value, marker)| match marker {
        Some(Marker::Debit) => -value.abs(),
        Some(Marker::Credit) => value.abs(),
        None => value,
    })
}

/// Content hash identifying a transaction across re-uploads
///
/// `occurrence` separates identical rows inside one upload (a genuine
/// same-day double charge).
pub fn transaction_id(
    account: &str,
    bank_account: &str,
    date: NaiveDate,
    amount: Decimal,
    description: &str,
    reference: Option<&str>,
    occurrence: usize,
) -> String {
    let date = date.to_string();
    let amount = amount.normalize().to_string();

    let mut hasher = Sha256::new();
    for part in [
        account,
        bank_account,
        date.as_str(),
        amount.as_str(),
        description,
        reference.unwrap_or(""),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hasher.update(occurrence.to_be_bytes());
    hex::encode(hasher.finalize())
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Normalize one raw record into a transaction
///
/// All field problems are reported together in a `MalformedRecord`.
pub fn normalize_record(
    account: &str,
    record: &RawRecord,
    sign: SignConvention,
) -> Result<Transaction> {
    let mut errors = Vec::new();

    let date = match non_empty(&record.date) {
        Some(raw) => {
            let parsed = parse_date(raw);
            if parsed.is_none() {
                errors.push(FieldError::new("date", format!("unrecognized date '{}'", raw)));
            }
            parsed
        }
        None => {
            errors.push(FieldError::new("date", "missing"));
            None
        }
    };

    let amount = match non_empty(&record.amount) {
        Some(raw) => {
            let parsed = parse_amount_cell(raw);
            if parsed.is_none() {
                errors.push(FieldError::new("amount", format!("not a number: '{}'", raw)));
            }
            parsed
        }
        None => {
            errors.push(FieldError::new("amount", "missing"));
            None
        }
    };

    let description = non_empty(&record.description);
    if description.is_none() {
        errors.push(FieldError::new("description", "missing"));
    }

    let (Some(date), Some((value, marker)), Some(description)) = (date, amount, description)
    else {
        return Err(Error::MalformedRecord {
            row: record.row,
            errors,
        });
    };

    // Type column beats the cell marker, which beats the account convention
    let type_marker = non_empty(&record.transaction_type).and_then(parse_marker);
    let amount = match type_marker.or(marker) {
        Some(Marker::Debit) => -value.abs(),
        Some(Marker::Credit) => value.abs(),
        None => match sign {
            SignConvention::DebitsNegative => value,
            SignConvention::DebitsPositive => -value,
        },
    };

    let bank_account = non_empty(&record.bank_account)
        .unwrap_or(DEFAULT_BANK_ACCOUNT)
        .to_string();
    let reference = non_empty(&record.reference).map(str::to_string);

    Ok(Transaction {
        id: transaction_id(
            account,
            &bank_account,
            date,
            amount,
            description,
            reference.as_deref(),
            0,
        ),
        bank_account,
        date,
        amount,
        description: description.to_string(),
        merchant_key: String::new(),
        reference,
        row: record.row,
    })
}

/// Result of normalizing one upload
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub transactions: Vec<Transaction>,
    pub rejected: Vec<RejectedRecord>,
}

/// Normalize every record of an upload, collecting rejects instead of failing
pub fn normalize_batch(
    account: &str,
    records: &[RawRecord],
    sign: SignConvention,
) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for record in records {
        match normalize_record(account, record, sign) {
            Ok(mut tx) => {
                let occurrence = seen.entry(tx.id.clone()).or_insert(0);
                if *occurrence > 0 {
                    tx.id = transaction_id(
                        account,
                        &tx.bank_account,
                        tx.date,
                        tx.amount,
                        &tx.description,
                        tx.reference.as_deref(),
                        *occurrence,
                    );
                }
                *occurrence += 1;
                batch.transactions.push(tx);
            }
            Err(Error::MalformedRecord { row, errors }) => {
                warn!(
                    "Rejected row {}: {}",
                    row,
                    errors
                        .iter()
                        .map(|e| e.to_string())
                        .collect::<Vec<_>>()
                        .join("; ")
                );
                batch.rejected.push(RejectedRecord { row, errors });
            }
            Err(e) => {
                batch.rejected.push(RejectedRecord {
                    row: record.row,
                    errors: vec![FieldError::new("record", e.to_string())],
                });
            }
        }
    }

    debug!(
        "Normalized {} transactions ({} rejected)",
        batch.transactions.len(),
        batch.rejected.len()
    );
    batch
}

/// Column positions discovered from a CSV header
#[derive(Debug, Default)]
struct ColumnMap {
    date: Option<usize>,
    amount: Option<usize>,
    description: Option<usize>,
    bank_account: Option<usize>,
    transaction_type: Option<usize>,
    reference: Option<usize>,
}

fn normalize_header(h: &str) -> String {
    h.trim()
        .trim_start_matches('\u{feff}')
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

fn find_column(headers: &[String], keywords: &[&str], taken: &[Option<usize>]) -> Option<usize> {
    keywords.iter().find_map(|kw| {
        headers
            .iter()
            .enumerate()
            .find(|(i, h)| h.contains(kw) && !taken.contains(&Some(*i)))
            .map(|(i, _)| i)
    })
}

impl ColumnMap {
    fn discover(headers: &[String]) -> Self {
        let mut map = ColumnMap::default();
        map.date = find_column(headers, &["date"], &[]);
        map.amount = find_column(headers, &["amount", "amt"], &[map.date]);
        map.description =
            find_column(headers, &DESCRIPTION_KEYWORDS, &[map.date, map.amount]);
        let taken = [map.date, map.amount, map.description];
        map.bank_account = find_column(headers, &["account", "bank", "card"], &taken);
        let taken = [map.date, map.amount, map.description, map.bank_account];
        map.transaction_type = find_column(headers, &["type"], &taken);
        let taken = [
            map.date,
            map.amount,
            map.description,
            map.bank_account,
            map.transaction_type,
        ];
        map.reference = find_column(headers, &["reference", "ref"], &taken);
        map
    }

    fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.date.is_none() {
            missing.push("date");
        }
        if self.amount.is_none() {
            missing.push("amount");
        }
        if self.description.is_none() {
            missing.push("description");
        }
        missing
    }

    /// Discover columns, failing the whole file when a required one is absent
    fn from_headers(headers: &[String]) -> Result<Self> {
        let columns = Self::discover(headers);
        let missing = columns.missing();
        if missing.is_empty() {
            return Ok(columns);
        }

        let found = headers.join(", ");
        Err(Error::Validation(
            missing
                .into_iter()
                .map(|field| FieldError::new(field, format!("no {} column (found: {})", field, found)))
                .collect(),
        ))
    }

    fn record(&self, row: usize, cells: &[Option<String>]) -> RawRecord {
        let cell = |idx: Option<usize>| idx.and_then(|i| cells.get(i).cloned().flatten());
        RawRecord {
            row,
            date: cell(self.date),
            amount: cell(self.amount),
            description: cell(self.description),
            bank_account: cell(self.bank_account),
            transaction_type: cell(self.transaction_type),
            reference: cell(self.reference),
        }
    }
}

fn non_blank(text: &str) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Read a CSV statement
///
/// Columns are found by keyword, so most bank exports work without a
/// per-bank parser. A header lacking date, amount or description fails the
/// whole file; a row that is not valid UTF-8 is rejected on its own.
pub fn read_csv<R: Read>(reader: R) -> Result<Statement> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers: Vec<String> = rdr
        .byte_headers()?
        .iter()
        .map(|h| normalize_header(&String::from_utf8_lossy(h)))
        .collect();
    let columns = ColumnMap::from_headers(&headers)?;

    let mut statement = Statement::default();
    for (i, result) in rdr.byte_records().enumerate() {
        let record = result?;
        let row = i + 1;

        let mut cells = Vec::with_capacity(record.len());
        let mut errors = Vec::new();
        for (col, field) in record.iter().enumerate() {
            match std::str::from_utf8(field) {
                Ok(text) => cells.push(non_blank(text)),
                Err(e) => {
                    let column = headers.get(col).map_or("?", String::as_str);
                    errors.push(FieldError::new(
                        "encoding",
                        format!(
                            "column '{}' is not valid UTF-8 (bad byte at {})",
                            column,
                            e.valid_up_to()
                        ),
                    ));
                    cells.push(None);
                }
            }
        }

        if !errors.is_empty() {
            warn!("Rejected row {}: not valid UTF-8", row);
            statement.rejected.push(RejectedRecord { row, errors });
            continue;
        }
        if cells.iter().all(Option::is_none) {
            continue;
        }
        statement.records.push(columns.record(row, &cells));
    }

    debug!(
        "Read {} rows from CSV ({} undecodable)",
        statement.records.len(),
        statement.rejected.len()
    );
    Ok(statement)
}

/// Text of one spreadsheet cell, as a CSV export would show it
fn cell_text(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty => None,
        Data::String(s) => non_blank(s),
        Data::DateTime(_) | Data::DateTimeIso(_) => {
            cell.as_date().map(|d| d.format("%Y-%m-%d").to_string())
        }
        other => non_blank(&other.to_string()),
    }
}

/// Whether a file name looks like a spreadsheet statement
pub fn is_spreadsheet(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            matches!(
                ext.to_ascii_lowercase().as_str(),
                "xlsx" | "xlsm" | "xlsb" | "xls" | "ods"
            )
        })
}

/// Read the first sheet of an Excel workbook
///
/// The first row is the header; columns are discovered the same way as for
/// CSV.
pub fn read_excel(path: &Path) -> Result<Statement> {
    let mut workbook = open_workbook_auto(path)?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| Error::Validation(vec![FieldError::new("file", "workbook has no sheets")]))??;

    let mut rows = range.rows();
    let Some(header_row) = rows.next() else {
        return Err(Error::Validation(vec![FieldError::new(
            "file",
            "first sheet is empty",
        )]));
    };
    let headers: Vec<String> = header_row
        .iter()
        .map(|cell| normalize_header(&cell.to_string()))
        .collect();
    let columns = ColumnMap::from_headers(&headers)?;

    let mut statement = Statement::default();
    for (i, row) in rows.enumerate() {
        let cells: Vec<Option<String>> = row.iter().map(cell_text).collect();
        if cells.iter().all(Option::is_none) {
            continue;
        }
        statement.records.push(columns.record(i + 1, &cells));
    }

    debug!(
        "Read {} rows from {}",
        statement.records.len(),
        path.display()
    );
    Ok(statement)
}
