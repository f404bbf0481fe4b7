use chrono::NaiveDate;
use ledgerline_core::{Direction, FileFormat, RawFields};
use serde::Serialize;
use thiserror::Error;

use crate::csv::{self, ParseOptions};

/// File-level parse failures. Row-level problems are reported as [`RowError`]s instead.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("CSV error: {0}")]
    Csv(#[from] ::csv::Error),
    #[error("Missing required column: {0}")]
    MissingColumn(String),
    #[error("Invalid parse options: {0}")]
    InvalidOptions(String),
    #[error("{0} import is not implemented yet")]
    NotImplemented(FileFormat),
    #[error("No data rows")]
    NoDataRows,
}

/// A row that could not yield the minimum required fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    pub row_number: usize,
    pub message: String,
}

impl RowError {
    pub fn new(row_number: usize, message: impl Into<String>) -> Self {
        RowError {
            row_number,
            message: message.into(),
        }
    }
}

/// Typed values extracted from a row that passed required-field checks.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedValues {
    pub date: NaiveDate,
    /// Signed as the source presented it; sign is meaningless when `direction` is set.
    pub amount_cents: i64,
    pub direction: Option<Direction>,
    pub description: String,
    pub balance_cents: Option<i64>,
}

/// One source record, kept whether or not it parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// 1-based position among the data rows.
    pub row_number: usize,
    pub fields: RawFields,
    pub mcc: Option<String>,
    pub row_hash: String,
    pub values: Option<ParsedValues>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedFile {
    pub rows: Vec<RawRow>,
    pub errors: Vec<RowError>,
    /// Every data record read, including ones that could not be decoded at all.
    pub total_rows: usize,
    pub closing_balance_cents: Option<i64>,
}

impl ParsedFile {
    pub fn valid_rows(&self) -> impl Iterator<Item = &RawRow> {
        self.rows.iter().filter(|r| r.values.is_some())
    }

    /// Balance of the most recent row. Handles both oldest-first and newest-first exports.
    pub(crate) fn derive_closing_balance(rows: &[RawRow]) -> Option<i64> {
        let dated: Vec<(&ParsedValues, i64)> = rows
            .iter()
            .filter_map(|r| r.values.as_ref())
            .filter_map(|v| v.balance_cents.map(|b| (v, b)))
            .collect();
        let (first, _) = dated.first()?;
        let (last, _) = dated.last()?;
        let latest = dated.iter().map(|(v, _)| v.date).max()?;

        let mut at_latest = dated.iter().filter(|(v, _)| v.date == latest);
        let newest_first = first.date > last.date;
        let pick = if newest_first {
            at_latest.next()
        } else {
            at_latest.last()
        };
        pick.map(|(_, b)| *b)
    }
}

/// Decodes upload bytes as UTF-8, dropping a byte-order mark and replacing invalid sequences.
pub fn decode(data: &[u8]) -> String {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    String::from_utf8_lossy(data).into_owned()
}

/// Parses decoded statement text of the declared format.
pub fn parse_statement(
    text: &str,
    format: FileFormat,
    options: &ParseOptions,
) -> Result<ParsedFile, ParseError> {
    match format {
        FileFormat::Csv => csv::parse_csv(text, options),
        FileFormat::Ofx | FileFormat::Qif => Err(ParseError::NotImplemented(format)),
    }
}
