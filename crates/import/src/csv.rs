use chrono::NaiveDate;
use ledgerline_core::{Direction, Money, RawFields};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::debug;

use crate::hash;
use crate::parser::{ParseError, ParsedFile, ParsedValues, RawRow, RowError};

/// A column addressed either by zero-based position or by header name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnRef {
    Index(usize),
    Name(String),
}

/// Explicit column-to-field mapping. Unset fields are simply not read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMapping {
    pub date: Option<ColumnRef>,
    pub description: Option<ColumnRef>,
    pub amount: Option<ColumnRef>,
    pub debit: Option<ColumnRef>,
    pub credit: Option<ColumnRef>,
    pub direction: Option<ColumnRef>,
    pub balance: Option<ColumnRef>,
    pub reference: Option<ColumnRef>,
    pub mcc: Option<ColumnRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseOptions {
    /// When absent, columns are found from header names (or fixed positions without a header).
    pub mapping: Option<ColumnMapping>,
    /// chrono format string tried before the built-in fallbacks.
    pub date_format: Option<String>,
    pub delimiter: Option<char>,
    pub has_header: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            mapping: None,
            date_format: None,
            delimiter: None,
            has_header: true,
        }
    }
}

impl ParseOptions {
    /// Rejects configurations that can never parse, before any row is read.
    pub fn validate(&self) -> Result<(), ParseError> {
        if let Some(d) = self.delimiter {
            if !d.is_ascii() || d == '"' || d == '\n' || d == '\r' {
                return Err(ParseError::InvalidOptions(format!(
                    "delimiter must be a single ASCII character other than quote or newline, got {d:?}"
                )));
            }
        }
        if let Some(fmt) = &self.date_format {
            if fmt.trim().is_empty() || !fmt.contains('%') {
                return Err(ParseError::InvalidOptions(format!(
                    "date_format '{fmt}' is not a chrono format string"
                )));
            }
        }
        if let Some(m) = &self.mapping {
            if m.date.is_none() {
                return Err(ParseError::InvalidOptions("mapping.date is required".into()));
            }
            if m.description.is_none() {
                return Err(ParseError::InvalidOptions(
                    "mapping.description is required".into(),
                ));
            }
            if m.amount.is_none() && m.debit.is_none() && m.credit.is_none() {
                return Err(ParseError::InvalidOptions(
                    "mapping needs amount or debit/credit columns".into(),
                ));
            }
            if !self.has_header {
                let named = [
                    &m.date, &m.description, &m.amount, &m.debit, &m.credit, &m.direction,
                    &m.balance, &m.reference, &m.mcc,
                ]
                .into_iter()
                .flatten()
                .any(|c| matches!(c, ColumnRef::Name(_)));
                if named {
                    return Err(ParseError::InvalidOptions(
                        "columns can only be mapped by name when the file has a header row".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn delimiter_byte(&self) -> u8 {
        self.delimiter.map(|c| c as u8).unwrap_or(b',')
    }
}

/// Column positions after resolving names and defaults against the header.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ResolvedColumns {
    date: usize,
    description: usize,
    amount: Option<usize>,
    debit: Option<usize>,
    credit: Option<usize>,
    direction: Option<usize>,
    balance: Option<usize>,
    reference: Option<usize>,
    mcc: Option<usize>,
}

const DATE_HEADERS: &[&str] = &["date", "transactiondate", "posteddate", "postingdate", "valuedate", "effectivedate"];
const DESCRIPTION_HEADERS: &[&str] = &["description", "narrative", "details", "transactiondetails", "payee", "particulars", "memo"];
const AMOUNT_HEADERS: &[&str] = &["amount", "value", "transactionamount"];
const DEBIT_HEADERS: &[&str] = &["debit", "debitamount", "withdrawal", "withdrawals", "moneyout"];
const CREDIT_HEADERS: &[&str] = &["credit", "creditamount", "deposit", "deposits", "moneyin"];
const BALANCE_HEADERS: &[&str] = &["balance", "runningbalance", "closingbalance"];
const DIRECTION_HEADERS: &[&str] = &["type", "direction", "drcr", "debitcredit", "transactiontype"];
const REFERENCE_HEADERS: &[&str] = &["reference", "ref", "referencenumber", "transactionid", "id"];
const MCC_HEADERS: &[&str] = &["mcc", "merchantcategorycode", "categorycode"];

fn header_key(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn find_header(headers: &[String], candidates: &[&str]) -> Option<usize> {
    let keys: Vec<String> = headers.iter().map(|h| header_key(h)).collect();
    candidates
        .iter()
        .find_map(|c| keys.iter().position(|k| k == c))
}

fn resolve_ref(col: &ColumnRef, headers: Option<&[String]>, field: &str) -> Result<usize, ParseError> {
    match col {
        ColumnRef::Index(i) => Ok(*i),
        ColumnRef::Name(name) => {
            let wanted = header_key(name);
            headers
                .and_then(|h| h.iter().position(|x| header_key(x) == wanted))
                .ok_or_else(|| ParseError::MissingColumn(format!("{field} ('{name}')")))
        }
    }
}

fn resolve_opt(
    col: &Option<ColumnRef>,
    headers: Option<&[String]>,
    field: &str,
) -> Result<Option<usize>, ParseError> {
    col.as_ref().map(|c| resolve_ref(c, headers, field)).transpose()
}

fn resolve_columns(
    options: &ParseOptions,
    headers: Option<&[String]>,
) -> Result<ResolvedColumns, ParseError> {
    if let Some(m) = &options.mapping {
        let date = m
            .date
            .as_ref()
            .ok_or_else(|| ParseError::MissingColumn("date".into()))?;
        let description = m
            .description
            .as_ref()
            .ok_or_else(|| ParseError::MissingColumn("description".into()))?;
        return Ok(ResolvedColumns {
            date: resolve_ref(date, headers, "date")?,
            description: resolve_ref(description, headers, "description")?,
            amount: resolve_opt(&m.amount, headers, "amount")?,
            debit: resolve_opt(&m.debit, headers, "debit")?,
            credit: resolve_opt(&m.credit, headers, "credit")?,
            direction: resolve_opt(&m.direction, headers, "direction")?,
            balance: resolve_opt(&m.balance, headers, "balance")?,
            reference: resolve_opt(&m.reference, headers, "reference")?,
            mcc: resolve_opt(&m.mcc, headers, "mcc")?,
        });
    }

    let Some(headers) = headers else {
        // Headerless files without a mapping: date, amount, description, balance.
        return Ok(ResolvedColumns {
            date: 0,
            description: 2,
            amount: Some(1),
            debit: None,
            credit: None,
            direction: None,
            balance: Some(3),
            reference: None,
            mcc: None,
        });
    };

    let cols = ResolvedColumns {
        date: find_header(headers, DATE_HEADERS)
            .ok_or_else(|| ParseError::MissingColumn("date".into()))?,
        description: find_header(headers, DESCRIPTION_HEADERS)
            .ok_or_else(|| ParseError::MissingColumn("description".into()))?,
        amount: find_header(headers, AMOUNT_HEADERS),
        debit: find_header(headers, DEBIT_HEADERS),
        credit: find_header(headers, CREDIT_HEADERS),
        direction: find_header(headers, DIRECTION_HEADERS),
        balance: find_header(headers, BALANCE_HEADERS),
        reference: find_header(headers, REFERENCE_HEADERS),
        mcc: find_header(headers, MCC_HEADERS),
    };
    if cols.amount.is_none() && cols.debit.is_none() && cols.credit.is_none() {
        return Err(ParseError::MissingColumn("amount".into()));
    }
    Ok(cols)
}

pub(crate) fn parse_date(s: &str, format: Option<&str>) -> Option<NaiveDate> {
    let s = s.trim();

    if let Some(fmt) = format {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return Some(date);
        }
    }

    [
        "%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%Y/%m/%d", "%d-%m-%Y", "%d %b %Y", "%d/%m/%y",
    ]
    .iter()
    .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

/// Parses a currency string into signed cents. Understands symbols, thousands
/// separators, accounting parentheses and trailing `CR`/`DR` markers.
pub(crate) fn parse_amount(s: &str) -> Option<i64> {
    let mut s = s.trim().to_string();
    let mut negative = false;

    let upper = s.to_uppercase();
    if let Some(rest) = upper.strip_suffix("DR") {
        negative = true;
        s = rest.trim().to_string();
    } else if let Some(rest) = upper.strip_suffix("CR") {
        s = rest.trim().to_string();
    }

    if s.starts_with('(') && s.ends_with(')') && s.len() >= 2 {
        negative = !negative;
        s = s[1..s.len() - 1].to_string();
    }

    // Letters may only appear in a short leading currency code (`A$`, `US$`, `AUD`).
    let code_len = s.chars().take_while(char::is_ascii_alphabetic).count();
    if code_len > 3 || s[code_len..].chars().any(char::is_alphabetic) {
        return None;
    }

    let cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let mut dec = Decimal::from_str(cleaned.trim_start_matches('+')).ok()?;
    if negative {
        dec = -dec;
    }
    Money::from_decimal(dec).to_cents()
}

fn cell(record: &::csv::StringRecord, col: Option<usize>) -> Option<String> {
    col.and_then(|c| record.get(c))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Extracts the raw fields of one record and, where possible, its typed values.
fn read_row(
    row_number: usize,
    record: &::csv::StringRecord,
    cols: &ResolvedColumns,
    date_format: Option<&str>,
) -> (RawRow, Option<RowError>) {
    let mut fields = RawFields {
        date: cell(record, Some(cols.date)),
        description: cell(record, Some(cols.description)),
        amount: cell(record, cols.amount),
        direction: cell(record, cols.direction),
        balance: cell(record, cols.balance),
        reference: cell(record, cols.reference),
    };

    let mut amount_result: Result<(i64, Option<Direction>), String> = match &fields.amount {
        Some(raw) => parse_amount(raw)
            .map(|c| (c, None))
            .ok_or_else(|| format!("invalid amount '{raw}'")),
        None => Err("missing amount".to_string()),
    };

    if fields.amount.is_none() && (cols.debit.is_some() || cols.credit.is_some()) {
        let debit = cell(record, cols.debit);
        let credit = cell(record, cols.credit);
        let parsed_debit = debit.as_deref().map(|d| (d, parse_amount(d)));
        let parsed_credit = credit.as_deref().map(|c| (c, parse_amount(c)));
        amount_result = match (parsed_debit, parsed_credit) {
            (Some((raw, None)), _) => Err(format!("invalid debit '{raw}'")),
            (_, Some((raw, None))) => Err(format!("invalid credit '{raw}'")),
            (Some((_, Some(d))), Some((_, Some(c)))) if d != 0 && c != 0 => {
                Err("both debit and credit are filled".to_string())
            }
            (Some((raw, Some(d))), other) if d != 0 || other.is_none() => {
                fields.amount = Some(raw.to_string());
                fields.direction = Some("DEBIT".to_string());
                Ok((d.abs(), Some(Direction::Out)))
            }
            (_, Some((raw, Some(c)))) => {
                fields.amount = Some(raw.to_string());
                fields.direction = Some("CREDIT".to_string());
                Ok((c.abs(), Some(Direction::In)))
            }
            _ => Err("missing amount".to_string()),
        };
    }

    let raw_cells: Vec<&str> = record.iter().collect();
    let row_hash = hash::row_hash(raw_cells);
    let mcc = cell(record, cols.mcc);

    let values = (|| -> Result<ParsedValues, String> {
        let date_raw = fields.date.as_deref().ok_or("missing date")?;
        let date = parse_date(date_raw, date_format)
            .ok_or_else(|| format!("invalid date '{date_raw}'"))?;
        let description = fields
            .description
            .clone()
            .ok_or("missing description")?;
        let (amount_cents, mut direction) = amount_result.clone()?;
        if direction.is_none() {
            direction = fields.direction.as_deref().and_then(|d| d.parse().ok());
        }
        let balance_cents = fields.balance.as_deref().and_then(parse_amount);
        Ok(ParsedValues {
            date,
            amount_cents,
            direction,
            description,
            balance_cents,
        })
    })();

    match values {
        Ok(values) => (
            RawRow {
                row_number,
                fields,
                mcc,
                row_hash,
                values: Some(values),
            },
            None,
        ),
        Err(reason) => (
            RawRow {
                row_number,
                fields,
                mcc,
                row_hash,
                values: None,
            },
            Some(RowError::new(row_number, reason)),
        ),
    }
}

/// Reads every record, collecting bad rows as errors rather than stopping.
pub fn parse_csv(text: &str, options: &ParseOptions) -> Result<ParsedFile, ParseError> {
    options.validate()?;

    let mut reader = ::csv::ReaderBuilder::new()
        .has_headers(options.has_header)
        .delimiter(options.delimiter_byte())
        .flexible(true)
        .trim(::csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers: Option<Vec<String>> = if options.has_header {
        Some(reader.headers()?.iter().map(str::to_string).collect())
    } else {
        None
    };
    let cols = resolve_columns(options, headers.as_deref())?;
    let date_format = options.date_format.as_deref();

    let mut parsed = ParsedFile::default();
    for (idx, result) in reader.records().enumerate() {
        let row_number = idx + 1;
        parsed.total_rows += 1;

        let record = match result {
            Ok(record) => record,
            Err(e) => {
                parsed.errors.push(RowError::new(row_number, e.to_string()));
                continue;
            }
        };
        if record.iter().all(|f| f.trim().is_empty()) {
            parsed.total_rows -= 1;
            continue;
        }

        let (row, error) = read_row(row_number, &record, &cols, date_format);
        if let Some(error) = error {
            debug!(row = row_number, reason = %error.message, "skipping unparseable row");
            parsed.errors.push(error);
        }
        parsed.rows.push(row);
    }

    if parsed.total_rows == 0 {
        return Err(ParseError::NoDataRows);
    }

    parsed.closing_balance_cents = ParsedFile::derive_closing_balance(&parsed.rows);
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── parse_amount ──────────────────────────────────────────────────────────

    #[test]
    fn parse_amount_plain() {
        assert_eq!(parse_amount("123.45"), Some(12345));
    }

    #[test]
    fn parse_amount_with_symbols_and_commas() {
        assert_eq!(parse_amount("$1,234.56"), Some(123456));
        assert_eq!(parse_amount("A$99.99"), Some(9999));
    }

    #[test]
    fn parse_amount_negative_forms() {
        assert_eq!(parse_amount("-45.00"), Some(-4500));
        assert_eq!(parse_amount("(75.25)"), Some(-7525));
        assert_eq!(parse_amount("12.00 DR"), Some(-1200));
        assert_eq!(parse_amount("12.00 CR"), Some(1200));
        assert_eq!(parse_amount("+5"), Some(500));
    }

    #[test]
    fn parse_amount_invalid() {
        assert_eq!(parse_amount("not_a_number"), None);
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("1.2.3"), None);
    }

    #[test]
    fn parse_amount_rejects_stray_letters() {
        assert_eq!(parse_amount("1e5"), None);
        assert_eq!(parse_amount("12abc34"), None);
        assert_eq!(parse_amount("12.00 XR"), None);
        assert_eq!(parse_amount("AUD 12.50"), Some(1250));
        assert_eq!(parse_amount("US$3.10"), Some(310));
        assert_eq!(parse_amount("12.00 dr"), Some(-1200));
    }

    #[test]
    fn parse_amount_out_of_range_is_none() {
        assert_eq!(parse_amount("79228162514264337593543950335"), None);
        assert_eq!(parse_amount("-92233720368547758.08"), None);
        assert_eq!(parse_amount("(92233720368547758.08)"), None);
    }

    // ── parse_date ────────────────────────────────────────────────────────────

    #[test]
    fn parse_date_hint_wins_over_fallbacks() {
        // 03/04/2024 is 3 April with the day-first hint, not 4 March.
        let d = parse_date("03/04/2024", Some("%d/%m/%Y")).unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2024, 4, 3).unwrap());
        let d = parse_date("03/04/2024", Some("%m/%d/%Y")).unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
    }

    #[test]
    fn parse_date_fallbacks() {
        assert_eq!(
            parse_date("2024-01-15", None),
            NaiveDate::from_ymd_opt(2024, 1, 15)
        );
        assert_eq!(
            parse_date("15 Jan 2024", None),
            NaiveDate::from_ymd_opt(2024, 1, 15)
        );
        assert_eq!(parse_date("not-a-date", None), None);
    }

    // ── header resolution ─────────────────────────────────────────────────────

    #[test]
    fn headers_resolved_by_common_names() {
        let data = "Transaction Date,Narrative,Debit,Credit,Balance\n\
                    05/01/2024,WOOLWORTHS 1234,45.00,,955.00\n\
                    10/01/2024,PAYROLL ACME,,2500.00,3455.00\n";
        let opts = ParseOptions {
            date_format: Some("%d/%m/%Y".into()),
            ..Default::default()
        };
        let parsed = parse_csv(data, &opts).unwrap();
        assert!(parsed.errors.is_empty());
        let v0 = parsed.rows[0].values.as_ref().unwrap();
        assert_eq!(v0.amount_cents, 4500);
        assert_eq!(v0.direction, Some(Direction::Out));
        let v1 = parsed.rows[1].values.as_ref().unwrap();
        assert_eq!(v1.direction, Some(Direction::In));
        assert_eq!(parsed.rows[1].fields.direction.as_deref(), Some("CREDIT"));
        assert_eq!(parsed.closing_balance_cents, Some(345500));
    }

    #[test]
    fn missing_required_header_is_file_error() {
        let data = "When,What\n2024-01-01,thing\n";
        assert!(matches!(
            parse_csv(data, &ParseOptions::default()),
            Err(ParseError::MissingColumn(_))
        ));
    }

    #[test]
    fn headerless_defaults_to_date_amount_description() {
        let data = "2024-01-05,-45.00,WOOLWORTHS 1234\n";
        let opts = ParseOptions {
            has_header: false,
            ..Default::default()
        };
        let parsed = parse_csv(data, &opts).unwrap();
        let v = parsed.rows[0].values.as_ref().unwrap();
        assert_eq!(v.amount_cents, -4500);
        assert_eq!(v.description, "WOOLWORTHS 1234");
        assert_eq!(v.direction, None);
    }

    #[test]
    fn explicit_mapping_by_index_and_name() {
        let data = "ref;when;what;how much;dir\nA1;2024-02-01;RENT;1200.00;DR\n";
        let opts = ParseOptions {
            delimiter: Some(';'),
            mapping: Some(ColumnMapping {
                date: Some(ColumnRef::Index(1)),
                description: Some(ColumnRef::Name("what".into())),
                amount: Some(ColumnRef::Name("How Much".into())),
                direction: Some(ColumnRef::Index(4)),
                reference: Some(ColumnRef::Index(0)),
                ..Default::default()
            }),
            ..Default::default()
        };
        let parsed = parse_csv(data, &opts).unwrap();
        let row = &parsed.rows[0];
        let v = row.values.as_ref().unwrap();
        assert_eq!(v.direction, Some(Direction::Out));
        assert_eq!(v.amount_cents, 120000);
        assert_eq!(row.fields.reference.as_deref(), Some("A1"));
    }

    #[test]
    fn column_ref_deserializes_index_or_name() {
        let m: ColumnMapping =
            serde_json::from_str(r#"{"date":0,"description":"Narrative","amount":2}"#).unwrap();
        assert_eq!(m.date, Some(ColumnRef::Index(0)));
        assert_eq!(m.description, Some(ColumnRef::Name("Narrative".into())));
    }

    #[test]
    fn validate_rejects_bad_options() {
        let bad_delim = ParseOptions {
            delimiter: Some('é'),
            ..Default::default()
        };
        assert!(bad_delim.validate().is_err());

        let no_amount = ParseOptions {
            mapping: Some(ColumnMapping {
                date: Some(ColumnRef::Index(0)),
                description: Some(ColumnRef::Index(1)),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(no_amount.validate(), Err(ParseError::InvalidOptions(_))));

        let named_without_header = ParseOptions {
            has_header: false,
            mapping: Some(ColumnMapping {
                date: Some(ColumnRef::Name("Date".into())),
                description: Some(ColumnRef::Index(1)),
                amount: Some(ColumnRef::Index(2)),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(named_without_header.validate().is_err());
    }

    // ── partial failure ───────────────────────────────────────────────────────

    #[test]
    fn bad_rows_are_collected_not_fatal() {
        let data = "Date,Amount,Description\n\
                    2024-01-05,-45.00,WOOLWORTHS\n\
                    2024-13-45,-10.00,BAD DATE\n\
                    2024-01-07,,NO AMOUNT\n\
                    2024-01-08,-3.50,\n\
                    2024-01-09,-12.00,COLES\n";
        let parsed = parse_csv(data, &ParseOptions::default()).unwrap();
        assert_eq!(parsed.total_rows, 5);
        assert_eq!(parsed.rows.len(), 5);
        assert_eq!(parsed.valid_rows().count(), 2);
        let numbers: Vec<usize> = parsed.errors.iter().map(|e| e.row_number).collect();
        assert_eq!(numbers, vec![2, 3, 4]);
        assert!(parsed.errors[0].message.contains("invalid date"));
        assert!(parsed.errors[1].message.contains("missing amount"));
        assert!(parsed.errors[2].message.contains("missing description"));
    }

    #[test]
    fn out_of_range_amounts_become_row_errors() {
        let data = "Date,Amount,Description\n\
                    2024-01-05,79228162514264337593543950335,HUGE\n\
                    2024-01-06,-92233720368547758.08,MIN\n\
                    2024-01-07,1e5,EXPONENT\n\
                    2024-01-08,-12.00,COLES\n";
        let parsed = parse_csv(data, &ParseOptions::default()).unwrap();
        assert_eq!(parsed.total_rows, 4);
        assert_eq!(parsed.valid_rows().count(), 1);
        let numbers: Vec<usize> = parsed.errors.iter().map(|e| e.row_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(parsed.errors.iter().all(|e| e.message.contains("invalid amount")));
    }

    #[test]
    fn blank_lines_are_not_rows() {
        let data = "Date,Amount,Description\n2024-01-05,-45.00,A\n,,\n2024-01-06,-1.00,B\n";
        let parsed = parse_csv(data, &ParseOptions::default()).unwrap();
        assert_eq!(parsed.total_rows, 2);
        assert_eq!(parsed.rows[1].row_number, 3);
    }

    #[test]
    fn header_only_file_has_no_data_rows() {
        let data = "Date,Amount,Description\n";
        assert!(matches!(
            parse_csv(data, &ParseOptions::default()),
            Err(ParseError::NoDataRows)
        ));
    }
}
