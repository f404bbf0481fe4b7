use std::sync::OnceLock;

use chrono::NaiveDate;
use ledgerline_core::{Direction, Money, NormalizedTransaction};
use regex::Regex;

use crate::hash::sha256_hex;
use crate::parser::RawRow;

// ── Compiled regex cache ─────────────────────────────────────────────────────

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static R: OnceLock<Regex> = OnceLock::new();
            R.get_or_init(|| Regex::new($pat).expect("invalid regex"))
        }
    };
}

re!(re_processor_prefix,
    r"(?i)^(?:(?:SQ|SP|TST|PP|PAYPAL|ZLR|LS|GOOGLE|APPLE\.COM/BILL|AMZN MKTP)\s*\*\s*|EFTPOS\s+|POS\s+|DIRECT\s+DEBIT\s+|VISA\s+(?:DEBIT\s+)?PURCHASE\s+(?:CARD\s+\d+\s+)?|CARD\s+\d{4}\s+|PURCHASE\s+AUTHORI[SZ]ATION\s+)+");
re!(re_trailing_noise,
    r"(?i)\s+(?:AUS|AU|USA|US|GBR|NZ)?\s*(?:CARD\s+\d{4}|VALUE\s+DATE:?\s*\S+|REF(?:ERENCE)?(?:\s*[:#]\s*|\s+)\S+)\s*$");
re!(re_bpay,
    r"(?i)\bBPAY\s*(?:BILLER\s*(?:CODE)?\s*:?\s*)?(\d{3,10})\b");
re!(re_whitespace, r"\s+");

const FINGERPRINT_DESCRIPTION_CHARS: usize = 50;

/// Standardized merchant: processor boilerplate and store numbers removed,
/// whitespace collapsed, uppercased. Used as the join key for merchant rules and
/// recurring detection.
pub fn clean_merchant(description: &str) -> String {
    let upper = description.trim().to_uppercase();
    let stripped = re_processor_prefix().replace(&upper, "");
    let stripped = re_trailing_noise().replace(&stripped, "");

    let tokens: Vec<&str> = stripped
        .split_whitespace()
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit() || c == '#'))
        .collect();

    let cleaned = tokens.join(" ");
    let cleaned = cleaned.trim_matches(|c: char| c == '*' || c == '-' || c.is_whitespace());
    if cleaned.is_empty() {
        // Everything was boilerplate; fall back to the collapsed original.
        re_whitespace().replace_all(&upper, " ").trim().to_string()
    } else {
        cleaned.to_string()
    }
}

pub fn extract_bpay_biller_code(description: &str) -> Option<String> {
    re_bpay()
        .captures(description)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// SHA-256 over `date | signed amount | compacted description`.
///
/// Whitespace and case in the description never change the result, and the
/// amount is signed so a refund never collides with the matching purchase.
pub fn fingerprint(date: NaiveDate, signed_cents: i64, description: &str) -> String {
    let compact: String = description
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .take(FINGERPRINT_DESCRIPTION_CHARS)
        .collect();
    let key = format!(
        "{}|{}|{}",
        date.format("%Y-%m-%d"),
        Money::from_cents(signed_cents).to_plain_string(),
        compact
    );
    sha256_hex(key.as_bytes())
}

/// Stand-in for rows that lack a required field. Real fingerprints are 64 hex
/// characters, so this can never match one.
pub fn placeholder_fingerprint(row_number: usize) -> String {
    format!("invalid-{row_number}")
}

pub fn is_placeholder(fingerprint: &str) -> bool {
    fingerprint.starts_with("invalid-")
}

/// Resolves sign and direction into a non-negative amount plus explicit direction.
///
/// An explicit direction is trusted and the amount taken as magnitude; otherwise
/// the sign decides.
pub fn resolve_direction(amount_cents: i64, explicit: Option<Direction>) -> (Direction, i64) {
    match explicit {
        Some(direction) => (direction, amount_cents.saturating_abs()),
        None => Direction::from_signed(amount_cents),
    }
}

/// Fingerprint recorded for a raw audit row, whether or not it parsed.
pub fn row_fingerprint(row: &RawRow) -> String {
    match &row.values {
        Some(v) => {
            let (direction, magnitude) = resolve_direction(v.amount_cents, v.direction);
            fingerprint(v.date, direction.apply_sign(magnitude), &v.description)
        }
        None => placeholder_fingerprint(row.row_number),
    }
}

pub fn normalize_row(row: &RawRow) -> Option<NormalizedTransaction> {
    let v = row.values.as_ref()?;
    let (direction, amount_cents) = resolve_direction(v.amount_cents, v.direction);
    let description = v.description.trim().to_string();
    Some(NormalizedTransaction {
        row_number: row.row_number,
        date: v.date,
        amount_cents,
        direction,
        merchant: clean_merchant(&description),
        fingerprint: fingerprint(v.date, direction.apply_sign(amount_cents), &description),
        mcc: row.mcc.clone(),
        bpay_biller_code: extract_bpay_biller_code(&description),
        reference: row.fields.reference.clone(),
        balance_cents: v.balance_cents,
        description,
    })
}

/// Normalizes every row that parsed; rows with errors are left behind.
pub fn normalize_rows<'a>(rows: impl IntoIterator<Item = &'a RawRow>) -> Vec<NormalizedTransaction> {
    rows.into_iter().filter_map(normalize_row).collect()
}
