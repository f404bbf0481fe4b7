use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::account::{AccountId, UserId};
use super::recurring::Frequency;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    /// Splits a signed amount into direction and magnitude. Zero counts as `In`.
    pub fn from_signed(cents: i64) -> (Direction, i64) {
        if cents < 0 {
            (Direction::Out, cents.saturating_abs())
        } else {
            (Direction::In, cents)
        }
    }

    pub fn apply_sign(self, magnitude_cents: i64) -> i64 {
        match self {
            Direction::In => magnitude_cents,
            Direction::Out => magnitude_cents.saturating_neg(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    /// Accepts the vocabulary banks use in type/direction columns.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "IN" | "CR" | "C" | "CREDIT" | "DEPOSIT" | "+" => Ok(Direction::In),
            "OUT" | "DR" | "D" | "DEBIT" | "WITHDRAWAL" | "PAYMENT" | "-" => Ok(Direction::Out),
            other => Err(format!("Unknown direction: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionSource {
    Manual,
    Csv,
    Bank,
    Ofx,
}

impl TransactionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionSource::Manual => "MANUAL",
            TransactionSource::Csv => "CSV",
            TransactionSource::Bank => "BANK",
            TransactionSource::Ofx => "OFX",
        }
    }
}

impl FromStr for TransactionSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MANUAL" => Ok(TransactionSource::Manual),
            "CSV" => Ok(TransactionSource::Csv),
            "BANK" => Ok(TransactionSource::Bank),
            "OFX" => Ok(TransactionSource::Ofx),
            other => Err(format!("Unknown transaction source: '{other}'")),
        }
    }
}

/// Two-level category with an optional third-level subcategory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Category {
    pub level1: String,
    pub level2: Option<String>,
    pub subcategory: Option<String>,
}

impl Category {
    pub const OTHER: &'static str = "OTHER";

    pub fn new(level1: &str, level2: Option<&str>) -> Self {
        Category {
            level1: level1.to_string(),
            level2: level2.map(str::to_string),
            subcategory: None,
        }
    }

    pub fn with_subcategory(mut self, subcategory: &str) -> Self {
        self.subcategory = Some(subcategory.to_string());
        self
    }

    pub fn other() -> Self {
        Category::new(Self::OTHER, None)
    }

    pub fn is_other(&self) -> bool {
        self.level1 == Self::OTHER && self.level2.is_none()
    }
}

impl Default for Category {
    fn default() -> Self {
        Category::other()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level1)?;
        if let Some(l2) = &self.level2 {
            write!(f, " / {l2}")?;
        }
        if let Some(sub) = &self.subcategory {
            write!(f, " / {sub}")?;
        }
        Ok(())
    }
}

/// Link from a transaction to exactly one related record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityLink {
    Income(i64),
    Expense(i64),
    Property(i64),
    Loan(i64),
    InvestmentAccount(i64),
}

impl EntityLink {
    /// Income links only make sense on money coming in, expense links on money going out.
    pub fn is_valid_for(self, direction: Direction) -> bool {
        match self {
            EntityLink::Income(_) => direction == Direction::In,
            EntityLink::Expense(_) => direction == Direction::Out,
            _ => true,
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            EntityLink::Income(_) => "INCOME",
            EntityLink::Expense(_) => "EXPENSE",
            EntityLink::Property(_) => "PROPERTY",
            EntityLink::Loan(_) => "LOAN",
            EntityLink::InvestmentAccount(_) => "INVESTMENT_ACCOUNT",
        }
    }

    pub fn id(self) -> i64 {
        match self {
            EntityLink::Income(id)
            | EntityLink::Expense(id)
            | EntityLink::Property(id)
            | EntityLink::Loan(id)
            | EntityLink::InvestmentAccount(id) => id,
        }
    }

    pub fn from_parts(kind: &str, id: i64) -> Option<Self> {
        match kind {
            "INCOME" => Some(EntityLink::Income(id)),
            "EXPENSE" => Some(EntityLink::Expense(id)),
            "PROPERTY" => Some(EntityLink::Property(id)),
            "LOAN" => Some(EntityLink::Loan(id)),
            "INVESTMENT_ACCOUNT" => Some(EntityLink::InvestmentAccount(id)),
            _ => None,
        }
    }
}

/// How a transaction's link came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkOrigin {
    User,
    Rule,
    Auto,
}

impl LinkOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkOrigin::User => "user",
            LinkOrigin::Rule => "rule",
            LinkOrigin::Auto => "auto",
        }
    }
}

impl FromStr for LinkOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(LinkOrigin::User),
            "rule" => Ok(LinkOrigin::Rule),
            "auto" => Ok(LinkOrigin::Auto),
            other => Err(format!("Unknown link origin: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyFlag {
    Duplicate,
    PossibleDuplicate,
}

impl AnomalyFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyFlag::Duplicate => "DUPLICATE",
            AnomalyFlag::PossibleDuplicate => "POSSIBLE_DUPLICATE",
        }
    }
}

impl FromStr for AnomalyFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DUPLICATE" => Ok(AnomalyFlag::Duplicate),
            "POSSIBLE_DUPLICATE" => Ok(AnomalyFlag::PossibleDuplicate),
            other => Err(format!("Unknown anomaly flag: '{other}'")),
        }
    }
}

/// A parsed row after sign resolution and merchant cleaning, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTransaction {
    pub row_number: usize,
    pub date: NaiveDate,
    /// Always non-negative.
    pub amount_cents: i64,
    pub direction: Direction,
    pub description: String,
    pub merchant: String,
    pub fingerprint: String,
    pub mcc: Option<String>,
    pub bpay_biller_code: Option<String>,
    pub reference: Option<String>,
    pub balance_cents: Option<i64>,
}

impl NormalizedTransaction {
    pub fn signed_cents(&self) -> i64 {
        self.direction.apply_sign(self.amount_cents)
    }
}

/// The persisted, canonical transaction record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedTransaction {
    pub id: Option<i64>,
    pub user_id: UserId,
    pub account_id: Option<AccountId>,
    pub date: NaiveDate,
    pub amount_cents: i64,
    pub direction: Direction,
    pub description: String,
    pub merchant: String,
    pub fingerprint: String,
    pub mcc: Option<String>,
    pub bpay_biller_code: Option<String>,
    pub reference: Option<String>,
    pub category: Category,
    pub confidence: f32,
    pub rule_id: Option<i64>,
    pub is_recurring: bool,
    pub recurrence_pattern: Option<Frequency>,
    pub anomaly_flags: Vec<AnomalyFlag>,
    pub source: TransactionSource,
    pub import_file_id: Option<i64>,
    pub link: Option<EntityLink>,
    pub link_origin: Option<LinkOrigin>,
}

impl UnifiedTransaction {
    pub fn from_normalized(
        tx: NormalizedTransaction,
        user_id: UserId,
        account_id: Option<AccountId>,
        import_file_id: i64,
    ) -> Self {
        UnifiedTransaction {
            id: None,
            user_id,
            account_id,
            date: tx.date,
            amount_cents: tx.amount_cents,
            direction: tx.direction,
            description: tx.description,
            merchant: tx.merchant,
            fingerprint: tx.fingerprint,
            mcc: tx.mcc,
            bpay_biller_code: tx.bpay_biller_code,
            reference: tx.reference,
            category: Category::other(),
            confidence: 0.0,
            rule_id: None,
            is_recurring: false,
            recurrence_pattern: None,
            anomaly_flags: Vec::new(),
            source: TransactionSource::Csv,
            import_file_id: Some(import_file_id),
            link: None,
            link_origin: None,
        }
    }

    pub fn set_link(&mut self, link: EntityLink, origin: LinkOrigin) {
        self.link = Some(link);
        self.link_origin = Some(origin);
    }

    pub fn is_categorized(&self) -> bool {
        self.confidence > 0.0 && !self.category.is_other()
    }

    /// The read-back projection of this row under `id`.
    pub fn to_stored(&self, id: i64) -> StoredTransaction {
        StoredTransaction {
            id,
            account_id: self.account_id,
            date: self.date,
            amount_cents: self.amount_cents,
            direction: self.direction,
            description: self.description.clone(),
            merchant: self.merchant.clone(),
            fingerprint: self.fingerprint.clone(),
            is_recurring: self.is_recurring,
        }
    }
}

/// Projection of an already-persisted transaction, as read back for
/// duplicate detection, recurring detection and auto-linking.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTransaction {
    pub id: i64,
    pub account_id: Option<AccountId>,
    pub date: NaiveDate,
    pub amount_cents: i64,
    pub direction: Direction,
    pub description: String,
    pub merchant: String,
    pub fingerprint: String,
    pub is_recurring: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_from_signed_amount() {
        assert_eq!(Direction::from_signed(-4500), (Direction::Out, 4500));
        assert_eq!(Direction::from_signed(250000), (Direction::In, 250000));
        assert_eq!(Direction::from_signed(i64::MIN), (Direction::Out, i64::MAX));
        assert_eq!(Direction::Out.apply_sign(i64::MAX), -i64::MAX);
        assert_eq!(Direction::from_signed(0), (Direction::In, 0));
    }

    #[test]
    fn direction_parses_bank_vocabulary() {
        assert_eq!("dr".parse::<Direction>().unwrap(), Direction::Out);
        assert_eq!(" Credit ".parse::<Direction>().unwrap(), Direction::In);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn link_validity_follows_direction() {
        assert!(EntityLink::Income(1).is_valid_for(Direction::In));
        assert!(!EntityLink::Income(1).is_valid_for(Direction::Out));
        assert!(!EntityLink::Expense(1).is_valid_for(Direction::In));
        assert!(EntityLink::Loan(3).is_valid_for(Direction::Out));
    }

    #[test]
    fn link_parts_round_trip() {
        let link = EntityLink::InvestmentAccount(9);
        assert_eq!(EntityLink::from_parts(link.kind(), link.id()), Some(link));
        assert_eq!(EntityLink::from_parts("BOAT", 1), None);
    }

    #[test]
    fn link_serializes_as_tagged_object() {
        let json = serde_json::to_string(&EntityLink::Expense(12)).unwrap();
        assert_eq!(json, r#"{"type":"EXPENSE","id":12}"#);
    }

    #[test]
    fn category_display_and_other() {
        let c = Category::new("FOOD", Some("GROCERIES")).with_subcategory("SUPERMARKET");
        assert_eq!(c.to_string(), "FOOD / GROCERIES / SUPERMARKET");
        assert!(Category::other().is_other());
        assert!(!c.is_other());
    }
}
