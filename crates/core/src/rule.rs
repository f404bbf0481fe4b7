use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::account::UserId;
use super::transaction::{Category, EntityLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    /// Matches the standardized merchant name.
    Merchant,
    /// Matches anywhere in the raw description.
    Keyword,
    /// Matches the merchant category code.
    Mcc,
    /// Matches the BPAY biller code.
    Bpay,
    /// Matches when the amount falls inside `min-max`.
    AmountRange,
}

impl RuleType {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleType::Merchant => "MERCHANT",
            RuleType::Keyword => "KEYWORD",
            RuleType::Mcc => "MCC",
            RuleType::Bpay => "BPAY",
            RuleType::AmountRange => "AMOUNT_RANGE",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "MERCHANT" => Ok(RuleType::Merchant),
            "KEYWORD" => Ok(RuleType::Keyword),
            "MCC" => Ok(RuleType::Mcc),
            "BPAY" => Ok(RuleType::Bpay),
            "AMOUNT_RANGE" => Ok(RuleType::AmountRange),
            other => Err(format!("Unknown rule type: '{other}'")),
        }
    }
}

/// A user-owned or global (`user_id == None`) categorisation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub id: i64,
    pub user_id: Option<UserId>,
    pub rule_type: RuleType,
    pub pattern: String,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(default)]
    pub case_sensitive: bool,
    pub category: Category,
    #[serde(default)]
    pub link: Option<EntityLink>,
    pub priority: i32,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl CategoryRule {
    pub fn is_global(&self) -> bool {
        self.user_id.is_none()
    }
}
