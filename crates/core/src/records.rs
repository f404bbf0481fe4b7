use serde::{Deserialize, Serialize};

use super::account::UserId;
use super::recurring::Frequency;

/// A user-declared income source, e.g. salary or rent received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomeRecord {
    pub id: i64,
    pub user_id: UserId,
    pub name: String,
    pub amount_cents: i64,
    pub frequency: Frequency,
}

/// A user-declared expense, e.g. a subscription or utility bill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseRecord {
    pub id: i64,
    pub user_id: UserId,
    pub name: String,
    pub amount_cents: i64,
    pub frequency: Frequency,
}
