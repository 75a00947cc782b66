//! Domain entities as seen by the synchronization layer.
//!
//! Validation, money arithmetic and persistence live in the use-case and
//! repository layers. The types here only carry what an event subscriber or a
//! UI adapter reads: identity, a display name, and the few fields the derived
//! financial summary depends on. Amounts are kept in minor units (cents) and
//! never computed with here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a financial operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Money coming into an account
    Income,
    /// Money leaving an account
    Expense,
    /// Money moved between two of the user's accounts
    Transfer,
}

/// A financial operation (transaction).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation id
    pub id: String,
    /// Account the operation is booked against
    pub account_id: String,
    /// Category, if the operation has been categorized
    pub category_id: Option<String>,
    /// Income, expense or transfer
    pub kind: OperationKind,
    /// Amount in minor units
    pub amount_minor: i64,
    /// Free-form description
    pub description: String,
    /// When the operation happened
    pub occurred_at: DateTime<Utc>,
}

/// A user's account (wallet, card, savings...).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account id
    pub id: String,
    /// Display name
    pub name: String,
    /// ISO 4217 currency code
    pub currency: String,
    /// Current balance in minor units
    pub balance_minor: i64,
}

impl Account {
    /// Create an account with a zero balance in the default currency.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            currency: "USD".to_string(),
            balance_minor: 0,
        }
    }
}

/// An operation category.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// Category id
    pub id: String,
    /// Display name
    pub name: String,
    /// Whether the category classifies income or expenses
    pub kind: OperationKind,
}

impl Category {
    /// Create an expense category.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: OperationKind::Expense,
        }
    }
}

/// A savings goal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    /// Goal id
    pub id: String,
    /// Display name
    pub name: String,
    /// Target amount in minor units
    pub target_minor: i64,
    /// Amount saved so far in minor units
    pub saved_minor: i64,
    /// Optional deadline
    pub deadline: Option<DateTime<Utc>>,
}

impl Goal {
    /// Create a goal with nothing saved yet.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, target_minor: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            target_minor,
            saved_minor: 0,
            deadline: None,
        }
    }

    /// Whether the saved amount has reached the target.
    #[must_use]
    pub const fn is_reached(&self) -> bool {
        self.saved_minor >= self.target_minor
    }
}
