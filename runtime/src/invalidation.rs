//! Event-driven cache invalidation rules.
//!
//! Maps each domain event to the cache domains it makes stale. The mapping is
//! declared as data so that adding an event means adding a row, not teaching a
//! string matcher a new convention. Names missing from the table invalidate
//! nothing.
//!
//! | Events | Invalidated domains |
//! |---|---|
//! | `Operation*` | `operations`, `financial-summary` |
//! | `Category*` | `categories`, `financial-summary` |
//! | `Account*` | `accounts`, `financial-summary` |
//! | `Goal*` | `goals` |
//!
//! Goals are tracked separately from balances, so goal events leave the
//! financial summary intact.

use pocketsync_core::event::{EntityKind, EventKind};
use std::collections::HashMap;

/// Well-known cache domain names.
pub mod domains {
    /// Lists and pages of operations
    pub const OPERATIONS: &str = "operations";
    /// Accounts and balances
    pub const ACCOUNTS: &str = "accounts";
    /// Categories
    pub const CATEGORIES: &str = "categories";
    /// Savings goals
    pub const GOALS: &str = "goals";
    /// Aggregated totals derived from operations, accounts and categories
    pub const FINANCIAL_SUMMARY: &str = "financial-summary";
}

const fn entity_domains(entity: EntityKind) -> &'static [&'static str] {
    match entity {
        EntityKind::Operation => &[domains::OPERATIONS, domains::FINANCIAL_SUMMARY],
        EntityKind::Category => &[domains::CATEGORIES, domains::FINANCIAL_SUMMARY],
        EntityKind::Account => &[domains::ACCOUNTS, domains::FINANCIAL_SUMMARY],
        EntityKind::Goal => &[domains::GOALS],
    }
}

/// Table from event name to the cache domains it invalidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationRules {
    rules: HashMap<String, Vec<String>>,
}

impl InvalidationRules {
    /// An empty table
    #[must_use]
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// The rules for the full domain event vocabulary.
    #[must_use]
    pub fn default_rules() -> Self {
        EventKind::ALL
            .into_iter()
            .fold(Self::empty(), |rules, kind| {
                rules.with_rule(kind.name(), entity_domains(kind.entity()).iter().copied())
            })
    }

    /// Add (or replace) the domains invalidated by `event_name`.
    #[must_use]
    pub fn with_rule<I, S>(mut self, event_name: &str, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules.insert(
            event_name.to_string(),
            domains.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Domains invalidated by `event_name`; empty for unknown names.
    #[must_use]
    pub fn domains_for(&self, event_name: &str) -> &[String] {
        self.rules.get(event_name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every event name that has a rule, sorted
    #[must_use]
    pub fn event_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.rules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the table has no rules
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for InvalidationRules {
    fn default() -> Self {
        Self::default_rules()
    }
}
