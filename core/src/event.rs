//! Domain event vocabulary.
//!
//! Use-cases publish one of these after every successful state change. Names
//! follow the `<Entity><Action>` convention (`OperationCreated`, `GoalCompleted`)
//! and are the keys the [`EventBus`](crate::event_bus::EventBus) routes on.
//!
//! Two views of the same vocabulary exist:
//!
//! - [`EventKind`]: the bare name, used for routing tables and parsing
//! - [`DomainEvent`]: the name plus its typed payload, used when publishing
//!
//! # Example
//!
//! ```
//! use pocketsync_core::domain::Goal;
//! use pocketsync_core::event::{DomainEvent, EntityKind, EventKind};
//!
//! let event = DomainEvent::GoalCompleted(Goal::new("g1", "Bike", 50_000));
//! assert_eq!(event.name(), "GoalCompleted");
//! assert_eq!(event.kind().entity(), EntityKind::Goal);
//! assert_eq!(EventKind::from_name("GoalCompleted"), Some(EventKind::GoalCompleted));
//! ```

use crate::domain::{Account, Category, Goal, Operation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Returned when parsing a name outside the event vocabulary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown event name: {0}")]
pub struct UnknownEventName(pub String);

/// Entity family an event belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// Financial operations (transactions)
    Operation,
    /// Accounts
    Account,
    /// Categories
    Category,
    /// Savings goals
    Goal,
}

/// Every event name the domain layer publishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum EventKind {
    OperationCreated,
    OperationUpdated,
    OperationDeleted,
    AccountCreated,
    AccountUpdated,
    AccountDeleted,
    CategoryCreated,
    CategoryUpdated,
    CategoryDeleted,
    GoalCreated,
    GoalUpdated,
    GoalDeleted,
    GoalCompleted,
}

impl EventKind {
    /// The full vocabulary, grouped by entity.
    pub const ALL: [Self; 13] = [
        Self::OperationCreated,
        Self::OperationUpdated,
        Self::OperationDeleted,
        Self::AccountCreated,
        Self::AccountUpdated,
        Self::AccountDeleted,
        Self::CategoryCreated,
        Self::CategoryUpdated,
        Self::CategoryDeleted,
        Self::GoalCreated,
        Self::GoalUpdated,
        Self::GoalDeleted,
        Self::GoalCompleted,
    ];

    /// The event name used as the bus routing key.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::OperationCreated => "OperationCreated",
            Self::OperationUpdated => "OperationUpdated",
            Self::OperationDeleted => "OperationDeleted",
            Self::AccountCreated => "AccountCreated",
            Self::AccountUpdated => "AccountUpdated",
            Self::AccountDeleted => "AccountDeleted",
            Self::CategoryCreated => "CategoryCreated",
            Self::CategoryUpdated => "CategoryUpdated",
            Self::CategoryDeleted => "CategoryDeleted",
            Self::GoalCreated => "GoalCreated",
            Self::GoalUpdated => "GoalUpdated",
            Self::GoalDeleted => "GoalDeleted",
            Self::GoalCompleted => "GoalCompleted",
        }
    }

    /// The entity family this event describes.
    #[must_use]
    pub const fn entity(self) -> EntityKind {
        match self {
            Self::OperationCreated | Self::OperationUpdated | Self::OperationDeleted => {
                EntityKind::Operation
            },
            Self::AccountCreated | Self::AccountUpdated | Self::AccountDeleted => {
                EntityKind::Account
            },
            Self::CategoryCreated | Self::CategoryUpdated | Self::CategoryDeleted => {
                EntityKind::Category
            },
            Self::GoalCreated | Self::GoalUpdated | Self::GoalDeleted | Self::GoalCompleted => {
                EntityKind::Goal
            },
        }
    }

    /// Look up a kind by its exact name.
    ///
    /// Matching is exact: `"OperationCreatedLater"` or `"operationcreated"`
    /// are not part of the vocabulary.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EventKind {
    type Err = UnknownEventName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| UnknownEventName(s.to_string()))
    }
}

/// A domain event with its typed payload.
///
/// Created/updated events carry the entity as written; deleted events carry
/// only the id since the entity no longer exists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[allow(missing_docs)]
pub enum DomainEvent {
    OperationCreated(Operation),
    OperationUpdated(Operation),
    OperationDeleted { id: String },
    AccountCreated(Account),
    AccountUpdated(Account),
    AccountDeleted { id: String },
    CategoryCreated(Category),
    CategoryUpdated(Category),
    CategoryDeleted { id: String },
    GoalCreated(Goal),
    GoalUpdated(Goal),
    GoalDeleted { id: String },
    GoalCompleted(Goal),
}

impl DomainEvent {
    /// The kind (name without payload) of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::OperationCreated(_) => EventKind::OperationCreated,
            Self::OperationUpdated(_) => EventKind::OperationUpdated,
            Self::OperationDeleted { .. } => EventKind::OperationDeleted,
            Self::AccountCreated(_) => EventKind::AccountCreated,
            Self::AccountUpdated(_) => EventKind::AccountUpdated,
            Self::AccountDeleted { .. } => EventKind::AccountDeleted,
            Self::CategoryCreated(_) => EventKind::CategoryCreated,
            Self::CategoryUpdated(_) => EventKind::CategoryUpdated,
            Self::CategoryDeleted { .. } => EventKind::CategoryDeleted,
            Self::GoalCreated(_) => EventKind::GoalCreated,
            Self::GoalUpdated(_) => EventKind::GoalUpdated,
            Self::GoalDeleted { .. } => EventKind::GoalDeleted,
            Self::GoalCompleted(_) => EventKind::GoalCompleted,
        }
    }

    /// The bus routing key for this event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Id of the entity the event is about.
    #[must_use]
    pub fn entity_id(&self) -> &str {
        match self {
            Self::OperationCreated(op) | Self::OperationUpdated(op) => &op.id,
            Self::AccountCreated(account) | Self::AccountUpdated(account) => &account.id,
            Self::CategoryCreated(category) | Self::CategoryUpdated(category) => &category.id,
            Self::GoalCreated(goal) | Self::GoalUpdated(goal) | Self::GoalCompleted(goal) => {
                &goal.id
            },
            Self::OperationDeleted { id }
            | Self::AccountDeleted { id }
            | Self::CategoryDeleted { id }
            | Self::GoalDeleted { id } => id,
        }
    }
}
