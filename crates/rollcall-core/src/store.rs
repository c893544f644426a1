//! Seams between the core and the persistent store.

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::types::{EventId, KnownFace, PersonId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The writer gate (or SQLite's own lock) could not be acquired in time.
    #[error("store busy")]
    Busy,
    /// The backing database cannot be reached at all.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("person {0} not found")]
    PersonNotFound(PersonId),
    #[error("corrupt template {template_id}: {reason}")]
    CorruptTemplate { template_id: i64, reason: String },
    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Whether a bounded retry is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Busy)
    }
}

/// Source of every stored (template, person) pair, in store order.
pub trait TemplateSource: Send + Sync {
    fn load_known_faces(&self) -> Result<Vec<KnownFace>, StoreError>;
}

/// Append-only sink for attendance events.
pub trait AttendanceLedger: Send + Sync {
    fn record_attendance(&self, person: PersonId, at: NaiveDateTime) -> Result<EventId, StoreError>;
}
