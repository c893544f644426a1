//! Typed rows.

use chrono::{NaiveDate, NaiveDateTime};
use rollcall_core::{EventId, PersonId};
use serde::{Deserialize, Serialize};

/// A registered person. Optional attributes are opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: PersonId,
    pub name: String,
    pub email: Option<String>,
    pub proxy: Option<String>,
    pub salary: Option<f64>,
    pub department: Option<String>,
    pub created_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewPerson {
    pub name: String,
    pub email: Option<String>,
    pub proxy: Option<String>,
    pub salary: Option<f64>,
    pub department: Option<String>,
}

impl NewPerson {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Fields to change; `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub proxy: Option<String>,
    pub salary: Option<f64>,
    pub department: Option<String>,
}

impl PersonPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.email.is_none()
            && self.proxy.is_none()
            && self.salary.is_none()
            && self.department.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub event_id: EventId,
    pub person_id: PersonId,
    pub name: String,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceSummary {
    pub person_id: PersonId,
    pub name: String,
    pub count: u32,
}

/// Inclusive date filter for attendance queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateFilter {
    On(NaiveDate),
    Between(NaiveDate, NaiveDate),
}
