//! rollcall-store: people, face templates and attendance events in SQLite.

pub mod model;
pub mod schema;
pub mod sqlite;

pub use model::{AttendanceRecord, AttendanceSummary, DateFilter, NewPerson, Person, PersonPatch};
pub use sqlite::{SqliteStore, StoreConfig};
